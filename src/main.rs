use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{net::TcpListener, signal, sync::mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kompos_monitor::{
    api::{self, AppState},
    config::Config,
    connection::ConnectionManager,
    db::{self, PgDocumentFeed, PgDocuments},
    feed::{ChannelFeed, DocumentFeed, DocumentStore},
    history::HistoryLog,
    house_store::HouseStore,
    mqtt::MqttConnector,
    sensors::{service::ALL_COLLECTIONS, IngestService},
    settings::{BrokerSettings, Thresholds},
};

/// Bus readings buffered between the connection manager and ingestion.
const READINGS_BUFFER: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional; variables may come from the environment
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let mut config = Config::from_env()?;

    // Postgres is optional: without it documents live in memory for the
    // lifetime of the process.
    let (store, feed): (Arc<dyn DocumentStore>, Arc<dyn DocumentFeed>) =
        match &config.database_url {
            Some(url) => {
                let pool = db::create_pool(url).await?;
                db::run_migrations(&pool).await?;
                info!("Database ready");
                let store: Arc<dyn DocumentStore> = Arc::new(PgDocuments::new(pool.clone()));
                let feed: Arc<dyn DocumentFeed> = Arc::new(PgDocumentFeed::new(pool));
                (store, feed)
            }
            None => {
                warn!("DATABASE_URL not set, documents are kept in memory");
                let documents = ChannelFeed::new();
                let store: Arc<dyn DocumentStore> = Arc::new(documents.clone());
                let feed: Arc<dyn DocumentFeed> = Arc::new(documents);
                (store, feed)
            }
        };

    let houses = HouseStore::load(store.clone())
        .await
        .context("failed to load houses")?;
    let history = HistoryLog::load(store.clone(), config.history_limit)
        .await
        .context("failed to load history")?;
    let thresholds = Thresholds::new(store.clone(), config.threshold_scope);
    let broker = BrokerSettings::new(store);
    if let Some(endpoint) = broker.load().await {
        info!(broker = %endpoint, "Using saved broker endpoint");
        config.mqtt.endpoint = endpoint;
    }
    let ingest = IngestService::new(houses.clone(), history.clone(), thresholds.clone());

    let subscription = feed
        .subscribe(ALL_COLLECTIONS)
        .await
        .context("failed to subscribe to document changes")?;
    tokio::spawn(ingest.clone().run_feed(subscription));
    info!("Document feed subscribed");

    // Message bus
    let (readings_tx, readings_rx) = mpsc::channel(READINGS_BUFFER);
    let (manager, connection) = ConnectionManager::new(
        MqttConnector::new(&config.mqtt),
        config.mqtt.topic.clone(),
        config.mqtt.max_retries,
        readings_tx,
    );
    let manager_task = tokio::spawn(manager.run());
    tokio::spawn(ingest.run_bus(readings_rx));

    info!(
        broker = %config.mqtt.endpoint,
        topic = %config.mqtt.topic,
        autoconnect = config.mqtt.autoconnect,
        "Message bus configured"
    );
    if config.mqtt.autoconnect {
        connection.connect().await?;
    }

    let state = AppState {
        houses,
        history,
        thresholds,
        broker,
        connection: connection.clone(),
    };

    let addr = format!("{}:{}", config.server_host, config.server_port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "HTTP server listening");

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Voluntary disconnect: no reconnect is scheduled
    if let Err(e) = connection.shutdown().await {
        warn!(error = %e, "connection manager already stopped");
    }
    if let Err(e) = manager_task.await {
        error!(error = %e, "connection manager task failed");
    }

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
