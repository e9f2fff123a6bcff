use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::feed::{ChangeEvent, ChangeKind, DocumentFeed, Subscription, SUBSCRIPTION_BUFFER};

/// Channel the `documents` trigger notifies on.
pub const CHANGE_CHANNEL: &str = "document_changes";

/// Change feed backed by Postgres `LISTEN/NOTIFY`.
#[derive(Clone)]
pub struct PgDocumentFeed {
    pool: PgPool,
}

impl PgDocumentFeed {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DocumentFeed for PgDocumentFeed {
    async fn subscribe(&self, prefix: &str) -> Result<Subscription> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .context("failed to open change listener")?;
        listener
            .listen(CHANGE_CHANNEL)
            .await
            .with_context(|| format!("failed to LISTEN on {CHANGE_CHANNEL}"))?;

        // LISTEN precedes the snapshot; a concurrent write may be seen twice
        // but never missed.
        let rows: Vec<(String, String, Value)> = sqlx::query_as(
            "SELECT collection, id, data FROM documents \
             WHERE $1 = '' OR collection = $1 OR left(collection, length($1) + 1) = $1 || '/' \
             ORDER BY collection, id",
        )
        .bind(prefix.trim_end_matches('/'))
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to load documents under {prefix:?}"))?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let prefix = prefix.to_owned();
        let task = tokio::spawn(async move {
            for (collection, id, data) in rows {
                let event = ChangeEvent { kind: ChangeKind::Added, collection, id, data };
                if tx.send(event).await.is_err() {
                    return;
                }
            }

            loop {
                let notification = match listener.recv().await {
                    Ok(n) => n,
                    Err(e) => {
                        warn!(error = %e, "change listener failed, retrying");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };
                match decode_notification(notification.payload()) {
                    Ok(event) if event.matches(&prefix) => {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => debug!(error = %e, "ignoring malformed change notification"),
                }
            }
        });

        Ok(Subscription::new(rx, task))
    }
}

fn decode_notification(payload: &str) -> serde_json::Result<ChangeEvent> {
    serde_json::from_str(payload)
}
