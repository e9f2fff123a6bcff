use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use tracing::info;
use utoipa::OpenApi;

use super::{
    dto::{BrokerRequest, ConnectionDto, DashboardDto, HistoryParams, HouseNameRequest, NextRetryDto},
    errors::AppError,
    AppState,
};
use crate::{
    classifier::{self, Classification},
    connection::{BrokerEndpoint, ConnectionStatus},
    db::models::{
        BinKind, CompostLevels, HistoryEntry, House, SensorReading, Status, TrashLevels,
    },
    history::{HistoryFilter, RECENT_LIMIT},
    house_store::HouseError,
    thresholds::{ThresholdConfig, Tier},
};

// ---------------------------------------------------------------------------
// Houses
// ---------------------------------------------------------------------------

/// List every house with its cached levels and statuses.
#[utoipa::path(
    get,
    path = "/houses",
    responses(
        (status = 200, description = "All houses ordered by id", body = Vec<House>),
    ),
    tag = "houses"
)]
pub async fn list_houses(State(state): State<AppState>) -> Json<Vec<House>> {
    Json(state.houses.list().await)
}

#[utoipa::path(
    post,
    path = "/houses",
    request_body = HouseNameRequest,
    responses(
        (status = 201, description = "House created", body = House),
        (status = 409, description = "Name already in use"),
        (status = 422, description = "Name empty or too long"),
    ),
    tag = "houses"
)]
pub async fn create_house(
    State(state): State<AppState>,
    Json(req): Json<HouseNameRequest>,
) -> Result<(StatusCode, Json<House>), AppError> {
    let house = state.houses.add(&req.name).await?;
    info!(house_id = %house.id, name = %house.name, "house added");
    Ok((StatusCode::CREATED, Json(house)))
}

#[utoipa::path(
    put,
    path = "/houses/{id}",
    params(("id" = String, Path, description = "House id")),
    request_body = HouseNameRequest,
    responses(
        (status = 200, description = "House renamed", body = House),
        (status = 404, description = "Unknown house"),
        (status = 409, description = "Name already in use"),
        (status = 422, description = "Name empty or too long"),
    ),
    tag = "houses"
)]
pub async fn rename_house(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<HouseNameRequest>,
) -> Result<Json<House>, AppError> {
    Ok(Json(state.houses.rename(&id, &req.name).await?))
}

#[utoipa::path(
    delete,
    path = "/houses/{id}",
    params(("id" = String, Path, description = "House id")),
    responses(
        (status = 204, description = "House removed"),
        (status = 404, description = "Unknown house"),
    ),
    tag = "houses"
)]
pub async fn delete_house(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let house = state.houses.remove(&id).await?;
    state.thresholds.forget(&house.id).await?;
    info!(house_id = %house.id, "house removed");
    Ok(StatusCode::NO_CONTENT)
}

/// Cached levels classified against the house's current thresholds, plus the
/// newest history entries.
#[utoipa::path(
    get,
    path = "/houses/{id}/dashboard",
    params(("id" = String, Path, description = "House id")),
    responses(
        (status = 200, description = "Dashboard data", body = DashboardDto),
        (status = 404, description = "Unknown house"),
    ),
    tag = "houses"
)]
pub async fn get_dashboard(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DashboardDto>, AppError> {
    let house = find_house(&state, &id).await?;
    let thresholds = state.thresholds.resolve(&house.id).await;
    let latest = SensorReading {
        house_id: house.id.clone(),
        temperature: house.compost.temperature,
        compost_fill: house.compost.volume,
        trash_fill: house.trash.volume,
        observed_at: house.updated_at.unwrap_or_default(),
    };
    let statuses = classifier::classify(&latest, &thresholds);
    let recent = state.history.recent(&house.id, RECENT_LIMIT).await;

    Ok(Json(DashboardDto { house, thresholds, statuses, recent }))
}

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/houses/{id}/thresholds",
    params(("id" = String, Path, description = "House id")),
    responses(
        (status = 200, description = "Thresholds in effect", body = ThresholdConfig),
        (status = 404, description = "Unknown house"),
    ),
    tag = "thresholds"
)]
pub async fn get_thresholds(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ThresholdConfig>, AppError> {
    let house = find_house(&state, &id).await?;
    Ok(Json(state.thresholds.resolve(&house.id).await))
}

/// Replace the thresholds. Every dimension must satisfy
/// `0 <= normalMax < checkMax < fullMax <= 100`.
#[utoipa::path(
    put,
    path = "/houses/{id}/thresholds",
    params(("id" = String, Path, description = "House id")),
    request_body = ThresholdConfig,
    responses(
        (status = 200, description = "Thresholds saved", body = ThresholdConfig),
        (status = 404, description = "Unknown house"),
        (status = 422, description = "Bounds out of range or out of order"),
    ),
    tag = "thresholds"
)]
pub async fn update_thresholds(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(config): Json<ThresholdConfig>,
) -> Result<Json<ThresholdConfig>, AppError> {
    let house = find_house(&state, &id).await?;
    let saved = state.thresholds.update(&house.id, config).await?;
    info!(house_id = %house.id, "thresholds updated");
    Ok(Json(saved))
}

#[utoipa::path(
    post,
    path = "/houses/{id}/thresholds/reset",
    params(("id" = String, Path, description = "House id")),
    responses(
        (status = 200, description = "Defaults restored", body = ThresholdConfig),
        (status = 404, description = "Unknown house"),
    ),
    tag = "thresholds"
)]
pub async fn reset_thresholds(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ThresholdConfig>, AppError> {
    let house = find_house(&state, &id).await?;
    Ok(Json(state.thresholds.reset(&house.id).await?))
}

async fn find_house(state: &AppState, id: &str) -> Result<House, AppError> {
    state
        .houses
        .get(id)
        .await
        .ok_or_else(|| HouseError::NotFound(id.to_owned()).into())
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// History entries, newest first.
#[utoipa::path(
    get,
    path = "/history",
    params(HistoryParams),
    responses(
        (status = 200, description = "Matching entries", body = Vec<HistoryEntry>),
        (status = 400, description = "`from` is after `to`"),
    ),
    tag = "history"
)]
pub async fn get_history(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<HistoryEntry>>, AppError> {
    if let (Some(from), Some(to)) = (params.from, params.to) {
        if from > to {
            return Err(AppError::BadRequest(format!("from ({from}) is after to ({to})")));
        }
    }
    let filter = HistoryFilter::from(params);
    Ok(Json(state.history.filter(&filter).await))
}

#[utoipa::path(
    delete,
    path = "/history",
    responses(
        (status = 204, description = "History cleared"),
        (status = 500, description = "History store failed"),
    ),
    tag = "history"
)]
pub async fn clear_history(State(state): State<AppState>) -> Result<StatusCode, AppError> {
    state.history.clear().await?;
    info!("history cleared");
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/connection",
    responses((status = 200, description = "Current bus connection state", body = ConnectionDto)),
    tag = "connection"
)]
pub async fn get_connection(State(state): State<AppState>) -> Json<ConnectionDto> {
    Json(state.connection.state().into())
}

/// Request a connection. Starts a fresh retry budget; a no-op while
/// connected. The returned state may not reflect the request yet.
#[utoipa::path(
    post,
    path = "/connection/connect",
    responses(
        (status = 202, description = "Connect requested", body = ConnectionDto),
        (status = 500, description = "Connection manager stopped"),
    ),
    tag = "connection"
)]
pub async fn connect(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<ConnectionDto>), AppError> {
    state.connection.connect().await?;
    Ok((StatusCode::ACCEPTED, Json(state.connection.state().into())))
}

/// Voluntary disconnect. Cancels any pending reconnect.
#[utoipa::path(
    post,
    path = "/connection/disconnect",
    responses(
        (status = 202, description = "Disconnect requested", body = ConnectionDto),
        (status = 500, description = "Connection manager stopped"),
    ),
    tag = "connection"
)]
pub async fn disconnect(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<ConnectionDto>), AppError> {
    state.connection.disconnect().await?;
    Ok((StatusCode::ACCEPTED, Json(state.connection.state().into())))
}

/// Change the broker. Takes effect on the next connection attempt and is
/// kept across restarts.
#[utoipa::path(
    put,
    path = "/connection/broker",
    request_body = BrokerRequest,
    responses(
        (status = 200, description = "Broker accepted", body = BrokerEndpoint),
        (status = 422, description = "Invalid host or port"),
        (status = 500, description = "Endpoint could not be saved"),
    ),
    tag = "connection"
)]
pub async fn set_broker(
    State(state): State<AppState>,
    Json(req): Json<BrokerRequest>,
) -> Result<Json<BrokerEndpoint>, AppError> {
    let endpoint = BrokerEndpoint::new(&req.host, req.port)?;
    state.broker.save(&endpoint).await?;
    state.connection.set_endpoint(endpoint.clone()).await?;
    info!(broker = %endpoint, "broker endpoint changed");
    Ok(Json(endpoint))
}

// ---------------------------------------------------------------------------
// Health check
// ---------------------------------------------------------------------------

/// Returns `200 OK` with `{"status":"ok"}` when the server is running.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy"),
    ),
    tag = "system"
)]
pub async fn health() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({ "status": "ok" }))
}

// ---------------------------------------------------------------------------
// OpenAPI spec
// ---------------------------------------------------------------------------

#[derive(OpenApi)]
#[openapi(
    paths(
        list_houses, create_house, rename_house, delete_house, get_dashboard,
        get_thresholds, update_thresholds, reset_thresholds,
        get_history, clear_history,
        get_connection, connect, disconnect, set_broker,
        health,
    ),
    components(schemas(
        House, CompostLevels, TrashLevels, Status, BinKind, HistoryEntry,
        ThresholdConfig, Tier, Classification, DashboardDto, HouseNameRequest,
        ConnectionDto, ConnectionStatus, NextRetryDto, BrokerRequest, BrokerEndpoint,
    )),
    tags(
        (name = "houses", description = "Monitored houses"),
        (name = "thresholds", description = "Status threshold settings"),
        (name = "history", description = "Classified reading history"),
        (name = "connection", description = "Message bus connection"),
        (name = "system", description = "System endpoints"),
    ),
    info(
        title = "Kompos Monitor API",
        version = "0.1.0",
        description = "Compost and trash bin monitoring across houses"
    )
)]
pub struct ApiDoc;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum_test::TestServer;
    use chrono::Utc;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        api::{router, AppState},
        config::SettingsScope,
        connection::{transport::fake::FakeConnector, ConnectionManager, LinkEvent},
        feed::{ChannelFeed, DocumentStore},
        history::{HistoryLog, DEFAULT_HISTORY_LIMIT},
        house_store::{HouseStore, HOUSES_COLLECTION},
        sensors::IngestService,
        settings::{BrokerSettings, Thresholds, SETTINGS_COLLECTION},
    };

    struct Harness {
        server: TestServer,
        state: AppState,
        connector: FakeConnector,
        store: ChannelFeed,
    }

    fn harness() -> Harness {
        let connector = FakeConnector::default();
        let (readings_tx, _readings_rx) = mpsc::channel(8);
        let (manager, connection) =
            ConnectionManager::new(connector.clone(), "iot/monitoring", 5, readings_tx);
        tokio::spawn(manager.run());

        let store = ChannelFeed::new();
        let documents: Arc<dyn DocumentStore> = Arc::new(store.clone());
        let state = AppState {
            houses: HouseStore::new(documents.clone()),
            history: HistoryLog::new(documents.clone(), DEFAULT_HISTORY_LIMIT),
            thresholds: Thresholds::new(documents.clone(), SettingsScope::House),
            broker: BrokerSettings::new(documents),
            connection,
        };
        let server = TestServer::new(router(state.clone())).unwrap();
        Harness { server, state, connector, store }
    }

    async fn ingest(state: &AppState, house_id: &str, temperature: f64, compost: f64) {
        let svc = IngestService::new(
            state.houses.clone(),
            state.history.clone(),
            state.thresholds.clone(),
        );
        svc.ingest(crate::db::models::SensorReading {
            house_id: house_id.into(),
            temperature,
            compost_fill: compost,
            trash_fill: 10.0,
            observed_at: Utc::now(),
        })
        .await
        .unwrap();
    }

    // -----------------------------------------------------------------------
    // Houses
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn create_list_rename_delete_house() {
        let h = harness();

        let resp = h.server.post("/houses").json(&json!({ "name": "Rumah A" })).await;
        resp.assert_status(StatusCode::CREATED);
        let created: Value = resp.json();
        assert_eq!(created["id"], "rmh01");
        assert_eq!(created["compostStatus"], "Normal");

        let resp = h.server.get("/houses").await;
        resp.assert_status_ok();
        let list: Vec<Value> = resp.json();
        assert_eq!(list.len(), 1);

        let resp = h.server.put("/houses/rmh01").json(&json!({ "name": "Rumah Utama" })).await;
        resp.assert_status_ok();
        assert_eq!(resp.json::<Value>()["name"], "Rumah Utama");

        h.server.delete("/houses/rmh01").await.assert_status(StatusCode::NO_CONTENT);
        h.server.delete("/houses/rmh01").await.assert_status_not_found();
    }

    #[tokio::test]
    async fn house_changes_are_stored_and_removal_drops_thresholds() {
        let h = harness();
        h.server.post("/houses").json(&json!({ "name": "Rumah A" })).await;
        let mut config = ThresholdConfig::default();
        config.trash_volume = Tier::new(40.0, 60.0, 90.0);
        h.server.put("/houses/rmh01/thresholds").json(&config).await.assert_status_ok();
        assert_eq!(
            h.store.load(HOUSES_COLLECTION, "rmh01").await.unwrap(),
            Some(json!({ "name": "Rumah A" }))
        );

        h.server.delete("/houses/rmh01").await.assert_status(StatusCode::NO_CONTENT);

        assert!(h.store.load(HOUSES_COLLECTION, "rmh01").await.unwrap().is_none());
        assert!(h.store.load(SETTINGS_COLLECTION, "rmh01").await.unwrap().is_none());

        // A house restored from the same store does not reuse the id.
        let restored = HouseStore::load(Arc::new(h.store.clone())).await.unwrap();
        assert!(restored.list().await.is_empty());
        h.server.post("/houses").json(&json!({ "name": "Rumah B" })).await;
        let body: Value = h.server.get("/houses/rmh02/thresholds").await.json();
        assert_eq!(body["trashVolume"]["fullMax"], 100.0);
    }

    #[tokio::test]
    async fn house_name_errors_map_to_status_codes() {
        let h = harness();
        h.server.post("/houses").json(&json!({ "name": "Rumah A" })).await;

        let resp = h.server.post("/houses").json(&json!({ "name": "rumah a" })).await;
        resp.assert_status(StatusCode::CONFLICT);
        assert!(resp.json::<Value>()["error"].as_str().unwrap().contains("already exists"));

        h.server
            .post("/houses")
            .json(&json!({ "name": "  " }))
            .await
            .assert_status(StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn dashboard_classifies_with_current_thresholds() {
        let h = harness();
        let house = h.state.houses.add("Rumah A").await.unwrap();
        ingest(&h.state, &house.id, 39.5, 10.0).await;

        let resp = h.server.get(&format!("/houses/{}/dashboard", house.id)).await;
        resp.assert_status_ok();
        let body: Value = resp.json();
        assert_eq!(body["statuses"]["compost"], "Perlu Diperiksa");
        assert_eq!(body["house"]["compost"]["temperature"], 39.5);
        assert_eq!(body["recent"].as_array().unwrap().len(), 2);

        // Raising the temperature bounds reclassifies the cached reading.
        let mut config = ThresholdConfig::default();
        config.compost_temperature = Tier::new(40.0, 45.0, 50.0);
        h.server
            .put(&format!("/houses/{}/thresholds", house.id))
            .json(&config)
            .await
            .assert_status_ok();

        let body: Value = h.server.get(&format!("/houses/{}/dashboard", house.id)).await.json();
        assert_eq!(body["statuses"]["compost"], "Normal");
        assert_eq!(body["thresholds"]["compostTemperature"]["fullMax"], 50.0);
    }

    #[tokio::test]
    async fn dashboard_of_unknown_house_is_404() {
        let h = harness();
        h.server.get("/houses/rmh42/dashboard").await.assert_status_not_found();
    }

    // -----------------------------------------------------------------------
    // Thresholds
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn thresholds_default_update_and_reset() {
        let h = harness();
        let house = h.state.houses.add("Rumah A").await.unwrap();
        let path = format!("/houses/{}/thresholds", house.id);

        let body: Value = h.server.get(&path).await.json();
        assert_eq!(body["compostTemperature"]["checkMax"], 32.5);

        let mut config = ThresholdConfig::default();
        config.trash_volume = Tier::new(40.0, 60.0, 90.0);
        h.server.put(&path).json(&config).await.assert_status_ok();
        let body: Value = h.server.get(&path).await.json();
        assert_eq!(body["trashVolume"]["fullMax"], 90.0);

        h.server.post(&format!("{path}/reset")).await.assert_status_ok();
        let body: Value = h.server.get(&path).await.json();
        assert_eq!(body["trashVolume"]["fullMax"], 100.0);
    }

    #[tokio::test]
    async fn misordered_thresholds_are_rejected() {
        let h = harness();
        let house = h.state.houses.add("Rumah A").await.unwrap();

        let mut config = ThresholdConfig::default();
        config.compost_volume = Tier::new(75.0, 75.0, 100.0);
        let resp = h
            .server
            .put(&format!("/houses/{}/thresholds", house.id))
            .json(&config)
            .await;

        resp.assert_status(StatusCode::UNPROCESSABLE_ENTITY);
        assert!(resp.json::<Value>()["error"]
            .as_str()
            .unwrap()
            .contains("normal < check < full"));
    }

    // -----------------------------------------------------------------------
    // History
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn history_filters_and_clears() {
        let h = harness();
        let a = h.state.houses.add("Rumah A").await.unwrap();
        let b = h.state.houses.add("Rumah B").await.unwrap();
        ingest(&h.state, &a.id, 20.0, 100.0).await;
        ingest(&h.state, &b.id, 20.0, 10.0).await;

        let all: Vec<Value> = h.server.get("/history").await.json();
        assert_eq!(all.len(), 4);

        let resp = h
            .server
            .get("/history")
            .add_query_param("houseId", &a.id)
            .add_query_param("status", "full")
            .await;
        resp.assert_status_ok();
        let full: Vec<Value> = resp.json();
        assert_eq!(full.len(), 1);
        assert_eq!(full[0]["kind"], "Kompos");
        assert_eq!(full[0]["status"], "Penuh");

        let legacy: Vec<Value> =
            h.server.get("/history").add_query_param("house_id", &b.id).await.json();
        assert_eq!(legacy.len(), 2);
        assert_eq!(legacy[0]["houseName"], "Rumah B");

        h.server.delete("/history").await.assert_status(StatusCode::NO_CONTENT);
        let all: Vec<Value> = h.server.get("/history").await.json();
        assert!(all.is_empty());
    }

    #[tokio::test]
    async fn history_rejects_inverted_date_range() {
        let h = harness();
        h.server
            .get("/history")
            .add_query_param("from", "2024-05-03")
            .add_query_param("to", "2024-05-01")
            .await
            .assert_status(StatusCode::BAD_REQUEST);
    }

    // -----------------------------------------------------------------------
    // Connection
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn connection_starts_disconnected() {
        let h = harness();
        let body: Value = h.server.get("/connection").await.json();
        assert_eq!(body["status"], "disconnected");
        assert_eq!(body["statusText"], "Disconnected");
        assert_eq!(body["maxRetries"], 5);
    }

    #[tokio::test]
    async fn connect_and_disconnect_drive_the_manager() {
        let h = harness();
        h.server.post("/connection/connect").await.assert_status(StatusCode::ACCEPTED);

        let mut watch = h.state.connection.watch();
        watch
            .wait_for(|s| s.status == ConnectionStatus::Connecting)
            .await
            .unwrap();
        h.connector.emit(LinkEvent::Connected).await;
        watch
            .wait_for(|s| s.status == ConnectionStatus::Connected)
            .await
            .unwrap();
        let body: Value = h.server.get("/connection").await.json();
        assert_eq!(body["statusText"], "Connected");

        h.server.post("/connection/disconnect").await.assert_status(StatusCode::ACCEPTED);
        watch
            .wait_for(|s| s.status == ConnectionStatus::Disconnected)
            .await
            .unwrap();
        assert_eq!(h.connector.closed(), vec![h.connector.last_link()]);
    }

    #[tokio::test]
    async fn broker_change_is_validated() {
        let h = harness();
        let resp = h
            .server
            .put("/connection/broker")
            .json(&json!({ "host": "broker.hivemq.com", "port": 8884 }))
            .await;
        resp.assert_status_ok();
        assert_eq!(resp.json::<Value>()["port"], 8884);

        h.server
            .put("/connection/broker")
            .json(&json!({ "host": "broker.hivemq.com", "port": 70000 }))
            .await
            .assert_status(StatusCode::UNPROCESSABLE_ENTITY);

        // The accepted endpoint reached the connector; the rejected one did not.
        for _ in 0..100 {
            if !h.connector.endpoints().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        let accepted = BrokerEndpoint::new("broker.hivemq.com", 8884).unwrap();
        assert_eq!(h.connector.endpoints(), vec![accepted.clone()]);
        assert_eq!(h.state.broker.load().await, Some(accepted));
    }

    // -----------------------------------------------------------------------
    // System
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn health_returns_ok() {
        let h = harness();
        let resp = h.server.get("/health").await;
        resp.assert_status_ok();
        let body: Value = resp.json();
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn openapi_lists_every_route() {
        let h = harness();
        let resp = h.server.get("/api-docs/openapi.json").await;
        resp.assert_status_ok();
        let body: Value = resp.json();
        let paths = body["paths"].as_object().unwrap();
        for path in [
            "/houses",
            "/houses/{id}",
            "/houses/{id}/dashboard",
            "/houses/{id}/thresholds",
            "/houses/{id}/thresholds/reset",
            "/history",
            "/connection",
            "/connection/connect",
            "/connection/disconnect",
            "/connection/broker",
        ] {
            assert!(paths.contains_key(path), "missing {path}");
        }
    }
}
