pub mod dto;
pub mod errors;
pub mod handlers;

use axum::{
    routing::{get, post, put},
    Router,
};
use utoipa::OpenApi;
use utoipa_axum::router::OpenApiRouter;

use crate::{
    connection::ConnectionHandle,
    history::HistoryLog,
    house_store::HouseStore,
    settings::{BrokerSettings, Thresholds},
};
use handlers::ApiDoc;

/// Collaborators shared by every handler. All fields are cheap clones of
/// shared state.
#[derive(Clone)]
pub struct AppState {
    pub houses: HouseStore,
    pub history: HistoryLog,
    pub thresholds: Thresholds,
    pub broker: BrokerSettings,
    pub connection: ConnectionHandle,
}

pub fn router(state: AppState) -> Router {
    let (router, api) = OpenApiRouter::with_openapi(ApiDoc::openapi())
        .route(
            "/houses",
            get(handlers::list_houses).post(handlers::create_house),
        )
        .route(
            "/houses/{id}",
            put(handlers::rename_house).delete(handlers::delete_house),
        )
        .route("/houses/{id}/dashboard", get(handlers::get_dashboard))
        .route(
            "/houses/{id}/thresholds",
            get(handlers::get_thresholds).put(handlers::update_thresholds),
        )
        .route(
            "/houses/{id}/thresholds/reset",
            post(handlers::reset_thresholds),
        )
        .route(
            "/history",
            get(handlers::get_history).delete(handlers::clear_history),
        )
        .route("/connection", get(handlers::get_connection))
        .route("/connection/connect", post(handlers::connect))
        .route("/connection/disconnect", post(handlers::disconnect))
        .route("/connection/broker", put(handlers::set_broker))
        .with_state(state)
        .split_for_parts();

    router
        .route("/health", get(handlers::health))
        .route(
            "/api-docs/openapi.json",
            get(move || async move { axum::Json(api) }),
        )
}
