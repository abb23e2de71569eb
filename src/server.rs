//! Application state and router assembly.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth::TokenVerifier;
use crate::config::Config;
use crate::registry::SessionRegistry;
use crate::room::RoomBroker;
use crate::storage::SharedStorage;
use crate::websocket::{control_handler, data_handler, viewer_handler};

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub registry: Arc<SessionRegistry>,
    pub verifier: TokenVerifier,
    /// Room persistence; `None` runs the relay without the jam layer.
    pub storage: Option<SharedStorage>,
    pub broker: Option<Arc<RoomBroker>>,
}

pub fn build_router(state: AppState, metrics: Option<PrometheusHandle>) -> Router {
    let ws_routes = Router::new()
        .route("/ws/control/:session_id", get(control_handler))
        .route("/ws/terminal-data/:session_id/:terminal", get(data_handler))
        .route("/ws/terminal/:session_id", get(viewer_handler))
        .route("/ws/jam/:room_id", get(crate::room::jam_handler))
        .with_state(state.clone());

    let http_routes = Router::new()
        .route("/health", get(health_check))
        .route("/sessions/:id", get(get_session_status))
        .route("/sessions/closed/recent", get(get_recently_closed))
        .with_state(state);

    let mut app = Router::new().merge(ws_routes).merge(http_routes);
    if let Some(handle) = metrics {
        app = app.merge(
            Router::new()
                .route("/metrics", get(metrics_handler))
                .with_state(handle),
        );
    }

    app.layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "sessions": state.registry.session_count(),
    }))
}

async fn get_session_status(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    match state.registry.get(&session_id) {
        Some(session) => Json(session.status().await).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "session not found" })),
        )
            .into_response(),
    }
}

async fn get_recently_closed(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "sessions": state.registry.recently_closed() }))
}

async fn metrics_handler(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}
