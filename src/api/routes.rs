use crate::api::api_error::APIError;
use crate::api::server::AppState;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub(super) fn new(state: AppState) -> Router {
    Router::new()
        .route("/healthcheck", get(health_check))
        .route("/state", get(server_state))
        .route("/counters", get(counters))
        .route("/hosts", get(hosts))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(state.config.api_timeout))
        .with_state(state)
}

#[allow(clippy::unused_async)]
async fn health_check() -> impl IntoResponse {
    Json(json!({"ok":"healthy"}))
}

async fn server_state(State(state): State<AppState>) -> Result<impl IntoResponse, APIError> {
    Ok(Json(state.handle.status().await?))
}

async fn counters(State(state): State<AppState>) -> Result<impl IntoResponse, APIError> {
    Ok(Json(state.handle.status().await?.counters))
}

async fn hosts(State(state): State<AppState>) -> Result<impl IntoResponse, APIError> {
    Ok(Json(state.handle.hosts().await?))
}
