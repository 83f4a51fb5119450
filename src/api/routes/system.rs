//! System handlers: health and OpenAPI.

use crate::api::AppState;
use axum::{Json, extract::State, response::IntoResponse};
use serde_json::json;

/// GET /health - Health check
#[utoipa::path(
    get,
    path = "/api/v1/health",
    tag = "system",
    responses(
        (status = 200, description = "Backend is up")
    )
)]
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let scheduler = &state.broker.context().scheduler;
    Json(json!({
        "status": if scheduler.is_accepting() { "ok" } else { "shutting_down" },
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": state.broker.sessions().len(),
    }))
}

/// GET /openapi.json - OpenAPI specification
#[utoipa::path(
    get,
    path = "/api/v1/openapi.json",
    tag = "system",
    responses(
        (status = 200, description = "OpenAPI specification in JSON format")
    )
)]
pub async fn openapi_spec() -> impl IntoResponse {
    use crate::api::openapi::ApiDoc;
    use utoipa::OpenApi;

    Json(ApiDoc::openapi())
}
