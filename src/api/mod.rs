//! HTTP session relay
//!
//! Lets remote front-ends attach to the backend. Every command goes through
//! the same [`SyncBroker`](crate::broker::SyncBroker) dispatch that local
//! sessions use, so the relay adds transport and nothing else.

use crate::broker::SyncBroker;
use crate::{Config, Result};
use axum::{
    Router,
    http::HeaderValue,
    routing::{delete, get, post},
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub mod error_response;
pub mod openapi;
pub mod routes;
pub mod state;

pub use openapi::ApiDoc;
pub use state::AppState;

/// Create the relay router
///
/// # Routes
///
/// All routes live under `/api/v1`:
///
/// ## Sessions
/// - `POST /sessions` - Attach a session
/// - `DELETE /sessions/:id` - Detach a session
/// - `POST /sessions/:id/commands` - Run one command line (plain-text body)
/// - `GET /sessions/:id/events` - Server-sent events stream
///
/// ## System
/// - `GET /health` - Health check
/// - `GET /openapi.json` - OpenAPI specification
/// - `GET /swagger-ui` - Interactive documentation (if enabled)
pub fn create_router(broker: SyncBroker, config: Arc<Config>) -> Router {
    let state = AppState::new(broker, Arc::clone(&config));

    let api = Router::new()
        .route("/sessions", post(routes::attach_session))
        .route("/sessions/:id", delete(routes::detach_session))
        .route("/sessions/:id/commands", post(routes::dispatch_command))
        .route("/sessions/:id/events", get(routes::session_events))
        .route("/health", get(routes::health_check))
        .route("/openapi.json", get(routes::openapi_spec))
        .with_state(state);

    let router = Router::new().nest("/api/v1", api);

    let router = if config.api.swagger_ui {
        router.merge(SwaggerUi::new("/swagger-ui").url("/api/v1/openapi.json", ApiDoc::openapi()))
    } else {
        router
    };

    if config.api.cors_enabled {
        router.layer(build_cors_layer(&config.api.cors_origins))
    } else {
        router
    }
}

/// Build a CORS layer from the configured origins ("*" allows any)
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let allow_any = origins.iter().any(|o| o == "*");

    if allow_any || origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let allowed: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();

        CorsLayer::new()
            .allow_origin(AllowOrigin::list(allowed))
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

/// Serve the relay on the configured bind address until `shutdown` is cancelled
pub async fn start_api_server(
    broker: SyncBroker,
    config: Arc<Config>,
    shutdown: CancellationToken,
) -> Result<()> {
    let bind_address = config.api.bind_address;
    tracing::info!(address = %bind_address, "Starting session relay");

    let app = create_router(broker, config);
    let listener = TcpListener::bind(bind_address)
        .await
        .map_err(crate::error::Error::Io)?;

    tracing::info!(
        address = %listener.local_addr().unwrap_or(bind_address),
        "Session relay listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| crate::error::Error::ApiServerError(e.to_string()))?;

    tracing::info!("Session relay stopped");
    Ok(())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
