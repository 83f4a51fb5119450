//! Session handlers: attach, detach, dispatch and events.

use super::SessionResponse;
use crate::api::AppState;
use crate::commands::CommandResponse;
use crate::error::Result;
use crate::types::SessionId;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{
        IntoResponse,
        sse::{Event as SseEvent, KeepAlive, Sse},
    },
};
use std::convert::Infallible;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;

/// POST /sessions - Attach a session
#[utoipa::path(
    post,
    path = "/api/v1/sessions",
    tag = "sessions",
    responses(
        (status = 201, description = "Session attached", body = SessionResponse)
    )
)]
pub async fn attach_session(State(state): State<AppState>) -> impl IntoResponse {
    // The relay streams events per request, so the attach receiver is not kept
    let session = state.broker.attach();
    (
        StatusCode::CREATED,
        Json(SessionResponse {
            session: session.id,
        }),
    )
}

/// DELETE /sessions/:id - Detach a session
#[utoipa::path(
    delete,
    path = "/api/v1/sessions/{id}",
    tag = "sessions",
    params(
        ("id" = u64, Path, description = "Session ID")
    ),
    responses(
        (status = 204, description = "Session detached"),
        (status = 404, description = "Session not attached", body = crate::error::ApiError)
    )
)]
pub async fn detach_session(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<StatusCode> {
    state.broker.detach(SessionId(id))?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /sessions/:id/commands - Run one command line
#[utoipa::path(
    post,
    path = "/api/v1/sessions/{id}/commands",
    tag = "sessions",
    params(
        ("id" = u64, Path, description = "Session ID")
    ),
    request_body(
        content = String,
        description = "Command line, e.g. `check:artist=fanbox_123`",
        content_type = "text/plain"
    ),
    responses(
        (status = 200, description = "Command result", body = CommandResponse),
        (status = 400, description = "Unknown command or invalid parameter", body = crate::error::ApiError),
        (status = 404, description = "Session, artist or task not found", body = crate::error::ApiError),
        (status = 409, description = "Conflict with current state", body = crate::error::ApiError),
        (status = 503, description = "Backend shutting down", body = crate::error::ApiError)
    )
)]
pub async fn dispatch_command(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    body: String,
) -> Result<Json<CommandResponse>> {
    let response = state.broker.dispatch(SessionId(id), &body).await?;
    Ok(Json(response))
}

/// GET /sessions/:id/events - Server-sent events stream
#[utoipa::path(
    get,
    path = "/api/v1/sessions/{id}/events",
    tag = "sessions",
    params(
        ("id" = u64, Path, description = "Session ID")
    ),
    responses(
        (status = 200, description = "Server-sent events stream (text/event-stream)", content_type = "text/event-stream"),
        (status = 404, description = "Session not attached", body = crate::error::ApiError)
    )
)]
pub async fn session_events(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Sse<impl tokio_stream::Stream<Item = std::result::Result<SseEvent, Infallible>>>> {
    let receiver = state.broker.subscribe(SessionId(id))?;
    let stream = BroadcastStream::new(receiver);

    let sse_stream = stream.filter_map(move |result| match result {
        Ok(event) => match serde_json::to_value(&event) {
            Ok(json) => {
                let event_type = json
                    .get("type")
                    .and_then(|t| t.as_str())
                    .unwrap_or("event")
                    .to_string();
                Some(Ok(SseEvent::default()
                    .event(event_type)
                    .data(json.to_string())))
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize event");
                None
            }
        },
        Err(tokio_stream::wrappers::errors::BroadcastStreamRecvError::Lagged(skipped)) => {
            tracing::warn!(session = id, skipped, "SSE client lagged");
            Some(Ok(SseEvent::default().event("error").data(format!(
                r#"{{"error":"lagged","skipped":{}}}"#,
                skipped
            ))))
        }
    });

    Ok(Sse::new(sse_stream).keep_alive(KeepAlive::default()))
}
