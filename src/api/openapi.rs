//! OpenAPI document for the session relay

use utoipa::OpenApi;

/// OpenAPI documentation for the session relay
///
/// Served at `/api/v1/openapi.json` and, when enabled, through `/swagger-ui`.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "creator-dl session relay",
        version = "0.1.0",
        description = "Attach remote sessions to a creator-dl backend and run commands through the shared broker",
        license(
            name = "MIT OR Apache-2.0"
        )
    ),
    servers(
        (url = "http://localhost:18861/api/v1", description = "Local backend")
    ),
    paths(
        crate::api::routes::attach_session,
        crate::api::routes::detach_session,
        crate::api::routes::dispatch_command,
        crate::api::routes::session_events,
        crate::api::routes::health_check,
        crate::api::routes::openapi_spec,
    ),
    components(schemas(
        crate::types::ArtistId,
        crate::types::TaskId,
        crate::types::SessionId,
        crate::types::ArtistStatus,
        crate::types::TaskKind,
        crate::types::TaskState,
        crate::types::TaskTarget,
        crate::types::TaskInfo,
        crate::types::TaskHandle,
        crate::types::Event,
        crate::cache::ArtistSummary,
        crate::cache::QuarantinedArtist,
        crate::cache::ArtistOverrides,
        crate::timer::CheckTimer,
        crate::timer::TimerKind,
        crate::scheduler::SchedulerStatus,
        crate::commands::CommandKind,
        crate::commands::CommandResponse,
        crate::commands::ArtistOutcome,
        crate::commands::IncompletePost,
        crate::commands::IncompleteReport,
        crate::commands::CommandHelp,
        crate::api::routes::SessionResponse,
        crate::error::ApiError,
        crate::error::ErrorDetail,
    )),
    tags(
        (name = "sessions", description = "Attach, detach, run commands and stream events"),
        (name = "system", description = "Health check and OpenAPI document"),
    )
)]
pub struct ApiDoc;
