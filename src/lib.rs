//! # creator-dl
//!
//! Incremental, resumable mirror backend for creator content platforms.
//!
//! ## Design Philosophy
//!
//! creator-dl is designed to be:
//! - **Resumable** - The per-artist cache records which posts are done and which files are
//!   downloaded, so an interrupted run picks up where it stopped
//! - **Incremental** - A `last_date` checkpoint per artist skips everything already mirrored
//! - **Library-first** - No CLI or UI; front-ends attach as sessions through the broker
//! - **Event-driven** - Every session receives the same task and cache events
//!
//! ## Quick Start
//!
//! ```no_run
//! use creator_dl::{Backend, Config};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = Backend::new(Config::default()).await?;
//!
//!     let session = backend.broker().attach();
//!     backend
//!         .broker()
//!         .dispatch(session.id, "add:url=https://kemono.cr/fanbox/user/123")
//!         .await?;
//!     backend.broker().dispatch(session.id, "check-all").await?;
//!
//!     let mut events = session.events;
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     creator_dl::run_with_shutdown(backend).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// HTTP session relay
pub mod api;
/// Backend wiring and lifecycle
pub mod backend;
/// Multi-session command broker
pub mod broker;
/// Resumable per-artist cache
pub mod cache;
/// Platform API client
pub mod client;
/// Command registry and handlers
pub mod commands;
/// Configuration types
pub mod config;
/// Error types
pub mod error;
/// Network I/O for scheduler tasks
pub mod executor;
/// Proxy pool and subscription conversion
pub mod proxy;
/// Retry logic with exponential backoff
pub mod retry;
/// Task scheduler
pub mod scheduler;
/// Timed checks
pub mod timer;
/// Core types and events
pub mod types;

#[cfg(test)]
pub(crate) mod test_helpers;

// Re-export commonly used types
pub use backend::Backend;
pub use broker::{Session, SyncBroker};
pub use cache::{Artist, ArtistCache, ArtistSummary, Post, PostFile};
pub use commands::{Command, CommandKind, CommandResponse};
pub use config::{CheckpointPolicy, Config};
pub use error::{ApiError, CacheError, Error, ErrorDetail, Result, ToHttpStatus};
pub use scheduler::{Job, SchedulerStatus, TaskScheduler};
pub use types::{
    ArtistId, ArtistStatus, Event, SessionId, TaskHandle, TaskId, TaskInfo, TaskKind, TaskState,
};

/// Run the backend until a termination signal or an `exit` command, then shut it down.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use creator_dl::{Backend, Config, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let backend = Backend::new(Config::default()).await?;
///     backend.spawn_api_server();
///     run_with_shutdown(backend).await?;
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(backend: Backend) -> Result<()> {
    tokio::select! {
        _ = wait_for_signal() => {}
        _ = backend.exit_requested() => {
            tracing::info!("Exit command received");
        }
    }
    backend.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Registration may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) | (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register signal handlers, using ctrl_c fallback");
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
                // Without any signal source only `exit` can stop the backend
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
            std::future::pending::<()>().await;
        }
    }
}
