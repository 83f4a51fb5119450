//! Error types for creator-dl
//!
//! This module provides error handling for the library, including:
//! - Domain-specific error types (Cache, Task, Proxy, Command)
//! - HTTP status code mapping for the session relay
//! - Structured error responses with machine-readable error codes
//! - Context information (artist id, post id, task id)

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use utoipa::ToSchema;

/// Result type alias for creator-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for creator-dl
///
/// Each variant carries enough context to attribute a failure to a specific
/// artist, post, file, task or session.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "scheduler.max_workers")
        key: Option<String>,
    },

    /// Artist cache error
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// Task scheduling error
    #[error("task error: {0}")]
    Task(#[from] TaskError),

    /// Proxy pool error
    #[error("proxy error: {0}")]
    Proxy(#[from] ProxyError),

    /// Command could not be parsed or had invalid parameters
    #[error("command error: {0}")]
    Command(#[from] CommandError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error from the HTTP client
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The platform answered with a non-success HTTP status
    #[error("HTTP {status} from {url}")]
    Http {
        /// Status code returned by the platform
        status: u16,
        /// Requested URL
        url: String,
    },

    /// Received body length disagrees with the advertised content length
    #[error("size mismatch for {path}: expected {expected} bytes, received {actual}")]
    SizeMismatch {
        /// Target path of the transfer
        path: PathBuf,
        /// Advertised content length
        expected: u64,
        /// Bytes actually received
        actual: u64,
    },

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Session is not attached to the broker
    #[error("session {0} is not attached")]
    SessionNotFound(u64),

    /// Shutdown in progress - not accepting new work
    #[error("shutdown in progress: not accepting new tasks")]
    ShuttingDown,

    /// Operation was cancelled at a cooperative checkpoint
    #[error("cancelled")]
    Cancelled,

    /// Operation exceeded the per-task timeout
    #[error("timed out after {0} seconds")]
    TimedOut(u64),

    /// API server error
    #[error("API server error: {0}")]
    ApiServerError(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Artist cache errors
#[derive(Debug, Error)]
pub enum CacheError {
    /// No artifact exists for the artist
    #[error("artist {artist_id} not found")]
    ArtistNotFound {
        /// The artist id that was not found
        artist_id: String,
    },

    /// An artifact already exists for the artist
    #[error("artist {artist_id} already exists")]
    AlreadyExists {
        /// The artist id that already exists
        artist_id: String,
    },

    /// The artifact exists but cannot be parsed
    #[error("artifact for artist {artist_id} is unreadable: {reason}")]
    Corrupt {
        /// The artist whose artifact is unreadable
        artist_id: String,
        /// Parse or read failure
        reason: String,
    },

    /// The id contains characters that cannot name an artifact file
    #[error("invalid artist id {artist_id:?}")]
    InvalidId {
        /// The rejected id
        artist_id: String,
    },

    /// The artist was quarantined after a corrupt read
    #[error("artist {artist_id} is quarantined until its artifact is repaired")]
    Quarantined {
        /// The quarantined artist id
        artist_id: String,
    },

    /// The post does not exist in the artist's cache
    #[error("post {post_id} not found for artist {artist_id}")]
    PostNotFound {
        /// Owning artist
        artist_id: String,
        /// Missing post id
        post_id: String,
    },

    /// The file index is out of range for the post
    #[error("file #{index} not found in post {post_id} of artist {artist_id}")]
    FileNotFound {
        /// Owning artist
        artist_id: String,
        /// Owning post
        post_id: String,
        /// Index of the missing file
        index: usize,
    },

    /// A post cannot be marked done while some of its files are missing
    #[error("post {post_id} of artist {artist_id} still has {remaining} file(s) not downloaded")]
    IncompletePost {
        /// Owning artist
        artist_id: String,
        /// The post
        post_id: String,
        /// Files not yet downloaded
        remaining: usize,
    },
}

/// Task scheduling errors
#[derive(Debug, Error)]
pub enum TaskError {
    /// Task id is unknown (never existed or evicted from history)
    #[error("task {id} not found")]
    NotFound {
        /// The missing task id
        id: u64,
    },

    /// Task is already in a terminal state
    #[error("task {id} is already {state}")]
    AlreadyTerminal {
        /// The task id
        id: u64,
        /// Its terminal state
        state: String,
    },
}

/// Proxy pool errors
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Every endpoint is dead (or none survived the last refresh)
    #[error("no usable proxy endpoint ({total} configured)")]
    Exhausted {
        /// Number of endpoints in the current generation
        total: usize,
    },

    /// Subscription conversion failed
    #[error("subscription conversion failed: {0}")]
    Subscription(String),

    /// Endpoint address could not be used as a proxy
    #[error("invalid proxy endpoint {address}: {reason}")]
    InvalidEndpoint {
        /// The offending address
        address: String,
        /// Why it was rejected
        reason: String,
    },
}

/// Command parsing and validation errors
#[derive(Debug, Error)]
pub enum CommandError {
    /// The command name is not part of the command surface
    #[error("unknown command: {name}")]
    Unknown {
        /// The unrecognized name
        name: String,
    },

    /// A required parameter was not supplied
    #[error("command '{command}' requires parameter '{param}'")]
    MissingParam {
        /// Command name
        command: String,
        /// Missing parameter
        param: String,
    },

    /// A parameter value could not be interpreted
    #[error("invalid value '{value}' for '{param}' of command '{command}': {reason}")]
    InvalidParam {
        /// Command name
        command: String,
        /// Parameter name
        param: String,
        /// Supplied value
        value: String,
        /// Why it was rejected
        reason: String,
    },
}

/// API error response format
///
/// Standard error body returned by the session relay.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ApiError {
    /// The error details
    pub error: ErrorDetail,
}

/// Detailed error information for API responses
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorDetail {
    /// Machine-readable error code (e.g., "artist_not_found", "unknown_command")
    pub code: String,

    /// Human-readable error message
    pub message: String,

    /// Optional additional context (artist id, task id, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    /// Create a new API error with code and message
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
                details: None,
            },
        }
    }

    /// Create a "not found" error
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::new("not_found", format!("{} not found", resource.into()))
    }

    /// Create a "validation error" error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new("validation_error", message)
    }

    /// Create an "internal server error"
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("internal_error", message)
    }
}

/// Convert errors to HTTP status codes for API responses
pub trait ToHttpStatus {
    /// Get the HTTP status code for this error
    fn status_code(&self) -> u16;

    /// Get the machine-readable error code
    fn error_code(&self) -> &str;
}

impl ToHttpStatus for Error {
    fn status_code(&self) -> u16 {
        match self {
            // 400 Bad Request - Client error (invalid input)
            Error::Config { .. } => 400,
            Error::Command(_) => 400,
            Error::Cache(CacheError::InvalidId { .. }) => 400,

            // 404 Not Found
            Error::Cache(CacheError::ArtistNotFound { .. }) => 404,
            Error::Cache(CacheError::PostNotFound { .. }) => 404,
            Error::Cache(CacheError::FileNotFound { .. }) => 404,
            Error::Cache(CacheError::IncompletePost { .. }) => 409,
            Error::Task(TaskError::NotFound { .. }) => 404,
            Error::SessionNotFound(_) => 404,

            // 409 Conflict
            Error::Cache(CacheError::AlreadyExists { .. }) => 409,
            Error::Cache(CacheError::Quarantined { .. }) => 409,
            Error::Task(TaskError::AlreadyTerminal { .. }) => 409,

            // 422 Unprocessable Entity
            Error::Cache(CacheError::Corrupt { .. }) => 422,
            Error::SizeMismatch { .. } => 422,

            // 500 Internal Server Error
            Error::Io(_) => 500,
            Error::Serialization(_) => 500,
            Error::ApiServerError(_) => 500,
            Error::Other(_) => 500,

            // 502 Bad Gateway - upstream platform failures
            Error::Network(_) => 502,
            Error::Http { .. } => 502,

            // 503 Service Unavailable
            Error::ShuttingDown => 503,
            Error::Proxy(_) => 503,

            // 504 Gateway Timeout
            Error::TimedOut(_) => 504,

            // 499 Client Closed Request (nginx convention)
            Error::Cancelled => 499,
        }
    }

    fn error_code(&self) -> &str {
        match self {
            Error::Config { .. } => "config_error",
            Error::Cache(e) => match e {
                CacheError::ArtistNotFound { .. } => "artist_not_found",
                CacheError::AlreadyExists { .. } => "artist_exists",
                CacheError::Corrupt { .. } => "cache_corrupt",
                CacheError::Quarantined { .. } => "artist_quarantined",
                CacheError::InvalidId { .. } => "invalid_artist_id",
                CacheError::PostNotFound { .. } => "post_not_found",
                CacheError::FileNotFound { .. } => "file_not_found",
                CacheError::IncompletePost { .. } => "post_incomplete",
            },
            Error::Task(e) => match e {
                TaskError::NotFound { .. } => "task_not_found",
                TaskError::AlreadyTerminal { .. } => "task_terminal",
            },
            Error::Proxy(e) => match e {
                ProxyError::Exhausted { .. } => "proxy_exhausted",
                ProxyError::Subscription(_) => "subscription_failed",
                ProxyError::InvalidEndpoint { .. } => "invalid_proxy_endpoint",
            },
            Error::Command(e) => match e {
                CommandError::Unknown { .. } => "unknown_command",
                CommandError::MissingParam { .. } => "missing_param",
                CommandError::InvalidParam { .. } => "invalid_param",
            },
            Error::Io(_) => "io_error",
            Error::Network(_) => "network_error",
            Error::Http { .. } => "http_error",
            Error::SizeMismatch { .. } => "size_mismatch",
            Error::Serialization(_) => "serialization_error",
            Error::SessionNotFound(_) => "session_not_found",
            Error::ShuttingDown => "shutting_down",
            Error::Cancelled => "cancelled",
            Error::TimedOut(_) => "timed_out",
            Error::ApiServerError(_) => "api_server_error",
            Error::Other(_) => "internal_error",
        }
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        let code = error.error_code().to_string();
        let message = error.to_string();

        let details = match &error {
            Error::Cache(
                CacheError::ArtistNotFound { artist_id }
                | CacheError::AlreadyExists { artist_id }
                | CacheError::Quarantined { artist_id }
                | CacheError::InvalidId { artist_id },
            ) => Some(serde_json::json!({ "artist_id": artist_id })),
            Error::Cache(CacheError::Corrupt { artist_id, reason }) => Some(serde_json::json!({
                "artist_id": artist_id,
                "reason": reason,
            })),
            Error::Cache(CacheError::PostNotFound { artist_id, post_id }) => {
                Some(serde_json::json!({
                    "artist_id": artist_id,
                    "post_id": post_id,
                }))
            }
            Error::Task(TaskError::NotFound { id } | TaskError::AlreadyTerminal { id, .. }) => {
                Some(serde_json::json!({ "task_id": id }))
            }
            Error::Command(CommandError::MissingParam { command, param }) => {
                Some(serde_json::json!({
                    "command": command,
                    "param": param,
                }))
            }
            Error::SessionNotFound(id) => Some(serde_json::json!({ "session_id": id })),
            _ => None,
        };

        ApiError {
            error: ErrorDetail {
                code,
                message,
                details,
            },
        }
    }
}
