//! Retry logic with exponential backoff
//!
//! Transient failures (timeouts, connection resets, HTTP 429/5xx, truncated
//! transfers) are retried with exponential backoff and optional jitter.
//! Everything else fails immediately.
//!
//! Two entry points share the same delay schedule:
//! - [`with_retry`] wraps a standalone operation (subscription fetches)
//! - [`Backoff`] is driven step by step by the task scheduler, which needs to
//!   record each retry on the task and stop waiting when the task is cancelled
//!
//! # Example
//!
//! ```no_run
//! use creator_dl::retry::{IsRetryable, with_retry};
//! use creator_dl::config::RetryConfig;
//!
//! #[derive(Debug)]
//! enum MyError {
//!     Transient,
//!     Permanent,
//! }
//!
//! impl std::fmt::Display for MyError {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "{:?}", self)
//!     }
//! }
//!
//! impl IsRetryable for MyError {
//!     fn is_retryable(&self) -> bool {
//!         matches!(self, MyError::Transient)
//!     }
//! }
//!
//! # async fn example() -> Result<(), MyError> {
//! let config = RetryConfig::default();
//! with_retry(&config, || async { Ok::<_, MyError>(()) }).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::Error;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (network timeouts, server busy, connection reset) should return `true`.
/// Permanent failures (not found, corrupt cache, proxy exhaustion) should return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Network(e) => {
                if let Some(status) = e.status() {
                    return is_retryable_status(status.as_u16());
                }
                e.is_timeout() || e.is_connect() || e.is_request() || e.is_body()
            }
            Error::Http { status, .. } => is_retryable_status(*status),
            // Truncated transfer, the next attempt starts over
            Error::SizeMismatch { .. } => true,
            Error::TimedOut(_) => true,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::UnexpectedEof
            ),
            // Proxy exhaustion needs a pool refresh or a manual retry
            Error::Proxy(_) => false,
            Error::Config { .. }
            | Error::Cache(_)
            | Error::Task(_)
            | Error::Command(_)
            | Error::Serialization(_)
            | Error::SessionNotFound(_)
            | Error::ShuttingDown
            | Error::Cancelled
            | Error::ApiServerError(_)
            | Error::Other(_) => false,
        }
    }
}

/// HTTP 429 and 5xx are worth another attempt
pub fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

/// Step-by-step exponential backoff schedule
///
/// Each call to [`Backoff::next_delay`] consumes one retry and returns how long
/// to wait before it, or `None` once `max_attempts` retries were handed out.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    attempt: u32,
    delay: Duration,
}

impl Backoff {
    /// Start a fresh schedule
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            config: config.clone(),
            attempt: 0,
            delay: config.initial_delay,
        }
    }

    /// Number of retries handed out so far
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next retry, or `None` when retries are exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.config.max_attempts {
            return None;
        }
        self.attempt += 1;

        let current = self.delay;
        let next = Duration::from_secs_f64(current.as_secs_f64() * self.config.backoff_multiplier);
        self.delay = next.min(self.config.max_delay);

        Some(if self.config.jitter {
            add_jitter(current)
        } else {
            current
        })
    }
}

/// Execute an async operation with exponential backoff retry logic
///
/// Returns the successful result or the last error after all retry attempts
/// are exhausted. Non-retryable errors are returned immediately.
pub async fn with_retry<F, Fut, T, E>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let mut backoff = Backoff::new(config);

    loop {
        match operation().await {
            Ok(result) => {
                if backoff.attempts() > 0 {
                    tracing::info!(
                        attempts = backoff.attempts() + 1,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() => match backoff.next_delay() {
                Some(delay) => {
                    tracing::warn!(
                        error = %e,
                        attempt = backoff.attempts(),
                        max_attempts = config.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    tracing::error!(
                        error = %e,
                        attempts = backoff.attempts() + 1,
                        "Operation failed after all retry attempts exhausted"
                    );
                    return Err(e);
                }
            },
            Err(e) => {
                tracing::error!(error = %e, "Operation failed with non-retryable error");
                return Err(e);
            }
        }
    }
}

/// Add random jitter to a delay
///
/// Jitter is uniformly distributed between 0% and 100% of the delay, so the
/// actual delay lands between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor))
}
