//! Route handlers for the session relay
//!
//! - [`sessions`] - attach, detach, command dispatch, event stream
//! - [`system`] - health and OpenAPI

use crate::types::SessionId;
use serde::{Deserialize, Serialize};

mod sessions;
mod system;

pub use sessions::*;
pub use system::*;

/// Response for POST /sessions
#[derive(Debug, Deserialize, Serialize, utoipa::ToSchema)]
pub struct SessionResponse {
    /// Id to use for commands, events and detach
    pub session: SessionId,
}
