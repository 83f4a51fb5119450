//! Application state for the session relay

use crate::Config;
use crate::broker::SyncBroker;
use std::sync::Arc;

/// Shared state handed to every route handler
#[derive(Clone)]
pub struct AppState {
    /// The broker every session goes through
    pub broker: SyncBroker,

    /// Configuration (read-only)
    pub config: Arc<Config>,
}

impl AppState {
    /// Create a new AppState
    pub fn new(broker: SyncBroker, config: Arc<Config>) -> Self {
        Self { broker, config }
    }
}
