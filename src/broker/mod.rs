//! Session broker: translation and fan-out between front-ends and the backend.
//!
//! Sessions hold no state of their own. A session is an id plus a receiver
//! on the shared event channel; every command from every session goes
//! through [`commands::execute`] against the same scheduler and cache.

use crate::commands::{self, Command, CommandContext, CommandResponse};
use crate::error::{Error, Result};
use crate::types::{Event, SessionId};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

/// An attached front-end
#[derive(Debug)]
pub struct Session {
    /// Session id used for dispatch and detach
    pub id: SessionId,
    /// Every event emitted after the session attached
    pub events: broadcast::Receiver<Event>,
}

#[derive(Debug)]
struct BrokerInner {
    ctx: CommandContext,
    sessions: RwLock<HashSet<SessionId>>,
    next_id: AtomicU64,
}

/// Routes commands from any number of sessions to the one backend
#[derive(Clone, Debug)]
pub struct SyncBroker {
    inner: Arc<BrokerInner>,
}

impl SyncBroker {
    /// Create a broker over the shared command context
    pub fn new(ctx: CommandContext) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                ctx,
                sessions: RwLock::new(HashSet::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Attach a new session
    pub fn attach(&self) -> Session {
        let id = SessionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        // Subscribe before announcing so the session sees its own attach event
        let events = self.inner.ctx.event_tx.subscribe();
        if let Ok(mut sessions) = self.inner.sessions.write() {
            sessions.insert(id);
        }
        let _ = self.inner.ctx.event_tx.send(Event::SessionAttached { session: id });
        tracing::info!(session = id.0, "Session attached");
        Session { id, events }
    }

    /// Detach a session; in-flight tasks are unaffected
    pub fn detach(&self, id: SessionId) -> Result<()> {
        let removed = self
            .inner
            .sessions
            .write()
            .map(|mut sessions| sessions.remove(&id))
            .unwrap_or(false);
        if !removed {
            return Err(Error::SessionNotFound(id.0));
        }
        let _ = self.inner.ctx.event_tx.send(Event::SessionDetached { session: id });
        tracing::info!(session = id.0, "Session detached");
        Ok(())
    }

    /// Whether `id` is attached
    pub fn is_attached(&self, id: SessionId) -> bool {
        self.inner
            .sessions
            .read()
            .map(|sessions| sessions.contains(&id))
            .unwrap_or(false)
    }

    /// Attached session ids, ascending
    pub fn sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self
            .inner
            .sessions
            .read()
            .map(|sessions| sessions.iter().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Parse and run one command line on behalf of `session`
    pub async fn dispatch(&self, session: SessionId, line: &str) -> Result<CommandResponse> {
        if !self.is_attached(session) {
            return Err(Error::SessionNotFound(session.0));
        }
        let command = Command::parse(line)?;
        tracing::debug!(session = session.0, command = %command.kind(), "Dispatching command");
        commands::execute(&self.inner.ctx, command).await
    }

    /// Event receiver for a front-end that is already attached
    pub fn subscribe(&self, session: SessionId) -> Result<broadcast::Receiver<Event>> {
        if !self.is_attached(session) {
            return Err(Error::SessionNotFound(session.0));
        }
        Ok(self.inner.ctx.event_tx.subscribe())
    }

    /// Shared command context
    pub fn context(&self) -> &CommandContext {
        &self.inner.ctx
    }
}
