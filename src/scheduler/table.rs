//! In-memory task table: readiness, roll-up and history eviction.
//!
//! Everything here is synchronous and runs under the scheduler's table lock.
//! Nothing in this module touches the cache or the network.

use super::Tree;
use crate::types::{ArtistId, Event, TaskId, TaskInfo, TaskKind, TaskState, TaskTarget};
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// How a task ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    Succeeded,
    Failed(String),
    Cancelled,
}

impl Outcome {
    fn state(&self) -> TaskState {
        match self {
            Outcome::Succeeded => TaskState::Succeeded,
            Outcome::Failed(_) => TaskState::Failed,
            Outcome::Cancelled => TaskState::Cancelled,
        }
    }
}

#[derive(Debug)]
pub(crate) struct TaskEntry {
    pub(crate) info: TaskInfo,
    pub(crate) tree: Arc<Tree>,
    pub(crate) children: Vec<TaskId>,
    pub(crate) token: CancellationToken,
    pub(crate) cancel_requested: bool,
}

/// Work handed to a worker
#[derive(Clone, Debug)]
pub(crate) struct Claim {
    pub(crate) id: TaskId,
    pub(crate) kind: TaskKind,
    pub(crate) target: TaskTarget,
    pub(crate) tree: Arc<Tree>,
    pub(crate) token: CancellationToken,
}

#[derive(Debug, Default)]
pub(crate) struct TaskTable {
    pub(crate) tasks: HashMap<TaskId, TaskEntry>,
    queue: VecDeque<TaskId>,
    finished_roots: VecDeque<TaskId>,
    leases: HashMap<ArtistId, TaskId>,
    running_files: HashMap<ArtistId, usize>,
}

impl TaskTable {
    /// Add a queued task; children inherit the tree and a child token of the parent
    pub(crate) fn insert(
        &mut self,
        id: TaskId,
        kind: TaskKind,
        target: TaskTarget,
        parent: Option<TaskId>,
        tree: Arc<Tree>,
        token: CancellationToken,
    ) -> Event {
        let info = TaskInfo {
            id,
            kind,
            target: target.clone(),
            origin: tree.origin.clone(),
            state: TaskState::Queued,
            retry_count: 0,
            parent,
            failure: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        self.tasks.insert(
            id,
            TaskEntry {
                info,
                tree,
                children: Vec::new(),
                token,
                cancel_requested: false,
            },
        );
        if let Some(parent) = parent.and_then(|p| self.tasks.get_mut(&p)) {
            parent.children.push(id);
        }
        self.queue.push_back(id);

        Event::TaskQueued {
            id,
            parent,
            kind,
            target,
        }
    }

    fn is_ready(&self, entry: &TaskEntry) -> bool {
        let artist_id = &entry.info.target.artist_id;
        match entry.info.parent {
            // Roots wait for the artist lease
            None => self
                .leases
                .get(artist_id)
                .is_none_or(|holder| *holder == entry.info.id),
            Some(parent) => {
                let parent_ready = self.tasks.get(&parent).is_some_and(|p| {
                    matches!(p.info.state, TaskState::Waiting | TaskState::Succeeded)
                });
                let under_file_limit = entry.info.kind != TaskKind::DownloadFile
                    || entry.tree.file_limit.is_none_or(|limit| {
                        self.running_files.get(artist_id).copied().unwrap_or(0) < limit.max(1)
                    });
                parent_ready && under_file_limit
            }
        }
    }

    /// Take the first ready task out of the queue and mark it running
    pub(crate) fn claim_next(&mut self) -> Option<Claim> {
        let position = self.queue.iter().position(|id| {
            self.tasks
                .get(id)
                .is_some_and(|entry| entry.info.state == TaskState::Queued && self.is_ready(entry))
        })?;
        let id = self.queue.remove(position)?;
        let entry = self.tasks.get_mut(&id)?;

        entry.info.state = TaskState::Running;
        entry.info.started_at.get_or_insert_with(Utc::now);
        let artist_id = entry.info.target.artist_id.clone();

        match entry.info.kind {
            TaskKind::DiscoverPosts if entry.info.parent.is_none() => {
                self.leases.insert(artist_id, id);
            }
            TaskKind::DownloadFile => {
                *self.running_files.entry(artist_id).or_default() += 1;
            }
            _ => {}
        }

        Some(Claim {
            id,
            kind: entry.info.kind,
            target: entry.info.target.clone(),
            tree: Arc::clone(&entry.tree),
            token: entry.token.clone(),
        })
    }

    /// Number of tasks not yet terminal
    pub(crate) fn live_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|e| !e.info.state.is_terminal())
            .count()
    }

    /// Move a task to a terminal state
    ///
    /// Returns the roll-up outcome of the parent when this was the parent's last
    /// live child. Finalizing an already terminal task is a no-op.
    pub(crate) fn finalize(
        &mut self,
        id: TaskId,
        outcome: Outcome,
        max_history: usize,
        events: &broadcast::Sender<Event>,
    ) -> Option<(TaskId, Outcome)> {
        let entry = self.tasks.get_mut(&id)?;
        if entry.info.state.is_terminal() {
            return None;
        }

        let was_running = entry.info.state == TaskState::Running;
        entry.info.state = outcome.state();
        entry.info.finished_at = Some(Utc::now());
        let event = match &outcome {
            Outcome::Succeeded => Event::TaskSucceeded { id },
            Outcome::Failed(reason) => {
                entry.info.failure = Some(reason.clone());
                Event::TaskFailed {
                    id,
                    error: reason.clone(),
                }
            }
            Outcome::Cancelled => {
                entry.info.failure.get_or_insert_with(|| "cancelled".to_string());
                Event::TaskCancelled { id }
            }
        };
        let kind = entry.info.kind;
        let parent = entry.info.parent;
        let artist_id = entry.info.target.artist_id.clone();
        let _ = events.send(event);

        self.queue.retain(|queued| *queued != id);

        if kind == TaskKind::DownloadFile
            && was_running
            && let Some(running) = self.running_files.get_mut(&artist_id)
        {
            *running = running.saturating_sub(1);
            if *running == 0 {
                self.running_files.remove(&artist_id);
            }
        }

        let Some(parent_id) = parent else {
            if self.leases.get(&artist_id) == Some(&id) {
                self.leases.remove(&artist_id);
            }
            self.finished_roots.push_back(id);
            self.evict(max_history);
            return None;
        };

        self.roll_up(parent_id).map(|outcome| (parent_id, outcome))
    }

    /// Outcome of a waiting task whose children are all terminal
    fn roll_up(&self, id: TaskId) -> Option<Outcome> {
        let entry = self.tasks.get(&id)?;
        if entry.info.state != TaskState::Waiting {
            return None;
        }

        let mut failed = 0;
        let mut cancelled = 0;
        for child in &entry.children {
            match self.tasks.get(child).map(|c| c.info.state) {
                Some(TaskState::Failed) => failed += 1,
                Some(TaskState::Cancelled) => cancelled += 1,
                Some(TaskState::Succeeded) | None => {}
                Some(_) => return None,
            }
        }

        Some(if entry.cancel_requested {
            Outcome::Cancelled
        } else if failed > 0 {
            Outcome::Failed(format!(
                "{} of {} children failed",
                failed,
                entry.children.len()
            ))
        } else if cancelled > 0 {
            Outcome::Cancelled
        } else {
            Outcome::Succeeded
        })
    }

    /// Ids of `id` and all of its descendants
    pub(crate) fn subtree(&self, id: TaskId) -> Vec<TaskId> {
        let mut ids = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(entry) = self.tasks.get(&current) {
                ids.push(current);
                stack.extend(entry.children.iter().copied());
            }
        }
        ids
    }

    /// Root of the tree containing `id`
    pub(crate) fn root_of(&self, mut id: TaskId) -> TaskId {
        while let Some(parent) = self.tasks.get(&id).and_then(|e| e.info.parent) {
            id = parent;
        }
        id
    }

    fn evict(&mut self, max_history: usize) {
        while self.finished_roots.len() > max_history {
            let Some(root) = self.finished_roots.pop_front() else {
                break;
            };
            for id in self.subtree(root) {
                self.tasks.remove(&id);
            }
        }
    }

    /// Snapshot of every known task, ordered by id
    pub(crate) fn snapshot(&self) -> Vec<TaskInfo> {
        let mut tasks: Vec<TaskInfo> = self.tasks.values().map(|e| e.info.clone()).collect();
        tasks.sort_by_key(|t| t.id);
        tasks
    }
}
