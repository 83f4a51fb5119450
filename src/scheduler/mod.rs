//! Task scheduler with bounded parallelism, retry and cancellation.
//!
//! A submitted job becomes a task tree for one artist:
//!
//! ```text
//! discover-posts (root)
//! ├── download-post
//! │   ├── download-file
//! │   └── download-file
//! └── download-post
//!     └── download-file
//! ```
//!
//! A task only becomes ready once its parent's own step succeeded (the parent
//! is then `waiting`). A root is only ready while no other tree holds the
//! artist's lease, so two trees never mutate the same artist concurrently.
//! When every child of a waiting task is terminal the task rolls up to
//! succeeded, failed or cancelled.
//!
//! Nothing here is journaled. Re-submitting a job after a restart rebuilds
//! the tree from the cache's `done` and `downloaded` flags.

mod queue_processor;
mod table;
mod worker;

use crate::cache::ArtistCache;
use crate::config::{CheckpointPolicy, RetryConfig, SchedulerConfig};
use crate::error::{Error, Result, TaskError};
use crate::executor::DownloadExecutor;
use crate::types::{ArtistId, Event, TaskHandle, TaskId, TaskInfo, TaskKind, TaskState, TaskTarget};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use table::{Outcome, TaskTable};
use tokio::sync::{Notify, Semaphore, broadcast};
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;

/// How long shutdown waits for running tasks to drain
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// What a task tree does for its artist
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Job {
    /// Download every post that is not done, and within it every file not downloaded
    Check,
    /// Download every file of the posts published inside the window, regardless of `done`
    Range {
        /// Exclusive lower bound
        from: Option<NaiveDateTime>,
        /// Inclusive upper bound
        until: Option<NaiveDateTime>,
    },
    /// Refresh the profile and post list; `full` also fetches missing post details
    UpdateCache {
        /// Fetch the detail of every post lacking it
        full: bool,
    },
}

impl Job {
    fn downloads(&self) -> bool {
        !matches!(self, Job::UpdateCache { .. })
    }
}

/// Settings shared by every task of one tree, resolved at submission
#[derive(Debug)]
pub(crate) struct Tree {
    pub(crate) job: Job,
    pub(crate) origin: String,
    pub(crate) checkpoint: CheckpointPolicy,
    pub(crate) download_root: PathBuf,
    pub(crate) file_limit: Option<usize>,
}

/// Snapshot returned by the `tasks` command
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct SchedulerStatus {
    /// Tasks waiting for a worker
    pub queued: usize,
    /// Tasks executing
    pub running: usize,
    /// Tasks waiting on their children
    pub waiting: usize,
    /// Terminal tasks still in history
    pub finished: usize,
    /// Every known task, ordered by id
    pub tasks: Vec<TaskInfo>,
}

/// Shared scheduler state
pub(crate) struct SchedulerInner {
    config: SchedulerConfig,
    retry: RetryConfig,
    cache: Arc<ArtistCache>,
    executor: Arc<DownloadExecutor>,
    event_tx: broadcast::Sender<Event>,
    table: Mutex<TaskTable>,
    notify: Notify,
    workers: Arc<Semaphore>,
    accepting: AtomicBool,
    shutdown_token: CancellationToken,
    next_id: AtomicU64,
}

/// Expands jobs into task trees and runs them on a bounded worker pool
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("max_workers", &self.inner.config.max_workers)
            .finish_non_exhaustive()
    }
}

impl TaskScheduler {
    /// Create a scheduler; call [`start_queue_processor`](Self::start_queue_processor) to run tasks
    pub fn new(
        config: SchedulerConfig,
        retry: RetryConfig,
        cache: Arc<ArtistCache>,
        executor: Arc<DownloadExecutor>,
        event_tx: broadcast::Sender<Event>,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.max_workers.max(1)));
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                retry,
                cache,
                executor,
                event_tx,
                table: Mutex::new(TaskTable::default()),
                notify: Notify::new(),
                workers,
                accepting: AtomicBool::new(true),
                shutdown_token: CancellationToken::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    fn table(&self) -> MutexGuard<'_, TaskTable> {
        self.inner.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: Event) {
        let _ = self.inner.event_tx.send(event);
    }

    fn next_id(&self) -> TaskId {
        TaskId(self.inner.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Queue a task tree for `artist_id`
    ///
    /// Fails if the artist is unknown or quarantined, or if shutdown started.
    pub async fn submit(&self, artist_id: &ArtistId, job: Job, origin: &str) -> Result<TaskHandle> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }

        // Validates the artist (not found / quarantined)
        self.inner.cache.load(artist_id).await?;
        let overrides = self.inner.cache.overrides(artist_id).await;

        let tree = Arc::new(Tree {
            job,
            origin: origin.to_string(),
            checkpoint: overrides.checkpoint.unwrap_or(self.inner.config.checkpoint),
            download_root: overrides
                .download_dir
                .unwrap_or_else(|| self.inner.executor.download_dir().to_path_buf()),
            file_limit: overrides.max_concurrent_files,
        });

        let id = self.next_id();
        let event = self.table().insert(
            id,
            TaskKind::DiscoverPosts,
            TaskTarget::artist(artist_id.clone()),
            None,
            tree,
            CancellationToken::new(),
        );
        self.emit(event);
        self.inner.notify.notify_one();

        tracing::info!(task_id = id.0, artist_id = %artist_id, origin, "Task tree queued");
        Ok(TaskHandle {
            id,
            artist_id: artist_id.clone(),
        })
    }

    /// Cancel a task and everything below it; returns the ids that were still live
    ///
    /// Queued tasks are cancelled immediately. Running tasks stop at their next
    /// cancellation checkpoint, and waiting tasks roll up as cancelled once
    /// their children finish.
    pub async fn cancel(&self, id: TaskId) -> Result<Vec<TaskId>> {
        let mut roll_ups = Vec::new();
        let affected = {
            let mut table = self.table();
            let state = table
                .tasks
                .get(&id)
                .map(|e| e.info.state)
                .ok_or(TaskError::NotFound { id: id.0 })?;
            if state.is_terminal() {
                return Err(TaskError::AlreadyTerminal {
                    id: id.0,
                    state: state.to_string(),
                }
                .into());
            }

            let mut affected = Vec::new();
            for task_id in table.subtree(id) {
                let Some(state) = table.tasks.get(&task_id).map(|e| e.info.state) else {
                    continue;
                };
                match state {
                    TaskState::Queued => {
                        affected.push(task_id);
                        if let Some(roll_up) = table.finalize(
                            task_id,
                            Outcome::Cancelled,
                            self.inner.config.max_task_history,
                            &self.inner.event_tx,
                        ) {
                            roll_ups.push(roll_up);
                        }
                    }
                    TaskState::Running | TaskState::Waiting => {
                        affected.push(task_id);
                        if let Some(entry) = table.tasks.get_mut(&task_id) {
                            entry.cancel_requested = true;
                            entry.token.cancel();
                        }
                    }
                    _ => {}
                }
            }
            affected
        };

        tracing::info!(task_id = id.0, tasks = affected.len(), "Cancellation requested");
        for (parent, outcome) in roll_ups {
            self.settle(parent, outcome).await;
        }
        self.inner.notify.notify_one();
        Ok(affected)
    }

    /// Cancel every live task tree
    pub async fn cancel_all(&self) -> Vec<TaskId> {
        self.cancel_roots(|_| true).await
    }

    /// Cancel every live task tree of one artist
    pub async fn cancel_artist(&self, artist_id: &ArtistId) -> Vec<TaskId> {
        self.cancel_roots(|target| target.artist_id == *artist_id).await
    }

    /// Whether any tree of `artist_id` is still queued, running or waiting
    pub fn has_live_tree(&self, artist_id: &ArtistId) -> bool {
        self.table().tasks.values().any(|e| {
            e.info.parent.is_none()
                && !e.info.state.is_terminal()
                && e.info.target.artist_id == *artist_id
        })
    }

    async fn cancel_roots(&self, matches: impl Fn(&TaskTarget) -> bool) -> Vec<TaskId> {
        let roots: Vec<TaskId> = {
            let table = self.table();
            let mut roots: Vec<TaskId> = table
                .tasks
                .values()
                .filter(|e| e.info.parent.is_none() && !e.info.state.is_terminal())
                .filter(|e| matches(&e.info.target))
                .map(|e| e.info.id)
                .collect();
            roots.sort();
            roots
        };

        let mut affected = Vec::new();
        for root in roots {
            // A tree may finish between the snapshot and the cancel
            if let Ok(ids) = self.cancel(root).await {
                affected.extend(ids);
            }
        }
        affected
    }

    /// Counts and a snapshot of every task in history
    pub fn status(&self) -> SchedulerStatus {
        let tasks = self.table().snapshot();
        let count = |state: TaskState| tasks.iter().filter(|t| t.state == state).count();
        SchedulerStatus {
            queued: count(TaskState::Queued),
            running: count(TaskState::Running),
            waiting: count(TaskState::Waiting),
            finished: tasks.iter().filter(|t| t.state.is_terminal()).count(),
            tasks,
        }
    }

    /// One task by id
    pub fn task(&self, id: TaskId) -> Option<TaskInfo> {
        self.table().tasks.get(&id).map(|e| e.info.clone())
    }

    /// Root task of the tree containing `id`
    pub fn root_of(&self, id: TaskId) -> TaskId {
        self.table().root_of(id)
    }

    /// Whether new submissions are accepted
    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }

    /// Wait until the tree rooted at `id` is terminal and return its root
    pub async fn wait_for(&self, id: TaskId) -> Result<TaskInfo> {
        let mut events = self.inner.event_tx.subscribe();
        loop {
            match self.task(id) {
                Some(info) if info.state.is_terminal() => return Ok(info),
                Some(_) => {}
                None => return Err(TaskError::NotFound { id: id.0 }.into()),
            }
            tokio::select! {
                _ = events.recv() => {}
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
        }
    }

    /// Stop accepting work, cancel everything, and wait (bounded) for workers to drain
    pub async fn shutdown(&self) {
        tracing::info!("Scheduler shutting down");
        self.inner.accepting.store(false, Ordering::SeqCst);
        self.cancel_all().await;

        let drained = tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, async {
            while self.table().live_count() > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                live_tasks = self.table().live_count(),
                "Timed out waiting for tasks to drain"
            );
        }

        self.inner.shutdown_token.cancel();
        self.inner.notify.notify_one();
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
