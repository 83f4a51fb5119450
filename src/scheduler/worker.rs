//! Task execution: the per-kind steps, the retry loop, and the cache hooks
//! that run before a task is finalized.

use super::table::{Claim, Outcome};
use super::{Job, TaskScheduler};
use crate::cache::ops;
use crate::config::CheckpointPolicy;
use crate::error::{CacheError, Error};
use crate::executor::FileOutcome;
use crate::retry::{Backoff, IsRetryable};
use crate::types::{ArtistId, Event, TaskId, TaskKind, TaskState, TaskTarget};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How long a timed-out step gets to reach its cancellation checkpoint
const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Why one attempt at a step failed
#[derive(Debug)]
enum StepError {
    Cancelled,
    Transient(String),
    Permanent(String),
}

impl From<Error> for StepError {
    fn from(e: Error) -> Self {
        match e {
            Error::Cancelled => StepError::Cancelled,
            e if e.is_retryable() => StepError::Transient(e.to_string()),
            e => StepError::Permanent(e.to_string()),
        }
    }
}

/// A task to create under the current one
#[derive(Debug)]
struct ChildSpec {
    kind: TaskKind,
    target: TaskTarget,
}

/// What the pre-finalize hooks need to know about a task
struct HookContext {
    kind: TaskKind,
    target: TaskTarget,
    tree: Arc<super::Tree>,
    is_root: bool,
    failed_children: Vec<usize>,
}

impl TaskScheduler {
    /// Run a claimed task to the end of its own step
    pub(super) async fn run_task(&self, claim: Claim) {
        self.emit(Event::TaskStarted { id: claim.id });
        tracing::debug!(task_id = claim.id.0, kind = ?claim.kind, target = %claim.target, "Task started");

        let outcome = match self.attempt(&claim).await {
            Ok(children) => match self.spawn_children(&claim, children) {
                Some(outcome) => outcome,
                None => return,
            },
            Err(StepError::Cancelled) => Outcome::Cancelled,
            Err(StepError::Transient(message)) | Err(StepError::Permanent(message)) => {
                Outcome::Failed(message)
            }
        };

        self.settle(claim.id, outcome).await;
    }

    /// Run the step, retrying transient failures with backoff
    async fn attempt(&self, claim: &Claim) -> Result<Vec<ChildSpec>, StepError> {
        let timeout = self.inner.config.task_timeout;
        let mut backoff = Backoff::new(&self.inner.retry);

        loop {
            let attempt_token = claim.token.child_token();
            let step = self.step(claim, &attempt_token);
            tokio::pin!(step);

            let result = tokio::select! {
                result = &mut step => result,
                _ = tokio::time::sleep(timeout) => {
                    // Expiry takes the cancellation path so partial files are cleaned up
                    attempt_token.cancel();
                    let _ = tokio::time::timeout(CANCEL_GRACE, &mut step).await;
                    Err(StepError::Transient(Error::TimedOut(timeout.as_secs()).to_string()))
                }
            };

            let message = match result {
                Ok(children) => return Ok(children),
                Err(StepError::Cancelled) => return Err(StepError::Cancelled),
                Err(_) if claim.token.is_cancelled() => return Err(StepError::Cancelled),
                Err(StepError::Permanent(message)) => {
                    tracing::warn!(task_id = claim.id.0, target = %claim.target, error = %message, "Task failed with non-retryable error");
                    return Err(StepError::Permanent(message));
                }
                Err(StepError::Transient(message)) => message,
            };

            let Some(delay) = backoff.next_delay() else {
                tracing::error!(
                    task_id = claim.id.0,
                    target = %claim.target,
                    attempts = backoff.attempts() + 1,
                    error = %message,
                    "Task failed after all retry attempts exhausted"
                );
                return Err(StepError::Permanent(message));
            };

            let attempt = backoff.attempts();
            tracing::warn!(
                task_id = claim.id.0,
                target = %claim.target,
                attempt,
                max_attempts = self.inner.retry.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "Task step failed, retrying"
            );
            if let Some(entry) = self.table().tasks.get_mut(&claim.id) {
                entry.info.retry_count = attempt;
            }
            self.emit(Event::TaskRetrying {
                id: claim.id,
                attempt,
                error: message,
            });

            tokio::select! {
                _ = claim.token.cancelled() => return Err(StepError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn step(
        &self,
        claim: &Claim,
        token: &CancellationToken,
    ) -> Result<Vec<ChildSpec>, StepError> {
        if token.is_cancelled() {
            return Err(StepError::Cancelled);
        }
        match claim.kind {
            TaskKind::DiscoverPosts => self.discover_posts(claim, token).await,
            TaskKind::DownloadPost => self.download_post(claim).await,
            TaskKind::DownloadFile => self.download_file(claim, token).await,
        }
    }

    /// Fetch the post list, merge it, and pick the posts to work on
    async fn discover_posts(
        &self,
        claim: &Claim,
        token: &CancellationToken,
    ) -> Result<Vec<ChildSpec>, StepError> {
        let cache = &self.inner.cache;
        let executor = &self.inner.executor;
        let artist_id = &claim.target.artist_id;
        let artist = cache.load(artist_id).await?;

        if let Job::UpdateCache { .. } = claim.tree.job {
            let profile = executor.fetch_profile(&artist).await?;
            cache.set_profile(artist_id, profile).await?;
        }

        let raw = executor.fetch_post_list(&artist, token).await?;
        let posts = raw
            .into_iter()
            .map(|record| executor.build_post(&artist, record))
            .collect();
        let report = cache.apply(artist_id, posts).await?;
        self.emit(Event::CacheUpdated {
            artist_id: artist_id.clone(),
            new_posts: report.new_posts,
            duplicates: report.discarded.len(),
        });

        let artist = cache.load(artist_id).await?;
        let post_ids: Vec<String> = match &claim.tree.job {
            Job::Check => ops::incomplete_posts(&artist)
                .into_iter()
                .map(|p| p.id.clone())
                .collect(),
            Job::Range { from, until } => ops::posts_in_range(&artist, *from, *until)
                .into_iter()
                .map(|p| p.id.clone())
                .collect(),
            Job::UpdateCache { full: true } => artist
                .posts
                .iter()
                .filter(|p| !p.detail_fetched)
                .map(|p| p.id.clone())
                .collect(),
            Job::UpdateCache { full: false } => Vec::new(),
        };

        tracing::info!(
            task_id = claim.id.0,
            artist_id = %artist_id,
            new_posts = report.new_posts,
            selected = post_ids.len(),
            "Post list discovered"
        );

        Ok(post_ids
            .into_iter()
            .map(|post_id| ChildSpec {
                kind: TaskKind::DownloadPost,
                target: TaskTarget::post(artist_id.clone(), post_id),
            })
            .collect())
    }

    /// Make sure the post has a file list and pick the files to transfer
    async fn download_post(&self, claim: &Claim) -> Result<Vec<ChildSpec>, StepError> {
        let cache = &self.inner.cache;
        let artist_id = &claim.target.artist_id;
        let post_id = claim
            .target
            .post_id
            .as_deref()
            .ok_or_else(|| StepError::Permanent("download-post task without a post id".into()))?;

        let artist = cache.load(artist_id).await?;
        let mut post = artist
            .post(post_id)
            .cloned()
            .ok_or_else(|| post_not_found(artist_id, post_id))?;

        let needs_detail = match claim.tree.job {
            Job::UpdateCache { full } => full && !post.detail_fetched,
            _ => post.files.is_empty() && !post.detail_fetched,
        };
        if needs_detail {
            let raw = self.inner.executor.fetch_post_detail(&artist, post_id).await?;
            let refs = raw.file_refs();
            let files = self.inner.executor.build_files(&artist, &post, &refs);
            post = cache
                .set_post_detail(artist_id, post_id, raw.content, files)
                .await?;
        }

        let indices: Vec<usize> = match claim.tree.job {
            Job::Check => post.pending_files().map(|(index, _)| index).collect(),
            Job::Range { .. } => (0..post.files.len()).collect(),
            Job::UpdateCache { .. } => Vec::new(),
        };

        Ok(indices
            .into_iter()
            .map(|index| ChildSpec {
                kind: TaskKind::DownloadFile,
                target: TaskTarget::file(artist_id.clone(), post_id.to_string(), index),
            })
            .collect())
    }

    /// Transfer one file and record the result in the cache
    async fn download_file(
        &self,
        claim: &Claim,
        token: &CancellationToken,
    ) -> Result<Vec<ChildSpec>, StepError> {
        let cache = &self.inner.cache;
        let artist_id = &claim.target.artist_id;
        let (Some(post_id), Some(index)) = (claim.target.post_id.as_deref(), claim.target.file_index)
        else {
            return Err(StepError::Permanent("download-file task without a file".into()));
        };

        let artist = cache.load(artist_id).await?;
        let file = artist
            .post(post_id)
            .ok_or_else(|| post_not_found(artist_id, post_id))?
            .files
            .get(index)
            .cloned()
            .ok_or_else(|| {
                StepError::from(Error::from(CacheError::FileNotFound {
                    artist_id: artist_id.to_string(),
                    post_id: post_id.to_string(),
                    index,
                }))
            })?;

        let outcome = self
            .inner
            .executor
            .fetch_file(&file, &claim.tree.download_root, token)
            .await;

        match outcome {
            FileOutcome::Transferred { bytes } => {
                cache
                    .mark_file(artist_id, post_id, index, true, Some(bytes))
                    .await?;
                self.emit(Event::FileDownloaded {
                    artist_id: artist_id.clone(),
                    post_id: post_id.to_string(),
                    file_index: index,
                    bytes,
                });
            }
            FileOutcome::SkippedExists { content_length } => {
                cache
                    .mark_file(artist_id, post_id, index, true, content_length)
                    .await?;
                self.emit(Event::FileSkipped {
                    artist_id: artist_id.clone(),
                    post_id: post_id.to_string(),
                    file_index: index,
                });
            }
            FileOutcome::Failed(reason) => {
                if let Some(length) = reason.content_length
                    && file.content_length != Some(length)
                    && let Err(e) = cache
                        .record_content_length(artist_id, post_id, index, length)
                        .await
                {
                    tracing::warn!(artist_id = %artist_id, post_id, error = %e, "Failed to cache content length");
                }
                return Err(match reason.kind {
                    crate::executor::FailureKind::Cancelled => StepError::Cancelled,
                    crate::executor::FailureKind::Transient => StepError::Transient(reason.message),
                    crate::executor::FailureKind::Permanent => StepError::Permanent(reason.message),
                });
            }
        }

        Ok(Vec::new())
    }

    /// Queue children and move to `waiting`, or return the outcome when there is nothing to wait for
    fn spawn_children(&self, claim: &Claim, children: Vec<ChildSpec>) -> Option<Outcome> {
        let mut table = self.table();
        let parent = table.tasks.get(&claim.id)?;
        if parent.cancel_requested || parent.token.is_cancelled() {
            return Some(Outcome::Cancelled);
        }
        if children.is_empty() {
            return Some(Outcome::Succeeded);
        }

        let parent_token = parent.token.clone();
        let count = children.len();
        for child in children {
            let id = self.next_id();
            let event = table.insert(
                id,
                child.kind,
                child.target,
                Some(claim.id),
                Arc::clone(&claim.tree),
                parent_token.child_token(),
            );
            self.emit(event);
        }
        if let Some(parent) = table.tasks.get_mut(&claim.id) {
            parent.info.state = TaskState::Waiting;
        }
        self.emit(Event::TaskWaiting {
            id: claim.id,
            children: count,
        });
        drop(table);

        self.inner.notify.notify_one();
        None
    }

    /// Finalize a task, running cache hooks first, and roll up through its ancestors
    pub(super) async fn settle(&self, id: TaskId, outcome: Outcome) {
        let mut next = Some((id, outcome));
        while let Some((id, outcome)) = next.take() {
            let outcome = self.before_finalize(id, outcome).await;
            next = self.table().finalize(
                id,
                outcome,
                self.inner.config.max_task_history,
                &self.inner.event_tx,
            );
        }
        self.inner.notify.notify_one();
    }

    fn hook_context(&self, id: TaskId) -> Option<HookContext> {
        let table = self.table();
        let entry = table.tasks.get(&id)?;
        let failed_children = entry
            .children
            .iter()
            .filter_map(|child| table.tasks.get(child))
            .filter(|child| child.info.state == TaskState::Failed)
            .filter_map(|child| child.info.target.file_index)
            .collect();
        Some(HookContext {
            kind: entry.info.kind,
            target: entry.info.target.clone(),
            tree: Arc::clone(&entry.tree),
            is_root: entry.info.parent.is_none(),
            failed_children,
        })
    }

    /// Cache bookkeeping that must land before the task is visible as terminal
    async fn before_finalize(&self, id: TaskId, outcome: Outcome) -> Outcome {
        let Some(ctx) = self.hook_context(id) else {
            return outcome;
        };
        let cache = &self.inner.cache;
        let artist_id = &ctx.target.artist_id;
        let downloads = ctx.tree.job.downloads();

        match (&ctx.kind, &outcome, ctx.target.post_id.as_deref()) {
            (TaskKind::DownloadPost, Outcome::Succeeded, Some(post_id)) if downloads => {
                if let Err(e) = cache.mark_post(artist_id, post_id, true).await {
                    tracing::warn!(artist_id = %artist_id, post_id, error = %e, "Could not mark post done");
                    return Outcome::Failed(e.to_string());
                }
                self.emit(Event::PostDone {
                    artist_id: artist_id.clone(),
                    post_id: post_id.to_string(),
                });
                if ctx.tree.checkpoint == CheckpointPolicy::PerPost {
                    self.advance_checkpoint(artist_id).await;
                }
            }
            (TaskKind::DownloadPost, Outcome::Failed(_), Some(post_id))
                if !ctx.failed_children.is_empty() =>
            {
                let names = match cache.load(artist_id).await {
                    Ok(artist) => artist
                        .post(post_id)
                        .map(|post| {
                            ctx.failed_children
                                .iter()
                                .filter_map(|index| post.files.get(*index))
                                .map(|file| file.name.clone())
                                .collect()
                        })
                        .unwrap_or_default(),
                    Err(_) => Vec::new(),
                };
                if let Err(e) = cache.set_failed_files(artist_id, post_id, names).await {
                    tracing::warn!(artist_id = %artist_id, post_id, error = %e, "Could not record failed files");
                }
            }
            (TaskKind::DiscoverPosts, Outcome::Succeeded | Outcome::Failed(_), _)
                if ctx.is_root && downloads && ctx.tree.checkpoint == CheckpointPolicy::PerArtist =>
            {
                self.advance_checkpoint(artist_id).await;
            }
            _ => {}
        }

        if ctx.is_root {
            match &outcome {
                Outcome::Failed(reason) => {
                    tracing::warn!(task_id = id.0, artist_id = %artist_id, origin = %ctx.tree.origin, reason = %reason, "Task tree failed")
                }
                _ => tracing::info!(
                    task_id = id.0,
                    artist_id = %artist_id,
                    origin = %ctx.tree.origin,
                    outcome = ?outcome,
                    "Task tree finished"
                ),
            }
        }

        outcome
    }

    async fn advance_checkpoint(&self, artist_id: &ArtistId) {
        match self.inner.cache.advance_checkpoint(artist_id).await {
            Ok(Some(last_date)) => self.emit(Event::CheckpointAdvanced {
                artist_id: artist_id.clone(),
                last_date,
            }),
            Ok(None) => {}
            Err(e) => {
                tracing::error!(artist_id = %artist_id, error = %e, "Failed to persist checkpoint")
            }
        }
    }
}

fn post_not_found(artist_id: &ArtistId, post_id: &str) -> StepError {
    StepError::from(Error::from(CacheError::PostNotFound {
        artist_id: artist_id.to_string(),
        post_id: post_id.to_string(),
    }))
}
