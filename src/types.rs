//! Core types for creator-dl

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Identifier of an artist in the cache, `{service}_{user_id}`
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct ArtistId(pub String);

impl ArtistId {
    /// Build the id from its service and platform user id
    pub fn new(service: &str, user_id: &str) -> Self {
        Self(format!("{}_{}", service, user_id))
    }

    /// Get the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id can name a file inside the artists directory
    pub fn is_safe(&self) -> bool {
        is_safe_id_part(&self.0)
    }
}

/// Whether `part` is usable as a service, user id or artist id
///
/// Only ASCII letters, digits, `.`, `_` and `-` are accepted, and the value
/// must not start with a dot.
pub fn is_safe_id_part(part: &str) -> bool {
    !part.is_empty()
        && !part.starts_with('.')
        && part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

impl From<&str> for ArtistId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ArtistId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for ArtistId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier for a scheduled task
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl TaskId {
    /// Get the inner u64 value
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl From<u64> for TaskId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Identifier of an attached front-end session
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of an artist
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ArtistStatus {
    /// Checked by bulk operations
    #[default]
    Active,
    /// Skipped by bulk operations
    Ignored,
    /// Finished, no further checks expected
    Completed,
}

impl ArtistStatus {
    /// Sort rank used by `list:sort_by=status`
    pub fn rank(&self) -> u8 {
        match self {
            ArtistStatus::Active => 0,
            ArtistStatus::Ignored => 1,
            ArtistStatus::Completed => 2,
        }
    }
}

/// Kind of schedulable work
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Fetch the artist's post list and merge it into the cache
    DiscoverPosts,
    /// Resolve one post's files (fetching its detail when needed)
    DownloadPost,
    /// Transfer one file
    DownloadFile,
}

/// State of a task
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Waiting for a worker (and for its parent's step to finish)
    Queued,
    /// Executing on a worker
    Running,
    /// Own step done, waiting for children to finish
    Waiting,
    /// Finished successfully
    Succeeded,
    /// Finished with an error
    Failed,
    /// Stopped on request
    Cancelled,
}

impl TaskState {
    /// Terminal states never change again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Waiting => "waiting",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// What a task operates on
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TaskTarget {
    /// Owning artist
    pub artist_id: ArtistId,

    /// Post id (download-post and download-file tasks)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_id: Option<String>,

    /// File index within the post (download-file tasks)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_index: Option<usize>,
}

impl TaskTarget {
    /// Target a whole artist
    pub fn artist(artist_id: ArtistId) -> Self {
        Self {
            artist_id,
            post_id: None,
            file_index: None,
        }
    }

    /// Target one post of an artist
    pub fn post(artist_id: ArtistId, post_id: String) -> Self {
        Self {
            artist_id,
            post_id: Some(post_id),
            file_index: None,
        }
    }

    /// Target one file of a post
    pub fn file(artist_id: ArtistId, post_id: String, file_index: usize) -> Self {
        Self {
            artist_id,
            post_id: Some(post_id),
            file_index: Some(file_index),
        }
    }
}

impl std::fmt::Display for TaskTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.artist_id)?;
        if let Some(post_id) = &self.post_id {
            write!(f, "/{}", post_id)?;
        }
        if let Some(index) = self.file_index {
            write!(f, "#{}", index)?;
        }
        Ok(())
    }
}

/// Snapshot of a task for `tasks` queries
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct TaskInfo {
    /// Unique task identifier
    pub id: TaskId,

    /// Kind of work
    pub kind: TaskKind,

    /// What the task operates on
    pub target: TaskTarget,

    /// Command that created the task tree (e.g. "check", "update-cache-full")
    pub origin: String,

    /// Current state
    pub state: TaskState,

    /// Number of retries performed so far
    pub retry_count: u32,

    /// Parent task (None for the root discover-posts task)
    pub parent: Option<TaskId>,

    /// Why the task failed or was cancelled
    pub failure: Option<String>,

    /// When the task was created
    pub created_at: DateTime<Utc>,

    /// When a worker first picked the task up
    pub started_at: Option<DateTime<Utc>>,

    /// When the task reached a terminal state
    pub finished_at: Option<DateTime<Utc>>,
}

/// Handle returned for a queued task tree
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TaskHandle {
    /// Root task id
    pub id: TaskId,

    /// Artist the tree works on
    pub artist_id: ArtistId,
}

/// Event broadcast to every attached session
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Task created and queued
    TaskQueued {
        /// Task ID
        id: TaskId,
        /// Parent task, if any
        parent: Option<TaskId>,
        /// Kind of work
        kind: TaskKind,
        /// What the task operates on
        target: TaskTarget,
    },

    /// Worker picked the task up
    TaskStarted {
        /// Task ID
        id: TaskId,
    },

    /// Attempt failed with a transient error and will be retried
    TaskRetrying {
        /// Task ID
        id: TaskId,
        /// Retry number (1-based)
        attempt: u32,
        /// Error from the failed attempt
        error: String,
    },

    /// Own step done, children queued
    TaskWaiting {
        /// Task ID
        id: TaskId,
        /// Number of children
        children: usize,
    },

    /// Task finished successfully
    TaskSucceeded {
        /// Task ID
        id: TaskId,
    },

    /// Task failed
    TaskFailed {
        /// Task ID
        id: TaskId,
        /// Failure reason
        error: String,
    },

    /// Task cancelled
    TaskCancelled {
        /// Task ID
        id: TaskId,
    },

    /// File transferred to its target path
    FileDownloaded {
        /// Owning artist
        artist_id: ArtistId,
        /// Owning post
        post_id: String,
        /// File index within the post
        file_index: usize,
        /// Bytes received
        bytes: u64,
    },

    /// File already present with the expected size
    FileSkipped {
        /// Owning artist
        artist_id: ArtistId,
        /// Owning post
        post_id: String,
        /// File index within the post
        file_index: usize,
    },

    /// Every file of a post is downloaded
    PostDone {
        /// Owning artist
        artist_id: ArtistId,
        /// The post
        post_id: String,
    },

    /// Fresh post list merged into the cache
    CacheUpdated {
        /// The artist
        artist_id: ArtistId,
        /// Posts inserted by this merge
        new_posts: usize,
        /// Duplicate records discarded
        duplicates: usize,
    },

    /// `last_date` checkpoint moved forward
    CheckpointAdvanced {
        /// The artist
        artist_id: ArtistId,
        /// New checkpoint
        last_date: NaiveDateTime,
    },

    /// Artist added to the cache
    ArtistAdded {
        /// The artist
        artist_id: ArtistId,
    },

    /// Artist removed from the cache
    ArtistRemoved {
        /// The artist
        artist_id: ArtistId,
    },

    /// Artist status changed (ignore, complete, ...)
    ArtistStatusChanged {
        /// The artist
        artist_id: ArtistId,
        /// New status
        status: ArtistStatus,
    },

    /// Posts reset for re-evaluation
    CacheReset {
        /// The artist
        artist_id: ArtistId,
        /// Number of posts whose `done` flag was cleared
        posts_reset: usize,
    },

    /// Duplicate posts removed from an artist's cache
    CacheDeduped {
        /// The artist
        artist_id: ArtistId,
        /// Number of records removed
        removed: usize,
    },

    /// Proxy pool replaced from a fresh subscription conversion
    ProxyPoolRefreshed {
        /// New pool generation
        generation: u64,
        /// Usable endpoints in the new generation
        endpoints: usize,
    },

    /// Proxy endpoint health changed
    ProxyHealthChanged {
        /// Endpoint address
        address: String,
        /// New health state
        health: String,
    },

    /// Front-end session attached
    SessionAttached {
        /// Session ID
        session: SessionId,
    },

    /// Front-end session detached
    SessionDetached {
        /// Session ID
        session: SessionId,
    },

    /// Graceful shutdown initiated
    Shutdown,
}
