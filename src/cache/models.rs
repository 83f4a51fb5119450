//! Persisted artist artifact and the summaries derived from it.

use crate::config::CheckpointPolicy;
use crate::timer::CheckTimer;
use crate::types::{ArtistId, ArtistStatus};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use utoipa::ToSchema;

/// One artist's durable record, stored as `artists/{id}.json`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Artist {
    /// `{service}_{user_id}`
    pub id: ArtistId,

    /// Platform service (fanbox, patreon, ...)
    pub service: String,

    /// Platform user id
    pub user_id: String,

    /// Display name
    pub name: String,

    /// Optional user-chosen alias, shown instead of the name
    #[serde(default)]
    pub alias: Option<String>,

    /// Source URL of the artist page
    pub url: String,

    /// Posts published on or before this date are presumed accounted for
    #[serde(default)]
    pub last_date: Option<NaiveDateTime>,

    /// Lifecycle status
    #[serde(default)]
    pub status: ArtistStatus,

    /// Profile data from the last cache update
    #[serde(default)]
    pub profile: Option<Profile>,

    /// Posts in the order they were first seen
    #[serde(default)]
    pub posts: Vec<Post>,
}

impl Artist {
    /// Create an empty record
    pub fn new(service: &str, user_id: &str, name: &str, url: &str) -> Self {
        Self {
            id: ArtistId::new(service, user_id),
            service: service.to_string(),
            user_id: user_id.to_string(),
            name: name.to_string(),
            alias: None,
            url: url.to_string(),
            last_date: None,
            status: ArtistStatus::Active,
            profile: None,
            posts: Vec::new(),
        }
    }

    /// Alias if set, otherwise the name
    pub fn display_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    /// Find a post by id
    pub fn post(&self, post_id: &str) -> Option<&Post> {
        self.posts.iter().find(|p| p.id == post_id)
    }

    /// Find a post by id, mutably
    pub fn post_mut(&mut self, post_id: &str) -> Option<&mut Post> {
        self.posts.iter_mut().find(|p| p.id == post_id)
    }

    /// Summary for `list`
    pub fn summary(&self) -> ArtistSummary {
        ArtistSummary {
            id: self.id.clone(),
            service: self.service.clone(),
            name: self.name.clone(),
            alias: self.alias.clone(),
            status: self.status,
            last_date: self.last_date,
            posts_total: self.posts.len(),
            posts_done: self.posts.iter().filter(|p| p.done).count(),
        }
    }
}

/// Platform profile snapshot
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Profile {
    /// Name on the platform
    pub name: String,

    /// Number of posts the platform reports
    #[serde(default)]
    pub post_count: u64,

    /// Platform's last update timestamp, verbatim
    #[serde(default)]
    pub updated: Option<String>,

    /// When this snapshot was taken
    pub cached_at: DateTime<Utc>,
}

/// A post and its files
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Post {
    /// Platform post id (unique within an artist after dedup)
    pub id: String,

    /// Title
    #[serde(default)]
    pub title: String,

    /// Publication date
    pub published: NaiveDateTime,

    /// All files downloaded (or checkpoint-presumed)
    #[serde(default)]
    pub done: bool,

    /// Text body, when the full record was fetched
    #[serde(default)]
    pub content: Option<String>,

    /// Full post record was fetched
    #[serde(default)]
    pub detail_fetched: bool,

    /// Names of files that failed on the last attempt
    #[serde(default)]
    pub failed_files: Vec<String>,

    /// Files in platform order
    #[serde(default)]
    pub files: Vec<PostFile>,
}

impl Post {
    /// Files not yet downloaded, with their index
    pub fn pending_files(&self) -> impl Iterator<Item = (usize, &PostFile)> {
        self.files.iter().enumerate().filter(|(_, f)| !f.downloaded)
    }
}

/// A file belonging to a post
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PostFile {
    /// Display name
    pub name: String,

    /// Target path relative to the download root
    pub path: PathBuf,

    /// Source URL
    pub url: String,

    /// Length learned from a previous transfer or a length check
    #[serde(default)]
    pub content_length: Option<u64>,

    /// Local object exists and matches `content_length` when known
    #[serde(default)]
    pub downloaded: bool,
}

/// Per-artist configuration overrides, stored together in `overrides.json`
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ArtistOverrides {
    /// Cap on download-file tasks running at once for this artist
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_files: Option<usize>,

    /// Checkpoint granularity for this artist
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<String>)]
    pub checkpoint: Option<CheckpointPolicy>,

    /// Download root for this artist
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<String>)]
    pub download_dir: Option<PathBuf>,

    /// Timed checks for this artist, replacing `scheduler.global_timer`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timer: Option<CheckTimer>,
}

/// Row of the `list` command
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ArtistSummary {
    /// Artist id
    pub id: ArtistId,
    /// Platform service
    pub service: String,
    /// Display name
    pub name: String,
    /// Alias
    pub alias: Option<String>,
    /// Lifecycle status
    pub status: ArtistStatus,
    /// Checkpoint
    pub last_date: Option<NaiveDateTime>,
    /// Posts in the cache
    pub posts_total: usize,
    /// Posts marked done
    pub posts_done: usize,
}

/// Artist excluded from bulk operations because its artifact is unreadable
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct QuarantinedArtist {
    /// Artist id
    pub id: ArtistId,
    /// Read or parse failure
    pub reason: String,
}

/// Result of merging a fetched post list
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct DedupReport {
    /// Posts inserted
    pub new_posts: usize,
    /// New posts inserted as done because they predate the checkpoint
    pub presumed_done: usize,
    /// Posts already in the cache (state kept)
    pub known_posts: usize,
    /// Ids of discarded duplicate records
    pub discarded: Vec<String>,
}
