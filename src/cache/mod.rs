//! Resumable per-artist cache.
//!
//! The cache is the single source of resumability truth: which posts are done
//! and which files are downloaded. All artifacts are loaded at startup and kept
//! in memory; every mutation runs under the artist's writer lock, is applied to
//! a copy, persisted atomically, and only then becomes visible.
//!
//! Artifacts that fail to parse at startup quarantine their artist. A
//! quarantined artist rejects every operation except `create` (re-add) and
//! `remove`, and bulk commands report it instead of touching it.

mod models;
pub mod ops;
mod store;

pub use models::{
    Artist, ArtistOverrides, ArtistSummary, DedupReport, Post, PostFile, Profile,
    QuarantinedArtist,
};
pub use store::{ArtifactStore, ScanEntry};

use crate::error::{CacheError, Error, Result};
use crate::types::{ArtistId, ArtistStatus};
use chrono::NaiveDateTime;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;

/// Shared handle to one artist's in-memory record; the mutex is the writer lock
type Entry = Arc<Mutex<Artist>>;

/// Durable per-artist record of posts, files and completion state
#[derive(Debug)]
pub struct ArtistCache {
    store: ArtifactStore,
    entries: RwLock<HashMap<ArtistId, Entry>>,
    quarantined: RwLock<HashMap<ArtistId, String>>,
    overrides: Mutex<HashMap<ArtistId, ArtistOverrides>>,
    ignore_list: Vec<String>,
}

impl ArtistCache {
    /// Load every artifact under `data_dir`
    pub async fn open(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let store = ArtifactStore::open(data_dir).await?;

        let mut entries = HashMap::new();
        let mut quarantined = HashMap::new();
        for entry in store.scan().await? {
            match entry {
                ScanEntry::Loaded(artist) => {
                    entries.insert(artist.id.clone(), Arc::new(Mutex::new(*artist)));
                }
                ScanEntry::Corrupt { id, reason } => {
                    tracing::warn!(artist_id = %id, reason = %reason, "Quarantining unreadable artist artifact");
                    quarantined.insert(id, reason);
                }
            }
        }

        let overrides = store.read_overrides().await?;
        let ignore_list = store.read_ignore_list().await?;

        tracing::info!(
            artists = entries.len(),
            quarantined = quarantined.len(),
            data_dir = %store.root().display(),
            "Artist cache opened"
        );

        Ok(Self {
            store,
            entries: RwLock::new(entries),
            quarantined: RwLock::new(quarantined),
            overrides: Mutex::new(overrides),
            ignore_list,
        })
    }

    fn entry(&self, id: &ArtistId) -> Result<Entry> {
        if let Some(reason) = self.quarantine_reason(id) {
            tracing::debug!(artist_id = %id, reason = %reason, "Rejecting quarantined artist");
            return Err(CacheError::Quarantined {
                artist_id: id.to_string(),
            }
            .into());
        }
        let entries = self
            .entries
            .read()
            .map_err(|_| Error::Other("artist cache lock poisoned".into()))?;
        entries.get(id).cloned().ok_or_else(|| {
            CacheError::ArtistNotFound {
                artist_id: id.to_string(),
            }
            .into()
        })
    }

    fn is_current(&self, id: &ArtistId, entry: &Entry) -> bool {
        self.entries
            .read()
            .is_ok_and(|entries| entries.get(id).is_some_and(|e| Arc::ptr_eq(e, entry)))
    }

    /// Run `f` on a copy of the artist under its writer lock, persist, then publish
    async fn mutate<R>(&self, id: &ArtistId, f: impl FnOnce(&mut Artist) -> Result<R>) -> Result<R> {
        let entry = self.entry(id)?;
        let mut guard = entry.lock().await;
        // `remove` may have run while this writer waited for the lock
        if !self.is_current(id, &entry) {
            return Err(CacheError::ArtistNotFound {
                artist_id: id.to_string(),
            }
            .into());
        }

        let mut draft = guard.clone();
        let result = f(&mut draft)?;
        if draft != *guard {
            self.store.write_artist(&draft).await?;
            *guard = draft;
        }
        Ok(result)
    }

    /// Register a new artist; re-adding a quarantined artist replaces its artifact
    pub async fn create(&self, artist: Artist) -> Result<ArtistSummary> {
        let id = artist.id.clone();
        let was_quarantined = self.quarantine_reason(&id).is_some();

        if !was_quarantined && self.entry(&id).is_ok() {
            return Err(CacheError::AlreadyExists {
                artist_id: id.to_string(),
            }
            .into());
        }

        self.store.write_artist(&artist).await?;
        let summary = artist.summary();
        {
            let mut entries = self
                .entries
                .write()
                .map_err(|_| Error::Other("artist cache lock poisoned".into()))?;
            entries.insert(id.clone(), Arc::new(Mutex::new(artist)));
        }
        if was_quarantined {
            self.clear_quarantine(&id);
        }

        tracing::info!(artist_id = %id, "Artist added");
        Ok(summary)
    }

    /// Forget an artist (downloaded files stay on disk)
    pub async fn remove(&self, id: &ArtistId) -> Result<()> {
        let was_quarantined = self.quarantine_reason(id).is_some();
        let entry = if was_quarantined {
            None
        } else {
            Some(self.entry(id)?)
        };

        // Wait for any in-flight writer before deleting
        let _guard = match &entry {
            Some(entry) => Some(entry.lock().await),
            None => None,
        };
        self.store.delete_artist(id).await?;

        if let Ok(mut entries) = self.entries.write() {
            entries.remove(id);
        }
        self.clear_quarantine(id);

        let mut overrides = self.overrides.lock().await;
        if overrides.remove(id).is_some() {
            self.store.write_overrides(&overrides).await?;
        }

        tracing::info!(artist_id = %id, "Artist removed");
        Ok(())
    }

    /// Snapshot of one artist
    pub async fn load(&self, id: &ArtistId) -> Result<Artist> {
        let entry = self.entry(id)?;
        let artist = entry.lock().await.clone();
        Ok(artist)
    }

    /// Ids of every readable artist
    pub fn artist_ids(&self) -> Vec<ArtistId> {
        let mut ids: Vec<ArtistId> = self
            .entries
            .read()
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Summaries of every readable artist
    pub async fn list(&self) -> Vec<ArtistSummary> {
        let entries: Vec<Entry> = self
            .entries
            .read()
            .map(|entries| entries.values().cloned().collect())
            .unwrap_or_default();

        let mut summaries = Vec::with_capacity(entries.len());
        for entry in entries {
            summaries.push(entry.lock().await.summary());
        }
        summaries
    }

    /// Artists excluded because their artifact could not be read
    pub fn quarantined(&self) -> Vec<QuarantinedArtist> {
        let mut list: Vec<QuarantinedArtist> = self
            .quarantined
            .read()
            .map(|q| {
                q.iter()
                    .map(|(id, reason)| QuarantinedArtist {
                        id: id.clone(),
                        reason: reason.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    /// Why an artist is quarantined, if it is
    pub fn quarantine_reason(&self, id: &ArtistId) -> Option<String> {
        self.quarantined.read().ok()?.get(id).cloned()
    }

    fn clear_quarantine(&self, id: &ArtistId) {
        if let Ok(mut q) = self.quarantined.write() {
            q.remove(id);
        }
    }

    /// Change lifecycle status
    pub async fn set_status(&self, id: &ArtistId, status: ArtistStatus) -> Result<ArtistSummary> {
        self.mutate(id, |artist| {
            artist.status = status;
            Ok(artist.summary())
        })
        .await
    }

    /// Store a profile snapshot; adopts the platform name when none was given
    pub async fn set_profile(&self, id: &ArtistId, profile: Profile) -> Result<()> {
        self.mutate(id, |artist| {
            if artist.name == artist.user_id && !profile.name.is_empty() {
                artist.name = profile.name.clone();
            }
            artist.profile = Some(profile);
            Ok(())
        })
        .await
    }

    /// Merge a fetched post list (dedup on ingest, checkpoint rule for new posts)
    pub async fn apply(&self, id: &ArtistId, posts: Vec<Post>) -> Result<DedupReport> {
        let report = self
            .mutate(id, |artist| Ok(ops::merge_posts(artist, posts)))
            .await?;

        for post_id in &report.discarded {
            tracing::warn!(artist_id = %id, post_id = %post_id, "Discarded duplicate post record");
        }
        if report.new_posts > 0 {
            tracing::info!(
                artist_id = %id,
                new_posts = report.new_posts,
                presumed_done = report.presumed_done,
                "New posts cached"
            );
        }
        Ok(report)
    }

    /// Record a full post record fetched from the platform
    ///
    /// The file list is only adopted while no file of the post has been
    /// downloaded yet, so indices of in-progress files never shift.
    pub async fn set_post_detail(
        &self,
        id: &ArtistId,
        post_id: &str,
        content: Option<String>,
        files: Vec<PostFile>,
    ) -> Result<Post> {
        self.mutate(id, |artist| {
            let post = find_post(artist, post_id)?;
            if !post.files.iter().any(|f| f.downloaded) && !files.is_empty() {
                post.files = files;
            }
            post.content = content;
            post.detail_fetched = true;
            Ok(post.clone())
        })
        .await
    }

    /// Set a file's `downloaded` flag and remember its length
    pub async fn mark_file(
        &self,
        id: &ArtistId,
        post_id: &str,
        index: usize,
        downloaded: bool,
        content_length: Option<u64>,
    ) -> Result<()> {
        self.mutate(id, |artist| {
            let post = find_post(artist, post_id)?;
            let file = post
                .files
                .get_mut(index)
                .ok_or_else(|| CacheError::FileNotFound {
                    artist_id: id.to_string(),
                    post_id: post_id.to_string(),
                    index,
                })?;
            file.downloaded = downloaded;
            if content_length.is_some() {
                file.content_length = content_length;
            }
            if !downloaded {
                post.done = false;
            }
            Ok(())
        })
        .await
    }

    /// Remember a file's length without changing its state
    pub async fn record_content_length(
        &self,
        id: &ArtistId,
        post_id: &str,
        index: usize,
        content_length: u64,
    ) -> Result<()> {
        self.mutate(id, |artist| {
            let file = find_post(artist, post_id)?
                .files
                .get_mut(index)
                .ok_or_else(|| CacheError::FileNotFound {
                    artist_id: id.to_string(),
                    post_id: post_id.to_string(),
                    index,
                })?;
            file.content_length = Some(content_length);
            Ok(())
        })
        .await
    }

    /// Set a post's `done` flag; done requires every file downloaded
    pub async fn mark_post(&self, id: &ArtistId, post_id: &str, done: bool) -> Result<()> {
        self.mutate(id, |artist| {
            let post = find_post(artist, post_id)?;
            if done {
                let remaining = post.files.iter().filter(|f| !f.downloaded).count();
                if remaining > 0 {
                    return Err(CacheError::IncompletePost {
                        artist_id: id.to_string(),
                        post_id: post_id.to_string(),
                        remaining,
                    }
                    .into());
                }
                post.failed_files.clear();
            }
            post.done = done;
            Ok(())
        })
        .await
    }

    /// Record which files failed on the last attempt at a post
    pub async fn set_failed_files(
        &self,
        id: &ArtistId,
        post_id: &str,
        failed: Vec<String>,
    ) -> Result<()> {
        self.mutate(id, |artist| {
            find_post(artist, post_id)?.failed_files = failed;
            Ok(())
        })
        .await
    }

    /// Clear `done` on posts published on or after `cutoff` (all when `None`)
    pub async fn reset(&self, id: &ArtistId, cutoff: Option<NaiveDateTime>) -> Result<usize> {
        let count = self
            .mutate(id, |artist| Ok(ops::reset_posts(artist, cutoff)))
            .await?;
        tracing::info!(artist_id = %id, cutoff = ?cutoff, posts_reset = count, "Artist cache reset");
        Ok(count)
    }

    /// Remove duplicate posts, keeping the first occurrence
    pub async fn dedupe(&self, id: &ArtistId) -> Result<usize> {
        let removed = self
            .mutate(id, |artist| Ok(ops::dedupe_posts(artist)))
            .await?;
        for post_id in &removed {
            tracing::warn!(artist_id = %id, post_id = %post_id, "Removed duplicate cached post");
        }
        Ok(removed.len())
    }

    /// Posts that still need work, oldest first
    pub async fn incomplete(&self, id: &ArtistId) -> Result<Vec<Post>> {
        let artist = self.load(id).await?;
        Ok(ops::incomplete_posts(&artist).into_iter().cloned().collect())
    }

    /// Move `last_date` past the unbroken run of done posts; returns the new value if it moved
    pub async fn advance_checkpoint(&self, id: &ArtistId) -> Result<Option<NaiveDateTime>> {
        let moved = self
            .mutate(id, |artist| {
                let next = ops::next_checkpoint(artist);
                if next.is_some() {
                    artist.last_date = next;
                }
                Ok(next)
            })
            .await?;
        if let Some(date) = moved {
            tracing::info!(artist_id = %id, last_date = %date, "Checkpoint advanced");
        }
        Ok(moved)
    }

    /// Per-artist configuration overrides
    pub async fn overrides(&self, id: &ArtistId) -> ArtistOverrides {
        self.overrides
            .lock()
            .await
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    /// Replace an artist's overrides and persist `overrides.json`
    pub async fn set_overrides(&self, id: &ArtistId, overrides: ArtistOverrides) -> Result<()> {
        let mut all = self.overrides.lock().await;
        let mut draft = all.clone();
        if overrides == ArtistOverrides::default() {
            draft.remove(id);
        } else {
            draft.insert(id.clone(), overrides);
        }
        self.store.write_overrides(&draft).await?;
        *all = draft;
        Ok(())
    }

    /// Path-validation exclusions from `ignore.txt`
    pub fn ignore_list(&self) -> &[String] {
        &self.ignore_list
    }
}

fn find_post<'a>(artist: &'a mut Artist, post_id: &str) -> Result<&'a mut Post> {
    let artist_id = artist.id.to_string();
    artist.post_mut(post_id).ok_or_else(|| {
        CacheError::PostNotFound {
            artist_id,
            post_id: post_id.to_string(),
        }
        .into()
    })
}
