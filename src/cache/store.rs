//! On-disk layout of the data directory.
//!
//! ```text
//! data_dir/
//! ├── artists/{artist_id}.json
//! ├── overrides.json
//! └── ignore.txt
//! ```
//!
//! Every write goes to a sibling `.tmp` file first and is renamed over the
//! target, so readers only ever see a complete artifact. Leftover `.tmp` files
//! from a killed write are never read.

use super::models::{Artist, ArtistOverrides};
use crate::error::{CacheError, Result};
use crate::types::ArtistId;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const ARTISTS_DIR: &str = "artists";
const OVERRIDES_FILE: &str = "overrides.json";
const IGNORE_FILE: &str = "ignore.txt";

/// Outcome of reading one artist artifact during a scan
#[derive(Debug)]
pub enum ScanEntry {
    /// Artifact parsed
    Loaded(Box<Artist>),
    /// Artifact exists but is unreadable
    Corrupt {
        /// Id derived from the file name
        id: ArtistId,
        /// Read or parse failure
        reason: String,
    },
}

/// File-level access to the data directory
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Use `root` as the data directory, creating it when missing
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join(ARTISTS_DIR)).await?;
        Ok(Self { root })
    }

    /// Data directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of an artist's artifact; ids that could escape `artists/` are rejected
    pub fn artist_path(&self, id: &ArtistId) -> Result<PathBuf> {
        if !id.is_safe() {
            return Err(CacheError::InvalidId {
                artist_id: id.to_string(),
            }
            .into());
        }
        Ok(self.root.join(ARTISTS_DIR).join(format!("{}.json", id)))
    }

    /// Read every artist artifact
    pub async fn scan(&self) -> Result<Vec<ScanEntry>> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(self.root.join(ARTISTS_DIR)).await?;

        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let id = ArtistId::from(stem);
            if !id.is_safe() {
                tracing::warn!(path = %path.display(), "Skipping artifact with an invalid artist id");
                continue;
            }

            match self.read_artist(&id).await {
                Ok(artist) => entries.push(ScanEntry::Loaded(Box::new(artist))),
                Err(crate::Error::Cache(CacheError::Corrupt { reason, .. })) => {
                    entries.push(ScanEntry::Corrupt { id, reason })
                }
                Err(e) => return Err(e),
            }
        }

        Ok(entries)
    }

    /// Read one artist artifact
    pub async fn read_artist(&self, id: &ArtistId) -> Result<Artist> {
        let path = self.artist_path(id)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CacheError::ArtistNotFound {
                    artist_id: id.to_string(),
                }
                .into());
            }
            Err(e) => {
                return Err(CacheError::Corrupt {
                    artist_id: id.to_string(),
                    reason: e.to_string(),
                }
                .into());
            }
        };

        let artist: Artist = serde_json::from_slice(&bytes).map_err(|e| CacheError::Corrupt {
            artist_id: id.to_string(),
            reason: e.to_string(),
        })?;

        if &artist.id != id {
            return Err(CacheError::Corrupt {
                artist_id: id.to_string(),
                reason: format!("artifact records id {}", artist.id),
            }
            .into());
        }

        Ok(artist)
    }

    /// Atomically replace an artist's artifact
    pub async fn write_artist(&self, artist: &Artist) -> Result<()> {
        write_atomic(&self.artist_path(&artist.id)?, artist).await
    }

    /// Delete an artist's artifact (downloaded files are left alone)
    pub async fn delete_artist(&self, id: &ArtistId) -> Result<()> {
        match tokio::fs::remove_file(self.artist_path(id)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Read `overrides.json`; a missing file means no overrides
    pub async fn read_overrides(&self) -> Result<HashMap<ArtistId, ArtistOverrides>> {
        match tokio::fs::read(self.root.join(OVERRIDES_FILE)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically replace `overrides.json`
    pub async fn write_overrides(
        &self,
        overrides: &HashMap<ArtistId, ArtistOverrides>,
    ) -> Result<()> {
        write_atomic(&self.root.join(OVERRIDES_FILE), overrides).await
    }

    /// Read `ignore.txt`, one entry per line, `#` comments skipped
    pub async fn read_ignore_list(&self) -> Result<Vec<String>> {
        match tokio::fs::read_to_string(self.root.join(IGNORE_FILE)).await {
            Ok(text) => Ok(text
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(str::to_string)
                .collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Serialize `value` to `path` via a temporary sibling and a rename
async fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    let tmp_path = path.with_extension("json.tmp");

    if let Err(e) = tokio::fs::write(&tmp_path, &json).await {
        tracing::error!(path = %tmp_path.display(), error = %e, "Failed to write artifact");
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e.into());
    }

    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        tracing::error!(path = %path.display(), error = %e, "Failed to replace artifact");
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e.into());
    }

    Ok(())
}
