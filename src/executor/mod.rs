//! Single units of network work: post listings, post details, profiles, and
//! file transfers.
//!
//! Every call acquires a proxy from the [`ProxyPool`] and reports the result
//! back to it. File transfers never return an error: [`fetch_file`] converts
//! every failure into a [`FileOutcome::Failed`] with a classification, so the
//! scheduler handles retry the same way for every kind of failure.
//!
//! [`fetch_file`]: DownloadExecutor::fetch_file

mod layout;

pub use layout::{DefaultLayout, PathLayout, sanitize};

use crate::cache::{Artist, Post, PostFile, Profile};
use crate::client::{FileStream, PlatformClient, RawPost};
use crate::error::{Error, Result};
use crate::proxy::{ProxyPool, ProxySelection};
use crate::retry::IsRetryable;
use chrono::Utc;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

/// How a failed transfer should be treated
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    /// Worth another attempt (timeouts, 429/5xx, truncated bodies)
    Transient,
    /// Retrying will not help
    Permanent,
    /// Stopped at a cancellation checkpoint
    Cancelled,
}

/// Why a transfer failed
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FailureReason {
    /// Error message
    pub message: String,
    /// Classification for the retry policy
    pub kind: FailureKind,
    /// Length advertised by the server before the failure, if any
    pub content_length: Option<u64>,
}

impl FailureReason {
    /// Whether the scheduler should retry
    pub fn is_retryable(&self) -> bool {
        self.kind == FailureKind::Transient
    }
}

/// Result of [`DownloadExecutor::fetch_file`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileOutcome {
    /// Body streamed and moved into place
    Transferred {
        /// Bytes written
        bytes: u64,
    },
    /// Local object already has the expected size
    SkippedExists {
        /// Length the decision was based on
        content_length: Option<u64>,
    },
    /// Transfer did not complete
    Failed(FailureReason),
}

impl FileOutcome {
    /// Content length learned while handling the file
    pub fn content_length(&self) -> Option<u64> {
        match self {
            FileOutcome::Transferred { bytes } => Some(*bytes),
            FileOutcome::SkippedExists { content_length } => *content_length,
            FileOutcome::Failed(reason) => reason.content_length,
        }
    }

    fn failed(error: &Error, content_length: Option<u64>) -> Self {
        let kind = match error {
            Error::Cancelled => FailureKind::Cancelled,
            e if e.is_retryable() => FailureKind::Transient,
            _ => FailureKind::Permanent,
        };
        FileOutcome::Failed(FailureReason {
            message: error.to_string(),
            kind,
            content_length,
        })
    }
}

/// Performs network I/O on behalf of scheduler tasks
pub struct DownloadExecutor {
    client: Arc<dyn PlatformClient>,
    proxies: Arc<ProxyPool>,
    layout: Arc<dyn PathLayout>,
    download_dir: PathBuf,
    /// Last pool generation whose address set was pushed to the client
    seen_generation: AtomicU64,
}

impl std::fmt::Debug for DownloadExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadExecutor")
            .field("download_dir", &self.download_dir)
            .finish_non_exhaustive()
    }
}

impl DownloadExecutor {
    /// Create an executor writing under `download_dir`
    pub fn new(
        client: Arc<dyn PlatformClient>,
        proxies: Arc<ProxyPool>,
        layout: Arc<dyn PathLayout>,
        download_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            client,
            proxies,
            layout,
            download_dir: download_dir.into(),
            seen_generation: AtomicU64::new(0),
        }
    }

    /// Default download root
    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// Run one request through a freshly acquired proxy and report the result
    async fn through_proxy<T, F, Fut>(&self, request: F) -> Result<T>
    where
        F: FnOnce(ProxySelection) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let selection = self.acquire()?;
        let result = request(selection.clone()).await;
        self.report(&selection, &result);
        result
    }

    /// Acquire a proxy; the first lease of a new generation prunes clients of replaced endpoints
    fn acquire(&self) -> Result<ProxySelection> {
        let selection = self.proxies.acquire()?;
        if let ProxySelection::Proxy { generation, .. } = &selection
            && self.seen_generation.fetch_max(*generation, Ordering::AcqRel) < *generation
        {
            self.client.retain_proxies(&self.proxies.addresses());
        }
        Ok(selection)
    }

    fn report<T>(&self, selection: &ProxySelection, result: &Result<T>) {
        match result {
            Ok(_) => self.proxies.report(selection, true),
            Err(Error::Cancelled) => {}
            // A 404 or a parse error still means the proxy delivered a response
            Err(e) => self.proxies.report(selection, !e.is_retryable()),
        }
    }

    /// Fetch the artist's profile
    pub async fn fetch_profile(&self, artist: &Artist) -> Result<Profile> {
        let raw = self
            .through_proxy(|proxy| async move {
                self.client
                    .fetch_profile(&artist.service, &artist.user_id, &proxy)
                    .await
            })
            .await?;

        Ok(Profile {
            name: raw.name,
            post_count: raw.post_count,
            updated: raw.updated,
            cached_at: Utc::now(),
        })
    }

    /// Fetch every listing page for the artist
    ///
    /// Paging stops at the first page shorter than the page size. Cancellation
    /// is checked between pages.
    pub async fn fetch_post_list(
        &self,
        artist: &Artist,
        token: &CancellationToken,
    ) -> Result<Vec<RawPost>> {
        let page_size = self.client.page_size().max(1);
        let mut posts = Vec::new();
        let mut offset = 0;

        loop {
            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let page = self
                .through_proxy(|proxy| async move {
                    self.client
                        .fetch_posts(&artist.service, &artist.user_id, offset, &proxy)
                        .await
                })
                .await?;

            let count = page.len();
            posts.extend(page);
            tracing::debug!(artist_id = %artist.id, offset, count, "Fetched listing page");

            if count < page_size {
                break;
            }
            offset += page_size;
        }

        Ok(posts)
    }

    /// Fetch the full record of one post
    pub async fn fetch_post_detail(&self, artist: &Artist, post_id: &str) -> Result<RawPost> {
        self.through_proxy(|proxy| async move {
            self.client
                .fetch_post(&artist.service, &artist.user_id, post_id, &proxy)
                .await
        })
        .await
    }

    /// Turn a raw record into a cache post with target paths assigned
    pub fn build_post(&self, artist: &Artist, raw: RawPost) -> Post {
        let refs = raw.file_refs();
        let mut post = Post {
            published: raw.published_at(),
            id: raw.id,
            title: raw.title.unwrap_or_default(),
            done: false,
            content: raw.content,
            detail_fetched: false,
            failed_files: Vec::new(),
            files: Vec::new(),
        };
        post.files = self.build_files(artist, &post, &refs);
        post
    }

    /// File entries for `(name, path)` references of a post
    pub fn build_files(&self, artist: &Artist, post: &Post, refs: &[(String, String)]) -> Vec<PostFile> {
        refs.iter()
            .enumerate()
            .map(|(index, (name, path))| PostFile {
                name: name.clone(),
                path: self.layout.file_path(artist, post, index, name),
                url: self.client.resolve_url(path),
                content_length: None,
                downloaded: false,
            })
            .collect()
    }

    /// Bring one file to disk under `root`
    ///
    /// Skips without any request when the cached length matches the local
    /// object. Without a cached length, the response headers are read first
    /// and the body is only streamed when the local object does not match.
    pub async fn fetch_file(
        &self,
        file: &PostFile,
        root: &Path,
        token: &CancellationToken,
    ) -> FileOutcome {
        let target = root.join(&file.path);

        if let Some(expected) = file.content_length
            && local_size(&target).await == Some(expected)
        {
            tracing::debug!(path = %target.display(), bytes = expected, "Skipping file, cached length matches");
            return FileOutcome::SkippedExists {
                content_length: Some(expected),
            };
        }

        if token.is_cancelled() {
            return FileOutcome::failed(&Error::Cancelled, file.content_length);
        }

        let selection = match self.acquire() {
            Ok(selection) => selection,
            Err(e) => return FileOutcome::failed(&e, file.content_length),
        };

        let mut learned = file.content_length;
        let result = self
            .transfer(&selection, file, &target, token, &mut learned)
            .await;
        self.report(&selection, &result);

        match result {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::debug!(url = %file.url, error = %e, "File transfer failed");
                FileOutcome::failed(&e, learned)
            }
        }
    }

    async fn transfer(
        &self,
        selection: &ProxySelection,
        file: &PostFile,
        target: &Path,
        token: &CancellationToken,
        learned: &mut Option<u64>,
    ) -> Result<FileOutcome> {
        let mut stream = tokio::select! {
            _ = token.cancelled() => return Err(Error::Cancelled),
            opened = self.client.open_file(&file.url, selection) => opened?,
        };

        let advertised = stream.content_length();
        if advertised.is_some() {
            *learned = advertised;
        }

        if let Some(expected) = advertised
            && local_size(target).await == Some(expected)
        {
            tracing::debug!(path = %target.display(), bytes = expected, "Skipping file, advertised length matches");
            return Ok(FileOutcome::SkippedExists {
                content_length: Some(expected),
            });
        }

        let part = part_path(target);
        match stream_to_part(stream.as_mut(), &part, target, advertised, token).await {
            Ok(bytes) => {
                *learned = Some(bytes);
                Ok(FileOutcome::Transferred { bytes })
            }
            Err(e) => {
                if let Err(remove_err) = fs::remove_file(&part).await
                    && remove_err.kind() != std::io::ErrorKind::NotFound
                {
                    tracing::warn!(path = %part.display(), error = %remove_err, "Failed to remove partial file");
                }
                Err(e)
            }
        }
    }
}

async fn stream_to_part(
    stream: &mut dyn FileStream,
    part: &Path,
    target: &Path,
    advertised: Option<u64>,
    token: &CancellationToken,
) -> Result<u64> {
    if let Some(parent) = part.parent() {
        fs::create_dir_all(parent).await?;
    }

    let mut out = fs::File::create(part).await?;
    let mut received: u64 = 0;

    loop {
        let chunk = tokio::select! {
            _ = token.cancelled() => return Err(Error::Cancelled),
            chunk = stream.next_chunk() => chunk?,
        };
        let Some(chunk) = chunk else { break };
        out.write_all(&chunk).await?;
        received += chunk.len() as u64;
    }
    out.flush().await?;
    drop(out);

    if let Some(expected) = advertised
        && received != expected
    {
        return Err(Error::SizeMismatch {
            path: target.to_path_buf(),
            expected,
            actual: received,
        });
    }

    fs::rename(part, target).await?;
    Ok(received)
}

/// `<target>.part`
pub fn part_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

async fn local_size(path: &Path) -> Option<u64> {
    fs::metadata(path)
        .await
        .ok()
        .filter(|m| m.is_file())
        .map(|m| m.len())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
