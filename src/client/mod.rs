//! Platform client boundary.
//!
//! The core never speaks HTTP to the platform itself; it calls a
//! [`PlatformClient`]. [`HttpPlatformClient`] is the shipped implementation
//! for kemono-style JSON APIs. Tests substitute in-memory fakes.

mod http;

pub use http::HttpPlatformClient;

use crate::error::Result;
use crate::proxy::ProxySelection;
use std::collections::HashSet;
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// Artist profile as returned by the platform
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RawProfile {
    /// Platform user id
    #[serde(default)]
    pub id: String,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Service name
    #[serde(default)]
    pub service: String,
    /// Number of posts
    #[serde(default)]
    pub post_count: u64,
    /// Last update timestamp
    #[serde(default)]
    pub updated: Option<String>,
}

/// File reference inside a post record
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RawFile {
    /// Original file name
    #[serde(default)]
    pub name: Option<String>,
    /// Absolute URL or path relative to the platform base URL
    #[serde(default)]
    pub path: Option<String>,
}

/// Post record as returned by listing and detail endpoints
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RawPost {
    /// Post id (listings may repeat ids)
    pub id: String,
    /// Title
    #[serde(default)]
    pub title: Option<String>,
    /// Text body
    #[serde(default)]
    pub content: Option<String>,
    /// Publication timestamp, platform format
    #[serde(default)]
    pub published: Option<String>,
    /// Main file
    #[serde(default)]
    pub file: Option<RawFile>,
    /// Additional files
    #[serde(default)]
    pub attachments: Vec<RawFile>,
}

impl RawPost {
    /// Main file followed by attachments, skipping entries without a path
    pub fn file_refs(&self) -> Vec<(String, String)> {
        let main = self.file.iter().map(|f| (f, "file"));
        let attachments = self.attachments.iter().map(|f| (f, "attachment"));
        main.chain(attachments)
            .filter_map(|(f, default_name)| {
                let path = f.path.as_deref().filter(|p| !p.is_empty())?;
                let name = f.name.clone().unwrap_or_else(|| default_name.to_string());
                Some((name, path.to_string()))
            })
            .collect()
    }

    /// Publication date, or the Unix epoch when missing or unparseable
    pub fn published_at(&self) -> NaiveDateTime {
        self.published
            .as_deref()
            .and_then(parse_published)
            .unwrap_or_default()
    }
}

/// Parse the platform's timestamp formats
pub fn parse_published(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// Body of a file being streamed
#[async_trait]
pub trait FileStream: Send {
    /// Length advertised by the server, if any
    fn content_length(&self) -> Option<u64>;

    /// Next chunk of the body, `None` at the end
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>>;
}

/// Access to the remote platform
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Number of posts per listing page
    fn page_size(&self) -> usize;

    /// Turn a file path from a post record into an absolute URL
    fn resolve_url(&self, path: &str) -> String;

    /// Fetch the artist profile
    async fn fetch_profile(
        &self,
        service: &str,
        user_id: &str,
        proxy: &ProxySelection,
    ) -> Result<RawProfile>;

    /// Fetch one listing page starting at `offset`
    async fn fetch_posts(
        &self,
        service: &str,
        user_id: &str,
        offset: usize,
        proxy: &ProxySelection,
    ) -> Result<Vec<RawPost>>;

    /// Fetch the full record of one post
    async fn fetch_post(
        &self,
        service: &str,
        user_id: &str,
        post_id: &str,
        proxy: &ProxySelection,
    ) -> Result<RawPost>;

    /// Open a streaming GET for a file
    async fn open_file(&self, url: &str, proxy: &ProxySelection) -> Result<Box<dyn FileStream>>;

    /// Drop per-proxy state for addresses that left the pool
    fn retain_proxies(&self, _live: &HashSet<String>) {}
}
