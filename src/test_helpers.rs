//! Shared test helpers: an in-memory platform and a wired-up backend.

use crate::backend::Backend;
use crate::client::{FileStream, PlatformClient, RawFile, RawPost, RawProfile};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::executor::DefaultLayout;
use crate::proxy::ProxySelection;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub(crate) const FAKE_BASE: &str = "https://fake.test";

#[derive(Default)]
struct FakeState {
    listings: HashMap<String, Vec<RawPost>>,
    details: HashMap<String, RawPost>,
    profiles: HashMap<String, RawProfile>,
    files: HashMap<String, Vec<u8>>,
    transient_failures: HashMap<String, u32>,
    missing: HashSet<String>,
    stalled: HashSet<String>,
    truncated: HashMap<String, usize>,
    broken_proxies: HashSet<String>,
    retained: Vec<HashSet<String>>,
    requests: Vec<String>,
}

impl FakeState {
    /// Refuse the request when it goes through a broken proxy
    fn through(&self, proxy: &ProxySelection) -> Result<()> {
        match proxy.address() {
            Some(address) if self.broken_proxies.contains(address) => {
                Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    format!("proxy {} refused the connection", address),
                )))
            }
            _ => Ok(()),
        }
    }
}

/// In-memory platform with scripted failures
pub(crate) struct FakePlatform {
    state: Mutex<FakeState>,
    page_size: usize,
}

impl FakePlatform {
    pub(crate) fn new() -> Self {
        Self::with_page_size(50)
    }

    pub(crate) fn with_page_size(page_size: usize) -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            page_size,
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Add a post to the listing; its files get a body of `size` bytes each
    pub(crate) fn add_post(&self, service: &str, user_id: &str, post: RawPost, size: usize) {
        let mut state = self.state();
        for (_, path) in post.file_refs() {
            let url = format!("{}{}", FAKE_BASE, path);
            state.files.entry(url).or_insert_with(|| vec![b'x'; size]);
        }
        state
            .listings
            .entry(format!("{}_{}", service, user_id))
            .or_default()
            .push(post);
    }

    pub(crate) fn set_profile(&self, service: &str, user_id: &str, name: &str, post_count: u64) {
        self.state().profiles.insert(
            format!("{}_{}", service, user_id),
            RawProfile {
                id: user_id.to_string(),
                name: name.to_string(),
                service: service.to_string(),
                post_count,
                updated: None,
            },
        );
    }

    pub(crate) fn set_detail(&self, post: RawPost, size: usize) {
        let mut state = self.state();
        for (_, path) in post.file_refs() {
            let url = format!("{}{}", FAKE_BASE, path);
            state.files.entry(url).or_insert_with(|| vec![b'y'; size]);
        }
        state.details.insert(post.id.clone(), post);
    }

    /// Answer 503 for the next `times` requests of `url`
    pub(crate) fn fail_times(&self, url: &str, times: u32) {
        self.state().transient_failures.insert(url.to_string(), times);
    }

    /// Answer 404 for `url`
    pub(crate) fn fail_always(&self, url: &str) {
        self.state().missing.insert(url.to_string());
    }

    /// Deliver one chunk of `url` and then never finish
    pub(crate) fn stall(&self, url: &str) {
        self.state().stalled.insert(url.to_string());
    }

    pub(crate) fn unstall(&self, url: &str) {
        self.state().stalled.remove(url);
    }

    /// Advertise the full length of `url` but deliver only `bytes`
    pub(crate) fn truncate(&self, url: &str, bytes: usize) {
        self.state().truncated.insert(url.to_string(), bytes);
    }

    /// Refuse every request made through the proxy at `address`
    pub(crate) fn break_proxy(&self, address: &str) {
        self.state().broken_proxies.insert(address.to_string());
    }

    /// Address sets passed to `retain_proxies`, oldest first
    pub(crate) fn retained(&self) -> Vec<HashSet<String>> {
        self.state().retained.clone()
    }

    pub(crate) fn requests(&self) -> Vec<String> {
        self.state().requests.clone()
    }

    pub(crate) fn file_requests(&self, url: &str) -> usize {
        let key = format!("file {}", url);
        self.state().requests.iter().filter(|r| **r == key).count()
    }

    pub(crate) fn clear_requests(&self) {
        self.state().requests.clear();
    }
}

#[async_trait]
impl PlatformClient for FakePlatform {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn retain_proxies(&self, live: &HashSet<String>) {
        self.state().retained.push(live.clone());
    }

    fn resolve_url(&self, path: &str) -> String {
        if path.starts_with("http") {
            path.to_string()
        } else {
            format!("{}{}", FAKE_BASE, path)
        }
    }

    async fn fetch_profile(
        &self,
        service: &str,
        user_id: &str,
        proxy: &ProxySelection,
    ) -> Result<RawProfile> {
        let key = format!("{}_{}", service, user_id);
        let mut state = self.state();
        state.requests.push(format!("profile {}", key));
        state.through(proxy)?;
        state.profiles.get(&key).cloned().ok_or(Error::Http {
            status: 404,
            url: key,
        })
    }

    async fn fetch_posts(
        &self,
        service: &str,
        user_id: &str,
        offset: usize,
        proxy: &ProxySelection,
    ) -> Result<Vec<RawPost>> {
        let key = format!("{}_{}", service, user_id);
        let mut state = self.state();
        state.requests.push(format!("posts {} {}", key, offset));
        state.through(proxy)?;
        let listing = state.listings.get(&key).cloned().unwrap_or_default();
        Ok(listing
            .into_iter()
            .skip(offset)
            .take(self.page_size)
            .collect())
    }

    async fn fetch_post(
        &self,
        _service: &str,
        _user_id: &str,
        post_id: &str,
        proxy: &ProxySelection,
    ) -> Result<RawPost> {
        let mut state = self.state();
        state.requests.push(format!("post {}", post_id));
        state.through(proxy)?;
        if let Some(detail) = state.details.get(post_id) {
            return Ok(detail.clone());
        }
        state
            .listings
            .values()
            .flatten()
            .find(|p| p.id == post_id)
            .cloned()
            .ok_or(Error::Http {
                status: 404,
                url: post_id.to_string(),
            })
    }

    async fn open_file(&self, url: &str, proxy: &ProxySelection) -> Result<Box<dyn FileStream>> {
        let mut state = self.state();
        state.requests.push(format!("file {}", url));
        state.through(proxy)?;

        if let Some(remaining) = state.transient_failures.get_mut(url)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(Error::Http {
                status: 503,
                url: url.to_string(),
            });
        }
        if state.missing.contains(url) {
            return Err(Error::Http {
                status: 404,
                url: url.to_string(),
            });
        }

        let data = state.files.get(url).cloned().ok_or(Error::Http {
            status: 404,
            url: url.to_string(),
        })?;
        let advertised = data.len() as u64;
        let deliver = state.truncated.get(url).copied().unwrap_or(data.len());

        Ok(Box::new(FakeStream {
            data: data[..deliver.min(data.len())].to_vec(),
            advertised,
            position: 0,
            stall: state.stalled.contains(url),
        }))
    }
}

struct FakeStream {
    data: Vec<u8>,
    advertised: u64,
    position: usize,
    stall: bool,
}

#[async_trait]
impl FileStream for FakeStream {
    fn content_length(&self) -> Option<u64> {
        Some(self.advertised)
    }

    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        if self.stall && self.position > 0 {
            std::future::pending::<()>().await;
        }
        if self.position >= self.data.len() {
            return Ok(None);
        }
        let end = (self.position + 16).min(self.data.len());
        let chunk = self.data[self.position..end].to_vec();
        self.position = end;
        Ok(Some(chunk))
    }
}

/// A post record with files at `/data/{post_id}/{name}`
pub(crate) fn raw_post(id: &str, published: &str, files: &[&str]) -> RawPost {
    let mut refs = files.iter().map(|name| RawFile {
        name: Some(name.to_string()),
        path: Some(format!("/data/{}/{}", id, name)),
    });
    RawPost {
        id: id.to_string(),
        title: Some(format!("Post {}", id)),
        content: None,
        published: Some(published.to_string()),
        file: refs.next(),
        attachments: refs.collect(),
    }
}

/// URL of a file created by [`raw_post`]
pub(crate) fn file_url(post_id: &str, name: &str) -> String {
    format!("{}/data/{}/{}", FAKE_BASE, post_id, name)
}

/// Configuration rooted in `dir` with fast retries
pub(crate) fn test_config(dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.storage.data_dir = dir.join("data");
    config.storage.download_dir = dir.join("downloads");
    config.scheduler.max_workers = 3;
    config.scheduler.task_timeout = Duration::from_secs(30);
    config.retry.initial_delay = Duration::from_millis(5);
    config.retry.max_delay = Duration::from_millis(20);
    config.retry.jitter = false;
    config
}

/// Backend over a fake platform. Returns the tempdir, which must be kept alive.
pub(crate) async fn create_test_backend(
    platform: Arc<FakePlatform>,
) -> (Backend, tempfile::TempDir) {
    let temp_dir = tempfile::tempdir().unwrap();
    let config = test_config(temp_dir.path());
    let backend = Backend::with_components(config, platform, Arc::new(DefaultLayout), None)
        .await
        .unwrap();
    (backend, temp_dir)
}
