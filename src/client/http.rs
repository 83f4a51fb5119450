//! `reqwest` implementation of [`PlatformClient`] for kemono-style APIs.

use super::{FileStream, PlatformClient, RawPost, RawProfile};
use crate::config::PlatformConfig;
use crate::error::{Error, ProxyError, Result};
use crate::proxy::ProxySelection;
use async_trait::async_trait;
use reqwest::{Client, Proxy};
use serde::de::DeserializeOwned;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// HTTP client for the platform's `/api/v1` endpoints
///
/// One `reqwest::Client` is kept per proxy address so connections are pooled
/// per endpoint.
#[derive(Debug)]
pub struct HttpPlatformClient {
    config: PlatformConfig,
    base_url: String,
    direct: Client,
    proxied: Mutex<HashMap<String, Client>>,
}

impl HttpPlatformClient {
    /// Create a client for `config.base_url`
    pub fn new(config: PlatformConfig) -> Result<Self> {
        let direct = build_client(&config, None)?;
        let base_url = config.base_url.trim_end_matches('/').to_string();
        Ok(Self {
            config,
            base_url,
            direct,
            proxied: Mutex::new(HashMap::new()),
        })
    }

    fn client_for(&self, proxy: &ProxySelection) -> Result<Client> {
        let Some(address) = proxy.address() else {
            return Ok(self.direct.clone());
        };

        let mut clients = self.proxied.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(client) = clients.get(address) {
            return Ok(client.clone());
        }
        let client = build_client(&self.config, Some(address))?;
        clients.insert(address.to_string(), client.clone());
        Ok(client)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: String, proxy: &ProxySelection) -> Result<T> {
        let response = self
            .client_for(proxy)?
            .get(&url)
            .timeout(self.config.request_timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Http {
                status: status.as_u16(),
                url,
            });
        }

        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

fn build_client(config: &PlatformConfig, proxy: Option<&str>) -> Result<Client> {
    let mut builder = Client::builder()
        .user_agent(config.user_agent.clone())
        .connect_timeout(config.request_timeout);

    if let Some(address) = proxy {
        let proxy = Proxy::all(address).map_err(|e| ProxyError::InvalidEndpoint {
            address: address.to_string(),
            reason: e.to_string(),
        })?;
        builder = builder.proxy(proxy);
    }

    Ok(builder.build()?)
}

#[async_trait]
impl PlatformClient for HttpPlatformClient {
    fn page_size(&self) -> usize {
        self.config.page_size
    }

    fn retain_proxies(&self, live: &HashSet<String>) {
        let mut clients = self.proxied.lock().unwrap_or_else(|e| e.into_inner());
        let before = clients.len();
        clients.retain(|address, _| live.contains(address));
        if clients.len() < before {
            tracing::debug!(dropped = before - clients.len(), "Dropped clients of replaced proxies");
        }
    }

    fn resolve_url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    async fn fetch_profile(
        &self,
        service: &str,
        user_id: &str,
        proxy: &ProxySelection,
    ) -> Result<RawProfile> {
        let url = format!(
            "{}/api/v1/{}/user/{}/profile",
            self.base_url, service, user_id
        );
        self.get_json(url, proxy).await
    }

    async fn fetch_posts(
        &self,
        service: &str,
        user_id: &str,
        offset: usize,
        proxy: &ProxySelection,
    ) -> Result<Vec<RawPost>> {
        let mut url = format!("{}/api/v1/{}/user/{}/posts", self.base_url, service, user_id);
        if offset > 0 {
            url.push_str(&format!("?o={}", offset));
        }
        self.get_json(url, proxy).await
    }

    async fn fetch_post(
        &self,
        service: &str,
        user_id: &str,
        post_id: &str,
        proxy: &ProxySelection,
    ) -> Result<RawPost> {
        let url = format!(
            "{}/api/v1/{}/user/{}/post/{}",
            self.base_url, service, user_id, post_id
        );
        let value: serde_json::Value = self.get_json(url, proxy).await?;
        // Detail responses wrap the record as {"post": {...}} on newer API versions
        let record = match value.get("post") {
            Some(post) if post.is_object() => post.clone(),
            _ => value,
        };
        Ok(serde_json::from_value(record)?)
    }

    async fn open_file(&self, url: &str, proxy: &ProxySelection) -> Result<Box<dyn FileStream>> {
        let response = self.client_for(proxy)?.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Http {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(Box::new(HttpFileStream { response }))
    }
}

struct HttpFileStream {
    response: reqwest::Response,
}

#[async_trait]
impl FileStream for HttpFileStream {
    fn content_length(&self) -> Option<u64> {
        self.response.content_length()
    }

    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.response.chunk().await?.map(|bytes| bytes.to_vec()))
    }
}
