//! Subscription conversion outputs: where proxy endpoints come from.

use crate::config::{RetryConfig, SubscriptionConfig};
use crate::error::{Error, ProxyError, Result};
use crate::retry::with_retry;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// A proxy node produced by subscription conversion
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConvertedEndpoint {
    /// Node name (matched against skip keywords)
    pub name: String,
    /// Proxy URL, e.g. `http://127.0.0.1:7890` or `socks5://host:1080`
    pub address: String,
}

impl ConvertedEndpoint {
    /// Parse `<address>` or `<name> <address>`
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        match line.rsplit_once(char::is_whitespace) {
            Some((name, address)) => Some(Self {
                name: name.trim().to_string(),
                address: address.to_string(),
            }),
            None => Some(Self {
                name: line.to_string(),
                address: line.to_string(),
            }),
        }
    }
}

/// Produces the current endpoint list for a pool refresh
#[async_trait]
pub trait SubscriptionSource: Send + Sync {
    /// Convert the subscription into endpoints
    async fn convert(&self) -> Result<Vec<ConvertedEndpoint>>;
}

/// Fixed endpoint list from configuration
#[derive(Clone, Debug)]
pub struct StaticSubscription {
    endpoints: Vec<ConvertedEndpoint>,
}

impl StaticSubscription {
    /// Build from `<address>` / `<name> <address>` entries
    pub fn new(entries: &[String]) -> Self {
        Self {
            endpoints: entries
                .iter()
                .filter_map(|e| ConvertedEndpoint::parse(e))
                .collect(),
        }
    }
}

#[async_trait]
impl SubscriptionSource for StaticSubscription {
    async fn convert(&self) -> Result<Vec<ConvertedEndpoint>> {
        Ok(self.endpoints.clone())
    }
}

/// Plain-text endpoint list fetched over HTTP, one entry per line
#[derive(Clone, Debug)]
pub struct HttpSubscription {
    url: String,
    client: reqwest::Client,
    retry: RetryConfig,
}

impl HttpSubscription {
    /// Fetch from `url`, retrying transient failures per `retry`
    pub fn new(url: impl Into<String>, retry: RetryConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            url: url.into(),
            client,
            retry,
        })
    }

    async fn fetch(&self) -> Result<String> {
        let response = self.client.get(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Http {
                status: status.as_u16(),
                url: self.url.clone(),
            });
        }
        Ok(response.text().await?)
    }
}

#[async_trait]
impl SubscriptionSource for HttpSubscription {
    async fn convert(&self) -> Result<Vec<ConvertedEndpoint>> {
        let body = with_retry(&self.retry, || self.fetch())
            .await
            .map_err(|e| ProxyError::Subscription(format!("{}: {}", self.url, e)))?;
        Ok(body.lines().filter_map(ConvertedEndpoint::parse).collect())
    }
}

/// Build the source described by the configuration; `None` means direct connections
pub fn from_config(
    config: &SubscriptionConfig,
    retry: &RetryConfig,
) -> Result<Option<Arc<dyn SubscriptionSource>>> {
    Ok(match config {
        SubscriptionConfig::None => None,
        SubscriptionConfig::Static { endpoints } => Some(Arc::new(StaticSubscription::new(endpoints))),
        SubscriptionConfig::Url { url } => {
            Some(Arc::new(HttpSubscription::new(url.clone(), retry.clone())?))
        }
    })
}
