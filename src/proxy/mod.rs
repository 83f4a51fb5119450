//! Proxy pool for outbound requests.
//!
//! Endpoints come from a subscription conversion step ([`SubscriptionSource`]).
//! Selection is round-robin among healthy endpoints. Consecutive failures push
//! an endpoint to `degraded` (only used when nothing healthy is left) and then
//! to `dead` (skipped until the next refresh). A success resets the count and
//! brings a degraded endpoint back.
//!
//! Each refresh starts a new generation. Leases carry the generation they were
//! taken from, and reports against an older generation are ignored, so tasks
//! holding an endpoint across a refresh cannot disturb the new set.

mod subscription;

pub use subscription::{
    ConvertedEndpoint, HttpSubscription, StaticSubscription, SubscriptionSource, from_config,
};

use crate::config::{ProxyConfig, SubscriptionConfig};
use crate::error::{ProxyError, Result};
use crate::types::Event;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;

/// Health of a proxy endpoint
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum EndpointHealth {
    /// Selected in round-robin order
    Healthy,
    /// Only selected when no healthy endpoint remains
    Degraded,
    /// Excluded until the next refresh
    Dead,
}

impl std::fmt::Display for EndpointHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EndpointHealth::Healthy => "healthy",
            EndpointHealth::Degraded => "degraded",
            EndpointHealth::Dead => "dead",
        };
        f.write_str(s)
    }
}

/// A proxy endpoint and its health bookkeeping
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct ProxyEndpoint {
    /// Node name from the subscription
    pub name: String,
    /// Proxy URL
    pub address: String,
    /// Current health
    pub health: EndpointHealth,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// Last time the endpoint was handed out
    pub last_used: Option<DateTime<Utc>>,
}

/// What a request should go through
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProxySelection {
    /// No proxy configured
    Direct,
    /// Lease on a pool endpoint
    Proxy {
        /// Proxy URL
        address: String,
        /// Pool generation the lease was taken from
        generation: u64,
    },
}

impl ProxySelection {
    /// Proxy URL, if any
    pub fn address(&self) -> Option<&str> {
        match self {
            ProxySelection::Direct => None,
            ProxySelection::Proxy { address, .. } => Some(address),
        }
    }
}

#[derive(Debug, Default)]
struct PoolState {
    endpoints: Vec<ProxyEndpoint>,
    cursor: usize,
    generation: u64,
}

/// Round-robin proxy pool with health tracking
#[derive(Debug)]
pub struct ProxyPool {
    state: Mutex<PoolState>,
    configured: bool,
    skip_keywords: Vec<String>,
    degrade_after: u32,
    dead_after: u32,
    event_tx: Option<broadcast::Sender<Event>>,
}

impl ProxyPool {
    /// Create an empty pool; it hands out direct connections when no subscription is configured
    pub fn new(config: &ProxyConfig) -> Self {
        Self {
            state: Mutex::new(PoolState::default()),
            configured: !matches!(config.subscription, SubscriptionConfig::None),
            skip_keywords: config.skip_keywords.clone(),
            degrade_after: config.degrade_after.max(1),
            dead_after: config.dead_after.max(config.degrade_after.max(1)),
            event_tx: None,
        }
    }

    /// Broadcast health changes and refreshes on `event_tx`
    pub fn with_events(mut self, event_tx: broadcast::Sender<Event>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: Event) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    /// Pick an endpoint for the next request
    pub fn acquire(&self) -> Result<ProxySelection> {
        if !self.configured {
            return Ok(ProxySelection::Direct);
        }

        let mut state = self.lock();
        let total = state.endpoints.len();

        for wanted in [EndpointHealth::Healthy, EndpointHealth::Degraded] {
            for offset in 0..total {
                let index = (state.cursor + offset) % total;
                if state.endpoints[index].health == wanted {
                    state.cursor = (index + 1) % total;
                    let generation = state.generation;
                    let endpoint = &mut state.endpoints[index];
                    endpoint.last_used = Some(Utc::now());
                    return Ok(ProxySelection::Proxy {
                        address: endpoint.address.clone(),
                        generation,
                    });
                }
            }
        }

        Err(ProxyError::Exhausted { total }.into())
    }

    /// Record the result of a request made through `selection`
    pub fn report(&self, selection: &ProxySelection, success: bool) {
        let ProxySelection::Proxy {
            address,
            generation,
        } = selection
        else {
            return;
        };

        let change = {
            let mut state = self.lock();
            if *generation != state.generation {
                tracing::debug!(address = %address, generation, "Ignoring report for replaced proxy generation");
                return;
            }
            let Some(endpoint) = state.endpoints.iter_mut().find(|e| &e.address == address) else {
                return;
            };

            let before = endpoint.health;
            if success {
                endpoint.consecutive_failures = 0;
                if endpoint.health == EndpointHealth::Degraded {
                    endpoint.health = EndpointHealth::Healthy;
                }
            } else {
                endpoint.consecutive_failures += 1;
                if endpoint.consecutive_failures >= self.dead_after {
                    endpoint.health = EndpointHealth::Dead;
                } else if endpoint.consecutive_failures >= self.degrade_after
                    && endpoint.health == EndpointHealth::Healthy
                {
                    endpoint.health = EndpointHealth::Degraded;
                }
            }

            (before != endpoint.health).then(|| (endpoint.health, endpoint.consecutive_failures))
        };

        if let Some((health, failures)) = change {
            match health {
                EndpointHealth::Healthy => {
                    tracing::info!(address = %address, "Proxy endpoint recovered")
                }
                _ => tracing::warn!(
                    address = %address,
                    health = %health,
                    consecutive_failures = failures,
                    "Proxy endpoint health changed"
                ),
            }
            self.emit(Event::ProxyHealthChanged {
                address: address.clone(),
                health: health.to_string(),
            });
        }
    }

    /// Replace the endpoint set wholesale; returns the number of usable endpoints
    pub fn replace(&self, converted: Vec<ConvertedEndpoint>) -> usize {
        let mut seen = HashSet::new();
        let endpoints: Vec<ProxyEndpoint> = converted
            .into_iter()
            .filter(|e| {
                let skipped = self.skip_keywords.iter().any(|k| e.name.contains(k.as_str()));
                if skipped {
                    tracing::debug!(name = %e.name, "Skipping proxy node by keyword");
                }
                !skipped
            })
            .filter(|e| match url::Url::parse(&e.address) {
                Ok(_) => true,
                Err(err) => {
                    tracing::warn!(address = %e.address, error = %err, "Skipping invalid proxy address");
                    false
                }
            })
            .filter(|e| seen.insert(e.address.clone()))
            .map(|e| ProxyEndpoint {
                name: e.name,
                address: e.address,
                health: EndpointHealth::Healthy,
                consecutive_failures: 0,
                last_used: None,
            })
            .collect();

        let count = endpoints.len();
        let generation = {
            let mut state = self.lock();
            state.generation += 1;
            state.endpoints = endpoints;
            state.cursor = 0;
            state.generation
        };

        tracing::info!(generation, endpoints = count, "Proxy pool refreshed");
        self.emit(Event::ProxyPoolRefreshed {
            generation,
            endpoints: count,
        });
        count
    }

    /// Re-convert the subscription and replace the pool; on failure the old set stays
    pub async fn refresh(&self, source: &dyn SubscriptionSource) -> Result<usize> {
        let converted = source.convert().await?;
        Ok(self.replace(converted))
    }

    /// Refresh from `source` every `interval` until `token` is cancelled
    pub fn spawn_refresher(
        self: &Arc<Self>,
        source: Arc<dyn SubscriptionSource>,
        interval: Duration,
        token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately; the pool was filled at startup
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = pool.refresh(source.as_ref()).await {
                            tracing::warn!(error = %e, "Proxy subscription refresh failed, keeping current pool");
                        }
                    }
                }
            }
        })
    }

    /// Current endpoints
    pub fn snapshot(&self) -> Vec<ProxyEndpoint> {
        self.lock().endpoints.clone()
    }

    /// Addresses of the current endpoint set
    pub fn addresses(&self) -> HashSet<String> {
        self.lock()
            .endpoints
            .iter()
            .map(|e| e.address.clone())
            .collect()
    }

    /// Current generation (0 before the first refresh)
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }
}
