//! Backend process: wires the cache, proxy pool, executor, scheduler and broker.

use crate::broker::SyncBroker;
use crate::cache::ArtistCache;
use crate::client::{HttpPlatformClient, PlatformClient};
use crate::commands::CommandContext;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::executor::{DefaultLayout, DownloadExecutor, PathLayout};
use crate::proxy::{self, ProxyPool, SubscriptionSource};
use crate::scheduler::TaskScheduler;
use crate::timer::TimerTask;
use crate::types::Event;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Capacity of the event channel shared by every session
const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// One backend instance: a single scheduler and cache shared by every session
#[derive(Clone)]
pub struct Backend {
    config: Arc<Config>,
    event_tx: broadcast::Sender<Event>,
    cache: Arc<ArtistCache>,
    proxies: Arc<ProxyPool>,
    scheduler: TaskScheduler,
    broker: SyncBroker,
    exit: CancellationToken,
    background: CancellationToken,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl Backend {
    /// Create a backend talking to the configured platform over HTTP
    pub async fn new(config: Config) -> Result<Self> {
        let client = Arc::new(HttpPlatformClient::new(config.platform.clone())?);
        Self::with_components(config, client, Arc::new(DefaultLayout), None).await
    }

    /// Create a backend from explicit components
    ///
    /// `subscription` overrides the source described by `config.proxy`.
    pub async fn with_components(
        config: Config,
        client: Arc<dyn PlatformClient>,
        layout: Arc<dyn PathLayout>,
        subscription: Option<Arc<dyn SubscriptionSource>>,
    ) -> Result<Self> {
        config.validate()?;

        tokio::fs::create_dir_all(&config.storage.download_dir)
            .await
            .map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!(
                        "Failed to create download directory '{}': {}",
                        config.storage.download_dir.display(),
                        e
                    ),
                ))
            })?;

        let (event_tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let background = CancellationToken::new();

        let proxies = Arc::new(ProxyPool::new(&config.proxy).with_events(event_tx.clone()));
        let source = match subscription {
            Some(source) => Some(source),
            None => proxy::from_config(&config.proxy.subscription, &config.retry)?,
        };
        if let Some(source) = source {
            if let Err(e) = proxies.refresh(source.as_ref()).await {
                tracing::warn!(error = %e, "Initial proxy subscription conversion failed");
            }
            if let Some(interval) = config.proxy.refresh_interval {
                proxies.spawn_refresher(source, interval, background.clone());
            }
        }

        // Quarantined artists are logged by the cache and reported by `list` and bulk commands
        let cache = Arc::new(ArtistCache::open(&config.storage.data_dir).await?);

        let executor = Arc::new(DownloadExecutor::new(
            client,
            Arc::clone(&proxies),
            layout,
            config.storage.download_dir.clone(),
        ));

        let scheduler = TaskScheduler::new(
            config.scheduler.clone(),
            config.retry.clone(),
            Arc::clone(&cache),
            executor,
            event_tx.clone(),
        );
        scheduler.start_queue_processor();

        let timer = TimerTask::new(
            scheduler.clone(),
            Arc::clone(&cache),
            config.scheduler.global_timer.clone(),
        );
        tokio::spawn(timer.run(config.scheduler.timer_tick, background.clone()));

        let exit = CancellationToken::new();
        let broker = SyncBroker::new(CommandContext {
            cache: Arc::clone(&cache),
            scheduler: scheduler.clone(),
            event_tx: event_tx.clone(),
            exit: exit.clone(),
        });

        tracing::info!(
            data_dir = %config.storage.data_dir.display(),
            artists = cache.artist_ids().len(),
            max_workers = config.scheduler.max_workers,
            "Backend started"
        );

        Ok(Self {
            config: Arc::new(config),
            event_tx,
            cache,
            proxies,
            scheduler,
            broker,
            exit,
            background,
        })
    }

    /// Subscribe to backend events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// The broker every session goes through
    pub fn broker(&self) -> &SyncBroker {
        &self.broker
    }

    /// Context for running commands directly
    pub fn command_context(&self) -> CommandContext {
        self.broker.context().clone()
    }

    /// Artist cache
    pub fn cache(&self) -> &Arc<ArtistCache> {
        &self.cache
    }

    /// Task scheduler
    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    /// Proxy pool
    pub fn proxies(&self) -> &Arc<ProxyPool> {
        &self.proxies
    }

    /// Current configuration
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Resolves once a session issued `exit`
    pub async fn exit_requested(&self) {
        self.exit.cancelled().await
    }

    /// Serve the session relay in the background until shutdown
    pub fn spawn_api_server(&self) -> tokio::task::JoinHandle<Result<()>> {
        let broker = self.broker.clone();
        let config = Arc::clone(&self.config);
        let token = self.background.clone();
        tokio::spawn(async move { crate::api::start_api_server(broker, config, token).await })
    }

    /// Gracefully shut the backend down
    ///
    /// 1. Stops accepting submissions and cancels every live task
    /// 2. Waits (bounded) for workers to drain
    /// 3. Stops the background loops (relay, proxy refresher, timer)
    /// 4. Emits [`Event::Shutdown`]
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Initiating graceful shutdown");
        self.scheduler.shutdown().await;
        self.background.cancel();
        self.exit.cancel();
        let _ = self.event_tx.send(Event::Shutdown);
        tracing::info!("Graceful shutdown complete");
        Ok(())
    }
}
