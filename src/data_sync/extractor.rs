use super::aggregator::{AggregatorStats, MultiCallAggregator};
use super::cl_sync::ConcentratedSynchronizer;
use super::cl_watcher::WatcherContext;
use super::client::{HttpNodeClient, NodeClient};
use super::config::ExtractorConfig;
use super::events::ChainEvent;
use super::log_window::LogWindow;
use super::multicall::MulticallManager;
use super::pair_sync::PairSynchronizer;
use super::synchronizer::{LookupMode, PoolFuture, PoolSynchronizer, ready_pool_future};
use super::token_manager::TokenManager;
use crate::errors::{ExtractorError, ExtractorResult};
use crate::pools::{PoolClass, PoolCode, PoolInfo};
use crate::utils::constants::TOKENS_STATUS_TOP;
use crate::utils::retry::RetryPolicy;
use crate::utils::token::Token;
use alloy_primitives::{Address, B256};
use eyre::Result;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

struct ExtractorInner {
    chain_id: u64,
    cache_dir: PathBuf,
    persist_interval: Duration,
    client: Arc<dyn NodeClient>,
    aggregator: MultiCallAggregator,
    tokens: Arc<TokenManager>,
    synchronizers: Vec<Arc<dyn PoolSynchronizer>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Keeps the pools of one chain in sync and serves snapshots of them.
///
/// Pools are discovered lazily from the tokens asked for; chain events are applied by a single
/// task in arrival order.
#[derive(Clone)]
pub struct Extractor {
    inner: Arc<ExtractorInner>,
}

impl Extractor {
    pub fn chain_id(&self) -> u64 {
        self.inner.chain_id
    }

    pub fn token_manager(&self) -> &Arc<TokenManager> {
        &self.inner.tokens
    }

    pub fn aggregator_stats(&self) -> AggregatorStats {
        self.inner.aggregator.stats()
    }

    pub fn is_running(&self) -> bool {
        self.inner.tasks.lock().iter().any(|task| !task.is_finished())
    }

    /// Topics the log subscription must carry.
    pub fn event_topics(&self) -> Vec<B256> {
        let mut topics = Vec::new();
        for topic in self.inner.synchronizers.iter().flat_map(|s| s.event_topics()) {
            if !topics.contains(&topic) {
                topics.push(topic);
            }
        }
        topics
    }

    /// Loads the token cache, starts the synchronizers and the event loop, then warms the pools
    /// of `prefetch_tokens`.
    pub async fn start(&self, prefetch_tokens: &[Address], mut events: mpsc::Receiver<ChainEvent>) -> ExtractorResult<()> {
        match self.inner.tokens.load().await {
            Ok(count) => info!("Loaded {} cached tokens for chain {}", count, self.inner.chain_id),
            Err(e) => warn!("Token cache not loaded: {}", e),
        }
        match self.inner.client.block_number().await {
            Ok(head) => info!("Node for chain {} is at block {}", self.inner.chain_id, head),
            Err(e) => warn!("Failed to read the node head: {}", e),
        }
        for synchronizer in &self.inner.synchronizers {
            synchronizer.start().await?;
        }

        let this = self.clone();
        let event_loop = tokio::spawn(async move {
            info!("Event loop started");
            while let Some(event) = events.recv().await {
                this.handle_event(event);
            }
            info!("Event loop ended");
        });

        let this = self.clone();
        let persistence = tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.inner.persist_interval.max(Duration::from_millis(1)));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                this.persist().await;
            }
        });

        self.inner.tasks.lock().extend([event_loop, persistence]);

        let warm = self.get_pool_codes_for_tokens(prefetch_tokens);
        info!("Extractor started for chain {}: {} prefetch tokens, {} pools ready", self.inner.chain_id, prefetch_tokens.len(), warm.len());
        if let Err(e) = self.print_tokens_pools_quantity().await {
            warn!("Failed to write pool-count report: {}", e);
        }
        Ok(())
    }

    /// Stops background tasks and flushes the token cache.
    pub async fn stop(&self) {
        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        self.persist().await;
        info!("Extractor for chain {} stopped", self.inner.chain_id);
    }

    async fn persist(&self) {
        match self.inner.tokens.save().await {
            Ok(true) => debug!("Token cache saved"),
            Ok(false) => {}
            Err(e) => warn!("Failed to save token cache: {}", e),
        }
        if let Err(e) = self.print_tokens_pools_quantity().await {
            warn!("Failed to write pool-count report: {}", e);
        }
    }

    /// Applies one chain event to every synchronizer. Synchronous and non-suspending.
    pub fn handle_event(&self, event: ChainEvent) {
        match event {
            ChainEvent::Logs(logs) => {
                debug!("Applying {} logs", logs.len());
                for synchronizer in &self.inner.synchronizers {
                    synchronizer.apply_logs(&logs);
                }
            }
            ChainEvent::Rollback { common_ancestor } => {
                info!("Chain reorganized, rolling back to block {}", common_ancestor);
                for synchronizer in &self.inner.synchronizers {
                    synchronizer.rollback(common_ancestor);
                }
            }
            ChainEvent::Resync => {
                warn!("Log feed lost continuity, resynchronizing every pool");
                for synchronizer in &self.inner.synchronizers {
                    synchronizer.resync();
                }
            }
        }
    }

    /// Ready pools between `tokens` (and the base tokens). Never waits; unknown pairs start a
    /// discovery and show up in later calls.
    pub fn get_pool_codes_for_tokens(&self, tokens: &[Address]) -> Vec<Arc<PoolCode>> {
        let mut seen = HashSet::new();
        self.inner
            .synchronizers
            .iter()
            .flat_map(|s| s.pool_codes_for_tokens(tokens, LookupMode::Ready).prefetched)
            .filter(|code| seen.insert(code.get_address()))
            .collect()
    }

    /// Waits up to `timeout` for discoveries and full tick maps, then returns what is ready.
    ///
    /// Background work keeps running after the deadline.
    pub async fn get_pool_codes_for_tokens_async(&self, tokens: &[Address], timeout: Duration) -> Vec<Arc<PoolCode>> {
        let deadline = Instant::now() + timeout;
        let mut fetching: FuturesUnordered<PoolFuture> = FuturesUnordered::new();
        for synchronizer in &self.inner.synchronizers {
            fetching.extend(synchronizer.pool_codes_for_tokens(tokens, LookupMode::Complete).fetching);
        }
        let total = fetching.len();
        let mut settled = 0;
        while let Ok(Some(_)) = tokio::time::timeout_at(deadline, fetching.next()).await {
            settled += 1;
        }
        if settled < total {
            debug!("{} of {} pool fetches still running after {:?}", total - settled, total, timeout);
        }
        self.get_pool_codes_for_tokens(tokens)
    }

    pub fn get_current_pool_codes(&self) -> Vec<Arc<PoolCode>> {
        self.inner.synchronizers.iter().flat_map(|s| s.current_pool_codes()).collect()
    }

    /// Tokens ranked by the number of ready pools holding them.
    pub fn get_tokens_pools_quantity(&self) -> Vec<(Arc<Token>, usize)> {
        let mut quantities: HashMap<Address, (Arc<Token>, usize)> = HashMap::new();
        for synchronizer in &self.inner.synchronizers {
            synchronizer.tokens_pools_quantity(&mut quantities);
        }
        let mut ranked: Vec<(Arc<Token>, usize)> = quantities.into_values().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.get_address().cmp(&b.0.get_address())));
        ranked
    }

    pub fn tokens_status_path(&self) -> PathBuf {
        self.inner.cache_dir.join(format!("TokensStatus-{}.txt", self.inner.chain_id))
    }

    /// Writes the most connected tokens to `TokensStatus-<chainId>.txt` in the cache directory.
    pub async fn print_tokens_pools_quantity(&self) -> ExtractorResult<PathBuf> {
        let quantities = self.get_tokens_pools_quantity();
        let mut report = format!("Total tokens: {}\nQuantity of pools for tokens\n", quantities.len());
        for (token, count) in quantities.iter().take(TOKENS_STATUS_TOP) {
            report.push_str(&format!("{} {} {}\n", token.get_address(), token.get_symbol(), count));
        }
        tokio::fs::create_dir_all(&self.inner.cache_dir).await?;
        let path = self.tokens_status_path();
        tokio::fs::write(&path, report).await?;
        Ok(path)
    }

    /// Registers a pool explicitly with the synchronizer of its class.
    pub fn add_pool(&self, info: PoolInfo) -> PoolFuture {
        let class = info.get_class();
        match self.inner.synchronizers.iter().find(|s| s.pool_class() == class) {
            Some(synchronizer) => synchronizer.add_pool(info),
            None => {
                warn!("No synchronizer for {} pool {}", class, info.address);
                ready_pool_future(None)
            }
        }
    }
}

/// Wires an [`Extractor`] from its configuration.
pub struct ExtractorBuilder {
    config: Option<ExtractorConfig>,
    client: Option<Arc<dyn NodeClient>>,
}

impl ExtractorBuilder {
    pub fn new() -> Self {
        Self { config: None, client: None }
    }

    pub fn with_config(mut self, config: ExtractorConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Node used for reads instead of an HTTP client built from the config.
    pub fn with_client(mut self, client: Arc<dyn NodeClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn build(self) -> Result<Extractor> {
        let config = match self.config {
            Some(config) => config,
            None => ExtractorConfig::from_env()?,
        };
        config.validate()?;

        let client: Arc<dyn NodeClient> = match self.client {
            Some(client) => client,
            None => Arc::new(HttpNodeClient::new(config.chain_id, config.rpc_http_url.clone(), config.http_timeout())?),
        };
        if client.chain_id() != config.chain_id {
            let message = format!("node serves chain {} but chain {} is configured", client.chain_id(), config.chain_id);
            return Err(ExtractorError::Config(message).into());
        }

        let multicall = MulticallManager::new(config.multicall_address, client.clone());
        let aggregator = MultiCallAggregator::new(multicall, config.batch_window(), config.max_calls_per_batch);
        let retry = RetryPolicy::new(config.max_read_retries, config.retry_delay());
        let tokens = Arc::new(TokenManager::new(config.chain_id, aggregator.clone(), retry).with_cache_dir(config.cache_dir.clone()));

        let mut synchronizers: Vec<Arc<dyn PoolSynchronizer>> = Vec::new();
        let pair_factories = config.factories_of(PoolClass::ConstantProduct);
        if !pair_factories.is_empty() {
            synchronizers.push(Arc::new(PairSynchronizer::new(
                pair_factories,
                config.base_tokens.clone(),
                aggregator.clone(),
                tokens.clone(),
                retry,
                config.log_depth,
                config.verbose,
            )));
        }
        let concentrated_factories = config.factories_of(PoolClass::ConcentratedLiquidity);
        if !concentrated_factories.is_empty() {
            let ctx = WatcherContext {
                aggregator: aggregator.clone(),
                tick_helper: config.tick_helper_address,
                partial_tick_words: config.partial_tick_words,
                max_read_retries: config.max_read_retries,
                retry_delay: config.retry_delay(),
                verbose: config.verbose,
                window: Mutex::new(LogWindow::new(config.log_depth)),
            };
            synchronizers.push(Arc::new(ConcentratedSynchronizer::new(
                concentrated_factories,
                config.base_tokens.clone(),
                tokens.clone(),
                retry,
                Arc::new(ctx),
            )));
        }

        info!(
            "Extractor for chain {} built with {} synchronizers: {}",
            config.chain_id,
            synchronizers.len(),
            synchronizers.iter().map(|s| s.name()).collect::<Vec<_>>().join(", ")
        );

        Ok(Extractor {
            inner: Arc::new(ExtractorInner {
                chain_id: config.chain_id,
                persist_interval: config.persist_interval(),
                cache_dir: config.cache_dir,
                client,
                aggregator,
                tokens,
                synchronizers,
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }
}

impl Default for ExtractorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
