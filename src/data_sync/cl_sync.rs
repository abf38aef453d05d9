use super::cl_watcher::{FetchLevel, PoolWatcher, WatcherContext, WatcherStatus};
use super::contracts::IUniswapV3Factory;
use super::events::{PoolEvent, RawLog, concentrated_event_topics};
use super::log_window::RollbackOutcome;
use super::synchronizer::{LookupMode, PoolFuture, PoolLookup, PoolSynchronizer, count_pool_tokens, log_lifecycle, token_pairs};
use super::token_manager::TokenManager;
use crate::errors::{ExtractorError, ExtractorResult};
use crate::pools::{FactoryInfo, PoolClass, PoolCode, PoolInfo};
use crate::utils::retry::RetryPolicy;
use crate::utils::token::Token;
use alloy_primitives::aliases::U24;
use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::FutureExt;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

enum PoolSlot {
    Known(Address),
    /// No pool for this pair and fee tier. Cleared by a matching `PoolCreated`.
    Absent,
    Pending(PoolFuture),
}

/// (factory, token0, token1, fee)
type PoolKey = (Address, Address, Address, u32);

struct ClSyncInner {
    factories: Vec<FactoryInfo>,
    base_tokens: Vec<Address>,
    tokens: Arc<TokenManager>,
    retry: RetryPolicy,
    ctx: Arc<WatcherContext>,
    watchers: DashMap<Address, PoolWatcher>,
    pools: DashMap<PoolKey, PoolSlot>,
}

/// Tracks concentrated-liquidity pools, one [`PoolWatcher`] each.
#[derive(Clone)]
pub struct ConcentratedSynchronizer {
    inner: Arc<ClSyncInner>,
}

impl ConcentratedSynchronizer {
    pub fn new(
        factories: Vec<FactoryInfo>,
        base_tokens: Vec<Address>,
        tokens: Arc<TokenManager>,
        retry: RetryPolicy,
        ctx: Arc<WatcherContext>,
    ) -> Self {
        let factories = factories.into_iter().filter(|f| f.class == PoolClass::ConcentratedLiquidity).collect();
        Self {
            inner: Arc::new(ClSyncInner {
                factories,
                base_tokens,
                tokens,
                retry,
                ctx,
                watchers: DashMap::new(),
                pools: DashMap::new(),
            }),
        }
    }

    pub fn watcher(&self, pool: Address) -> Option<PoolWatcher> {
        self.inner.watchers.get(&pool).map(|w| w.value().clone())
    }

    pub fn pools_count(&self) -> usize {
        self.inner.watchers.len()
    }

    /// Watchers of every fee tier between `tokens` and the base tokens that reached `level`,
    /// plus futures for those still being discovered or fetched.
    pub fn get_watchers_for_tokens(&self, tokens: &[Address], level: FetchLevel) -> PoolLookup {
        let mut lookup = PoolLookup::default();
        for (token0, token1) in token_pairs(tokens, &self.inner.base_tokens) {
            for factory in &self.inner.factories {
                for fee in factory.fee_tiers() {
                    self.inner.lookup_pool(factory, token0, token1, fee, level, &mut lookup);
                }
            }
        }
        lookup
    }
}

impl ClSyncInner {
    fn lookup_pool(
        self: &Arc<Self>,
        factory: &FactoryInfo,
        token0: Address,
        token1: Address,
        fee: u32,
        level: FetchLevel,
        lookup: &mut PoolLookup,
    ) {
        let key = (factory.address, token0, token1, fee);
        let slot = match self.pools.entry(key) {
            Entry::Occupied(entry) => match entry.get() {
                PoolSlot::Known(address) => Ok(*address),
                PoolSlot::Absent => return,
                PoolSlot::Pending(future) => {
                    lookup.fetching.push(future.clone());
                    return;
                }
            },
            Entry::Vacant(entry) => {
                let this = self.clone();
                let factory = factory.clone();
                let future: PoolFuture = async move { this.discover(factory, token0, token1, fee, level).await }.boxed().shared();
                entry.insert(PoolSlot::Pending(future.clone()));
                Err(future)
            }
        };
        let address = match slot {
            Ok(address) => address,
            Err(discovery) => {
                tokio::spawn(discovery.clone());
                lookup.fetching.push(discovery);
                return;
            }
        };

        let Some(watcher) = self.watchers.get(&address).map(|w| w.value().clone()) else {
            return;
        };
        match watcher.status() {
            WatcherStatus::Failed => {}
            status if status.satisfies(level) => lookup.prefetched.extend(watcher.get_pool_code()),
            _ => lookup.fetching.push(watcher.request(level)),
        }
    }

    async fn discover(
        self: Arc<Self>,
        factory: FactoryInfo,
        token0: Address,
        token1: Address,
        fee: u32,
        level: FetchLevel,
    ) -> Option<Arc<PoolCode>> {
        let key = (factory.address, token0, token1, fee);
        match self.discover_inner(&factory, token0, token1, fee).await {
            Ok(Some(watcher)) => {
                self.pools.insert(key, PoolSlot::Known(watcher.address()));
                watcher.request(level).await
            }
            Ok(None) => {
                self.pools.insert(key, PoolSlot::Absent);
                None
            }
            Err(e) => {
                warn!("Discovery of {}/{} fee {} on factory {} failed: {}", token0, token1, fee, factory.address, e);
                self.pools.remove(&key);
                None
            }
        }
    }

    async fn discover_inner(
        &self,
        factory: &FactoryInfo,
        token0: Address,
        token1: Address,
        fee: u32,
    ) -> ExtractorResult<Option<PoolWatcher>> {
        let call = IUniswapV3Factory::getPoolCall { tokenA: token0, tokenB: token1, fee: U24::from(fee) };
        let address = self.retry.run("getPool", || self.ctx.aggregator.call(factory.address, &call, None)).await?.value;
        if address.is_zero() {
            return Ok(None);
        }
        if let Some(watcher) = self.watchers.get(&address) {
            return Ok(Some(watcher.value().clone()));
        }

        let (t0, t1) = tokio::join!(self.resolve_token(token0), self.resolve_token(token1));
        let (Some(t0), Some(t1)) = (t0?, t1?) else {
            return Ok(None);
        };
        let info = PoolInfo::new(address, t0, t1, fee, factory.clone());
        log_lifecycle(self.ctx.verbose, format_args!("Discovered concentrated pool {}", info));
        let watcher = self.watchers.entry(address).or_insert_with(|| PoolWatcher::new(info, self.ctx.clone())).value().clone();
        Ok(Some(watcher))
    }

    async fn resolve_token(&self, address: Address) -> ExtractorResult<Option<Arc<Token>>> {
        match self.tokens.resolve_token(address).await {
            Ok(token) => Ok(Some(token)),
            Err(e @ ExtractorError::UnresolvableToken(_)) => {
                log_lifecycle(self.ctx.verbose, format_args!("Skipping pool: {}", e));
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn apply_log(&self, log: &RawLog) {
        if self.factories.iter().any(|f| f.address == log.address) {
            match PoolEvent::decode(log) {
                Ok(Some(PoolEvent::PoolCreated { token0, token1, fee, pool, .. })) => {
                    let key = (log.address, token0, token1, fee);
                    if self.pools.remove_if(&key, |_, slot| matches!(slot, PoolSlot::Absent)).is_some() {
                        log_lifecycle(
                            self.ctx.verbose,
                            format_args!("Pool {} created for {}/{} fee {}, clearing negative cache", pool, token0, token1, fee),
                        );
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("{}", e),
            }
            return;
        }
        let watcher = self.watchers.get(&log.address).map(|w| w.value().clone());
        if let Some(watcher) = watcher {
            watcher.apply_log(log);
        }
    }

    fn all_watchers(&self) -> Vec<PoolWatcher> {
        self.watchers.iter().map(|w| w.value().clone()).collect()
    }
}

#[async_trait]
impl PoolSynchronizer for ConcentratedSynchronizer {
    fn name(&self) -> &'static str {
        "concentrated-liquidity"
    }

    fn pool_class(&self) -> PoolClass {
        PoolClass::ConcentratedLiquidity
    }

    fn event_topics(&self) -> Vec<B256> {
        concentrated_event_topics()
    }

    async fn start(&self) -> ExtractorResult<()> {
        info!(
            "Concentrated synchronizer started with {} factories, tick helper {}",
            self.inner.factories.len(),
            self.inner.ctx.tick_helper
        );
        Ok(())
    }

    fn pool_codes_for_tokens(&self, tokens: &[Address], mode: LookupMode) -> PoolLookup {
        let level = match mode {
            LookupMode::Ready => FetchLevel::Partial,
            LookupMode::Complete => FetchLevel::All,
        };
        self.get_watchers_for_tokens(tokens, level)
    }

    fn current_pool_codes(&self) -> Vec<Arc<PoolCode>> {
        self.inner.watchers.iter().filter_map(|w| w.get_pool_code()).collect()
    }

    fn apply_logs(&self, logs: &[RawLog]) {
        let topics = self.event_topics();
        let mut window = self.inner.ctx.window.lock();
        for log in logs.iter().filter(|log| log.topic0().is_some_and(|t| topics.contains(&t))) {
            for finalized in window.push(log.clone()) {
                for old in &finalized.logs {
                    let watcher = self.inner.watchers.get(&old.address).map(|w| w.value().clone());
                    if let Some(watcher) = watcher {
                        watcher.fold(old);
                    }
                }
            }
            self.inner.apply_log(log);
        }
    }

    fn rollback(&self, common_ancestor: u64) {
        let mut window = self.inner.ctx.window.lock();
        let (head, depth) = (window.head(), window.depth());
        let within_window = match window.rollback(common_ancestor) {
            RollbackOutcome::Within(_) => true,
            RollbackOutcome::BeyondWindow => {
                warn!("{}, resetting affected pools", ExtractorError::ReorgBeyondWindow { common_ancestor, head, depth });
                false
            }
        };
        let reset = self.inner.all_watchers().iter().filter(|w| w.rollback(common_ancestor, &window, within_window)).count();
        drop(window);
        if reset > 0 {
            info!("Rollback to block {}: {} concentrated pools resynchronizing", common_ancestor, reset);
        }
    }

    fn resync(&self) {
        let mut window = self.inner.ctx.window.lock();
        window.clear();
        let watchers = self.inner.all_watchers();
        for watcher in &watchers {
            watcher.resync();
        }
        drop(window);
        info!("Resync: {} concentrated pools resynchronizing", watchers.len());
    }

    fn add_pool(&self, info: PoolInfo) -> PoolFuture {
        let address = info.address;
        let key = (info.factory.address, info.token0.get_address(), info.token1.get_address(), info.fee);
        let watcher = self.inner.watchers.entry(address).or_insert_with(|| PoolWatcher::new(info, self.inner.ctx.clone())).value().clone();
        self.inner.pools.insert(key, PoolSlot::Known(address));
        watcher.request_partial()
    }

    fn tokens_pools_quantity(&self, quantities: &mut HashMap<Address, (Arc<Token>, usize)>) {
        for code in self.current_pool_codes() {
            count_pool_tokens(&code, quantities);
        }
    }
}
