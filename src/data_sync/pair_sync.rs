use super::aggregator::{Fetched, MultiCallAggregator};
use super::contracts::{IUniswapV2Factory, IUniswapV2Pair};
use super::events::{EventPosition, PoolEvent, RawLog, pair_event_topics};
use super::log_window::{BlockLogs, LogWindow, RollbackOutcome};
use super::synchronizer::{
    LookupMode, PoolFuture, PoolLookup, PoolSynchronizer, count_pool_tokens, log_lifecycle, ready_pool_future, token_pairs,
};
use super::token_manager::TokenManager;
use crate::errors::{ExtractorError, ExtractorResult};
use crate::pools::{ConstantProductState, FactoryInfo, PoolClass, PoolCode, PoolInfo, PoolState};
use crate::utils::retry::RetryPolicy;
use crate::utils::token::Token;
use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PairStatus {
    /// Registered, reserves not read yet.
    Fetching,
    Ready,
    /// The local state can no longer be rebuilt; a refetch is scheduled.
    Stale,
}

struct PairPool {
    info: PoolInfo,
    status: PairStatus,
    /// State at `baseline_position`: a fetch result with finalized logs folded in.
    baseline: ConstantProductState,
    baseline_position: EventPosition,
    current: ConstantProductState,
    last_applied: EventPosition,
    /// Bumped whenever a running fetch may have read a discarded history.
    epoch: u64,
    pending: Option<PoolFuture>,
    code: Option<Arc<PoolCode>>,
}

impl PairPool {
    fn fetching(info: PoolInfo) -> Self {
        Self {
            info,
            status: PairStatus::Fetching,
            baseline: ConstantProductState::default(),
            baseline_position: EventPosition::default(),
            current: ConstantProductState::default(),
            last_applied: EventPosition::default(),
            epoch: 0,
            pending: None,
            code: None,
        }
    }

    /// Applies a log if it is a `Sync` newer than the last applied position.
    fn apply_log(&mut self, log: &RawLog) -> ExtractorResult<bool> {
        if log.position() <= self.last_applied {
            return Ok(false);
        }
        let Some(PoolEvent::Sync { reserve0, reserve1 }) = PoolEvent::decode(log)? else {
            return Ok(false);
        };
        self.current.apply_sync(reserve0, reserve1);
        self.last_applied = log.position();
        Ok(true)
    }

    fn fold(&mut self, log: &RawLog) {
        if log.position() <= self.baseline_position {
            return;
        }
        if let Ok(Some(PoolEvent::Sync { reserve0, reserve1 })) = PoolEvent::decode(log) {
            self.baseline.apply_sync(reserve0, reserve1);
            self.baseline_position = log.position();
        }
    }

    fn install(&mut self, state: ConstantProductState, block_number: u64, window: &LogWindow) -> Arc<PoolCode> {
        self.baseline = state.clone();
        self.baseline_position = EventPosition::end_of_block(block_number);
        self.current = state;
        self.last_applied = self.baseline_position;
        self.status = PairStatus::Ready;
        self.pending = None;
        self.replay(window);
        self.refresh_code()
    }

    /// Current state = baseline + window logs after it.
    fn replay(&mut self, window: &LogWindow) {
        self.current = self.baseline.clone();
        self.last_applied = self.baseline_position;
        for log in window.logs_for(self.info.address, self.baseline_position) {
            if let Err(e) = self.apply_log(&log) {
                warn!("Skipping undecodable log of pair {}: {}", self.info.address, e);
            }
        }
    }

    fn mark_stale(&mut self) {
        self.status = PairStatus::Stale;
        self.epoch += 1;
        self.code = None;
    }

    fn refresh_code(&mut self) -> Arc<PoolCode> {
        let code = Arc::new(PoolCode::new(
            self.info.clone(),
            PoolState::ConstantProduct(self.current.clone()),
            self.last_applied.block_number,
        ));
        self.code = Some(code.clone());
        code
    }

    fn ready_code(&self) -> Option<Arc<PoolCode>> {
        if self.status == PairStatus::Ready { self.code.clone() } else { None }
    }
}

/// Discovery state of one (factory, token0, token1) pair.
enum PairSlot {
    Known(Address),
    /// The factory has no pool for this pair (or it is unusable).
    Absent,
    Pending(PoolFuture),
}

type PairKey = (Address, Address, Address);

struct PairSyncInner {
    factories: Vec<FactoryInfo>,
    base_tokens: Vec<Address>,
    aggregator: MultiCallAggregator,
    tokens: Arc<TokenManager>,
    retry: RetryPolicy,
    verbose: bool,
    window: Mutex<LogWindow>,
    pools: DashMap<Address, PairPool>,
    pairs: DashMap<PairKey, PairSlot>,
}

/// Tracks constant-product pools discovered on demand.
#[derive(Clone)]
pub struct PairSynchronizer {
    inner: Arc<PairSyncInner>,
}

impl PairSynchronizer {
    pub fn new(
        factories: Vec<FactoryInfo>,
        base_tokens: Vec<Address>,
        aggregator: MultiCallAggregator,
        tokens: Arc<TokenManager>,
        retry: RetryPolicy,
        log_depth: u64,
        verbose: bool,
    ) -> Self {
        let factories = factories.into_iter().filter(|f| f.class == PoolClass::ConstantProduct).collect();
        Self {
            inner: Arc::new(PairSyncInner {
                factories,
                base_tokens,
                aggregator,
                tokens,
                retry,
                verbose,
                window: Mutex::new(LogWindow::new(log_depth)),
                pools: DashMap::new(),
                pairs: DashMap::new(),
            }),
        }
    }

    pub fn pools_count(&self) -> usize {
        self.inner.pools.len()
    }

    /// Ready pairs between `tokens` and the base tokens, plus discoveries still running.
    pub fn get_pools_for_tokens(&self, tokens: &[Address]) -> PoolLookup {
        let mut lookup = PoolLookup::default();
        for (token0, token1) in token_pairs(tokens, &self.inner.base_tokens) {
            for factory in &self.inner.factories {
                self.inner.lookup_pair(factory, token0, token1, &mut lookup);
            }
        }
        lookup
    }
}

impl PairSyncInner {
    fn lookup_pair(self: &Arc<Self>, factory: &FactoryInfo, token0: Address, token1: Address, lookup: &mut PoolLookup) {
        let key = (factory.address, token0, token1);
        let slot = match self.pairs.entry(key) {
            Entry::Occupied(entry) => match entry.get() {
                PairSlot::Known(address) => Ok(*address),
                PairSlot::Absent => return,
                PairSlot::Pending(future) => {
                    lookup.fetching.push(future.clone());
                    return;
                }
            },
            Entry::Vacant(entry) => {
                let this = self.clone();
                let factory = factory.clone();
                let future: PoolFuture = async move { this.discover(factory, token0, token1).await }.boxed().shared();
                entry.insert(PairSlot::Pending(future.clone()));
                Err(future)
            }
        };
        let known = match slot {
            Ok(address) => address,
            Err(discovery) => {
                tokio::spawn(discovery.clone());
                lookup.fetching.push(discovery);
                return;
            }
        };

        let (code, pending, stale) = match self.pools.get(&known) {
            Some(pool) => (pool.ready_code(), pool.pending.clone(), pool.status == PairStatus::Stale && pool.pending.is_none()),
            None => return,
        };
        if let Some(code) = code {
            lookup.prefetched.push(code);
        } else if let Some(pending) = pending {
            lookup.fetching.push(pending);
        } else if stale {
            lookup.fetching.push(self.schedule_fetch(known));
        }
    }

    async fn discover(self: Arc<Self>, factory: FactoryInfo, token0: Address, token1: Address) -> Option<Arc<PoolCode>> {
        let key = (factory.address, token0, token1);
        match self.discover_inner(&factory, token0, token1).await {
            Ok(Some((address, code))) => {
                self.pairs.insert(key, PairSlot::Known(address));
                Some(code)
            }
            Ok(None) => {
                self.pairs.insert(key, PairSlot::Absent);
                None
            }
            Err(e) => {
                // Not cached: the next request tries again.
                warn!("Discovery of {}/{} on factory {} failed: {}", token0, token1, factory.address, e);
                self.pairs.remove(&key);
                None
            }
        }
    }

    async fn discover_inner(
        &self,
        factory: &FactoryInfo,
        token0: Address,
        token1: Address,
    ) -> ExtractorResult<Option<(Address, Arc<PoolCode>)>> {
        let address = match factory.compute_pair_address(token0, token1) {
            Some(address) => address,
            None => {
                let call = IUniswapV2Factory::getPairCall { tokenA: token0, tokenB: token1 };
                self.retry.run("getPair", || self.aggregator.call(factory.address, &call, None)).await?.value
            }
        };
        if address.is_zero() {
            return Ok(None);
        }

        if let Some(code) = self.pools.get(&address).and_then(|p| p.ready_code()) {
            return Ok(Some((address, code)));
        }

        let (t0, t1) = tokio::join!(self.resolve_token(token0), self.resolve_token(token1));
        let (Some(t0), Some(t1)) = (t0?, t1?) else {
            return Ok(None);
        };

        let info = PoolInfo::new(address, t0, t1, factory.fee, factory.clone());
        let inserted = match self.pools.entry(address) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(PairPool::fetching(info));
                true
            }
        };

        let result = self.fetch_and_install(address).await;
        if result.is_err() && inserted {
            self.pools.remove(&address);
        }
        match result {
            Ok(Some(code)) => {
                log_lifecycle(self.verbose, format_args!("Discovered pair {}", code));
                Ok(Some((address, code)))
            }
            Ok(None) => Ok(None),
            Err(e) if e.is_transient() => Err(e),
            Err(e) => {
                log_lifecycle(self.verbose, format_args!("Pair {} is not usable: {}", address, e));
                Ok(None)
            }
        }
    }

    async fn resolve_token(&self, address: Address) -> ExtractorResult<Option<Arc<Token>>> {
        match self.tokens.resolve_token(address).await {
            Ok(token) => Ok(Some(token)),
            Err(e @ ExtractorError::UnresolvableToken(_)) => {
                log_lifecycle(self.verbose, format_args!("Skipping pool: {}", e));
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Reads reserves and installs them, retrying when a rollback invalidated the read.
    async fn fetch_and_install(&self, address: Address) -> ExtractorResult<Option<Arc<PoolCode>>> {
        let call = IUniswapV2Pair::getReservesCall {};
        for _ in 0..self.retry.max_attempts {
            let Some(epoch) = self.pools.get(&address).map(|p| p.epoch) else {
                return Ok(None);
            };
            let reserves = self.retry.run("getReserves", || self.aggregator.call(address, &call, None)).await?;
            if let Some(code) = self.install(address, epoch, reserves) {
                return Ok(Some(code));
            }
        }
        Err(ExtractorError::TransientRead(format!("reserves of {address} kept changing under a reorg")))
    }

    fn install(&self, address: Address, epoch: u64, fetched: Fetched<IUniswapV2Pair::getReservesReturn>) -> Option<Arc<PoolCode>> {
        let window = self.window.lock();
        let mut pool = self.pools.get_mut(&address)?;
        if pool.epoch != epoch {
            return None;
        }
        let state = ConstantProductState::new(U256::from(fetched.value.reserve0), U256::from(fetched.value.reserve1));
        Some(pool.install(state, fetched.block_number, &window))
    }

    /// Spawns a refetch of a known pool and returns its shared result.
    fn schedule_fetch(self: &Arc<Self>, address: Address) -> PoolFuture {
        let this = self.clone();
        let future = async move {
            match this.fetch_and_install(address).await {
                Ok(code) => code,
                Err(e) => {
                    warn!("Refetch of pair {} failed: {}", address, e);
                    if let Some(mut pool) = this.pools.get_mut(&address) {
                        pool.pending = None;
                    }
                    None
                }
            }
        }
        .boxed()
        .shared();
        if let Some(mut pool) = self.pools.get_mut(&address) {
            pool.pending = Some(future.clone());
        }
        tokio::spawn(future.clone());
        future
    }

    fn fold(&self, finalized: Vec<BlockLogs>) {
        for log in finalized.iter().flat_map(|b| b.logs.iter()) {
            if let Some(mut pool) = self.pools.get_mut(&log.address) {
                if pool.status == PairStatus::Ready {
                    pool.fold(log);
                }
            }
        }
    }

    fn apply_log(&self, log: &RawLog) {
        let event = match PoolEvent::decode(log) {
            Ok(Some(event)) => event,
            Ok(None) => return,
            Err(e) => {
                warn!("{}", e);
                return;
            }
        };
        match event {
            PoolEvent::Sync { .. } => {
                if let Some(mut pool) = self.pools.get_mut(&log.address) {
                    if pool.status == PairStatus::Ready && matches!(pool.apply_log(log), Ok(true)) {
                        pool.refresh_code();
                    }
                }
            }
            PoolEvent::PairCreated { token0, token1, pair } => {
                let key = (log.address, token0, token1);
                if self.pairs.remove_if(&key, |_, slot| matches!(slot, PairSlot::Absent)).is_some() {
                    log_lifecycle(self.verbose, format_args!("Pair {} created for {}/{}, clearing negative cache", pair, token0, token1));
                }
            }
            _ => {}
        }
    }

    /// Marks every Ready pool matching `affected` stale and invalidates running fetches.
    fn invalidate(&self, mut affected: impl FnMut(&mut PairPool) -> bool) -> Vec<Address> {
        let mut refetch = Vec::new();
        for mut pool in self.pools.iter_mut() {
            match pool.status {
                PairStatus::Fetching | PairStatus::Stale => pool.epoch += 1,
                PairStatus::Ready => {
                    if affected(&mut pool) {
                        pool.mark_stale();
                        refetch.push(pool.info.address);
                    }
                }
            }
        }
        refetch
    }
}

#[async_trait]
impl PoolSynchronizer for PairSynchronizer {
    fn name(&self) -> &'static str {
        "constant-product"
    }

    fn pool_class(&self) -> PoolClass {
        PoolClass::ConstantProduct
    }

    fn event_topics(&self) -> Vec<B256> {
        pair_event_topics()
    }

    async fn start(&self) -> ExtractorResult<()> {
        info!(
            "Pair synchronizer started with {} factories and {} base tokens",
            self.inner.factories.len(),
            self.inner.base_tokens.len()
        );
        Ok(())
    }

    fn pool_codes_for_tokens(&self, tokens: &[Address], _mode: LookupMode) -> PoolLookup {
        self.get_pools_for_tokens(tokens)
    }

    fn current_pool_codes(&self) -> Vec<Arc<PoolCode>> {
        self.inner.pools.iter().filter_map(|pool| pool.ready_code()).collect()
    }

    fn apply_logs(&self, logs: &[RawLog]) {
        let topics = self.event_topics();
        let mut window = self.inner.window.lock();
        for log in logs.iter().filter(|log| log.topic0().is_some_and(|t| topics.contains(&t))) {
            let finalized = window.push(log.clone());
            self.inner.fold(finalized);
            self.inner.apply_log(log);
        }
    }

    fn rollback(&self, common_ancestor: u64) {
        let mut window = self.inner.window.lock();
        let (head, depth) = (window.head(), window.depth());
        let outcome = window.rollback(common_ancestor);
        let refetch = match outcome {
            RollbackOutcome::Within(_) => self.inner.invalidate(|pool| {
                if pool.last_applied.block_number <= common_ancestor {
                    return false;
                }
                if pool.baseline_position.block_number > common_ancestor {
                    return true;
                }
                pool.replay(&window);
                pool.refresh_code();
                false
            }),
            RollbackOutcome::BeyondWindow => {
                warn!("{}, refetching affected pairs", ExtractorError::ReorgBeyondWindow { common_ancestor, head, depth });
                self.inner.invalidate(|pool| pool.last_applied.block_number > common_ancestor)
            }
        };
        drop(window);
        if !refetch.is_empty() {
            info!("Rollback to block {}: refetching {} pairs", common_ancestor, refetch.len());
        }
        for address in refetch {
            let _ = self.inner.schedule_fetch(address);
        }
    }

    fn resync(&self) {
        let mut window = self.inner.window.lock();
        window.clear();
        let refetch = self.inner.invalidate(|_| true);
        drop(window);
        info!("Resync: refetching {} pairs", refetch.len());
        for address in refetch {
            let _ = self.inner.schedule_fetch(address);
        }
    }

    fn add_pool(&self, info: PoolInfo) -> PoolFuture {
        let address = info.address;
        let key = (info.factory.address, info.token0.get_address(), info.token1.get_address());
        let inner = &self.inner;
        match inner.pools.entry(address) {
            Entry::Occupied(entry) => {
                let pool = entry.get();
                if let Some(code) = pool.ready_code() {
                    return ready_pool_future(Some(code));
                }
                if let Some(pending) = pool.pending.clone() {
                    return pending;
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(PairPool::fetching(info));
            }
        }
        inner.pairs.insert(key, PairSlot::Known(address));
        inner.schedule_fetch(address)
    }

    fn tokens_pools_quantity(&self, quantities: &mut HashMap<Address, (Arc<Token>, usize)>) {
        for code in self.current_pool_codes() {
            count_pool_tokens(&code, quantities);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_sync::contracts::IERC20Metadata;
    use crate::data_sync::events::test_logs::sync_log;
    use crate::data_sync::mock_client::MockNodeClient;
    use crate::data_sync::multicall::MulticallManager;
    use crate::utils::constants::{EthFactoryAddress, EthInitCodeHash, MULTICALL3};
    use std::time::Duration;

    fn pool() -> PairPool {
        let factory = FactoryInfo::constant_product(EthFactoryAddress::UNISWAP_V2, 3000);
        let (token0, token1) = (Arc::new(Token::repeat_byte(1, 1)), Arc::new(Token::repeat_byte(1, 2)));
        let info = PoolInfo::new(Address::repeat_byte(0x10), token0, token1, 3000, factory);
        PairPool::fetching(info)
    }

    fn reserves(pool: &PairPool) -> (u64, u64) {
        (pool.current.reserve0.to::<u64>(), pool.current.reserve1.to::<u64>())
    }

    #[test]
    fn test_install_replays_newer_window_logs() {
        let pair = Address::repeat_byte(0x10);
        let mut window = LogWindow::new(10);
        window.push(sync_log(pair, 1, 1, 99, 0));
        window.push(sync_log(pair, 2, 2, 101, 0));
        window.push(sync_log(Address::repeat_byte(0x11), 9, 9, 101, 1));

        let mut pool = pool();
        let code = pool.install(ConstantProductState::new(U256::from(1000u64), U256::from(2000u64)), 100, &window);
        assert_eq!(reserves(&pool), (2, 2));
        assert_eq!(code.block_number, 101);
        assert_eq!(pool.baseline_position, EventPosition::end_of_block(100));
    }

    #[test]
    fn test_old_positions_are_ignored() {
        let pair = Address::repeat_byte(0x10);
        let window = LogWindow::new(10);
        let mut pool = pool();
        pool.install(ConstantProductState::new(U256::from(1000u64), U256::from(2000u64)), 100, &window);

        assert!(pool.apply_log(&sync_log(pair, 5, 5, 101, 3)).unwrap());
        assert!(!pool.apply_log(&sync_log(pair, 6, 6, 101, 3)).unwrap());
        assert!(!pool.apply_log(&sync_log(pair, 7, 7, 101, 1)).unwrap());
        assert!(!pool.apply_log(&sync_log(pair, 8, 8, 100, 9)).unwrap());
        assert_eq!(reserves(&pool), (5, 5));
    }

    #[test]
    fn test_fold_moves_baseline() {
        let pair = Address::repeat_byte(0x10);
        let mut window = LogWindow::new(2);
        let mut pool = pool();
        pool.install(ConstantProductState::new(U256::from(1000u64), U256::from(2000u64)), 100, &window);

        for block in 101..=104 {
            let log = sync_log(pair, block, block, block, 0);
            for finalized in window.push(log.clone()) {
                for old in &finalized.logs {
                    pool.fold(old);
                }
            }
            pool.apply_log(&log).unwrap();
        }
        // Blocks 101 and 102 left the window.
        assert_eq!(pool.baseline_position, EventPosition::new(102, 0));
        assert_eq!(pool.baseline, ConstantProductState::new(U256::from(102u64), U256::from(102u64)));

        pool.replay(&window);
        assert_eq!(reserves(&pool), (104, 104));
    }

    fn synchronizer(mock: &Arc<MockNodeClient>, factory: FactoryInfo) -> PairSynchronizer {
        let aggregator = MultiCallAggregator::new(MulticallManager::new(MULTICALL3, mock.clone()), Duration::from_millis(1), 100);
        let retry = RetryPolicy::new(2, Duration::from_millis(1));
        let tokens = Arc::new(TokenManager::new(1, aggregator.clone(), retry));
        PairSynchronizer::new(vec![factory], Vec::new(), aggregator, tokens, retry, 10, false)
    }

    #[tokio::test]
    async fn test_failed_discovery_keeps_registered_pool() {
        let mock = Arc::new(MockNodeClient::new(1));
        let factory = FactoryInfo::constant_product(EthFactoryAddress::UNISWAP_V2, 3000).with_init_code_hash(EthInitCodeHash::UNISWAP_V2);
        let (token0, token1) = (Address::repeat_byte(1), Address::repeat_byte(2));
        let pair = factory.compute_pair_address(token0, token1).unwrap();
        for token in [token0, token1] {
            mock.set_return::<IERC20Metadata::decimalsCall>(token, 18);
        }
        mock.revert::<IUniswapV2Pair::getReservesCall>(pair);
        let sync = synchronizer(&mock, factory.clone());

        let info = PoolInfo::new(pair, Arc::new(Token::repeat_byte(1, 1)), Arc::new(Token::repeat_byte(1, 2)), 3000, factory.clone());
        sync.inner.pools.insert(pair, PairPool::fetching(info));
        assert!(sync.inner.discover_inner(&factory, token0, token1).await.unwrap().is_none());
        assert!(sync.inner.pools.contains_key(&pair));

        // An entry created by the discovery itself is dropped again.
        sync.inner.pools.remove(&pair);
        assert!(sync.inner.discover_inner(&factory, token0, token1).await.unwrap().is_none());
        assert!(!sync.inner.pools.contains_key(&pair));
    }
}
