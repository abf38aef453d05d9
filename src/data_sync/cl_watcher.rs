use super::aggregator::MultiCallAggregator;
use super::contracts::{ITickHelper, IUniswapV3Pool};
use super::events::{EventPosition, PoolEvent, RawLog};
use super::log_window::LogWindow;
use super::synchronizer::{PoolFuture, log_lifecycle, ready_pool_future};
use crate::errors::{ExtractorError, ExtractorResult};
use crate::pools::{ConcentratedState, PoolCode, PoolInfo, PoolState, full_word_range, word_range_around};
use alloy_primitives::{Address, U256};
use futures::future::{FutureExt, join_all};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use strum_macros::Display;
use tokio::sync::watch;
use tracing::{debug, error, warn};

/// Lifecycle of a concentrated-liquidity pool watcher.
///
/// `Created < PartialTicks < AllTicks`; a watcher only moves down through an explicit
/// reset. `Failed` is terminal until reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum WatcherStatus {
    Created,
    PartialTicks,
    AllTicks,
    Failed,
}

impl WatcherStatus {
    fn rank(self) -> Option<u8> {
        match self {
            WatcherStatus::Created => Some(0),
            WatcherStatus::PartialTicks => Some(1),
            WatcherStatus::AllTicks => Some(2),
            WatcherStatus::Failed => None,
        }
    }

    pub fn is_ready(self) -> bool {
        matches!(self, WatcherStatus::PartialTicks | WatcherStatus::AllTicks)
    }

    pub fn satisfies(self, level: FetchLevel) -> bool {
        match (self.rank(), level.status().rank()) {
            (Some(current), Some(target)) => current >= target,
            _ => false,
        }
    }

    fn level(self) -> Option<FetchLevel> {
        match self {
            WatcherStatus::PartialTicks => Some(FetchLevel::Partial),
            WatcherStatus::AllTicks => Some(FetchLevel::All),
            WatcherStatus::Created | WatcherStatus::Failed => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
pub enum FetchLevel {
    Partial,
    All,
}

impl FetchLevel {
    pub fn status(self) -> WatcherStatus {
        match self {
            FetchLevel::Partial => WatcherStatus::PartialTicks,
            FetchLevel::All => WatcherStatus::AllTicks,
        }
    }
}

/// Collaborators shared by every watcher of one synchronizer.
pub struct WatcherContext {
    pub aggregator: MultiCallAggregator,
    pub tick_helper: Address,
    pub partial_tick_words: u16,
    pub max_read_retries: u32,
    pub retry_delay: Duration,
    pub verbose: bool,
    /// Logs of the last blocks, replayed over every fetch. Locked before any watcher.
    pub window: Mutex<LogWindow>,
}

/// Applies one decoded event. `Ok(false)` when the log is not a pool-state event.
fn apply_event(state: &mut ConcentratedState, log: &RawLog) -> ExtractorResult<bool> {
    match PoolEvent::decode(log)? {
        Some(PoolEvent::Swap { sqrt_price_x96, liquidity, tick }) => state.apply_swap(sqrt_price_x96, tick, liquidity),
        Some(PoolEvent::Initialize { sqrt_price_x96, tick }) => state.apply_initialize(sqrt_price_x96, tick),
        Some(PoolEvent::Mint { tick_lower, tick_upper, amount }) => {
            state.apply_liquidity_change(tick_lower, tick_upper, liquidity_delta(amount)?)?
        }
        Some(PoolEvent::Burn { tick_lower, tick_upper, amount }) => {
            state.apply_liquidity_change(tick_lower, tick_upper, -liquidity_delta(amount)?)?
        }
        _ => return Ok(false),
    }
    Ok(true)
}

fn liquidity_delta(amount: u128) -> ExtractorResult<i128> {
    i128::try_from(amount).map_err(|_| ExtractorError::InvalidEvent(format!("liquidity amount {amount} overflows")))
}

enum ApplyOutcome {
    Ignored,
    Applied,
    /// Applied, and the active tick left the fetched words.
    OutOfRange,
    Desync(ExtractorError),
}

enum InstallOutcome {
    Installed(Option<Arc<PoolCode>>),
    /// A higher level is already installed.
    Superseded,
    /// The watcher was reset while the fetch ran.
    Discarded,
    Desync(ExtractorError),
}

struct WatcherState {
    status: WatcherStatus,
    baseline: Option<ConcentratedState>,
    baseline_position: EventPosition,
    current: Option<ConcentratedState>,
    last_applied: EventPosition,
    /// Bumped by every reset; fetches started under an older generation are discarded.
    generation: u64,
    pending: Option<(FetchLevel, PoolFuture)>,
    code: Option<Arc<PoolCode>>,
}

impl WatcherState {
    fn new() -> Self {
        Self {
            status: WatcherStatus::Created,
            baseline: None,
            baseline_position: EventPosition::default(),
            current: None,
            last_applied: EventPosition::default(),
            generation: 0,
            pending: None,
            code: None,
        }
    }

    fn clear(&mut self, status: WatcherStatus) {
        self.status = status;
        self.baseline = None;
        self.baseline_position = EventPosition::default();
        self.current = None;
        self.last_applied = EventPosition::default();
        self.pending = None;
        self.code = None;
    }

    fn apply_log(&mut self, log: &RawLog) -> ApplyOutcome {
        if !self.status.is_ready() || log.position() <= self.last_applied {
            return ApplyOutcome::Ignored;
        }
        let Some(current) = self.current.as_mut() else {
            return ApplyOutcome::Ignored;
        };
        match apply_event(current, log) {
            Ok(false) => ApplyOutcome::Ignored,
            Ok(true) => {
                let out_of_range = !current.covers_tick(current.tick);
                self.last_applied = log.position();
                self.code = None;
                if out_of_range && self.status == WatcherStatus::PartialTicks { ApplyOutcome::OutOfRange } else { ApplyOutcome::Applied }
            }
            Err(e) => ApplyOutcome::Desync(e),
        }
    }

    fn fold(&mut self, log: &RawLog, address: Address) {
        if !self.status.is_ready() || log.position() <= self.baseline_position {
            return;
        }
        let Some(baseline) = self.baseline.as_mut() else {
            return;
        };
        match apply_event(baseline, log) {
            Ok(true) => self.baseline_position = log.position(),
            Ok(false) => {}
            Err(e) => warn!("Failed to fold finalized log into pool {}: {}", address, e),
        }
    }

    /// Current state = baseline + window logs after it.
    fn rebuild(&mut self, window: &LogWindow, address: Address) -> ExtractorResult<()> {
        let Some(baseline) = &self.baseline else {
            return Ok(());
        };
        let mut current = baseline.clone();
        let mut last_applied = self.baseline_position;
        for log in window.logs_for(address, self.baseline_position) {
            if apply_event(&mut current, &log)? {
                last_applied = log.position();
            }
        }
        self.current = Some(current);
        self.last_applied = last_applied;
        self.code = None;
        Ok(())
    }

    fn build_code(&mut self, info: &PoolInfo) -> Option<Arc<PoolCode>> {
        if !self.status.is_ready() {
            return None;
        }
        if let Some(code) = &self.code {
            return Some(code.clone());
        }
        let current = self.current.as_ref()?;
        let info = info.clone().with_tick_spacing(current.tick_spacing);
        let code = Arc::new(PoolCode::new(info, PoolState::Concentrated(current.clone()), self.last_applied.block_number));
        self.code = Some(code.clone());
        Some(code)
    }
}

struct WatcherInner {
    info: PoolInfo,
    ctx: Arc<WatcherContext>,
    state: Mutex<WatcherState>,
    status_tx: watch::Sender<WatcherStatus>,
}

/// Keeps one concentrated-liquidity pool in sync.
#[derive(Clone)]
pub struct PoolWatcher {
    inner: Arc<WatcherInner>,
}

impl PoolWatcher {
    pub fn new(info: PoolInfo, ctx: Arc<WatcherContext>) -> Self {
        let (status_tx, _) = watch::channel(WatcherStatus::Created);
        Self { inner: Arc::new(WatcherInner { info, ctx, state: Mutex::new(WatcherState::new()), status_tx }) }
    }

    pub fn info(&self) -> &PoolInfo {
        &self.inner.info
    }

    pub fn address(&self) -> Address {
        self.inner.info.address
    }

    pub fn status(&self) -> WatcherStatus {
        self.inner.state.lock().status
    }

    pub fn subscribe_status(&self) -> watch::Receiver<WatcherStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Snapshot of the pool; `None` until ticks are fetched and while failed.
    pub fn get_pool_code(&self) -> Option<Arc<PoolCode>> {
        self.inner.state.lock().build_code(&self.inner.info)
    }

    /// Fetch in flight, if any.
    pub fn in_flight(&self) -> Option<PoolFuture> {
        self.inner.state.lock().pending.as_ref().map(|(_, future)| future.clone())
    }

    pub fn request_partial(&self) -> PoolFuture {
        self.inner.start_fetch(FetchLevel::Partial, false)
    }

    pub fn request_all(&self) -> PoolFuture {
        self.inner.start_fetch(FetchLevel::All, false)
    }

    pub fn request(&self, level: FetchLevel) -> PoolFuture {
        self.inner.start_fetch(level, false)
    }

    /// Drops every piece of state and returns to `Created`. Running fetches are discarded.
    pub fn reset(&self) {
        self.inner.reset();
    }

    /// Resets and fetches again up to the level the watcher had reached.
    pub fn resync(&self) {
        let level = {
            let state = self.inner.state.lock();
            let pending = state.pending.as_ref().map(|(level, _)| *level);
            state.status.level().max(pending)
        };
        self.inner.reset();
        if let Some(level) = level {
            let _ = self.inner.start_fetch(level, false);
        }
    }

    /// Applies a log of this pool. The caller holds the log window.
    pub fn apply_log(&self, log: &RawLog) {
        let outcome = self.inner.state.lock().apply_log(log);
        match outcome {
            ApplyOutcome::Ignored | ApplyOutcome::Applied => {}
            ApplyOutcome::OutOfRange => {
                debug!("Pool {} moved outside its fetched ticks, refetching around the new price", self.address());
                let _ = self.inner.start_fetch(FetchLevel::Partial, true);
            }
            ApplyOutcome::Desync(e) => {
                warn!("Pool {} diverged from the chain ({}), resynchronizing", self.address(), e);
                self.resync();
            }
        }
    }

    /// Folds a finalized log into the baseline. The caller holds the log window.
    pub fn fold(&self, log: &RawLog) {
        self.inner.state.lock().fold(log, self.inner.info.address);
    }

    /// Discards every block after `common_ancestor`. The caller holds the truncated window.
    ///
    /// Returns true when the watcher had to be reset and refetched.
    pub fn rollback(&self, common_ancestor: u64, window: &LogWindow, within_window: bool) -> bool {
        let mut state = self.inner.state.lock();
        let pending = state.pending.as_ref().map(|(level, _)| *level);
        let Some(level) = state.status.level() else {
            // Nothing installed; a running fetch may have read the discarded blocks.
            if state.status == WatcherStatus::Created {
                if let Some(pending) = pending {
                    state.generation += 1;
                    state.pending = None;
                    drop(state);
                    let _ = self.inner.start_fetch(pending, false);
                }
            }
            return false;
        };

        let rebuilt = if state.last_applied.block_number <= common_ancestor {
            true
        } else if within_window && state.baseline_position.block_number <= common_ancestor {
            match state.rebuild(window, self.inner.info.address) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Pool {} cannot be rebuilt after rollback: {}", self.address(), e);
                    false
                }
            }
        } else {
            false
        };

        if rebuilt {
            if let Some(pending) = pending {
                state.generation += 1;
                state.pending = None;
                drop(state);
                let _ = self.inner.start_fetch(pending, false);
            }
            return false;
        }

        drop(state);
        warn!(
            "Rollback to block {} reaches past the baseline of pool {}, resynchronizing to {}",
            common_ancestor,
            self.address(),
            level.status()
        );
        self.inner.reset();
        let _ = self.inner.start_fetch(level.max(pending.unwrap_or(level)), false);
        true
    }
}

impl WatcherInner {
    fn start_fetch(self: &Arc<Self>, level: FetchLevel, force: bool) -> PoolFuture {
        let mut state = self.state.lock();
        if state.status == WatcherStatus::Failed {
            return ready_pool_future(None);
        }
        if !force && state.status.satisfies(level) {
            return ready_pool_future(state.build_code(&self.info));
        }
        if let Some((pending_level, future)) = &state.pending {
            if *pending_level >= level {
                return future.clone();
            }
        }

        let generation = state.generation;
        let this = self.clone();
        let future: PoolFuture = async move { this.fetch(level, generation).await }.boxed().shared();
        state.pending = Some((level, future.clone()));
        drop(state);
        tokio::spawn(future.clone());
        future
    }

    fn reset(&self) {
        let mut state = self.state.lock();
        state.generation += 1;
        state.clear(WatcherStatus::Created);
        drop(state);
        self.status_tx.send_replace(WatcherStatus::Created);
    }

    async fn fetch(self: Arc<Self>, level: FetchLevel, generation: u64) -> Option<Arc<PoolCode>> {
        let attempts = self.ctx.max_read_retries.max(1);
        for attempt in 1..=attempts {
            let error = match self.read_snapshot(level).await {
                Ok((snapshot, block_number)) => match self.install(level, generation, snapshot, block_number) {
                    InstallOutcome::Installed(code) => return code,
                    InstallOutcome::Superseded => return self.state.lock().build_code(&self.info),
                    InstallOutcome::Discarded => return None,
                    InstallOutcome::Desync(e) => e,
                },
                Err(e) => e,
            };
            if self.state.lock().generation != generation {
                return None;
            }
            warn!("Fetching {} ticks of pool {} failed (attempt {}/{}): {}", level, self.info.address, attempt, attempts, error);
            if attempt < attempts {
                tokio::time::sleep(self.ctx.retry_delay * attempt).await;
            }
        }
        self.fail(generation, attempts);
        None
    }

    /// Reads slot0 at the latest block `G`, then liquidity, spacing and tick words at `G`.
    async fn read_snapshot(&self, level: FetchLevel) -> ExtractorResult<(ConcentratedState, u64)> {
        let pool = self.info.address;
        let aggregator = &self.ctx.aggregator;

        let slot0 = aggregator.call(pool, &IUniswapV3Pool::slot0Call {}, None).await?;
        let block_number = slot0.block_number;
        let sqrt_price_x96 = U256::from(slot0.value.sqrtPriceX96);
        if sqrt_price_x96.is_zero() {
            return Err(ExtractorError::Decode(format!("pool {pool} is not initialized")));
        }
        let tick = slot0.value.tick.as_i32();

        let liquidity_call = IUniswapV3Pool::liquidityCall {};
        let tick_spacing_call = IUniswapV3Pool::tickSpacingCall {};
        let (liquidity, tick_spacing) = tokio::join!(aggregator.call(pool, &liquidity_call, Some(block_number)), async {
            match self.info.tick_spacing {
                Some(tick_spacing) => Ok(tick_spacing),
                None => aggregator.call(pool, &tick_spacing_call, Some(block_number)).await.map(|f| f.value.as_i32()),
            }
        });
        let liquidity = liquidity?.value;
        let tick_spacing = tick_spacing?;
        if tick_spacing <= 0 {
            return Err(ExtractorError::Decode(format!("pool {pool} reports tick spacing {tick_spacing}")));
        }

        let fetched_words = match level {
            FetchLevel::Partial => word_range_around(tick, tick_spacing, self.ctx.partial_tick_words),
            FetchLevel::All => full_word_range(tick_spacing),
        };
        let calls: Vec<ITickHelper::getTickStateCall> =
            (fetched_words.0..=fetched_words.1).map(|word| ITickHelper::getTickStateCall { pool, tickBitmapIndex: word }).collect();
        let words = join_all(calls.iter().map(|call| aggregator.call(self.ctx.tick_helper, call, Some(block_number)))).await;

        let mut ticks = BTreeMap::new();
        for word in words {
            for tick_state in word?.value {
                if tick_state.value != 0 {
                    ticks.insert(tick_state.index.as_i32(), tick_state.value);
                }
            }
        }

        Ok((ConcentratedState { sqrt_price_x96, tick, liquidity, tick_spacing, ticks, fetched_words }, block_number))
    }

    fn install(&self, level: FetchLevel, generation: u64, snapshot: ConcentratedState, block_number: u64) -> InstallOutcome {
        let window = self.ctx.window.lock();
        let mut state = self.state.lock();
        if state.generation != generation || state.status == WatcherStatus::Failed {
            return InstallOutcome::Discarded;
        }
        let target = level.status();
        if state.status.rank() > target.rank() {
            if matches!(state.pending, Some((pending, _)) if pending == level) {
                state.pending = None;
            }
            return InstallOutcome::Superseded;
        }

        let baseline_position = EventPosition::end_of_block(block_number);
        let mut current = snapshot.clone();
        let mut last_applied = baseline_position;
        for log in window.logs_for(self.info.address, baseline_position) {
            match apply_event(&mut current, &log) {
                Ok(true) => last_applied = log.position(),
                Ok(false) => {}
                Err(e) => return InstallOutcome::Desync(e),
            }
        }
        let out_of_range = level == FetchLevel::Partial && !current.covers_tick(current.tick);

        state.baseline = Some(snapshot);
        state.baseline_position = baseline_position;
        state.current = Some(current);
        state.last_applied = last_applied;
        state.status = target;
        state.code = None;
        if matches!(state.pending, Some((pending, _)) if pending == level) {
            state.pending = None;
        }
        let code = state.build_code(&self.info);
        drop(state);
        drop(window);

        self.status_tx.send_replace(target);
        log_lifecycle(self.ctx.verbose, format_args!("Pool {} reached {} at block {}", self.info, target, block_number));
        if out_of_range {
            debug!("Pool {} moved outside its fetched ticks while syncing", self.info.address);
        }
        InstallOutcome::Installed(code)
    }

    fn fail(&self, generation: u64, attempts: u32) {
        let mut state = self.state.lock();
        if state.generation != generation {
            return;
        }
        state.clear(WatcherStatus::Failed);
        drop(state);
        self.status_tx.send_replace(WatcherStatus::Failed);
        error!("{}", ExtractorError::WatcherFailed { pool: self.info.address, attempts });
    }
}
