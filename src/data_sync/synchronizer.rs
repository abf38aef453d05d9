use super::events::RawLog;
use crate::errors::ExtractorResult;
use crate::pools::{PoolClass, PoolCode, PoolInfo};
use crate::utils::token::Token;
use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::{BTreeSet, HashMap};
use std::fmt::Display;
use std::sync::Arc;
use tracing::{debug, info};

/// Awaitable discovery or fetch. Resolves to `None` when no usable pool came out of it.
pub type PoolFuture = Shared<BoxFuture<'static, Option<Arc<PoolCode>>>>;

pub fn ready_pool_future(code: Option<Arc<PoolCode>>) -> PoolFuture {
    futures::future::ready(code).boxed().shared()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupMode {
    /// Any usable snapshot.
    Ready,
    /// Concentrated pools only count once their whole tick map is known.
    Complete,
}

/// Pools known for a token set: ready snapshots plus discoveries still running.
#[derive(Default, Clone)]
pub struct PoolLookup {
    pub prefetched: Vec<Arc<PoolCode>>,
    pub fetching: Vec<PoolFuture>,
}

impl PoolLookup {
    pub fn extend(&mut self, other: PoolLookup) {
        self.prefetched.extend(other.prefetched);
        self.fetching.extend(other.fetching);
    }
}

/// One pool family kept in sync from the node.
#[async_trait]
pub trait PoolSynchronizer: Send + Sync {
    fn name(&self) -> &'static str;

    fn pool_class(&self) -> PoolClass;

    /// Topics this synchronizer consumes from the log feed.
    fn event_topics(&self) -> Vec<B256>;

    async fn start(&self) -> ExtractorResult<()>;

    /// Never blocks: known pools are returned, unknown pairs start a discovery.
    fn pool_codes_for_tokens(&self, tokens: &[Address], mode: LookupMode) -> PoolLookup;

    fn current_pool_codes(&self) -> Vec<Arc<PoolCode>>;

    /// Applies logs in (block, log index) order. Synchronous and non-suspending.
    fn apply_logs(&self, logs: &[RawLog]);

    /// Discards every block after `common_ancestor`.
    fn rollback(&self, common_ancestor: u64);

    /// Refreshes every tracked pool after the feed lost continuity.
    fn resync(&self);

    /// Registers a pool explicitly; the future resolves once it is usable.
    fn add_pool(&self, info: PoolInfo) -> PoolFuture;

    /// Adds the number of usable pools per token to `quantities`.
    fn tokens_pools_quantity(&self, quantities: &mut HashMap<Address, (Arc<Token>, usize)>);
}

/// Every unordered pair of `tokens ∪ base_tokens`, each pair sorted by address.
pub fn token_pairs(tokens: &[Address], base_tokens: &[Address]) -> Vec<(Address, Address)> {
    let all: Vec<Address> = tokens.iter().chain(base_tokens.iter()).copied().collect::<BTreeSet<_>>().into_iter().collect();
    let mut pairs = Vec::with_capacity(all.len() * all.len().saturating_sub(1) / 2);
    for (i, token0) in all.iter().enumerate() {
        for token1 in &all[i + 1..] {
            pairs.push((*token0, *token1));
        }
    }
    pairs
}

pub(crate) fn count_pool_tokens(code: &PoolCode, quantities: &mut HashMap<Address, (Arc<Token>, usize)>) {
    for token in [&code.info.token0, &code.info.token1] {
        quantities.entry(token.get_address()).or_insert_with(|| (token.clone(), 0)).1 += 1;
    }
}

/// Per-pool lifecycle messages: `info` when verbose, `debug` otherwise.
pub(crate) fn log_lifecycle(verbose: bool, message: impl Display) {
    if verbose {
        info!("{}", message);
    } else {
        debug!("{}", message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_pairs_include_base_tokens() {
        let a = Address::repeat_byte(3);
        let b = Address::repeat_byte(1);
        let base = Address::repeat_byte(2);
        let pairs = token_pairs(&[a, b, a], &[base, b]);
        assert_eq!(pairs, vec![(b, base), (b, a), (base, a)]);
        assert!(token_pairs(&[a], &[]).is_empty());
    }

    #[tokio::test]
    async fn test_ready_pool_future() {
        assert!(ready_pool_future(None).await.is_none());
    }
}
