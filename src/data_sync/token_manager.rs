use super::aggregator::MultiCallAggregator;
use super::contracts::{IERC20Bytes32Metadata, IERC20Metadata};
use crate::errors::{ExtractorError, ExtractorResult};
use crate::utils::retry::RetryPolicy;
use crate::utils::token::Token;
use alloy_primitives::{Address, Bytes};
use alloy_sol_types::SolCall;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Outcome of a token lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenEntry {
    Resolved(Arc<Token>),
    /// The contract does not answer `decimals()`; never queried again.
    Unresolvable(Address),
}

impl TokenEntry {
    pub fn token(&self) -> Option<Arc<Token>> {
        match self {
            TokenEntry::Resolved(token) => Some(token.clone()),
            TokenEntry::Unresolvable(_) => None,
        }
    }

    pub fn into_token(self) -> ExtractorResult<Arc<Token>> {
        match self {
            TokenEntry::Resolved(token) => Ok(token),
            TokenEntry::Unresolvable(address) => Err(ExtractorError::UnresolvableToken(address)),
        }
    }
}

type TokenFuture = Shared<BoxFuture<'static, ExtractorResult<TokenEntry>>>;

enum Slot {
    Ready(TokenEntry),
    Pending(TokenFuture),
}

/// On-disk token table, `tokens-<chainId>.json`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TokenCacheFile {
    pub chain_id: u64,
    pub tokens: Vec<Token>,
    #[serde(default)]
    pub unresolvable: Vec<Address>,
}

pub fn token_cache_path(cache_dir: &Path, chain_id: u64) -> PathBuf {
    cache_dir.join(format!("tokens-{chain_id}.json"))
}

/// Read-through cache of token metadata for one chain.
///
/// Concurrent lookups of the same unseen address share a single on-chain read.
pub struct TokenManager {
    chain_id: u64,
    aggregator: MultiCallAggregator,
    retry: RetryPolicy,
    slots: DashMap<Address, Slot>,
    dirty: AtomicBool,
    cache_dir: Option<PathBuf>,
}

impl TokenManager {
    pub fn new(chain_id: u64, aggregator: MultiCallAggregator, retry: RetryPolicy) -> Self {
        Self { chain_id, aggregator, retry, slots: DashMap::new(), dirty: AtomicBool::new(false), cache_dir: None }
    }

    pub fn with_cache_dir(self, cache_dir: PathBuf) -> Self {
        Self { cache_dir: Some(cache_dir), ..self }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Relaxed)
    }

    /// Resolves token metadata, reading it from the chain on first use.
    pub async fn resolve(self: &Arc<Self>, address: Address) -> ExtractorResult<TokenEntry> {
        let future = match self.slots.entry(address) {
            Entry::Occupied(entry) => match entry.get() {
                Slot::Ready(token) => return Ok(token.clone()),
                Slot::Pending(future) => future.clone(),
            },
            Entry::Vacant(entry) => {
                let this = self.clone();
                let future = async move { this.fetch(address).await }.boxed().shared();
                entry.insert(Slot::Pending(future.clone()));
                future
            }
        };
        future.await
    }

    /// Like [`TokenManager::resolve`], with an unresolvable token reported as
    /// [`ExtractorError::UnresolvableToken`].
    pub async fn resolve_token(self: &Arc<Self>, address: Address) -> ExtractorResult<Arc<Token>> {
        self.resolve(address).await?.into_token()
    }

    /// Resolved token, `None` when unknown, unresolvable or still in flight.
    pub fn get(&self, address: &Address) -> Option<Arc<Token>> {
        match self.slots.get(address)?.value() {
            Slot::Ready(entry) => entry.token(),
            Slot::Pending(_) => None,
        }
    }

    pub fn is_unresolvable(&self, address: &Address) -> bool {
        matches!(self.slots.get(address).as_deref(), Some(Slot::Ready(TokenEntry::Unresolvable(_))))
    }

    /// Seeds metadata supplied by the caller, replacing whatever was cached.
    pub fn add_known(&self, token: Token) -> Arc<Token> {
        let token = Arc::new(token);
        self.slots.insert(token.get_address(), Slot::Ready(TokenEntry::Resolved(token.clone())));
        self.dirty.store(true, Ordering::Relaxed);
        token
    }

    pub fn tokens(&self) -> Vec<Arc<Token>> {
        let mut tokens: Vec<Arc<Token>> = self
            .slots
            .iter()
            .filter_map(|slot| match slot.value() {
                Slot::Ready(entry) => entry.token(),
                Slot::Pending(_) => None,
            })
            .collect();
        tokens.sort();
        tokens
    }

    async fn fetch(&self, address: Address) -> ExtractorResult<TokenEntry> {
        let result = self.retry.run("token metadata", || self.read_metadata(address)).await;
        match &result {
            Ok(entry) => {
                if let TokenEntry::Unresolvable(address) = entry {
                    warn!("{}", ExtractorError::UnresolvableToken(*address));
                } else {
                    debug!("Resolved token {}", address);
                }
                self.slots.insert(address, Slot::Ready(entry.clone()));
                self.dirty.store(true, Ordering::Relaxed);
            }
            Err(e) => {
                warn!("Failed to resolve token {}: {}", address, e);
                self.slots.remove_if(&address, |_, slot| matches!(slot, Slot::Pending(_)));
            }
        }
        result
    }

    async fn read_metadata(&self, address: Address) -> ExtractorResult<TokenEntry> {
        let decimals_call = IERC20Metadata::decimalsCall {};
        let (decimals, symbol, name) = tokio::join!(
            self.aggregator.call(address, &decimals_call, None),
            self.aggregator.call_raw(address, IERC20Metadata::symbolCall {}.abi_encode().into(), None),
            self.aggregator.call_raw(address, IERC20Metadata::nameCall {}.abi_encode().into(), None),
        );

        let decimals = match decimals {
            Ok(decimals) => decimals.value,
            Err(e) if e.is_transient() => return Err(e),
            Err(_) => return Ok(TokenEntry::Unresolvable(address)),
        };
        let symbol = decode_text_result::<IERC20Metadata::symbolCall, IERC20Bytes32Metadata::symbolCall>(symbol.map(|s| s.return_data))?;
        let name = decode_text_result::<IERC20Metadata::nameCall, IERC20Bytes32Metadata::nameCall>(name.map(|n| n.return_data))?;

        Ok(TokenEntry::Resolved(Arc::new(Token::new_with_data(self.chain_id, address, symbol, name, Some(decimals)))))
    }

    /// Loads the disk cache. A missing file is a cold start.
    pub async fn load(&self) -> ExtractorResult<usize> {
        let Some(cache_dir) = &self.cache_dir else {
            return Ok(0);
        };
        let path = token_cache_path(cache_dir, self.chain_id);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let file: TokenCacheFile = serde_json::from_str(&contents)?;
        if file.chain_id != self.chain_id {
            warn!("Ignoring token cache {} for chain {} (expected {})", path.display(), file.chain_id, self.chain_id);
            return Ok(0);
        }

        let loaded = file.tokens.len() + file.unresolvable.len();
        for token in file.tokens {
            self.slots.insert(token.get_address(), Slot::Ready(TokenEntry::Resolved(Arc::new(token))));
        }
        for address in file.unresolvable {
            self.slots.insert(address, Slot::Ready(TokenEntry::Unresolvable(address)));
        }
        info!("Loaded {} tokens from {}", loaded, path.display());
        Ok(loaded)
    }

    /// Writes the disk cache when something changed since the last write.
    pub async fn save(&self) -> ExtractorResult<bool> {
        let Some(cache_dir) = &self.cache_dir else {
            return Ok(false);
        };
        if !self.dirty.swap(false, Ordering::Relaxed) {
            return Ok(false);
        }

        let mut file = TokenCacheFile { chain_id: self.chain_id, ..Default::default() };
        for slot in self.slots.iter() {
            match slot.value() {
                Slot::Ready(TokenEntry::Resolved(token)) => file.tokens.push(token.as_ref().clone()),
                Slot::Ready(TokenEntry::Unresolvable(address)) => file.unresolvable.push(*address),
                Slot::Pending(_) => {}
            }
        }
        file.tokens.sort();
        file.unresolvable.sort();

        let path = token_cache_path(cache_dir, self.chain_id);
        let write = async {
            tokio::fs::create_dir_all(cache_dir).await?;
            tokio::fs::write(&path, serde_json::to_string_pretty(&file)?).await?;
            Ok::<_, ExtractorError>(())
        };
        if let Err(e) = write.await {
            self.dirty.store(true, Ordering::Relaxed);
            return Err(e);
        }
        debug!("Saved {} tokens to {}", file.tokens.len(), path.display());
        Ok(true)
    }
}

/// Decodes a `string` return, falling back to the `bytes32` form of older tokens.
/// Reverts and garbage yield `None`; transient failures propagate.
fn decode_text_result<S, B>(result: ExtractorResult<Bytes>) -> ExtractorResult<Option<String>>
where
    S: SolCall<Return = String>,
    B: SolCall<Return = alloy_primitives::B256>,
{
    let data = match result {
        Ok(data) => data,
        Err(e) if e.is_transient() => return Err(e),
        Err(_) => return Ok(None),
    };
    if data.is_empty() {
        return Ok(None);
    }
    if let Ok(text) = S::abi_decode_returns(&data) {
        return Ok(Some(text));
    }
    Ok(B::abi_decode_returns(&data).ok().and_then(|word| {
        let trimmed: Vec<u8> = word.iter().copied().take_while(|b| *b != 0).collect();
        String::from_utf8(trimmed).ok().filter(|s| !s.is_empty())
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_sync::mock_client::MockNodeClient;
    use crate::data_sync::multicall::MulticallManager;
    use crate::utils::constants::MULTICALL3;
    use alloy_primitives::B256;
    use futures::future::join_all;
    use std::time::Duration;

    fn manager(mock: &Arc<MockNodeClient>) -> TokenManager {
        let aggregator = MultiCallAggregator::new(MulticallManager::new(MULTICALL3, mock.clone()), Duration::from_millis(1), 100);
        TokenManager::new(1, aggregator, RetryPolicy::new(3, Duration::from_millis(1)))
    }

    fn erc20(mock: &MockNodeClient, address: Address, symbol: &str, decimals: u8) {
        mock.set_return::<IERC20Metadata::decimalsCall>(address, decimals);
        mock.set_return::<IERC20Metadata::symbolCall>(address, symbol.to_string());
        mock.set_return::<IERC20Metadata::nameCall>(address, format!("{symbol} Token"));
    }

    #[tokio::test]
    async fn test_concurrent_resolves_share_one_read() {
        let mock = Arc::new(MockNodeClient::new(1));
        let usdc = Address::repeat_byte(0xaa);
        erc20(&mock, usdc, "USDC", 6);
        let manager = Arc::new(manager(&mock));

        let results = join_all((0..16).map(|_| manager.resolve(usdc))).await;
        for result in results {
            let token = result.unwrap().token().unwrap();
            assert_eq!(token.get_symbol(), "USDC");
            assert_eq!(token.get_name(), "USDC Token");
            assert_eq!(token.get_decimals(), 6);
        }
        assert_eq!(mock.call_count::<IERC20Metadata::decimalsCall>(usdc), 1);

        manager.resolve(usdc).await.unwrap();
        assert_eq!(mock.call_count::<IERC20Metadata::decimalsCall>(usdc), 1);
        assert!(manager.get(&usdc).is_some());
    }

    #[tokio::test]
    async fn test_unresolvable_is_cached() {
        let mock = Arc::new(MockNodeClient::new(1));
        let broken = Address::repeat_byte(0xbb);
        mock.revert::<IERC20Metadata::decimalsCall>(broken);
        let manager = Arc::new(manager(&mock));

        assert_eq!(manager.resolve(broken).await.unwrap(), TokenEntry::Unresolvable(broken));
        assert_eq!(manager.resolve(broken).await.unwrap(), TokenEntry::Unresolvable(broken));
        assert_eq!(mock.call_count::<IERC20Metadata::decimalsCall>(broken), 1);
        assert!(manager.is_unresolvable(&broken));
        assert!(manager.get(&broken).is_none());
    }

    #[tokio::test]
    async fn test_resolve_token_reports_unresolvable() {
        let mock = Arc::new(MockNodeClient::new(1));
        let usdc = Address::repeat_byte(0xaa);
        let broken = Address::repeat_byte(0xbb);
        erc20(&mock, usdc, "USDC", 6);
        mock.revert::<IERC20Metadata::decimalsCall>(broken);
        let manager = Arc::new(manager(&mock));

        assert_eq!(manager.resolve_token(usdc).await.unwrap().get_symbol(), "USDC");
        assert!(matches!(manager.resolve_token(broken).await, Err(ExtractorError::UnresolvableToken(a)) if a == broken));
        assert_eq!(mock.call_count::<IERC20Metadata::decimalsCall>(broken), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let mock = Arc::new(MockNodeClient::new(1));
        let dai = Address::repeat_byte(0xcc);
        erc20(&mock, dai, "DAI", 18);
        mock.fail_next_batches(1);
        let manager = Arc::new(manager(&mock));

        let token = manager.resolve(dai).await.unwrap().token().unwrap();
        assert_eq!(token.get_symbol(), "DAI");
        assert_eq!(mock.batch_count(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_retries_are_not_cached() {
        let mock = Arc::new(MockNodeClient::new(1));
        let dai = Address::repeat_byte(0xcc);
        erc20(&mock, dai, "DAI", 18);
        mock.fail_next_batches(3);
        let manager = Arc::new(manager(&mock));

        assert!(matches!(manager.resolve(dai).await, Err(ExtractorError::TransientRead(_))));
        assert!(manager.resolve(dai).await.unwrap().token().is_some());
    }

    #[tokio::test]
    async fn test_bytes32_symbol_fallback() {
        let mock = Arc::new(MockNodeClient::new(1));
        let mkr = Address::repeat_byte(0xdd);
        let mut word = [0u8; 32];
        word[..3].copy_from_slice(b"MKR");
        mock.set_return::<IERC20Metadata::decimalsCall>(mkr, 18);
        mock.set_return::<IERC20Bytes32Metadata::symbolCall>(mkr, B256::from(word));
        mock.revert::<IERC20Metadata::nameCall>(mkr);
        let manager = Arc::new(manager(&mock));

        let token = manager.resolve(mkr).await.unwrap().token().unwrap();
        assert_eq!(token.get_symbol(), "MKR");
        assert_eq!(token.get_name(), mkr.to_string());
    }

    #[tokio::test]
    async fn test_cache_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockNodeClient::new(1));
        let usdc = Address::repeat_byte(0xaa);
        let broken = Address::repeat_byte(0xbb);
        erc20(&mock, usdc, "USDC", 6);
        mock.revert::<IERC20Metadata::decimalsCall>(broken);

        let first = Arc::new(manager(&mock).with_cache_dir(dir.path().to_path_buf()));
        first.resolve(usdc).await.unwrap();
        first.resolve(broken).await.unwrap();
        first.add_known(Token::new_with_data(1, Address::repeat_byte(0xee), Some("WETH".to_string()), None, Some(18)));
        assert!(first.save().await.unwrap());
        assert!(!first.save().await.unwrap());
        assert!(token_cache_path(dir.path(), 1).exists());

        let cold = Arc::new(MockNodeClient::new(1));
        let second = Arc::new(manager(&cold).with_cache_dir(dir.path().to_path_buf()));
        assert_eq!(second.load().await.unwrap(), 3);
        assert_eq!(second.resolve(usdc).await.unwrap().token().unwrap().get_decimals(), 6);
        assert_eq!(second.resolve(broken).await.unwrap(), TokenEntry::Unresolvable(broken));
        assert_eq!(second.tokens().len(), 2);
        assert_eq!(cold.batch_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_cache_is_cold_start() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockNodeClient::new(1));
        let manager = manager(&mock).with_cache_dir(dir.path().join("missing"));
        assert_eq!(manager.load().await.unwrap(), 0);
    }
}
