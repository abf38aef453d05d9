use crate::errors::{ExtractorError, ExtractorResult};
use crate::pools::{FactoryInfo, PoolClass, PoolProtocol};
use crate::utils::config_loader::{ExtractorConfigLoader, ExtractorConfigLoaderSync, LoadConfigError, load_from_file, load_from_file_sync};
use crate::utils::constants::{EthFactoryAddress, EthInitCodeHash, MULTICALL3};
use alloy_primitives::Address;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// Configuration of one extractor (one chain).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    /// HTTP RPC URL used for every batched read
    pub rpc_http_url: String,
    /// WebSocket RPC URL of the log subscription
    pub rpc_wss_url: String,
    pub chain_id: u64,
    pub multicall_address: Address,
    /// Helper contract returning the initialized ticks of one bitmap word
    pub tick_helper_address: Address,
    pub factories: Vec<FactoryInfo>,
    /// Tokens paired with every requested token during discovery
    pub base_tokens: Vec<Address>,
    /// Tokens whose pools are warmed on start
    pub prefetch_tokens: Vec<Address>,
    /// Directory for the token cache and the pool-count report. Use one per extractor.
    pub cache_dir: PathBuf,
    /// Number of blocks of logs kept for reorg replay
    pub log_depth: u64,
    /// Log per-pool lifecycle at info level
    pub verbose: bool,
    pub batch_window_ms: u64,
    pub max_calls_per_batch: usize,
    pub max_read_retries: u32,
    pub retry_delay_ms: u64,
    /// Bitmap words fetched on each side of the current tick before the full map
    pub partial_tick_words: u16,
    pub http_timeout_secs: u64,
    pub ws_connection_timeout_secs: u64,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_secs: u64,
    pub persist_interval_secs: u64,
    pub channel_buffer_size: usize,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            rpc_http_url: "http://127.0.0.1:8545".to_string(),
            rpc_wss_url: "ws://127.0.0.1:8546".to_string(),
            chain_id: 1,
            multicall_address: MULTICALL3,
            tick_helper_address: Address::ZERO,
            factories: vec![
                FactoryInfo::constant_product(EthFactoryAddress::UNISWAP_V2, 3000)
                    .with_init_code_hash(EthInitCodeHash::UNISWAP_V2)
                    .with_protocol(PoolProtocol::UniswapV2),
                FactoryInfo::constant_product(EthFactoryAddress::SUSHISWAP_V2, 3000).with_protocol(PoolProtocol::SushiswapV2),
                FactoryInfo::concentrated(EthFactoryAddress::UNISWAP_V3, Vec::new()).with_protocol(PoolProtocol::UniswapV3),
            ],
            base_tokens: Vec::new(),
            prefetch_tokens: Vec::new(),
            cache_dir: PathBuf::from("cache"),
            log_depth: 50,
            verbose: false,
            batch_window_ms: 0,
            max_calls_per_batch: 500,
            max_read_retries: 3,
            retry_delay_ms: 200,
            partial_tick_words: 2,
            http_timeout_secs: 10,
            ws_connection_timeout_secs: 30,
            max_reconnect_attempts: 5,
            reconnect_delay_secs: 2,
            persist_interval_secs: 60,
            channel_buffer_size: 1024,
        }
    }
}

fn env_var<T>(name: &str) -> eyre::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(value) => value.trim().parse().map(Some).map_err(|e| eyre::eyre!("Invalid {}: {}", name, e)),
        Err(_) => Ok(None),
    }
}

/// Comma-separated addresses; blanks are skipped.
pub fn parse_address_list(value: &str) -> eyre::Result<Vec<Address>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<Address>().map_err(|e| eyre::eyre!("Invalid address {}: {}", s, e)))
        .collect()
}

impl ExtractorConfig {
    /// Defaults overridden by environment variables.
    pub fn from_env() -> eyre::Result<Self> {
        Self::default().with_env()
    }

    /// Overrides fields from environment variables.
    pub fn with_env(mut self) -> eyre::Result<Self> {
        if let Some(rpc_http_url) = env_var::<String>("RPC_HTTP_URL")? {
            Url::parse(&rpc_http_url).map_err(|e| eyre::eyre!("Invalid RPC_HTTP_URL: {}", e))?;
            self.rpc_http_url = rpc_http_url;
        }
        if let Some(rpc_wss_url) = env_var::<String>("RPC_WSS_URL")? {
            Url::parse(&rpc_wss_url).map_err(|e| eyre::eyre!("Invalid RPC_WSS_URL: {}", e))?;
            self.rpc_wss_url = rpc_wss_url;
        }
        if let Some(chain_id) = env_var("CHAIN_ID")? {
            self.chain_id = chain_id;
        }
        if let Some(multicall_address) = env_var("MULTICALL_ADDRESS")? {
            self.multicall_address = multicall_address;
        }
        if let Some(tick_helper_address) = env_var("TICK_HELPER_ADDRESS")? {
            self.tick_helper_address = tick_helper_address;
        }
        if let Ok(base_tokens) = std::env::var("BASE_TOKENS") {
            self.base_tokens = parse_address_list(&base_tokens)?;
        }
        if let Ok(prefetch_tokens) = std::env::var("PREFETCH_TOKENS") {
            self.prefetch_tokens = parse_address_list(&prefetch_tokens)?;
        }
        if let Some(cache_dir) = env_var::<String>("CACHE_DIR")? {
            self.cache_dir = PathBuf::from(cache_dir);
        }
        if let Some(log_depth) = env_var("LOG_DEPTH")? {
            self.log_depth = log_depth;
        }
        if let Some(verbose) = env_var("VERBOSE")? {
            self.verbose = verbose;
        }
        if let Some(batch_window_ms) = env_var("BATCH_WINDOW_MS")? {
            self.batch_window_ms = batch_window_ms;
        }
        if let Some(max_calls_per_batch) = env_var("MAX_CALLS_PER_BATCH")? {
            self.max_calls_per_batch = max_calls_per_batch;
        }
        if let Some(max_read_retries) = env_var("MAX_READ_RETRIES")? {
            self.max_read_retries = max_read_retries;
        }
        if let Some(retry_delay_ms) = env_var("RETRY_DELAY_MS")? {
            self.retry_delay_ms = retry_delay_ms;
        }
        if let Some(partial_tick_words) = env_var("PARTIAL_TICK_WORDS")? {
            self.partial_tick_words = partial_tick_words;
        }
        if let Some(http_timeout_secs) = env_var("HTTP_TIMEOUT_SECS")? {
            self.http_timeout_secs = http_timeout_secs;
        }
        if let Some(ws_connection_timeout_secs) = env_var("WS_CONNECTION_TIMEOUT_SECS")? {
            self.ws_connection_timeout_secs = ws_connection_timeout_secs;
        }
        if let Some(max_reconnect_attempts) = env_var("MAX_RECONNECT_ATTEMPTS")? {
            self.max_reconnect_attempts = max_reconnect_attempts;
        }
        if let Some(reconnect_delay_secs) = env_var("RECONNECT_DELAY_SECS")? {
            self.reconnect_delay_secs = reconnect_delay_secs;
        }
        if let Some(persist_interval_secs) = env_var("PERSIST_INTERVAL_SECS")? {
            self.persist_interval_secs = persist_interval_secs;
        }
        if let Some(channel_buffer_size) = env_var("CHANNEL_BUFFER_SIZE")? {
            self.channel_buffer_size = channel_buffer_size;
        }
        Ok(self)
    }

    pub fn validate(&self) -> ExtractorResult<()> {
        Url::parse(&self.rpc_http_url).map_err(|e| ExtractorError::Config(format!("invalid rpc_http_url: {e}")))?;
        if self.log_depth == 0 {
            return Err(ExtractorError::Config("log_depth must be positive".to_string()));
        }
        if self.max_calls_per_batch == 0 {
            return Err(ExtractorError::Config("max_calls_per_batch must be positive".to_string()));
        }
        if self.tick_helper_address.is_zero() && self.factories.iter().any(|f| f.class == PoolClass::ConcentratedLiquidity) {
            return Err(ExtractorError::Config("concentrated-liquidity factories need tick_helper_address".to_string()));
        }
        Ok(())
    }

    pub fn factories_of(&self, class: PoolClass) -> Vec<FactoryInfo> {
        self.factories.iter().filter(|f| f.class == class).cloned().collect()
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn ws_connection_timeout(&self) -> Duration {
        Duration::from_secs(self.ws_connection_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn persist_interval(&self) -> Duration {
        Duration::from_secs(self.persist_interval_secs)
    }
}

/// Layout of a config file: the extractor lives under `[extractor]`.
#[derive(Debug, Deserialize)]
struct ExtractorConfigFile {
    extractor: ExtractorConfig,
}

#[async_trait]
impl ExtractorConfigLoader for ExtractorConfig {
    type SectionType = ExtractorConfig;

    async fn load_section_from_file(file_name: String) -> Result<Self::SectionType, LoadConfigError> {
        let file: ExtractorConfigFile = load_from_file(file_name).await?;
        Ok(file.extractor)
    }
}

impl ExtractorConfigLoaderSync for ExtractorConfig {
    type SectionType = ExtractorConfig;

    fn load_section_from_file_sync(file_name: String) -> Result<Self::SectionType, LoadConfigError> {
        let file: ExtractorConfigFile = load_from_file_sync(file_name)?;
        Ok(file.extractor)
    }
}
