// Extraction core: node reads, pool discovery and event-driven state sync
pub mod data_sync;
pub mod errors;
// Pool identities and protocol state
pub mod pools;

// Common utilities and types
pub mod utils;

pub use data_sync::{
    ChainEvent, Extractor, ExtractorBuilder, ExtractorConfig, HttpNodeClient, LogSubscription, MultiCallAggregator, NodeClient, PoolWatcher,
    RawLog, TokenManager, WatcherStatus,
};
pub use errors::{ExtractorError, ExtractorResult};
pub use pools::{AbiSwapEncoder, FactoryInfo, PoolClass, PoolCode, PoolInfo, PoolProtocol, PoolState, PreswapRequirement};
pub use utils::{RetryPolicy, Token};
