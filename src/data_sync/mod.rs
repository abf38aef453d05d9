//! Pool synchronization layer.
//!
//! Reads go through one batching [`MultiCallAggregator`] per chain; chain events arrive as
//! [`ChainEvent`]s and are applied by the pair-style and concentrated-liquidity synchronizers
//! composed behind the [`Extractor`] façade.

pub mod aggregator;
pub mod cl_sync;
pub mod cl_watcher;
pub mod client;
pub mod config;
pub mod contracts;
pub mod events;
pub mod extractor;
pub mod log_window;
pub mod multicall;
pub mod pair_sync;
pub mod synchronizer;
pub mod token_manager;
pub mod websocket;

#[cfg(test)]
pub(crate) mod mock_client;


pub use aggregator::{AggregatorStats, CallOutput, Fetched, MultiCallAggregator};
pub use cl_sync::ConcentratedSynchronizer;
pub use cl_watcher::{FetchLevel, PoolWatcher, WatcherContext, WatcherStatus};
pub use client::{HttpNodeClient, NodeClient};
pub use config::ExtractorConfig;
pub use events::{ChainEvent, EventPosition, PoolEvent, RawLog};
pub use extractor::{Extractor, ExtractorBuilder};
pub use log_window::{BlockLogs, LogWindow, RollbackOutcome};
pub use multicall::{BatchResult, MulticallManager};
pub use pair_sync::PairSynchronizer;
pub use synchronizer::{LookupMode, PoolFuture, PoolLookup, PoolSynchronizer};
pub use token_manager::{TokenEntry, TokenManager};
pub use websocket::{LogSubscription, NotificationDecoder};
