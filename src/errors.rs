use alloy_primitives::Address;

/// Errors raised by the extraction core.
///
/// The type is `Clone` because results travel through shared (single-flight) futures where
/// every joiner receives its own copy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtractorError {
    #[error("node read failed: {0}")]
    TransientRead(String),
    #[error("batched call failed: {0}")]
    BatchFailed(String),
    #[error("call to {0} reverted")]
    CallReverted(Address),
    #[error("failed to decode call result: {0}")]
    Decode(String),
    #[error("token {0} is not a conforming ERC20 contract")]
    UnresolvableToken(Address),
    #[error("rollback to block {common_ancestor} exceeds the reorg window of {depth} blocks (head {head})")]
    ReorgBeyondWindow { common_ancestor: u64, head: u64, depth: u64 },
    #[error("pool watcher {pool} failed after {attempts} attempts")]
    WatcherFailed { pool: Address, attempts: u32 },
    #[error("invalid pool event: {0}")]
    InvalidEvent(String),
    #[error("invalid swap request: {0}")]
    InvalidSwap(String),
    #[error("cache error: {0}")]
    Cache(String),
    #[error("configuration error: {0}")]
    Config(String),
}

pub type ExtractorResult<T> = Result<T, ExtractorError>;

impl ExtractorError {
    /// Errors worth another attempt. Reverts and decode failures are deterministic.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientRead(_) | Self::BatchFailed(_))
    }
}

impl From<alloy_sol_types::Error> for ExtractorError {
    fn from(error: alloy_sol_types::Error) -> Self {
        Self::Decode(error.to_string())
    }
}

impl From<std::io::Error> for ExtractorError {
    fn from(error: std::io::Error) -> Self {
        Self::Cache(error.to_string())
    }
}

impl From<serde_json::Error> for ExtractorError {
    fn from(error: serde_json::Error) -> Self {
        Self::Cache(error.to_string())
    }
}

impl From<reqwest::Error> for ExtractorError {
    fn from(error: reqwest::Error) -> Self {
        Self::TransientRead(error.to_string())
    }
}
