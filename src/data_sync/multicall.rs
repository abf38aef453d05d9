use super::client::NodeClient;
use super::contracts::Multicall3;
use crate::errors::{ExtractorError, ExtractorResult};
use alloy_primitives::{Address, Bytes};
use alloy_sol_types::SolCall;
use std::sync::Arc;

/// Outcome of one Multicall3 batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchResult {
    pub block_number: u64,
    /// `(success, returnData)` per call, in request order.
    pub results: Vec<(bool, Bytes)>,
}

/// Encodes calls into `tryBlockAndAggregate(false, calls)` and executes them through a node.
#[derive(Clone)]
pub struct MulticallManager {
    multicall_address: Address,
    client: Arc<dyn NodeClient>,
}

impl MulticallManager {
    pub fn new(multicall_address: Address, client: Arc<dyn NodeClient>) -> Self {
        Self { multicall_address, client }
    }

    pub fn multicall_address(&self) -> Address {
        self.multicall_address
    }

    pub fn prepare_call(target: Address, call_data: Bytes) -> Multicall3::Call {
        Multicall3::Call { target, callData: call_data }
    }

    pub fn encode_batch(calls: Vec<Multicall3::Call>) -> Bytes {
        Multicall3::tryBlockAndAggregateCall { requireSuccess: false, calls }.abi_encode().into()
    }

    pub fn decode_batch(data: &[u8], expected_calls: usize) -> ExtractorResult<BatchResult> {
        let decoded = Multicall3::tryBlockAndAggregateCall::abi_decode_returns(data)?;
        if decoded.returnData.len() != expected_calls {
            return Err(ExtractorError::Decode(format!(
                "multicall returned {} results for {} calls",
                decoded.returnData.len(),
                expected_calls
            )));
        }
        let block_number = u64::try_from(decoded.blockNumber).map_err(|e| ExtractorError::Decode(e.to_string()))?;
        let results = decoded.returnData.into_iter().map(|r| (r.success, r.returnData)).collect();
        Ok(BatchResult { block_number, results })
    }

    /// Executes one batch. Any failure of the outer call fails the whole batch.
    pub async fn execute(&self, calls: Vec<Multicall3::Call>, block: Option<u64>) -> ExtractorResult<BatchResult> {
        if calls.is_empty() {
            return Err(ExtractorError::BatchFailed("empty multicall batch".to_string()));
        }
        let expected_calls = calls.len();
        let response = self
            .client
            .eth_call(self.multicall_address, Self::encode_batch(calls), block)
            .await
            .map_err(|e| ExtractorError::BatchFailed(e.to_string()))?;

        Self::decode_batch(&response, expected_calls).map_err(|e| ExtractorError::BatchFailed(e.to_string()))
    }
}
