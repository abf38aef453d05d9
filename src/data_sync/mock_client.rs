use super::client::NodeClient;
use super::contracts::Multicall3;
use crate::errors::{ExtractorError, ExtractorResult};
use alloy_primitives::{Address, B256, Bytes, U256};
use alloy_sol_types::SolCall;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Handler for one (target, selector): `None` reverts, `Some(data)` succeeds.
type CallHandler = Arc<dyn Fn(&[u8], u64) -> Option<Vec<u8>> + Send + Sync>;

/// In-memory node answering Multicall3 `tryBlockAndAggregate` batches.
///
/// Calls without a registered handler succeed with empty return data, like a call to an
/// address without code.
pub struct MockNodeClient {
    chain_id: u64,
    block_number: AtomicU64,
    handlers: Mutex<HashMap<(Address, [u8; 4]), CallHandler>>,
    call_counts: Mutex<HashMap<(Address, [u8; 4]), usize>>,
    batches: AtomicUsize,
    failing_batches: AtomicUsize,
    stalled: AtomicBool,
}

impl MockNodeClient {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            block_number: AtomicU64::new(100),
            handlers: Mutex::new(HashMap::new()),
            call_counts: Mutex::new(HashMap::new()),
            batches: AtomicUsize::new(0),
            failing_batches: AtomicUsize::new(0),
            stalled: AtomicBool::new(false),
        }
    }

    pub fn set_block_number(&self, block_number: u64) {
        self.block_number.store(block_number, Ordering::SeqCst);
    }

    /// Registers a handler that sees the decoded call and the block it executes at.
    pub fn on_call<C, F>(&self, target: Address, handler: F)
    where
        C: SolCall + 'static,
        F: Fn(C, u64) -> Option<C::Return> + Send + Sync + 'static,
    {
        let handler: CallHandler = Arc::new(move |data: &[u8], block: u64| {
            let call = C::abi_decode(data).ok()?;
            handler(call, block).map(|ret| C::abi_encode_returns(&ret))
        });
        self.handlers.lock().insert((target, C::SELECTOR), handler);
    }

    pub fn set_return<C>(&self, target: Address, ret: C::Return)
    where
        C: SolCall + 'static,
        C::Return: Clone + Send + Sync + 'static,
    {
        self.on_call::<C, _>(target, move |_, _| Some(ret.clone()));
    }

    pub fn revert<C: SolCall + 'static>(&self, target: Address) {
        self.on_call::<C, _>(target, |_, _| None);
    }

    /// Number of times `C` was called on `target` inside batches.
    pub fn call_count<C: SolCall>(&self, target: Address) -> usize {
        self.call_counts.lock().get(&(target, C::SELECTOR)).copied().unwrap_or_default()
    }

    /// Number of `eth_call` round-trips (one per batch).
    pub fn batch_count(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }

    pub fn fail_next_batches(&self, count: usize) {
        self.failing_batches.store(count, Ordering::SeqCst);
    }

    /// While stalled, every `eth_call` hangs forever.
    pub fn stall(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    fn answer(&self, call: &Multicall3::Call, block: u64) -> Multicall3::CallResult {
        let Some(selector) = call.callData.get(0..4).and_then(|s| <[u8; 4]>::try_from(s).ok()) else {
            return Multicall3::CallResult { success: true, returnData: Bytes::new() };
        };
        *self.call_counts.lock().entry((call.target, selector)).or_default() += 1;
        let handler = self.handlers.lock().get(&(call.target, selector)).cloned();
        match handler {
            Some(handler) => match handler(&call.callData, block) {
                Some(data) => Multicall3::CallResult { success: true, returnData: data.into() },
                None => Multicall3::CallResult { success: false, returnData: Bytes::new() },
            },
            None => Multicall3::CallResult { success: true, returnData: Bytes::new() },
        }
    }
}

#[async_trait]
impl NodeClient for MockNodeClient {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn eth_call(&self, _to: Address, data: Bytes, block: Option<u64>) -> ExtractorResult<Bytes> {
        self.batches.fetch_add(1, Ordering::SeqCst);
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let failing = self.failing_batches.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_batches.store(failing - 1, Ordering::SeqCst);
            return Err(ExtractorError::TransientRead("connection reset by peer".to_string()));
        }

        let request = Multicall3::tryBlockAndAggregateCall::abi_decode(&data)?;
        let block = block.unwrap_or_else(|| self.block_number.load(Ordering::SeqCst));
        let return_data = request.calls.iter().map(|call| self.answer(call, block)).collect();
        let response =
            Multicall3::tryBlockAndAggregateReturn { blockNumber: U256::from(block), blockHash: B256::ZERO, returnData: return_data };
        Ok(Multicall3::tryBlockAndAggregateCall::abi_encode_returns(&response).into())
    }

    async fn block_number(&self) -> ExtractorResult<u64> {
        Ok(self.block_number.load(Ordering::SeqCst))
    }
}
