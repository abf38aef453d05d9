use super::multicall::MulticallManager;
use crate::errors::{ExtractorError, ExtractorResult};
use alloy_primitives::{Address, Bytes};
use alloy_sol_types::SolCall;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Raw result of one aggregated call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOutput {
    /// Block the batch containing this call executed at.
    pub block_number: u64,
    pub return_data: Bytes,
}

/// Decoded result of one aggregated call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched<T> {
    pub value: T,
    pub block_number: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregatorStats {
    pub batches_sent: u64,
    pub calls_sent: u64,
    pub batches_failed: u64,
}

struct PendingCall {
    target: Address,
    call_data: Bytes,
    reply: oneshot::Sender<ExtractorResult<CallOutput>>,
}

struct AggregatorInner {
    multicall: MulticallManager,
    batch_window: Duration,
    max_calls_per_batch: usize,
    /// Calls waiting for the next flush, grouped by block tag (`None` = latest).
    pending: Mutex<HashMap<Option<u64>, Vec<PendingCall>>>,
    batches_sent: AtomicU64,
    calls_sent: AtomicU64,
    batches_failed: AtomicU64,
}

/// Coalesces independent read calls into Multicall3 batches.
///
/// Calls issued within one batching window for the same block tag share a batch; groups
/// larger than `max_calls_per_batch` are split. Every call resolves exactly once, either
/// with its own return data or with an explicit error. The aggregator never retries.
#[derive(Clone)]
pub struct MultiCallAggregator {
    inner: Arc<AggregatorInner>,
}

impl MultiCallAggregator {
    pub fn new(multicall: MulticallManager, batch_window: Duration, max_calls_per_batch: usize) -> Self {
        Self {
            inner: Arc::new(AggregatorInner {
                multicall,
                batch_window,
                max_calls_per_batch: max_calls_per_batch.max(1),
                pending: Mutex::new(HashMap::new()),
                batches_sent: AtomicU64::new(0),
                calls_sent: AtomicU64::new(0),
                batches_failed: AtomicU64::new(0),
            }),
        }
    }

    pub fn stats(&self) -> AggregatorStats {
        AggregatorStats {
            batches_sent: self.inner.batches_sent.load(Ordering::Relaxed),
            calls_sent: self.inner.calls_sent.load(Ordering::Relaxed),
            batches_failed: self.inner.batches_failed.load(Ordering::Relaxed),
        }
    }

    pub async fn call_raw(&self, target: Address, call_data: Bytes, block: Option<u64>) -> ExtractorResult<CallOutput> {
        let (reply, response) = oneshot::channel();

        let (schedule_flush, full_group) = {
            let mut pending = self.inner.pending.lock();
            let group = pending.entry(block).or_default();
            group.push(PendingCall { target, call_data, reply });
            if group.len() >= self.inner.max_calls_per_batch {
                (false, pending.remove(&block))
            } else {
                (group.len() == 1, None)
            }
        };

        if let Some(calls) = full_group {
            AggregatorInner::dispatch(&self.inner, block, calls);
        } else if schedule_flush {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                if inner.batch_window.is_zero() {
                    tokio::task::yield_now().await;
                } else {
                    tokio::time::sleep(inner.batch_window).await;
                }
                let calls = inner.pending.lock().remove(&block);
                if let Some(calls) = calls {
                    AggregatorInner::dispatch(&inner, block, calls);
                }
            });
        }

        response.await.map_err(|_| ExtractorError::BatchFailed("aggregator dropped the request".to_string()))?
    }

    /// Typed call: encodes `call`, aggregates it, decodes the return value.
    ///
    /// Empty return data (a call to an address without code) is a decode error.
    pub async fn call<C: SolCall>(&self, target: Address, call: &C, block: Option<u64>) -> ExtractorResult<Fetched<C::Return>> {
        let output = self.call_raw(target, call.abi_encode().into(), block).await?;
        if output.return_data.is_empty() {
            return Err(ExtractorError::Decode(format!("empty return data from {target}")));
        }
        let value = C::abi_decode_returns(&output.return_data)?;
        Ok(Fetched { value, block_number: output.block_number })
    }
}

impl AggregatorInner {
    fn dispatch(inner: &Arc<AggregatorInner>, block: Option<u64>, mut calls: Vec<PendingCall>) {
        while !calls.is_empty() {
            let rest = calls.split_off(calls.len().min(inner.max_calls_per_batch));
            let chunk = std::mem::replace(&mut calls, rest);
            let inner = inner.clone();
            tokio::spawn(async move { inner.execute_chunk(block, chunk).await });
        }
    }

    async fn execute_chunk(&self, block: Option<u64>, chunk: Vec<PendingCall>) {
        let start = Instant::now();
        let size = chunk.len();
        let calls = chunk.iter().map(|c| MulticallManager::prepare_call(c.target, c.call_data.clone())).collect();

        self.batches_sent.fetch_add(1, Ordering::Relaxed);
        self.calls_sent.fetch_add(size as u64, Ordering::Relaxed);

        match self.multicall.execute(calls, block).await {
            Ok(batch) => {
                debug!("Multicall batch of {} calls at block {} completed in {:?}", size, batch.block_number, start.elapsed());
                for (pending, (success, return_data)) in chunk.into_iter().zip(batch.results) {
                    let result = if success {
                        Ok(CallOutput { block_number: batch.block_number, return_data })
                    } else {
                        Err(ExtractorError::CallReverted(pending.target))
                    };
                    // The caller may have given up waiting.
                    let _ = pending.reply.send(result);
                }
            }
            Err(e) => {
                self.batches_failed.fetch_add(1, Ordering::Relaxed);
                warn!("Multicall batch of {} calls failed after {:?}: {}", size, start.elapsed(), e);
                for pending in chunk {
                    let _ = pending.reply.send(Err(e.clone()));
                }
            }
        }
    }
}
