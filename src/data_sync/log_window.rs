use super::events::{EventPosition, RawLog};
use alloy_primitives::Address;
use std::collections::VecDeque;
use tracing::warn;

/// Logs of one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockLogs {
    pub block_number: u64,
    pub logs: Vec<RawLog>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackOutcome {
    /// The blocks after the ancestor were dropped; removed logs are returned.
    Within(Vec<RawLog>),
    /// The ancestor is older than the window. The window was cleared.
    BeyondWindow,
}

/// Ring buffer of the logs of the last `depth` blocks.
///
/// Blocks older than `head - depth` are final and handed back by [`LogWindow::push`] so the
/// owner can fold them into its baselines.
#[derive(Debug, Clone)]
pub struct LogWindow {
    depth: u64,
    blocks: VecDeque<BlockLogs>,
    head: u64,
}

impl LogWindow {
    pub fn new(depth: u64) -> Self {
        Self { depth: depth.max(1), blocks: VecDeque::new(), head: 0 }
    }

    pub fn depth(&self) -> u64 {
        self.depth
    }

    /// Highest block seen so far.
    pub fn head(&self) -> u64 {
        self.head
    }

    pub fn len_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Appends a log and returns the logs of blocks that left the window.
    ///
    /// Logs must arrive in (block, log index) order; a log older than the newest block is
    /// dropped with a warning.
    pub fn push(&mut self, log: RawLog) -> Vec<BlockLogs> {
        match self.blocks.back_mut() {
            Some(back) if back.block_number == log.block_number => back.logs.push(log),
            Some(back) if back.block_number > log.block_number => {
                warn!("Dropping out-of-order log for block {} (window head {})", log.block_number, back.block_number);
                return Vec::new();
            }
            _ => {
                self.head = self.head.max(log.block_number);
                self.blocks.push_back(BlockLogs { block_number: log.block_number, logs: vec![log] });
            }
        }
        self.evict()
    }

    /// Records that the chain reached `block_number` even if it carried no relevant logs.
    pub fn advance_head(&mut self, block_number: u64) -> Vec<BlockLogs> {
        self.head = self.head.max(block_number);
        self.evict()
    }

    fn evict(&mut self) -> Vec<BlockLogs> {
        let oldest_kept = self.head.saturating_sub(self.depth);
        let mut finalized = Vec::new();
        while self.blocks.front().is_some_and(|b| b.block_number <= oldest_kept) {
            if let Some(block) = self.blocks.pop_front() {
                finalized.push(block);
            }
        }
        finalized
    }

    /// Lowest ancestor a rollback can reach without leaving the window.
    pub fn oldest_recoverable(&self) -> u64 {
        self.head.saturating_sub(self.depth)
    }

    /// Drops every block after `common_ancestor`.
    pub fn rollback(&mut self, common_ancestor: u64) -> RollbackOutcome {
        if common_ancestor < self.oldest_recoverable() {
            self.blocks.clear();
            self.head = common_ancestor;
            return RollbackOutcome::BeyondWindow;
        }
        let mut removed = Vec::new();
        while self.blocks.back().is_some_and(|b| b.block_number > common_ancestor) {
            if let Some(block) = self.blocks.pop_back() {
                removed.push(block);
            }
        }
        self.head = self.head.min(common_ancestor);
        RollbackOutcome::Within(removed.into_iter().rev().flat_map(|b| b.logs).collect())
    }

    /// Logs of `address` strictly after `after`, in order.
    pub fn logs_for(&self, address: Address, after: EventPosition) -> Vec<RawLog> {
        self.logs_after(after).filter(|log| log.address == address).cloned().collect()
    }

    /// Every log strictly after `after`, in order.
    pub fn logs_after(&self, after: EventPosition) -> impl Iterator<Item = &RawLog> {
        self.blocks
            .iter()
            .filter(move |b| b.block_number >= after.block_number)
            .flat_map(|b| b.logs.iter())
            .filter(move |log| log.position() > after)
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }
}
