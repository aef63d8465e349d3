//! Block tracker — keeps the hashes of recently processed blocks so the
//! indexer can verify that each new batch extends what it already ingested.

use std::collections::VecDeque;

use crate::types::BlockSummary;

/// Tracks the last N processed block headers.
///
/// The window must be one block larger than the reorg safety window so the
/// deepest allowed fork point is still present.
#[derive(Debug, Clone)]
pub struct BlockTracker {
    /// Sliding window of recent blocks (oldest first).
    window: VecDeque<BlockSummary>,
    /// Maximum number of blocks to retain.
    window_size: usize,
}

impl BlockTracker {
    pub fn new(window_size: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(window_size.min(1024)),
            window_size: window_size.max(1),
        }
    }

    /// Rebuild a tracker from persisted blocks (ascending).
    pub fn restore(window_size: usize, blocks: impl IntoIterator<Item = BlockSummary>) -> Self {
        let mut tracker = Self::new(window_size);
        for block in blocks {
            tracker.append(block);
        }
        tracker
    }

    /// Add a new block to the tracker.
    ///
    /// Returns `Err(block)` without modifying the window if it does not
    /// extend the current head.
    pub fn push(&mut self, block: BlockSummary) -> Result<(), BlockSummary> {
        if let Some(head) = self.window.back() {
            if !block.extends(head) {
                return Err(block);
            }
        }
        self.append(block);
        Ok(())
    }

    fn append(&mut self, block: BlockSummary) {
        if self.window.len() >= self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(block);
    }

    /// Returns the most recently added block.
    pub fn head(&self) -> Option<&BlockSummary> {
        self.window.back()
    }

    /// Returns the oldest retained block.
    pub fn tail(&self) -> Option<&BlockSummary> {
        self.window.front()
    }

    /// Returns a block by number if it's in the window.
    pub fn get(&self, number: u64) -> Option<&BlockSummary> {
        let first = self.window.front()?.number;
        let idx = number.checked_sub(first)? as usize;
        self.window.get(idx).filter(|b| b.number == number)
    }

    /// Returns the tracked block whose hash is `hash`.
    pub fn find_hash(&self, hash: &str) -> Option<&BlockSummary> {
        self.window.iter().rev().find(|b| b.hash == hash)
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Tracked blocks, oldest first.
    pub fn blocks(&self) -> impl DoubleEndedIterator<Item = &BlockSummary> {
        self.window.iter()
    }

    /// Discard every block above `block_number`.
    pub fn rewind_to(&mut self, block_number: u64) {
        while let Some(back) = self.window.back() {
            if back.number > block_number {
                self.window.pop_back();
            } else {
                break;
            }
        }
    }
}
