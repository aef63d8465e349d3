//! Reorg detection and classification.
//!
//! Before a batch is processed its first block is checked against the
//! tracked head:
//! 1. **Canonical**: the block extends the head.
//! 2. **Fork in window**: its parent is an older tracked block; the blocks
//!    above that parent were replaced.
//! 3. **Diverged**: the parent is unknown; the indexer walks backward
//!    comparing tracked hashes with the canonical chain.

use crate::error::SyncError;
use crate::tracker::BlockTracker;
use crate::types::BlockSummary;

/// Outcome of checking a new block against the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainCheck {
    /// The block extends the tracked head (or nothing is tracked yet).
    Canonical,
    /// The block's parent is tracked at this height; everything above was replaced.
    Fork { fork_height: u64 },
    /// The block's parent is not tracked; walk back to find the fork.
    Diverged,
}

/// Describes a detected chain reorganization.
#[derive(Debug, Clone)]
pub struct ReorgEvent {
    /// Height of the first block that disagreed.
    pub detected_at: u64,
    /// Last block shared by the old and the new chain.
    pub fork_height: u64,
    /// The tracked blocks that were dropped, most recent first.
    pub dropped_blocks: Vec<BlockSummary>,
    /// Number of blocks rolled back.
    pub depth: u64,
    pub reorg_type: ReorgType,
}

impl ReorgEvent {
    /// Order state derived from events at or above this height is discarded.
    pub fn rollback_height(&self) -> u64 {
        self.fork_height + 1
    }
}

/// Classification of the reorg type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReorgType {
    /// 1–3 blocks.
    ShortReorg,
    DeepReorg,
}

impl std::fmt::Display for ReorgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ShortReorg => write!(f, "short reorg"),
            Self::DeepReorg => write!(f, "deep reorg"),
        }
    }
}

/// Detects reorgs and enforces the safety window.
#[derive(Debug, Clone)]
pub struct ReorgDetector {
    chain: String,
    safety_window: u64,
}

impl ReorgDetector {
    pub fn new(chain: impl Into<String>, safety_window: u64) -> Self {
        Self {
            chain: chain.into(),
            safety_window,
        }
    }

    pub fn safety_window(&self) -> u64 {
        self.safety_window
    }

    /// Check whether `first` (the earliest block of a new batch) extends
    /// what the tracker holds.
    pub fn check(&self, tracker: &BlockTracker, first: &BlockSummary) -> ChainCheck {
        let Some(head) = tracker.head() else {
            return ChainCheck::Canonical;
        };
        if first.extends(head) {
            return ChainCheck::Canonical;
        }
        match tracker.find_hash(&first.parent_hash) {
            Some(parent) if parent.number < head.number => ChainCheck::Fork {
                fork_height: parent.number,
            },
            _ => ChainCheck::Diverged,
        }
    }

    /// Build the reorg event for a fork at `fork_height`, failing with
    /// [`SyncError::ReorgTooDeep`] when it exceeds the safety window.
    pub fn reorg(
        &self,
        tracker: &BlockTracker,
        fork_height: u64,
        detected_at: u64,
    ) -> Result<ReorgEvent, SyncError> {
        let head = tracker.head().map(|h| h.number).unwrap_or(fork_height);
        let depth = head.saturating_sub(fork_height);
        if depth > self.safety_window {
            tracing::error!(
                chain = %self.chain,
                depth,
                window = self.safety_window,
                "Reorg exceeds safety window"
            );
            return Err(self.too_deep(depth));
        }
        let dropped: Vec<_> = tracker
            .blocks()
            .rev()
            .take_while(|b| b.number > fork_height)
            .cloned()
            .collect();
        let reorg_type = if depth <= 3 {
            ReorgType::ShortReorg
        } else {
            ReorgType::DeepReorg
        };
        tracing::warn!(
            chain = %self.chain,
            depth,
            fork_height,
            at = detected_at,
            reorg_type = %reorg_type,
            "Reorg detected"
        );
        Ok(ReorgEvent {
            detected_at,
            fork_height,
            dropped_blocks: dropped,
            depth,
            reorg_type,
        })
    }

    pub fn too_deep(&self, depth: u64) -> SyncError {
        SyncError::ReorgTooDeep {
            chain: self.chain.clone(),
            depth,
            window: self.safety_window,
        }
    }
}
