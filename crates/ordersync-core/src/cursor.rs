//! Sync cursor — the last durably processed position of a chain.
//!
//! The cursor is written only after every delta of a batch has been applied,
//! so a crash re-processes the batch (idempotently) rather than skipping it.
//! The hashes of recent blocks are persisted with it so reorgs can still be
//! detected after a restart.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::types::BlockSummary;

/// A persisted sync cursor for one chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    /// Chain partition name.
    pub chain: String,
    /// Last fully processed block number.
    pub block_number: u64,
    /// Hash of that block.
    pub block_hash: String,
    /// Last processed log index within the block, if it contained events.
    pub log_index: Option<u32>,
    /// Unix timestamp of when this cursor was saved.
    pub updated_at: i64,
}

impl SyncCursor {
    pub fn new(chain: impl Into<String>, block: &BlockSummary, log_index: Option<u32>) -> Self {
        Self {
            chain: chain.into(),
            block_number: block.number,
            block_hash: block.hash.clone(),
            log_index,
            updated_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Returns the next block to process (cursor + 1).
    pub fn next_block(&self) -> u64 {
        self.block_number + 1
    }
}

/// Trait for storing and loading sync cursors.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Load the cursor for a chain.
    async fn load(&self, chain: &str) -> Result<Option<SyncCursor>, SyncError>;

    /// The most recent `limit` processed blocks, oldest first.
    async fn recent_blocks(&self, chain: &str, limit: usize) -> Result<Vec<BlockSummary>, SyncError>;

    /// Atomically record `blocks`, move the cursor and forget blocks more
    /// than `retain` below the cursor.
    async fn advance(
        &self,
        cursor: &SyncCursor,
        blocks: &[BlockSummary],
        retain: u64,
    ) -> Result<(), SyncError>;

    /// Move the cursor back to `to` and forget every block above it.
    async fn rewind(&self, chain: &str, to: &BlockSummary) -> Result<(), SyncError>;

    /// Delete the cursor and block history (e.g. when resetting a chain).
    async fn delete(&self, chain: &str) -> Result<(), SyncError>;
}
