//! The chain event source seam.
//!
//! A source is bound to one chain and hides the RPC mechanics (block and log
//! fetching, decoding). The engine only pulls normalized batches from it.

use async_trait::async_trait;

use crate::error::SyncError;
use crate::types::{BlockSummary, EventBatch};

#[async_trait]
pub trait ChainEventSource: Send + Sync {
    /// Fetch up to `max_blocks` consecutive blocks starting at `from`, with
    /// their events ordered by `(block, log_index)`. An empty batch means the
    /// source has nothing past `from` yet.
    ///
    /// Must be restartable from any previously seen height.
    async fn fetch(&self, from: u64, max_blocks: u64) -> Result<EventBatch, SyncError>;

    /// The canonical header at `number`, if the chain has reached it.
    async fn block(&self, number: u64) -> Result<Option<BlockSummary>, SyncError>;
}
