//! Shared types for the ingestion pipeline.

use serde::{Deserialize, Serialize};

// ─── BlockSummary ─────────────────────────────────────────────────────────────

/// A minimal summary of a block: enough to track progress and detect reorgs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSummary {
    /// Block number.
    pub number: u64,
    /// Block hash (`0x…`).
    pub hash: String,
    /// Parent block hash (`0x…`).
    pub parent_hash: String,
    /// Unix timestamp of the block (seconds since epoch).
    #[serde(default)]
    pub timestamp: i64,
}

impl BlockSummary {
    /// Returns `true` if `parent` is the direct parent of `self`.
    pub fn extends(&self, parent: &BlockSummary) -> bool {
        self.number == parent.number + 1 && self.parent_hash == parent.hash
    }
}

// ─── EventKey ─────────────────────────────────────────────────────────────────

/// Position of an event in chain history. Orders by block, then log index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventKey {
    pub block_number: u64,
    pub log_index: u32,
}

impl EventKey {
    pub fn new(block_number: u64, log_index: u32) -> Self {
        Self {
            block_number,
            log_index,
        }
    }
}

impl std::fmt::Display for EventKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.block_number, self.log_index)
    }
}

// ─── ChainEvent ───────────────────────────────────────────────────────────────

/// A normalized marketplace event as produced by a chain event source.
///
/// The source has already decoded the log; `fields` holds the named
/// arguments as JSON so new event shapes can flow through without a
/// schema change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainEvent {
    /// Event name (e.g. `"OrderCreated"`, `"LogMake"`).
    pub name: String,
    /// NFT collection the event refers to.
    pub collection: String,
    /// Block number.
    pub block_number: u64,
    /// Log index within the block.
    pub log_index: u32,
    /// Transaction hash.
    #[serde(default)]
    pub tx_hash: String,
    /// Block timestamp (seconds).
    #[serde(default)]
    pub timestamp: i64,
    /// Decoded event arguments.
    #[serde(default)]
    pub fields: serde_json::Value,
}

impl ChainEvent {
    pub fn key(&self) -> EventKey {
        EventKey::new(self.block_number, self.log_index)
    }
}

// ─── EventBatch ───────────────────────────────────────────────────────────────

/// One pull from a chain event source: a contiguous run of blocks and the
/// marketplace events they contain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventBatch {
    /// Blocks in ascending order, starting at the requested height.
    pub blocks: Vec<BlockSummary>,
    /// Events ordered by `(block_number, log_index)`.
    pub events: Vec<ChainEvent>,
}

impl EventBatch {
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn first_block(&self) -> Option<&BlockSummary> {
        self.blocks.first()
    }

    pub fn last_block(&self) -> Option<&BlockSummary> {
        self.blocks.last()
    }

    /// Returns `true` if every block extends the one before it.
    pub fn is_contiguous(&self) -> bool {
        self.blocks.windows(2).all(|w| w[1].extends(&w[0]))
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
