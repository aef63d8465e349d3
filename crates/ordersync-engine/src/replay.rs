//! In-memory chain event source.
//!
//! Serves a canonical chain of blocks and their marketplace events from
//! memory. The chain can be extended or reorganized while an indexer is
//! reading it, which makes it the source of choice for tests and for
//! replaying recorded event files.
//!
//! Block hashes are synthetic: `0x<number>-<generation>`, where the
//! generation increases on every reorg so replaced blocks never share a hash
//! with the blocks they replace.
//!
//! ```json
//! { "blocks": [
//!     { "number": 1, "timestamp": 1700000000, "events": [
//!         { "name": "OrderCreated", "collection": "0xabc", "block_number": 1, "log_index": 0,
//!           "fields": { "order_id": "0x01", "order_type": "listing", ... } } ] },
//!     { "number": 2 }
//! ] }
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use serde::Deserialize;

use ordersync_core::error::SyncError;
use ordersync_core::source::ChainEventSource;
use ordersync_core::types::{BlockSummary, ChainEvent, EventBatch};

#[derive(Debug, Clone)]
struct ReplayBlock {
    header: BlockSummary,
    events: Vec<ChainEvent>,
}

#[derive(Debug, Default)]
struct Chain {
    blocks: BTreeMap<u64, ReplayBlock>,
    generation: u32,
}

impl Chain {
    fn tip(&self) -> Option<&BlockSummary> {
        self.blocks.values().next_back().map(|b| &b.header)
    }

    fn append(&mut self, number: Option<u64>, timestamp: Option<i64>, mut events: Vec<ChainEvent>) -> u64 {
        let parent = self.tip().cloned();
        let number = number.unwrap_or_else(|| parent.as_ref().map_or(1, |p| p.number + 1));
        let timestamp = timestamp.unwrap_or_else(|| parent.as_ref().map_or(0, |p| p.timestamp + 12));
        let parent_hash = match &parent {
            Some(p) if p.number + 1 == number => p.hash.clone(),
            _ => format!("0x{:x}-0", number.saturating_sub(1)),
        };
        for event in &mut events {
            event.block_number = number;
            if event.timestamp == 0 {
                event.timestamp = timestamp;
            }
        }
        events.sort_by_key(|e| e.log_index);
        let header = BlockSummary {
            number,
            hash: format!("0x{:x}-{}", number, self.generation),
            parent_hash,
            timestamp,
        };
        self.blocks.insert(number, ReplayBlock { header, events });
        number
    }
}

/// A replayable, mutable in-memory chain.
pub struct ReplaySource {
    chain: String,
    state: RwLock<Chain>,
    failures: AtomicU32,
}

#[derive(Deserialize)]
struct ScriptBlock {
    number: Option<u64>,
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(default)]
    events: Vec<ChainEvent>,
}

#[derive(Deserialize)]
struct Script {
    blocks: Vec<ScriptBlock>,
}

impl ReplaySource {
    pub fn new(chain: impl Into<String>) -> Self {
        Self {
            chain: chain.into(),
            state: RwLock::new(Chain::default()),
            failures: AtomicU32::new(0),
        }
    }

    /// Build a chain from a JSON script (see module docs). Block numbers must
    /// be ascending and contiguous.
    pub fn from_json(chain: impl Into<String>, json: &str) -> Result<Self, SyncError> {
        let script: Script =
            serde_json::from_str(json).map_err(|e| SyncError::Config(format!("replay script: {e}")))?;
        let source = Self::new(chain);
        {
            let mut state = source.write();
            for block in script.blocks {
                if let (Some(number), Some(tip)) = (block.number, state.tip()) {
                    if number != tip.number + 1 {
                        return Err(SyncError::Config(format!(
                            "replay script: block {number} does not follow {}",
                            tip.number
                        )));
                    }
                }
                state.append(block.number, block.timestamp, block.events);
            }
        }
        Ok(source)
    }

    /// Build a chain from a flat list of events. Blocks are created from
    /// `from` up to the highest event block, empty where no event falls.
    pub fn from_events(chain: impl Into<String>, from: u64, mut events: Vec<ChainEvent>) -> Self {
        let source = Self::new(chain);
        events.sort_by_key(ChainEvent::key);
        let last = events.last().map_or(from, |e| e.block_number.max(from));
        {
            let mut state = source.write();
            let mut events = events.into_iter().peekable();
            for number in from..=last {
                let mut block_events = Vec::new();
                while let Some(event) = events.next_if(|e| e.block_number <= number) {
                    block_events.push(event);
                }
                state.append(Some(number), None, block_events);
            }
        }
        source
    }

    /// Append a block carrying `events` at the tip. Event block numbers are
    /// overwritten with the new block's number. Returns that number.
    pub fn push_block(&self, events: Vec<ChainEvent>) -> u64 {
        self.write().append(None, None, events)
    }

    /// Replace every block above `fork_height` with `replacement`, one entry
    /// per block.
    pub fn reorg(&self, fork_height: u64, replacement: Vec<Vec<ChainEvent>>) {
        let mut state = self.write();
        state.blocks.retain(|n, _| *n <= fork_height);
        state.generation += 1;
        for events in replacement {
            state.append(None, None, events);
        }
        tracing::debug!(chain = %self.chain, fork_height, generation = state.generation, "Replay chain reorganized");
    }

    /// Make the next `n` source calls fail as unavailable.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Height of the lowest block, if any block exists.
    pub fn first(&self) -> Option<u64> {
        self.read().blocks.keys().next().copied()
    }

    /// Height of the tip, if any block exists.
    pub fn head(&self) -> Option<u64> {
        self.read().tip().map(|b| b.number)
    }

    pub fn event_count(&self) -> usize {
        self.read().blocks.values().map(|b| b.events.len()).sum()
    }

    fn read(&self) -> RwLockReadGuard<'_, Chain> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Chain> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(&self) -> Result<(), SyncError> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SyncError::unavailable(&self.chain, "replay source offline"));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainEventSource for ReplaySource {
    async fn fetch(&self, from: u64, max_blocks: u64) -> Result<EventBatch, SyncError> {
        self.check_available()?;
        let state = self.read();
        let mut batch = EventBatch::default();
        for block in state.blocks.range(from..).take(max_blocks.max(1) as usize).map(|(_, b)| b) {
            batch.blocks.push(block.header.clone());
            batch.events.extend(block.events.iter().cloned());
        }
        Ok(batch)
    }

    async fn block(&self, number: u64) -> Result<Option<BlockSummary>, SyncError> {
        self.check_available()?;
        Ok(self.read().blocks.get(&number).map(|b| b.header.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(name: &str, block: u64, log: u32) -> ChainEvent {
        ChainEvent {
            name: name.into(),
            collection: "0xcoll".into(),
            block_number: block,
            log_index: log,
            tx_hash: String::new(),
            timestamp: 0,
            fields: json!({ "order_id": "0x1" }),
        }
    }

    #[tokio::test]
    async fn blocks_chain_together() {
        let source = ReplaySource::new("eth");
        source.push_block(vec![event("OrderCancelled", 0, 0)]);
        source.push_block(vec![]);
        source.push_block(vec![]);

        let batch = source.fetch(1, 2).await.unwrap();
        assert_eq!(batch.blocks.len(), 2);
        assert!(batch.is_contiguous());
        assert_eq!(batch.events[0].block_number, 1);
        assert!(source.fetch(4, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reorg_replaces_hashes_above_fork() {
        let source = ReplaySource::new("eth");
        for _ in 0..3 {
            source.push_block(vec![]);
        }
        let before = source.block(3).await.unwrap().unwrap();
        source.reorg(1, vec![vec![], vec![], vec![]]);

        let after = source.block(3).await.unwrap().unwrap();
        assert_ne!(before.hash, after.hash);
        assert_eq!(source.head(), Some(4));
        let batch = source.fetch(1, 10).await.unwrap();
        assert!(batch.is_contiguous());
    }

    #[tokio::test]
    async fn from_events_fills_gaps() {
        let source = ReplaySource::from_events(
            "eth",
            5,
            vec![event("OrderCancelled", 8, 1), event("OrderCancelled", 6, 0)],
        );
        assert_eq!(source.first(), Some(5));
        assert_eq!(source.head(), Some(8));
        let batch = source.fetch(5, 10).await.unwrap();
        assert_eq!(batch.blocks.len(), 4);
        assert_eq!(batch.events.len(), 2);
        assert_eq!(batch.events[0].block_number, 6);
    }

    #[test]
    fn from_json_script() {
        let json = r#"{ "blocks": [
            { "number": 10, "events": [
                { "name": "OrderCancelled", "collection": "0xcoll", "block_number": 0,
                  "log_index": 0, "fields": { "order_id": "0x1" } } ] },
            { "number": 11 }
        ] }"#;
        let source = ReplaySource::from_json("eth", json).unwrap();
        assert_eq!(source.head(), Some(11));
        assert_eq!(source.event_count(), 1);

        let gap = r#"{ "blocks": [ { "number": 1 }, { "number": 3 } ] }"#;
        assert!(ReplaySource::from_json("eth", gap).is_err());
    }

    #[tokio::test]
    async fn injected_failures() {
        let source = ReplaySource::new("eth");
        source.fail_next(1);
        assert!(source.fetch(1, 1).await.unwrap_err().is_retryable());
        assert!(source.fetch(1, 1).await.is_ok());
    }
}
