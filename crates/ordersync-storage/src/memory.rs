//! In-memory storage backend.
//!
//! Stores orders, sync cursors, recent block hashes and the allow-list in
//! RAM. Useful for tests and short-lived replays that don't need persistence.
//! Faults can be injected to exercise the engine's retry paths.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use ordersync_core::cursor::{CursorStore, SyncCursor};
use ordersync_core::error::SyncError;
use ordersync_core::filter::{AllowListEntry, AllowListStore};
use ordersync_core::lifecycle::StoredOrder;
use ordersync_core::order::{Order, OrderStatus};
use ordersync_core::store::{OrderStore, RankCache, RankKey};
use ordersync_core::types::BlockSummary;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

type Partition = BTreeMap<String, StoredOrder>;

/// In-memory order, cursor and allow-list storage.
///
/// All data is lost when the process exits.
#[derive(Default)]
pub struct InMemoryStorage {
    orders: Mutex<HashMap<String, Partition>>,
    cursors: Mutex<HashMap<String, SyncCursor>>,
    blocks: Mutex<HashMap<String, BTreeMap<u64, BlockSummary>>>,
    allow_list: Mutex<HashSet<AllowListEntry>>,
    failing_commits: AtomicU32,
    allow_list_down: AtomicBool,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Approve a collection on a chain.
    pub fn allow(&self, chain: &str, collection: &str) {
        lock(&self.allow_list).insert(AllowListEntry::new(chain, collection.to_ascii_lowercase()));
    }

    /// Withdraw a collection's approval.
    pub fn disallow(&self, chain: &str, collection: &str) {
        lock(&self.allow_list).remove(&AllowListEntry::new(chain, collection.to_ascii_lowercase()));
    }

    /// Make the next `n` order commits fail with a persistence error.
    pub fn fail_next_commits(&self, n: u32) {
        self.failing_commits.store(n, Ordering::SeqCst);
    }

    /// Simulate the allow-list store being unreachable.
    pub fn set_allow_list_down(&self, down: bool) {
        self.allow_list_down.store(down, Ordering::SeqCst);
    }

    /// Number of materialized rows in a chain partition.
    pub fn order_count(&self, chain: &str) -> usize {
        lock(&self.orders)
            .get(chain)
            .map_or(0, |p| p.values().filter(|r| r.order.is_some()).count())
    }

    /// Every materialized row in a chain partition, ordered by id.
    pub fn all_orders(&self, chain: &str) -> Vec<Order> {
        lock(&self.orders)
            .get(chain)
            .map(|p| p.values().filter_map(|r| r.order.clone()).collect())
            .unwrap_or_default()
    }

    fn take_commit_fault(&self) -> bool {
        self.failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl OrderStore for InMemoryStorage {
    async fn load(&self, chain: &str, order_id: &str) -> Result<Option<StoredOrder>, SyncError> {
        Ok(lock(&self.orders)
            .get(chain)
            .and_then(|p| p.get(order_id))
            .cloned())
    }

    async fn commit(&self, chain: &str, record: &StoredOrder) -> Result<(), SyncError> {
        if self.take_commit_fault() {
            return Err(SyncError::PersistenceFailure("injected commit failure".into()));
        }
        let mut orders = lock(&self.orders);
        let partition = orders.entry(chain.to_string()).or_default();
        if record.is_empty() {
            partition.remove(&record.order_id);
        } else {
            partition.insert(record.order_id.clone(), record.clone());
        }
        Ok(())
    }

    async fn expirable(&self, chain: &str, now: i64, limit: usize) -> Result<Vec<String>, SyncError> {
        Ok(lock(&self.orders)
            .get(chain)
            .map(|p| {
                p.values()
                    .filter_map(|r| r.order.as_ref())
                    .filter(|o| o.status.is_expirable() && o.is_expired_at(now))
                    .take(limit)
                    .map(|o| o.order_id.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn touched_since(&self, chain: &str, height: u64) -> Result<Vec<String>, SyncError> {
        Ok(lock(&self.orders)
            .get(chain)
            .map(|p| {
                p.values()
                    .filter(|r| {
                        r.history.iter().any(|d| d.key.block_number >= height)
                            || r.snapshot_key.is_some_and(|k| k.block_number >= height)
                    })
                    .map(|r| r.order_id.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn orphans_before(&self, chain: &str, height: u64, limit: usize) -> Result<Vec<String>, SyncError> {
        Ok(lock(&self.orders)
            .get(chain)
            .map(|p| {
                p.values()
                    .filter(|r| r.order.is_none() && r.snapshot.is_none())
                    .filter(|r| r.history.first().is_some_and(|d| d.key.block_number < height))
                    .take(limit)
                    .map(|r| r.order_id.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn open_orders(
        &self,
        chain: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Order>, SyncError> {
        Ok(lock(&self.orders)
            .get(chain)
            .map(|p| {
                p.values()
                    .filter(|r| after.map_or(true, |a| r.order_id.as_str() > a))
                    .filter_map(|r| r.order.as_ref())
                    .filter(|o| matches!(o.status, OrderStatus::Active | OrderStatus::Inactive))
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn order(&self, chain: &str, order_id: &str) -> Result<Option<Order>, SyncError> {
        Ok(lock(&self.orders)
            .get(chain)
            .and_then(|p| p.get(order_id))
            .and_then(|r| r.order.clone()))
    }

    async fn orders_by_collection(&self, chain: &str, collection: &str) -> Result<Vec<Order>, SyncError> {
        let collection = collection.to_ascii_lowercase();
        Ok(lock(&self.orders)
            .get(chain)
            .map(|p| {
                p.values()
                    .filter_map(|r| r.order.as_ref())
                    .filter(|o| o.collection_address == collection)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl CursorStore for InMemoryStorage {
    async fn load(&self, chain: &str) -> Result<Option<SyncCursor>, SyncError> {
        Ok(lock(&self.cursors).get(chain).cloned())
    }

    async fn recent_blocks(&self, chain: &str, limit: usize) -> Result<Vec<BlockSummary>, SyncError> {
        let blocks = lock(&self.blocks);
        let Some(chain_blocks) = blocks.get(chain) else {
            return Ok(vec![]);
        };
        let mut recent: Vec<_> = chain_blocks.values().rev().take(limit).cloned().collect();
        recent.reverse();
        Ok(recent)
    }

    async fn advance(
        &self,
        cursor: &SyncCursor,
        blocks: &[BlockSummary],
        retain: u64,
    ) -> Result<(), SyncError> {
        let mut all = lock(&self.blocks);
        let chain_blocks = all.entry(cursor.chain.clone()).or_default();
        for block in blocks {
            chain_blocks.insert(block.number, block.clone());
        }
        let floor = cursor.block_number.saturating_sub(retain);
        chain_blocks.retain(|n, _| *n >= floor);
        lock(&self.cursors).insert(cursor.chain.clone(), cursor.clone());
        Ok(())
    }

    async fn rewind(&self, chain: &str, to: &BlockSummary) -> Result<(), SyncError> {
        if let Some(chain_blocks) = lock(&self.blocks).get_mut(chain) {
            chain_blocks.retain(|n, _| *n <= to.number);
        }
        lock(&self.cursors).insert(chain.to_string(), SyncCursor::new(chain, to, None));
        Ok(())
    }

    async fn delete(&self, chain: &str) -> Result<(), SyncError> {
        lock(&self.cursors).remove(chain);
        lock(&self.blocks).remove(chain);
        Ok(())
    }
}

#[async_trait]
impl AllowListStore for InMemoryStorage {
    async fn load_allow_list(&self, _project: &str) -> Result<Vec<AllowListEntry>, SyncError> {
        if self.allow_list_down.load(Ordering::SeqCst) {
            return Err(SyncError::AllowListUnavailable("allow-list store unreachable".into()));
        }
        Ok(lock(&self.allow_list).iter().cloned().collect())
    }
}

// ─── Rank cache ──────────────────────────────────────────────────────────────

/// In-memory rank cache recording invalidations per key.
#[derive(Default)]
pub struct MemoryRankCache {
    versions: Mutex<BTreeMap<String, u64>>,
    down: AtomicBool,
}

impl MemoryRankCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the cache being unreachable.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// How many times a key has been invalidated.
    pub fn invalidations(&self, key: &RankKey) -> u64 {
        lock(&self.versions).get(&key.to_string()).copied().unwrap_or(0)
    }

    /// Every key invalidated at least once.
    pub fn keys(&self) -> Vec<String> {
        lock(&self.versions).keys().cloned().collect()
    }
}

#[async_trait]
impl RankCache for MemoryRankCache {
    async fn invalidate(&self, key: &RankKey) -> Result<(), SyncError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(SyncError::CacheWriteFailure(format!("{key}: cache unreachable")));
        }
        *lock(&self.versions).entry(key.to_string()).or_insert(0) += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ordersync_core::order::{DeltaKind, OrderDelta, OrderTerms, OrderType};
    use ordersync_core::types::EventKey;
    use rust_decimal::Decimal;

    fn record(id: &str, block: u64, expire_time: i64) -> StoredOrder {
        let mut rec = StoredOrder::new(id);
        rec.merge(OrderDelta {
            order_id: id.into(),
            collection: "0xcoll".into(),
            key: EventKey::new(block, 0),
            event_time: 0,
            kind: DeltaKind::Created(OrderTerms {
                marketplace_id: 0,
                order_type: OrderType::Listing,
                token_id: "1".into(),
                currency_address: "0xeth".into(),
                price: Decimal::ONE,
                size: 1,
                maker: "0xmaker".into(),
                expire_time,
                salt: String::new(),
                signed: true,
            }),
        });
        rec.refresh(0, 1);
        rec
    }

    fn block(number: u64) -> BlockSummary {
        BlockSummary {
            number,
            hash: format!("0x{number}"),
            parent_hash: format!("0x{}", number.saturating_sub(1)),
            timestamp: 0,
        }
    }

    #[tokio::test]
    async fn commit_load_and_delete() {
        let store = InMemoryStorage::new();
        store.commit("eth", &record("0x1", 10, 0)).await.unwrap();
        assert_eq!(store.order_count("eth"), 1);
        assert_eq!(store.order_count("op"), 0);

        let loaded = OrderStore::load(&store, "eth", "0x1").await.unwrap().unwrap();
        assert_eq!(loaded.history.len(), 1);

        store.commit("eth", &StoredOrder::new("0x1")).await.unwrap();
        assert!(OrderStore::load(&store, "eth", "0x1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expirable_and_touched_queries() {
        let store = InMemoryStorage::new();
        store.commit("eth", &record("0x1", 10, 100)).await.unwrap();
        store.commit("eth", &record("0x2", 20, 500)).await.unwrap();
        store.commit("eth", &record("0x3", 30, 0)).await.unwrap();

        assert_eq!(store.expirable("eth", 200, 10).await.unwrap(), vec!["0x1".to_string()]);
        assert_eq!(store.expirable("eth", 1_000, 1).await.unwrap().len(), 1);
        assert_eq!(store.touched_since("eth", 20).await.unwrap(), vec!["0x2", "0x3"]);

        let open = store.open_orders("eth", Some("0x1"), 10).await.unwrap();
        assert_eq!(open.len(), 2);
        assert_eq!(open[0].order_id, "0x2");
    }

    #[tokio::test]
    async fn orphans_before_skips_created_orders() {
        let store = InMemoryStorage::new();
        store.commit("eth", &record("0x1", 3, 0)).await.unwrap();
        let mut orphan = StoredOrder::new("0x2");
        orphan.merge(OrderDelta {
            order_id: "0x2".into(),
            collection: "0xcoll".into(),
            key: EventKey::new(4, 0),
            event_time: 0,
            kind: DeltaKind::Cancelled,
        });
        store.commit("eth", &orphan).await.unwrap();

        assert!(store.orphans_before("eth", 4, 10).await.unwrap().is_empty());
        assert_eq!(store.orphans_before("eth", 5, 10).await.unwrap(), vec!["0x2"]);
        assert!(store.orphans_before("op", 5, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn injected_commit_failures() {
        let store = InMemoryStorage::new();
        store.fail_next_commits(1);
        assert!(store.commit("eth", &record("0x1", 1, 0)).await.is_err());
        assert!(store.commit("eth", &record("0x1", 1, 0)).await.is_ok());
    }

    #[tokio::test]
    async fn cursor_advance_and_rewind() {
        let store = InMemoryStorage::new();
        let blocks: Vec<_> = (1..=10).map(block).collect();
        let cursor = SyncCursor::new("eth", &blocks[9], Some(2));
        store.advance(&cursor, &blocks, 4).await.unwrap();

        let recent = store.recent_blocks("eth", 100).await.unwrap();
        assert_eq!(recent.first().unwrap().number, 6);
        assert_eq!(recent.last().unwrap().number, 10);

        store.rewind("eth", &block(8)).await.unwrap();
        let cp = CursorStore::load(&store, "eth").await.unwrap().unwrap();
        assert_eq!(cp.block_number, 8);
        assert_eq!(store.recent_blocks("eth", 100).await.unwrap().len(), 3);

        store.delete("eth").await.unwrap();
        assert!(CursorStore::load(&store, "eth").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn allow_list_roundtrip() {
        let store = InMemoryStorage::new();
        store.allow("eth", "0xABC");
        assert_eq!(store.load_allow_list("p").await.unwrap().len(), 1);
        store.disallow("eth", "0xabc");
        assert!(store.load_allow_list("p").await.unwrap().is_empty());
        store.set_allow_list_down(true);
        assert!(store.load_allow_list("p").await.is_err());
    }

    #[tokio::test]
    async fn rank_cache_counts_invalidations() {
        let cache = MemoryRankCache::new();
        let key = RankKey::new("p", "eth", "0xabc");
        cache.invalidate(&key).await.unwrap();
        cache.invalidate(&key).await.unwrap();
        assert_eq!(cache.invalidations(&key), 2);
        cache.set_down(true);
        assert!(matches!(
            cache.invalidate(&key).await,
            Err(SyncError::CacheWriteFailure(_))
        ));
    }
}
