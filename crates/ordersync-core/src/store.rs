//! Storage, cache and balance-check seams used by the order manager.

use async_trait::async_trait;

use crate::error::SyncError;
use crate::lifecycle::StoredOrder;
use crate::order::Order;

/// Relational order store, partitioned by chain.
///
/// Every method is scoped to one chain partition. `commit` must be atomic:
/// the row and its retained history are written together or not at all.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Load the full record (row, snapshot, history) of an order.
    async fn load(&self, chain: &str, order_id: &str) -> Result<Option<StoredOrder>, SyncError>;

    /// Upsert the record by order id. An empty record is deleted.
    async fn commit(&self, chain: &str, record: &StoredOrder) -> Result<(), SyncError>;

    /// Ids of non-terminal orders with `0 < expire_time <= now`, at most `limit`.
    async fn expirable(&self, chain: &str, now: i64, limit: usize) -> Result<Vec<String>, SyncError>;

    /// Ids of orders holding history (or a snapshot) at or above `height`.
    async fn touched_since(&self, chain: &str, height: u64) -> Result<Vec<String>, SyncError>;

    /// Ids of orders with no row and no snapshot whose oldest delta is below
    /// `height`, at most `limit`.
    async fn orphans_before(&self, chain: &str, height: u64, limit: usize) -> Result<Vec<String>, SyncError>;

    /// Active and Inactive orders ordered by id, starting after `after`.
    async fn open_orders(
        &self,
        chain: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Order>, SyncError>;

    /// The queryable row of an order.
    async fn order(&self, chain: &str, order_id: &str) -> Result<Option<Order>, SyncError>;

    /// Every row of a collection, ordered by order id.
    async fn orders_by_collection(&self, chain: &str, collection: &str) -> Result<Vec<Order>, SyncError>;
}

/// Cache key summarising order-book ranking data for one collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RankKey {
    pub project: String,
    pub chain: String,
    pub collection: String,
}

impl RankKey {
    pub fn new(project: &str, chain: &str, collection: &str) -> Self {
        Self {
            project: project.to_string(),
            chain: chain.to_string(),
            collection: collection.to_string(),
        }
    }
}

impl std::fmt::Display for RankKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cache:{}:{}:collection:{}:rank",
            self.project, self.chain, self.collection
        )
    }
}

/// Key-value cache holding rank data. Best effort: written after commit.
#[async_trait]
pub trait RankCache: Send + Sync {
    /// Mark the rank data of a collection as stale.
    async fn invalidate(&self, key: &RankKey) -> Result<(), SyncError>;
}

/// Maker balance / allowance check run during the sweep cycle.
#[async_trait]
pub trait MakerBalanceCheck: Send + Sync {
    /// Returns `false` if the maker can no longer honour the order.
    async fn is_funded(&self, chain: &str, order: &Order) -> Result<bool, SyncError>;
}

/// Balance check that trusts every maker.
#[derive(Debug, Default, Clone, Copy)]
pub struct AssumeFunded;

#[async_trait]
impl MakerBalanceCheck for AssumeFunded {
    async fn is_funded(&self, _chain: &str, _order: &Order) -> Result<bool, SyncError> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_key_format() {
        let key = RankKey::new("easyswap", "sepolia", "0xabc");
        assert_eq!(key.to_string(), "cache:easyswap:sepolia:collection:0xabc:rank");
    }
}
