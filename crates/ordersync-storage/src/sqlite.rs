//! SQLite storage backend for OrderSync.
//!
//! Each chain gets its own pair of tables, created on first use:
//!
//! - `ob_order_<chain>`: one row per order (the queryable columns, plus the
//!   compacted snapshot and the overlay flags)
//! - `ob_order_history_<chain>`: the retained deltas, keyed by
//!   `(order_id, block_number, log_index)`
//!
//! Cursors, recent block hashes and the allow-list live in shared tables.
//!
//! # Usage
//! ```rust,no_run
//! use ordersync_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = SqliteStorage::open("./orders.db").await?;
//! let scratch = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Mutex;

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use ordersync_core::config::ChainConfig;
use ordersync_core::cursor::{CursorStore, SyncCursor};
use ordersync_core::error::SyncError;
use ordersync_core::filter::{AllowListEntry, AllowListStore};
use ordersync_core::lifecycle::StoredOrder;
use ordersync_core::order::{Order, OrderDelta, OrderStatus, OrderType};
use ordersync_core::store::OrderStore;
use ordersync_core::types::{BlockSummary, EventKey};

fn storage_err(e: impl std::fmt::Display) -> SyncError {
    SyncError::PersistenceFailure(e.to_string())
}

const ORDER_COLUMNS: &str = "order_id, marketplace_id, order_type, collection_address, token_id,
     currency_address, price, size, quantity_remaining, maker, taker, event_time,
     expire_time, salt, order_status, create_time, update_time";

/// SQLite-backed order, cursor and allow-list storage.
pub struct SqliteStorage {
    pool: SqlitePool,
    partitions: Mutex<HashSet<String>>,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./orders.db"`) or a full
    /// SQLite URL (`"sqlite:./orders.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, SyncError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };
        let pool = SqlitePool::connect(&url).await.map_err(storage_err)?;
        let storage = Self::with_pool(pool);
        storage.init_schema(true).await?;
        Ok(storage)
    }

    /// Open an in-memory SQLite database.
    ///
    /// A single connection is used so every query sees the same database.
    pub async fn in_memory() -> Result<Self, SyncError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(storage_err)?;
        let storage = Self::with_pool(pool);
        storage.init_schema(false).await?;
        Ok(storage)
    }

    fn with_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            partitions: Mutex::new(HashSet::new()),
        }
    }

    async fn init_schema(&self, wal: bool) -> Result<(), SyncError> {
        if wal {
            sqlx::query("PRAGMA journal_mode=WAL;")
                .execute(&self.pool)
                .await
                .map_err(storage_err)?;
        }

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sync_cursors (
                chain        TEXT    NOT NULL PRIMARY KEY,
                block_number INTEGER NOT NULL,
                block_hash   TEXT    NOT NULL,
                log_index    INTEGER,
                updated_at   INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS block_hashes (
                chain        TEXT    NOT NULL,
                block_number INTEGER NOT NULL,
                block_hash   TEXT    NOT NULL,
                parent_hash  TEXT    NOT NULL,
                timestamp    INTEGER NOT NULL,
                PRIMARY KEY (chain, block_number)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS collection_allow_list (
                project    TEXT NOT NULL,
                chain      TEXT NOT NULL,
                collection TEXT NOT NULL,
                PRIMARY KEY (project, chain, collection)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    /// Create the order tables of a chain if they don't exist yet.
    async fn partition(&self, chain: &str) -> Result<(String, String), SyncError> {
        if !ChainConfig::is_valid_partition_name(chain) {
            return Err(SyncError::Config(format!("invalid partition name '{chain}'")));
        }
        let orders = format!("ob_order_{chain}");
        let history = format!("ob_order_history_{chain}");
        let known = self
            .partitions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(chain);
        if known {
            return Ok((orders, history));
        }

        let statements = [
            format!(
                "CREATE TABLE IF NOT EXISTS {orders} (
                    order_id           TEXT    NOT NULL PRIMARY KEY,
                    marketplace_id     INTEGER,
                    order_type         INTEGER,
                    collection_address TEXT,
                    token_id           TEXT,
                    currency_address   TEXT,
                    price              TEXT,
                    size               INTEGER,
                    quantity_remaining INTEGER,
                    maker              TEXT,
                    taker              TEXT,
                    event_time         INTEGER,
                    expire_time        INTEGER,
                    salt               TEXT,
                    order_status       INTEGER,
                    create_time        INTEGER,
                    update_time        INTEGER,
                    snapshot_json      TEXT,
                    snapshot_block     INTEGER,
                    snapshot_log_index INTEGER,
                    suspended          INTEGER NOT NULL DEFAULT 0,
                    expired            INTEGER NOT NULL DEFAULT 0
                );"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{orders}_collection
                 ON {orders} (collection_address, order_id);"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{orders}_expiry
                 ON {orders} (order_status, expire_time);"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {history} (
                    order_id     TEXT    NOT NULL,
                    block_number INTEGER NOT NULL,
                    log_index    INTEGER NOT NULL,
                    delta_json   TEXT    NOT NULL,
                    PRIMARY KEY (order_id, block_number, log_index)
                );"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{history}_block
                 ON {history} (block_number);"
            ),
        ];
        for sql in &statements {
            sqlx::query(sql).execute(&self.pool).await.map_err(storage_err)?;
        }

        self.partitions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(chain.to_string());
        debug!(chain, "order partition ready");
        Ok((orders, history))
    }

    // ─── Allow-list ──────────────────────────────────────────────────────────────

    /// Approve a collection for a project.
    pub async fn insert_allowed(
        &self,
        project: &str,
        chain: &str,
        collection: &str,
    ) -> Result<(), SyncError> {
        sqlx::query(
            "INSERT OR IGNORE INTO collection_allow_list (project, chain, collection)
             VALUES (?, ?, ?)",
        )
        .bind(project)
        .bind(chain)
        .bind(collection.to_ascii_lowercase())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    /// Withdraw a collection's approval.
    pub async fn remove_allowed(
        &self,
        project: &str,
        chain: &str,
        collection: &str,
    ) -> Result<(), SyncError> {
        sqlx::query(
            "DELETE FROM collection_allow_list WHERE project = ? AND chain = ? AND collection = ?",
        )
        .bind(project)
        .bind(chain)
        .bind(collection.to_ascii_lowercase())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }
}

// ─── Row mapping ─────────────────────────────────────────────────────────────

fn order_from_row(row: &SqliteRow) -> Result<Option<Order>, SyncError> {
    let Some(status) = row.get::<Option<i64>, _>("order_status") else {
        return Ok(None);
    };
    let status = OrderStatus::from_code(status)
        .ok_or_else(|| storage_err(format!("unknown order status {status}")))?;
    let order_type: i64 = row.get("order_type");
    let order_type = OrderType::from_code(order_type)
        .ok_or_else(|| storage_err(format!("unknown order type {order_type}")))?;
    let price: String = row.get("price");
    let price = Decimal::from_str(&price).map_err(storage_err)?;

    Ok(Some(Order {
        order_id: row.get("order_id"),
        marketplace_id: row.get("marketplace_id"),
        order_type,
        collection_address: row.get("collection_address"),
        token_id: row.get("token_id"),
        currency_address: row.get("currency_address"),
        price,
        size: row.get::<i64, _>("size") as u64,
        quantity_remaining: row.get::<i64, _>("quantity_remaining") as u64,
        maker: row.get("maker"),
        taker: row.get("taker"),
        event_time: row.get("event_time"),
        expire_time: row.get("expire_time"),
        salt: row.get("salt"),
        status,
        create_time: row.get("create_time"),
        update_time: row.get("update_time"),
    }))
}

#[async_trait]
impl OrderStore for SqliteStorage {
    async fn load(&self, chain: &str, order_id: &str) -> Result<Option<StoredOrder>, SyncError> {
        let (orders, history) = self.partition(chain).await?;
        let row = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS}, snapshot_json, snapshot_block, snapshot_log_index,
                    suspended, expired
             FROM {orders} WHERE order_id = ?"
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;
        let Some(row) = row else {
            return Ok(None);
        };

        let snapshot = match row.get::<Option<String>, _>("snapshot_json") {
            Some(json) => Some(serde_json::from_str::<Order>(&json).map_err(storage_err)?),
            None => None,
        };
        let snapshot_key = match (
            row.get::<Option<i64>, _>("snapshot_block"),
            row.get::<Option<i64>, _>("snapshot_log_index"),
        ) {
            (Some(block), Some(log)) => Some(EventKey::new(block as u64, log as u32)),
            _ => None,
        };

        let deltas = sqlx::query(&format!(
            "SELECT delta_json FROM {history} WHERE order_id = ?
             ORDER BY block_number, log_index"
        ))
        .bind(order_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        let mut history_rows = Vec::with_capacity(deltas.len());
        for delta in deltas {
            let json: String = delta.get("delta_json");
            history_rows.push(serde_json::from_str::<OrderDelta>(&json).map_err(storage_err)?);
        }

        Ok(Some(StoredOrder {
            order_id: order_id.to_string(),
            order: order_from_row(&row)?,
            snapshot,
            snapshot_key,
            history: history_rows,
            suspended: row.get::<i64, _>("suspended") != 0,
            expired: row.get::<i64, _>("expired") != 0,
        }))
    }

    async fn commit(&self, chain: &str, record: &StoredOrder) -> Result<(), SyncError> {
        let (orders, history) = self.partition(chain).await?;
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        sqlx::query(&format!("DELETE FROM {history} WHERE order_id = ?"))
            .bind(&record.order_id)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;

        if record.is_empty() {
            sqlx::query(&format!("DELETE FROM {orders} WHERE order_id = ?"))
                .bind(&record.order_id)
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;
            tx.commit().await.map_err(storage_err)?;
            debug!(chain, order_id = %record.order_id, "order removed");
            return Ok(());
        }

        let snapshot_json = record
            .snapshot
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(storage_err)?;
        let o = record.order.as_ref();
        sqlx::query(&format!(
            "INSERT OR REPLACE INTO {orders}
             ({ORDER_COLUMNS}, snapshot_json, snapshot_block, snapshot_log_index, suspended, expired)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&record.order_id)
        .bind(o.map(|o| o.marketplace_id))
        .bind(o.map(|o| o.order_type.code()))
        .bind(o.map(|o| o.collection_address.clone()))
        .bind(o.map(|o| o.token_id.clone()))
        .bind(o.map(|o| o.currency_address.clone()))
        .bind(o.map(|o| o.price.to_string()))
        .bind(o.map(|o| o.size as i64))
        .bind(o.map(|o| o.quantity_remaining as i64))
        .bind(o.map(|o| o.maker.clone()))
        .bind(o.map(|o| o.taker.clone()))
        .bind(o.map(|o| o.event_time))
        .bind(o.map(|o| o.expire_time))
        .bind(o.map(|o| o.salt.clone()))
        .bind(o.map(|o| o.status.code()))
        .bind(o.map(|o| o.create_time))
        .bind(o.map(|o| o.update_time))
        .bind(snapshot_json)
        .bind(record.snapshot_key.map(|k| k.block_number as i64))
        .bind(record.snapshot_key.map(|k| k.log_index as i64))
        .bind(record.suspended as i64)
        .bind(record.expired as i64)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        for delta in &record.history {
            let json = serde_json::to_string(delta).map_err(storage_err)?;
            sqlx::query(&format!(
                "INSERT INTO {history} (order_id, block_number, log_index, delta_json)
                 VALUES (?, ?, ?, ?)"
            ))
            .bind(&record.order_id)
            .bind(delta.key.block_number as i64)
            .bind(delta.key.log_index as i64)
            .bind(json)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        }

        tx.commit().await.map_err(storage_err)?;
        debug!(
            chain,
            order_id = %record.order_id,
            status = ?record.status(),
            deltas = record.history.len(),
            "order committed"
        );
        Ok(())
    }

    async fn expirable(&self, chain: &str, now: i64, limit: usize) -> Result<Vec<String>, SyncError> {
        let (orders, _) = self.partition(chain).await?;
        let rows = sqlx::query(&format!(
            "SELECT order_id FROM {orders}
             WHERE order_status IN (?, ?, ?) AND expire_time > 0 AND expire_time <= ?
             ORDER BY order_id LIMIT ?"
        ))
        .bind(OrderStatus::Active.code())
        .bind(OrderStatus::Inactive.code())
        .bind(OrderStatus::NeedSign.code())
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(rows.iter().map(|r| r.get("order_id")).collect())
    }

    async fn touched_since(&self, chain: &str, height: u64) -> Result<Vec<String>, SyncError> {
        let (orders, history) = self.partition(chain).await?;
        let rows = sqlx::query(&format!(
            "SELECT order_id FROM {history} WHERE block_number >= ?
             UNION
             SELECT order_id FROM {orders} WHERE snapshot_block >= ?
             ORDER BY order_id"
        ))
        .bind(height as i64)
        .bind(height as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(rows.iter().map(|r| r.get("order_id")).collect())
    }

    async fn orphans_before(&self, chain: &str, height: u64, limit: usize) -> Result<Vec<String>, SyncError> {
        let (orders, history) = self.partition(chain).await?;
        let rows = sqlx::query(&format!(
            "SELECT h.order_id AS order_id FROM {history} h
             JOIN {orders} o ON o.order_id = h.order_id
             WHERE o.order_status IS NULL AND o.snapshot_json IS NULL
             GROUP BY h.order_id
             HAVING MIN(h.block_number) < ?
             ORDER BY h.order_id LIMIT ?"
        ))
        .bind(height as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(rows.iter().map(|r| r.get("order_id")).collect())
    }

    async fn open_orders(
        &self,
        chain: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Order>, SyncError> {
        let (orders, _) = self.partition(chain).await?;
        let rows = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM {orders}
             WHERE order_status IN (?, ?) AND order_id > ?
             ORDER BY order_id LIMIT ?"
        ))
        .bind(OrderStatus::Active.code())
        .bind(OrderStatus::Inactive.code())
        .bind(after.unwrap_or(""))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.extend(order_from_row(row)?);
        }
        Ok(out)
    }

    async fn order(&self, chain: &str, order_id: &str) -> Result<Option<Order>, SyncError> {
        let (orders, _) = self.partition(chain).await?;
        let row = sqlx::query(&format!("SELECT {ORDER_COLUMNS} FROM {orders} WHERE order_id = ?"))
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        match row {
            Some(row) => order_from_row(&row),
            None => Ok(None),
        }
    }

    async fn orders_by_collection(&self, chain: &str, collection: &str) -> Result<Vec<Order>, SyncError> {
        let (orders, _) = self.partition(chain).await?;
        let rows = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM {orders}
             WHERE collection_address = ? ORDER BY order_id"
        ))
        .bind(collection.to_ascii_lowercase())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.extend(order_from_row(row)?);
        }
        Ok(out)
    }
}

// ─── CursorStore impl ────────────────────────────────────────────────────────

#[async_trait]
impl CursorStore for SqliteStorage {
    async fn load(&self, chain: &str) -> Result<Option<SyncCursor>, SyncError> {
        let row = sqlx::query(
            "SELECT chain, block_number, block_hash, log_index, updated_at
             FROM sync_cursors WHERE chain = ?",
        )
        .bind(chain)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(row.map(|r| SyncCursor {
            chain: r.get("chain"),
            block_number: r.get::<i64, _>("block_number") as u64,
            block_hash: r.get("block_hash"),
            log_index: r.get::<Option<i64>, _>("log_index").map(|i| i as u32),
            updated_at: r.get("updated_at"),
        }))
    }

    async fn recent_blocks(&self, chain: &str, limit: usize) -> Result<Vec<BlockSummary>, SyncError> {
        let rows = sqlx::query(
            "SELECT block_number, block_hash, parent_hash, timestamp FROM block_hashes
             WHERE chain = ? ORDER BY block_number DESC LIMIT ?",
        )
        .bind(chain)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        let mut blocks: Vec<BlockSummary> = rows
            .iter()
            .map(|r| BlockSummary {
                number: r.get::<i64, _>("block_number") as u64,
                hash: r.get("block_hash"),
                parent_hash: r.get("parent_hash"),
                timestamp: r.get("timestamp"),
            })
            .collect();
        blocks.reverse();
        Ok(blocks)
    }

    async fn advance(
        &self,
        cursor: &SyncCursor,
        blocks: &[BlockSummary],
        retain: u64,
    ) -> Result<(), SyncError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        for block in blocks {
            sqlx::query(
                "INSERT OR REPLACE INTO block_hashes
                 (chain, block_number, block_hash, parent_hash, timestamp)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&cursor.chain)
            .bind(block.number as i64)
            .bind(&block.hash)
            .bind(&block.parent_hash)
            .bind(block.timestamp)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        }

        sqlx::query("DELETE FROM block_hashes WHERE chain = ? AND block_number < ?")
            .bind(&cursor.chain)
            .bind(cursor.block_number.saturating_sub(retain) as i64)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;

        sqlx::query(
            "INSERT OR REPLACE INTO sync_cursors
             (chain, block_number, block_hash, log_index, updated_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&cursor.chain)
        .bind(cursor.block_number as i64)
        .bind(&cursor.block_hash)
        .bind(cursor.log_index.map(i64::from))
        .bind(cursor.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        tx.commit().await.map_err(storage_err)?;
        debug!(chain = %cursor.chain, block = cursor.block_number, "cursor saved");
        Ok(())
    }

    async fn rewind(&self, chain: &str, to: &BlockSummary) -> Result<(), SyncError> {
        let cursor = SyncCursor::new(chain, to, None);
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        sqlx::query("DELETE FROM block_hashes WHERE chain = ? AND block_number > ?")
            .bind(chain)
            .bind(to.number as i64)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;

        sqlx::query(
            "INSERT OR REPLACE INTO sync_cursors
             (chain, block_number, block_hash, log_index, updated_at)
             VALUES (?, ?, ?, NULL, ?)",
        )
        .bind(chain)
        .bind(cursor.block_number as i64)
        .bind(&cursor.block_hash)
        .bind(cursor.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        tx.commit().await.map_err(storage_err)?;
        debug!(chain, block = to.number, "cursor rewound");
        Ok(())
    }

    async fn delete(&self, chain: &str) -> Result<(), SyncError> {
        sqlx::query("DELETE FROM sync_cursors WHERE chain = ?")
            .bind(chain)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        sqlx::query("DELETE FROM block_hashes WHERE chain = ?")
            .bind(chain)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }
}

// ─── AllowListStore impl ─────────────────────────────────────────────────────

#[async_trait]
impl AllowListStore for SqliteStorage {
    async fn load_allow_list(&self, project: &str) -> Result<Vec<AllowListEntry>, SyncError> {
        let rows = sqlx::query(
            "SELECT chain, collection FROM collection_allow_list WHERE project = ?",
        )
        .bind(project)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SyncError::AllowListUnavailable(e.to_string()))?;

        Ok(rows
            .iter()
            .map(|r| AllowListEntry::new(r.get::<String, _>("chain"), r.get::<String, _>("collection")))
            .collect())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use ordersync_core::order::{DeltaKind, FillAmount, OrderTerms};

    fn delta(id: &str, block: u64, log: u32, kind: DeltaKind) -> OrderDelta {
        OrderDelta {
            order_id: id.into(),
            collection: "0xcoll".into(),
            key: EventKey::new(block, log),
            event_time: 1_700_000_000,
            kind,
        }
    }

    fn created(size: u64, expire_time: i64) -> DeltaKind {
        DeltaKind::Created(OrderTerms {
            marketplace_id: 1,
            order_type: OrderType::Listing,
            token_id: "42".into(),
            currency_address: "0xeth".into(),
            price: Decimal::from_str("1.25").unwrap(),
            size,
            maker: "0xmaker".into(),
            expire_time,
            salt: "7".into(),
            signed: true,
        })
    }

    fn block(number: u64) -> BlockSummary {
        BlockSummary {
            number,
            hash: format!("0x{number:064x}"),
            parent_hash: format!("0x{:064x}", number.saturating_sub(1)),
            timestamp: number as i64,
        }
    }

    // ── OrderStore ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn order_roundtrip_with_history() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let mut rec = StoredOrder::new("0x1");
        rec.merge(delta("0x1", 10, 0, created(3, 0)));
        rec.merge(delta(
            "0x1",
            12,
            1,
            DeltaKind::Filled { amount: FillAmount::Filled(1), taker: "0xbob".into() },
        ));
        rec.refresh(1_700_000_000, 1_700_000_000_000);
        store.commit("sepolia", &rec).await.unwrap();

        let loaded = OrderStore::load(&store, "sepolia", "0x1").await.unwrap().unwrap();
        assert_eq!(loaded, rec);

        let row = store.order("sepolia", "0x1").await.unwrap().unwrap();
        assert_eq!(row.quantity_remaining, 2);
        assert_eq!(row.price.to_string(), "1.25");
        assert_eq!(row.taker, "0xbob");
    }

    #[tokio::test]
    async fn orphan_record_has_no_row() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let mut rec = StoredOrder::new("0x2");
        rec.merge(delta("0x2", 5, 0, DeltaKind::Cancelled));
        rec.refresh(0, 0);
        store.commit("sepolia", &rec).await.unwrap();

        assert!(store.order("sepolia", "0x2").await.unwrap().is_none());
        let loaded = OrderStore::load(&store, "sepolia", "0x2").await.unwrap().unwrap();
        assert_eq!(loaded.history.len(), 1);
        assert!(loaded.order.is_none());

        let mut live = StoredOrder::new("0x3");
        live.merge(delta("0x3", 4, 0, created(1, 0)));
        live.refresh(0, 0);
        store.commit("sepolia", &live).await.unwrap();
        assert!(store.orphans_before("sepolia", 5, 10).await.unwrap().is_empty());
        assert_eq!(store.orphans_before("sepolia", 6, 10).await.unwrap(), vec!["0x2".to_string()]);
    }

    #[tokio::test]
    async fn compacted_snapshot_survives_roundtrip() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let mut rec = StoredOrder::new("0x3");
        rec.merge(delta("0x3", 10, 0, created(1, 0)));
        rec.merge(delta("0x3", 20, 0, DeltaKind::PriceUpdated { price: Decimal::TWO }));
        rec.compact(15);
        rec.refresh(0, 0);
        store.commit("sepolia", &rec).await.unwrap();

        let loaded = OrderStore::load(&store, "sepolia", "0x3").await.unwrap().unwrap();
        assert_eq!(loaded.snapshot_key, Some(EventKey::new(10, 0)));
        assert_eq!(loaded.history.len(), 1);
        assert_eq!(loaded.order.unwrap().price, Decimal::TWO);
        assert_eq!(store.touched_since("sepolia", 5).await.unwrap(), vec!["0x3".to_string()]);
    }

    #[tokio::test]
    async fn queries_are_partitioned_by_chain() {
        let store = SqliteStorage::in_memory().await.unwrap();
        for (id, expire) in [("0xa", 100), ("0xb", 0), ("0xc", 900)] {
            let mut rec = StoredOrder::new(id);
            rec.merge(delta(id, 1, 0, created(1, expire)));
            rec.refresh(50, 50_000);
            store.commit("sepolia", &rec).await.unwrap();
        }

        assert_eq!(store.expirable("sepolia", 200, 10).await.unwrap(), vec!["0xa".to_string()]);
        assert!(store.expirable("base", 200, 10).await.unwrap().is_empty());
        assert_eq!(store.orders_by_collection("sepolia", "0xCOLL").await.unwrap().len(), 3);

        let page = store.open_orders("sepolia", Some("0xa"), 1).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].order_id, "0xb");
    }

    #[tokio::test]
    async fn empty_record_deletes() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let mut rec = StoredOrder::new("0x4");
        rec.merge(delta("0x4", 3, 0, created(1, 0)));
        rec.refresh(0, 0);
        store.commit("sepolia", &rec).await.unwrap();

        store.commit("sepolia", &StoredOrder::new("0x4")).await.unwrap();
        assert!(OrderStore::load(&store, "sepolia", "0x4").await.unwrap().is_none());
        assert!(store.touched_since("sepolia", 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_partition_name_is_rejected() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let err = store.order("eth; DROP TABLE x", "0x1").await.unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    // ── CursorStore ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn cursor_advance_prunes_old_hashes() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let blocks: Vec<_> = (100..=110).map(block).collect();
        let cursor = SyncCursor::new("sepolia", &blocks[10], Some(3));
        store.advance(&cursor, &blocks, 5).await.unwrap();

        let loaded = CursorStore::load(&store, "sepolia").await.unwrap().unwrap();
        assert_eq!(loaded.block_number, 110);
        assert_eq!(loaded.log_index, Some(3));

        let recent = store.recent_blocks("sepolia", 100).await.unwrap();
        assert_eq!(recent.first().unwrap().number, 105);
        assert_eq!(recent.last().unwrap().number, 110);
        assert_eq!(store.recent_blocks("sepolia", 2).await.unwrap()[0].number, 109);
    }

    #[tokio::test]
    async fn cursor_rewind_and_delete() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let blocks: Vec<_> = (1..=10).map(block).collect();
        store
            .advance(&SyncCursor::new("sepolia", &blocks[9], None), &blocks, 64)
            .await
            .unwrap();
        store.advance(&SyncCursor::new("base", &blocks[9], None), &blocks, 64).await.unwrap();

        store.rewind("sepolia", &blocks[6]).await.unwrap();
        let cp = CursorStore::load(&store, "sepolia").await.unwrap().unwrap();
        assert_eq!(cp.block_number, 7);
        assert_eq!(store.recent_blocks("sepolia", 100).await.unwrap().len(), 7);
        assert_eq!(store.recent_blocks("base", 100).await.unwrap().len(), 10);

        store.delete("sepolia").await.unwrap();
        assert!(CursorStore::load(&store, "sepolia").await.unwrap().is_none());
        assert!(CursorStore::load(&store, "base").await.unwrap().is_some());
    }

    // ── AllowListStore ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn allow_list_by_project() {
        let store = SqliteStorage::in_memory().await.unwrap();
        store.insert_allowed("easyswap", "sepolia", "0xABC").await.unwrap();
        store.insert_allowed("easyswap", "sepolia", "0xabc").await.unwrap();
        store.insert_allowed("other", "sepolia", "0xdef").await.unwrap();

        let entries = store.load_allow_list("easyswap").await.unwrap();
        assert_eq!(entries, vec![AllowListEntry::new("sepolia", "0xabc")]);

        store.remove_allowed("easyswap", "sepolia", "0xabc").await.unwrap();
        assert!(store.load_allow_list("easyswap").await.unwrap().is_empty());
    }
}
