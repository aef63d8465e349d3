//! The order manager — single writer of order state.
//!
//! Every mutation goes through the same cycle, under a per-order lock:
//!
//! ```text
//! load record ──merge/rollback/flag──▶ refresh row ──▶ commit ──▶ invalidate rank key
//! ```
//!
//! The relational commit is the source of truth. The rank cache is written
//! after the commit; a failed invalidation is parked and retried later, it
//! never rolls back or blocks the committed state.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{watch, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use ordersync_core::config::SweepConfig;
use ordersync_core::error::SyncError;
use ordersync_core::lifecycle::{Merge, StoredOrder};
use ordersync_core::order::{Order, OrderDelta, OrderStatus};
use ordersync_core::retry::{RetryConfig, RetryPolicy};
use ordersync_core::store::{AssumeFunded, MakerBalanceCheck, OrderStore, RankCache, RankKey};

/// Wall clock in milliseconds since the epoch.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// Persistence attempts per store call before giving up on a delta.
const STORE_ATTEMPTS: u32 = 3;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// What `apply` did with a delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The delta was merged and the record committed.
    Applied {
        /// Row status after the merge; `None` while the creation is unseen.
        status: Option<OrderStatus>,
        /// Status, price or existence changed and the rank key was invalidated.
        changed: bool,
    },
    /// The delta was already applied.
    Duplicate,
    /// The delta is behind state that can no longer change.
    Stale,
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

type LockKey = (String, String);

/// Exclusive access to one order. Releases its lock-map slot on drop when
/// nobody else is waiting.
struct OrderGuard<'a> {
    locks: &'a Mutex<HashMap<LockKey, Arc<tokio::sync::Mutex<()>>>>,
    key: LockKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for OrderGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = lock(self.locks);
        if locks.get(&self.key).is_some_and(|m| Arc::strong_count(m) == 1) {
            locks.remove(&self.key);
        }
    }
}

pub struct OrderManager {
    project: String,
    chains: Vec<String>,
    store: Arc<dyn OrderStore>,
    cache: Arc<dyn RankCache>,
    balances: Arc<dyn MakerBalanceCheck>,
    sweep: SweepConfig,
    retry: RetryPolicy,
    /// Blocks of delta history kept per order; `0` keeps everything.
    history_window: u64,
    clock: Clock,
    locks: Mutex<HashMap<LockKey, Arc<tokio::sync::Mutex<()>>>>,
    pending: Mutex<BTreeSet<RankKey>>,
    /// Highest block applied per chain.
    heads: Mutex<HashMap<String, u64>>,
}

impl OrderManager {
    pub fn new(
        project: impl Into<String>,
        store: Arc<dyn OrderStore>,
        cache: Arc<dyn RankCache>,
    ) -> Self {
        Self {
            project: project.into(),
            chains: Vec::new(),
            store,
            cache,
            balances: Arc::new(AssumeFunded),
            sweep: SweepConfig::default(),
            retry: RetryPolicy::new(RetryConfig::default().bounded(STORE_ATTEMPTS)),
            history_window: 0,
            clock: Arc::new(|| chrono::Utc::now().timestamp_millis()),
            locks: Mutex::new(HashMap::new()),
            pending: Mutex::new(BTreeSet::new()),
            heads: Mutex::new(HashMap::new()),
        }
    }

    /// Chains covered by the expiry sweep and balance checks.
    pub fn with_chains<I, S>(mut self, chains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.chains = chains.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_sweep(mut self, sweep: SweepConfig) -> Self {
        self.sweep = sweep;
        self
    }

    /// Backoff for store calls. The attempt count is always bounded here;
    /// the indexer owns the decision to retry a whole batch.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        let attempts = retry.max_retries.unwrap_or(STORE_ATTEMPTS).min(STORE_ATTEMPTS);
        self.retry = RetryPolicy::new(retry.bounded(attempts));
        self
    }

    pub fn with_history_window(mut self, blocks: u64) -> Self {
        self.history_window = blocks;
        self
    }

    pub fn with_balance_check(mut self, check: Arc<dyn MakerBalanceCheck>) -> Self {
        self.balances = check;
        self
    }

    /// Replace the wall clock (milliseconds since the epoch).
    pub fn with_clock(mut self, clock: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn chains(&self) -> &[String] {
        &self.chains
    }

    fn now(&self) -> (i64, i64) {
        let ms = (self.clock)();
        (ms.div_euclid(1_000), ms)
    }

    // ─── Delta application ───────────────────────────────────────────────────────

    /// Apply one delta.
    ///
    /// Redelivered deltas are no-ops; a delta older than the last applied one
    /// is merged at its position unless it would change a terminal status. The
    /// record is committed atomically, then the collection's rank key is
    /// invalidated if status or price changed.
    pub async fn apply(&self, chain: &str, delta: OrderDelta) -> Result<ApplyOutcome, SyncError> {
        let order_id = delta.order_id.clone();
        let collection = delta.collection.clone();
        let key = delta.key;
        let kind = delta.kind.name();
        lock(&self.heads)
            .entry(chain.to_string())
            .and_modify(|h| *h = (*h).max(key.block_number))
            .or_insert(key.block_number);

        let outcome = {
            let _guard = self.lock_order(chain, &order_id).await;
            let mut record = self
                .retrying(chain, "load", || self.store.load(chain, &order_id))
                .await?
                .unwrap_or_else(|| StoredOrder::new(order_id.as_str()));

            match record.merge(delta) {
                Merge::Inserted => {}
                Merge::Duplicate => {
                    debug!(chain, order_id = %order_id, key = %key, kind, "Duplicate delta ignored");
                    return Ok(ApplyOutcome::Duplicate);
                }
                Merge::Stale => {
                    let stale = SyncError::StaleDelta { order_id: order_id.clone() };
                    debug!(chain, key = %key, kind, reason = %stale, "Delta discarded");
                    return Ok(ApplyOutcome::Stale);
                }
            }

            if self.history_window > 0 {
                record.compact(key.block_number.saturating_sub(self.history_window));
            }
            let (now, now_ms) = self.now();
            let changed = record.refresh(now, now_ms);
            self.retrying(chain, "commit", || self.store.commit(chain, &record))
                .await?;

            debug!(
                chain,
                order_id = %order_id,
                key = %key,
                kind,
                status = ?record.status(),
                changed,
                "Delta applied"
            );
            ApplyOutcome::Applied {
                status: record.status(),
                changed,
            }
        };

        if matches!(outcome, ApplyOutcome::Applied { changed: true, .. }) {
            self.invalidate(chain, &collection).await;
        }
        if self.pending_invalidations() > 0 {
            self.flush_invalidations().await;
        }
        Ok(outcome)
    }

    /// Discard every delta at or above `height` on `chain` and recompute the
    /// affected orders from what remains. Returns the number of orders touched.
    pub async fn rollback(&self, chain: &str, height: u64) -> Result<usize, SyncError> {
        let ids = self
            .retrying(chain, "scan", || self.store.touched_since(chain, height))
            .await?;

        let mut touched = 0;
        let mut collections = BTreeSet::new();
        for order_id in &ids {
            let _guard = self.lock_order(chain, order_id).await;
            let Some(mut record) = self
                .retrying(chain, "load", || self.store.load(chain, order_id))
                .await?
            else {
                continue;
            };

            let collection = record
                .order
                .as_ref()
                .map(|o| o.collection_address.clone())
                .or_else(|| record.history.first().map(|d| d.collection.clone()));

            match record.rollback(height) {
                Ok(false) => continue,
                Ok(true) => {}
                Err(snapshot_block) => {
                    error!(
                        chain,
                        order_id = %order_id,
                        height,
                        snapshot_block,
                        "Rollback reaches below retained order history"
                    );
                    return Err(SyncError::ReorgTooDeep {
                        chain: chain.to_string(),
                        depth: snapshot_block.saturating_sub(height) + 1,
                        window: self.history_window,
                    });
                }
            }

            let (now, now_ms) = self.now();
            let changed = record.refresh(now, now_ms);
            self.retrying(chain, "commit", || self.store.commit(chain, &record))
                .await?;
            touched += 1;
            if changed {
                collections.extend(collection);
            }
            debug!(chain, order_id = %order_id, height, status = ?record.status(), "Order rolled back");
        }

        for collection in &collections {
            self.invalidate(chain, collection).await;
        }
        info!(chain, height, orders = touched, "Rolled back order state");
        Ok(touched)
    }

    // ─── Time- and balance-driven transitions ────────────────────────────────────

    /// Move every non-terminal order past its expiry time to Expired, on every
    /// registered chain. Returns the number of orders expired.
    pub async fn sweep_expired(&self) -> Result<usize, SyncError> {
        let mut total = 0;
        for chain in &self.chains {
            total += self.sweep_chain(chain).await?;
        }
        Ok(total)
    }

    /// Expiry sweep of one chain, in batches of `sweep.batch_size`.
    pub async fn sweep_chain(&self, chain: &str) -> Result<usize, SyncError> {
        let limit = self.sweep.batch_size.max(1);
        let mut expired = 0;
        loop {
            let (now, _) = self.now();
            let ids = self
                .retrying(chain, "scan", || self.store.expirable(chain, now, limit))
                .await?;
            if ids.is_empty() {
                break;
            }

            let mut progressed = 0;
            for order_id in &ids {
                if self.update(chain, order_id, |_| {}).await? {
                    progressed += 1;
                }
            }
            expired += progressed;
            // A batch that moved nothing would be returned again.
            if progressed == 0 || ids.len() < limit {
                break;
            }
        }
        if expired > 0 {
            info!(chain, expired, "Expiry sweep complete");
        }
        Ok(expired)
    }

    /// Drop deltas of never-created orders that fell more than `history_window`
    /// blocks behind the newest block applied on `chain`, one batch per call.
    /// Returns the number of orders pruned.
    pub async fn prune_orphans(&self, chain: &str) -> Result<usize, SyncError> {
        if self.history_window == 0 {
            return Ok(0);
        }
        let Some(head) = lock(&self.heads).get(chain).copied() else {
            return Ok(0);
        };
        let cutoff = head.saturating_sub(self.history_window);
        let limit = self.sweep.batch_size.max(1);
        let ids = self
            .retrying(chain, "scan", || self.store.orphans_before(chain, cutoff, limit))
            .await?;

        let mut pruned = 0;
        for order_id in &ids {
            let _guard = self.lock_order(chain, order_id).await;
            let Some(mut record) = self
                .retrying(chain, "load", || self.store.load(chain, order_id))
                .await?
            else {
                continue;
            };
            // The creation may have landed since the scan.
            if record.order.is_some() || record.snapshot.is_some() {
                continue;
            }
            let before = record.history.len();
            record.compact(cutoff);
            if record.history.len() == before {
                continue;
            }
            self.retrying(chain, "commit", || self.store.commit(chain, &record))
                .await?;
            pruned += 1;
            debug!(chain, order_id = %order_id, cutoff, left = record.history.len(), "Orphan deltas pruned");
        }
        if pruned > 0 {
            info!(chain, pruned, cutoff, "Orphan prune complete");
        }
        Ok(pruned)
    }

    /// Re-check makers of open orders on one chain and toggle orders between
    /// Active and Inactive. Returns the number of orders that changed.
    pub async fn check_balances(&self, chain: &str) -> Result<usize, SyncError> {
        let limit = self.sweep.batch_size.max(1);
        let mut after: Option<String> = None;
        let mut toggled = 0;
        loop {
            let page = self
                .retrying(chain, "scan", || {
                    self.store.open_orders(chain, after.as_deref(), limit)
                })
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            let next_after = last.order_id.clone();

            for order in &page {
                // The check may hit the network; no order lock is held here.
                let funded = match self.balances.is_funded(chain, order).await {
                    Ok(funded) => funded,
                    Err(e) => {
                        warn!(chain, order_id = %order.order_id, error = %e, "Balance check failed");
                        continue;
                    }
                };
                let suspend = !funded;
                if (order.status == OrderStatus::Inactive) == suspend {
                    continue;
                }
                if self.update(chain, &order.order_id, |r| r.suspended = suspend).await? {
                    toggled += 1;
                }
            }

            if page.len() < limit {
                break;
            }
            after = Some(next_after);
        }
        if toggled > 0 {
            info!(chain, toggled, "Balance check complete");
        }
        Ok(toggled)
    }

    /// Reload an order under its lock, adjust its overlay flags and refresh
    /// the row at the current time. Commits and invalidates only on change.
    async fn update(
        &self,
        chain: &str,
        order_id: &str,
        adjust: impl FnOnce(&mut StoredOrder),
    ) -> Result<bool, SyncError> {
        let collection = {
            let _guard = self.lock_order(chain, order_id).await;
            let Some(mut record) = self
                .retrying(chain, "load", || self.store.load(chain, order_id))
                .await?
            else {
                return Ok(false);
            };
            adjust(&mut record);
            let (now, now_ms) = self.now();
            if !record.refresh(now, now_ms) {
                return Ok(false);
            }
            self.retrying(chain, "commit", || self.store.commit(chain, &record))
                .await?;
            debug!(chain, order_id, status = ?record.status(), "Order status updated");
            record.order.as_ref().map(|o| o.collection_address.clone())
        };
        if let Some(collection) = collection {
            self.invalidate(chain, &collection).await;
        }
        Ok(true)
    }

    /// Run the sweep cycle every `sweep.interval_secs` until `stop` fires.
    /// Pending rank invalidations are flushed on every tick and on exit.
    pub async fn run_sweeper(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let every = Duration::from_secs(self.sweep.interval_secs.max(1));
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(interval_secs = every.as_secs(), chains = self.chains.len(), "Sweep loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep_tick().await,
                _ = stopped(&mut stop) => break,
            }
        }

        let left = self.flush_invalidations().await;
        if left > 0 {
            warn!(pending = left, "Rank invalidations still pending at shutdown");
        }
        info!("Sweep loop stopped");
    }

    async fn sweep_tick(&self) {
        self.flush_invalidations().await;
        for chain in &self.chains {
            if let Err(e) = self.sweep_chain(chain).await {
                warn!(chain = %chain, error = %e, "Expiry sweep failed");
            }
            if self.sweep.check_balances {
                if let Err(e) = self.check_balances(chain).await {
                    warn!(chain = %chain, error = %e, "Balance check pass failed");
                }
            }
            if let Err(e) = self.prune_orphans(chain).await {
                warn!(chain = %chain, error = %e, "Orphan prune failed");
            }
        }
    }

    // ─── Rank cache ──────────────────────────────────────────────────────────────

    async fn invalidate(&self, chain: &str, collection: &str) {
        let key = RankKey::new(&self.project, chain, collection);
        match self.cache.invalidate(&key).await {
            Ok(()) => debug!(key = %key, "Rank key invalidated"),
            Err(e) => {
                warn!(key = %key, error = %e, "Rank invalidation failed, queued for retry");
                lock(&self.pending).insert(key);
            }
        }
    }

    /// Retry parked rank invalidations. Returns how many are still pending.
    pub async fn flush_invalidations(&self) -> usize {
        let keys = std::mem::take(&mut *lock(&self.pending));
        if keys.is_empty() {
            return 0;
        }
        let mut failed = BTreeSet::new();
        for key in keys {
            if let Err(e) = self.cache.invalidate(&key).await {
                debug!(key = %key, error = %e, "Rank invalidation retry failed");
                failed.insert(key);
            }
        }
        let mut pending = lock(&self.pending);
        pending.extend(failed);
        pending.len()
    }

    pub fn pending_invalidations(&self) -> usize {
        lock(&self.pending).len()
    }

    // ─── Reads ───────────────────────────────────────────────────────────────────

    /// The current row of an order.
    pub async fn order(&self, chain: &str, order_id: &str) -> Result<Option<Order>, SyncError> {
        self.store.order(chain, order_id).await
    }

    /// Every row of a collection on a chain.
    pub async fn orders_by_collection(
        &self,
        chain: &str,
        collection: &str,
    ) -> Result<Vec<Order>, SyncError> {
        self.store.orders_by_collection(chain, collection).await
    }

    // ─── Internals ───────────────────────────────────────────────────────────────

    async fn lock_order(&self, chain: &str, order_id: &str) -> OrderGuard<'_> {
        let key = (chain.to_string(), order_id.to_string());
        let mutex = lock(&self.locks).entry(key.clone()).or_default().clone();
        OrderGuard {
            locks: &self.locks,
            key,
            guard: Some(mutex.lock_owned().await),
        }
    }

    async fn retrying<T, F, Fut>(&self, chain: &str, op: &str, mut call: F) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    attempt += 1;
                    let Some(delay) = self.retry.next_delay(attempt) else {
                        error!(chain, op, attempts = attempt, error = %e, "Store call failed");
                        return Err(e);
                    };
                    warn!(chain, op, attempt, error = %e, "Store call failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Resolves once `stop` carries `true`. Never resolves if the sender is gone.
pub(crate) async fn stopped(stop: &mut watch::Receiver<bool>) {
    let closed = stop.wait_for(|s| *s).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
