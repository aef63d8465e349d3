//! The orderbook indexer — one ingestion loop per chain.
//!
//! Each step pulls the next batch from the chain's event source and:
//!
//! 1. verifies the first block extends the last tracked block (reorg check)
//! 2. drops events for collections outside the allow-list
//! 3. classifies the remaining events into order deltas (malformed ones are
//!    logged and skipped)
//! 4. hands every delta to the order manager, in `(block, log_index)` order
//! 5. persists the sync cursor together with the batch's block hashes
//!
//! The cursor is written last: a crash or a failed commit leaves it behind
//! the batch, which is then fetched and applied again (idempotently).
//!
//! On a reorg the indexer finds the fork point, asks the order manager to roll
//! back everything above it, rewinds the cursor and resumes from there.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use ordersync_core::config::ChainConfig;
use ordersync_core::cursor::{CursorStore, SyncCursor};
use ordersync_core::error::SyncError;
use ordersync_core::event::classify;
use ordersync_core::filter::CollectionFilter;
use ordersync_core::reorg::{ChainCheck, ReorgDetector, ReorgEvent};
use ordersync_core::retry::{RetryConfig, RetryPolicy};
use ordersync_core::source::ChainEventSource;
use ordersync_core::tracker::BlockTracker;
use ordersync_core::types::{BlockSummary, EventBatch};

use crate::order_manager::{stopped, ApplyOutcome, OrderManager};

/// Counters for one processed batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub from_block: u64,
    pub to_block: u64,
    pub events: usize,
    /// Deltas merged into an order.
    pub applied: usize,
    /// Events for collections outside the allow-list.
    pub filtered: usize,
    /// Events that could not be classified.
    pub malformed: usize,
    /// Duplicate or stale deltas.
    pub discarded: usize,
}

/// Result of one indexer step.
#[derive(Debug)]
pub enum Step {
    /// The source has nothing new.
    Idle,
    Batch(BatchReport),
    /// A reorg was handled; the next step resumes above the fork.
    Reorg(ReorgEvent),
}

pub struct OrderbookIndexer {
    chain: ChainConfig,
    source: Arc<dyn ChainEventSource>,
    cursors: Arc<dyn CursorStore>,
    filter: Arc<CollectionFilter>,
    manager: Arc<OrderManager>,
    retry: RetryPolicy,
    stop: watch::Receiver<bool>,
    tracker: BlockTracker,
    detector: ReorgDetector,
    next: u64,
    resumed: bool,
}

impl OrderbookIndexer {
    pub fn new(
        chain: ChainConfig,
        source: Arc<dyn ChainEventSource>,
        cursors: Arc<dyn CursorStore>,
        filter: Arc<CollectionFilter>,
        manager: Arc<OrderManager>,
    ) -> Self {
        // A watch receiver whose sender is gone never reports a stop.
        let (_never, stop) = watch::channel(false);
        let window = chain.reorg_safety_window;
        Self {
            tracker: BlockTracker::new(window as usize + 1),
            detector: ReorgDetector::new(chain.name.clone(), window),
            next: chain.genesis_height,
            source,
            cursors,
            filter,
            manager,
            retry: RetryPolicy::default(),
            stop,
            resumed: false,
            chain,
        }
    }

    /// Backoff for source calls and uncommitted batches.
    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = RetryPolicy::new(config);
        self
    }

    /// Cooperative stop signal, checked between batches and during backoff.
    pub fn with_stop(mut self, stop: watch::Receiver<bool>) -> Self {
        self.stop = stop;
        self
    }

    pub fn chain(&self) -> &ChainConfig {
        &self.chain
    }

    /// Next block height to fetch.
    pub fn next_block(&self) -> u64 {
        self.next
    }

    /// Run until stopped or until an error the loop cannot absorb.
    ///
    /// Source failures are retried forever with capped backoff. A batch whose
    /// deltas cannot be committed is retried from the same height. A reorg
    /// deeper than the safety window ends the loop with
    /// [`SyncError::ReorgTooDeep`].
    pub async fn run(&mut self) -> Result<(), SyncError> {
        self.resume().await?;
        let poll = Duration::from_millis(self.chain.poll_interval_ms);
        let mut failures = 0u32;

        loop {
            if self.stop_requested() {
                info!(chain = %self.chain.name, next = self.next, "Indexer stopped");
                return Ok(());
            }

            let pause = match self.step().await {
                Ok(Step::Batch(report)) => {
                    failures = 0;
                    info!(
                        chain = %self.chain.name,
                        from = report.from_block,
                        to = report.to_block,
                        events = report.events,
                        applied = report.applied,
                        filtered = report.filtered,
                        malformed = report.malformed,
                        discarded = report.discarded,
                        "Batch complete"
                    );
                    None
                }
                Ok(Step::Reorg(_)) => {
                    failures = 0;
                    None
                }
                Ok(Step::Idle) => Some(poll),
                Err(SyncError::Aborted { .. }) => {
                    info!(chain = %self.chain.name, next = self.next, "Indexer stopped");
                    return Ok(());
                }
                Err(e @ SyncError::PersistenceFailure(_)) => {
                    failures += 1;
                    let delay = self.retry.next_delay(failures).unwrap_or_else(|| {
                        Duration::from_millis(self.retry.config.max_backoff_ms)
                    });
                    warn!(
                        chain = %self.chain.name,
                        next = self.next,
                        failures,
                        error = %e,
                        "Batch not committed, cursor held"
                    );
                    Some(delay)
                }
                Err(e) => return Err(e),
            };

            if let Some(delay) = pause {
                if self.wait(delay).await.is_err() {
                    info!(chain = %self.chain.name, next = self.next, "Indexer stopped");
                    return Ok(());
                }
            }
        }
    }

    /// Load the cursor and the recent block hashes. Called by `run`; only
    /// needed directly when driving the indexer with `step`.
    pub async fn resume(&mut self) -> Result<(), SyncError> {
        let name = self.chain.name.as_str();
        match self.cursors.load(name).await? {
            Some(cursor) => {
                let blocks = self
                    .cursors
                    .recent_blocks(name, self.chain.reorg_safety_window as usize + 1)
                    .await?;
                self.tracker = BlockTracker::restore(self.chain.reorg_safety_window as usize + 1, blocks);
                self.next = cursor.next_block();
                info!(
                    chain = name,
                    block = cursor.block_number,
                    hash = %cursor.block_hash,
                    tracked = self.tracker.len(),
                    "Resuming from cursor"
                );
            }
            None => {
                self.next = self.chain.genesis_height;
                info!(chain = name, from = self.next, "No cursor, starting from genesis height");
            }
        }
        self.resumed = true;
        Ok(())
    }

    /// Fetch and process one batch.
    pub async fn step(&mut self) -> Result<Step, SyncError> {
        if !self.resumed {
            self.resume().await?;
        }

        let from = self.next;
        let batch = self.fetch(from).await?;
        let (Some(first), Some(last)) = (batch.first_block().cloned(), batch.last_block().cloned())
        else {
            debug!(chain = %self.chain.name, from, "Nothing new");
            return Ok(Step::Idle);
        };

        match self.detector.check(&self.tracker, &first) {
            ChainCheck::Canonical => {}
            ChainCheck::Fork { fork_height } => {
                return self.handle_reorg(fork_height, first.number).await.map(Step::Reorg);
            }
            ChainCheck::Diverged => {
                let fork_height = self.find_fork().await?;
                return self.handle_reorg(fork_height, first.number).await.map(Step::Reorg);
            }
        }

        let report = self.process(&batch, &first, &last).await?;

        let last_log = batch
            .events
            .iter()
            .filter(|e| e.block_number == last.number)
            .map(|e| e.log_index)
            .max();
        let cursor = SyncCursor::new(self.chain.name.as_str(), &last, last_log);
        self.cursors
            .advance(&cursor, &batch.blocks, self.chain.reorg_safety_window)
            .await?;

        for block in batch.blocks {
            if let Err(block) = self.tracker.push(block) {
                // Contiguity was checked on fetch; a gap here means the
                // tracker and the cursor disagree. Restart from the cursor.
                warn!(chain = %self.chain.name, block = block.number, "Tracker out of step, reloading");
                self.resumed = false;
                break;
            }
        }
        self.next = last.number + 1;
        Ok(Step::Batch(report))
    }

    async fn process(
        &self,
        batch: &EventBatch,
        first: &BlockSummary,
        last: &BlockSummary,
    ) -> Result<BatchReport, SyncError> {
        let name = self.chain.name.as_str();
        let mut report = BatchReport {
            from_block: first.number,
            to_block: last.number,
            events: batch.events.len(),
            ..Default::default()
        };

        for event in &batch.events {
            if !self.filter.is_allowed(name, &event.collection) {
                report.filtered += 1;
                debug!(chain = name, collection = %event.collection, key = %event.key(), "Event filtered");
                continue;
            }
            let delta = match classify(name, event) {
                Ok(delta) => delta,
                Err(e @ SyncError::MalformedEvent { .. }) => {
                    report.malformed += 1;
                    warn!(chain = name, tx = %event.tx_hash, error = %e, "Skipping malformed event");
                    continue;
                }
                Err(e) => return Err(e),
            };
            match self.manager.apply(name, delta).await? {
                ApplyOutcome::Applied { .. } => report.applied += 1,
                ApplyOutcome::Duplicate | ApplyOutcome::Stale => report.discarded += 1,
            }
        }
        Ok(report)
    }

    // ─── Reorg handling ──────────────────────────────────────────────────────────

    /// Walk back through the tracked blocks until the source agrees with one.
    async fn find_fork(&self) -> Result<u64, SyncError> {
        let tracked: Vec<BlockSummary> = self.tracker.blocks().rev().cloned().collect();
        let Some(head) = tracked.first().map(|b| b.number) else {
            return Err(SyncError::Other("reorg walk with an empty tracker".into()));
        };

        for block in &tracked {
            let number = block.number;
            let canonical = self.call("block", || self.source.block(number)).await?;
            match canonical {
                Some(c) if c.hash == block.hash => {
                    debug!(chain = %self.chain.name, fork_height = number, "Fork point found");
                    return Ok(number);
                }
                _ => {
                    if head - number >= self.detector.safety_window() {
                        break;
                    }
                }
            }
        }

        let depth = tracked.len() as u64;
        error!(
            chain = %self.chain.name,
            head,
            depth,
            window = self.detector.safety_window(),
            "No common ancestor inside the safety window"
        );
        Err(self.detector.too_deep(depth))
    }

    async fn handle_reorg(&mut self, fork_height: u64, detected_at: u64) -> Result<ReorgEvent, SyncError> {
        let event = self.detector.reorg(&self.tracker, fork_height, detected_at)?;
        let fork_block = self
            .tracker
            .get(fork_height)
            .cloned()
            .ok_or_else(|| SyncError::Other(format!("fork block {fork_height} is not tracked")))?;

        let rolled_back = self
            .manager
            .rollback(&self.chain.name, event.rollback_height())
            .await?;
        self.cursors.rewind(&self.chain.name, &fork_block).await?;
        self.tracker.rewind_to(fork_height);
        self.next = fork_height + 1;

        warn!(
            chain = %self.chain.name,
            fork_height,
            depth = event.depth,
            dropped = event.dropped_blocks.len(),
            orders = rolled_back,
            "Reorg handled, resuming above fork"
        );
        Ok(event)
    }

    // ─── Source calls ────────────────────────────────────────────────────────────

    async fn fetch(&self, from: u64) -> Result<EventBatch, SyncError> {
        let max_blocks = self.chain.batch_size;
        let batch = self
            .call("fetch", || self.source.fetch(from, max_blocks))
            .await?;
        // Checked outside the retry: a batch that does not line up is retried
        // by the next step with the same height.
        match validate(&self.chain.name, from, batch) {
            Ok(batch) => Ok(batch),
            Err(e) => {
                warn!(chain = %self.chain.name, from, error = %e, "Rejected batch");
                let delay = self.retry.next_delay(1).unwrap_or(Duration::from_millis(
                    self.retry.config.initial_backoff_ms,
                ));
                self.wait(delay).await?;
                Ok(EventBatch::default())
            }
        }
    }

    /// Call the source with a timeout, retrying unavailability with backoff.
    async fn call<T, F, Fut>(&self, op: &str, mut call: F) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let timeout = Duration::from_millis(self.chain.fetch_timeout_ms);
        let mut attempt = 0;
        loop {
            let result = match tokio::time::timeout(timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(SyncError::unavailable(
                    &self.chain.name,
                    format!("{op} timed out after {}ms", timeout.as_millis()),
                )),
            };
            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    attempt += 1;
                    let Some(delay) = self.retry.next_delay(attempt) else {
                        return Err(e);
                    };
                    warn!(
                        chain = %self.chain.name,
                        op,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Source call failed, retrying"
                    );
                    self.wait(delay).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn stop_requested(&self) -> bool {
        *self.stop.borrow()
    }

    /// Sleep for `delay` unless a stop arrives first.
    async fn wait(&self, delay: Duration) -> Result<(), SyncError> {
        let mut stop = self.stop.clone();
        if *stop.borrow_and_update() {
            return Err(self.aborted());
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = stopped(&mut stop) => Err(self.aborted()),
        }
    }

    fn aborted(&self) -> SyncError {
        SyncError::Aborted {
            reason: format!("stop requested for chain '{}'", self.chain.name),
        }
    }
}

/// Check a batch starts at `from`, is contiguous, and only carries ordered
/// events from its own blocks.
fn validate(chain: &str, from: u64, batch: EventBatch) -> Result<EventBatch, SyncError> {
    let Some(first) = batch.first_block() else {
        return Ok(batch);
    };
    if first.number != from {
        return Err(SyncError::unavailable(
            chain,
            format!("batch starts at {} instead of {from}", first.number),
        ));
    }
    if !batch.is_contiguous() {
        return Err(SyncError::unavailable(chain, "batch blocks are not contiguous"));
    }
    let last = batch.last_block().map_or(from, |b| b.number);
    let ordered = batch.events.windows(2).all(|w| w[0].key() < w[1].key());
    let inside = batch
        .events
        .iter()
        .all(|e| e.block_number >= from && e.block_number <= last);
    if !ordered || !inside {
        return Err(SyncError::unavailable(chain, "batch events out of order or range"));
    }
    Ok(batch)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::ReplaySource;
    use async_trait::async_trait;
    use ordersync_core::lifecycle::StoredOrder;
    use ordersync_core::order::{Order, OrderStatus};
    use ordersync_core::store::OrderStore;
    use ordersync_core::types::ChainEvent;
    use ordersync_storage::{InMemoryStorage, MemoryRankCache};
    use serde_json::json;

    const COLL: &str = "0xcoll";

    fn create(id: &str, log: u32) -> ChainEvent {
        ChainEvent {
            name: "OrderCreated".into(),
            collection: COLL.into(),
            block_number: 0,
            log_index: log,
            tx_hash: String::new(),
            timestamp: 0,
            fields: json!({
                "order_id": id, "order_type": "listing", "token_id": "1",
                "price": "1.5", "size": 2, "maker": "0xmaker"
            }),
        }
    }

    fn cancel(id: &str, log: u32) -> ChainEvent {
        ChainEvent {
            name: "OrderCancelled".into(),
            collection: COLL.into(),
            block_number: 0,
            log_index: log,
            tx_hash: String::new(),
            timestamp: 0,
            fields: json!({ "order_id": id }),
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_retries: Some(3),
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            multiplier: 2.0,
        }
    }

    struct Harness {
        storage: Arc<InMemoryStorage>,
        source: Arc<ReplaySource>,
        manager: Arc<OrderManager>,
        indexer: OrderbookIndexer,
    }

    async fn harness(window: u64) -> Harness {
        let storage = Arc::new(InMemoryStorage::new());
        storage.allow("eth", COLL);
        let filter = Arc::new(CollectionFilter::new("easyswap", storage.clone()));
        filter.preload().await.unwrap();
        let manager = Arc::new(
            OrderManager::new("easyswap", storage.clone(), Arc::new(MemoryRankCache::new()))
                .with_chains(["eth"])
                .with_retry(fast_retry()),
        );
        let source = Arc::new(ReplaySource::new("eth"));
        let mut chain = ChainConfig::new(1, "eth");
        chain.genesis_height = 1;
        chain.batch_size = 10;
        chain.reorg_safety_window = window;
        let indexer = OrderbookIndexer::new(chain, source.clone(), storage.clone(), filter, manager.clone())
            .with_retry(fast_retry());
        Harness { storage, source, manager, indexer }
    }

    async fn status(manager: &OrderManager, id: &str) -> Option<OrderStatus> {
        manager.order("eth", id).await.unwrap().map(|o| o.status)
    }

    #[tokio::test]
    async fn processes_batch_and_advances_cursor() {
        let mut h = harness(8).await;
        h.source.push_block(vec![create("0x1", 0)]);
        h.source.push_block(vec![]);

        let Step::Batch(report) = h.indexer.step().await.unwrap() else {
            panic!("expected a batch");
        };
        assert_eq!((report.from_block, report.to_block), (1, 2));
        assert_eq!(report.applied, 1);
        assert_eq!(h.indexer.next_block(), 3);
        assert_eq!(status(&h.manager, "0x1").await, Some(OrderStatus::Active));

        let cursor = CursorStore::load(h.storage.as_ref(), "eth").await.unwrap().unwrap();
        assert_eq!(cursor.block_number, 2);
        assert!(matches!(h.indexer.step().await.unwrap(), Step::Idle));
    }

    #[tokio::test]
    async fn filtered_and_malformed_events_are_skipped() {
        let mut h = harness(8).await;
        let mut foreign = create("0x2", 1);
        foreign.collection = "0xother".into();
        let mut unknown = cancel("0x3", 2);
        unknown.name = "OrderTeleported".into();
        h.source.push_block(vec![create("0x1", 0), foreign, unknown]);

        let Step::Batch(report) = h.indexer.step().await.unwrap() else {
            panic!("expected a batch");
        };
        assert_eq!(report.events, 3);
        assert_eq!(report.applied, 1);
        assert_eq!(report.filtered, 1);
        assert_eq!(report.malformed, 1);
        assert_eq!(h.storage.order_count("eth"), 1);
    }

    #[tokio::test]
    async fn reorg_rolls_back_and_replays() {
        let mut h = harness(8).await;
        h.source.push_block(vec![create("0x1", 0)]);
        h.source.push_block(vec![]);
        h.source.push_block(vec![cancel("0x1", 0)]);
        h.indexer.step().await.unwrap();
        assert_eq!(status(&h.manager, "0x1").await, Some(OrderStatus::Cancelled));

        // Blocks above 1 are replaced; the cancellation is gone.
        h.source.reorg(1, vec![vec![], vec![], vec![]]);
        let Step::Reorg(event) = h.indexer.step().await.unwrap() else {
            panic!("expected a reorg");
        };
        assert_eq!(event.fork_height, 1);
        assert_eq!(h.indexer.next_block(), 2);
        assert_eq!(status(&h.manager, "0x1").await, Some(OrderStatus::Active));

        let Step::Batch(report) = h.indexer.step().await.unwrap() else {
            panic!("expected a batch");
        };
        assert_eq!(report.to_block, 4);
        assert_eq!(status(&h.manager, "0x1").await, Some(OrderStatus::Active));
    }

    #[tokio::test]
    async fn reorg_deeper_than_window_is_fatal() {
        let mut h = harness(2).await;
        for _ in 0..6 {
            h.source.push_block(vec![]);
        }
        h.indexer.step().await.unwrap();

        h.source.reorg(1, vec![vec![]; 6]);
        let err = h.indexer.step().await.unwrap_err();
        assert!(matches!(err, SyncError::ReorgTooDeep { .. }));
    }

    #[tokio::test]
    async fn unavailable_source_is_retried() {
        let mut h = harness(8).await;
        h.source.push_block(vec![create("0x1", 0)]);
        h.source.fail_next(2);
        assert!(matches!(h.indexer.step().await.unwrap(), Step::Batch(_)));
    }

    #[tokio::test]
    async fn failed_commit_holds_cursor() {
        let mut h = harness(8).await;
        h.source.push_block(vec![create("0x1", 0)]);
        h.storage.fail_next_commits(100);
        let err = h.indexer.step().await.unwrap_err();
        assert!(matches!(err, SyncError::PersistenceFailure(_)));
        assert!(CursorStore::load(h.storage.as_ref(), "eth").await.unwrap().is_none());
        assert_eq!(h.indexer.next_block(), 1);

        h.storage.fail_next_commits(0);
        assert!(matches!(h.indexer.step().await.unwrap(), Step::Batch(_)));
        assert_eq!(status(&h.manager, "0x1").await, Some(OrderStatus::Active));
    }

    #[tokio::test]
    async fn resumes_from_persisted_cursor() {
        let mut h = harness(8).await;
        h.source.push_block(vec![create("0x1", 0)]);
        h.source.push_block(vec![]);
        h.indexer.step().await.unwrap();

        let filter = Arc::new(CollectionFilter::new("easyswap", h.storage.clone()));
        filter.preload().await.unwrap();
        let mut restarted = OrderbookIndexer::new(
            h.indexer.chain().clone(),
            h.source.clone(),
            h.storage.clone(),
            filter,
            h.manager.clone(),
        );
        restarted.resume().await.unwrap();
        assert_eq!(restarted.next_block(), 3);

        // A reorg right after the restart is still detected.
        h.source.reorg(1, vec![vec![], vec![]]);
        assert!(matches!(restarted.step().await.unwrap(), Step::Reorg(_)));
    }

    #[tokio::test]
    async fn run_exits_on_stop() {
        let mut h = harness(8).await;
        h.source.push_block(vec![create("0x1", 0)]);
        let (tx, rx) = watch::channel(false);
        let mut indexer = h.indexer.with_stop(rx);
        let task = tokio::spawn(async move { indexer.run().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(status(&h.manager, "0x1").await, Some(OrderStatus::Active));
    }

    /// Order store whose commits take a while, to stop the loop mid-batch.
    struct SlowCommits(Arc<InMemoryStorage>);

    #[async_trait]
    impl OrderStore for SlowCommits {
        async fn load(&self, chain: &str, order_id: &str) -> Result<Option<StoredOrder>, SyncError> {
            OrderStore::load(self.0.as_ref(), chain, order_id).await
        }

        async fn commit(&self, chain: &str, record: &StoredOrder) -> Result<(), SyncError> {
            tokio::time::sleep(Duration::from_millis(40)).await;
            self.0.commit(chain, record).await
        }

        async fn expirable(&self, chain: &str, now: i64, limit: usize) -> Result<Vec<String>, SyncError> {
            self.0.expirable(chain, now, limit).await
        }

        async fn touched_since(&self, chain: &str, height: u64) -> Result<Vec<String>, SyncError> {
            self.0.touched_since(chain, height).await
        }

        async fn orphans_before(&self, chain: &str, height: u64, limit: usize) -> Result<Vec<String>, SyncError> {
            self.0.orphans_before(chain, height, limit).await
        }

        async fn open_orders(
            &self,
            chain: &str,
            after: Option<&str>,
            limit: usize,
        ) -> Result<Vec<Order>, SyncError> {
            self.0.open_orders(chain, after, limit).await
        }

        async fn order(&self, chain: &str, order_id: &str) -> Result<Option<Order>, SyncError> {
            self.0.order(chain, order_id).await
        }

        async fn orders_by_collection(&self, chain: &str, collection: &str) -> Result<Vec<Order>, SyncError> {
            self.0.orders_by_collection(chain, collection).await
        }
    }

    #[tokio::test]
    async fn stop_during_batch_finishes_the_batch() {
        let h = harness(8).await;
        let manager = Arc::new(
            OrderManager::new(
                "easyswap",
                Arc::new(SlowCommits(h.storage.clone())),
                Arc::new(MemoryRankCache::new()),
            )
            .with_chains(["eth"])
            .with_retry(fast_retry()),
        );
        h.source.push_block((0..5).map(|i| create(&format!("0x{i}"), i)).collect());

        let filter = Arc::new(CollectionFilter::new("easyswap", h.storage.clone()));
        filter.preload().await.unwrap();
        let (tx, rx) = watch::channel(false);
        let mut indexer = OrderbookIndexer::new(
            h.indexer.chain().clone(),
            h.source.clone(),
            h.storage.clone(),
            filter,
            manager.clone(),
        )
        .with_retry(fast_retry())
        .with_stop(rx);
        let task = tokio::spawn(async move { indexer.run().await });

        // Five commits take 200ms; the stop lands during the second one.
        tokio::time::sleep(Duration::from_millis(60)).await;
        tx.send(true).unwrap();
        task.await.unwrap().unwrap();

        assert_eq!(h.storage.order_count("eth"), 5);
        let cursor = CursorStore::load(h.storage.as_ref(), "eth").await.unwrap().unwrap();
        assert_eq!(cursor.block_number, 1);
    }
}
