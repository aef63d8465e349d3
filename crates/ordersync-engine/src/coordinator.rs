//! Multi-chain coordinator.
//!
//! Owns one supervised task per configured chain, the expiry sweep loop and
//! the allow-list refresh loop. Startup order:
//!
//! ```text
//! preload allow-list ──▶ sweep loop ──▶ refresh loop ──▶ one supervisor per chain
//! ```
//!
//! A supervisor restarts its chain's indexer with capped exponential backoff
//! when it fails or panics. Configuration errors and reorgs deeper than the
//! safety window halt that chain only; the others and the sweep loop keep
//! running.
//!
//! Shutdown is cooperative: indexers finish their current batch and persist
//! its cursor, then the refresh and sweep loops stop, flushing pending rank
//! invalidations.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, warn};

use ordersync_core::config::{ChainConfig, SyncConfig};
use ordersync_core::cursor::CursorStore;
use ordersync_core::error::SyncError;
use ordersync_core::filter::CollectionFilter;
use ordersync_core::retry::RetryPolicy;

use crate::index_loop::OrderbookIndexer;
use crate::order_manager::{stopped, OrderManager};
use crate::registry::SourceRegistry;

/// Lifecycle state of one chain's indexer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ChainStatus {
    Starting,
    Running,
    /// Waiting to restart after a failure.
    Restarting { attempt: u32, last_error: String },
    /// Stopped on an error that needs an operator.
    Halted { reason: String },
    Stopped,
}

/// Per-chain status, readable while the coordinator runs.
#[derive(Debug, Default)]
pub struct StatusBoard {
    chains: RwLock<BTreeMap<String, ChainStatus>>,
}

impl StatusBoard {
    fn set(&self, chain: &str, status: ChainStatus) {
        self.chains
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(chain.to_string(), status);
    }

    pub fn get(&self, chain: &str) -> Option<ChainStatus> {
        self.chains
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(chain)
            .cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, ChainStatus> {
        self.chains.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Everything a chain supervisor needs, cloned into its task.
#[derive(Clone)]
struct ChainContext {
    config: ChainConfig,
    sync: Arc<SyncConfig>,
    registry: Arc<SourceRegistry>,
    cursors: Arc<dyn CursorStore>,
    filter: Arc<CollectionFilter>,
    manager: Arc<OrderManager>,
    status: Arc<StatusBoard>,
    stop: watch::Receiver<bool>,
}

pub struct Coordinator {
    config: Arc<SyncConfig>,
    registry: Arc<SourceRegistry>,
    cursors: Arc<dyn CursorStore>,
    filter: Arc<CollectionFilter>,
    manager: Arc<OrderManager>,
    status: Arc<StatusBoard>,
    stop: watch::Sender<bool>,
}

impl Coordinator {
    pub fn new(
        config: SyncConfig,
        registry: SourceRegistry,
        cursors: Arc<dyn CursorStore>,
        filter: Arc<CollectionFilter>,
        manager: Arc<OrderManager>,
    ) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            cursors,
            filter,
            manager,
            status: Arc::new(StatusBoard::default()),
            stop,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<OrderManager> {
        &self.manager
    }

    pub fn filter(&self) -> &Arc<CollectionFilter> {
        &self.filter
    }

    pub fn status(&self) -> &Arc<StatusBoard> {
        &self.status
    }

    /// Ask every task to stop. `run` returns once they have.
    pub fn shutdown(&self) {
        info!(project = %self.config.project, "Shutdown requested");
        self.stop.send_replace(true);
    }

    /// Run until [`shutdown`](Self::shutdown) is called.
    ///
    /// Fails only if the allow-list cannot be preloaded; per-chain failures
    /// are handled by the chain supervisors.
    pub async fn run(&self) -> Result<(), SyncError> {
        let collections = self.filter.preload().await?;
        info!(
            project = %self.config.project,
            chains = self.config.chains.len(),
            collections,
            "Coordinator starting"
        );

        let (sweep_stop, sweep_rx) = watch::channel(false);
        let sweeper = tokio::spawn(self.manager.clone().run_sweeper(sweep_rx));

        let refresher = (self.config.filter_refresh_secs > 0).then(|| {
            tokio::spawn(refresh_loop(
                self.filter.clone(),
                Duration::from_secs(self.config.filter_refresh_secs),
                self.stop.subscribe(),
            ))
        });

        let supervisors: Vec<_> = self
            .config
            .chains
            .iter()
            .map(|chain| {
                self.status.set(&chain.name, ChainStatus::Starting);
                let ctx = ChainContext {
                    config: chain.clone(),
                    sync: self.config.clone(),
                    registry: self.registry.clone(),
                    cursors: self.cursors.clone(),
                    filter: self.filter.clone(),
                    manager: self.manager.clone(),
                    status: self.status.clone(),
                    stop: self.stop.subscribe(),
                };
                tokio::spawn(supervise(ctx))
            })
            .collect();

        for (chain, joined) in self.config.chains.iter().zip(join_all(supervisors).await) {
            if let Err(e) = joined {
                error!(chain = %chain.name, error = %e, "Chain supervisor failed");
            }
        }

        // Halted chains must not take the sweep loop down with them.
        stopped(&mut self.stop.subscribe()).await;

        if let Some(refresher) = refresher {
            if let Err(e) = refresher.await {
                warn!(error = %e, "Allow-list refresh task failed");
            }
        }
        sweep_stop.send_replace(true);
        if let Err(e) = sweeper.await {
            warn!(error = %e, "Sweep task failed");
        }

        info!(project = %self.config.project, "Coordinator stopped");
        Ok(())
    }
}

/// Keep one chain's indexer running until stop, restarting it on failure.
async fn supervise(mut ctx: ChainContext) {
    let chain = ctx.config.name.clone();
    let backoff = RetryPolicy::new(ctx.sync.supervisor.retry_config());
    let mut restarts = 0u32;

    loop {
        if *ctx.stop.borrow() {
            break;
        }

        let source = match ctx.registry.build(&ctx.config) {
            Ok(source) => source,
            Err(e) => {
                error!(chain = %chain, error = %e, "Cannot build event source, chain halted");
                ctx.status.set(&chain, ChainStatus::Halted { reason: e.to_string() });
                return;
            }
        };

        let mut indexer = OrderbookIndexer::new(
            ctx.config.clone(),
            source,
            ctx.cursors.clone(),
            ctx.filter.clone(),
            ctx.manager.clone(),
        )
        .with_retry(ctx.sync.retry.clone())
        .with_stop(ctx.stop.clone());

        ctx.status.set(&chain, ChainStatus::Running);
        info!(chain = %chain, chain_id = ctx.config.id, restarts, "Indexer started");
        let started_at = cursor_height(&ctx).await;
        let outcome = tokio::spawn(async move { indexer.run().await }).await;

        let reason = match outcome {
            Ok(Ok(())) => break,
            Ok(Err(e)) if e.is_fatal_for_chain() => {
                error!(chain = %chain, error = %e, "Indexer halted, operator intervention required");
                ctx.status.set(&chain, ChainStatus::Halted { reason: e.to_string() });
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(join) if join.is_panic() => "indexer panicked".to_string(),
            Err(join) => join.to_string(),
        };

        // A run that moved the cursor was healthy; back off from the start.
        if cursor_height(&ctx).await > started_at {
            restarts = 0;
        }
        restarts += 1;
        let delay = backoff
            .next_delay(restarts)
            .unwrap_or(Duration::from_millis(ctx.sync.supervisor.restart_max_backoff_ms));
        error!(
            chain = %chain,
            restarts,
            delay_ms = delay.as_millis() as u64,
            error = %reason,
            "Indexer crashed, restarting"
        );
        ctx.status.set(
            &chain,
            ChainStatus::Restarting {
                attempt: restarts,
                last_error: reason,
            },
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stopped(&mut ctx.stop) => break,
        }
    }

    ctx.status.set(&chain, ChainStatus::Stopped);
    info!(chain = %chain, "Chain supervisor stopped");
}

async fn cursor_height(ctx: &ChainContext) -> Option<u64> {
    match ctx.cursors.load(&ctx.config.name).await {
        Ok(cursor) => cursor.map(|c| c.block_number),
        Err(e) => {
            warn!(chain = %ctx.config.name, error = %e, "Cannot read cursor");
            None
        }
    }
}

async fn refresh_loop(filter: Arc<CollectionFilter>, every: Duration, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick fires immediately; the preload already covered it.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = filter.refresh().await {
                    warn!(error = %e, "Allow-list refresh failed, keeping previous set");
                }
            }
            _ = stopped(&mut stop) => break,
        }
    }
}
