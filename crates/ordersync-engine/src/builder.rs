//! Fluent builder wiring a [`Coordinator`] from configuration and backends.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ordersync_core::config::{ChainConfig, SyncConfig};
//! use ordersync_engine::{EngineBuilder, ReplaySource};
//! use ordersync_storage::{InMemoryStorage, MemoryRankCache};
//!
//! # fn example() -> Result<(), ordersync_core::SyncError> {
//! let config = SyncConfig::new("easyswap", vec![ChainConfig::new(11155111, "sepolia")]);
//! let coordinator = EngineBuilder::new(config)
//!     .in_memory(Arc::new(InMemoryStorage::new()))
//!     .rank_cache(Arc::new(MemoryRankCache::new()))
//!     .source(11155111, Arc::new(ReplaySource::new("sepolia")))
//!     .build()?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ordersync_core::config::{ChainConfig, SyncConfig};
use ordersync_core::cursor::CursorStore;
use ordersync_core::error::SyncError;
use ordersync_core::filter::{AllowListStore, CollectionFilter};
use ordersync_core::source::ChainEventSource;
use ordersync_core::store::{MakerBalanceCheck, OrderStore, RankCache};
use ordersync_storage::InMemoryStorage;

use crate::coordinator::Coordinator;
use crate::order_manager::OrderManager;
use crate::registry::SourceRegistry;

/// Fluent builder for a [`Coordinator`].
pub struct EngineBuilder {
    config: SyncConfig,
    registry: SourceRegistry,
    orders: Option<Arc<dyn OrderStore>>,
    cursors: Option<Arc<dyn CursorStore>>,
    allow_list: Option<Arc<dyn AllowListStore>>,
    cache: Option<Arc<dyn RankCache>>,
    balances: Option<Arc<dyn MakerBalanceCheck>>,
    clock: Option<Arc<dyn Fn() -> i64 + Send + Sync>>,
}

impl EngineBuilder {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            registry: SourceRegistry::new(),
            orders: None,
            cursors: None,
            allow_list: None,
            cache: None,
            balances: None,
            clock: None,
        }
    }

    /// Use one in-memory backend for orders, cursors and the allow-list.
    pub fn in_memory(self, storage: Arc<InMemoryStorage>) -> Self {
        self.order_store(storage.clone())
            .cursor_store(storage.clone())
            .allow_list(storage)
    }

    pub fn order_store(mut self, store: Arc<dyn OrderStore>) -> Self {
        self.orders = Some(store);
        self
    }

    pub fn cursor_store(mut self, store: Arc<dyn CursorStore>) -> Self {
        self.cursors = Some(store);
        self
    }

    pub fn allow_list(mut self, store: Arc<dyn AllowListStore>) -> Self {
        self.allow_list = Some(store);
        self
    }

    pub fn rank_cache(mut self, cache: Arc<dyn RankCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn balance_check(mut self, check: Arc<dyn MakerBalanceCheck>) -> Self {
        self.balances = Some(check);
        self
    }

    /// Override the wall clock (milliseconds since the epoch).
    pub fn clock(mut self, clock: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    /// Register a ready event source for a chain id.
    pub fn source(mut self, chain_id: u64, source: Arc<dyn ChainEventSource>) -> Self {
        self.registry.register_source(chain_id, source);
        self
    }

    /// Register an event source factory for a chain id.
    pub fn source_factory<F>(mut self, chain_id: u64, factory: F) -> Self
    where
        F: Fn(&ChainConfig) -> Result<Arc<dyn ChainEventSource>, SyncError> + Send + Sync + 'static,
    {
        self.registry.register(chain_id, factory);
        self
    }

    /// Validate the configuration and wire the coordinator.
    pub fn build(self) -> Result<Coordinator, SyncError> {
        self.config.validate()?;
        let missing = |what: &str| SyncError::Config(format!("engine builder: no {what} configured"));
        let orders = self.orders.ok_or_else(|| missing("order store"))?;
        let cursors = self.cursors.ok_or_else(|| missing("cursor store"))?;
        let allow_list = self.allow_list.ok_or_else(|| missing("allow-list store"))?;
        let cache = self.cache.ok_or_else(|| missing("rank cache"))?;

        for chain in &self.config.chains {
            if !self.registry.contains(chain.id) {
                tracing::warn!(
                    chain = %chain.name,
                    chain_id = chain.id,
                    "No event source registered, chain will halt on start"
                );
            }
        }

        let mut manager = OrderManager::new(self.config.project.clone(), orders, cache)
            .with_chains(self.config.chains.iter().map(|c| c.name.clone()))
            .with_sweep(self.config.sweep.clone())
            .with_retry(self.config.retry.clone())
            .with_history_window(self.config.history_window());
        if let Some(check) = self.balances {
            manager = manager.with_balance_check(check);
        }
        if let Some(clock) = self.clock {
            manager = manager.with_clock(move || clock());
        }

        let filter = Arc::new(CollectionFilter::new(self.config.project.clone(), allow_list));
        Ok(Coordinator::new(
            self.config,
            self.registry,
            cursors,
            filter,
            Arc::new(manager),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::ReplaySource;
    use ordersync_storage::MemoryRankCache;

    fn config() -> SyncConfig {
        SyncConfig::new("easyswap", vec![ChainConfig::new(1, "eth"), ChainConfig::new(10, "op")])
    }

    #[test]
    fn builds_with_in_memory_backends() {
        let coordinator = EngineBuilder::new(config())
            .in_memory(Arc::new(InMemoryStorage::new()))
            .rank_cache(Arc::new(MemoryRankCache::new()))
            .source(1, Arc::new(ReplaySource::new("eth")))
            .source(10, Arc::new(ReplaySource::new("op")))
            .build()
            .unwrap();
        assert_eq!(coordinator.manager().chains(), ["eth".to_string(), "op".to_string()]);
        assert_eq!(coordinator.manager().project(), "easyswap");
    }

    #[test]
    fn missing_backend_is_a_config_error() {
        let err = EngineBuilder::new(config())
            .in_memory(Arc::new(InMemoryStorage::new()))
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("rank cache"));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let bad = SyncConfig::new("easyswap", vec![]);
        let err = EngineBuilder::new(bad).build().err().unwrap();
        assert!(matches!(err, SyncError::Config(_)));
    }
}
