//! Chain id → event source factory.
//!
//! The coordinator never matches on chain ids. Each supported chain registers
//! a factory that turns its [`ChainConfig`] into a ready event source; chains
//! without a factory fail to start with a configuration error.

use std::collections::HashMap;
use std::sync::Arc;

use ordersync_core::config::ChainConfig;
use ordersync_core::error::SyncError;
use ordersync_core::source::ChainEventSource;

/// Builds the event source of one chain.
pub type SourceFactory =
    Arc<dyn Fn(&ChainConfig) -> Result<Arc<dyn ChainEventSource>, SyncError> + Send + Sync>;

#[derive(Default, Clone)]
pub struct SourceRegistry {
    factories: HashMap<u64, SourceFactory>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the factory for a chain id, replacing any previous one.
    pub fn register<F>(&mut self, chain_id: u64, factory: F) -> &mut Self
    where
        F: Fn(&ChainConfig) -> Result<Arc<dyn ChainEventSource>, SyncError> + Send + Sync + 'static,
    {
        self.factories.insert(chain_id, Arc::new(factory));
        self
    }

    /// Register an already-built source. Every restart of the chain reuses it.
    pub fn register_source(&mut self, chain_id: u64, source: Arc<dyn ChainEventSource>) -> &mut Self {
        self.register(chain_id, move |_| Ok(source.clone()))
    }

    pub fn contains(&self, chain_id: u64) -> bool {
        self.factories.contains_key(&chain_id)
    }

    pub fn chain_ids(&self) -> Vec<u64> {
        let mut ids: Vec<_> = self.factories.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Build the event source for `chain`.
    pub fn build(&self, chain: &ChainConfig) -> Result<Arc<dyn ChainEventSource>, SyncError> {
        let factory = self.factories.get(&chain.id).ok_or_else(|| {
            SyncError::Config(format!(
                "no event source registered for chain '{}' (id {})",
                chain.name, chain.id
            ))
        })?;
        factory(chain)
    }
}

impl std::fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("chain_ids", &self.chain_ids())
            .finish()
    }
}
