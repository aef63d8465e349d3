//! Configuration for the sync engine.
//!
//! ```yaml
//! project: easyswap
//! chains:
//!   - id: 11155111
//!     name: sepolia
//!     endpoint: https://rpc.sepolia.org
//!     genesis_height: 5000000
//!     reorg_safety_window: 64
//! sweep:
//!   interval_secs: 30
//! ```

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::retry::RetryConfig;

/// One indexed chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Numeric chain id (e.g. `1`, `10`, `11155111`).
    pub id: u64,
    /// Partition name; order tables and cache keys are derived from it.
    pub name: String,
    /// RPC endpoint handed to the event source.
    #[serde(default)]
    pub endpoint: String,
    /// First block to index when no cursor exists.
    #[serde(default)]
    pub genesis_height: u64,
    /// Blocks requested per fetch.
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    /// Idle wait when the source has nothing new (milliseconds).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Timeout for one source call (milliseconds).
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
    /// Deepest reorg handled automatically.
    #[serde(default = "default_reorg_window")]
    pub reorg_safety_window: u64,
}

fn default_batch_size() -> u64 {
    100
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_fetch_timeout_ms() -> u64 {
    15_000
}

fn default_reorg_window() -> u64 {
    64
}

impl ChainConfig {
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            endpoint: String::new(),
            genesis_height: 0,
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            reorg_safety_window: default_reorg_window(),
        }
    }

    /// Returns `true` if `name` is usable as a table suffix.
    pub fn is_valid_partition_name(name: &str) -> bool {
        !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    }
}

/// Expiry sweep and balance re-check settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub interval_secs: u64,
    /// Orders transitioned per store round-trip.
    pub batch_size: usize,
    /// Run the maker balance/allowance check during each sweep.
    pub check_balances: bool,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            batch_size: 200,
            check_balances: false,
        }
    }
}

/// Restart policy for crashed chain indexers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub restart_initial_backoff_ms: u64,
    pub restart_max_backoff_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            restart_initial_backoff_ms: 1_000,
            restart_max_backoff_ms: 60_000,
        }
    }
}

impl SupervisorConfig {
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: None,
            initial_backoff_ms: self.restart_initial_backoff_ms,
            max_backoff_ms: self.restart_max_backoff_ms,
            multiplier: 2.0,
        }
    }
}

/// Log level per component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Global default level: "trace" | "debug" | "info" | "warn" | "error"
    #[serde(default = "default_level")]
    pub level: String,
    /// Override per component: component_name → level
    #[serde(default)]
    pub components: HashMap<String, String>,
    /// Emit JSON structured logs (true) or human-readable text (false)
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            components: HashMap::new(),
            json: false,
        }
    }
}

impl LogConfig {
    /// Build a filter directive string: `"info,ordersync_engine=debug"`.
    pub fn directives(&self) -> String {
        let mut components: Vec<_> = self.components.iter().collect();
        components.sort();
        let mut directives = self.level.clone();
        for (component, level) in components {
            directives.push_str(&format!(",{}={}", component.replace('-', "_"), level));
        }
        directives
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Project name; scopes the allow-list and cache keys.
    pub project: String,
    pub chains: Vec<ChainConfig>,
    #[serde(default)]
    pub sweep: SweepConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    /// Allow-list refresh period in seconds; `0` disables periodic refresh.
    #[serde(default = "default_filter_refresh_secs")]
    pub filter_refresh_secs: u64,
    /// Blocks of per-order history kept for rollback. Defaults to the
    /// largest reorg safety window.
    #[serde(default)]
    pub history_window: Option<u64>,
    #[serde(default)]
    pub log: LogConfig,
}

fn default_filter_refresh_secs() -> u64 {
    300
}

impl SyncConfig {
    pub fn new(project: impl Into<String>, chains: Vec<ChainConfig>) -> Self {
        Self {
            project: project.into(),
            chains,
            sweep: SweepConfig::default(),
            retry: RetryConfig::default(),
            supervisor: SupervisorConfig::default(),
            filter_refresh_secs: default_filter_refresh_secs(),
            history_window: None,
            log: LogConfig::default(),
        }
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, SyncError> {
        let config: Self =
            serde_yaml::from_str(yaml).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("{}: {e}", path.display())))?;
        Self::from_yaml_str(&text)
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.project.trim().is_empty() {
            return Err(SyncError::Config("project must not be empty".into()));
        }
        if self.chains.is_empty() {
            return Err(SyncError::Config("at least one chain is required".into()));
        }
        let mut ids = HashSet::new();
        let mut names = HashSet::new();
        for chain in &self.chains {
            if !ids.insert(chain.id) {
                return Err(SyncError::Config(format!("duplicate chain id {}", chain.id)));
            }
            if !names.insert(chain.name.as_str()) {
                return Err(SyncError::Config(format!("duplicate chain name '{}'", chain.name)));
            }
            if !ChainConfig::is_valid_partition_name(&chain.name) {
                return Err(SyncError::Config(format!(
                    "chain name '{}' must be lowercase alphanumeric or '_'",
                    chain.name
                )));
            }
            if chain.batch_size == 0 {
                return Err(SyncError::Config(format!("chain '{}': batch_size must be > 0", chain.name)));
            }
            if chain.reorg_safety_window == 0 {
                return Err(SyncError::Config(format!(
                    "chain '{}': reorg_safety_window must be > 0",
                    chain.name
                )));
            }
        }
        if self.sweep.interval_secs == 0 || self.sweep.batch_size == 0 {
            return Err(SyncError::Config("sweep interval and batch size must be > 0".into()));
        }
        if let Some(window) = self.history_window {
            if window < self.max_reorg_window() {
                return Err(SyncError::Config(format!(
                    "history_window {window} is shorter than the largest reorg_safety_window"
                )));
            }
        }
        Ok(())
    }

    pub fn max_reorg_window(&self) -> u64 {
        self.chains.iter().map(|c| c.reorg_safety_window).max().unwrap_or(0)
    }

    /// Effective per-order history retention in blocks.
    pub fn history_window(&self) -> u64 {
        self.history_window.unwrap_or_else(|| self.max_reorg_window())
    }

    pub fn chain(&self, name: &str) -> Option<&ChainConfig> {
        self.chains.iter().find(|c| c.name == name)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
