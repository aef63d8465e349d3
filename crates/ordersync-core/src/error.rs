//! Error types for the order sync pipeline.

use thiserror::Error;

/// Errors that can occur while ingesting events and reconciling orders.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The chain event source failed or timed out. Retried with backoff, never abandoned.
    #[error("chain '{chain}' unavailable: {reason}")]
    ChainUnavailable { chain: String, reason: String },

    /// A reorg rewinds further than the configured safety window.
    #[error("reorg on chain '{chain}' is {depth} blocks deep, safety window is {window}")]
    ReorgTooDeep { chain: String, depth: u64, window: u64 },

    /// An event payload could not be turned into an order delta.
    #[error("malformed event on chain '{chain}' at block {block} log {log_index}: {reason}")]
    MalformedEvent {
        chain: String,
        block: u64,
        log_index: u32,
        reason: String,
    },

    /// The delta is behind the order's last applied position.
    #[error("stale delta for order {order_id}")]
    StaleDelta { order_id: String },

    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("cache write failure: {0}")]
    CacheWriteFailure(String),

    /// The collection allow-list could not be loaded.
    #[error("allow-list unavailable: {0}")]
    AllowListUnavailable(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("aborted: {reason}")]
    Aborted { reason: String },

    #[error("{0}")]
    Other(String),
}

impl SyncError {
    /// Returns `true` for transient failures that are retried in place.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ChainUnavailable { .. } | Self::PersistenceFailure(_) | Self::CacheWriteFailure(_)
        )
    }

    /// Returns `true` if a chain's indexer must not be restarted automatically.
    pub fn is_fatal_for_chain(&self) -> bool {
        matches!(self, Self::ReorgTooDeep { .. } | Self::Config(_))
    }

    /// Shorthand for [`SyncError::ChainUnavailable`].
    pub fn unavailable(chain: &str, reason: impl Into<String>) -> Self {
        Self::ChainUnavailable {
            chain: chain.to_string(),
            reason: reason.into(),
        }
    }
}
