//! ordersync-storage — pluggable storage backends for OrderSync.
//!
//! Backends:
//! - [`memory`] — in-memory (dev/testing, no persistence)
//! - [`sqlite`] — SQLite via `sqlx`, one order table per chain (feature `sqlite`)

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::{InMemoryStorage, MemoryRankCache};
