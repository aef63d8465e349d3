//! ordersync-engine — the runtime of the order-book sync engine.
//!
//! - [`OrderManager`] — lifecycle reconciler: applies deltas, rolls back
//!   reorged history, sweeps expired orders, invalidates rank keys
//! - [`OrderbookIndexer`] — per-chain ingestion loop with reorg handling
//! - [`Coordinator`] — supervises one indexer per chain plus the sweep and
//!   allow-list refresh loops
//! - [`EngineBuilder`] — wires the above from a [`SyncConfig`](ordersync_core::SyncConfig)
//! - [`ReplaySource`] — in-memory event source for tests and replays

pub mod builder;
pub mod coordinator;
pub mod index_loop;
pub mod order_manager;
pub mod registry;
pub mod replay;

pub use builder::EngineBuilder;
pub use coordinator::{ChainStatus, Coordinator, StatusBoard};
pub use index_loop::{BatchReport, OrderbookIndexer, Step};
pub use order_manager::{ApplyOutcome, Clock, OrderManager};
pub use registry::{SourceFactory, SourceRegistry};
pub use replay::ReplaySource;
