//! ordersync-core — foundation for the NFT order-book sync engine.
//!
//! # Architecture
//!
//! ```text
//! ChainEventSource ──▶ OrderbookIndexer ──▶ OrderManager ──▶ OrderStore
//!                        ├── CollectionFilter   (allow-list gate)   └──▶ RankCache
//!                        ├── BlockTracker       (recent hashes)
//!                        ├── ReorgDetector      (fork detection)
//!                        └── CursorStore        (resume point)
//! ```
//!
//! This crate holds the data model, the lifecycle fold and the traits; the
//! runtime lives in `ordersync-engine`, backends in `ordersync-storage`.

pub mod config;
pub mod cursor;
pub mod error;
pub mod event;
pub mod filter;
pub mod lifecycle;
pub mod order;
pub mod reorg;
pub mod retry;
pub mod source;
pub mod store;
pub mod tracker;
pub mod types;

pub use config::{ChainConfig, LogConfig, SweepConfig, SupervisorConfig, SyncConfig};
pub use cursor::{CursorStore, SyncCursor};
pub use error::SyncError;
pub use event::{classify, OrderEventKind};
pub use filter::{AllowListEntry, AllowListStore, CollectionFilter, FilterDiff};
pub use lifecycle::{Merge, StoredOrder};
pub use order::{DeltaKind, FillAmount, Order, OrderDelta, OrderStatus, OrderTerms, OrderType};
pub use reorg::{ChainCheck, ReorgDetector, ReorgEvent, ReorgType};
pub use retry::{RetryConfig, RetryPolicy};
pub use source::ChainEventSource;
pub use store::{AssumeFunded, MakerBalanceCheck, OrderStore, RankCache, RankKey};
pub use tracker::BlockTracker;
pub use types::{BlockSummary, ChainEvent, EventBatch, EventKey};
