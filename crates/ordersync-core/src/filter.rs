//! Collection allow-list.
//!
//! The filter owns an in-memory copy of the allow-list, keyed by chain.
//! Lookups take a read lock over a hash set and never touch I/O; `refresh`
//! builds the new set outside the lock and swaps it in, so changes only
//! affect events processed afterwards.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// One allowed `(chain, collection)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllowListEntry {
    pub chain: String,
    pub collection: String,
}

impl AllowListEntry {
    pub fn new(chain: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            chain: chain.into(),
            collection: collection.into(),
        }
    }
}

/// Backing store of approved collections.
#[async_trait]
pub trait AllowListStore: Send + Sync {
    async fn load_allow_list(&self, project: &str) -> Result<Vec<AllowListEntry>, SyncError>;
}

/// Change applied by a refresh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterDiff {
    pub added: usize,
    pub removed: usize,
}

type ChainSets = HashMap<String, HashSet<String>>;

/// In-memory allow-list shared by every indexer.
pub struct CollectionFilter {
    project: String,
    store: Arc<dyn AllowListStore>,
    sets: RwLock<ChainSets>,
    loaded: AtomicBool,
}

impl CollectionFilter {
    pub fn new(project: impl Into<String>, store: Arc<dyn AllowListStore>) -> Self {
        Self {
            project: project.into(),
            store,
            sets: RwLock::new(HashMap::new()),
            loaded: AtomicBool::new(false),
        }
    }

    /// Load the allow-list before any indexer starts.
    ///
    /// Fails with [`SyncError::AllowListUnavailable`] if the store cannot be
    /// read; indexing with an incomplete filter would drop valid orders.
    pub async fn preload(&self) -> Result<usize, SyncError> {
        let sets = self.fetch().await?;
        let total = sets.values().map(HashSet::len).sum();
        *self.sets.write().unwrap_or_else(|e| e.into_inner()) = sets;
        self.loaded.store(true, Ordering::Release);
        tracing::info!(project = %self.project, collections = total, "Collection filter preloaded");
        Ok(total)
    }

    /// Re-read the allow-list and swap it in.
    pub async fn refresh(&self) -> Result<FilterDiff, SyncError> {
        let fresh = self.fetch().await?;
        let mut sets = self.sets.write().unwrap_or_else(|e| e.into_inner());
        let diff = diff(&sets, &fresh);
        *sets = fresh;
        drop(sets);
        self.loaded.store(true, Ordering::Release);
        if diff != FilterDiff::default() {
            tracing::info!(
                project = %self.project,
                added = diff.added,
                removed = diff.removed,
                "Collection filter refreshed"
            );
        }
        Ok(diff)
    }

    /// O(1) membership check, called for every event.
    pub fn is_allowed(&self, chain: &str, collection: &str) -> bool {
        let sets = self.sets.read().unwrap_or_else(|e| e.into_inner());
        let Some(set) = sets.get(chain) else {
            return false;
        };
        if collection.bytes().any(|b| b.is_ascii_uppercase()) {
            set.contains(&collection.to_ascii_lowercase())
        } else {
            set.contains(collection)
        }
    }

    /// Number of allowed collections for a chain.
    pub fn len(&self, chain: &str) -> usize {
        self.sets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(chain)
            .map_or(0, HashSet::len)
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    async fn fetch(&self) -> Result<ChainSets, SyncError> {
        let entries = self
            .store
            .load_allow_list(&self.project)
            .await
            .map_err(|e| match e {
                SyncError::AllowListUnavailable(_) => e,
                other => SyncError::AllowListUnavailable(other.to_string()),
            })?;
        let mut sets: ChainSets = HashMap::new();
        for entry in entries {
            sets.entry(entry.chain)
                .or_default()
                .insert(entry.collection.to_ascii_lowercase());
        }
        Ok(sets)
    }
}

fn diff(old: &ChainSets, new: &ChainSets) -> FilterDiff {
    let count = |a: &ChainSets, b: &ChainSets| -> usize {
        a.iter()
            .map(|(chain, set)| match b.get(chain) {
                Some(other) => set.difference(other).count(),
                None => set.len(),
            })
            .sum()
    };
    FilterDiff {
        added: count(new, old),
        removed: count(old, new),
    }
}
