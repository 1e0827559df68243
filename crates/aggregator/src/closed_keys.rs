//! Closed correlation keys
//!
//! When closing on completion is enabled, every completed key is recorded
//! and later exchanges carrying it are rejected. A positive capacity keeps
//! the most relevant keys in a bounded moka cache; zero keeps every key.

use dashmap::DashSet;
use moka::future::Cache;
use tracing::info;

/// Set of correlation keys that may no longer aggregate
pub enum ClosedCorrelationKeys {
    Bounded(Cache<String, ()>),
    Unbounded(DashSet<String>),
}

impl ClosedCorrelationKeys {
    /// Create the set, bounded when `capacity > 0`
    pub fn new(capacity: usize) -> Self {
        if capacity > 0 {
            info!(capacity, "Using bounded closed correlation keys cache");
            ClosedCorrelationKeys::Bounded(Cache::new(capacity as u64))
        } else {
            info!("Using unbounded closed correlation keys");
            ClosedCorrelationKeys::Unbounded(DashSet::new())
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        match self {
            ClosedCorrelationKeys::Bounded(cache) => cache.contains_key(key),
            ClosedCorrelationKeys::Unbounded(set) => set.contains(key),
        }
    }

    pub async fn insert(&self, key: &str) {
        match self {
            ClosedCorrelationKeys::Bounded(cache) => cache.insert(key.to_string(), ()).await,
            ClosedCorrelationKeys::Unbounded(set) => {
                set.insert(key.to_string());
            }
        }
    }

    /// Number of closed keys; approximate for the bounded cache until its
    /// pending maintenance has run
    pub async fn len(&self) -> usize {
        match self {
            ClosedCorrelationKeys::Bounded(cache) => {
                cache.run_pending_tasks().await;
                cache.entry_count() as usize
            }
            ClosedCorrelationKeys::Unbounded(set) => set.len(),
        }
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Configured capacity, zero when unbounded
    pub fn capacity(&self) -> usize {
        match self {
            ClosedCorrelationKeys::Bounded(cache) => {
                cache.policy().max_capacity().unwrap_or(0) as usize
            }
            ClosedCorrelationKeys::Unbounded(_) => 0,
        }
    }

    pub async fn clear(&self) {
        match self {
            ClosedCorrelationKeys::Bounded(cache) => {
                cache.invalidate_all();
                cache.run_pending_tasks().await;
            }
            ClosedCorrelationKeys::Unbounded(set) => set.clear(),
        }
    }
}
