//! In-memory aggregation repository
//!
//! Reference repository backed by a `DashMap`. Per-key operations are atomic;
//! conditional writes in optimistic mode run under the map's shard lock via
//! the entry API.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use super::{AggregateGroup, AggregationRepository};
use crate::error::{RepositoryError, RepositoryResult};

/// Statistics about the memory repository
#[derive(Debug, Clone, Default)]
pub struct MemoryRepositoryStats {
    /// Number of get operations
    pub get_count: u64,
    /// Number of successful writes
    pub add_count: u64,
    /// Number of successful removals
    pub remove_count: u64,
    /// Number of optimistic locking conflicts
    pub conflict_count: u64,
    /// Number of get operations that found a group
    pub hit_count: u64,
    /// Number of get operations that found nothing
    pub miss_count: u64,
}

/// In-memory aggregation repository using DashMap
///
/// Cloning shares the underlying map, so a clone handed to an
/// [`AggregateProcessor`](crate::processor::AggregateProcessor) can still be
/// inspected by the caller.
///
/// ## Example
///
/// ```rust,no_run
/// use aggregator::exchange::Exchange;
/// use aggregator::repository::{AggregateGroup, AggregationRepository, MemoryAggregationRepository};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let repository = MemoryAggregationRepository::new();
///     repository.add("order-1", AggregateGroup::first(Exchange::new("a"))).await?;
///
///     let stats = repository.stats().await;
///     println!("writes: {}", stats.add_count);
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct MemoryAggregationRepository {
    /// Stored groups by correlation key
    groups: Arc<DashMap<String, Arc<AggregateGroup>>>,
    /// Optimistic locking mode
    optimistic: bool,
    /// Statistics tracking
    stats: Arc<RwLock<MemoryRepositoryStats>>,
}

impl MemoryAggregationRepository {
    /// Create a repository in plain (last-write-wins) mode
    pub fn new() -> Self {
        Self::with_mode(false)
    }

    /// Create a repository in optimistic locking mode
    pub fn optimistic() -> Self {
        Self::with_mode(true)
    }

    fn with_mode(optimistic: bool) -> Self {
        Self {
            groups: Arc::new(DashMap::new()),
            optimistic,
            stats: Arc::new(RwLock::new(MemoryRepositoryStats::default())),
        }
    }

    /// Get current statistics
    pub async fn stats(&self) -> MemoryRepositoryStats {
        self.stats.read().await.clone()
    }

    /// Number of stored groups
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    fn mode(&self) -> &'static str {
        if self.optimistic {
            "optimistic"
        } else {
            "plain"
        }
    }

    async fn record_conflict(&self, key: &str) -> RepositoryError {
        self.stats.write().await.conflict_count += 1;
        debug!(key = %key, "Optimistic locking conflict");
        RepositoryError::OptimisticLocking {
            key: key.to_string(),
        }
    }
}

impl Default for MemoryAggregationRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AggregationRepository for MemoryAggregationRepository {
    fn name(&self) -> &str {
        "memory"
    }

    fn is_optimistic(&self) -> bool {
        self.optimistic
    }

    async fn get(&self, key: &str) -> RepositoryResult<Option<Arc<AggregateGroup>>> {
        let found = self.groups.get(key).map(|entry| Arc::clone(entry.value()));

        let mut stats = self.stats.write().await;
        stats.get_count += 1;
        if found.is_some() {
            stats.hit_count += 1;
        } else {
            stats.miss_count += 1;
        }

        trace!(key = %key, hit = found.is_some(), "Repository get");
        Ok(found)
    }

    async fn add(
        &self,
        key: &str,
        group: AggregateGroup,
    ) -> RepositoryResult<Option<Arc<AggregateGroup>>> {
        if self.optimistic {
            return Err(RepositoryError::Unsupported {
                operation: "add",
                mode: self.mode(),
            });
        }

        let previous = self.groups.insert(key.to_string(), Arc::new(group));
        self.stats.write().await.add_count += 1;

        trace!(key = %key, "Repository add");
        Ok(previous)
    }

    async fn compare_and_add(
        &self,
        key: &str,
        expected: Option<&Arc<AggregateGroup>>,
        group: AggregateGroup,
    ) -> RepositoryResult<Option<Arc<AggregateGroup>>> {
        if !self.optimistic {
            return Err(RepositoryError::Unsupported {
                operation: "compare_and_add",
                mode: self.mode(),
            });
        }

        let outcome = match self.groups.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => match expected {
                Some(expected) if Arc::ptr_eq(occupied.get(), expected) => {
                    Ok(Some(occupied.insert(Arc::new(group))))
                }
                _ => Err(()),
            },
            Entry::Vacant(vacant) => match expected {
                None => {
                    vacant.insert(Arc::new(group));
                    Ok(None)
                }
                Some(_) => Err(()),
            },
        };

        match outcome {
            Ok(previous) => {
                self.stats.write().await.add_count += 1;
                trace!(key = %key, "Repository compare_and_add");
                Ok(previous)
            }
            Err(()) => Err(self.record_conflict(key).await),
        }
    }

    async fn remove(&self, key: &str, expected: &Arc<AggregateGroup>) -> RepositoryResult<()> {
        if self.optimistic {
            let removed = self
                .groups
                .remove_if(key, |_, current| Arc::ptr_eq(current, expected));
            if removed.is_none() {
                return Err(self.record_conflict(key).await);
            }
        } else {
            self.groups.remove(key);
        }

        self.stats.write().await.remove_count += 1;
        trace!(key = %key, "Repository remove");
        Ok(())
    }

    async fn keys(&self) -> RepositoryResult<HashSet<String>> {
        Ok(self.groups.iter().map(|entry| entry.key().clone()).collect())
    }

    async fn count(&self) -> RepositoryResult<usize> {
        Ok(self.groups.len())
    }

    async fn stop(&self) -> RepositoryResult<()> {
        debug!(groups = self.groups.len(), mode = self.mode(), "Memory repository stopped");
        self.groups.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::Exchange;
    use crate::repository::tests::*;

    #[tokio::test]
    async fn test_memory_plain_ops() {
        test_plain_repository_ops(MemoryAggregationRepository::new()).await;
    }

    #[tokio::test]
    async fn test_memory_optimistic_ops() {
        test_optimistic_repository_ops(MemoryAggregationRepository::optimistic()).await;
    }

    #[tokio::test]
    async fn test_memory_keys() {
        test_repository_keys(MemoryAggregationRepository::new()).await;
        test_repository_keys(MemoryAggregationRepository::optimistic()).await;
    }

    #[tokio::test]
    async fn test_memory_stats() {
        let repository = MemoryAggregationRepository::optimistic();
        repository
            .compare_and_add("k", None, AggregateGroup::first(Exchange::new(1)))
            .await
            .unwrap();
        repository.get("k").await.unwrap();
        repository.get("missing").await.unwrap();
        let _ = repository
            .compare_and_add("k", None, AggregateGroup::first(Exchange::new(2)))
            .await;

        let stats = repository.stats().await;
        assert_eq!(stats.add_count, 1);
        assert_eq!(stats.get_count, 2);
        assert_eq!(stats.hit_count, 1);
        assert_eq!(stats.miss_count, 1);
        assert_eq!(stats.conflict_count, 1);
    }

    #[tokio::test]
    async fn test_clone_shares_state() {
        let repository = MemoryAggregationRepository::new();
        let clone = repository.clone();
        clone
            .add("k", AggregateGroup::first(Exchange::new(1)))
            .await
            .unwrap();
        assert_eq!(repository.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_compare_and_add_single_winner() {
        let repository = MemoryAggregationRepository::optimistic();
        repository
            .compare_and_add("k", None, AggregateGroup::first(Exchange::new(0)))
            .await
            .unwrap();
        let base = repository.get("k").await.unwrap().unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let repository = repository.clone();
            let base = Arc::clone(&base);
            handles.push(tokio::spawn(async move {
                repository
                    .compare_and_add("k", Some(&base), AggregateGroup::new(Exchange::new(i), 2, 1))
                    .await
            }));
        }

        let mut won = 0;
        let mut conflicts = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => won += 1,
                Err(RepositoryError::OptimisticLocking { .. }) => conflicts += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(won, 1);
        assert_eq!(conflicts, 7);
    }
}
