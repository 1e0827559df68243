//! Aggregation repositories
//!
//! A repository stores the in-flight aggregate for each correlation key. Two
//! locking modes exist and an instance supports exactly one of them:
//!
//! - **Plain**: [`AggregationRepository::add`] is last-write-wins and
//!   [`AggregationRepository::remove`] is unconditional.
//! - **Optimistic**: [`AggregationRepository::compare_and_add`] and
//!   [`AggregationRepository::remove`] succeed only when the stored group is
//!   the very instance the caller read earlier, otherwise they fail with
//!   [`RepositoryError::OptimisticLocking`].
//!
//! Calling the method of the other mode fails with
//! [`RepositoryError::Unsupported`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use aggregator::exchange::Exchange;
//! use aggregator::repository::{AggregateGroup, AggregationRepository, MemoryAggregationRepository};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let repository = MemoryAggregationRepository::optimistic();
//!
//!     let first = repository
//!         .compare_and_add("order-1", None, AggregateGroup::first(Exchange::new("a")))
//!         .await?;
//!     assert!(first.is_none());
//!
//!     let current = repository.get("order-1").await?.expect("stored");
//!     repository.remove("order-1", &current).await?;
//!     Ok(())
//! }
//! ```

mod memory;

pub use memory::{MemoryAggregationRepository, MemoryRepositoryStats};

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{RepositoryError, RepositoryResult};
use crate::exchange::Exchange;

/// Accumulated state for one correlation key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateGroup {
    /// Merged exchange so far
    pub exchange: Exchange,
    /// Number of exchanges merged into this group
    pub size: u64,
    /// Revision counter, bumped on every store
    pub index: u64,
}

impl AggregateGroup {
    /// Group holding a single exchange
    pub fn first(exchange: Exchange) -> Self {
        Self {
            exchange,
            size: 1,
            index: 0,
        }
    }

    pub fn new(exchange: Exchange, size: u64, index: u64) -> Self {
        Self {
            exchange,
            size,
            index,
        }
    }
}

/// Key to aggregate store used by the aggregate processor
///
/// Groups are handed out as `Arc<AggregateGroup>`; in optimistic mode the
/// `Arc` identity is the version compared on every conditional write.
#[async_trait]
pub trait AggregationRepository: Send + Sync {
    /// Short name used in logs and errors
    fn name(&self) -> &str;

    /// Whether this instance runs in optimistic locking mode
    fn is_optimistic(&self) -> bool {
        false
    }

    /// Look up the group stored for `key`
    async fn get(&self, key: &str) -> RepositoryResult<Option<Arc<AggregateGroup>>>;

    /// Store `group` under `key`, returning the previous group (plain mode)
    async fn add(
        &self,
        key: &str,
        group: AggregateGroup,
    ) -> RepositoryResult<Option<Arc<AggregateGroup>>>;

    /// Store `group` under `key` only if the current group is `expected`
    /// (optimistic mode); `None` expects the key to be absent
    async fn compare_and_add(
        &self,
        _key: &str,
        _expected: Option<&Arc<AggregateGroup>>,
        _group: AggregateGroup,
    ) -> RepositoryResult<Option<Arc<AggregateGroup>>> {
        Err(RepositoryError::Unsupported {
            operation: "compare_and_add",
            mode: "plain",
        })
    }

    /// Remove the group stored under `key`
    ///
    /// In optimistic mode the stored group must be `expected`.
    async fn remove(&self, key: &str, expected: &Arc<AggregateGroup>) -> RepositoryResult<()>;

    /// Mark the delivery of a completed exchange as committed
    async fn confirm(&self, _exchange_id: &str) -> RepositoryResult<()> {
        Ok(())
    }

    /// Snapshot of the keys currently stored
    async fn keys(&self) -> RepositoryResult<HashSet<String>>;

    /// Number of groups currently stored
    async fn count(&self) -> RepositoryResult<usize> {
        Ok(self.keys().await?.len())
    }

    async fn start(&self) -> RepositoryResult<()> {
        Ok(())
    }

    async fn stop(&self) -> RepositoryResult<()> {
        Ok(())
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    fn group(body: &str) -> AggregateGroup {
        AggregateGroup::first(Exchange::new(body))
    }

    // Generic tests that any plain-mode repository should pass
    pub async fn test_plain_repository_ops<R: AggregationRepository>(repository: R) {
        assert!(repository.get("k1").await.unwrap().is_none());

        let previous = repository.add("k1", group("a")).await.unwrap();
        assert!(previous.is_none());

        let previous = repository.add("k1", group("b")).await.unwrap();
        assert_eq!(previous.unwrap().exchange.body(), "a");

        let current = repository.get("k1").await.unwrap().unwrap();
        assert_eq!(current.exchange.body(), "b");

        // wrong-mode call
        let err = repository
            .compare_and_add("k1", Some(&current), group("c"))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Unsupported { .. }));

        // plain remove ignores the expected instance
        let stale = Arc::new(group("stale"));
        repository.remove("k1", &stale).await.unwrap();
        assert!(repository.get("k1").await.unwrap().is_none());
    }

    // Generic tests that any optimistic-mode repository should pass
    pub async fn test_optimistic_repository_ops<R: AggregationRepository>(repository: R) {
        assert!(repository.is_optimistic());

        let err = repository.add("k1", group("a")).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Unsupported { .. }));

        repository.compare_and_add("k1", None, group("a")).await.unwrap();
        let first = repository.get("k1").await.unwrap().unwrap();

        // key already present
        let err = repository
            .compare_and_add("k1", None, group("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::OptimisticLocking { .. }));

        let previous = repository
            .compare_and_add("k1", Some(&first), group("b"))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&previous.unwrap(), &first));

        // stale version
        let err = repository
            .compare_and_add("k1", Some(&first), group("c"))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::OptimisticLocking { .. }));

        let err = repository.remove("k1", &first).await.unwrap_err();
        assert!(matches!(err, RepositoryError::OptimisticLocking { .. }));

        let current = repository.get("k1").await.unwrap().unwrap();
        repository.remove("k1", &current).await.unwrap();
        assert!(repository.get("k1").await.unwrap().is_none());

        // removing an absent key is a conflict as well
        let err = repository.remove("k1", &current).await.unwrap_err();
        assert!(matches!(err, RepositoryError::OptimisticLocking { .. }));
    }

    pub async fn test_repository_keys<R: AggregationRepository>(repository: R) {
        for key in ["a", "b", "c"] {
            if repository.is_optimistic() {
                repository.compare_and_add(key, None, group(key)).await.unwrap();
            } else {
                repository.add(key, group(key)).await.unwrap();
            }
        }

        let keys = repository.keys().await.unwrap();
        assert_eq!(keys.len(), 3);
        assert!(keys.contains("b"));
        assert_eq!(repository.count().await.unwrap(), 3);
    }
}
