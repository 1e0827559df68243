//! Aggregation strategies
//!
//! An [`AggregationStrategy`] merges an incoming exchange into the aggregate
//! built so far. The merge is the only required method; the other methods
//! are lifecycle and notification hooks with no-op defaults.
//!
//! Wrapper behaviors are composed rather than inherited: a wrapper owns an
//! inner strategy, delegates the merge and adds its own step. The
//! [`AggregationStrategyExt`] extension trait builds them fluently:
//!
//! ```rust
//! use aggregator::strategy::{AggregationStrategyExt, GroupedBodyStrategy};
//!
//! let strategy = GroupedBodyStrategy::new()
//!     .share_unit_of_work()
//!     .pre_complete_when(|_old, new| new.header_bool("flush"));
//! ```

mod bean;
mod grouped;
mod latest;
mod original;
mod wrappers;

pub use bean::{BeanAdapterStrategy, BeanMethod, BeanMethodFn};
pub use grouped::{GroupedBodyStrategy, GroupedExchangeStrategy, GroupedMessageStrategy, ListCarrier};
pub use latest::UseLatestStrategy;
pub use original::UseOriginalStrategy;
pub use wrappers::{
    CompletionAwareStrategy, PreCompletionStrategy, ShareUnitOfWorkStrategy, TimeoutAwareStrategy,
};

use std::sync::Arc;
use std::time::Duration;

use crate::error::StrategyResult;
use crate::exchange::Exchange;

/// Merge function for correlated exchanges
pub trait AggregationStrategy: Send + Sync {
    /// Merge `new` into `old`, where `old` is `None` for the first exchange
    /// of a group
    ///
    /// `old` is an owned copy of the stored aggregate, so a strategy may
    /// modify and return it.
    fn aggregate(&self, old: Option<Exchange>, new: Exchange) -> StrategyResult<Exchange>;

    /// Resolve and validate configuration before the first merge
    fn start(&self) -> StrategyResult<()> {
        Ok(())
    }

    /// Whether [`pre_complete`](Self::pre_complete) decides completion
    ///
    /// In pre-completion mode the completion predicate and size are not
    /// evaluated.
    fn can_pre_complete(&self) -> bool {
        false
    }

    /// Whether the current group must complete before `new` is merged;
    /// `new` then starts a fresh group
    fn pre_complete(&self, _old: Option<&Exchange>, _new: &Exchange) -> bool {
        false
    }

    /// Called when a group completes by timeout, before delivery
    fn timeout(&self, _exchange: &mut Exchange, _timeout: Duration) {}

    /// Called with every completed aggregate before delivery
    fn on_completion(&self, _exchange: &mut Exchange) {}

    /// Called when storing the merge result lost an optimistic locking race
    fn on_optimistic_lock_failure(&self, _old: Option<&Exchange>, _new: &Exchange) {}
}

impl<S: AggregationStrategy + ?Sized> AggregationStrategy for Arc<S> {
    fn aggregate(&self, old: Option<Exchange>, new: Exchange) -> StrategyResult<Exchange> {
        (**self).aggregate(old, new)
    }

    fn start(&self) -> StrategyResult<()> {
        (**self).start()
    }

    fn can_pre_complete(&self) -> bool {
        (**self).can_pre_complete()
    }

    fn pre_complete(&self, old: Option<&Exchange>, new: &Exchange) -> bool {
        (**self).pre_complete(old, new)
    }

    fn timeout(&self, exchange: &mut Exchange, timeout: Duration) {
        (**self).timeout(exchange, timeout)
    }

    fn on_completion(&self, exchange: &mut Exchange) {
        (**self).on_completion(exchange)
    }

    fn on_optimistic_lock_failure(&self, old: Option<&Exchange>, new: &Exchange) {
        (**self).on_optimistic_lock_failure(old, new)
    }
}

/// Strategy built from a merge closure
pub struct FnAggregationStrategy<F> {
    f: F,
}

impl<F> FnAggregationStrategy<F>
where
    F: Fn(Option<Exchange>, Exchange) -> StrategyResult<Exchange> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> AggregationStrategy for FnAggregationStrategy<F>
where
    F: Fn(Option<Exchange>, Exchange) -> StrategyResult<Exchange> + Send + Sync,
{
    fn aggregate(&self, old: Option<Exchange>, new: Exchange) -> StrategyResult<Exchange> {
        (self.f)(old, new)
    }
}

/// Fluent composition of strategy wrappers
pub trait AggregationStrategyExt: AggregationStrategy + Sized {
    /// Copy failure and rollback markers of each incoming exchange onto the
    /// merge result
    fn share_unit_of_work(self) -> ShareUnitOfWorkStrategy<Self> {
        ShareUnitOfWorkStrategy::new(self)
    }

    /// Complete the current group before merging when `f` returns `true`
    fn pre_complete_when<F>(self, f: F) -> PreCompletionStrategy<Self, F>
    where
        F: Fn(Option<&Exchange>, &Exchange) -> bool + Send + Sync,
    {
        PreCompletionStrategy::new(self, f)
    }

    /// Run `f` on aggregates completed by timeout
    fn on_timeout<F>(self, f: F) -> TimeoutAwareStrategy<Self, F>
    where
        F: Fn(&mut Exchange, Duration) + Send + Sync,
    {
        TimeoutAwareStrategy::new(self, f)
    }

    /// Run `f` on every completed aggregate
    fn on_complete<F>(self, f: F) -> CompletionAwareStrategy<Self, F>
    where
        F: Fn(&mut Exchange) + Send + Sync,
    {
        CompletionAwareStrategy::new(self, f)
    }
}

impl<S: AggregationStrategy + Sized> AggregationStrategyExt for S {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StrategyError;
    use serde_json::json;

    #[test]
    fn test_fn_strategy_sums_bodies() {
        let strategy = FnAggregationStrategy::new(|old: Option<Exchange>, new: Exchange| {
            let Some(mut old) = old else {
                return Ok(new);
            };
            let sum = old.body().as_i64().unwrap_or(0) + new.body().as_i64().unwrap_or(0);
            old.set_body(sum);
            Ok(old)
        });

        let first = strategy.aggregate(None, Exchange::new(2)).unwrap();
        let second = strategy.aggregate(Some(first), Exchange::new(3)).unwrap();
        assert_eq!(second.body(), &json!(5));
    }

    #[test]
    fn test_fn_strategy_error() {
        let strategy = FnAggregationStrategy::new(|_old: Option<Exchange>, _new: Exchange| {
            Err(StrategyError::merge_failed("bad input"))
        });
        let err = strategy.aggregate(None, Exchange::empty()).unwrap_err();
        assert!(matches!(err, StrategyError::MergeFailed { .. }));
    }

    #[test]
    fn test_arc_strategy_delegates() {
        let strategy: Arc<dyn AggregationStrategy> = Arc::new(UseLatestStrategy::new());
        let merged = strategy
            .aggregate(Some(Exchange::new("old")), Exchange::new("new"))
            .unwrap();
        assert_eq!(merged.body(), "new");
        assert!(!strategy.can_pre_complete());
    }
}
