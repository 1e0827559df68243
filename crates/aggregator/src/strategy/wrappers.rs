//! Strategy wrappers
//!
//! Each wrapper owns an inner strategy, delegates every method it does not
//! extend and adds one behavior on top.

use std::time::Duration;

use super::AggregationStrategy;
use crate::error::StrategyResult;
use crate::exchange::Exchange;

macro_rules! delegate_hooks {
    () => {
        fn start(&self) -> StrategyResult<()> {
            self.inner.start()
        }

        fn on_optimistic_lock_failure(&self, old: Option<&Exchange>, new: &Exchange) {
            self.inner.on_optimistic_lock_failure(old, new)
        }
    };
}

/// Copies failure and rollback markers from every incoming exchange onto
/// the merge result
///
/// Failures of split or fanned-out parts then stay visible on the rejoined
/// aggregate.
#[derive(Debug, Clone)]
pub struct ShareUnitOfWorkStrategy<S> {
    inner: S,
}

impl<S: AggregationStrategy> ShareUnitOfWorkStrategy<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: AggregationStrategy> AggregationStrategy for ShareUnitOfWorkStrategy<S> {
    fn aggregate(&self, old: Option<Exchange>, new: Exchange) -> StrategyResult<Exchange> {
        let failure = new.exception.clone();
        let rollback_only = new.rollback_only;
        let rollback_only_last = new.rollback_only_last;
        let error_handled = new.error_handled;

        let mut answer = self.inner.aggregate(old, new)?;

        if failure.is_some() {
            answer.exception = failure;
        }
        if rollback_only {
            answer.rollback_only = true;
        }
        if rollback_only_last {
            answer.rollback_only_last = true;
        }
        if error_handled.is_some() {
            answer.error_handled = error_handled;
        }
        Ok(answer)
    }

    fn can_pre_complete(&self) -> bool {
        self.inner.can_pre_complete()
    }

    fn pre_complete(&self, old: Option<&Exchange>, new: &Exchange) -> bool {
        self.inner.pre_complete(old, new)
    }

    fn timeout(&self, exchange: &mut Exchange, timeout: Duration) {
        self.inner.timeout(exchange, timeout)
    }

    fn on_completion(&self, exchange: &mut Exchange) {
        self.inner.on_completion(exchange)
    }

    delegate_hooks!();
}

/// Puts the aggregator in pre-completion mode
///
/// Before each merge `f(old, new)` is asked whether the current group is
/// complete; if so the group completes and `new` starts a fresh group.
pub struct PreCompletionStrategy<S, F> {
    inner: S,
    f: F,
}

impl<S, F> PreCompletionStrategy<S, F>
where
    S: AggregationStrategy,
    F: Fn(Option<&Exchange>, &Exchange) -> bool + Send + Sync,
{
    pub fn new(inner: S, f: F) -> Self {
        Self { inner, f }
    }
}

impl<S, F> AggregationStrategy for PreCompletionStrategy<S, F>
where
    S: AggregationStrategy,
    F: Fn(Option<&Exchange>, &Exchange) -> bool + Send + Sync,
{
    fn aggregate(&self, old: Option<Exchange>, new: Exchange) -> StrategyResult<Exchange> {
        self.inner.aggregate(old, new)
    }

    fn can_pre_complete(&self) -> bool {
        true
    }

    fn pre_complete(&self, old: Option<&Exchange>, new: &Exchange) -> bool {
        (self.f)(old, new)
    }

    fn timeout(&self, exchange: &mut Exchange, timeout: Duration) {
        self.inner.timeout(exchange, timeout)
    }

    fn on_completion(&self, exchange: &mut Exchange) {
        self.inner.on_completion(exchange)
    }

    delegate_hooks!();
}

/// Runs a callback on aggregates completed by timeout
pub struct TimeoutAwareStrategy<S, F> {
    inner: S,
    f: F,
}

impl<S, F> TimeoutAwareStrategy<S, F>
where
    S: AggregationStrategy,
    F: Fn(&mut Exchange, Duration) + Send + Sync,
{
    pub fn new(inner: S, f: F) -> Self {
        Self { inner, f }
    }
}

impl<S, F> AggregationStrategy for TimeoutAwareStrategy<S, F>
where
    S: AggregationStrategy,
    F: Fn(&mut Exchange, Duration) + Send + Sync,
{
    fn aggregate(&self, old: Option<Exchange>, new: Exchange) -> StrategyResult<Exchange> {
        self.inner.aggregate(old, new)
    }

    fn can_pre_complete(&self) -> bool {
        self.inner.can_pre_complete()
    }

    fn pre_complete(&self, old: Option<&Exchange>, new: &Exchange) -> bool {
        self.inner.pre_complete(old, new)
    }

    fn timeout(&self, exchange: &mut Exchange, timeout: Duration) {
        self.inner.timeout(exchange, timeout);
        (self.f)(exchange, timeout)
    }

    fn on_completion(&self, exchange: &mut Exchange) {
        self.inner.on_completion(exchange)
    }

    delegate_hooks!();
}

/// Runs a callback on every completed aggregate
pub struct CompletionAwareStrategy<S, F> {
    inner: S,
    f: F,
}

impl<S, F> CompletionAwareStrategy<S, F>
where
    S: AggregationStrategy,
    F: Fn(&mut Exchange) + Send + Sync,
{
    pub fn new(inner: S, f: F) -> Self {
        Self { inner, f }
    }
}

impl<S, F> AggregationStrategy for CompletionAwareStrategy<S, F>
where
    S: AggregationStrategy,
    F: Fn(&mut Exchange) + Send + Sync,
{
    fn aggregate(&self, old: Option<Exchange>, new: Exchange) -> StrategyResult<Exchange> {
        self.inner.aggregate(old, new)
    }

    fn can_pre_complete(&self) -> bool {
        self.inner.can_pre_complete()
    }

    fn pre_complete(&self, old: Option<&Exchange>, new: &Exchange) -> bool {
        self.inner.pre_complete(old, new)
    }

    fn timeout(&self, exchange: &mut Exchange, timeout: Duration) {
        self.inner.timeout(exchange, timeout)
    }

    fn on_completion(&self, exchange: &mut Exchange) {
        self.inner.on_completion(exchange);
        (self.f)(exchange)
    }

    delegate_hooks!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::exchange::ExchangeFailure;
    use crate::strategy::{
        AggregationStrategyExt, BeanAdapterStrategy, BeanMethod, GroupedBodyStrategy,
        UseLatestStrategy, UseOriginalStrategy,
    };
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_share_unit_of_work_copies_markers() {
        let strategy = UseOriginalStrategy::new().share_unit_of_work();

        let mut part = Exchange::new("part");
        part.exception = Some(ExchangeFailure::new(FailureKind::Delivery, "part failed"));
        part.rollback_only = true;
        part.error_handled = Some(false);

        let merged = strategy.aggregate(Some(Exchange::new("whole")), part).unwrap();
        assert_eq!(merged.body(), "whole");
        assert_eq!(merged.exception.unwrap().message, "part failed");
        assert!(merged.rollback_only);
        assert!(!merged.rollback_only_last);
        assert_eq!(merged.error_handled, Some(false));
    }

    #[test]
    fn test_share_unit_of_work_leaves_clean_result() {
        let strategy = UseLatestStrategy::new().share_unit_of_work();
        let merged = strategy
            .aggregate(Some(Exchange::new(1)), Exchange::new(2))
            .unwrap();
        assert!(merged.exception.is_none());
        assert!(!merged.rollback_only);
    }

    #[test]
    fn test_pre_completion_wrapper() {
        let strategy = GroupedBodyStrategy::new()
            .pre_complete_when(|old, new| old.is_some() && new.header_bool("new_batch"));
        assert!(strategy.can_pre_complete());

        let old = Exchange::new("a");
        assert!(!strategy.pre_complete(None, &Exchange::empty().with_header("new_batch", true)));
        assert!(strategy.pre_complete(Some(&old), &Exchange::empty().with_header("new_batch", true)));
        assert!(!strategy.pre_complete(Some(&old), &Exchange::empty()));
    }

    #[test]
    fn test_timeout_and_completion_hooks_chain() {
        let completions = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&completions);

        let strategy = GroupedBodyStrategy::new()
            .on_timeout(|exchange, timeout| {
                exchange.set_property("timed_out_after", timeout.as_millis() as u64);
            })
            .on_complete(move |_exchange| {
                counter.fetch_add(1, Ordering::SeqCst);
            });

        let mut exchange = Exchange::empty();
        strategy.timeout(&mut exchange, Duration::from_millis(250));
        strategy.on_completion(&mut exchange);

        assert_eq!(exchange.property("timed_out_after"), Some(&json!(250)));
        assert_eq!(completions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wrappers_delegate_start() {
        let strategy = BeanAdapterStrategy::new("bean")
            .with_method(BeanMethod::new("a", |_, new| Ok(new.clone())))
            .with_method(BeanMethod::new("b", |_, new| Ok(new.clone())))
            .share_unit_of_work();
        assert!(strategy.start().is_err());
    }
}
