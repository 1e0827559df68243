//! Completion conditions
//!
//! A group completes when any configured condition holds. Conditions are
//! checked in a fixed order and the first match decides the reason recorded
//! on the aggregate:
//!
//! 1. the strategy set [`properties::COMPLETE_CURRENT_GROUP`]
//! 2. the completion predicate matched
//! 3. the size expression yielded a positive size that has been reached
//! 4. the static completion size has been reached
//!
//! Timeouts and the completion interval are driven by background tasks;
//! this module only resolves their durations.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::correlation::{CompletionPredicate, SizeExpression, TimeoutExpression};
use crate::error::{AggregatorError, Result};
use crate::exchange::{properties, CompletedBy, Exchange};

/// Evaluates completion conditions for one aggregator
#[derive(Clone, Default)]
pub struct CompletionEvaluator {
    predicate: Option<Arc<dyn CompletionPredicate>>,
    size: Option<u64>,
    size_expression: Option<SizeExpression>,
    timeout: Option<Duration>,
    timeout_expression: Option<TimeoutExpression>,
    interval: Option<Duration>,
    eager: bool,
}

impl fmt::Debug for CompletionEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionEvaluator")
            .field("predicate", &self.predicate.is_some())
            .field("size", &self.size)
            .field("size_expression", &self.size_expression.is_some())
            .field("timeout", &self.timeout)
            .field("timeout_expression", &self.timeout_expression.is_some())
            .field("interval", &self.interval)
            .field("eager", &self.eager)
            .finish()
    }
}

impl CompletionEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_predicate(mut self, predicate: impl CompletionPredicate + 'static) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn with_predicate_arc(mut self, predicate: Arc<dyn CompletionPredicate>) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// Static completion size, zero disables it
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = (size > 0).then_some(size);
        self
    }

    pub fn with_size_expression(mut self, expression: SizeExpression) -> Self {
        self.size_expression = Some(expression);
        self
    }

    /// Static completion timeout, zero disables it
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn with_timeout_expression(mut self, expression: TimeoutExpression) -> Self {
        self.timeout_expression = Some(expression);
        self
    }

    /// Periodic completion of all groups, zero disables it
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = (!interval.is_zero()).then_some(interval);
        self
    }

    /// Evaluate the predicate against the incoming exchange before merging
    pub fn with_eager(mut self, eager: bool) -> Self {
        self.eager = eager;
        self
    }

    pub fn is_eager(&self) -> bool {
        self.eager
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Whether timeouts need to be tracked
    pub fn uses_timeout(&self) -> bool {
        self.timeout.is_some() || self.timeout_expression.is_some()
    }

    /// Whether any completion condition is configured
    pub fn has_condition(&self) -> bool {
        self.predicate.is_some()
            || self.size.is_some()
            || self.size_expression.is_some()
            || self.uses_timeout()
            || self.interval.is_some()
    }

    /// Check the configuration before the processor starts
    ///
    /// In pre-completion mode the strategy decides completion, so no
    /// condition is required.
    pub fn validate(&self, pre_completion: bool) -> Result<()> {
        if !pre_completion && !self.has_condition() {
            return Err(AggregatorError::configuration(
                "at least one completion condition must be set \
                 [completion_timeout, completion_interval, completion_size, completion_predicate]",
            ));
        }
        if self.interval.is_some() && self.timeout.is_some() {
            return Err(AggregatorError::configuration(
                "only one of completion_interval or completion_timeout can be used, not both",
            ));
        }
        Ok(())
    }

    /// Evaluate the size and predicate conditions
    ///
    /// `exchange` is the merged aggregate in lazy mode and the incoming
    /// exchange in eager mode; `size` is the group size after the merge.
    pub fn evaluate(&self, exchange: &Exchange, size: u64) -> Option<CompletedBy> {
        if exchange.property_bool(properties::COMPLETE_CURRENT_GROUP) {
            return Some(CompletedBy::Strategy);
        }

        if let Some(predicate) = &self.predicate {
            if predicate.matches(exchange) {
                return Some(CompletedBy::Predicate);
            }
        }

        let dynamic_size = self
            .size_expression
            .as_ref()
            .and_then(|expression| expression(exchange))
            .filter(|value| *value > 0);

        match dynamic_size.or(self.size) {
            Some(threshold) if size >= threshold => Some(CompletedBy::Size),
            _ => None,
        }
    }

    /// Timeout to arm for a group, the expression wins over the static value
    pub fn timeout_for(&self, exchange: &Exchange) -> Option<Duration> {
        self.timeout_expression
            .as_ref()
            .and_then(|expression| expression(exchange))
            .filter(|timeout| !timeout.is_zero())
            .or(self.timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::HeaderEquals;

    #[test]
    fn test_no_condition_is_rejected() {
        let evaluator = CompletionEvaluator::new();
        assert!(evaluator.validate(false).is_err());
        assert!(evaluator.validate(true).is_ok());
    }

    #[test]
    fn test_interval_and_timeout_are_exclusive() {
        let evaluator = CompletionEvaluator::new()
            .with_timeout(Duration::from_millis(100))
            .with_interval(Duration::from_millis(100));
        assert!(evaluator.validate(false).is_err());
    }

    #[test]
    fn test_zero_values_disable_conditions() {
        let evaluator = CompletionEvaluator::new()
            .with_size(0)
            .with_timeout(Duration::ZERO)
            .with_interval(Duration::ZERO);
        assert!(!evaluator.has_condition());
    }

    #[test]
    fn test_size_condition() {
        let evaluator = CompletionEvaluator::new().with_size(3);
        let exchange = Exchange::empty();
        assert_eq!(evaluator.evaluate(&exchange, 2), None);
        assert_eq!(evaluator.evaluate(&exchange, 3), Some(CompletedBy::Size));
    }

    #[test]
    fn test_predicate_before_size() {
        let evaluator = CompletionEvaluator::new()
            .with_size(1)
            .with_predicate(HeaderEquals::new("done", true));
        let exchange = Exchange::empty().with_header("done", true);
        assert_eq!(evaluator.evaluate(&exchange, 1), Some(CompletedBy::Predicate));
    }

    #[test]
    fn test_strategy_request_first() {
        let evaluator = CompletionEvaluator::new().with_size(10);
        let exchange = Exchange::empty().with_property(properties::COMPLETE_CURRENT_GROUP, true);
        assert_eq!(evaluator.evaluate(&exchange, 1), Some(CompletedBy::Strategy));
    }

    #[test]
    fn test_size_expression_overrides_static_size() {
        let evaluator = CompletionEvaluator::new()
            .with_size(10)
            .with_size_expression(Arc::new(|ex: &Exchange| {
                ex.header("batch").and_then(|v| v.as_u64())
            }));

        let small = Exchange::empty().with_header("batch", 2);
        assert_eq!(evaluator.evaluate(&small, 2), Some(CompletedBy::Size));

        // no header: falls back to the static size
        assert_eq!(evaluator.evaluate(&Exchange::empty(), 2), None);
        assert_eq!(evaluator.evaluate(&Exchange::empty(), 10), Some(CompletedBy::Size));
    }

    #[test]
    fn test_timeout_expression_overrides_static_timeout() {
        let evaluator = CompletionEvaluator::new()
            .with_timeout(Duration::from_secs(5))
            .with_timeout_expression(Arc::new(|ex: &Exchange| {
                ex.header("timeout").and_then(|v| v.as_u64()).map(Duration::from_millis)
            }));

        let exchange = Exchange::empty().with_header("timeout", 250);
        assert_eq!(evaluator.timeout_for(&exchange), Some(Duration::from_millis(250)));
        assert_eq!(evaluator.timeout_for(&Exchange::empty()), Some(Duration::from_secs(5)));
        assert!(evaluator.uses_timeout());
    }
}
