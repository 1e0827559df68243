//! Fluent construction of an [`AggregateProcessor`]

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use super::{AggregateProcessor, DeliveryFailureHandler};
use crate::completion::CompletionEvaluator;
use crate::config::AggregatorConfig;
use crate::correlation::{CompletionPredicate, CorrelationExpression, SizeExpression, TimeoutExpression};
use crate::delivery::Downstream;
use crate::error::{AggregatorError, Result};
use crate::exchange::Exchange;
use crate::repository::{AggregationRepository, MemoryAggregationRepository};
use crate::retry::OptimisticLockRetryPolicy;
use crate::strategy::AggregationStrategy;
use crate::timeout::saturating_millis;

/// Builder for [`AggregateProcessor`]
///
/// The correlation expression, aggregation strategy and downstream are
/// required. Without an explicit repository a [`MemoryAggregationRepository`]
/// in the configured locking mode is used.
///
/// # Example
///
/// ```rust,no_run
/// use aggregator::correlation::HeaderCorrelation;
/// use aggregator::delivery::ChannelDownstream;
/// use aggregator::processor::AggregateProcessorBuilder;
/// use aggregator::strategy::GroupedBodyStrategy;
/// use std::time::Duration;
///
/// # fn main() -> anyhow::Result<()> {
/// let (downstream, _completed) = ChannelDownstream::new();
/// let processor = AggregateProcessorBuilder::new()
///     .with_correlation_expression(HeaderCorrelation::new("order_id"))
///     .with_aggregation_strategy(GroupedBodyStrategy::new())
///     .with_downstream(downstream)
///     .with_completion_size(10)
///     .with_completion_timeout(Duration::from_secs(5))
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct AggregateProcessorBuilder {
    id: Option<String>,
    correlation: Option<Arc<dyn CorrelationExpression>>,
    strategy: Option<Arc<dyn AggregationStrategy>>,
    downstream: Option<Arc<dyn Downstream>>,
    repository: Option<Arc<dyn AggregationRepository>>,
    predicate: Option<Arc<dyn CompletionPredicate>>,
    size_expression: Option<SizeExpression>,
    timeout_expression: Option<TimeoutExpression>,
    failure_handler: Option<DeliveryFailureHandler>,
    config: AggregatorConfig,
}

impl AggregateProcessorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a loaded configuration
    pub fn from_config(config: AggregatorConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Identifier used in logs
    pub fn with_id<S: Into<String>>(mut self, id: S) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_correlation_expression<C>(mut self, expression: C) -> Self
    where
        C: CorrelationExpression + 'static,
    {
        self.correlation = Some(Arc::new(expression));
        self
    }

    pub fn with_aggregation_strategy<S>(mut self, strategy: S) -> Self
    where
        S: AggregationStrategy + 'static,
    {
        self.strategy = Some(Arc::new(strategy));
        self
    }

    pub fn with_downstream<D>(mut self, downstream: D) -> Self
    where
        D: Downstream + 'static,
    {
        self.downstream = Some(Arc::new(downstream));
        self
    }

    pub fn with_repository(mut self, repository: Arc<dyn AggregationRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn with_completion_predicate<P>(mut self, predicate: P) -> Self
    where
        P: CompletionPredicate + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn with_completion_size(mut self, size: u64) -> Self {
        self.config.completion_size = size;
        self
    }

    pub fn with_completion_size_expression<F>(mut self, f: F) -> Self
    where
        F: Fn(&Exchange) -> Option<u64> + Send + Sync + 'static,
    {
        self.size_expression = Some(Arc::new(f));
        self
    }

    pub fn with_completion_timeout(mut self, timeout: Duration) -> Self {
        self.config.completion_timeout_ms = saturating_millis(timeout);
        self
    }

    pub fn with_completion_timeout_expression<F>(mut self, f: F) -> Self
    where
        F: Fn(&Exchange) -> Option<Duration> + Send + Sync + 'static,
    {
        self.timeout_expression = Some(Arc::new(f));
        self
    }

    pub fn with_completion_interval(mut self, interval: Duration) -> Self {
        self.config.completion_interval_ms = saturating_millis(interval);
        self
    }

    pub fn with_timeout_checker_interval(mut self, interval: Duration) -> Self {
        self.config.completion_timeout_checker_interval_ms = saturating_millis(interval);
        self
    }

    pub fn with_eager_check_completion(mut self, eager: bool) -> Self {
        self.config.eager_check_completion = eager;
        self
    }

    pub fn with_delivery_pool_size(mut self, size: usize) -> Self {
        self.config.delivery_pool_size = size;
        self
    }

    pub fn with_optimistic_locking(mut self, enabled: bool) -> Self {
        self.config.optimistic_locking = enabled;
        self
    }

    pub fn with_optimistic_lock_retry_policy(mut self, policy: OptimisticLockRetryPolicy) -> Self {
        self.config.optimistic_lock_retry = policy;
        self
    }

    pub fn with_ignore_invalid_correlation_keys(mut self, ignore: bool) -> Self {
        self.config.ignore_invalid_correlation_keys = ignore;
        self
    }

    /// Reject keys that already completed; zero keeps every closed key
    pub fn with_close_correlation_key_on_completion(mut self, capacity: usize) -> Self {
        self.config.close_correlation_key_on_completion = Some(capacity);
        self
    }

    pub fn with_discard_on_completion_timeout(mut self, discard: bool) -> Self {
        self.config.discard_on_completion_timeout = discard;
        self
    }

    pub fn with_discard_on_aggregation_failure(mut self, discard: bool) -> Self {
        self.config.discard_on_aggregation_failure = discard;
        self
    }

    pub fn with_completion_on_new_correlation_group(mut self, enabled: bool) -> Self {
        self.config.completion_on_new_correlation_group = enabled;
        self
    }

    pub fn with_force_completion_on_stop(mut self, enabled: bool) -> Self {
        self.config.force_completion_on_stop = enabled;
        self
    }

    pub fn with_exclusive_aggregation(mut self, enabled: bool) -> Self {
        self.config.exclusive_aggregation = enabled;
        self
    }

    pub fn with_statistics(mut self, enabled: bool) -> Self {
        self.config.statistics_enabled = enabled;
        self
    }

    /// Called with the aggregate, failure attached, when delivery fails
    pub fn with_delivery_failure_handler<F>(mut self, f: F) -> Self
    where
        F: Fn(&Exchange) + Send + Sync + 'static,
    {
        self.failure_handler = Some(Arc::new(f));
        self
    }

    /// Validate and assemble the processor; it still has to be started
    pub fn build(self) -> Result<AggregateProcessor> {
        let correlation = self
            .correlation
            .ok_or_else(|| AggregatorError::configuration("correlation expression is required"))?;
        let strategy = self
            .strategy
            .ok_or_else(|| AggregatorError::configuration("aggregation strategy is required"))?;
        let downstream = self
            .downstream
            .ok_or_else(|| AggregatorError::configuration("downstream is required"))?;

        self.config.validate()?;

        let repository = self.repository.unwrap_or_else(|| {
            if self.config.optimistic_locking {
                Arc::new(MemoryAggregationRepository::optimistic())
            } else {
                Arc::new(MemoryAggregationRepository::new())
            }
        });

        let mut completion = CompletionEvaluator::new()
            .with_size(self.config.completion_size)
            .with_eager(self.config.eager_check_completion);
        if let Some(timeout) = self.config.completion_timeout() {
            completion = completion.with_timeout(timeout);
        }
        if let Some(interval) = self.config.completion_interval() {
            completion = completion.with_interval(interval);
        }
        if let Some(predicate) = self.predicate {
            completion = completion.with_predicate_arc(predicate);
        }
        if let Some(expression) = self.size_expression {
            completion = completion.with_size_expression(expression);
        }
        if let Some(expression) = self.timeout_expression {
            completion = completion.with_timeout_expression(expression);
        }

        let id = self
            .id
            .unwrap_or_else(|| format!("aggregate-{}", Uuid::new_v4().simple()));

        Ok(AggregateProcessor::assemble(
            id,
            correlation,
            strategy,
            downstream,
            repository,
            completion,
            self.config,
            self.failure_handler,
        ))
    }
}
