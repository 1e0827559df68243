//! Aggregator for correlated message exchanges
//!
//! This crate implements the Aggregator enterprise integration pattern:
//! exchanges are correlated by key, merged into per-key groups by an
//! aggregation strategy and completed by predicate, size, timeout, interval
//! or an explicit force operation. Completed groups are delivered to a
//! downstream on a bounded delivery pool.
//!
//! ## Example
//!
//! ```rust,no_run
//! use aggregator::{AggregateProcessor, ChannelDownstream, Exchange, GroupedBodyStrategy, HeaderCorrelation};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let (downstream, mut completed) = ChannelDownstream::new();
//!
//!     let processor = AggregateProcessor::builder()
//!         .with_correlation_expression(HeaderCorrelation::new("order_id"))
//!         .with_aggregation_strategy(GroupedBodyStrategy::new())
//!         .with_downstream(downstream)
//!         .with_completion_size(3)
//!         .with_completion_timeout(Duration::from_secs(5))
//!         .build()?;
//!     processor.start().await?;
//!
//!     for line in ["a", "b", "c"] {
//!         let mut exchange = Exchange::new(line).with_header("order_id", "o-1");
//!         processor.process(&mut exchange).await?;
//!     }
//!
//!     let order = completed.recv().await.expect("completed order");
//!     println!("{} lines: {}", order.aggregated_size().unwrap_or(0), order.body());
//!
//!     processor.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod closed_keys;
pub mod completion;
pub mod config;
pub mod correlation;
pub mod delivery;
pub mod error;
pub mod exchange;
pub mod processor;
pub mod repository;
pub mod retry;
pub mod stats;
pub mod strategy;
pub mod timeout;

// Re-export commonly used types
pub use config::AggregatorConfig;

pub use correlation::{CompletionPredicate, CorrelationExpression, HeaderCorrelation, HeaderEquals};

pub use delivery::{ChannelDownstream, DeliveryExecutor, Downstream, FnDownstream};

pub use error::{
    AggregatorError, CorrelationError, FailureKind, RepositoryError, Result as AggregatorResult,
    StrategyError,
};

pub use exchange::{properties, CompletedBy, Exchange, ExchangeFailure, Message};

pub use processor::{AggregateProcessor, AggregateProcessorBuilder, LifecycleState};

pub use repository::{AggregateGroup, AggregationRepository, MemoryAggregationRepository};

pub use retry::OptimisticLockRetryPolicy;

pub use stats::StatisticsSnapshot;

pub use strategy::{
    AggregationStrategy, AggregationStrategyExt, BeanAdapterStrategy, BeanMethod,
    FnAggregationStrategy, GroupedBodyStrategy, GroupedExchangeStrategy, GroupedMessageStrategy,
    UseLatestStrategy, UseOriginalStrategy,
};
