//! Error types for the aggregator
//!
//! This module provides the error taxonomy for every aggregator operation:
//! correlation, repository access, aggregation strategies, configuration,
//! downstream delivery and lifecycle management.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main aggregator error type
#[derive(Error, Debug)]
pub enum AggregatorError {
    /// Correlation key errors
    #[error("correlation error: {0}")]
    Correlation(#[from] CorrelationError),

    /// Aggregation repository errors
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    /// Aggregation strategy errors
    #[error("aggregation strategy error: {0}")]
    Strategy(#[from] StrategyError),

    /// Configuration errors
    #[error("configuration error: {source}")]
    Configuration {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Downstream delivery of a completed aggregate failed
    #[error("delivery of aggregated exchange {exchange_id} failed: {source}")]
    Delivery {
        exchange_id: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Optimistic locking retries were exhausted
    #[error("exhausted optimistic locking retry attempts, tried {attempts} times")]
    RetriesExhausted { attempts: u32 },

    /// Operation not allowed in the current lifecycle state
    #[error("lifecycle error: {0}")]
    Lifecycle(String),
}

/// Correlation key errors
#[derive(Error, Debug)]
pub enum CorrelationError {
    /// The correlation expression produced no key or an empty key
    #[error("invalid correlation key for exchange {exchange_id}")]
    InvalidKey { exchange_id: String },

    /// The key has already completed and has been closed
    #[error("correlation key '{key}' has been closed")]
    ClosedKey { key: String },
}

/// Aggregation repository errors
#[derive(Error, Debug)]
pub enum RepositoryError {
    /// Compare-and-swap against the expected group failed
    #[error("optimistic locking failed for correlation key '{key}'")]
    OptimisticLocking { key: String },

    /// Operation called on a repository running in the other locking mode
    #[error("{operation} is not supported by a repository in {mode} mode")]
    Unsupported {
        operation: &'static str,
        mode: &'static str,
    },

    /// Storage backend failure
    #[error("storage error in {backend}: {details}")]
    Storage { backend: String, details: String },
}

/// Aggregation strategy errors
#[derive(Error, Debug)]
pub enum StrategyError {
    /// The strategy failed while merging two exchanges
    #[error("aggregation failed: {source}")]
    MergeFailed {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Bean adapter found no method to use as the merge function
    #[error("bean '{bean}' exposes no eligible aggregation method matching '{method}'")]
    NoEligibleMethod { bean: String, method: String },

    /// Bean adapter found more than one candidate method
    #[error("bean '{bean}' exposes ambiguous aggregation methods: {candidates:?}")]
    AmbiguousMethod {
        bean: String,
        candidates: Vec<String>,
    },

    /// Bean adapter used before its method was resolved
    #[error("bean '{bean}' has not been started")]
    NotStarted { bean: String },
}

/// Coarse classification of a failure attached to an exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    InvalidCorrelationKey,
    ClosedCorrelationKey,
    OptimisticLocking,
    Repository,
    Strategy,
    Configuration,
    Delivery,
    RetriesExhausted,
    Lifecycle,
}

impl AggregatorError {
    /// Build a configuration error from a message
    pub fn configuration(message: impl Into<String>) -> Self {
        AggregatorError::Configuration {
            source: message.into().into(),
        }
    }

    /// Whether this error is a compare-and-swap conflict in the repository
    pub fn is_optimistic_locking(&self) -> bool {
        matches!(
            self,
            AggregatorError::Repository(RepositoryError::OptimisticLocking { .. })
        )
    }

    /// Classify this error for attaching to an exchange
    pub fn kind(&self) -> FailureKind {
        match self {
            AggregatorError::Correlation(CorrelationError::InvalidKey { .. }) => {
                FailureKind::InvalidCorrelationKey
            }
            AggregatorError::Correlation(CorrelationError::ClosedKey { .. }) => {
                FailureKind::ClosedCorrelationKey
            }
            AggregatorError::Repository(RepositoryError::OptimisticLocking { .. }) => {
                FailureKind::OptimisticLocking
            }
            AggregatorError::Repository(_) => FailureKind::Repository,
            AggregatorError::Strategy(StrategyError::MergeFailed { .. }) => FailureKind::Strategy,
            AggregatorError::Strategy(_) => FailureKind::Configuration,
            AggregatorError::Configuration { .. } => FailureKind::Configuration,
            AggregatorError::Delivery { .. } => FailureKind::Delivery,
            AggregatorError::RetriesExhausted { .. } => FailureKind::RetriesExhausted,
            AggregatorError::Lifecycle(_) => FailureKind::Lifecycle,
        }
    }
}

impl StrategyError {
    /// Wrap a user callback failure as a merge failure
    pub fn merge_failed(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        StrategyError::MergeFailed { source: err.into() }
    }
}

impl From<figment::Error> for AggregatorError {
    fn from(err: figment::Error) -> Self {
        AggregatorError::Configuration {
            source: Box::new(err),
        }
    }
}

/// Result type alias for aggregator operations
pub type Result<T> = std::result::Result<T, AggregatorError>;

/// Result type alias for repository operations
pub type RepositoryResult<T> = std::result::Result<T, RepositoryError>;

/// Result type alias for strategy operations
pub type StrategyResult<T> = std::result::Result<T, StrategyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlation_error_display() {
        let err = CorrelationError::InvalidKey {
            exchange_id: "ex-1".to_string(),
        };
        assert!(err.to_string().contains("invalid correlation key"));
    }

    #[test]
    fn test_repository_error_display() {
        let err = RepositoryError::Unsupported {
            operation: "add",
            mode: "optimistic",
        };
        assert_eq!(
            err.to_string(),
            "add is not supported by a repository in optimistic mode"
        );
    }

    #[test]
    fn test_ambiguous_method_display() {
        let err = StrategyError::AmbiguousMethod {
            bean: "orders".to_string(),
            candidates: vec!["append".to_string(), "merge".to_string()],
        };
        let text = err.to_string();
        assert!(text.contains("ambiguous"));
        assert!(text.contains("append"));
    }

    #[test]
    fn test_aggregator_error_from_repository_error() {
        let err: AggregatorError = RepositoryError::OptimisticLocking {
            key: "k".to_string(),
        }
        .into();
        assert!(err.is_optimistic_locking());
        assert_eq!(err.kind(), FailureKind::OptimisticLocking);
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            AggregatorError::configuration("missing").kind(),
            FailureKind::Configuration
        );
        assert_eq!(
            AggregatorError::RetriesExhausted { attempts: 3 }.kind(),
            FailureKind::RetriesExhausted
        );
        let merge: AggregatorError = StrategyError::merge_failed("boom").into();
        assert_eq!(merge.kind(), FailureKind::Strategy);
    }
}
