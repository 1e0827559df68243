//! Correlation and completion expressions
//!
//! The aggregator treats correlation expressions and completion predicates
//! as opaque functions over an [`Exchange`]. Closures implement the traits
//! directly; header-based variants cover the common cases.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::exchange::Exchange;

/// Computes the correlation key of an exchange
///
/// Returning `None` or an empty string marks the exchange as having an
/// invalid correlation key.
pub trait CorrelationExpression: Send + Sync {
    fn evaluate(&self, exchange: &Exchange) -> Option<String>;
}

impl<F> CorrelationExpression for F
where
    F: Fn(&Exchange) -> Option<String> + Send + Sync,
{
    fn evaluate(&self, exchange: &Exchange) -> Option<String> {
        self(exchange)
    }
}

/// Correlates on the value of a message header
#[derive(Debug, Clone)]
pub struct HeaderCorrelation {
    header: String,
}

impl HeaderCorrelation {
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
        }
    }
}

impl CorrelationExpression for HeaderCorrelation {
    fn evaluate(&self, exchange: &Exchange) -> Option<String> {
        exchange.header(&self.header).and_then(value_as_key)
    }
}

/// Completion predicate over an exchange
pub trait CompletionPredicate: Send + Sync {
    fn matches(&self, exchange: &Exchange) -> bool;
}

impl<F> CompletionPredicate for F
where
    F: Fn(&Exchange) -> bool + Send + Sync,
{
    fn matches(&self, exchange: &Exchange) -> bool {
        self(exchange)
    }
}

/// Matches when a header is present and equals the expected value
#[derive(Debug, Clone)]
pub struct HeaderEquals {
    header: String,
    expected: Value,
}

impl HeaderEquals {
    pub fn new(header: impl Into<String>, expected: impl Into<Value>) -> Self {
        Self {
            header: header.into(),
            expected: expected.into(),
        }
    }
}

impl CompletionPredicate for HeaderEquals {
    fn matches(&self, exchange: &Exchange) -> bool {
        exchange.header(&self.header) == Some(&self.expected)
    }
}

/// Per-exchange completion size; `None` or zero falls back to the static size
pub type SizeExpression = Arc<dyn Fn(&Exchange) -> Option<u64> + Send + Sync>;

/// Per-exchange completion timeout; `None` or zero falls back to the static timeout
pub type TimeoutExpression = Arc<dyn Fn(&Exchange) -> Option<Duration> + Send + Sync>;

/// Convert a JSON scalar into a correlation key
pub fn value_as_key(value: &Value) -> Option<String> {
    let key = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null | Value::Array(_) | Value::Object(_) => return None,
    };
    if key.is_empty() {
        None
    } else {
        Some(key)
    }
}
