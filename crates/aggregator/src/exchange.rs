//! Exchange model
//!
//! An [`Exchange`] carries one message through the aggregator together with
//! exchange-scoped properties, failure markers and, for grouped strategies,
//! the exchanges collected so far.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{AggregatorError, FailureKind};

/// Well-known exchange property and header names used by the aggregator
pub mod properties {
    /// How the aggregate completed (see [`super::CompletedBy`])
    pub const COMPLETED_BY: &str = "aggregator.completed_by";
    /// Correlation key of the completed aggregate
    pub const CORRELATION_KEY: &str = "aggregator.correlation_key";
    /// Number of exchanges merged into the aggregate
    pub const SIZE: &str = "aggregator.size";
    /// Completion timeout armed for the aggregate, in milliseconds
    pub const TIMEOUT_MS: &str = "aggregator.timeout_ms";
    /// Set by a strategy to complete the current group after the merge
    pub const COMPLETE_CURRENT_GROUP: &str = "aggregator.complete_current_group";
    /// Grouped list carried as a property instead of the body
    pub const GROUPED: &str = "aggregator.grouped";

    /// Header: complete all groups, the carrying exchange is not aggregated
    pub const COMPLETE_ALL_GROUPS: &str = "aggregator.complete_all_groups";
    /// Header: aggregate the carrying exchange, then complete all groups
    pub const COMPLETE_ALL_GROUPS_INCLUSIVE: &str = "aggregator.complete_all_groups_inclusive";
}

/// Reason an aggregate was completed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletedBy {
    /// Completion predicate matched
    Predicate,
    /// Completion size reached
    Size,
    /// Completion timeout elapsed
    Timeout,
    /// Periodic completion interval fired
    Interval,
    /// Forced through an administrative operation or shutdown
    Force,
    /// The aggregation strategy requested completion
    Strategy,
}

impl CompletedBy {
    /// Stable lowercase name, as stored in [`properties::COMPLETED_BY`]
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletedBy::Predicate => "predicate",
            CompletedBy::Size => "size",
            CompletedBy::Timeout => "timeout",
            CompletedBy::Interval => "interval",
            CompletedBy::Force => "force",
            CompletedBy::Strategy => "strategy",
        }
    }
}

impl fmt::Display for CompletedBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure attached to an exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ExchangeFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&AggregatorError> for ExchangeFailure {
    fn from(err: &AggregatorError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl fmt::Display for ExchangeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Message payload with headers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub headers: HashMap<String, Value>,
    #[serde(default)]
    pub body: Value,
}

impl Message {
    pub fn new(body: impl Into<Value>) -> Self {
        Self {
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&Value> {
        self.headers.get(name)
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.headers.insert(name.into(), value.into());
    }

    pub fn remove_header(&mut self, name: &str) -> Option<Value> {
        self.headers.remove(name)
    }
}

/// Unit of work flowing through the aggregator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exchange {
    /// Unique exchange identifier
    pub id: Uuid,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Inbound message
    pub message: Message,
    /// Exchange-scoped properties
    #[serde(default)]
    pub properties: HashMap<String, Value>,
    /// Exchanges collected by grouping strategies
    #[serde(default)]
    pub grouped: Vec<Exchange>,
    /// Failure recorded while processing this exchange
    #[serde(default)]
    pub exception: Option<ExchangeFailure>,
    /// Marked for rollback
    #[serde(default)]
    pub rollback_only: bool,
    /// Marked for rollback of the last transaction only
    #[serde(default)]
    pub rollback_only_last: bool,
    /// Whether a recorded failure has been handled by an error handler
    #[serde(default)]
    pub error_handled: Option<bool>,
}

impl Exchange {
    /// Create an exchange carrying the given body
    pub fn new(body: impl Into<Value>) -> Self {
        Self::from_message(Message::new(body))
    }

    /// Create an exchange with an empty body
    pub fn empty() -> Self {
        Self::from_message(Message::default())
    }

    pub fn from_message(message: Message) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            message,
            properties: HashMap::new(),
            grouped: Vec::new(),
            exception: None,
            rollback_only: false,
            rollback_only_last: false,
            error_handled: None,
        }
    }

    /// Builder-style header setter
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.message.set_header(name, value);
        self
    }

    /// Builder-style property setter
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_property(name, value);
        self
    }

    /// Copy of this exchange under a fresh identifier
    pub fn copy(&self) -> Self {
        let mut copy = self.clone();
        copy.id = Uuid::new_v4();
        copy
    }

    pub fn body(&self) -> &Value {
        &self.message.body
    }

    pub fn set_body(&mut self, body: impl Into<Value>) {
        self.message.body = body.into();
    }

    pub fn header(&self, name: &str) -> Option<&Value> {
        self.message.header(name)
    }

    /// Header interpreted as a boolean; strings "true"/"false" are accepted
    pub fn header_bool(&self, name: &str) -> bool {
        self.header(name).map(value_as_bool).unwrap_or(false)
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    pub fn set_property(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.properties.insert(name.into(), value.into());
    }

    pub fn remove_property(&mut self, name: &str) -> Option<Value> {
        self.properties.remove(name)
    }

    /// Property interpreted as a boolean; strings "true"/"false" are accepted
    pub fn property_bool(&self, name: &str) -> bool {
        self.property(name).map(value_as_bool).unwrap_or(false)
    }

    pub fn property_u64(&self, name: &str) -> Option<u64> {
        self.property(name).and_then(Value::as_u64)
    }

    /// How this aggregate was completed, once completed
    pub fn completed_by(&self) -> Option<CompletedBy> {
        self.property(properties::COMPLETED_BY)
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
    }

    /// Number of exchanges merged into this aggregate
    pub fn aggregated_size(&self) -> Option<u64> {
        self.property_u64(properties::SIZE)
    }

    pub fn correlation_key(&self) -> Option<&str> {
        self.property(properties::CORRELATION_KEY)
            .and_then(Value::as_str)
    }

    pub fn is_failed(&self) -> bool {
        self.exception.is_some()
    }

    /// Record a failure on this exchange
    pub fn set_failure(&mut self, err: &AggregatorError) {
        self.exception = Some(ExchangeFailure::from(err));
    }
}

fn value_as_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_exchange_new() {
        let exchange = Exchange::new("hello").with_header("id", 1);
        assert_eq!(exchange.body(), &json!("hello"));
        assert_eq!(exchange.header("id"), Some(&json!(1)));
        assert!(!exchange.is_failed());
    }

    #[test]
    fn test_copy_has_fresh_id() {
        let exchange = Exchange::new(1).with_property("p", "v");
        let copy = exchange.copy();
        assert_ne!(exchange.id, copy.id);
        assert_eq!(exchange.message, copy.message);
        assert_eq!(copy.property("p"), Some(&json!("v")));
    }

    #[test]
    fn test_bool_accessors() {
        let exchange = Exchange::empty()
            .with_header("a", true)
            .with_header("b", "TRUE")
            .with_header("c", 1)
            .with_property("d", "false");
        assert!(exchange.header_bool("a"));
        assert!(exchange.header_bool("b"));
        assert!(!exchange.header_bool("c"));
        assert!(!exchange.header_bool("missing"));
        assert!(!exchange.property_bool("d"));
    }

    #[test]
    fn test_completed_by_property() {
        let mut exchange = Exchange::empty();
        assert_eq!(exchange.completed_by(), None);

        exchange.set_property(properties::COMPLETED_BY, CompletedBy::Timeout.as_str());
        assert_eq!(exchange.completed_by(), Some(CompletedBy::Timeout));
        assert_eq!(CompletedBy::Interval.to_string(), "interval");
    }

    #[test]
    fn test_set_failure() {
        let mut exchange = Exchange::empty();
        exchange.set_failure(&AggregatorError::RetriesExhausted { attempts: 2 });

        let failure = exchange.exception.as_ref().unwrap();
        assert_eq!(failure.kind, FailureKind::RetriesExhausted);
        assert!(failure.message.contains("2"));
    }

    #[test]
    fn test_serde_roundtrip_preserves_grouped() {
        let mut holder = Exchange::empty();
        holder.grouped.push(Exchange::new("a"));
        let json = serde_json::to_string(&holder).unwrap();
        let back: Exchange = serde_json::from_str(&json).unwrap();
        assert_eq!(back, holder);
    }
}
