//! Adapter exposing a registered bean method as an aggregation strategy
//!
//! A bean is a named set of methods registered up front. On
//! [`start`](AggregationStrategy::start) the adapter resolves exactly one
//! eligible method (public and returning a value, optionally matching an
//! explicit name). The method receives the old body, if any, and the new
//! body and returns the merged body.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

use super::AggregationStrategy;
use crate::error::{StrategyError, StrategyResult};
use crate::exchange::Exchange;

/// Callable bound to a bean method
pub type BeanMethodFn =
    Arc<dyn Fn(Option<&Value>, &Value) -> anyhow::Result<Value> + Send + Sync>;

/// One method registered on a bean
#[derive(Clone)]
pub struct BeanMethod {
    name: String,
    public: bool,
    returns_value: bool,
    invoke: BeanMethodFn,
}

impl BeanMethod {
    /// Public method returning the merged body
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Option<&Value>, &Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            public: true,
            returns_value: true,
            invoke: Arc::new(f),
        }
    }

    /// Public method without a result, never eligible
    pub fn void<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Option<&Value>, &Value) + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            public: true,
            returns_value: false,
            invoke: Arc::new(move |old, new| {
                f(old, new);
                Ok(Value::Null)
            }),
        }
    }

    /// Mark the method as not publicly visible, never eligible
    pub fn private(mut self) -> Self {
        self.public = false;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn is_eligible(&self, wanted: Option<&str>) -> bool {
        self.public && self.returns_value && wanted.map_or(true, |name| name == self.name)
    }
}

impl fmt::Debug for BeanMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BeanMethod")
            .field("name", &self.name)
            .field("public", &self.public)
            .field("returns_value", &self.returns_value)
            .finish()
    }
}

/// Aggregation strategy delegating the merge to one bean method
pub struct BeanAdapterStrategy {
    bean: String,
    methods: Vec<BeanMethod>,
    method_name: Option<String>,
    allow_null_old_exchange: bool,
    resolved: RwLock<Option<BeanMethod>>,
}

impl BeanAdapterStrategy {
    pub fn new(bean: impl Into<String>) -> Self {
        Self {
            bean: bean.into(),
            methods: Vec::new(),
            method_name: None,
            allow_null_old_exchange: false,
            resolved: RwLock::new(None),
        }
    }

    /// Register a method on the bean
    pub fn with_method(mut self, method: BeanMethod) -> Self {
        self.methods.push(method);
        self
    }

    /// Only consider methods with this name
    pub fn with_method_name(mut self, name: impl Into<String>) -> Self {
        self.method_name = Some(name.into());
        self
    }

    /// Invoke the method for the first exchange of a group as well
    ///
    /// Without this, the first exchange passes through unchanged.
    pub fn allow_null_old_exchange(mut self, allow: bool) -> Self {
        self.allow_null_old_exchange = allow;
        self
    }

    /// Name of the resolved method, once started
    pub fn resolved_method(&self) -> Option<String> {
        self.resolved.read().as_ref().map(|m| m.name.clone())
    }

    fn resolve(&self) -> StrategyResult<BeanMethod> {
        let wanted = self.method_name.as_deref();
        let mut candidates: Vec<&BeanMethod> = self
            .methods
            .iter()
            .filter(|method| method.is_eligible(wanted))
            .collect();

        match candidates.len() {
            0 => Err(StrategyError::NoEligibleMethod {
                bean: self.bean.clone(),
                method: wanted.unwrap_or("*").to_string(),
            }),
            1 => Ok(candidates.remove(0).clone()),
            _ => Err(StrategyError::AmbiguousMethod {
                bean: self.bean.clone(),
                candidates: candidates.iter().map(|m| m.name.clone()).collect(),
            }),
        }
    }
}

impl fmt::Debug for BeanAdapterStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BeanAdapterStrategy")
            .field("bean", &self.bean)
            .field("methods", &self.methods)
            .field("method_name", &self.method_name)
            .field("allow_null_old_exchange", &self.allow_null_old_exchange)
            .finish()
    }
}

impl AggregationStrategy for BeanAdapterStrategy {
    fn start(&self) -> StrategyResult<()> {
        let method = self.resolve()?;
        debug!(bean = %self.bean, method = %method.name, "Resolved aggregation bean method");
        *self.resolved.write() = Some(method);
        Ok(())
    }

    fn aggregate(&self, old: Option<Exchange>, mut new: Exchange) -> StrategyResult<Exchange> {
        if old.is_none() && !self.allow_null_old_exchange {
            return Ok(new);
        }

        let invoke = self
            .resolved
            .read()
            .as_ref()
            .map(|method| Arc::clone(&method.invoke))
            .ok_or_else(|| StrategyError::NotStarted {
                bean: self.bean.clone(),
            })?;

        let merged = invoke(old.as_ref().map(Exchange::body), new.body())
            .map_err(StrategyError::merge_failed)?;

        match old {
            Some(mut old) => {
                old.set_body(merged);
                Ok(old)
            }
            None => {
                new.set_body(merged);
                Ok(new)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn concat(old: Option<&Value>, new: &Value) -> anyhow::Result<Value> {
        let old = old.and_then(Value::as_str).unwrap_or("");
        let new = new.as_str().ok_or_else(|| anyhow::anyhow!("body is not a string"))?;
        Ok(json!(format!("{old}{new}")))
    }

    #[test]
    fn test_single_eligible_method_resolves() {
        let strategy = BeanAdapterStrategy::new("text")
            .with_method(BeanMethod::new("append", concat))
            .with_method(BeanMethod::void("log", |_, _| {}))
            .with_method(BeanMethod::new("hidden", concat).private());

        strategy.start().unwrap();
        assert_eq!(strategy.resolved_method().as_deref(), Some("append"));
    }

    #[test]
    fn test_two_eligible_methods_are_ambiguous() {
        let strategy = BeanAdapterStrategy::new("text")
            .with_method(BeanMethod::new("append", concat))
            .with_method(BeanMethod::new("prepend", |old: Option<&Value>, new: &Value| {
                let old = old.and_then(Value::as_str).unwrap_or("");
                Ok(json!(format!("{}{}", new.as_str().unwrap_or(""), old)))
            }));

        let err = strategy.start().unwrap_err();
        assert!(matches!(err, StrategyError::AmbiguousMethod { ref candidates, .. } if candidates.len() == 2));
    }

    #[test]
    fn test_explicit_method_name_disambiguates() {
        let strategy = BeanAdapterStrategy::new("text")
            .with_method(BeanMethod::new("append", concat))
            .with_method(BeanMethod::new("prepend", concat))
            .with_method_name("prepend");
        strategy.start().unwrap();
        assert_eq!(strategy.resolved_method().as_deref(), Some("prepend"));
    }

    #[test]
    fn test_no_eligible_method() {
        let strategy = BeanAdapterStrategy::new("text").with_method(BeanMethod::void("log", |_, _| {}));
        assert!(matches!(
            strategy.start().unwrap_err(),
            StrategyError::NoEligibleMethod { .. }
        ));

        let strategy = BeanAdapterStrategy::new("text")
            .with_method(BeanMethod::new("append", concat))
            .with_method_name("missing");
        assert!(strategy.start().is_err());
    }

    #[test]
    fn test_aggregate_before_start_fails() {
        let strategy = BeanAdapterStrategy::new("text").with_method(BeanMethod::new("append", concat));
        let err = strategy
            .aggregate(Some(Exchange::new("a")), Exchange::new("b"))
            .unwrap_err();
        assert!(matches!(err, StrategyError::NotStarted { .. }));
    }

    #[test]
    fn test_first_exchange_passes_through_by_default() {
        let strategy = BeanAdapterStrategy::new("text").with_method(BeanMethod::new("append", concat));
        strategy.start().unwrap();

        let first = Exchange::new("a");
        let result = strategy.aggregate(None, first.clone()).unwrap();
        assert_eq!(result, first);

        let merged = strategy.aggregate(Some(result), Exchange::new("b")).unwrap();
        assert_eq!(merged.body(), "ab");
        assert_eq!(merged.id, first.id);
    }

    #[test]
    fn test_allow_null_old_invokes_method() {
        let strategy = BeanAdapterStrategy::new("text")
            .with_method(BeanMethod::new("wrap", |old, new| {
                Ok(json!({ "had_old": old.is_some(), "new": new }))
            }))
            .allow_null_old_exchange(true);
        strategy.start().unwrap();

        let result = strategy.aggregate(None, Exchange::new("a")).unwrap();
        assert_eq!(result.body(), &json!({ "had_old": false, "new": "a" }));
    }

    #[test]
    fn test_method_error_is_merge_failure() {
        let strategy = BeanAdapterStrategy::new("text").with_method(BeanMethod::new("append", concat));
        strategy.start().unwrap();
        let err = strategy
            .aggregate(Some(Exchange::new("a")), Exchange::new(1))
            .unwrap_err();
        assert!(matches!(err, StrategyError::MergeFailed { .. }));
    }
}
