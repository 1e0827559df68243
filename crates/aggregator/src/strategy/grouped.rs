//! Grouping strategies
//!
//! Each grouping strategy creates a fresh, empty holder exchange for the
//! first exchange of a group and appends a value extracted from every
//! incoming exchange to an ordered list on the holder. An input exchange is
//! never used as the holder, so the list never contains its own carrier.

use serde_json::{json, Value};

use super::AggregationStrategy;
use crate::error::StrategyResult;
use crate::exchange::{properties, Exchange};

/// Where the accumulated list lives on the holder exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListCarrier {
    /// The holder's message body is the list
    #[default]
    Body,
    /// The list is kept in the [`properties::GROUPED`] property
    Property {
        /// Move the list into the body when the group completes
        store_as_body_on_completion: bool,
    },
}

impl ListCarrier {
    fn append(&self, holder: &mut Exchange, value: Value) {
        let slot = match self {
            ListCarrier::Body => &mut holder.message.body,
            ListCarrier::Property { .. } => holder
                .properties
                .entry(properties::GROUPED.to_string())
                .or_insert(Value::Null),
        };

        match slot {
            Value::Array(items) => items.push(value),
            other => *other = Value::Array(vec![value]),
        }
    }

    fn complete(&self, exchange: &mut Exchange) {
        if let ListCarrier::Property {
            store_as_body_on_completion: true,
        } = self
        {
            if let Some(list) = exchange.remove_property(properties::GROUPED) {
                exchange.set_body(list);
            }
        }
    }
}

fn holder_for(old: Option<Exchange>) -> Exchange {
    old.unwrap_or_else(Exchange::empty)
}

/// Collects message bodies
#[derive(Debug, Clone, Copy, Default)]
pub struct GroupedBodyStrategy {
    carrier: ListCarrier,
}

impl GroupedBodyStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_carrier(carrier: ListCarrier) -> Self {
        Self { carrier }
    }
}

impl AggregationStrategy for GroupedBodyStrategy {
    fn aggregate(&self, old: Option<Exchange>, new: Exchange) -> StrategyResult<Exchange> {
        let mut holder = holder_for(old);
        self.carrier.append(&mut holder, new.message.body);
        Ok(holder)
    }

    fn on_completion(&self, exchange: &mut Exchange) {
        self.carrier.complete(exchange);
    }
}

/// Collects whole messages, headers included
#[derive(Debug, Clone, Copy, Default)]
pub struct GroupedMessageStrategy {
    carrier: ListCarrier,
}

impl GroupedMessageStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_carrier(carrier: ListCarrier) -> Self {
        Self { carrier }
    }
}

impl AggregationStrategy for GroupedMessageStrategy {
    fn aggregate(&self, old: Option<Exchange>, new: Exchange) -> StrategyResult<Exchange> {
        let mut holder = holder_for(old);
        let message = json!({
            "headers": new.message.headers,
            "body": new.message.body,
        });
        self.carrier.append(&mut holder, message);
        Ok(holder)
    }

    fn on_completion(&self, exchange: &mut Exchange) {
        self.carrier.complete(exchange);
    }
}

/// Collects whole exchanges into [`Exchange::grouped`]
#[derive(Debug, Clone, Copy, Default)]
pub struct GroupedExchangeStrategy;

impl GroupedExchangeStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl AggregationStrategy for GroupedExchangeStrategy {
    fn aggregate(&self, old: Option<Exchange>, new: Exchange) -> StrategyResult<Exchange> {
        let mut holder = holder_for(old);
        holder.grouped.push(new);
        Ok(holder)
    }
}
