//! Keep only the newest exchange

use super::AggregationStrategy;
use crate::error::StrategyResult;
use crate::exchange::Exchange;

/// Returns the incoming exchange and drops the previous aggregate
///
/// Suited to status or ticker feeds where only the newest value matters.
#[derive(Debug, Clone, Copy, Default)]
pub struct UseLatestStrategy;

impl UseLatestStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl AggregationStrategy for UseLatestStrategy {
    fn aggregate(&self, _old: Option<Exchange>, new: Exchange) -> StrategyResult<Exchange> {
        Ok(new)
    }
}
