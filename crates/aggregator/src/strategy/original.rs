//! Keep the first exchange of a group

use parking_lot::Mutex;

use super::AggregationStrategy;
use crate::error::StrategyResult;
use crate::exchange::{Exchange, ExchangeFailure};

/// Returns the first exchange seen for a group
///
/// When constructed with an explicit original exchange, that exchange is
/// returned instead. With `propagate_exception`, a failure recorded on a
/// later exchange is copied onto the retained one.
#[derive(Debug, Default)]
pub struct UseOriginalStrategy {
    original: Option<Mutex<Exchange>>,
    propagate_exception: bool,
}

impl UseOriginalStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always answer `original`, e.g. the exchange that was split
    pub fn with_original(original: Exchange) -> Self {
        Self {
            original: Some(Mutex::new(original)),
            propagate_exception: false,
        }
    }

    pub fn propagate_exception(mut self, enabled: bool) -> Self {
        self.propagate_exception = enabled;
        self
    }

    /// Snapshot of the explicit original, failures included
    pub fn original(&self) -> Option<Exchange> {
        self.original.as_ref().map(|original| original.lock().clone())
    }

    fn failure_of(old: Option<&Exchange>, new: &Exchange) -> Option<ExchangeFailure> {
        new.exception
            .clone()
            .or_else(|| old.and_then(|old| old.exception.clone()))
    }
}

impl AggregationStrategy for UseOriginalStrategy {
    fn aggregate(&self, old: Option<Exchange>, new: Exchange) -> StrategyResult<Exchange> {
        let failure = if self.propagate_exception {
            Self::failure_of(old.as_ref(), &new)
        } else {
            None
        };

        if let Some(original) = &self.original {
            let mut original = original.lock();
            if failure.is_some() {
                original.exception = failure;
            }
            return Ok(original.clone());
        }

        let mut answer = old.unwrap_or(new);
        if failure.is_some() {
            answer.exception = failure;
        }
        Ok(answer)
    }
}
