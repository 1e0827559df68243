//! Aggregator statistics

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::exchange::CompletedBy;

/// Point-in-time copy of [`AggregateStatistics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    /// Exchanges received by `process()`
    pub total_in: u64,
    /// Aggregates submitted for delivery
    pub total_completed: u64,
    pub completed_by_size: u64,
    pub completed_by_predicate: u64,
    pub completed_by_strategy: u64,
    pub completed_by_interval: u64,
    pub completed_by_timeout: u64,
    pub completed_by_force: u64,
    /// Aggregates discarded instead of delivered
    pub discarded: u64,
    /// Deliveries whose downstream failed
    pub delivery_failures: u64,
    /// Optimistic locking conflicts observed while aggregating
    pub optimistic_conflicts: u64,
    /// When the counters were last reset
    pub reset_at: Option<DateTime<Utc>>,
}

/// Runtime counters of an aggregate processor
#[derive(Debug)]
pub struct AggregateStatistics {
    enabled: AtomicBool,
    total_in: AtomicU64,
    total_completed: AtomicU64,
    completed_by_size: AtomicU64,
    completed_by_predicate: AtomicU64,
    completed_by_strategy: AtomicU64,
    completed_by_interval: AtomicU64,
    completed_by_timeout: AtomicU64,
    completed_by_force: AtomicU64,
    discarded: AtomicU64,
    delivery_failures: AtomicU64,
    optimistic_conflicts: AtomicU64,
    reset_at: Mutex<Option<DateTime<Utc>>>,
}

impl AggregateStatistics {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            total_in: AtomicU64::new(0),
            total_completed: AtomicU64::new(0),
            completed_by_size: AtomicU64::new(0),
            completed_by_predicate: AtomicU64::new(0),
            completed_by_strategy: AtomicU64::new(0),
            completed_by_interval: AtomicU64::new(0),
            completed_by_timeout: AtomicU64::new(0),
            completed_by_force: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            delivery_failures: AtomicU64::new(0),
            optimistic_conflicts: AtomicU64::new(0),
            reset_at: Mutex::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    fn bump(&self, counter: &AtomicU64) {
        if self.is_enabled() {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_in(&self) {
        self.bump(&self.total_in);
    }

    pub fn record_completed(&self, completed_by: CompletedBy) {
        self.bump(&self.total_completed);
        let counter = match completed_by {
            CompletedBy::Size => &self.completed_by_size,
            CompletedBy::Predicate => &self.completed_by_predicate,
            CompletedBy::Strategy => &self.completed_by_strategy,
            CompletedBy::Interval => &self.completed_by_interval,
            CompletedBy::Timeout => &self.completed_by_timeout,
            CompletedBy::Force => &self.completed_by_force,
        };
        self.bump(counter);
    }

    pub fn record_discarded(&self) {
        self.bump(&self.discarded);
    }

    pub fn record_delivery_failure(&self) {
        self.bump(&self.delivery_failures);
    }

    pub fn record_optimistic_conflict(&self) {
        self.bump(&self.optimistic_conflicts);
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            total_in: self.total_in.load(Ordering::Relaxed),
            total_completed: self.total_completed.load(Ordering::Relaxed),
            completed_by_size: self.completed_by_size.load(Ordering::Relaxed),
            completed_by_predicate: self.completed_by_predicate.load(Ordering::Relaxed),
            completed_by_strategy: self.completed_by_strategy.load(Ordering::Relaxed),
            completed_by_interval: self.completed_by_interval.load(Ordering::Relaxed),
            completed_by_timeout: self.completed_by_timeout.load(Ordering::Relaxed),
            completed_by_force: self.completed_by_force.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            optimistic_conflicts: self.optimistic_conflicts.load(Ordering::Relaxed),
            reset_at: *self.reset_at.lock(),
        }
    }

    /// Zero every counter
    pub fn reset(&self) {
        for counter in [
            &self.total_in,
            &self.total_completed,
            &self.completed_by_size,
            &self.completed_by_predicate,
            &self.completed_by_strategy,
            &self.completed_by_interval,
            &self.completed_by_timeout,
            &self.completed_by_force,
            &self.discarded,
            &self.delivery_failures,
            &self.optimistic_conflicts,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        *self.reset_at.lock() = Some(Utc::now());
    }
}

impl Default for AggregateStatistics {
    fn default() -> Self {
        Self::new(true)
    }
}
