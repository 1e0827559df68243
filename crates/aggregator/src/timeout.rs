//! Completion timeout tracking
//!
//! [`TimeoutTracker`] keeps one deadline per correlation key in a min-heap.
//! Re-arming a key pushes a fresh heap entry and bumps the key's generation,
//! so stale heap entries are skipped lazily when they surface.
//!
//! [`BackgroundTask`] runs a callback at a fixed period on a spawned tokio
//! task and stops on a oneshot signal. The processor uses it for the timeout
//! reaper and the completion interval.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace};

/// Heap compaction kicks in once stale entries outnumber live ones by this factor
const COMPACTION_FACTOR: usize = 4;

/// Deadline used when `now + timeout` does not fit in an [`Instant`]
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `now + timeout`, saturating to roughly thirty years out
pub(crate) fn deadline_after(now: Instant, timeout: Duration) -> Instant {
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

/// Whole milliseconds of `duration`, saturating at `u64::MAX`
pub(crate) fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug, Clone, Copy)]
struct TimeoutEntry {
    deadline: Instant,
    timeout: Duration,
    generation: u64,
}

#[derive(Debug, Default)]
struct TrackerState {
    heap: BinaryHeap<Reverse<(Instant, u64, String)>>,
    entries: HashMap<String, TimeoutEntry>,
    next_generation: u64,
}

impl TrackerState {
    fn compact(&mut self) {
        let entries = &self.entries;
        self.heap.retain(|Reverse((_, generation, key))| {
            entries
                .get(key)
                .map_or(false, |entry| entry.generation == *generation)
        });
    }
}

/// Deadlines of groups with an active completion timeout
#[derive(Debug, Default)]
pub struct TimeoutTracker {
    state: Mutex<TrackerState>,
}

impl TimeoutTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm or re-arm the timeout of `key`, measured from now
    pub fn arm(&self, key: &str, timeout: Duration) {
        self.arm_at(key, timeout, deadline_after(Instant::now(), timeout));
    }

    fn arm_at(&self, key: &str, timeout: Duration, deadline: Instant) {
        let mut state = self.state.lock();
        state.next_generation += 1;
        let generation = state.next_generation;

        state.entries.insert(
            key.to_string(),
            TimeoutEntry {
                deadline,
                timeout,
                generation,
            },
        );
        state
            .heap
            .push(Reverse((deadline, generation, key.to_string())));

        if state.heap.len() > COMPACTION_FACTOR * state.entries.len().max(16) {
            state.compact();
        }
        trace!(key = %key, timeout_ms = saturating_millis(timeout), "Armed completion timeout");
    }

    /// Stop tracking `key`, returning whether it was tracked
    pub fn remove(&self, key: &str) -> bool {
        self.state.lock().entries.remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    /// Deadline currently armed for `key`
    pub fn deadline(&self, key: &str) -> Option<Instant> {
        self.state.lock().entries.get(key).map(|entry| entry.deadline)
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.heap.clear();
    }

    /// Remove and return every key whose deadline is at or before `now`,
    /// in deadline order, together with its armed timeout
    pub fn take_expired(&self, now: Instant) -> Vec<(String, Duration)> {
        let mut state = self.state.lock();
        let mut expired = Vec::new();

        while let Some(Reverse((deadline, _, _))) = state.heap.peek() {
            if *deadline > now {
                break;
            }
            let Some(Reverse((_, generation, key))) = state.heap.pop() else {
                break;
            };

            let current = state
                .entries
                .get(&key)
                .map_or(false, |entry| entry.generation == generation);
            if current {
                if let Some(entry) = state.entries.remove(&key) {
                    expired.push((key, entry.timeout));
                }
            }
        }

        expired
    }
}

/// Periodic background task with oneshot shutdown
pub struct BackgroundTask {
    name: &'static str,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    task_handle: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundTask {
    /// Spawn a task invoking `tick` every `period`, first after one period
    ///
    /// The task ends when `tick` returns `false` or on [`shutdown`](Self::shutdown).
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        info!(task = name, period_ms = saturating_millis(period), "Starting background task");

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval_at(deadline_after(Instant::now(), period), period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        if !tick().await {
                            debug!(task = name, "Background task owner dropped");
                            break;
                        }
                    }
                    _ = &mut shutdown_rx => {
                        debug!(task = name, "Background task shutting down");
                        break;
                    }
                }
            }
        });

        Self {
            name,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            task_handle: Mutex::new(Some(handle)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Signal the task to stop and wait for it
    pub async fn shutdown(&self) {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }

        let handle = self.task_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(task = self.name, "Background task panicked: {}", e);
            }
        }
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        if let Some(handle) = self.task_handle.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_arm_and_remove() {
        let tracker = TimeoutTracker::new();
        tracker.arm("a", Duration::from_secs(1));
        assert!(tracker.contains("a"));
        assert_eq!(tracker.len(), 1);

        assert!(tracker.remove("a"));
        assert!(!tracker.remove("a"));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_take_expired_in_deadline_order() {
        let tracker = TimeoutTracker::new();
        let now = Instant::now();
        tracker.arm_at("late", Duration::from_millis(30), now + Duration::from_millis(30));
        tracker.arm_at("early", Duration::from_millis(10), now + Duration::from_millis(10));
        tracker.arm_at("never", Duration::from_secs(60), now + Duration::from_secs(60));

        let expired = tracker.take_expired(now + Duration::from_millis(50));
        let keys: Vec<_> = expired.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["early", "late"]);
        assert_eq!(expired[0].1, Duration::from_millis(10));
        assert!(tracker.contains("never"));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_rearm_extends_deadline() {
        let tracker = TimeoutTracker::new();
        let now = Instant::now();
        tracker.arm_at("k", Duration::from_millis(10), now + Duration::from_millis(10));
        tracker.arm_at("k", Duration::from_millis(10), now + Duration::from_millis(100));

        assert!(tracker.take_expired(now + Duration::from_millis(50)).is_empty());
        assert_eq!(tracker.take_expired(now + Duration::from_millis(100)).len(), 1);
    }

    #[test]
    fn test_arm_with_huge_timeout_saturates() {
        let tracker = TimeoutTracker::new();
        let now = Instant::now();
        tracker.arm("k", Duration::from_secs(u64::MAX));

        assert!(tracker.contains("k"));
        assert!(tracker.deadline("k").unwrap() > now + Duration::from_secs(86400 * 365));
        assert!(tracker.take_expired(now + Duration::from_secs(86400)).is_empty());
    }

    #[test]
    fn test_saturating_millis() {
        assert_eq!(saturating_millis(Duration::from_millis(1500)), 1500);
        assert_eq!(saturating_millis(Duration::MAX), u64::MAX);
    }

    #[test]
    fn test_removed_key_does_not_expire() {
        let tracker = TimeoutTracker::new();
        let now = Instant::now();
        tracker.arm_at("k", Duration::from_millis(10), now + Duration::from_millis(10));
        tracker.remove("k");
        assert!(tracker.take_expired(now + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn test_heap_compaction_keeps_live_entries() {
        let tracker = TimeoutTracker::new();
        for _ in 0..200 {
            tracker.arm("k", Duration::from_secs(10));
        }
        assert_eq!(tracker.len(), 1);
        assert!(tracker.state.lock().heap.len() <= COMPACTION_FACTOR * 16 + 1);
        assert!(tracker.deadline("k").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_task_ticks_until_shutdown() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let task = BackgroundTask::spawn("test", Duration::from_millis(100), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            }
        });

        tokio::time::sleep(Duration::from_millis(350)).await;
        task.shutdown().await;
        let seen = ticks.load(Ordering::SeqCst);
        assert_eq!(seen, 3);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_task_stops_when_tick_returns_false() {
        let task = BackgroundTask::spawn("once", Duration::from_millis(10), || async { false });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(task.task_handle.lock().as_ref().unwrap().is_finished());
        task.shutdown().await;
    }
}
