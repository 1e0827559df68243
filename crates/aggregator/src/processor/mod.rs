//! The aggregate processor
//!
//! [`AggregateProcessor`] correlates incoming exchanges by key, merges them
//! with an [`AggregationStrategy`] into a per-key group held in an
//! [`AggregationRepository`], and hands each completed group to a
//! [`Downstream`] on the delivery executor.
//!
//! Completion is decided on the caller's task (predicate, size, strategy),
//! by the timeout reaper, by the interval task or by an administrative force
//! operation. Whichever path wins removes the group from the repository; a
//! group is therefore completed exactly once.
//!
//! In optimistic mode concurrent `process()` calls on the same key race on
//! conditional repository writes and the loser retries according to the
//! configured [`OptimisticLockRetryPolicy`](crate::retry::OptimisticLockRetryPolicy).
//! In plain mode callers must serialize per key, or enable
//! `exclusive_aggregation` to run every merge, eviction and forced
//! completion under one lock.

mod builder;

pub use builder::AggregateProcessorBuilder;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashSet;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::closed_keys::ClosedCorrelationKeys;
use crate::completion::CompletionEvaluator;
use crate::config::AggregatorConfig;
use crate::correlation::CorrelationExpression;
use crate::delivery::{DeliveryExecutor, Downstream};
use crate::error::{AggregatorError, CorrelationError, RepositoryError, Result};
use crate::exchange::{properties, CompletedBy, Exchange};
use crate::repository::{AggregateGroup, AggregationRepository};
use crate::stats::{AggregateStatistics, StatisticsSnapshot};
use crate::strategy::AggregationStrategy;
use crate::timeout::{saturating_millis, BackgroundTask, TimeoutTracker};

/// Callback receiving aggregates whose delivery failed
pub type DeliveryFailureHandler = Arc<dyn Fn(&Exchange) + Send + Sync>;

/// Lifecycle state of an aggregate processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Created,
    Started,
    Stopping,
    Stopped,
}

/// How a group leaves the repository
#[derive(Debug, Clone, Copy)]
enum Finish {
    Normal,
    Timeout(Duration),
    AggregationFailed,
    ForceDiscard,
}

/// Correlates, merges and completes exchanges
///
/// Cloning is cheap and every clone drives the same processor.
#[derive(Clone)]
pub struct AggregateProcessor {
    inner: Arc<ProcessorInner>,
}

struct ProcessorInner {
    id: String,
    correlation: Arc<dyn CorrelationExpression>,
    strategy: Arc<dyn AggregationStrategy>,
    downstream: Arc<dyn Downstream>,
    repository: Arc<dyn AggregationRepository>,
    completion: CompletionEvaluator,
    config: AggregatorConfig,
    delivery: DeliveryExecutor,
    timeouts: TimeoutTracker,
    closed_keys: Option<ClosedCorrelationKeys>,
    in_progress: DashSet<Uuid>,
    stats: AggregateStatistics,
    exclusive: AsyncMutex<()>,
    state: Mutex<LifecycleState>,
    pre_completion: AtomicBool,
    tasks: Mutex<Vec<BackgroundTask>>,
    failure_handler: Option<DeliveryFailureHandler>,
}

impl fmt::Debug for AggregateProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateProcessor")
            .field("id", &self.inner.id)
            .field("repository", &self.inner.repository.name())
            .field("completion", &self.inner.completion)
            .field("state", &*self.inner.state.lock())
            .finish()
    }
}

impl AggregateProcessor {
    pub fn builder() -> AggregateProcessorBuilder {
        AggregateProcessorBuilder::new()
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn assemble(
        id: String,
        correlation: Arc<dyn CorrelationExpression>,
        strategy: Arc<dyn AggregationStrategy>,
        downstream: Arc<dyn Downstream>,
        repository: Arc<dyn AggregationRepository>,
        completion: CompletionEvaluator,
        config: AggregatorConfig,
        failure_handler: Option<DeliveryFailureHandler>,
    ) -> Self {
        let closed_keys = config
            .close_correlation_key_on_completion
            .map(ClosedCorrelationKeys::new);

        Self {
            inner: Arc::new(ProcessorInner {
                id,
                correlation,
                strategy,
                downstream,
                repository,
                completion,
                delivery: DeliveryExecutor::new(config.delivery_pool_size),
                stats: AggregateStatistics::new(config.statistics_enabled),
                config,
                timeouts: TimeoutTracker::new(),
                closed_keys,
                in_progress: DashSet::new(),
                exclusive: AsyncMutex::new(()),
                state: Mutex::new(LifecycleState::Created),
                pre_completion: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
                failure_handler,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn state(&self) -> LifecycleState {
        *self.inner.state.lock()
    }

    pub fn is_started(&self) -> bool {
        self.state() == LifecycleState::Started
    }

    /// Whether the strategy decides completion before each merge
    pub fn is_pre_completion(&self) -> bool {
        self.inner.pre_completion.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.inner.config
    }

    pub fn repository(&self) -> &Arc<dyn AggregationRepository> {
        &self.inner.repository
    }

    /// Start the processor
    ///
    /// Resolves the strategy, validates the completion conditions, restores
    /// timeouts of groups already stored and starts the background tasks.
    #[instrument(skip(self), fields(id = %self.inner.id))]
    pub async fn start(&self) -> Result<()> {
        match self.state() {
            LifecycleState::Created => {}
            LifecycleState::Started => {
                warn!("Aggregate processor already started");
                return Ok(());
            }
            state => {
                return Err(AggregatorError::Lifecycle(format!(
                    "cannot start aggregate processor in state {state:?}"
                )))
            }
        }

        let inner = &self.inner;
        inner.strategy.start()?;

        let pre_completion = inner.strategy.can_pre_complete();
        inner.pre_completion.store(pre_completion, Ordering::SeqCst);

        inner.completion.validate(pre_completion)?;
        inner.config.validate()?;

        if inner.config.optimistic_locking && !inner.repository.is_optimistic() {
            return Err(AggregatorError::configuration(format!(
                "optimistic locking requires an optimistic repository, '{}' is plain",
                inner.repository.name()
            )));
        }

        inner.repository.start().await?;

        if inner.completion.uses_timeout() {
            inner.restore_timeouts().await?;
        }

        let mut tasks = Vec::new();
        if inner.completion.uses_timeout() {
            let weak = Arc::downgrade(inner);
            tasks.push(BackgroundTask::spawn(
                "aggregate-timeout-checker",
                inner.config.timeout_checker_interval(),
                move || tick(weak.clone(), |inner| async move { inner.on_timeout_tick().await }),
            ));
        }
        if let Some(interval) = inner.completion.interval() {
            let weak = Arc::downgrade(inner);
            tasks.push(BackgroundTask::spawn(
                "aggregate-interval-completer",
                interval,
                move || tick(weak.clone(), |inner| async move { inner.on_interval_tick().await }),
            ));
        }
        *inner.tasks.lock() = tasks;
        *inner.state.lock() = LifecycleState::Started;

        info!(
            repository = inner.repository.name(),
            optimistic = inner.repository.is_optimistic(),
            pre_completion,
            completion = ?inner.completion,
            "Aggregate processor started"
        );
        Ok(())
    }

    /// Stop the processor
    ///
    /// With `force_completion_on_stop` every pending group is completed and
    /// this waits until all deliveries have finished.
    #[instrument(skip(self), fields(id = %self.inner.id))]
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                LifecycleState::Started => *state = LifecycleState::Stopping,
                LifecycleState::Created => {
                    *state = LifecycleState::Stopped;
                    return Ok(());
                }
                LifecycleState::Stopping | LifecycleState::Stopped => return Ok(()),
            }
        }

        let inner = &self.inner;
        let tasks = std::mem::take(&mut *inner.tasks.lock());
        for task in &tasks {
            task.shutdown().await;
        }

        if inner.config.force_completion_on_stop {
            let completed = self.force_completion_of_all_groups().await;
            info!(completed, "Forced completion of all groups on stop");
            inner.delivery.wait_idle(None).await;
        }

        inner.timeouts.clear();
        inner.delivery.shutdown();
        let stopped = inner.repository.stop().await;
        if let Some(closed) = &inner.closed_keys {
            closed.clear().await;
        }

        *inner.state.lock() = LifecycleState::Stopped;
        info!(stats = ?inner.stats.snapshot(), "Aggregate processor stopped");
        stopped.map_err(AggregatorError::from)
    }

    /// Aggregate one exchange
    ///
    /// Any failure is attached to `exchange` and returned. Completed groups
    /// are delivered asynchronously; delivery failures never surface here.
    pub async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        let result = self.inner.process(exchange).await;
        if let Err(err) = &result {
            debug!(id = %self.inner.id, exchange_id = %exchange.id, error = %err, "Aggregation failed");
            exchange.set_failure(err);
        }
        result
    }

    /// Complete the group of `key`, returning how many groups completed
    pub async fn force_completion_of_group(&self, key: &str) -> usize {
        let inner = &self.inner;
        if !inner.accepts_force("force completion of group") {
            return 0;
        }

        let completion = {
            let _guard = inner.exclusive_guard().await;
            inner.complete_group(key, CompletedBy::Force).await
        };

        match completion {
            Ok(Some(exchange)) => {
                inner.submit_completion(exchange);
                1
            }
            Ok(None) => 0,
            Err(err) => {
                warn!(key, error = %err, "Forced completion of group failed");
                0
            }
        }
    }

    /// Complete every pending group, returning how many completed
    pub async fn force_completion_of_all_groups(&self) -> usize {
        self.inner.force_completion_of_all_groups().await
    }

    /// Drop the group of `key` without delivering it
    pub async fn force_discarding_of_group(&self, key: &str) -> usize {
        let inner = &self.inner;
        if !inner.accepts_force("force discarding of group") {
            return 0;
        }

        let _guard = inner.exclusive_guard().await;
        match inner.discard_group(key).await {
            Ok(discarded) => usize::from(discarded),
            Err(err) => {
                warn!(key, error = %err, "Forced discarding of group failed");
                0
            }
        }
    }

    /// Drop every pending group without delivering, returning how many
    pub async fn force_discarding_of_all_groups(&self) -> usize {
        let inner = &self.inner;
        if !inner.accepts_force("force discarding of all groups") {
            return 0;
        }

        let _guard = inner.exclusive_guard().await;
        let keys = match inner.repository.keys().await {
            Ok(keys) => keys,
            Err(err) => {
                warn!(error = %err, "Failed to list groups for discarding");
                return 0;
            }
        };

        let mut discarded = 0;
        for key in keys {
            match inner.discard_group(&key).await {
                Ok(true) => discarded += 1,
                Ok(false) => {}
                Err(err) => warn!(key = %key, error = %err, "Forced discarding of group failed"),
            }
        }
        info!(discarded, "Forced discarding of all groups");
        discarded
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn reset_statistics(&self) {
        self.inner.stats.reset();
    }

    pub fn set_statistics_enabled(&self, enabled: bool) {
        self.inner.stats.set_enabled(enabled);
    }

    /// Completed aggregates currently being delivered
    pub fn in_progress_completions(&self) -> usize {
        self.inner.in_progress.len()
    }

    /// Number of groups pending in the repository
    pub async fn pending_groups(&self) -> Result<usize> {
        Ok(self.inner.repository.count().await?)
    }

    pub async fn closed_correlation_keys_size(&self) -> usize {
        match &self.inner.closed_keys {
            Some(closed) => closed.len().await,
            None => 0,
        }
    }

    pub async fn clear_closed_correlation_keys(&self) {
        if let Some(closed) = &self.inner.closed_keys {
            closed.clear().await;
        }
    }

    /// Whether a completion timeout is armed for `key`
    pub fn is_timeout_tracked(&self, key: &str) -> bool {
        self.inner.timeouts.contains(key)
    }

    /// Number of armed completion timeouts
    pub fn timeout_entries(&self) -> usize {
        self.inner.timeouts.len()
    }
}

/// Run one background tick against the processor if it is still alive
async fn tick<F, Fut>(weak: Weak<ProcessorInner>, f: F) -> bool
where
    F: FnOnce(Arc<ProcessorInner>) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    match weak.upgrade() {
        Some(inner) => {
            f(inner).await;
            true
        }
        None => false,
    }
}

impl ProcessorInner {
    fn ensure_started(&self) -> Result<()> {
        match *self.state.lock() {
            LifecycleState::Started => Ok(()),
            state => Err(AggregatorError::Lifecycle(format!(
                "aggregate processor {} is not started (state {state:?})",
                self.id
            ))),
        }
    }

    fn accepts_force(&self, operation: &str) -> bool {
        match *self.state.lock() {
            LifecycleState::Started | LifecycleState::Stopping => true,
            state => {
                warn!(operation, ?state, "Aggregate processor not running, ignoring");
                false
            }
        }
    }

    async fn exclusive_guard(&self) -> Option<MutexGuard<'_, ()>> {
        if self.config.exclusive_aggregation {
            Some(self.exclusive.lock().await)
        } else {
            None
        }
    }

    async fn process(self: &Arc<Self>, exchange: &mut Exchange) -> Result<()> {
        self.ensure_started()?;
        self.stats.record_in();

        if exchange.header_bool(properties::COMPLETE_ALL_GROUPS)
            || exchange.property_bool(properties::COMPLETE_ALL_GROUPS)
        {
            exchange.message.remove_header(properties::COMPLETE_ALL_GROUPS);
            exchange.remove_property(properties::COMPLETE_ALL_GROUPS);
            debug!(exchange_id = %exchange.id, "Completing all groups on request");
            self.force_completion_of_all_groups().await;
            return Ok(());
        }

        let key = match self
            .correlation
            .evaluate(exchange)
            .filter(|key| !key.is_empty())
        {
            Some(key) => key,
            None if self.config.ignore_invalid_correlation_keys => {
                debug!(exchange_id = %exchange.id, "Ignoring exchange with invalid correlation key");
                return Ok(());
            }
            None => {
                return Err(CorrelationError::InvalidKey {
                    exchange_id: exchange.id.to_string(),
                }
                .into())
            }
        };

        if let Some(closed) = &self.closed_keys {
            if closed.contains(&key) {
                return Err(CorrelationError::ClosedKey { key }.into());
            }
        }

        let inclusive = exchange.header_bool(properties::COMPLETE_ALL_GROUPS_INCLUSIVE);

        if self.repository.is_optimistic() {
            let policy = &self.config.optimistic_lock_retry;
            let mut attempt: u32 = 0;
            loop {
                attempt += 1;
                match self.process_once(&key, exchange).await {
                    Ok(()) => break,
                    Err(err) if err.is_optimistic_locking() => {
                        self.stats.record_optimistic_conflict();
                        if !policy.should_retry(attempt) {
                            warn!(key = %key, attempts = attempt, "Optimistic locking retries exhausted");
                            return Err(AggregatorError::RetriesExhausted { attempts: attempt });
                        }
                        debug!(key = %key, attempt, "Optimistic locking conflict, retrying");
                        policy.do_delay(attempt).await;
                    }
                    Err(err) => return Err(err),
                }
            }
        } else {
            self.process_once(&key, exchange).await?;
        }

        if inclusive {
            debug!(key = %key, "Completing all groups after aggregation");
            self.force_completion_of_all_groups().await;
        }
        Ok(())
    }

    /// One aggregation attempt; completions are submitted after the
    /// exclusive lock has been released
    async fn process_once(self: &Arc<Self>, key: &str, exchange: &Exchange) -> Result<()> {
        let mut copy = exchange.copy();
        copy.message.remove_header(properties::COMPLETE_ALL_GROUPS);
        copy.message.remove_header(properties::COMPLETE_ALL_GROUPS_INCLUSIVE);
        copy.remove_property(properties::COMPLETE_ALL_GROUPS);

        let mut completions = Vec::new();
        let result = {
            let _guard = self.exclusive_guard().await;
            self.do_aggregation(key, copy, &mut completions).await
        };

        for completed in completions {
            self.submit_completion(completed);
        }
        result
    }

    async fn do_aggregation(
        &self,
        key: &str,
        mut new_exchange: Exchange,
        completions: &mut Vec<Exchange>,
    ) -> Result<()> {
        let mut original = self.repository.get(key).await?;
        let mut size = original.as_ref().map_or(1, |group| group.size + 1);
        let mut completed_by: Option<CompletedBy> = None;
        let mut timeout: Option<Duration> = None;
        let pre_completion = self.pre_completion.load(Ordering::SeqCst);
        let eager = !pre_completion && self.completion.is_eager();

        if pre_completion {
            new_exchange.set_property(properties::SIZE, size);
            new_exchange.set_property(properties::CORRELATION_KEY, key);
            let complete_previous = self
                .strategy
                .pre_complete(original.as_ref().map(|group| &group.exchange), &new_exchange);
            new_exchange.remove_property(properties::SIZE);
            new_exchange.remove_property(properties::CORRELATION_KEY);

            if complete_previous {
                if let Some(group) = original.take() {
                    debug!(key, size = group.size, "Strategy pre-completed group");
                    let mut previous = group.exchange.clone();
                    previous.set_property(properties::COMPLETED_BY, CompletedBy::Strategy.as_str());
                    if let Some(done) = self
                        .on_completion(key, Some(&group), previous, Finish::Normal)
                        .await?
                    {
                        completions.push(done);
                    }
                }
                size = 1;
            }
            timeout = self.completion.timeout_for(&new_exchange);
        } else if eager {
            new_exchange.set_property(properties::SIZE, size);
            completed_by = self.completion.evaluate(&new_exchange, size);
            new_exchange.remove_property(properties::SIZE);
            new_exchange.remove_property(properties::COMPLETE_CURRENT_GROUP);
            if completed_by.is_none() {
                timeout = self.completion.timeout_for(&new_exchange);
            }
        }

        let lazy_timeout = if pre_completion || eager {
            None
        } else {
            self.completion.timeout_for(&new_exchange)
        };
        let rejected_new = self.repository.is_optimistic().then(|| new_exchange.clone());

        let mut aggregate_failed = false;
        let old = original.as_ref().map(|group| group.exchange.clone());
        let mut answer = match self.strategy.aggregate(old, new_exchange) {
            Ok(answer) => answer,
            Err(err) if self.config.discard_on_aggregation_failure => {
                warn!(key, error = %err, "Aggregation failed, discarding group");
                aggregate_failed = true;
                completed_by = Some(CompletedBy::Strategy);
                match &original {
                    Some(group) => group.exchange.clone(),
                    None => {
                        self.stats.record_discarded();
                        return Ok(());
                    }
                }
            }
            Err(err) => return Err(err.into()),
        };

        if answer.remove_property(properties::COMPLETE_ALL_GROUPS).is_some() {
            debug!(key, "Strategy requested completion of all groups");
            completions.extend(self.collect_all_groups(CompletedBy::Force, Some(key)).await);
            completed_by.get_or_insert(CompletedBy::Force);
        } else if self.config.completion_on_new_correlation_group && original.is_none() {
            let others = self.collect_all_groups(CompletedBy::Force, Some(key)).await;
            if !others.is_empty() {
                debug!(key, completed = others.len(), "New correlation group completed previous groups");
            }
            completions.extend(others);
        }

        answer.set_property(properties::SIZE, size);

        if completed_by.is_none() && answer.property_bool(properties::COMPLETE_CURRENT_GROUP) {
            completed_by = Some(CompletedBy::Strategy);
        }
        if completed_by.is_none() && !pre_completion && !eager {
            completed_by = self.completion.evaluate(&answer, size);
            if completed_by.is_none() {
                timeout = lazy_timeout;
            }
        }
        answer.remove_property(properties::COMPLETE_CURRENT_GROUP);

        match completed_by {
            None => {
                if let Some(timeout) = timeout {
                    answer.set_property(properties::TIMEOUT_MS, saturating_millis(timeout));
                }
                let index = original.as_ref().map_or(0, |group| group.index + 1);
                let group = AggregateGroup::new(answer, size, index);

                if self.repository.is_optimistic() {
                    let stored = self
                        .repository
                        .compare_and_add(key, original.as_ref(), group)
                        .await;
                    if let Err(err) = stored {
                        if matches!(err, RepositoryError::OptimisticLocking { .. }) {
                            if let Some(new) = &rejected_new {
                                self.strategy.on_optimistic_lock_failure(
                                    original.as_ref().map(|group| &group.exchange),
                                    new,
                                );
                            }
                        }
                        return Err(err.into());
                    }
                } else {
                    self.repository.add(key, group).await?;
                }
                if let Some(timeout) = timeout {
                    self.timeouts.arm(key, timeout);
                }
                Ok(())
            }
            Some(by) => {
                answer.set_property(properties::COMPLETED_BY, by.as_str());
                let finish = if aggregate_failed {
                    Finish::AggregationFailed
                } else {
                    Finish::Normal
                };
                debug!(key, size, completed_by = %by, "Group completed");
                if let Some(done) = self
                    .on_completion(key, original.as_ref(), answer, finish)
                    .await?
                {
                    completions.push(done);
                }
                Ok(())
            }
        }
    }

    /// Take a completed group out of circulation
    ///
    /// Returns the aggregate to deliver, or `None` when it was discarded.
    async fn on_completion(
        &self,
        key: &str,
        original: Option<&Arc<AggregateGroup>>,
        mut exchange: Exchange,
        finish: Finish,
    ) -> Result<Option<Exchange>> {
        exchange.set_property(properties::CORRELATION_KEY, key);

        if let Some(group) = original {
            self.repository.remove(key, group).await?;
        }
        if !matches!(finish, Finish::Timeout(_)) {
            self.timeouts.remove(key);
        }
        if let Some(closed) = &self.closed_keys {
            closed.insert(key).await;
        }

        let discard = match finish {
            Finish::Normal => false,
            Finish::Timeout(timeout) => {
                self.strategy.timeout(&mut exchange, timeout);
                self.config.discard_on_completion_timeout
            }
            Finish::AggregationFailed | Finish::ForceDiscard => true,
        };

        if discard {
            debug!(key, exchange_id = %exchange.id, ?finish, "Discarding aggregated exchange");
            self.stats.record_discarded();
            self.repository.confirm(&exchange.id.to_string()).await?;
            return Ok(None);
        }
        Ok(Some(exchange))
    }

    /// Hand a completed aggregate to the delivery executor
    fn submit_completion(self: &Arc<Self>, mut exchange: Exchange) {
        let exchange_id = exchange.id;
        self.in_progress.insert(exchange_id);

        self.strategy.on_completion(&mut exchange);
        let completed_by = exchange.completed_by().unwrap_or(CompletedBy::Force);
        self.stats.record_completed(completed_by);

        let inner = Arc::clone(self);
        let delivery = async move {
            let id = exchange_id.to_string();
            match inner.downstream.deliver(&mut exchange).await {
                Ok(()) => {
                    if let Err(err) = inner.repository.confirm(&id).await {
                        warn!(exchange_id = %id, error = %err, "Failed to confirm delivered exchange");
                    }
                }
                Err(source) => {
                    let err = AggregatorError::Delivery {
                        exchange_id: id,
                        source: source.into(),
                    };
                    warn!(
                        key = exchange.correlation_key().unwrap_or_default(),
                        error = %err,
                        "Delivery of aggregated exchange failed"
                    );
                    exchange.set_failure(&err);
                    inner.stats.record_delivery_failure();
                    if let Some(handler) = &inner.failure_handler {
                        handler(&exchange);
                    }
                }
            }
            inner.in_progress.remove(&exchange_id);
        };

        if let Err(err) = self.delivery.submit(delivery) {
            warn!(exchange_id = %exchange_id, error = %err, "Could not submit aggregated exchange");
            self.in_progress.remove(&exchange_id);
        }
    }

    /// Complete the stored group of `key` without taking the lock
    async fn complete_group(&self, key: &str, by: CompletedBy) -> Result<Option<Exchange>> {
        let Some(group) = self.repository.get(key).await? else {
            return Ok(None);
        };
        if self.in_progress.contains(&group.exchange.id) {
            debug!(key, "Group is already being delivered, skipping");
            return Ok(None);
        }

        let mut exchange = group.exchange.clone();
        exchange.set_property(properties::COMPLETED_BY, by.as_str());
        self.on_completion(key, Some(&group), exchange, Finish::Normal)
            .await
    }

    /// Complete every stored group except `exclude` without taking the lock
    async fn collect_all_groups(&self, by: CompletedBy, exclude: Option<&str>) -> Vec<Exchange> {
        let keys = match self.repository.keys().await {
            Ok(keys) => keys,
            Err(err) => {
                warn!(error = %err, "Failed to list groups for completion");
                return Vec::new();
            }
        };

        let mut completed = Vec::new();
        for key in keys {
            if exclude == Some(key.as_str()) {
                continue;
            }
            match self.complete_group(&key, by).await {
                Ok(Some(exchange)) => completed.push(exchange),
                Ok(None) => {}
                Err(err) if err.is_optimistic_locking() => {
                    debug!(key = %key, "Group changed concurrently, skipping completion");
                }
                Err(err) => warn!(key = %key, error = %err, "Failed to complete group"),
            }
        }
        completed
    }

    async fn force_completion_of_all_groups(self: &Arc<Self>) -> usize {
        if !self.accepts_force("force completion of all groups") {
            return 0;
        }

        let completed = {
            let _guard = self.exclusive_guard().await;
            self.collect_all_groups(CompletedBy::Force, None).await
        };

        let count = completed.len();
        for exchange in completed {
            self.submit_completion(exchange);
        }
        if count > 0 {
            info!(completed = count, "Forced completion of all groups");
        }
        count
    }

    async fn discard_group(&self, key: &str) -> Result<bool> {
        let Some(group) = self.repository.get(key).await? else {
            return Ok(false);
        };
        let exchange = group.exchange.clone();
        self.on_completion(key, Some(&group), exchange, Finish::ForceDiscard)
            .await?;
        Ok(true)
    }

    /// Re-arm timeouts recorded on groups that were stored before start
    async fn restore_timeouts(&self) -> Result<()> {
        let keys = self.repository.keys().await?;
        let mut restored = 0usize;
        for key in keys {
            let Some(group) = self.repository.get(&key).await? else {
                continue;
            };
            if let Some(timeout_ms) = group.exchange.property_u64(properties::TIMEOUT_MS) {
                self.timeouts.arm(&key, Duration::from_millis(timeout_ms));
                restored += 1;
            }
        }
        if restored > 0 {
            info!(restored, "Restored completion timeouts");
        }
        Ok(())
    }

    async fn on_timeout_tick(self: &Arc<Self>) {
        let expired = self.timeouts.take_expired(Instant::now());
        for (key, timeout) in expired {
            let completion = {
                let _guard = self.exclusive_guard().await;
                self.evict_timed_out(&key, timeout).await
            };

            match completion {
                Ok(Some(exchange)) => self.submit_completion(exchange),
                Ok(None) => {}
                Err(err) if err.is_optimistic_locking() => {
                    debug!(key = %key, "Timed out group was stolen by a concurrent update");
                }
                Err(err) => warn!(key = %key, error = %err, "Failed to complete timed out group"),
            }
        }
    }

    async fn evict_timed_out(&self, key: &str, timeout: Duration) -> Result<Option<Exchange>> {
        if self.timeouts.contains(key) {
            debug!(key, "Timeout re-armed by a concurrent aggregation, skipping");
            return Ok(None);
        }
        let Some(group) = self.repository.get(key).await? else {
            debug!(key, "Timed out group no longer stored, already completed");
            return Ok(None);
        };
        if self.in_progress.contains(&group.exchange.id) {
            debug!(key, "Timed out group is already being delivered, skipping");
            return Ok(None);
        }

        debug!(key, timeout_ms = saturating_millis(timeout), "Completing group by timeout");
        let mut exchange = group.exchange.clone();
        exchange.set_property(properties::COMPLETED_BY, CompletedBy::Timeout.as_str());
        self.on_completion(key, Some(&group), exchange, Finish::Timeout(timeout))
            .await
    }

    async fn on_interval_tick(self: &Arc<Self>) {
        if *self.state.lock() != LifecycleState::Started {
            return;
        }
        let completed = {
            let _guard = self.exclusive_guard().await;
            self.collect_all_groups(CompletedBy::Interval, None).await
        };
        if !completed.is_empty() {
            debug!(completed = completed.len(), "Completed groups by interval");
        }
        for exchange in completed {
            self.submit_completion(exchange);
        }
    }
}
