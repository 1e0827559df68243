//! Downstream delivery of completed aggregates
//!
//! Completion decisions are made on the caller's task or on the reaper; the
//! actual delivery runs on a separately spawned task gated by a fixed-size
//! [`DeliveryExecutor`], so a slow downstream never blocks `process()`.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, warn};

use crate::error::{AggregatorError, Result};
use crate::exchange::Exchange;

/// Poll period used while waiting for in-flight deliveries
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Receives completed aggregates
#[async_trait]
pub trait Downstream: Send + Sync {
    /// Deliver a completed aggregate
    ///
    /// An error is attached to the aggregate as a delivery failure; it is
    /// never returned to the caller of `process()`.
    async fn deliver(&self, exchange: &mut Exchange) -> anyhow::Result<()>;
}

/// Downstream built from an async closure receiving a copy of the aggregate
pub struct FnDownstream<F> {
    f: F,
}

impl<F> FnDownstream<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Downstream for FnDownstream<F>
where
    F: Fn(Exchange) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn deliver(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        (self.f)(exchange.clone()).await
    }
}

/// Downstream forwarding aggregates into an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelDownstream {
    tx: mpsc::UnboundedSender<Exchange>,
}

impl ChannelDownstream {
    /// Create the downstream and the receiving end of its channel
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Exchange>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Downstream for ChannelDownstream {
    async fn deliver(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        self.tx
            .send(exchange.clone())
            .map_err(|_| anyhow::anyhow!("downstream channel closed"))
    }
}

/// Fixed-size pool running delivery tasks
///
/// Every submission is spawned immediately and waits for one of `pool_size`
/// permits. After [`shutdown`](Self::shutdown), submissions are rejected and
/// queued deliveries that have not obtained a permit are abandoned.
#[derive(Debug)]
pub struct DeliveryExecutor {
    permits: Arc<Semaphore>,
    pool_size: usize,
    in_flight: Arc<AtomicUsize>,
}

impl DeliveryExecutor {
    pub fn new(pool_size: usize) -> Self {
        let pool_size = pool_size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(pool_size)),
            pool_size,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Deliveries submitted and not yet finished
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_shutdown(&self) -> bool {
        self.permits.is_closed()
    }

    /// Submit a delivery task
    pub fn submit<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.permits.is_closed() {
            return Err(AggregatorError::Lifecycle(
                "delivery executor has been shut down".to_string(),
            ));
        }

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let permits = Arc::clone(&self.permits);
        let in_flight = Arc::clone(&self.in_flight);

        tokio::spawn(async move {
            match permits.acquire_owned().await {
                Ok(_permit) => task.await,
                Err(_) => warn!("Delivery abandoned, executor shut down"),
            }
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });

        Ok(())
    }

    /// Wait until no delivery is in flight, polling every 100 ms
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub async fn wait_idle(&self, timeout: Option<Duration>) -> bool {
        let started = tokio::time::Instant::now();
        loop {
            let pending = self.in_flight();
            if pending == 0 {
                return true;
            }
            if let Some(timeout) = timeout {
                if started.elapsed() >= timeout {
                    return false;
                }
            }
            debug!(pending, "Waiting for in-flight deliveries");
            tokio::time::sleep(IDLE_POLL_INTERVAL).await;
        }
    }

    /// Reject new submissions and abandon queued ones
    pub fn shutdown(&self) {
        self.permits.close();
        debug!(in_flight = self.in_flight(), "Delivery executor shut down");
    }
}

impl Default for DeliveryExecutor {
    fn default() -> Self {
        Self::new(10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_downstream() {
        let (downstream, mut rx) = ChannelDownstream::new();
        let mut exchange = Exchange::new("done");
        downstream.deliver(&mut exchange).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().body(), "done");

        drop(rx);
        assert!(downstream.deliver(&mut exchange).await.is_err());
    }

    #[tokio::test]
    async fn test_fn_downstream() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let downstream = FnDownstream::new(move |_exchange: Exchange| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        downstream.deliver(&mut Exchange::empty()).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_executor_limits_concurrency() {
        let executor = DeliveryExecutor::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..6 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            executor
                .submit(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        assert!(executor.wait_idle(Some(Duration::from_secs(5))).await);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(executor.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_executor_rejects_after_shutdown() {
        let executor = DeliveryExecutor::default();
        assert_eq!(executor.pool_size(), 10);
        executor.shutdown();
        assert!(executor.is_shutdown());
        assert!(executor.submit(async {}).is_err());
    }
}
