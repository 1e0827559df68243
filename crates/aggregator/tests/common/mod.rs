//! Shared helpers for aggregator integration tests

#![allow(dead_code)]

use std::time::Duration;

use aggregator::{
    AggregateProcessorBuilder, AggregationStrategy, ChannelDownstream, Exchange, HeaderCorrelation,
};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing_subscriber::EnvFilter;

pub const KEY_HEADER: &str = "order_id";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Exchange correlated on `key`
pub fn order(key: &str, body: impl Into<Value>) -> Exchange {
    Exchange::new(body).with_header(KEY_HEADER, key)
}

/// Builder correlating on [`KEY_HEADER`] and delivering into a channel
pub fn builder<S>(strategy: S) -> (AggregateProcessorBuilder, UnboundedReceiver<Exchange>)
where
    S: AggregationStrategy + 'static,
{
    init_tracing();
    let (downstream, rx) = ChannelDownstream::new();
    let builder = AggregateProcessorBuilder::new()
        .with_correlation_expression(HeaderCorrelation::new(KEY_HEADER))
        .with_aggregation_strategy(strategy)
        .with_downstream(downstream);
    (builder, rx)
}

/// Wait for the next completed aggregate
pub async fn next_completed(rx: &mut UnboundedReceiver<Exchange>) -> Exchange {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a completed aggregate")
        .expect("downstream channel closed")
}

/// Assert nothing is delivered within `wait`
pub async fn assert_nothing_completed(rx: &mut UnboundedReceiver<Exchange>, wait: Duration) {
    if let Ok(Some(exchange)) = tokio::time::timeout(wait, rx.recv()).await {
        panic!("unexpected completed aggregate: {exchange:?}");
    }
}
