use std::sync::Arc;

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_gauge_vec, Counter,
    CounterVec, Gauge, GaugeVec,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::services::revocation::TimerStore;

lazy_static! {
    // ── Event counters ──────────────────────────────────────────────────────
    pub static ref SYNC_JOBS_COUNTER: CounterVec = register_counter_vec!(
        "sync_jobs_published_total",
        "Sync jobs published to device queues by operation",
        &["operation"]
    ).unwrap();

    pub static ref EXPIRATION_JOBS_COUNTER: Counter = register_counter!(
        "expiration_jobs_published_total",
        "Expiration jobs published to the shared expiration queue"
    ).unwrap();

    pub static ref DELIVERIES_COUNTER: CounterVec = register_counter_vec!(
        "expiration_deliveries_total",
        "Expiration deliveries handled by consumer and outcome",
        &["consumer", "outcome"]
    ).unwrap();

    pub static ref TRANSPORT_ERRORS_COUNTER: CounterVec = register_counter_vec!(
        "broker_transport_errors_total",
        "Asynchronous broker errors by kind",
        &["kind"]
    ).unwrap();

    pub static ref OUTBOX_DISPATCHED_COUNTER: Counter = register_counter!(
        "sync_outbox_dispatched_total",
        "Outbox entries published"
    ).unwrap();

    pub static ref OUTBOX_FAILURES_COUNTER: Counter = register_counter!(
        "sync_outbox_failures_total",
        "Outbox entries whose publish failed"
    ).unwrap();

    // ── Gauges ──────────────────────────────────────────────────────────────
    pub static ref CONSUMER_THROUGHPUT_GAUGE: GaugeVec = register_gauge_vec!(
        "expiration_consumer_throughput",
        "Deliveries per second over the last report batch",
        &["consumer"]
    ).unwrap();

    pub static ref REVOCATIONS_PENDING_GAUGE: Gauge = register_gauge!(
        "revocations_pending",
        "Revocation tasks waiting in the timer store"
    ).unwrap();
}

/// Spawn the background collector for store-backed gauges (every 30 seconds).
pub fn start(timers: Arc<dyn TimerStore>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match timers.pending().await {
                Ok(pending) => REVOCATIONS_PENDING_GAUGE.set(pending as f64),
                Err(e) => warn!("Metrics: failed to count pending revocations: {}", e),
            }
            tokio::select! {
                _ = tokio::time::sleep(tokio::time::Duration::from_secs(30)) => {}
                _ = shutdown.changed() => break,
            }
        }
    })
}
