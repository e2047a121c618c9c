//! Durable at-least-once queue transport.
//!
//! The traits mirror the primitives the pipeline relies on: open a named queue,
//! publish a string payload, consume with a prefetch limit, and settle each
//! delivery with an ack or a reject. Connection-level failures are reported on a
//! separate channel so a transport hiccup never stops the consumers.

pub mod consume;
#[cfg(test)]
pub mod memory;
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::services::metrics::TRANSPORT_ERRORS_COUNTER;

pub type QueueResult<T> = Result<T, BrokerError>;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("queue {0} has not started consuming")]
    NotConsuming(String),

    #[error("queue {0} is already consuming")]
    AlreadyConsuming(String),

    #[error("delivery was already settled")]
    AlreadySettled,

    #[error("delivery not found in {0}")]
    NotFound(String),

    #[error("connection {0} stopped consuming")]
    Stopped(String),

    #[error("{0}")]
    Unavailable(String),
}

/// Connection-level failures, reported asynchronously.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("heartbeat error ({count}/{limit}): {source}")]
    Heartbeat {
        count: u32,
        limit: u32,
        source: BrokerError,
    },

    #[error("consume error on {queue}: {source}")]
    Consume { queue: String, source: BrokerError },

    #[error("delivery error on {queue}: {source}")]
    Delivery {
        queue: String,
        payload: String,
        source: BrokerError,
    },
}

impl TransportError {
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::Heartbeat { .. } => "heartbeat",
            TransportError::Consume { .. } => "consume",
            TransportError::Delivery { .. } => "delivery",
        }
    }
}

pub type ErrorSender = mpsc::Sender<TransportError>;

/// Ready/rejected counters of a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub ready: usize,
    pub rejected: usize,
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn open_queue(&self, name: &str) -> QueueResult<Arc<dyn Queue>>;

    /// Stop intake on every queue and wait until in-flight deliveries are handled.
    async fn stop_all_consuming(&self);
}

#[async_trait]
pub trait Queue: Send + Sync {
    fn name(&self) -> &str;

    async fn publish(&self, payload: &str) -> QueueResult<()>;

    async fn start_consuming(&self, prefetch_limit: usize, poll_interval: Duration)
        -> QueueResult<()>;

    /// Attach a consumer; returns the tag it was registered under.
    async fn add_consumer(&self, tag: &str, consumer: Arc<dyn Consumer>) -> QueueResult<String>;

    async fn stop_consuming(&self);

    /// Move up to `max` rejected deliveries back to ready.
    async fn return_rejected(&self, max: usize) -> QueueResult<usize>;

    async fn stats(&self) -> QueueResult<QueueStats>;
}

#[async_trait]
pub trait Delivery: Send + Sync {
    fn payload(&self) -> &str;

    async fn ack(&self) -> QueueResult<()>;

    async fn reject(&self) -> QueueResult<()>;
}

#[async_trait]
pub trait Consumer: Send + Sync {
    async fn consume(&self, delivery: Box<dyn Delivery>);
}

/// Drain the transport error channel until every sender is gone.
pub async fn log_transport_errors(mut errors: mpsc::Receiver<TransportError>) {
    while let Some(err) = errors.recv().await {
        TRANSPORT_ERRORS_COUNTER
            .with_label_values(&[err.kind()])
            .inc();
        match &err {
            TransportError::Heartbeat { count, limit, .. } if count >= limit => {
                error!("heartbeat error (limit): {err}")
            }
            TransportError::Heartbeat { .. } => warn!("heartbeat error: {err}"),
            TransportError::Consume { .. } => warn!("consume error: {err}"),
            TransportError::Delivery { payload, .. } => {
                warn!(payload = %payload, "delivery error: {err}")
            }
        }
    }
}

/// Report a transport error without ever blocking the caller.
pub(crate) fn report(errors: &ErrorSender, err: TransportError) {
    if let Err(mpsc::error::TrySendError::Full(err)) = errors.try_send(err) {
        warn!("transport error channel full, dropping: {err}");
    }
}
