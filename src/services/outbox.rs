//! Publishes jobs recorded in the `sync_outbox` table.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::db::store::{AnnouncementStore, StoreError};
use crate::models::job::{OutboxEntry, EXPIRATION_QUEUE};
use crate::queue::{Broker, BrokerError};
use crate::services::metrics::{
    EXPIRATION_JOBS_COUNTER, OUTBOX_DISPATCHED_COUNTER, OUTBOX_FAILURES_COUNTER,
    SYNC_JOBS_COUNTER,
};

const CLAIM_LEASE_SECS: i64 = 30;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("outbox store error: {0}")]
    Store(#[from] StoreError),

    #[error("failed to publish to {queue}: {source}")]
    Publish { queue: String, source: BrokerError },
}

pub struct OutboxDispatcher {
    store: Arc<dyn AnnouncementStore>,
    broker: Arc<dyn Broker>,
    batch_size: i64,
}

impl OutboxDispatcher {
    pub fn new(store: Arc<dyn AnnouncementStore>, broker: Arc<dyn Broker>, batch_size: i64) -> Self {
        Self {
            store,
            broker,
            batch_size: batch_size.max(1),
        }
    }

    /// Publish pending entries until the outbox is empty or a publish fails.
    ///
    /// A failed entry keeps its place so per-queue order is preserved on retry.
    pub async fn dispatch_pending(&self) -> Result<usize, DispatchError> {
        self.dispatch(None).await
    }

    /// Publish the pending entries of one announcement only.
    pub async fn dispatch_announcement(&self, announcement_id: i32) -> Result<usize, DispatchError> {
        self.dispatch(Some(announcement_id)).await
    }

    async fn dispatch(&self, announcement_id: Option<i32>) -> Result<usize, DispatchError> {
        let mut dispatched = 0;
        loop {
            let entries = self
                .store
                .claim_outbox(
                    self.batch_size,
                    chrono::Duration::seconds(CLAIM_LEASE_SECS),
                    announcement_id,
                )
                .await?;
            if entries.is_empty() {
                return Ok(dispatched);
            }
            let claimed = entries.len();

            for (position, entry) in entries.iter().enumerate() {
                if let Err(source) = self.publish(entry).await {
                    OUTBOX_FAILURES_COUNTER.inc();
                    self.store.mark_failed(entry.id, &source.to_string()).await?;
                    let untouched: Vec<i64> =
                        entries[position + 1..].iter().map(|e| e.id).collect();
                    self.store.release_outbox(&untouched).await?;
                    return Err(DispatchError::Publish {
                        queue: entry.queue_name.clone(),
                        source,
                    });
                }
                self.store.mark_dispatched(entry.id).await?;
                OUTBOX_DISPATCHED_COUNTER.inc();
                dispatched += 1;
            }

            if (claimed as i64) < self.batch_size {
                return Ok(dispatched);
            }
        }
    }

    async fn publish(&self, entry: &OutboxEntry) -> Result<(), BrokerError> {
        let queue = self.broker.open_queue(&entry.queue_name).await?;
        queue.publish(&entry.payload).await?;

        if entry.queue_name == EXPIRATION_QUEUE {
            EXPIRATION_JOBS_COUNTER.inc();
        } else {
            SYNC_JOBS_COUNTER.with_label_values(&["append"]).inc();
        }
        debug!(
            "Outbox entry {} (announcement {}) published to {}",
            entry.id, entry.announcement_id, entry.queue_name
        );
        Ok(())
    }

    pub fn start(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Outbox dispatcher started");
            loop {
                match self.dispatch_pending().await {
                    Ok(0) => {}
                    Ok(n) => info!("Outbox dispatcher: published {} job(s)", n),
                    Err(e) => warn!("Outbox dispatcher: {}", e),
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => break,
                }
            }
            info!("Outbox dispatcher stopped");
        })
    }
}
