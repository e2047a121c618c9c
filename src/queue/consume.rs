//! Fetch loop and consumer tasks shared by every queue implementation.
//!
//! One fetch loop per queue moves deliveries into a channel; each attached
//! consumer runs its own task pulling from that channel. Every fetched delivery
//! holds one of `prefetch_limit` slots until it is settled or dropped, so a queue
//! never has more unsettled deliveries than its prefetch limit. Stopping ends the
//! fetch loop first, then lets consumers drain what was already prefetched.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{report, BrokerError, Consumer, Delivery, ErrorSender, QueueResult, TransportError};

/// Source of deliveries for one queue.
#[async_trait]
pub(crate) trait Fetch: Send + Sync + 'static {
    /// Take up to `max` ready deliveries, marking them unacked.
    async fn fetch(&self, max: usize) -> QueueResult<Vec<Box<dyn Delivery>>>;
}

type SharedReceiver = Arc<AsyncMutex<mpsc::Receiver<Box<dyn Delivery>>>>;

pub(crate) struct Consumption {
    queue: String,
    stop: watch::Sender<bool>,
    deliveries: SharedReceiver,
    fetcher: Mutex<Option<JoinHandle<()>>>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
}

impl Consumption {
    pub(crate) fn start(
        queue: &str,
        source: Arc<dyn Fetch>,
        prefetch_limit: usize,
        poll_interval: Duration,
        errors: ErrorSender,
    ) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        let (tx, rx) = mpsc::channel(prefetch_limit.max(1));
        let slots = Arc::new(Semaphore::new(prefetch_limit.max(1)));
        let fetcher = tokio::spawn(fetch_loop(
            queue.to_string(),
            source,
            tx,
            slots,
            poll_interval,
            stop_rx,
            errors,
        ));

        Self {
            queue: queue.to_string(),
            stop,
            deliveries: Arc::new(AsyncMutex::new(rx)),
            fetcher: Mutex::new(Some(fetcher)),
            consumers: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn add_consumer(&self, tag: &str, consumer: Arc<dyn Consumer>) -> QueueResult<String> {
        if *self.stop.borrow() {
            return Err(BrokerError::Stopped(self.queue.clone()));
        }

        let deliveries = self.deliveries.clone();
        let queue = self.queue.clone();
        let name = tag.to_string();
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            loop {
                let next = { deliveries.lock().await.recv().await };
                match next {
                    Some(delivery) => consumer.consume(delivery).await,
                    None => break,
                }
            }
            debug!("{task_name} on {queue} finished consuming");
        });

        self.consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
        Ok(name)
    }

    /// Stop intake and wait for every consumer to finish its current work.
    pub(crate) async fn stop(&self) {
        let _ = self.stop.send(true);

        let fetcher = self
            .fetcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(fetcher) = fetcher {
            let _ = fetcher.await;
        }

        let consumers = std::mem::take(
            &mut *self.consumers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let count = consumers.len();
        for consumer in consumers {
            let _ = consumer.await;
        }
        info!("{}: stopped {} consumer(s)", self.queue, count);
    }
}

async fn fetch_loop(
    queue: String,
    source: Arc<dyn Fetch>,
    tx: mpsc::Sender<Box<dyn Delivery>>,
    slots: Arc<Semaphore>,
    poll_interval: Duration,
    mut stop: watch::Receiver<bool>,
    errors: ErrorSender,
) {
    loop {
        if *stop.borrow() {
            break;
        }

        let room = slots.available_permits();
        if room > 0 {
            match source.fetch(room).await {
                Ok(batch) if !batch.is_empty() => {
                    for delivery in batch {
                        let Ok(slot) = slots.clone().acquire_owned().await else {
                            return;
                        };
                        let delivery: Box<dyn Delivery> = Box::new(Prefetched {
                            inner: delivery,
                            slot: Mutex::new(Some(slot)),
                        });
                        if tx.send(delivery).await.is_err() {
                            return;
                        }
                    }
                    continue;
                }
                Ok(_) => {}
                Err(source_err) => report(
                    &errors,
                    TransportError::Consume {
                        queue: queue.clone(),
                        source: source_err,
                    },
                ),
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            changed = stop.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}

/// A fetched delivery holding a prefetch slot until it is settled.
struct Prefetched {
    inner: Box<dyn Delivery>,
    slot: Mutex<Option<OwnedSemaphorePermit>>,
}

impl Prefetched {
    fn release(&self) {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

#[async_trait]
impl Delivery for Prefetched {
    fn payload(&self) -> &str {
        self.inner.payload()
    }

    async fn ack(&self) -> QueueResult<()> {
        self.inner.ack().await?;
        self.release();
        Ok(())
    }

    async fn reject(&self) -> QueueResult<()> {
        self.inner.reject().await?;
        self.release();
        Ok(())
    }
}
