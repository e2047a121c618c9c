//! In-process broker used by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::consume::{Consumption, Fetch};
use super::{
    Broker, BrokerError, Consumer, Delivery, ErrorSender, Queue, QueueResult, QueueStats,
    TransportError,
};

#[derive(Default)]
struct QueueState {
    ready: VecDeque<String>,
    unacked: Vec<String>,
    rejected: VecDeque<String>,
    acked: Vec<String>,
}

pub struct MemoryBroker {
    errors: ErrorSender,
    fail_publish: Arc<AtomicBool>,
    queues: Mutex<HashMap<String, Arc<MemoryQueue>>>,
}

impl MemoryBroker {
    pub fn new() -> (Arc<Self>, mpsc::Receiver<TransportError>) {
        let (errors, rx) = mpsc::channel(16);
        let broker = Arc::new(Self {
            errors,
            fail_publish: Arc::new(AtomicBool::new(false)),
            queues: Mutex::new(HashMap::new()),
        });
        (broker, rx)
    }

    /// Typed handle on a queue, created on first use.
    pub fn queue(&self, name: &str) -> Arc<MemoryQueue> {
        self.queues
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(MemoryQueue {
                    name: name.to_string(),
                    state: Arc::new(Mutex::new(QueueState::default())),
                    errors: self.errors.clone(),
                    fail_publish: self.fail_publish.clone(),
                    fetch_failures: Arc::new(AtomicUsize::new(0)),
                    consumption: Mutex::new(None),
                })
            })
            .clone()
    }

    /// Names of every queue opened so far, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Make every publish on every queue fail until switched back.
    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn open_queue(&self, name: &str) -> QueueResult<Arc<dyn Queue>> {
        let queue: Arc<dyn Queue> = self.queue(name);
        Ok(queue)
    }

    async fn stop_all_consuming(&self) {
        let queues: Vec<Arc<MemoryQueue>> =
            self.queues.lock().unwrap().values().cloned().collect();
        for queue in queues {
            queue.stop_consuming().await;
        }
    }
}

pub struct MemoryQueue {
    name: String,
    state: Arc<Mutex<QueueState>>,
    errors: ErrorSender,
    fail_publish: Arc<AtomicBool>,
    fetch_failures: Arc<AtomicUsize>,
    consumption: Mutex<Option<Arc<Consumption>>>,
}

impl MemoryQueue {
    /// Make the next `count` fetches of the consume loop fail.
    pub fn fail_fetches(&self, count: usize) {
        self.fetch_failures.store(count, Ordering::SeqCst);
    }

    /// Payloads waiting to be fetched, oldest first.
    pub fn ready(&self) -> Vec<String> {
        self.state.lock().unwrap().ready.iter().cloned().collect()
    }

    pub fn acked(&self) -> Vec<String> {
        self.state.lock().unwrap().acked.clone()
    }

    pub fn rejected(&self) -> Vec<String> {
        self.state.lock().unwrap().rejected.iter().cloned().collect()
    }

    pub fn unacked(&self) -> Vec<String> {
        self.state.lock().unwrap().unacked.clone()
    }

    /// Hand out the next ready payload as a delivery, bypassing the fetch loop.
    pub fn take_delivery(&self) -> Option<Box<dyn Delivery>> {
        let mut state = self.state.lock().unwrap();
        let payload = state.ready.pop_front()?;
        state.unacked.push(payload.clone());
        Some(Box::new(MemoryDelivery {
            payload,
            state: self.state.clone(),
            settled: AtomicBool::new(false),
        }))
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, payload: &str) -> QueueResult<()> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable(format!(
                "publish to {} refused",
                self.name
            )));
        }
        self.state
            .lock()
            .unwrap()
            .ready
            .push_back(payload.to_string());
        Ok(())
    }

    async fn start_consuming(
        &self,
        prefetch_limit: usize,
        poll_interval: Duration,
    ) -> QueueResult<()> {
        let mut consumption = self.consumption.lock().unwrap();
        if consumption.is_some() {
            return Err(BrokerError::AlreadyConsuming(self.name.clone()));
        }
        let fetcher = Arc::new(MemoryFetcher {
            state: self.state.clone(),
            failures: self.fetch_failures.clone(),
        });
        *consumption = Some(Arc::new(Consumption::start(
            &self.name,
            fetcher,
            prefetch_limit,
            poll_interval,
            self.errors.clone(),
        )));
        Ok(())
    }

    async fn add_consumer(&self, tag: &str, consumer: Arc<dyn Consumer>) -> QueueResult<String> {
        let consumption = self
            .consumption
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| BrokerError::NotConsuming(self.name.clone()))?;
        consumption.add_consumer(tag, consumer)
    }

    async fn stop_consuming(&self) {
        let consumption = self.consumption.lock().unwrap().clone();
        if let Some(consumption) = consumption {
            consumption.stop().await;
        }
    }

    async fn return_rejected(&self, max: usize) -> QueueResult<usize> {
        let mut state = self.state.lock().unwrap();
        let mut returned = 0;
        while returned < max {
            let Some(payload) = state.rejected.pop_front() else {
                break;
            };
            state.ready.push_back(payload);
            returned += 1;
        }
        Ok(returned)
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        let state = self.state.lock().unwrap();
        Ok(QueueStats {
            ready: state.ready.len(),
            rejected: state.rejected.len(),
        })
    }
}

struct MemoryFetcher {
    state: Arc<Mutex<QueueState>>,
    failures: Arc<AtomicUsize>,
}

#[async_trait]
impl Fetch for MemoryFetcher {
    async fn fetch(&self, max: usize) -> QueueResult<Vec<Box<dyn Delivery>>> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(BrokerError::Unavailable("fetch refused".into()));
        }
        let mut state = self.state.lock().unwrap();
        let mut batch: Vec<Box<dyn Delivery>> = Vec::new();
        while batch.len() < max {
            let Some(payload) = state.ready.pop_front() else {
                break;
            };
            state.unacked.push(payload.clone());
            batch.push(Box::new(MemoryDelivery {
                payload,
                state: self.state.clone(),
                settled: AtomicBool::new(false),
            }));
        }
        Ok(batch)
    }
}

struct MemoryDelivery {
    payload: String,
    state: Arc<Mutex<QueueState>>,
    settled: AtomicBool,
}

impl MemoryDelivery {
    fn settle(&self, reject: bool) -> QueueResult<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::AlreadySettled);
        }
        let mut state = self.state.lock().unwrap();
        let position = state
            .unacked
            .iter()
            .position(|p| *p == self.payload)
            .ok_or_else(|| BrokerError::NotFound("unacked".into()))?;
        let payload = state.unacked.remove(position);
        if reject {
            state.rejected.push_back(payload);
        } else {
            state.acked.push(payload);
        }
        Ok(())
    }
}

#[async_trait]
impl Delivery for MemoryDelivery {
    fn payload(&self) -> &str {
        &self.payload
    }

    async fn ack(&self) -> QueueResult<()> {
        self.settle(false)
    }

    async fn reject(&self) -> QueueResult<()> {
        self.settle(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counting {
        seen: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Consumer for Counting {
        async fn consume(&self, delivery: Box<dyn Delivery>) {
            delivery.ack().await.unwrap();
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_consumers_drain_queue_and_stop_gracefully() {
        let (broker, _errors) = MemoryBroker::new();
        let queue = broker.open_queue("jobs").await.unwrap();
        for i in 0..25 {
            queue.publish(&format!("job-{i}")).await.unwrap();
        }

        let seen = Arc::new(AtomicUsize::new(0));
        queue
            .start_consuming(4, Duration::from_millis(5))
            .await
            .unwrap();
        for i in 0..3 {
            queue
                .add_consumer(&format!("consumer {i}"), Arc::new(Counting { seen: seen.clone() }))
                .await
                .unwrap();
        }

        while seen.load(Ordering::SeqCst) < 25 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        broker.stop_all_consuming().await;

        let handle = broker.queue("jobs");
        assert_eq!(handle.acked().len(), 25);
        assert!(handle.unacked().is_empty());
        assert!(queue
            .add_consumer("late", Arc::new(Counting { seen }))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_add_consumer_requires_consuming_queue() {
        let (broker, _errors) = MemoryBroker::new();
        let queue = broker.open_queue("jobs").await.unwrap();
        let err = queue
            .add_consumer(
                "consumer 0",
                Arc::new(Counting {
                    seen: Arc::new(AtomicUsize::new(0)),
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::NotConsuming(_)));
    }

    #[tokio::test]
    async fn test_reject_parks_delivery_until_returned() {
        let (broker, _errors) = MemoryBroker::new();
        let queue = broker.queue("jobs");
        queue.publish("bad").await.unwrap();

        let delivery = queue.take_delivery().unwrap();
        delivery.reject().await.unwrap();
        assert!(matches!(
            delivery.ack().await,
            Err(BrokerError::AlreadySettled)
        ));
        assert_eq!(queue.stats().await.unwrap(), QueueStats { ready: 0, rejected: 1 });

        assert_eq!(queue.return_rejected(10).await.unwrap(), 1);
        assert_eq!(queue.ready(), vec!["bad".to_string()]);
    }
}
