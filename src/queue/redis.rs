//! Redis list-based queues.
//!
//! Key layout follows the `rmq` v4 conventions so display devices consuming
//! their sync queue with an `rmq` client keep working:
//!
//! - `rmq::queue::[<queue>]::ready`    published, not yet fetched
//! - `rmq::queue::[<queue>]::rejected` rejected deliveries (dead letters)
//! - `rmq::connection::<conn>::queue::[<queue>]::unacked` fetched, not settled
//! - `rmq::connection::<conn>::heartbeat` liveness key refreshed every second

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::consume::{Consumption, Fetch};
use super::{
    report, Broker, BrokerError, Consumer, Delivery, ErrorSender, Queue, QueueResult, QueueStats,
    TransportError,
};

const CONNECTIONS_KEY: &str = "rmq::connections";
const QUEUES_KEY: &str = "rmq::queues";

/// Consecutive heartbeat failures after which the connection stops consuming.
pub const HEARTBEAT_ERROR_LIMIT: u32 = 45;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
const HEARTBEAT_TTL_SECS: u64 = 60;

/// Move one payload from unacked (KEYS[1]) to rejected (KEYS[2]) in a single step.
const REJECT_SCRIPT: &str = r#"
if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 1 then
    redis.call('LPUSH', KEYS[2], ARGV[1])
    return 1
end
return 0
"#;

fn ready_key(queue: &str) -> String {
    format!("rmq::queue::[{queue}]::ready")
}

fn rejected_key(queue: &str) -> String {
    format!("rmq::queue::[{queue}]::rejected")
}

fn unacked_key(connection: &str, queue: &str) -> String {
    format!("rmq::connection::{connection}::queue::[{queue}]::unacked")
}

fn consumers_key(connection: &str, queue: &str) -> String {
    format!("rmq::connection::{connection}::queue::[{queue}]::consumers")
}

fn connection_queues_key(connection: &str) -> String {
    format!("rmq::connection::{connection}::queues")
}

fn heartbeat_key(connection: &str) -> String {
    format!("rmq::connection::{connection}::heartbeat")
}

pub struct RedisBroker {
    name: String,
    conn: MultiplexedConnection,
    errors: ErrorSender,
    queues: Mutex<HashMap<String, Arc<RedisQueue>>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl RedisBroker {
    /// Open a broker connection named `<tag>-<suffix>` and start its heartbeat.
    ///
    /// Fails if Redis is unreachable or the first heartbeat cannot be written.
    pub async fn connect(
        client: &redis::Client,
        tag: &str,
        errors: ErrorSender,
    ) -> QueueResult<Arc<Self>> {
        let mut conn = client.get_multiplexed_async_connection().await?;
        let suffix = Uuid::new_v4().simple().to_string();
        let name = format!("{tag}-{}", &suffix[..6]);

        write_heartbeat(&mut conn, &name).await?;
        let _: () = redis::cmd("SADD")
            .arg(CONNECTIONS_KEY)
            .arg(&name)
            .query_async(&mut conn)
            .await?;

        let broker = Arc::new(Self {
            name: name.clone(),
            conn,
            errors,
            queues: Mutex::new(HashMap::new()),
            heartbeat: Mutex::new(None),
        });

        let handle = tokio::spawn(heartbeat_loop(Arc::downgrade(&broker)));
        *broker
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        info!("Broker connection {} opened", name);
        Ok(broker)
    }

    pub fn connection_name(&self) -> &str {
        &self.name
    }

    /// Return unacked deliveries of connections whose heartbeat expired to their
    /// ready lists, then forget those connections. Returns the number of
    /// deliveries made available again.
    pub async fn clean_dead_connections(&self) -> QueueResult<usize> {
        let mut conn = self.conn.clone();
        let connections: Vec<String> = redis::cmd("SMEMBERS")
            .arg(CONNECTIONS_KEY)
            .query_async(&mut conn)
            .await?;

        let mut returned = 0;
        for connection in connections {
            if connection == self.name {
                continue;
            }
            let alive: bool = redis::cmd("EXISTS")
                .arg(heartbeat_key(&connection))
                .query_async(&mut conn)
                .await?;
            if alive {
                continue;
            }

            let queues: Vec<String> = redis::cmd("SMEMBERS")
                .arg(connection_queues_key(&connection))
                .query_async(&mut conn)
                .await?;
            for queue in &queues {
                let unacked = unacked_key(&connection, queue);
                let ready = ready_key(queue);
                loop {
                    let moved: Option<String> = redis::cmd("RPOPLPUSH")
                        .arg(&unacked)
                        .arg(&ready)
                        .query_async(&mut conn)
                        .await?;
                    if moved.is_none() {
                        break;
                    }
                    returned += 1;
                }
                let _: () = redis::cmd("DEL")
                    .arg(&unacked)
                    .arg(consumers_key(&connection, queue))
                    .query_async(&mut conn)
                    .await?;
            }

            let _: () = redis::cmd("DEL")
                .arg(connection_queues_key(&connection))
                .query_async(&mut conn)
                .await?;
            let _: () = redis::cmd("SREM")
                .arg(CONNECTIONS_KEY)
                .arg(&connection)
                .query_async(&mut conn)
                .await?;
            info!("Cleaned dead connection {} ({} queue(s))", connection, queues.len());
        }

        Ok(returned)
    }

    fn queues(&self) -> Vec<Arc<RedisQueue>> {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

impl Drop for RedisBroker {
    fn drop(&mut self) {
        if let Some(handle) = self
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn open_queue(&self, name: &str) -> QueueResult<Arc<dyn Queue>> {
        if let Some(queue) = self
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            let queue: Arc<dyn Queue> = queue.clone();
            return Ok(queue);
        }

        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SADD")
            .arg(QUEUES_KEY)
            .arg(name)
            .query_async(&mut conn)
            .await?;
        let _: () = redis::cmd("SADD")
            .arg(connection_queues_key(&self.name))
            .arg(name)
            .query_async(&mut conn)
            .await?;

        let queue = Arc::new(RedisQueue {
            name: name.to_string(),
            connection: self.name.clone(),
            conn: self.conn.clone(),
            errors: self.errors.clone(),
            consumption: Mutex::new(None),
        });

        let queue: Arc<dyn Queue> = self
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_insert(queue)
            .clone();
        Ok(queue)
    }

    async fn stop_all_consuming(&self) {
        for queue in self.queues() {
            queue.stop_consuming().await;
        }
    }
}

async fn write_heartbeat(conn: &mut MultiplexedConnection, connection: &str) -> QueueResult<()> {
    let _: () = redis::cmd("SET")
        .arg(heartbeat_key(connection))
        .arg(1)
        .arg("EX")
        .arg(HEARTBEAT_TTL_SECS)
        .query_async(conn)
        .await?;
    Ok(())
}

/// Consecutive heartbeat failures of one connection.
#[derive(Debug, Default)]
struct HeartbeatFailures(u32);

impl HeartbeatFailures {
    /// Record one heartbeat attempt; a failure yields the error to report.
    fn record(&mut self, result: QueueResult<()>) -> Option<TransportError> {
        match result {
            Ok(()) => {
                self.0 = 0;
                None
            }
            Err(source) => {
                self.0 += 1;
                Some(TransportError::Heartbeat {
                    count: self.0,
                    limit: HEARTBEAT_ERROR_LIMIT,
                    source,
                })
            }
        }
    }

    fn exhausted(&self) -> bool {
        self.0 >= HEARTBEAT_ERROR_LIMIT
    }
}

async fn heartbeat_loop(broker: Weak<RedisBroker>) {
    let mut failures = HeartbeatFailures::default();
    loop {
        tokio::time::sleep(HEARTBEAT_INTERVAL).await;
        let Some(broker) = broker.upgrade() else {
            break;
        };

        let mut conn = broker.conn.clone();
        let result = write_heartbeat(&mut conn, &broker.name).await;
        if let Some(err) = failures.record(result) {
            report(&broker.errors, err);
        }
        if failures.exhausted() {
            warn!(
                "Broker connection {} lost its heartbeat, stopping all consumers",
                broker.name
            );
            broker.stop_all_consuming().await;
            break;
        }
    }
}

pub struct RedisQueue {
    name: String,
    connection: String,
    conn: MultiplexedConnection,
    errors: ErrorSender,
    consumption: Mutex<Option<Arc<Consumption>>>,
}

impl RedisQueue {
    fn consumption(&self) -> Option<Arc<Consumption>> {
        self.consumption
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Queue for RedisQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, payload: &str) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("LPUSH")
            .arg(ready_key(&self.name))
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn start_consuming(
        &self,
        prefetch_limit: usize,
        poll_interval: Duration,
    ) -> QueueResult<()> {
        let mut consumption = self
            .consumption
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if consumption.is_some() {
            return Err(BrokerError::AlreadyConsuming(self.name.clone()));
        }

        let fetcher = Arc::new(RedisFetcher {
            queue: self.name.clone(),
            ready: ready_key(&self.name),
            unacked: unacked_key(&self.connection, &self.name),
            rejected: rejected_key(&self.name),
            conn: self.conn.clone(),
            errors: self.errors.clone(),
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
            .consumption()
            .ok_or_else(|| BrokerError::NotConsuming(self.name.clone()))?;

        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SADD")
            .arg(consumers_key(&self.connection, &self.name))
            .arg(tag)
            .query_async(&mut conn)
            .await?;

        consumption.add_consumer(tag, consumer)
    }

    async fn stop_consuming(&self) {
        if let Some(consumption) = self.consumption() {
            consumption.stop().await;
        }
    }

    async fn return_rejected(&self, max: usize) -> QueueResult<usize> {
        let mut conn = self.conn.clone();
        let ready = ready_key(&self.name);
        let rejected = rejected_key(&self.name);
        let mut returned = 0;
        while returned < max {
            let moved: Option<String> = redis::cmd("RPOPLPUSH")
                .arg(&rejected)
                .arg(&ready)
                .query_async(&mut conn)
                .await?;
            if moved.is_none() {
                break;
            }
            returned += 1;
        }
        Ok(returned)
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        let mut conn = self.conn.clone();
        let ready: usize = redis::cmd("LLEN")
            .arg(ready_key(&self.name))
            .query_async(&mut conn)
            .await?;
        let rejected: usize = redis::cmd("LLEN")
            .arg(rejected_key(&self.name))
            .query_async(&mut conn)
            .await?;
        Ok(QueueStats { ready, rejected })
    }
}

struct RedisFetcher {
    queue: String,
    ready: String,
    unacked: String,
    rejected: String,
    conn: MultiplexedConnection,
    errors: ErrorSender,
}

#[async_trait]
impl Fetch for RedisFetcher {
    async fn fetch(&self, max: usize) -> QueueResult<Vec<Box<dyn Delivery>>> {
        let mut conn = self.conn.clone();
        let mut batch: Vec<Box<dyn Delivery>> = Vec::new();

        while batch.len() < max {
            let payload: Option<String> = match redis::cmd("RPOPLPUSH")
                .arg(&self.ready)
                .arg(&self.unacked)
                .query_async(&mut conn)
                .await
            {
                Ok(payload) => payload,
                Err(e) if batch.is_empty() => return Err(e.into()),
                Err(e) => {
                    debug!("{}: fetch interrupted after {}: {}", self.queue, batch.len(), e);
                    break;
                }
            };
            let Some(payload) = payload else {
                break;
            };

            batch.push(Box::new(RedisDelivery {
                queue: self.queue.clone(),
                payload,
                unacked: self.unacked.clone(),
                rejected: self.rejected.clone(),
                conn: self.conn.clone(),
                errors: self.errors.clone(),
                settled: AtomicBool::new(false),
            }));
        }

        Ok(batch)
    }
}

struct RedisDelivery {
    queue: String,
    payload: String,
    unacked: String,
    rejected: String,
    conn: MultiplexedConnection,
    errors: ErrorSender,
    settled: AtomicBool,
}

impl RedisDelivery {
    fn begin_settle(&self) -> QueueResult<()> {
        self.settled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| BrokerError::AlreadySettled)
    }

    /// Re-arm the delivery after a transport failure so it can be settled again.
    fn settle_failed(&self, err: ::redis::RedisError) -> BrokerError {
        self.settled.store(false, Ordering::Release);
        report(
            &self.errors,
            TransportError::Delivery {
                queue: self.queue.clone(),
                payload: self.payload.clone(),
                source: BrokerError::Unavailable(err.to_string()),
            },
        );
        BrokerError::Redis(err)
    }

    async fn remove_unacked(&self, conn: &mut MultiplexedConnection) -> QueueResult<()> {
        let removed: i64 = redis::cmd("LREM")
            .arg(&self.unacked)
            .arg(1)
            .arg(&self.payload)
            .query_async(conn)
            .await
            .map_err(|e| self.settle_failed(e))?;
        if removed == 0 {
            return Err(BrokerError::NotFound(self.unacked.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl Delivery for RedisDelivery {
    fn payload(&self) -> &str {
        &self.payload
    }

    async fn ack(&self) -> QueueResult<()> {
        self.begin_settle()?;
        let mut conn = self.conn.clone();
        self.remove_unacked(&mut conn).await
    }

    async fn reject(&self) -> QueueResult<()> {
        self.begin_settle()?;
        let mut conn = self.conn.clone();
        let moved: i64 = redis::cmd("EVAL")
            .arg(REJECT_SCRIPT)
            .arg(2)
            .arg(&self.unacked)
            .arg(&self.rejected)
            .arg(&self.payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.settle_failed(e))?;
        if moved == 0 {
            return Err(BrokerError::NotFound(self.unacked.clone()));
        }
        Ok(())
    }
}
