//! Scheduled revocation of device content.
//!
//! Each expiration delivery becomes a [`RevocationTask`] persisted in a
//! time-ordered [`TimerStore`]. The [`RevocationScheduler`] claims tasks once
//! they are due, publishes the delete instruction to the device's sync queue and
//! completes them. Claims carry a lease so a task claimed by a crashed worker is
//! picked up again once the lease runs out.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::models::job::{ExpirationJob, SyncOperation};
use crate::queue::Broker;
use crate::services::metrics::SYNC_JOBS_COUNTER;

const DUE_KEY: &str = "sync::revocations::due";
const CLAIMED_KEY: &str = "sync::revocations::claimed";
const TASKS_KEY: &str = "sync::revocations::tasks";
const DEAD_KEY: &str = "sync::revocations::dead";
const OUTCOME_KEY_PREFIX: &str = "sync::revocations::outcome::";

/// How long a fired or cancelled task's outcome stays readable by watchers.
const OUTCOME_TTL_SECS: u64 = 3600;

/// Move ARGV[1] from sorted set KEYS[1] to KEYS[2] with score ARGV[2].
const MOVE_SCRIPT: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 1 then
    redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
    return 1
end
return 0
"#;

/// Drop a scheduled task and record its cancelled outcome.
const CANCEL_SCRIPT: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 1 then
    redis.call('HDEL', KEYS[2], ARGV[1])
    redis.call('SET', KEYS[3], ARGV[2], 'EX', ARGV[3])
    return 1
end
return 0
"#;

/// Upper bound on the delay between two publish attempts of one task.
const MAX_RETRY_DELAY_SECS: u64 = 300;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Scheduled,
    Claimed,
    Fired,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RevocationTask {
    pub id: Uuid,
    pub job: ExpirationJob,
    pub received_at: DateTime<Utc>,
    pub due_at: DateTime<Utc>,
    pub attempts: u32,
    pub state: TaskState,
}

impl RevocationTask {
    /// Task due `job.expiration_time` seconds after `received_at`.
    pub fn new(job: ExpirationJob, received_at: DateTime<Utc>) -> Self {
        let due_at = i64::try_from(job.expiration_time)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|lifetime| received_at.checked_add_signed(lifetime))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        Self {
            id: Uuid::new_v4(),
            job,
            received_at,
            due_at,
            attempts: 0,
            state: TaskState::Scheduled,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.due_at
    }

    /// Push the task back after a failed publish, with capped exponential backoff.
    pub fn retry_later(&mut self, now: DateTime<Utc>) {
        self.attempts += 1;
        let secs = 2u64
            .saturating_pow(self.attempts)
            .min(MAX_RETRY_DELAY_SECS);
        self.due_at = now + chrono::Duration::seconds(secs as i64);
        self.state = TaskState::Scheduled;
    }
}

#[derive(Debug, Error)]
pub enum TimerStoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("corrupt revocation task: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("timer store unavailable: {0}")]
    Unavailable(String),
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Durable, time-ordered storage of pending revocations.
#[async_trait]
pub trait TimerStore: Send + Sync {
    async fn insert(&self, task: &RevocationTask) -> Result<(), TimerStoreError>;

    /// Claim up to `limit` due tasks; each claim expires after `lease`.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: chrono::Duration,
        limit: usize,
    ) -> Result<Vec<RevocationTask>, TimerStoreError>;

    /// Remove a fired task and record it as published.
    async fn complete(&self, id: Uuid) -> Result<(), TimerStoreError>;

    /// Store an updated task as scheduled again, releasing its claim.
    async fn reschedule(&self, task: &RevocationTask) -> Result<(), TimerStoreError>;

    /// Drop a task that has not been claimed and record it as cancelled.
    /// Returns whether it existed.
    async fn cancel(&self, id: Uuid) -> Result<bool, TimerStoreError>;

    /// Where each of `ids` stands, in the same order.
    async fn progress(&self, ids: &[Uuid]) -> Result<Vec<TaskProgress>, TimerStoreError>;

    /// Scheduled tasks ordered by due time.
    async fn list(&self, limit: usize) -> Result<Vec<RevocationTask>, TimerStoreError>;

    /// Scheduled plus claimed tasks.
    async fn pending(&self) -> Result<usize, TimerStoreError>;

    /// Return claims whose lease expired before `now` to the schedule.
    async fn requeue_stalled(&self, now: DateTime<Utc>) -> Result<usize, TimerStoreError>;
}

pub struct RedisTimerStore {
    conn: MultiplexedConnection,
}

impl RedisTimerStore {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }

    /// Move `id` from sorted set `from` to `to` with `score`, if it is still in `from`.
    async fn move_between(
        &self,
        conn: &mut MultiplexedConnection,
        from: &str,
        to: &str,
        id: &str,
        score: i64,
    ) -> Result<bool, TimerStoreError> {
        let moved: i64 = redis::cmd("EVAL")
            .arg(MOVE_SCRIPT)
            .arg(2)
            .arg(from)
            .arg(to)
            .arg(id)
            .arg(score)
            .query_async(conn)
            .await?;
        Ok(moved == 1)
    }

    async fn load_raw(
        &self,
        conn: &mut MultiplexedConnection,
        id: &str,
    ) -> Result<Option<String>, TimerStoreError> {
        let raw: Option<String> = redis::cmd("HGET")
            .arg(TASKS_KEY)
            .arg(id)
            .query_async(conn)
            .await?;
        Ok(raw)
    }

    /// Park an unreadable task body in the dead hash, out of the schedule.
    async fn bury(
        &self,
        conn: &mut MultiplexedConnection,
        id: &str,
        raw: &str,
    ) -> Result<(), TimerStoreError> {
        let _: () = redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(DEAD_KEY)
            .arg(id)
            .arg(raw)
            .ignore()
            .cmd("HDEL")
            .arg(TASKS_KEY)
            .arg(id)
            .ignore()
            .cmd("ZREM")
            .arg(CLAIMED_KEY)
            .arg(id)
            .ignore()
            .query_async(conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TimerStore for RedisTimerStore {
    async fn insert(&self, task: &RevocationTask) -> Result<(), TimerStoreError> {
        let mut conn = self.conn.clone();
        let raw = serde_json::to_string(task)?;
        let _: () = redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(TASKS_KEY)
            .arg(task.id.to_string())
            .arg(raw)
            .ignore()
            .cmd("ZADD")
            .arg(DUE_KEY)
            .arg(due_score(task.due_at))
            .arg(task.id.to_string())
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: chrono::Duration,
        limit: usize,
    ) -> Result<Vec<RevocationTask>, TimerStoreError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(DUE_KEY)
            .arg("-inf")
            .arg(now.timestamp_millis())
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await?;

        let lease_until = (now + lease).timestamp_millis();
        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            // Whoever moves the id out of the due set owns the task.
            if !self
                .move_between(&mut conn, DUE_KEY, CLAIMED_KEY, &id, lease_until)
                .await?
            {
                continue;
            }

            let Some(raw) = self.load_raw(&mut conn, &id).await? else {
                warn!("Revocation {} has no stored task, dropping", id);
                let _: () = redis::cmd("ZREM")
                    .arg(CLAIMED_KEY)
                    .arg(&id)
                    .query_async(&mut conn)
                    .await?;
                continue;
            };
            match serde_json::from_str::<RevocationTask>(&raw) {
                Ok(mut task) => {
                    task.state = TaskState::Claimed;
                    claimed.push(task);
                }
                Err(e) => {
                    error!("Revocation {} is unreadable, moving it to {}: {}", id, DEAD_KEY, e);
                    self.bury(&mut conn, &id, &raw).await?;
                }
            }
        }
        Ok(claimed)
    }

    async fn complete(&self, id: Uuid) -> Result<(), TimerStoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("ZREM")
            .arg(CLAIMED_KEY)
            .arg(id.to_string())
            .ignore()
            .cmd("HDEL")
            .arg(TASKS_KEY)
            .arg(id.to_string())
            .ignore()
            .cmd("SET")
            .arg(outcome_key(id))
            .arg(FireOutcome::Published.as_str())
            .arg("EX")
            .arg(OUTCOME_TTL_SECS)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn reschedule(&self, task: &RevocationTask) -> Result<(), TimerStoreError> {
        let mut conn = self.conn.clone();
        let raw = serde_json::to_string(task)?;
        let _: () = redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(TASKS_KEY)
            .arg(task.id.to_string())
            .arg(raw)
            .ignore()
            .cmd("ZADD")
            .arg(DUE_KEY)
            .arg(due_score(task.due_at))
            .arg(task.id.to_string())
            .ignore()
            .cmd("ZREM")
            .arg(CLAIMED_KEY)
            .arg(task.id.to_string())
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn cancel(&self, id: Uuid) -> Result<bool, TimerStoreError> {
        let mut conn = self.conn.clone();
        let cancelled: i64 = redis::cmd("EVAL")
            .arg(CANCEL_SCRIPT)
            .arg(3)
            .arg(DUE_KEY)
            .arg(TASKS_KEY)
            .arg(outcome_key(id))
            .arg(id.to_string())
            .arg(FireOutcome::Cancelled.as_str())
            .arg(OUTCOME_TTL_SECS)
            .query_async(&mut conn)
            .await?;
        Ok(cancelled == 1)
    }

    async fn progress(&self, ids: &[Uuid]) -> Result<Vec<TaskProgress>, TimerStoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let keys: Vec<String> = ids.iter().map(|id| outcome_key(*id)).collect();
        let fields: Vec<String> = ids.iter().map(Uuid::to_string).collect();
        let (outcomes, tasks): (Vec<Option<String>>, Vec<Option<String>>) = redis::pipe()
            .cmd("MGET")
            .arg(&keys)
            .cmd("HMGET")
            .arg(TASKS_KEY)
            .arg(&fields)
            .query_async(&mut conn)
            .await?;

        Ok(outcomes
            .into_iter()
            .zip(tasks)
            .map(|(outcome, task)| match outcome.as_deref().and_then(FireOutcome::parse) {
                Some(outcome) => TaskProgress::Ended(outcome),
                None if task.is_some() => TaskProgress::Pending,
                None => TaskProgress::Gone,
            })
            .collect())
    }

    async fn list(&self, limit: usize) -> Result<Vec<RevocationTask>, TimerStoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("ZRANGE")
            .arg(DUE_KEY)
            .arg(0)
            .arg(limit - 1)
            .query_async(&mut conn)
            .await?;

        let mut tasks = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(raw) = self.load_raw(&mut conn, &id).await? {
                tasks.push(serde_json::from_str(&raw)?);
            }
        }
        Ok(tasks)
    }

    async fn pending(&self) -> Result<usize, TimerStoreError> {
        let mut conn = self.conn.clone();
        let scheduled: usize = redis::cmd("ZCARD")
            .arg(DUE_KEY)
            .query_async(&mut conn)
            .await?;
        let claimed: usize = redis::cmd("ZCARD")
            .arg(CLAIMED_KEY)
            .query_async(&mut conn)
            .await?;
        Ok(scheduled + claimed)
    }

    async fn requeue_stalled(&self, now: DateTime<Utc>) -> Result<usize, TimerStoreError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(CLAIMED_KEY)
            .arg("-inf")
            .arg(now.timestamp_millis())
            .query_async(&mut conn)
            .await?;

        let mut requeued = 0;
        for id in ids {
            if self
                .move_between(&mut conn, CLAIMED_KEY, DUE_KEY, &id, now.timestamp_millis())
                .await?
            {
                requeued += 1;
            }
        }
        Ok(requeued)
    }
}

/// Sorted-set score of a due time: milliseconds, rounded up so a claim at a
/// whole-millisecond `now` never picks a task that is not yet due.
fn due_score(due_at: DateTime<Utc>) -> i64 {
    let millis = due_at.timestamp_millis();
    if due_at.timestamp_subsec_nanos() % 1_000_000 == 0 {
        millis
    } else {
        millis.saturating_add(1)
    }
}

fn outcome_key(id: Uuid) -> String {
    format!("{OUTCOME_KEY_PREFIX}{id}")
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub poll_interval: Duration,
    pub claim_limit: usize,
    pub lease: chrono::Duration,
}

/// How a watched task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireOutcome {
    Published,
    Cancelled,
}

impl FireOutcome {
    fn as_str(self) -> &'static str {
        match self {
            FireOutcome::Published => "published",
            FireOutcome::Cancelled => "cancelled",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "published" => Some(FireOutcome::Published),
            "cancelled" => Some(FireOutcome::Cancelled),
            _ => None,
        }
    }
}

/// Where a task stands, as seen by any scheduler sharing the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskProgress {
    /// Scheduled or claimed.
    Pending,
    Ended(FireOutcome),
    /// Neither stored nor recently ended.
    Gone,
}

pub struct RevocationScheduler {
    store: Arc<dyn TimerStore>,
    broker: Arc<dyn Broker>,
    clock: Arc<dyn Clock>,
    settings: SchedulerSettings,
    waiters: Mutex<HashMap<Uuid, oneshot::Sender<FireOutcome>>>,
    wake: Notify,
}

impl RevocationScheduler {
    pub fn new(
        store: Arc<dyn TimerStore>,
        broker: Arc<dyn Broker>,
        clock: Arc<dyn Clock>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            store,
            broker,
            clock,
            settings,
            waiters: Mutex::new(HashMap::new()),
            wake: Notify::new(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub async fn schedule(&self, task: &RevocationTask) -> Result<(), TimerStoreError> {
        self.store.insert(task).await?;
        debug!(
            "Revocation {} for device {} due at {}",
            task.id, task.job.device_id, task.due_at
        );
        self.wake.notify_one();
        Ok(())
    }

    /// Schedule a task and get notified once it fires or is cancelled, by this
    /// scheduler or any other one sharing the store.
    ///
    /// The receiver errors if the task disappears without a recorded outcome.
    pub async fn schedule_and_watch(
        &self,
        task: &RevocationTask,
    ) -> Result<oneshot::Receiver<FireOutcome>, TimerStoreError> {
        self.schedule(task).await?;
        let (tx, rx) = oneshot::channel();
        self.waiters().insert(task.id, tx);
        Ok(rx)
    }

    pub async fn cancel(&self, id: Uuid) -> Result<bool, TimerStoreError> {
        let cancelled = self.store.cancel(id).await?;
        if cancelled {
            info!("Revocation {} cancelled", id);
            self.notify(id, FireOutcome::Cancelled);
        }
        Ok(cancelled)
    }

    /// Fire every task that is due now. Returns how many delete jobs went out.
    pub async fn fire_due(&self) -> Result<usize, TimerStoreError> {
        let now = self.clock.now();
        let stalled = self.store.requeue_stalled(now).await?;
        if stalled > 0 {
            warn!("Requeued {} revocation(s) with an expired claim", stalled);
        }

        let tasks = self
            .store
            .claim_due(now, self.settings.lease, self.settings.claim_limit)
            .await?;

        let mut fired = 0;
        for task in tasks {
            if self.fire(task, now).await {
                fired += 1;
            }
        }

        if let Err(e) = self.resolve_waiters().await {
            warn!("Revocation scheduler: failed to check watched tasks: {}", e);
        }
        Ok(fired)
    }

    /// Settle local waiters from the outcomes recorded in the store.
    async fn resolve_waiters(&self) -> Result<(), TimerStoreError> {
        let ids: Vec<Uuid> = self.waiters().keys().copied().collect();
        if ids.is_empty() {
            return Ok(());
        }
        let progress = self.store.progress(&ids).await?;
        for (id, progress) in ids.into_iter().zip(progress) {
            match progress {
                TaskProgress::Pending => {}
                TaskProgress::Ended(outcome) => self.notify(id, outcome),
                TaskProgress::Gone => {
                    warn!("Revocation {} left the store without an outcome", id);
                    self.waiters().remove(&id);
                }
            }
        }
        Ok(())
    }

    /// Number of tasks this scheduler is waiting on.
    pub fn watching(&self) -> usize {
        self.waiters().len()
    }

    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Revocation scheduler started");
            loop {
                if let Err(e) = self.fire_due().await {
                    warn!("Revocation scheduler: tick failed: {}", e);
                }
                tokio::select! {
                    _ = tokio::time::sleep(self.settings.poll_interval) => {}
                    _ = self.wake.notified() => {}
                    _ = shutdown.changed() => break,
                }
            }
            info!("Revocation scheduler stopped");
        })
    }

    async fn fire(&self, mut task: RevocationTask, now: DateTime<Utc>) -> bool {
        match self.publish_revocation(&task).await {
            Ok(()) => {
                let operation = SyncOperation::Delete.to_string();
                SYNC_JOBS_COUNTER
                    .with_label_values(&[operation.as_str()])
                    .inc();
                info!(
                    "Revocation {} published delete of {} to device {}",
                    task.id, task.job.filename, task.job.device_id
                );
                if let Err(e) = self.store.complete(task.id).await {
                    // The claim lease will expire and the task fire again.
                    warn!("Revocation {}: failed to complete: {}", task.id, e);
                }
                self.notify(task.id, FireOutcome::Published);
                true
            }
            Err(e) => {
                task.retry_later(now);
                warn!(
                    "Revocation {}: publish failed (attempt {}), retrying at {}: {}",
                    task.id, task.attempts, task.due_at, e
                );
                if let Err(e) = self.store.reschedule(&task).await {
                    error!("Revocation {}: failed to reschedule: {}", task.id, e);
                }
                false
            }
        }
    }

    async fn publish_revocation(&self, task: &RevocationTask) -> anyhow::Result<()> {
        let payload = task.job.revocation().encode()?;
        let queue = self.broker.open_queue(&task.job.sync_queue()).await?;
        queue.publish(&payload).await?;
        Ok(())
    }

    fn waiters(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, oneshot::Sender<FireOutcome>>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, id: Uuid, outcome: FireOutcome) {
        if let Some(waiter) = self.waiters().remove(&id) {
            let _ = waiter.send(outcome);
        }
    }
}

#[cfg(test)]
pub mod testing {
    use std::collections::{BTreeSet, HashSet};
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    pub struct ManualClock(Mutex<DateTime<Utc>>);

    impl ManualClock {
        pub fn new(start: DateTime<Utc>) -> Arc<Self> {
            Arc::new(Self(Mutex::new(start)))
        }

        pub fn advance(&self, by: chrono::Duration) {
            *self.0.lock().unwrap() += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    #[derive(Default)]
    struct Timers {
        tasks: HashMap<Uuid, RevocationTask>,
        due: BTreeSet<(DateTime<Utc>, Uuid)>,
        claimed: HashMap<Uuid, DateTime<Utc>>,
        outcomes: HashMap<Uuid, FireOutcome>,
        unreadable: HashSet<Uuid>,
        dead: HashSet<Uuid>,
    }

    #[derive(Default)]
    pub struct MemoryTimerStore {
        timers: Mutex<Timers>,
        fail_inserts: AtomicBool,
    }

    impl MemoryTimerStore {
        pub fn fail_inserts(&self, fail: bool) {
            self.fail_inserts.store(fail, Ordering::SeqCst);
        }

        pub fn get(&self, id: Uuid) -> Option<RevocationTask> {
            self.timers.lock().unwrap().tasks.get(&id).cloned()
        }

        /// Make a stored task fail to load, as a corrupt body would.
        pub fn corrupt(&self, id: Uuid) {
            self.timers.lock().unwrap().unreadable.insert(id);
        }

        pub fn dead(&self) -> Vec<Uuid> {
            self.timers.lock().unwrap().dead.iter().copied().collect()
        }
    }

    #[async_trait]
    impl TimerStore for MemoryTimerStore {
        async fn insert(&self, task: &RevocationTask) -> Result<(), TimerStoreError> {
            if self.fail_inserts.load(Ordering::SeqCst) {
                return Err(TimerStoreError::Unavailable("inserts disabled".into()));
            }
            let mut timers = self.timers.lock().unwrap();
            timers.tasks.insert(task.id, task.clone());
            timers.due.insert((task.due_at, task.id));
            Ok(())
        }

        async fn claim_due(
            &self,
            now: DateTime<Utc>,
            lease: chrono::Duration,
            limit: usize,
        ) -> Result<Vec<RevocationTask>, TimerStoreError> {
            let mut timers = self.timers.lock().unwrap();
            let keys: Vec<(DateTime<Utc>, Uuid)> = timers
                .due
                .iter()
                .take_while(|(due_at, _)| *due_at <= now)
                .take(limit)
                .cloned()
                .collect();
            let mut claimed = Vec::new();
            for key in keys {
                timers.due.remove(&key);
                if timers.unreadable.contains(&key.1) {
                    timers.tasks.remove(&key.1);
                    timers.dead.insert(key.1);
                    continue;
                }
                timers.claimed.insert(key.1, now + lease);
                if let Some(task) = timers.tasks.get_mut(&key.1) {
                    task.state = TaskState::Claimed;
                    claimed.push(task.clone());
                }
            }
            Ok(claimed)
        }

        async fn complete(&self, id: Uuid) -> Result<(), TimerStoreError> {
            let mut timers = self.timers.lock().unwrap();
            timers.claimed.remove(&id);
            timers.tasks.remove(&id);
            timers.outcomes.insert(id, FireOutcome::Published);
            Ok(())
        }

        async fn reschedule(&self, task: &RevocationTask) -> Result<(), TimerStoreError> {
            let mut timers = self.timers.lock().unwrap();
            timers.claimed.remove(&task.id);
            timers.tasks.insert(task.id, task.clone());
            timers.due.insert((task.due_at, task.id));
            Ok(())
        }

        async fn cancel(&self, id: Uuid) -> Result<bool, TimerStoreError> {
            let mut timers = self.timers.lock().unwrap();
            let Some(key) = timers.due.iter().find(|(_, task)| *task == id).cloned() else {
                return Ok(false);
            };
            timers.due.remove(&key);
            timers.tasks.remove(&id);
            timers.outcomes.insert(id, FireOutcome::Cancelled);
            Ok(true)
        }

        async fn progress(&self, ids: &[Uuid]) -> Result<Vec<TaskProgress>, TimerStoreError> {
            let timers = self.timers.lock().unwrap();
            Ok(ids
                .iter()
                .map(|id| match timers.outcomes.get(id) {
                    Some(outcome) => TaskProgress::Ended(*outcome),
                    None if timers.tasks.contains_key(id) => TaskProgress::Pending,
                    None => TaskProgress::Gone,
                })
                .collect())
        }

        async fn list(&self, limit: usize) -> Result<Vec<RevocationTask>, TimerStoreError> {
            let timers = self.timers.lock().unwrap();
            Ok(timers
                .due
                .iter()
                .take(limit)
                .filter_map(|(_, id)| timers.tasks.get(id).cloned())
                .collect())
        }

        async fn pending(&self) -> Result<usize, TimerStoreError> {
            let timers = self.timers.lock().unwrap();
            Ok(timers.due.len() + timers.claimed.len())
        }

        async fn requeue_stalled(&self, now: DateTime<Utc>) -> Result<usize, TimerStoreError> {
            let mut timers = self.timers.lock().unwrap();
            let stalled: Vec<Uuid> = timers
                .claimed
                .iter()
                .filter(|(_, lease)| **lease <= now)
                .map(|(id, _)| *id)
                .collect();
            for id in &stalled {
                timers.claimed.remove(id);
                timers.due.insert((now, *id));
            }
            Ok(stalled.len())
        }
    }
}
