//! Consumers of the shared expiration queue.

use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::anyhow;
use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::models::job::ExpirationJob;
use crate::queue::{Consumer, Delivery};
use crate::services::batch::{BatchPolicy, Settlement};
use crate::services::metrics::{CONSUMER_THROUGHPUT_GAUGE, DELIVERIES_COUNTER};
use crate::services::revocation::{FireOutcome, RevocationScheduler, RevocationTask};

/// When an expiration delivery is settled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SettlementMode {
    /// As soon as the revocation is durably scheduled.
    #[default]
    OnSchedule,
    /// Only after the delete job has been published.
    OnFire,
}

impl std::fmt::Display for SettlementMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                SettlementMode::OnSchedule => "on_schedule",
                SettlementMode::OnFire => "on_fire",
            }
        )
    }
}

impl FromStr for SettlementMode {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "on_schedule" => Ok(SettlementMode::OnSchedule),
            "on_fire" => Ok(SettlementMode::OnFire),
            _ => Err(anyhow!("Invalid settlement mode: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acked,
    RejectedBatchMarker,
    RejectedDecodeFailure,
    RejectedScheduleFailure,
    /// Waiting for the revocation to fire before settling.
    Held,
    /// The revocation was cancelled; the delivery stays unacked.
    Unsettled,
}

impl DeliveryOutcome {
    fn label(self) -> &'static str {
        match self {
            DeliveryOutcome::Acked => "acked",
            DeliveryOutcome::RejectedBatchMarker => "rejected_batch_marker",
            DeliveryOutcome::RejectedDecodeFailure => "rejected_decode_failure",
            DeliveryOutcome::RejectedScheduleFailure => "rejected_schedule_failure",
            DeliveryOutcome::Held => "held",
            DeliveryOutcome::Unsettled => "unsettled",
        }
    }
}

/// One worker of the expiration pool. Owns its batch counter and throughput window.
pub struct ExpirationConsumer {
    name: Arc<str>,
    scheduler: Arc<RevocationScheduler>,
    mode: SettlementMode,
    policy: Arc<Mutex<BatchPolicy>>,
}

impl ExpirationConsumer {
    pub fn new(
        index: usize,
        scheduler: Arc<RevocationScheduler>,
        mode: SettlementMode,
        batch_size: u64,
    ) -> Self {
        Self {
            name: Arc::from(format!("consumer {index}")),
            scheduler,
            mode,
            policy: Arc::new(Mutex::new(BatchPolicy::new(batch_size))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn handle(&self, delivery: Box<dyn Delivery>) -> DeliveryOutcome {
        let started = self.scheduler.now();

        let job = match ExpirationJob::decode(delivery.payload()) {
            Ok(job) => job,
            Err(e) => {
                warn!(
                    consumer = %self.name,
                    payload = %delivery.payload(),
                    "Failed to decode expiration job: {}", e
                );
                return reject(&self.name, delivery.as_ref(), DeliveryOutcome::RejectedDecodeFailure)
                    .await;
            }
        };

        let task = RevocationTask::new(job, started);
        match self.mode {
            SettlementMode::OnSchedule => {
                if let Err(e) = self.scheduler.schedule(&task).await {
                    error!(consumer = %self.name, "Failed to schedule revocation: {}", e);
                    return reject(
                        &self.name,
                        delivery.as_ref(),
                        DeliveryOutcome::RejectedScheduleFailure,
                    )
                    .await;
                }
                settle(&self.name, &self.policy, delivery.as_ref()).await
            }
            SettlementMode::OnFire => {
                let fired = match self.scheduler.schedule_and_watch(&task).await {
                    Ok(fired) => fired,
                    Err(e) => {
                        error!(consumer = %self.name, "Failed to schedule revocation: {}", e);
                        return reject(
                            &self.name,
                            delivery.as_ref(),
                            DeliveryOutcome::RejectedScheduleFailure,
                        )
                        .await;
                    }
                };

                let name = self.name.clone();
                let policy = self.policy.clone();
                let task_id = task.id;
                tokio::spawn(async move {
                    match fired.await {
                        Ok(FireOutcome::Published) => {
                            settle(&name, &policy, delivery.as_ref()).await;
                        }
                        Ok(FireOutcome::Cancelled) | Err(_) => {
                            warn!(
                                consumer = %name,
                                "Revocation {} ended without firing, delivery left unacked",
                                task_id
                            );
                            count(&name, DeliveryOutcome::Unsettled);
                        }
                    }
                });
                count(&self.name, DeliveryOutcome::Held)
            }
        }
    }
}

#[async_trait]
impl Consumer for ExpirationConsumer {
    async fn consume(&self, delivery: Box<dyn Delivery>) {
        self.handle(delivery).await;
    }
}

fn count(consumer: &str, outcome: DeliveryOutcome) -> DeliveryOutcome {
    DELIVERIES_COUNTER
        .with_label_values(&[consumer, outcome.label()])
        .inc();
    outcome
}

async fn reject(consumer: &str, delivery: &dyn Delivery, outcome: DeliveryOutcome) -> DeliveryOutcome {
    if let Err(e) = delivery.reject().await {
        warn!(consumer = %consumer, "Failed to reject delivery: {}", e);
    }
    count(consumer, outcome)
}

/// Ack or reject according to the batch policy and report throughput at each boundary.
async fn settle(consumer: &str, policy: &Mutex<BatchPolicy>, delivery: &dyn Delivery) -> DeliveryOutcome {
    let (settlement, report) = policy
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .record();

    if let Some(report) = report {
        CONSUMER_THROUGHPUT_GAUGE
            .with_label_values(&[consumer])
            .set(report.per_second);
        info!(
            "{} consumed {} ({:.0} per second)",
            consumer, report.count, report.per_second
        );
    }

    match settlement {
        Settlement::Ack => {
            if let Err(e) = delivery.ack().await {
                warn!(consumer = %consumer, "Failed to ack delivery: {}", e);
            }
            count(consumer, DeliveryOutcome::Acked)
        }
        Settlement::Reject => {
            if let Err(e) = delivery.reject().await {
                warn!(consumer = %consumer, "Failed to reject delivery: {}", e);
            }
            count(consumer, DeliveryOutcome::RejectedBatchMarker)
        }
    }
}
