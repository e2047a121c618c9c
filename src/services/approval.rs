//! Approval decisions and the fan-out of sync and expiration jobs.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::db::store::{AnnouncementStore, StoreError};
use crate::models::announcement::{Announcement, AnnouncementStatus, Device};
use crate::models::job::{ExpirationJob, OutboundJob, SyncJob};
use crate::queue::BrokerError;
use crate::services::outbox::{DispatchError, OutboxDispatcher};

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("announcement {0} not found")]
    NotFound(i32),

    #[error("announcement {0} has no devices assigned")]
    NoDevices(i32),

    #[error("announcement {id} is {status}, expected waiting_for_approval")]
    InvalidStatus { id: i32, status: AnnouncementStatus },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to encode job: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to publish to {queue}: {source}")]
    Publish { queue: String, source: BrokerError },
}

impl From<DispatchError> for ApprovalError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Store(e) => ApprovalError::Store(e),
            DispatchError::Publish { queue, source } => ApprovalError::Publish { queue, source },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalOutcome {
    pub announcement_id: i32,
    pub status: AnnouncementStatus,
    /// Jobs recorded in the outbox for this decision.
    pub jobs: usize,
    /// Entries of this announcement published right after the decision.
    pub dispatched: usize,
}

pub struct ApprovalService {
    store: Arc<dyn AnnouncementStore>,
    dispatcher: Arc<OutboxDispatcher>,
}

impl ApprovalService {
    pub fn new(store: Arc<dyn AnnouncementStore>, dispatcher: Arc<OutboxDispatcher>) -> Self {
        Self { store, dispatcher }
    }

    /// Record an approval decision.
    ///
    /// Rejection only changes the status. Approval also records one append job
    /// and one expiration job per device and publishes them. If publishing fails
    /// the status stays changed and the jobs wait in the outbox.
    pub async fn approve(&self, id: i32, approved: bool) -> Result<ApprovalOutcome, ApprovalError> {
        let announcement = self
            .store
            .find_announcement(id)
            .await?
            .ok_or(ApprovalError::NotFound(id))?;

        let devices = self.store.devices_for_announcement(id).await?;
        if devices.is_empty() {
            return Err(ApprovalError::NoDevices(id));
        }

        if !announcement.status.awaits_decision() {
            return Err(ApprovalError::InvalidStatus {
                id,
                status: announcement.status,
            });
        }

        let from = AnnouncementStatus::WaitingForApproval;
        let to = AnnouncementStatus::after_decision(approved);

        if !approved {
            if !self.store.update_announcement_status(id, from, to).await? {
                return Err(self.conflict(id).await);
            }
            info!("Announcement {} rejected", id);
            return Ok(ApprovalOutcome {
                announcement_id: id,
                status: to,
                jobs: 0,
                dispatched: 0,
            });
        }

        let jobs = fan_out(&announcement, &devices)?;
        if !self.store.record_approval(id, from, to, &jobs).await? {
            return Err(self.conflict(id).await);
        }
        info!(
            "Announcement {} approved for {} device(s), {} job(s) queued",
            id,
            devices.len(),
            jobs.len()
        );

        let dispatched = self.dispatcher.dispatch_announcement(id).await?;
        Ok(ApprovalOutcome {
            announcement_id: id,
            status: to,
            jobs: jobs.len(),
            dispatched,
        })
    }

    /// Error for a status that changed between the read and the write.
    async fn conflict(&self, id: i32) -> ApprovalError {
        match self.store.find_announcement(id).await {
            Ok(Some(current)) => ApprovalError::InvalidStatus {
                id,
                status: current.status,
            },
            Ok(None) => ApprovalError::NotFound(id),
            Err(e) => ApprovalError::Store(e),
        }
    }
}

/// One append job and one expiration job per device.
pub fn fan_out(
    announcement: &Announcement,
    devices: &[Device],
) -> serde_json::Result<Vec<OutboundJob>> {
    let append = SyncJob::append(announcement.media.clone(), announcement.filename.clone());
    let mut jobs = Vec::with_capacity(devices.len() * 2);
    for device in devices {
        jobs.push(OutboundJob::sync(device.id, &append)?);
        jobs.push(OutboundJob::expiration(&ExpirationJob {
            image_url: announcement.media.clone(),
            filename: announcement.filename.clone(),
            device_id: device.id,
            expiration_time: announcement.lifetime_secs(),
        })?);
    }
    Ok(jobs)
}
