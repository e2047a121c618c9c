use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Shared queue carrying scheduled revocations for every device.
pub const EXPIRATION_QUEUE: &str = "expiration-device";

/// Per-device queue carrying append/delete instructions.
pub fn sync_queue_name(device_id: i32) -> String {
    format!("sync-device-{device_id}")
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncOperation {
    Append,
    Delete,
}

impl std::fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                SyncOperation::Append => "append",
                SyncOperation::Delete => "delete",
            }
        )
    }
}

/// Instruction for a single device's display queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncJob {
    pub operation: SyncOperation,
    pub image_url: String,
    pub filename: String,
}

impl SyncJob {
    pub fn append(image_url: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            operation: SyncOperation::Append,
            image_url: image_url.into(),
            filename: filename.into(),
        }
    }

    pub fn delete(image_url: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            operation: SyncOperation::Delete,
            image_url: image_url.into(),
            filename: filename.into(),
        }
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Scheduled revocation of a device's content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExpirationJob {
    pub image_url: String,
    pub filename: String,
    pub device_id: i32,
    /// Seconds between the start of processing and the revocation.
    pub expiration_time: u64,
}

impl ExpirationJob {
    pub fn decode(payload: &str) -> serde_json::Result<Self> {
        serde_json::from_str(payload)
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Delete instruction emitted when this job fires.
    pub fn revocation(&self) -> SyncJob {
        SyncJob::delete(self.image_url.clone(), self.filename.clone())
    }

    pub fn sync_queue(&self) -> String {
        sync_queue_name(self.device_id)
    }
}

/// A payload bound for a named queue, not yet published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundJob {
    pub queue: String,
    pub payload: String,
}

impl OutboundJob {
    pub fn sync(device_id: i32, job: &SyncJob) -> serde_json::Result<Self> {
        Ok(Self {
            queue: sync_queue_name(device_id),
            payload: job.encode()?,
        })
    }

    pub fn expiration(job: &ExpirationJob) -> serde_json::Result<Self> {
        Ok(Self {
            queue: EXPIRATION_QUEUE.to_string(),
            payload: job.encode()?,
        })
    }
}

/// Row of the `sync_outbox` table.
#[derive(Debug, Clone, FromRow)]
pub struct OutboxEntry {
    pub id: i64,
    pub announcement_id: i32,
    pub queue_name: String,
    pub payload: String,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}
