use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "announcement_status", rename_all = "snake_case")]
pub enum AnnouncementStatus {
    WaitingForApproval,
    WaitingForSync,
    Active,
    Done,
    Canceled,
    Rejected,
}

impl AnnouncementStatus {
    /// Status an announcement moves to once an approval decision is made.
    pub fn after_decision(approved: bool) -> Self {
        if approved {
            AnnouncementStatus::WaitingForSync
        } else {
            AnnouncementStatus::Rejected
        }
    }

    pub fn awaits_decision(&self) -> bool {
        *self == AnnouncementStatus::WaitingForApproval
    }
}

impl std::fmt::Display for AnnouncementStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                AnnouncementStatus::WaitingForApproval => "waiting_for_approval",
                AnnouncementStatus::WaitingForSync => "waiting_for_sync",
                AnnouncementStatus::Active => "active",
                AnnouncementStatus::Done => "done",
                AnnouncementStatus::Canceled => "canceled",
                AnnouncementStatus::Rejected => "rejected",
            }
        )
    }
}

impl std::str::FromStr for AnnouncementStatus {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting_for_approval" => Ok(AnnouncementStatus::WaitingForApproval),
            "waiting_for_sync" => Ok(AnnouncementStatus::WaitingForSync),
            "active" => Ok(AnnouncementStatus::Active),
            "done" => Ok(AnnouncementStatus::Done),
            "canceled" => Ok(AnnouncementStatus::Canceled),
            "rejected" => Ok(AnnouncementStatus::Rejected),
            _ => Err(anyhow::anyhow!("Unknown announcement status: {s}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Announcement {
    pub id: i32,
    pub title: String,
    /// Public URL of the uploaded media.
    pub media: String,
    pub filename: String,
    pub status: AnnouncementStatus,
    pub notes: String,
    /// Display lifetime in seconds.
    pub duration: i32,
    pub rejection_notes: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Announcement {
    /// Lifetime in whole seconds; negative durations clamp to zero.
    pub fn lifetime_secs(&self) -> u64 {
        u64::try_from(self.duration).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Device {
    pub id: i32,
    pub machine_id: String,
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
