//! In-memory announcement store used by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::store::{AnnouncementStore, StoreError};
use crate::models::announcement::{Announcement, AnnouncementStatus, Device};
use crate::models::job::{OutboundJob, OutboxEntry};

#[derive(Debug, Clone)]
pub struct OutboxRow {
    pub entry: OutboxEntry,
    pub claimed_until: Option<DateTime<Utc>>,
    pub dispatched_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Tables {
    announcements: HashMap<i32, Announcement>,
    assignments: HashMap<i32, Vec<Device>>,
    outbox: Vec<OutboxRow>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn with_announcement(id: i32, duration: i32, device_ids: &[i32]) -> Self {
        let store = Self::default();
        store.add_announcement(id, duration, device_ids);
        store
    }

    /// Insert an announcement waiting for approval, assigned to `device_ids`.
    pub fn add_announcement(&self, id: i32, duration: i32, device_ids: &[i32]) {
        let now = Utc::now();
        let mut tables = self.tables.lock().unwrap();
        tables.announcements.insert(
            id,
            Announcement {
                id,
                title: format!("Announcement {id}"),
                media: format!("https://cdn.example/announcements/{id}.png"),
                filename: format!("{id}.png"),
                status: AnnouncementStatus::WaitingForApproval,
                notes: String::new(),
                duration,
                rejection_notes: None,
                approved_at: None,
                created_at: now,
                updated_at: now,
            },
        );
        tables.assignments.insert(
            id,
            device_ids
                .iter()
                .map(|&device_id| Device {
                    id: device_id,
                    machine_id: format!("machine-{device_id}"),
                    name: format!("Screen {device_id}"),
                    description: String::new(),
                    created_at: now,
                    updated_at: now,
                })
                .collect(),
        );
    }

    pub fn announcement(&self, id: i32) -> Option<Announcement> {
        self.tables.lock().unwrap().announcements.get(&id).cloned()
    }

    pub fn set_status(&self, id: i32, status: AnnouncementStatus) {
        if let Some(announcement) = self.tables.lock().unwrap().announcements.get_mut(&id) {
            announcement.status = status;
        }
    }

    pub fn outbox(&self) -> Vec<OutboxRow> {
        self.tables.lock().unwrap().outbox.clone()
    }

    /// Entries not yet dispatched.
    pub fn pending(&self) -> Vec<OutboxEntry> {
        self.outbox()
            .into_iter()
            .filter(|row| row.dispatched_at.is_none())
            .map(|row| row.entry)
            .collect()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writes(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolClosed));
        }
        Ok(())
    }
}

#[async_trait]
impl AnnouncementStore for MemoryStore {
    async fn find_announcement(&self, id: i32) -> Result<Option<Announcement>, StoreError> {
        Ok(self.announcement(id))
    }

    async fn devices_for_announcement(
        &self,
        announcement_id: i32,
    ) -> Result<Vec<Device>, StoreError> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .assignments
            .get(&announcement_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn update_announcement_status(
        &self,
        id: i32,
        from: AnnouncementStatus,
        to: AnnouncementStatus,
    ) -> Result<bool, StoreError> {
        self.check_writes()?;
        let mut tables = self.tables.lock().unwrap();
        match tables.announcements.get_mut(&id) {
            Some(announcement) if announcement.status == from => {
                announcement.status = to;
                announcement.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_approval(
        &self,
        id: i32,
        from: AnnouncementStatus,
        to: AnnouncementStatus,
        jobs: &[OutboundJob],
    ) -> Result<bool, StoreError> {
        self.check_writes()?;
        let mut tables = self.tables.lock().unwrap();
        let now = Utc::now();
        match tables.announcements.get_mut(&id) {
            Some(announcement) if announcement.status == from => {
                announcement.status = to;
                announcement.approved_at = Some(now);
                announcement.updated_at = now;
            }
            _ => return Ok(false),
        }

        for job in jobs {
            let next_id = tables.outbox.len() as i64 + 1;
            tables.outbox.push(OutboxRow {
                entry: OutboxEntry {
                    id: next_id,
                    announcement_id: id,
                    queue_name: job.queue.clone(),
                    payload: job.payload.clone(),
                    attempts: 0,
                    last_error: None,
                    created_at: now,
                },
                claimed_until: None,
                dispatched_at: None,
            });
        }
        Ok(true)
    }

    async fn claim_outbox(
        &self,
        limit: i64,
        lease: chrono::Duration,
        announcement_id: Option<i32>,
    ) -> Result<Vec<OutboxEntry>, StoreError> {
        let mut tables = self.tables.lock().unwrap();
        let now = Utc::now();
        let mut claimed = Vec::new();
        for row in tables.outbox.iter_mut() {
            if claimed.len() as i64 >= limit {
                break;
            }
            let free = row.claimed_until.map_or(true, |until| until < now);
            let wanted = announcement_id.map_or(true, |id| row.entry.announcement_id == id);
            if row.dispatched_at.is_none() && free && wanted {
                row.claimed_until = Some(now + lease);
                claimed.push(row.entry.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_dispatched(&self, id: i64) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().unwrap();
        if let Some(row) = tables.outbox.iter_mut().find(|row| row.entry.id == id) {
            row.dispatched_at = Some(Utc::now());
            row.claimed_until = None;
        }
        Ok(())
    }

    async fn mark_failed(&self, id: i64, error: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().unwrap();
        if let Some(row) = tables.outbox.iter_mut().find(|row| row.entry.id == id) {
            row.entry.attempts += 1;
            row.entry.last_error = Some(error.to_string());
            row.claimed_until = None;
        }
        Ok(())
    }

    async fn release_outbox(&self, ids: &[i64]) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().unwrap();
        for row in tables.outbox.iter_mut() {
            if ids.contains(&row.entry.id) {
                row.claimed_until = None;
            }
        }
        Ok(())
    }
}
