//! Announcement, device and outbox persistence.

use async_trait::async_trait;
use sqlx::PgPool;
use thiserror::Error;

use crate::models::announcement::{Announcement, AnnouncementStatus, Device};
use crate::models::job::{OutboundJob, OutboxEntry};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait AnnouncementStore: Send + Sync {
    async fn find_announcement(&self, id: i32) -> Result<Option<Announcement>, StoreError>;

    async fn devices_for_announcement(&self, announcement_id: i32)
        -> Result<Vec<Device>, StoreError>;

    /// Move an announcement from `from` to `to`. Returns false if it was not in `from`.
    async fn update_announcement_status(
        &self,
        id: i32,
        from: AnnouncementStatus,
        to: AnnouncementStatus,
    ) -> Result<bool, StoreError>;

    /// Approve an announcement and enqueue its jobs in a single transaction.
    /// Returns false, without writing anything, if it was not in `from`.
    async fn record_approval(
        &self,
        id: i32,
        from: AnnouncementStatus,
        to: AnnouncementStatus,
        jobs: &[OutboundJob],
    ) -> Result<bool, StoreError>;

    /// Claim up to `limit` undispatched entries, oldest first, for `lease`.
    /// With `announcement_id` set only that announcement's entries are claimed.
    async fn claim_outbox(
        &self,
        limit: i64,
        lease: chrono::Duration,
        announcement_id: Option<i32>,
    ) -> Result<Vec<OutboxEntry>, StoreError>;

    async fn mark_dispatched(&self, id: i64) -> Result<(), StoreError>;

    async fn mark_failed(&self, id: i64, error: &str) -> Result<(), StoreError>;

    /// Drop the claim on entries that were not attempted.
    async fn release_outbox(&self, ids: &[i64]) -> Result<(), StoreError>;
}

pub struct PgAnnouncementStore {
    pool: PgPool,
}

impl PgAnnouncementStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AnnouncementStore for PgAnnouncementStore {
    async fn find_announcement(&self, id: i32) -> Result<Option<Announcement>, StoreError> {
        let announcement = sqlx::query_as::<_, Announcement>(
            r#"SELECT "id", "title", "media", "filename", "status", "notes", "duration",
                      "rejection_notes", "approved_at", "created_at", "updated_at"
               FROM "announcement"
               WHERE "id" = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(announcement)
    }

    async fn devices_for_announcement(
        &self,
        announcement_id: i32,
    ) -> Result<Vec<Device>, StoreError> {
        let devices = sqlx::query_as::<_, Device>(
            r#"SELECT "device"."id", "device"."machine_id", "device"."name",
                      "device"."description", "device"."created_at", "device"."updated_at"
               FROM "device_announcement"
               JOIN "device" ON "device"."id" = "device_announcement"."device_id"
               WHERE "device_announcement"."announcement_id" = $1
               ORDER BY "device"."id""#,
        )
        .bind(announcement_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(devices)
    }

    async fn update_announcement_status(
        &self,
        id: i32,
        from: AnnouncementStatus,
        to: AnnouncementStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"UPDATE "announcement"
               SET "status" = $1, "updated_at" = now()
               WHERE "id" = $2 AND "status" = $3"#,
        )
        .bind(to)
        .bind(id)
        .bind(from)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_approval(
        &self,
        id: i32,
        from: AnnouncementStatus,
        to: AnnouncementStatus,
        jobs: &[OutboundJob],
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"UPDATE "announcement"
               SET "status" = $1, "approved_at" = now(), "updated_at" = now()
               WHERE "id" = $2 AND "status" = $3"#,
        )
        .bind(to)
        .bind(id)
        .bind(from)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(false);
        }

        for job in jobs {
            sqlx::query(
                "INSERT INTO sync_outbox (announcement_id, queue_name, payload)
                 VALUES ($1, $2, $3)",
            )
            .bind(id)
            .bind(&job.queue)
            .bind(&job.payload)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn claim_outbox(
        &self,
        limit: i64,
        lease: chrono::Duration,
        announcement_id: Option<i32>,
    ) -> Result<Vec<OutboxEntry>, StoreError> {
        let lease_secs = lease.num_milliseconds() as f64 / 1000.0;
        let mut entries = sqlx::query_as::<_, OutboxEntry>(
            "UPDATE sync_outbox
             SET claimed_until = now() + make_interval(secs => $2)
             WHERE id IN (
                 SELECT id FROM sync_outbox
                 WHERE dispatched_at IS NULL
                   AND (claimed_until IS NULL OR claimed_until < now())
                   AND ($3::INT IS NULL OR announcement_id = $3)
                 ORDER BY id
                 LIMIT $1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING id, announcement_id, queue_name, payload, attempts, last_error, created_at",
        )
        .bind(limit)
        .bind(lease_secs)
        .bind(announcement_id)
        .fetch_all(&self.pool)
        .await?;

        entries.sort_by_key(|entry| entry.id);
        Ok(entries)
    }

    async fn mark_dispatched(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE sync_outbox SET dispatched_at = now(), claimed_until = NULL WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(&self, id: i64, error: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE sync_outbox
             SET attempts = attempts + 1, last_error = $2, claimed_until = NULL
             WHERE id = $1",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn release_outbox(&self, ids: &[i64]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query("UPDATE sync_outbox SET claimed_until = NULL WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
