//! Fan-out job queue.
//!
//! Each job is a single row. Status, lease and version change together in one
//! conditional UPDATE, so a job always has exactly one authoritative status.
//! Claims bump `version`; every later transition must present the
//! `(lease_owner, version)` pair it was handed, otherwise it is rejected with
//! [`QueueError::LeaseLost`].

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::{ClaimToken, FanoutQueueItem, FanoutStatus, QueueStats};

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The caller's claim was superseded (lease expired and re-claimed, or job finished)
    #[error("Lease lost for job {0}")]
    LeaseLost(Uuid),

    #[error("Job not found: {0}")]
    NotFound(Uuid),

    #[error("Queue error: {0}")]
    Other(#[from] anyhow::Error),
}

#[async_trait]
pub trait FanoutQueueRepository: Send + Sync {
    /// Insert a pending job. One job per post: re-enqueueing returns the existing job.
    async fn enqueue(&self, item: &FanoutQueueItem) -> QueueResult<FanoutQueueItem>;

    /// Claim up to `limit` runnable jobs, ordered by priority desc then age.
    ///
    /// Runnable means `pending` with `available_at <= now`, or `processing`
    /// with an expired lease.
    async fn claim_batch(
        &self,
        limit: usize,
        owner: &str,
        lease_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> QueueResult<Vec<FanoutQueueItem>>;

    /// Record delivered follower positions and extend the lease.
    async fn checkpoint(
        &self,
        id: Uuid,
        token: &ClaimToken,
        progress_offset: i64,
        lease_expires_at: DateTime<Utc>,
    ) -> QueueResult<()>;

    async fn complete(&self, id: Uuid, token: &ClaimToken, now: DateTime<Utc>) -> QueueResult<()>;

    /// Back to `pending` with a new retry count, not runnable before `available_at`.
    async fn reschedule(
        &self,
        id: Uuid,
        token: &ClaimToken,
        retry_count: i32,
        available_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> QueueResult<()>;

    async fn fail(
        &self,
        id: Uuid,
        token: &ClaimToken,
        error: &str,
        now: DateTime<Utc>,
    ) -> QueueResult<()>;

    /// Hand the job back untouched (no retry consumed), runnable immediately.
    async fn release(&self, id: Uuid, token: &ClaimToken, now: DateTime<Utc>) -> QueueResult<()>;

    async fn get(&self, id: Uuid) -> QueueResult<Option<FanoutQueueItem>>;

    async fn stats(&self) -> QueueResult<QueueStats>;

    /// Delete completed jobs processed before `older_than`. Returns rows removed.
    async fn cleanup_completed(&self, older_than: DateTime<Utc>) -> QueueResult<u64>;
}

const QUEUE_COLUMNS: &str = r#"
    id, post_id, author_id, status, priority, retry_count, error_message,
    created_at, processed_at, available_at, lease_owner, lease_expires_at,
    version, progress_offset, updated_at
"#;

pub struct PgFanoutQueueRepository {
    pool: PgPool,
}

impl PgFanoutQueueRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn map_row(row: &PgRow) -> QueueResult<FanoutQueueItem> {
        let status: String = row.try_get("status")?;
        let status = status
            .parse::<FanoutStatus>()
            .map_err(|e| QueueError::Other(anyhow::anyhow!(e)))?;

        Ok(FanoutQueueItem {
            id: row.try_get("id")?,
            post_id: row.try_get("post_id")?,
            author_id: row.try_get("author_id")?,
            status,
            priority: row.try_get("priority")?,
            retry_count: row.try_get("retry_count")?,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
            processed_at: row.try_get("processed_at")?,
            available_at: row.try_get("available_at")?,
            lease_owner: row.try_get("lease_owner")?,
            lease_expires_at: row.try_get("lease_expires_at")?,
            version: row.try_get("version")?,
            progress_offset: row.try_get("progress_offset")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn fenced(id: Uuid, rows_affected: u64, action: &str) -> QueueResult<()> {
        if rows_affected == 0 {
            warn!(job_id = %id, action, "Fenced queue transition rejected");
            return Err(QueueError::LeaseLost(id));
        }
        Ok(())
    }
}

#[async_trait]
impl FanoutQueueRepository for PgFanoutQueueRepository {
    async fn enqueue(&self, item: &FanoutQueueItem) -> QueueResult<FanoutQueueItem> {
        sqlx::query(
            r#"
            INSERT INTO fanout_queue (
                id, post_id, author_id, status, priority, retry_count,
                created_at, available_at, version, progress_offset, updated_at
            ) VALUES ($1, $2, $3, 'pending', $4, 0, $5, $6, 0, 0, $5)
            ON CONFLICT (post_id) DO NOTHING
            "#,
        )
        .bind(item.id)
        .bind(item.post_id)
        .bind(item.author_id)
        .bind(item.priority)
        .bind(item.created_at)
        .bind(item.available_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert fan-out job")?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM fanout_queue WHERE post_id = $1",
            QUEUE_COLUMNS
        ))
        .bind(item.post_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to load enqueued fan-out job")?;

        let stored = Self::map_row(&row)?;
        debug!(job_id = %stored.id, post_id = %stored.post_id, "Fan-out job enqueued");
        Ok(stored)
    }

    async fn claim_batch(
        &self,
        limit: usize,
        owner: &str,
        lease_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> QueueResult<Vec<FanoutQueueItem>> {
        let rows = sqlx::query(
            r#"
            WITH candidates AS (
                SELECT id
                FROM fanout_queue
                WHERE (status = 'pending' AND available_at <= $1)
                   OR (status = 'processing' AND lease_expires_at <= $1)
                ORDER BY priority DESC, created_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE fanout_queue q
            SET status = 'processing',
                lease_owner = $3,
                lease_expires_at = $4,
                version = q.version + 1,
                updated_at = $1
            FROM candidates c
            WHERE q.id = c.id
            RETURNING q.*
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .bind(owner)
        .bind(lease_expires_at)
        .fetch_all(&self.pool)
        .await
        .context("Failed to claim fan-out jobs")?;

        let mut jobs = rows
            .iter()
            .map(Self::map_row)
            .collect::<QueueResult<Vec<_>>>()?;
        // RETURNING does not preserve the CTE order
        jobs.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });

        debug!(count = jobs.len(), owner, "Claimed fan-out jobs");
        Ok(jobs)
    }

    async fn checkpoint(
        &self,
        id: Uuid,
        token: &ClaimToken,
        progress_offset: i64,
        lease_expires_at: DateTime<Utc>,
    ) -> QueueResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE fanout_queue
            SET progress_offset = $4,
                lease_expires_at = $5,
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing' AND lease_owner = $2 AND version = $3
            "#,
        )
        .bind(id)
        .bind(&token.owner)
        .bind(token.version)
        .bind(progress_offset)
        .bind(lease_expires_at)
        .execute(&self.pool)
        .await
        .context("Failed to checkpoint fan-out job")?;

        Self::fenced(id, result.rows_affected(), "checkpoint")
    }

    async fn complete(&self, id: Uuid, token: &ClaimToken, now: DateTime<Utc>) -> QueueResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE fanout_queue
            SET status = 'completed',
                processed_at = $4,
                error_message = NULL,
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = $4
            WHERE id = $1 AND status = 'processing' AND lease_owner = $2 AND version = $3
            "#,
        )
        .bind(id)
        .bind(&token.owner)
        .bind(token.version)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to complete fan-out job")?;

        Self::fenced(id, result.rows_affected(), "complete")
    }

    async fn reschedule(
        &self,
        id: Uuid,
        token: &ClaimToken,
        retry_count: i32,
        available_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> QueueResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE fanout_queue
            SET status = 'pending',
                retry_count = $4,
                available_at = $5,
                error_message = $6,
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = $7
            WHERE id = $1 AND status = 'processing' AND lease_owner = $2 AND version = $3
            "#,
        )
        .bind(id)
        .bind(&token.owner)
        .bind(token.version)
        .bind(retry_count)
        .bind(available_at)
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to reschedule fan-out job")?;

        Self::fenced(id, result.rows_affected(), "reschedule")
    }

    async fn fail(
        &self,
        id: Uuid,
        token: &ClaimToken,
        error: &str,
        now: DateTime<Utc>,
    ) -> QueueResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE fanout_queue
            SET status = 'failed',
                processed_at = $5,
                error_message = $4,
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = $5
            WHERE id = $1 AND status = 'processing' AND lease_owner = $2 AND version = $3
            "#,
        )
        .bind(id)
        .bind(&token.owner)
        .bind(token.version)
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to mark fan-out job as failed")?;

        Self::fenced(id, result.rows_affected(), "fail")
    }

    async fn release(&self, id: Uuid, token: &ClaimToken, now: DateTime<Utc>) -> QueueResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE fanout_queue
            SET status = 'pending',
                available_at = $4,
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = $4
            WHERE id = $1 AND status = 'processing' AND lease_owner = $2 AND version = $3
            "#,
        )
        .bind(id)
        .bind(&token.owner)
        .bind(token.version)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to release fan-out job")?;

        Self::fenced(id, result.rows_affected(), "release")
    }

    async fn get(&self, id: Uuid) -> QueueResult<Option<FanoutQueueItem>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM fanout_queue WHERE id = $1",
            QUEUE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load fan-out job")?;

        row.as_ref().map(Self::map_row).transpose()
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*)::BIGINT AS count
            FROM fanout_queue
            GROUP BY status
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to compute queue stats")?;

        let mut stats = QueueStats::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("count")?;
            match status.parse::<FanoutStatus>() {
                Ok(status) => stats.record(status, count),
                Err(e) => warn!(error = %e, "Skipping unknown queue status"),
            }
        }
        Ok(stats)
    }

    async fn cleanup_completed(&self, older_than: DateTime<Utc>) -> QueueResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM fanout_queue
            WHERE status = 'completed' AND processed_at < $1
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await
        .context("Failed to clean up completed fan-out jobs")?;

        Ok(result.rows_affected())
    }
}
