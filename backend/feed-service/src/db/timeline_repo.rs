//! Per-recipient timeline rows written by push fan-out.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::UserTimelineEntry;
use crate::services::feed::PageToken;

#[async_trait]
pub trait TimelineStore: Send + Sync {
    /// Write all entries in one atomic statement. Rows keyed by an existing
    /// (user_id, post_id) are left untouched. Returns the number of new rows.
    async fn insert_batch(&self, entries: &[UserTimelineEntry]) -> Result<u64>;

    /// Rows of one timeline in `(created_at desc, post_id asc)` order,
    /// strictly after `after` when given.
    async fn fetch_page(
        &self,
        user_id: Uuid,
        after: Option<&PageToken>,
        limit: usize,
    ) -> Result<Vec<UserTimelineEntry>>;
}

pub struct PgTimelineStore {
    pool: PgPool,
}

impl PgTimelineStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn map_timeline_row(row: &PgRow) -> std::result::Result<UserTimelineEntry, sqlx::Error> {
    Ok(UserTimelineEntry {
        user_id: row.try_get("user_id")?,
        post_id: row.try_get("post_id")?,
        author_id: row.try_get("author_id")?,
        content: row.try_get("content")?,
        created_at: row.try_get("created_at")?,
        engagement_score: row.try_get("engagement_score")?,
        like_count: row.try_get::<i32, _>("like_count")?.max(0) as u32,
        comment_count: row.try_get::<i32, _>("comment_count")?.max(0) as u32,
        share_count: row.try_get::<i32, _>("share_count")?.max(0) as u32,
        inserted_at: row.try_get("inserted_at")?,
    })
}

#[async_trait]
impl TimelineStore for PgTimelineStore {
    async fn insert_batch(&self, entries: &[UserTimelineEntry]) -> Result<u64> {
        if entries.is_empty() {
            return Ok(0);
        }

        let mut user_ids = Vec::with_capacity(entries.len());
        let mut post_ids = Vec::with_capacity(entries.len());
        let mut author_ids = Vec::with_capacity(entries.len());
        let mut contents = Vec::with_capacity(entries.len());
        let mut created: Vec<DateTime<Utc>> = Vec::with_capacity(entries.len());
        let mut scores = Vec::with_capacity(entries.len());
        let mut likes = Vec::with_capacity(entries.len());
        let mut comments = Vec::with_capacity(entries.len());
        let mut shares = Vec::with_capacity(entries.len());
        let mut inserted: Vec<DateTime<Utc>> = Vec::with_capacity(entries.len());

        for entry in entries {
            user_ids.push(entry.user_id);
            post_ids.push(entry.post_id);
            author_ids.push(entry.author_id);
            contents.push(entry.content.clone());
            created.push(entry.created_at);
            scores.push(entry.engagement_score);
            likes.push(entry.like_count.min(i32::MAX as u32) as i32);
            comments.push(entry.comment_count.min(i32::MAX as u32) as i32);
            shares.push(entry.share_count.min(i32::MAX as u32) as i32);
            inserted.push(entry.inserted_at);
        }

        let result = sqlx::query(
            r#"
            INSERT INTO user_timeline (
                user_id, post_id, author_id, content, created_at,
                engagement_score, like_count, comment_count, share_count, inserted_at
            )
            SELECT * FROM UNNEST(
                $1::uuid[], $2::uuid[], $3::uuid[], $4::text[], $5::timestamptz[],
                $6::float8[], $7::int4[], $8::int4[], $9::int4[], $10::timestamptz[]
            )
            ON CONFLICT (user_id, post_id) DO NOTHING
            "#,
        )
        .bind(&user_ids)
        .bind(&post_ids)
        .bind(&author_ids)
        .bind(&contents)
        .bind(&created)
        .bind(&scores)
        .bind(&likes)
        .bind(&comments)
        .bind(&shares)
        .bind(&inserted)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Timeline batch insert of {} rows failed: {}", entries.len(), e);
            AppError::Database(format!("timeline batch insert failed: {}", e))
        })?;

        debug!(
            requested = entries.len(),
            inserted = result.rows_affected(),
            "Timeline batch written"
        );
        Ok(result.rows_affected())
    }

    async fn fetch_page(
        &self,
        user_id: Uuid,
        after: Option<&PageToken>,
        limit: usize,
    ) -> Result<Vec<UserTimelineEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, post_id, author_id, content, created_at,
                   engagement_score, like_count, comment_count, share_count, inserted_at
            FROM user_timeline
            WHERE user_id = $1
              AND (
                  $2::timestamptz IS NULL
                  OR created_at < $2
                  OR (created_at = $2 AND post_id > $3)
              )
            ORDER BY created_at DESC, post_id ASC
            LIMIT $4
            "#,
        )
        .bind(user_id)
        .bind(after.map(|t| t.created_at))
        .bind(after.map(|t| t.post_id))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(map_timeline_row)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(AppError::from)
    }
}
