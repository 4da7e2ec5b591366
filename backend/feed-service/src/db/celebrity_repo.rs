//! Posts from high-follower authors, stored once and pulled at read time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::CelebrityPostEntry;
use crate::services::feed::PageToken;

#[async_trait]
pub trait CelebrityPostStore: Send + Sync {
    /// Idempotent per (author_id, post_id).
    async fn insert(&self, entry: &CelebrityPostEntry) -> Result<()>;

    /// Newest posts of one author created at or after `since`, in feed order,
    /// strictly after `before` when given.
    async fn recent_by_author(
        &self,
        author_id: Uuid,
        limit: usize,
        since: DateTime<Utc>,
        before: Option<&PageToken>,
    ) -> Result<Vec<CelebrityPostEntry>>;
}

pub struct PgCelebrityPostStore {
    pool: PgPool,
}

impl PgCelebrityPostStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CelebrityPostStore for PgCelebrityPostStore {
    async fn insert(&self, entry: &CelebrityPostEntry) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO celebrity_posts (
                author_id, post_id, content, created_at, engagement_score,
                like_count, comment_count, share_count, inserted_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (author_id, post_id) DO NOTHING
            "#,
        )
        .bind(entry.author_id)
        .bind(entry.post_id)
        .bind(&entry.content)
        .bind(entry.created_at)
        .bind(entry.engagement_score)
        .bind(entry.like_count.min(i32::MAX as u32) as i32)
        .bind(entry.comment_count.min(i32::MAX as u32) as i32)
        .bind(entry.share_count.min(i32::MAX as u32) as i32)
        .bind(entry.inserted_at)
        .execute(&self.pool)
        .await?;

        debug!(
            post_id = %entry.post_id,
            author_id = %entry.author_id,
            inserted = result.rows_affected(),
            "Celebrity post stored"
        );
        Ok(())
    }

    async fn recent_by_author(
        &self,
        author_id: Uuid,
        limit: usize,
        since: DateTime<Utc>,
        before: Option<&PageToken>,
    ) -> Result<Vec<CelebrityPostEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT author_id, post_id, content, created_at, engagement_score,
                   like_count, comment_count, share_count, inserted_at
            FROM celebrity_posts
            WHERE author_id = $1
              AND created_at >= $2
              AND (
                  $3::timestamptz IS NULL
                  OR created_at < $3
                  OR (created_at = $3 AND post_id > $4)
              )
            ORDER BY created_at DESC, post_id ASC
            LIMIT $5
            "#,
        )
        .bind(author_id)
        .bind(since)
        .bind(before.map(|t| t.created_at))
        .bind(before.map(|t| t.post_id))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(CelebrityPostEntry {
                    author_id: row.try_get("author_id")?,
                    post_id: row.try_get("post_id")?,
                    content: row.try_get("content")?,
                    created_at: row.try_get("created_at")?,
                    engagement_score: row.try_get("engagement_score")?,
                    like_count: row.try_get::<i32, _>("like_count")?.max(0) as u32,
                    comment_count: row.try_get::<i32, _>("comment_count")?.max(0) as u32,
                    share_count: row.try_get::<i32, _>("share_count")?.max(0) as u32,
                    inserted_at: row.try_get("inserted_at")?,
                })
            })
            .collect::<std::result::Result<Vec<_>, sqlx::Error>>()
            .map_err(AppError::from)
    }
}
