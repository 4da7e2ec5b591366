use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::warn;
use uuid::Uuid;

use super::{PostStore, SocialGraph, UserDirectory};
use crate::error::{AppError, Result};
use crate::models::{Post, UserProfile, UserRef, Visibility};
use crate::services::feed::PageToken;

pub struct PgPostStore {
    pool: PgPool,
}

impl PgPostStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn map_post(row: &PgRow) -> std::result::Result<Post, sqlx::Error> {
    let visibility: String = row.try_get("visibility")?;
    let visibility = visibility.parse::<Visibility>().unwrap_or_else(|e| {
        warn!(error = %e, "Unknown post visibility, treating as private");
        Visibility::Private
    });

    Ok(Post {
        id: row.try_get("id")?,
        author_id: row.try_get("author_id")?,
        content: row.try_get("content")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        is_deleted: row.try_get("is_deleted")?,
        like_count: row.try_get::<i32, _>("like_count")?.max(0) as u32,
        comment_count: row.try_get::<i32, _>("comment_count")?.max(0) as u32,
        share_count: row.try_get::<i32, _>("share_count")?.max(0) as u32,
        engagement_score: row.try_get("engagement_score")?,
        visibility,
    })
}

#[async_trait]
impl PostStore for PgPostStore {
    async fn get_post(&self, post_id: Uuid) -> Result<Option<Post>> {
        let row = sqlx::query(
            r#"
            SELECT id, author_id, content, created_at, updated_at, is_deleted,
                   like_count, comment_count, share_count, engagement_score, visibility
            FROM posts
            WHERE id = $1
            "#,
        )
        .bind(post_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Database(format!("get_post failed: {}", e)))?;

        Ok(row.as_ref().map(map_post).transpose()?)
    }

    async fn get_posts_by_author(
        &self,
        author_id: Uuid,
        limit: usize,
        cursor: Option<String>,
    ) -> Result<(Vec<Post>, Option<String>)> {
        let after = PageToken::parse_optional(cursor.as_deref())?;

        let rows = sqlx::query(
            r#"
            SELECT id, author_id, content, created_at, updated_at, is_deleted,
                   like_count, comment_count, share_count, engagement_score, visibility
            FROM posts
            WHERE author_id = $1
              AND is_deleted = FALSE
              AND visibility <> 'private'
              AND (
                  $2::timestamptz IS NULL
                  OR created_at < $2
                  OR (created_at = $2 AND id > $3)
              )
            ORDER BY created_at DESC, id ASC
            LIMIT $4
            "#,
        )
        .bind(author_id)
        .bind(after.map(|t| t.created_at))
        .bind(after.map(|t| t.post_id))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::Database(format!("get_posts_by_author failed: {}", e)))?;

        let posts = rows
            .iter()
            .map(map_post)
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let next = if posts.len() == limit {
            posts
                .last()
                .map(|p| PageToken::new(p.created_at, p.id).encode())
        } else {
            None
        };

        Ok((posts, next))
    }
}

pub struct PgSocialGraph {
    pool: PgPool,
}

impl PgSocialGraph {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn map_user_ref(row: &PgRow) -> std::result::Result<UserRef, sqlx::Error> {
    Ok(UserRef {
        user_id: row.try_get("id")?,
        username: row.try_get("username")?,
        is_celebrity: row.try_get("is_celebrity")?,
        follower_count: row.try_get("follower_count")?,
        is_active: row.try_get("is_active")?,
    })
}

#[async_trait]
impl SocialGraph for PgSocialGraph {
    async fn get_followers(
        &self,
        user_id: Uuid,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<UserRef>> {
        let rows = sqlx::query(
            r#"
            SELECT u.id, u.username, u.is_celebrity, u.follower_count, u.is_active
            FROM follows f
            JOIN users u ON u.id = f.follower_id
            WHERE f.following_id = $1
            ORDER BY f.created_at ASC, f.follower_id ASC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(user_id)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::Database(format!("get_followers failed: {}", e)))?;

        Ok(rows
            .iter()
            .map(map_user_ref)
            .collect::<std::result::Result<Vec<_>, _>>()?)
    }

    async fn get_following(
        &self,
        user_id: Uuid,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<UserRef>> {
        let rows = sqlx::query(
            r#"
            SELECT u.id, u.username, u.is_celebrity, u.follower_count, u.is_active
            FROM follows f
            JOIN users u ON u.id = f.following_id
            WHERE f.follower_id = $1
            ORDER BY f.created_at ASC, f.following_id ASC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(user_id)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::Database(format!("get_following failed: {}", e)))?;

        Ok(rows
            .iter()
            .map(map_user_ref)
            .collect::<std::result::Result<Vec<_>, _>>()?)
    }

    async fn is_following(&self, follower_id: Uuid, followee_id: Uuid) -> Result<bool> {
        let result: Option<(i32,)> = sqlx::query_as(
            "SELECT 1 FROM follows WHERE follower_id = $1 AND following_id = $2 LIMIT 1",
        )
        .bind(follower_id)
        .bind(followee_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Database(format!("is_following check failed: {}", e)))?;

        Ok(result.is_some())
    }
}

fn map_user_profile(row: &PgRow) -> std::result::Result<UserProfile, sqlx::Error> {
    Ok(UserProfile {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        is_celebrity: row.try_get("is_celebrity")?,
        follower_count: row.try_get("follower_count")?,
        is_active: row.try_get("is_active")?,
    })
}

pub struct PgUserDirectory {
    pool: PgPool,
}

impl PgUserDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserDirectory for PgUserDirectory {
    async fn get_user_by_id(&self, user_id: Uuid) -> Result<Option<UserProfile>> {
        let row = sqlx::query(
            r#"
            SELECT id, username, is_celebrity, follower_count, is_active
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Database(format!("get_user_by_id failed: {}", e)))?;

        Ok(row.as_ref().map(map_user_profile).transpose()?)
    }
}
