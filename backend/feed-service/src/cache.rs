//! Redis-backed cache layer shared by the fan-out workers and the feed reader
//!
//! Three kinds of entries:
//! - Feed result cache: first page of a user's ranked feed - TTL: 60 seconds
//! - Recent timeline items: bounded sorted set per recipient, written through by workers
//! - Affinity scores: (viewer, author) heuristic, refreshed hourly
//!
//! Cache keys follow the pattern:
//! - v1:feed:{user_id} → HASH page size → serialized CachedFeed
//! - v1:timeline:{user_id} → ZSET post_id scored by creation time (ms)
//! - v1:affinity:{viewer_id}:{author_id} → f64
//! - v1:feed_cursor:{user_id} → serialized FeedCursor

use crate::error::{AppError, Result};
use crate::models::{FeedCursor, FeedItem};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Cache schema version - increment when changing key formats
pub const CACHE_VERSION: u32 = 1;

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Feed result cache TTL in seconds
    pub feed_ttl: u64,
    /// Recent timeline sorted-set TTL in seconds
    pub timeline_ttl: u64,
    /// Max items kept in a recipient's recent timeline set
    pub max_timeline_items: usize,
    /// Affinity score TTL in seconds (1 hour)
    pub affinity_ttl: u64,
    /// Capacity of the asynchronous cache update queue
    pub update_queue_capacity: usize,
    /// Retries per cache update before it is dropped
    pub update_max_retries: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            feed_ttl: 60,
            timeline_ttl: 3600,
            max_timeline_items: 500,
            affinity_ttl: 3600,
            update_queue_capacity: 1024,
            update_max_retries: 2,
        }
    }
}

/// Cache key builder
pub struct CacheKey;

impl CacheKey {
    /// One hash per user; fields are page sizes, so a single DEL drops them all
    pub fn feed(user_id: Uuid) -> String {
        format!("v{}:feed:{}", CACHE_VERSION, user_id)
    }

    pub fn timeline(user_id: Uuid) -> String {
        format!("v{}:timeline:{}", CACHE_VERSION, user_id)
    }

    pub fn affinity(viewer_id: Uuid, author_id: Uuid) -> String {
        format!("v{}:affinity:{}:{}", CACHE_VERSION, viewer_id, author_id)
    }

    pub fn read_position(user_id: Uuid) -> String {
        format!("v{}:feed_cursor:{}", CACHE_VERSION, user_id)
    }
}

/// Cached first page of a feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedFeed {
    pub items: Vec<FeedItem>,
    pub next_page_token: Option<String>,
    pub has_more: bool,
    pub cached_at: i64,
}

impl CachedFeed {
    /// Every page size in a user's hash shares one key TTL, so each page also
    /// ages out on its own clock.
    pub fn is_fresh(&self, ttl_secs: u64, now: DateTime<Utc>) -> bool {
        now.timestamp() - self.cached_at < ttl_secs as i64
    }
}

/// Cache operations consumed by the worker (write-through) and the feed reader (read-through).
#[async_trait]
pub trait FeedCacheStore: Send + Sync {
    async fn get_feed(&self, user_id: Uuid, limit: usize) -> Result<Option<CachedFeed>>;

    async fn set_feed(&self, user_id: Uuid, limit: usize, feed: &CachedFeed) -> Result<()>;

    /// Drop every cached page size of each user's feed
    async fn invalidate_feeds(&self, user_ids: &[Uuid]) -> Result<()>;

    /// Add a post to each recipient's recent set, trimmed to the newest N, with TTL
    async fn push_recent(
        &self,
        recipients: &[Uuid],
        post_id: Uuid,
        created_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Newest first, limited to posts created after `since` when given
    async fn recent_items(
        &self,
        user_id: Uuid,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Uuid>>;

    async fn get_affinity(&self, viewer_id: Uuid, author_id: Uuid) -> Result<Option<f64>>;

    async fn set_affinity(&self, viewer_id: Uuid, author_id: Uuid, score: f64) -> Result<()>;

    async fn get_read_position(&self, user_id: Uuid) -> Result<Option<FeedCursor>>;

    async fn set_read_position(&self, cursor: &FeedCursor) -> Result<()>;
}

/// Feed cache layer using Redis
#[derive(Clone)]
pub struct RedisFeedCache {
    client: Arc<ConnectionManager>,
    config: CacheConfig,
}

impl RedisFeedCache {
    /// Create a new feed cache instance
    pub async fn new(redis_url: &str, config: CacheConfig) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| AppError::Internal(format!("Failed to create Redis client: {}", e)))?;

        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to create Redis connection: {}", e)))?;

        Ok(Self {
            client: Arc::new(manager),
            config,
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Ping Redis to check connection health and keep connection alive
    pub async fn ping(&self) -> Result<()> {
        redis::cmd("PING")
            .query_async::<_, String>(&mut self.conn())
            .await
            .map_err(|e| {
                warn!("Redis PING failed: {}", e);
                AppError::Cache(format!("Redis health check failed: {}", e))
            })?;
        Ok(())
    }

    fn conn(&self) -> ConnectionManager {
        self.client.as_ref().clone()
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(|e| {
                warn!("Redis GET failed for {}: {}", key, e);
                AppError::Cache(format!("Redis error: {}", e))
            })?;

        match value {
            Some(json) => match serde_json::from_str::<T>(&json) {
                Ok(parsed) => Ok(Some(parsed)),
                Err(e) => {
                    // Corrupted entry: drop it and report a miss
                    warn!(key = %key, error = %e, "Cache deserialization failed");
                    let _ = redis::cmd("DEL")
                        .arg(key)
                        .query_async::<_, ()>(&mut self.conn())
                        .await;
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    async fn set_json<T: Serialize + Sync>(&self, key: &str, value: &T, ttl: u64) -> Result<()> {
        let json = serde_json::to_string(value)
            .map_err(|e| AppError::Internal(format!("Cache serialization failed: {}", e)))?;

        redis::cmd("SETEX")
            .arg(key)
            .arg(ttl)
            .arg(&json)
            .query_async::<_, ()>(&mut self.conn())
            .await
            .map_err(|e| {
                warn!("Redis SETEX failed for {}: {}", key, e);
                AppError::Cache(format!("Redis error: {}", e))
            })?;

        Ok(())
    }
}

#[async_trait]
impl FeedCacheStore for RedisFeedCache {
    async fn get_feed(&self, user_id: Uuid, limit: usize) -> Result<Option<CachedFeed>> {
        let key = CacheKey::feed(user_id);
        let value: Option<String> = redis::cmd("HGET")
            .arg(&key)
            .arg(limit)
            .query_async(&mut self.conn())
            .await
            .map_err(|e| {
                warn!("Redis HGET failed for {}: {}", key, e);
                AppError::Cache(format!("Redis error: {}", e))
            })?;

        let Some(json) = value else {
            debug!("Cache miss for feed:{}:{}", user_id, limit);
            return Ok(None);
        };

        match serde_json::from_str::<CachedFeed>(&json) {
            Ok(feed) if feed.is_fresh(self.config.feed_ttl, Utc::now()) => {
                debug!("Cache hit for feed:{}:{}", user_id, limit);
                Ok(Some(feed))
            }
            Ok(_) => {
                debug!("Expired page for feed:{}:{}", user_id, limit);
                let _ = redis::cmd("HDEL")
                    .arg(&key)
                    .arg(limit)
                    .query_async::<_, ()>(&mut self.conn())
                    .await;
                Ok(None)
            }
            Err(e) => {
                // Corrupted entry: drop it and report a miss
                warn!(user_id = %user_id, error = %e, "Feed cache deserialization failed");
                let _ = redis::cmd("HDEL")
                    .arg(&key)
                    .arg(limit)
                    .query_async::<_, ()>(&mut self.conn())
                    .await;
                Ok(None)
            }
        }
    }

    async fn set_feed(&self, user_id: Uuid, limit: usize, feed: &CachedFeed) -> Result<()> {
        let key = CacheKey::feed(user_id);
        let json = serde_json::to_string(feed)
            .map_err(|e| AppError::Internal(format!("Cache serialization failed: {}", e)))?;

        redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(&key)
            .arg(limit)
            .arg(&json)
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(self.config.feed_ttl)
            .ignore()
            .query_async::<_, ()>(&mut self.conn())
            .await
            .map_err(|e| {
                warn!("Redis HSET failed for {}: {}", key, e);
                AppError::Cache(format!("Redis error: {}", e))
            })?;

        debug!(
            "Cached feed for {}:{} with TTL={}s",
            user_id, limit, self.config.feed_ttl
        );
        Ok(())
    }

    async fn invalidate_feeds(&self, user_ids: &[Uuid]) -> Result<()> {
        if user_ids.is_empty() {
            return Ok(());
        }

        let keys: Vec<String> = user_ids.iter().map(|u| CacheKey::feed(*u)).collect();
        let deleted: i64 = redis::cmd("DEL")
            .arg(&keys)
            .query_async(&mut self.conn())
            .await
            .map_err(|e| {
                warn!("Redis DEL failed: {}", e);
                AppError::Cache(format!("Redis error: {}", e))
            })?;

        if deleted > 0 {
            debug!("Invalidated {} cached feeds", deleted);
        }
        Ok(())
    }

    async fn push_recent(
        &self,
        recipients: &[Uuid],
        post_id: Uuid,
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        if recipients.is_empty() {
            return Ok(());
        }

        let score = created_at.timestamp_millis();
        let member = post_id.to_string();
        // Keep ranks [-N, -1] (the newest N), drop everything below
        let trim_stop = -(self.config.max_timeline_items as i64) - 1;

        let mut pipe = redis::pipe();
        for recipient in recipients {
            let key = CacheKey::timeline(*recipient);
            pipe.cmd("ZADD")
                .arg(&key)
                .arg(score)
                .arg(&member)
                .ignore()
                .cmd("ZREMRANGEBYRANK")
                .arg(&key)
                .arg(0)
                .arg(trim_stop)
                .ignore()
                .cmd("EXPIRE")
                .arg(&key)
                .arg(self.config.timeline_ttl)
                .ignore();
        }

        pipe.query_async::<_, ()>(&mut self.conn())
            .await
            .map_err(|e| {
                warn!("Redis timeline pipeline failed: {}", e);
                AppError::Cache(format!("Redis error: {}", e))
            })?;

        debug!(
            post_id = %post_id,
            recipients = recipients.len(),
            "Pushed post into recent timeline caches"
        );
        Ok(())
    }

    async fn recent_items(
        &self,
        user_id: Uuid,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Uuid>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let min = match since {
            Some(ts) => format!("({}", ts.timestamp_millis()),
            None => "-inf".to_string(),
        };
        let members: Vec<String> = redis::cmd("ZREVRANGEBYSCORE")
            .arg(CacheKey::timeline(user_id))
            .arg("+inf")
            .arg(min)
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut self.conn())
            .await?;

        Ok(members
            .iter()
            .filter_map(|m| Uuid::parse_str(m).ok())
            .collect())
    }

    async fn get_affinity(&self, viewer_id: Uuid, author_id: Uuid) -> Result<Option<f64>> {
        let value: Option<f64> = redis::cmd("GET")
            .arg(CacheKey::affinity(viewer_id, author_id))
            .query_async(&mut self.conn())
            .await?;
        Ok(value)
    }

    async fn set_affinity(&self, viewer_id: Uuid, author_id: Uuid, score: f64) -> Result<()> {
        redis::cmd("SETEX")
            .arg(CacheKey::affinity(viewer_id, author_id))
            .arg(self.config.affinity_ttl)
            .arg(score)
            .query_async::<_, ()>(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn get_read_position(&self, user_id: Uuid) -> Result<Option<FeedCursor>> {
        self.get_json(&CacheKey::read_position(user_id)).await
    }

    async fn set_read_position(&self, cursor: &FeedCursor) -> Result<()> {
        // Read positions outlive the feed cache; a week is plenty to resume from
        const READ_POSITION_TTL: u64 = 7 * 24 * 60 * 60;
        self.set_json(
            &CacheKey::read_position(cursor.user_id),
            cursor,
            READ_POSITION_TTL,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ItemOrigin;

    #[test]
    fn test_cache_config_default() {
        let config = CacheConfig::default();
        assert_eq!(config.feed_ttl, 60);
        assert_eq!(config.affinity_ttl, 3600);
        assert_eq!(config.max_timeline_items, 500);
    }

    #[test]
    fn test_cache_key_format() {
        let user = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let author = Uuid::parse_str("660e8400-e29b-41d4-a716-446655440001").unwrap();

        assert_eq!(
            CacheKey::feed(user),
            "v1:feed:550e8400-e29b-41d4-a716-446655440000"
        );
        assert_eq!(
            CacheKey::timeline(user),
            "v1:timeline:550e8400-e29b-41d4-a716-446655440000"
        );
        assert!(CacheKey::affinity(user, author).contains(&author.to_string()));
    }

    #[test]
    fn test_cached_feed_serialization() {
        let feed = CachedFeed {
            items: vec![FeedItem {
                post_id: Uuid::new_v4(),
                author_id: Uuid::new_v4(),
                content: "Test content".to_string(),
                created_at: Utc::now(),
                engagement_score: 12.0,
                like_count: 10,
                comment_count: 2,
                share_count: 1,
                origin: ItemOrigin::Pull,
                ranking_score: 0.87,
            }],
            next_page_token: Some("token".to_string()),
            has_more: true,
            cached_at: 1234567890,
        };

        let json = serde_json::to_string(&feed).unwrap();
        let deserialized: CachedFeed = serde_json::from_str(&json).unwrap();

        assert_eq!(deserialized, feed);
        assert_eq!(deserialized.items[0].origin, ItemOrigin::Pull);
    }

    fn page(cached_at: i64) -> CachedFeed {
        CachedFeed {
            items: vec![],
            next_page_token: None,
            has_more: false,
            cached_at,
        }
    }

    #[test]
    fn test_cached_page_ages_on_its_own_clock() {
        let now = Utc::now();
        assert!(page(now.timestamp() - 59).is_fresh(60, now));
        assert!(!page(now.timestamp() - 60).is_fresh(60, now));
    }

    #[tokio::test]
    async fn test_rewriting_one_page_size_does_not_extend_another() {
        let cache = crate::memory::InMemoryFeedCache::new(CacheConfig::default());
        let user = Uuid::new_v4();
        let now = Utc::now();

        // Page for limit 10 was cached two minutes ago; limit 20 is written now
        cache
            .set_feed(user, 10, &page(now.timestamp() - 120))
            .await
            .unwrap();
        cache
            .set_feed(user, 20, &page(now.timestamp()))
            .await
            .unwrap();

        assert!(cache.get_feed(user, 10).await.unwrap().is_none());
        assert!(cache.get_feed(user, 20).await.unwrap().is_some());
    }
}
