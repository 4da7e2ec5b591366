//! In-process implementations of every store and collaborator trait.
//!
//! Compiled for tests and behind the `test-util` feature. Semantics mirror
//! the PostgreSQL/Redis implementations: the queue fences transitions on
//! (owner, version), timeline and celebrity writes are idempotent per key,
//! pages follow `(created_at desc, post_id asc)`.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use uuid::Uuid;

use crate::cache::{CacheConfig, CachedFeed, FeedCacheStore};
use crate::clients::{PostStore, SocialGraph, UserDirectory};
use crate::db::{CelebrityPostStore, FanoutQueueRepository, QueueError, QueueResult, TimelineStore};
use crate::error::{AppError, Result};
use crate::models::{
    CelebrityPostEntry, ClaimToken, FanoutQueueItem, FanoutStatus, FeedCursor, Post, QueueStats,
    UserProfile, UserRef, UserTimelineEntry,
};
use crate::services::feed::cursor::feed_order;
use crate::services::feed::PageToken;

/// Consume one unit of an injected failure budget.
fn take_failure(budget: &AtomicUsize) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryFanoutQueue {
    jobs: Mutex<HashMap<Uuid, FanoutQueueItem>>,
}

impl InMemoryFanoutQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<FanoutQueueItem> {
        self.jobs.lock().values().cloned().collect()
    }

    pub fn find_by_post(&self, post_id: Uuid) -> Option<FanoutQueueItem> {
        self.jobs
            .lock()
            .values()
            .find(|j| j.post_id == post_id)
            .cloned()
    }

    /// Make a delayed job runnable now (tests skip the retry delay this way).
    pub fn make_available(&self, id: Uuid, at: DateTime<Utc>) {
        if let Some(job) = self.jobs.lock().get_mut(&id) {
            job.available_at = at;
        }
    }

    fn transition<F>(&self, id: Uuid, token: &ClaimToken, apply: F) -> QueueResult<()>
    where
        F: FnOnce(&mut FanoutQueueItem),
    {
        let mut jobs = self.jobs.lock();
        let job = jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        let holds_lease = job.status == FanoutStatus::Processing
            && job.lease_owner.as_deref() == Some(token.owner.as_str())
            && job.version == token.version;
        if !holds_lease {
            return Err(QueueError::LeaseLost(id));
        }
        apply(job);
        Ok(())
    }
}

#[async_trait]
impl FanoutQueueRepository for InMemoryFanoutQueue {
    async fn enqueue(&self, item: &FanoutQueueItem) -> QueueResult<FanoutQueueItem> {
        let mut jobs = self.jobs.lock();
        if let Some(existing) = jobs.values().find(|j| j.post_id == item.post_id) {
            return Ok(existing.clone());
        }
        jobs.insert(item.id, item.clone());
        Ok(item.clone())
    }

    async fn claim_batch(
        &self,
        limit: usize,
        owner: &str,
        lease_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> QueueResult<Vec<FanoutQueueItem>> {
        let mut jobs = self.jobs.lock();

        let mut runnable: Vec<&FanoutQueueItem> = jobs
            .values()
            .filter(|j| match j.status {
                FanoutStatus::Pending => j.available_at <= now,
                FanoutStatus::Processing => j.lease_expires_at.map_or(true, |exp| exp <= now),
                _ => false,
            })
            .collect();
        runnable.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        let ids: Vec<Uuid> = runnable.iter().take(limit).map(|j| j.id).collect();

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = jobs.get_mut(&id) {
                job.status = FanoutStatus::Processing;
                job.lease_owner = Some(owner.to_string());
                job.lease_expires_at = Some(lease_expires_at);
                job.version += 1;
                job.updated_at = now;
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn checkpoint(
        &self,
        id: Uuid,
        token: &ClaimToken,
        progress_offset: i64,
        lease_expires_at: DateTime<Utc>,
    ) -> QueueResult<()> {
        self.transition(id, token, |job| {
            job.progress_offset = progress_offset;
            job.lease_expires_at = Some(lease_expires_at);
            job.updated_at = Utc::now();
        })
    }

    async fn complete(&self, id: Uuid, token: &ClaimToken, now: DateTime<Utc>) -> QueueResult<()> {
        self.transition(id, token, |job| {
            job.status = FanoutStatus::Completed;
            job.processed_at = Some(now);
            job.error_message = None;
            job.lease_owner = None;
            job.lease_expires_at = None;
            job.updated_at = now;
        })
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
        self.transition(id, token, |job| {
            job.status = FanoutStatus::Pending;
            job.retry_count = retry_count;
            job.available_at = available_at;
            job.error_message = Some(error.to_string());
            job.lease_owner = None;
            job.lease_expires_at = None;
            job.updated_at = now;
        })
    }

    async fn fail(
        &self,
        id: Uuid,
        token: &ClaimToken,
        error: &str,
        now: DateTime<Utc>,
    ) -> QueueResult<()> {
        self.transition(id, token, |job| {
            job.status = FanoutStatus::Failed;
            job.processed_at = Some(now);
            job.error_message = Some(error.to_string());
            job.lease_owner = None;
            job.lease_expires_at = None;
            job.updated_at = now;
        })
    }

    async fn release(&self, id: Uuid, token: &ClaimToken, now: DateTime<Utc>) -> QueueResult<()> {
        self.transition(id, token, |job| {
            job.status = FanoutStatus::Pending;
            job.available_at = now;
            job.lease_owner = None;
            job.lease_expires_at = None;
            job.updated_at = now;
        })
    }

    async fn get(&self, id: Uuid) -> QueueResult<Option<FanoutQueueItem>> {
        Ok(self.jobs.lock().get(&id).cloned())
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        let mut stats = QueueStats::default();
        for job in self.jobs.lock().values() {
            stats.record(job.status, 1);
        }
        Ok(stats)
    }

    async fn cleanup_completed(&self, older_than: DateTime<Utc>) -> QueueResult<u64> {
        let mut jobs = self.jobs.lock();
        let before = jobs.len();
        jobs.retain(|_, j| {
            !(j.status == FanoutStatus::Completed && j.processed_at.map_or(false, |p| p < older_than))
        });
        Ok((before - jobs.len()) as u64)
    }
}

// ---------------------------------------------------------------------------
// Timeline and celebrity stores
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryTimelineStore {
    rows: Mutex<HashMap<(Uuid, Uuid), UserTimelineEntry>>,
    write_calls: AtomicUsize,
    fail_writes: AtomicUsize,
    fail_reads: AtomicBool,
}

impl InMemoryTimelineStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` batch writes fail with a transient error.
    pub fn fail_next_writes(&self, n: usize) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    pub fn set_reads_failing(&self, failing: bool) {
        self.fail_reads.store(failing, Ordering::SeqCst);
    }

    /// Batch writes attempted so far, failed ones included.
    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    pub fn row_count(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn contains(&self, user_id: Uuid, post_id: Uuid) -> bool {
        self.rows.lock().contains_key(&(user_id, post_id))
    }

    pub fn recipients_of(&self, post_id: Uuid) -> Vec<Uuid> {
        self.rows
            .lock()
            .keys()
            .filter(|(_, p)| *p == post_id)
            .map(|(u, _)| *u)
            .collect()
    }
}

#[async_trait]
impl TimelineStore for InMemoryTimelineStore {
    async fn insert_batch(&self, entries: &[UserTimelineEntry]) -> Result<u64> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.fail_writes) {
            return Err(AppError::Database("injected timeline write failure".into()));
        }

        let mut rows = self.rows.lock();
        let mut inserted = 0;
        for entry in entries {
            rows.entry((entry.user_id, entry.post_id)).or_insert_with(|| {
                inserted += 1;
                entry.clone()
            });
        }
        Ok(inserted)
    }

    async fn fetch_page(
        &self,
        user_id: Uuid,
        after: Option<&PageToken>,
        limit: usize,
    ) -> Result<Vec<UserTimelineEntry>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(AppError::Database("injected timeline read failure".into()));
        }

        let mut page: Vec<UserTimelineEntry> = self
            .rows
            .lock()
            .values()
            .filter(|e| e.user_id == user_id)
            .filter(|e| after.map_or(true, |t| t.is_before(e.created_at, e.post_id)))
            .cloned()
            .collect();
        page.sort_by(|a, b| feed_order((a.created_at, a.post_id), (b.created_at, b.post_id)));
        page.truncate(limit);
        Ok(page)
    }
}

#[derive(Default)]
pub struct InMemoryCelebrityPostStore {
    rows: Mutex<BTreeMap<(Uuid, Uuid), CelebrityPostEntry>>,
    unavailable: AtomicBool,
}

impl InMemoryCelebrityPostStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn contains(&self, author_id: Uuid, post_id: Uuid) -> bool {
        self.rows.lock().contains_key(&(author_id, post_id))
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::ServiceUnavailable(
                "celebrity post store unavailable".into(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl CelebrityPostStore for InMemoryCelebrityPostStore {
    async fn insert(&self, entry: &CelebrityPostEntry) -> Result<()> {
        self.check()?;
        self.rows
            .lock()
            .entry((entry.author_id, entry.post_id))
            .or_insert_with(|| entry.clone());
        Ok(())
    }

    async fn recent_by_author(
        &self,
        author_id: Uuid,
        limit: usize,
        since: DateTime<Utc>,
        before: Option<&PageToken>,
    ) -> Result<Vec<CelebrityPostEntry>> {
        self.check()?;
        let mut posts: Vec<CelebrityPostEntry> = self
            .rows
            .lock()
            .values()
            .filter(|e| e.author_id == author_id && e.created_at >= since)
            .filter(|e| before.map_or(true, |t| t.is_before(e.created_at, e.post_id)))
            .cloned()
            .collect();
        posts.sort_by(|a, b| feed_order((a.created_at, a.post_id), (b.created_at, b.post_id)));
        posts.truncate(limit);
        Ok(posts)
    }
}

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryPostStore {
    posts: Mutex<HashMap<Uuid, Post>>,
    unavailable: AtomicBool,
}

impl InMemoryPostStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, post: Post) {
        self.posts.lock().insert(post.id, post);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::ServiceUnavailable("post store unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PostStore for InMemoryPostStore {
    async fn get_post(&self, post_id: Uuid) -> Result<Option<Post>> {
        self.check()?;
        Ok(self.posts.lock().get(&post_id).cloned())
    }

    async fn get_posts_by_author(
        &self,
        author_id: Uuid,
        limit: usize,
        cursor: Option<String>,
    ) -> Result<(Vec<Post>, Option<String>)> {
        self.check()?;
        let after = PageToken::parse_optional(cursor.as_deref())?;

        let mut posts: Vec<Post> = self
            .posts
            .lock()
            .values()
            .filter(|p| p.author_id == author_id && p.is_feed_visible())
            .filter(|p| after.map_or(true, |t| t.is_before(p.created_at, p.id)))
            .cloned()
            .collect();
        posts.sort_by(|a, b| feed_order((a.created_at, a.id), (b.created_at, b.id)));

        let has_more = posts.len() > limit;
        posts.truncate(limit);
        let next = if has_more {
            posts
                .last()
                .map(|p| PageToken::new(p.created_at, p.id).encode())
        } else {
            None
        };
        Ok((posts, next))
    }
}

/// Follow graph plus user profiles.
#[derive(Default)]
pub struct InMemorySocialGraph {
    users: Mutex<HashMap<Uuid, UserProfile>>,
    /// (follower, followee) in follow order
    edges: Mutex<Vec<(Uuid, Uuid)>>,
    follower_failures: AtomicUsize,
    following_unavailable: AtomicBool,
}

impl InMemorySocialGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, profile: UserProfile) {
        self.users.lock().insert(profile.id, profile);
    }

    pub fn follow(&self, follower_id: Uuid, followee_id: Uuid) {
        let mut edges = self.edges.lock();
        if !edges.contains(&(follower_id, followee_id)) {
            edges.push((follower_id, followee_id));
        }
    }

    /// Make the next `n` follower-page reads fail with a transient error.
    pub fn fail_next_follower_reads(&self, n: usize) {
        self.follower_failures.store(n, Ordering::SeqCst);
    }

    pub fn set_following_unavailable(&self, unavailable: bool) {
        self.following_unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn user_ref(&self, user_id: Uuid) -> Option<UserRef> {
        self.users.lock().get(&user_id).map(|p| UserRef {
            user_id: p.id,
            username: p.username.clone(),
            is_celebrity: p.is_celebrity,
            follower_count: p.follower_count,
            is_active: p.is_active,
        })
    }
}

#[async_trait]
impl SocialGraph for InMemorySocialGraph {
    async fn get_followers(
        &self,
        user_id: Uuid,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<UserRef>> {
        if take_failure(&self.follower_failures) {
            return Err(AppError::ServiceUnavailable("social graph unavailable".into()));
        }
        let followers: Vec<Uuid> = self
            .edges
            .lock()
            .iter()
            .filter(|(_, followee)| *followee == user_id)
            .map(|(follower, _)| *follower)
            .collect();
        Ok(followers
            .into_iter()
            .filter_map(|id| self.user_ref(id))
            .skip(offset)
            .take(limit)
            .collect())
    }

    async fn get_following(
        &self,
        user_id: Uuid,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<UserRef>> {
        if self.following_unavailable.load(Ordering::SeqCst) {
            return Err(AppError::ServiceUnavailable("social graph unavailable".into()));
        }
        let following: Vec<Uuid> = self
            .edges
            .lock()
            .iter()
            .filter(|(follower, _)| *follower == user_id)
            .map(|(_, followee)| *followee)
            .collect();
        Ok(following
            .into_iter()
            .filter_map(|id| self.user_ref(id))
            .skip(offset)
            .take(limit)
            .collect())
    }

    async fn is_following(&self, follower_id: Uuid, followee_id: Uuid) -> Result<bool> {
        Ok(self.edges.lock().contains(&(follower_id, followee_id)))
    }
}

#[async_trait]
impl UserDirectory for InMemorySocialGraph {
    async fn get_user_by_id(&self, user_id: Uuid) -> Result<Option<UserProfile>> {
        Ok(self.users.lock().get(&user_id).cloned())
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

struct Expiring<T> {
    value: T,
    expires_at: DateTime<Utc>,
}

impl<T: Clone> Expiring<T> {
    fn new(value: T, ttl_secs: u64) -> Self {
        Self {
            value,
            expires_at: Utc::now() + ChronoDuration::seconds(ttl_secs as i64),
        }
    }

    fn live(&self) -> Option<T> {
        (self.expires_at > Utc::now()).then(|| self.value.clone())
    }
}

/// Same key semantics as the Redis cache, TTLs included.
#[derive(Default)]
pub struct InMemoryFeedCache {
    config: CacheConfig,
    feeds: Mutex<HashMap<(Uuid, usize), Expiring<CachedFeed>>>,
    /// recipient -> (post_id -> created_at ms)
    timelines: Mutex<HashMap<Uuid, HashMap<Uuid, i64>>>,
    affinities: Mutex<HashMap<(Uuid, Uuid), Expiring<f64>>>,
    positions: Mutex<HashMap<Uuid, FeedCursor>>,
    fail_writes: AtomicUsize,
    unavailable: AtomicBool,
}

impl InMemoryFeedCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Make the next `n` recent-timeline writes fail.
    pub fn fail_next_writes(&self, n: usize) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    /// Every operation fails while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn has_feed(&self, user_id: Uuid) -> bool {
        self.feeds.lock().keys().any(|(u, _)| *u == user_id)
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::Cache("cache unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl FeedCacheStore for InMemoryFeedCache {
    async fn get_feed(&self, user_id: Uuid, limit: usize) -> Result<Option<CachedFeed>> {
        self.check()?;
        Ok(self
            .feeds
            .lock()
            .get(&(user_id, limit))
            .and_then(Expiring::live)
            .filter(|feed| feed.is_fresh(self.config.feed_ttl, Utc::now())))
    }

    async fn set_feed(&self, user_id: Uuid, limit: usize, feed: &CachedFeed) -> Result<()> {
        self.check()?;
        self.feeds.lock().insert(
            (user_id, limit),
            Expiring::new(feed.clone(), self.config.feed_ttl),
        );
        Ok(())
    }

    async fn invalidate_feeds(&self, user_ids: &[Uuid]) -> Result<()> {
        self.check()?;
        self.feeds.lock().retain(|(u, _), _| !user_ids.contains(u));
        Ok(())
    }

    async fn push_recent(
        &self,
        recipients: &[Uuid],
        post_id: Uuid,
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        self.check()?;
        if take_failure(&self.fail_writes) {
            return Err(AppError::Cache("injected cache write failure".into()));
        }

        let mut timelines = self.timelines.lock();
        for recipient in recipients {
            let set = timelines.entry(*recipient).or_default();
            set.insert(post_id, created_at.timestamp_millis());
            if set.len() > self.config.max_timeline_items {
                let mut members: Vec<(Uuid, i64)> = set.iter().map(|(p, s)| (*p, *s)).collect();
                members.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
                for (stale, _) in members.into_iter().skip(self.config.max_timeline_items) {
                    set.remove(&stale);
                }
            }
        }
        Ok(())
    }

    async fn recent_items(
        &self,
        user_id: Uuid,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Uuid>> {
        self.check()?;
        let timelines = self.timelines.lock();
        let Some(set) = timelines.get(&user_id) else {
            return Ok(Vec::new());
        };
        let floor = since.map(|ts| ts.timestamp_millis());
        let mut members: Vec<(Uuid, i64)> = set
            .iter()
            .filter(|(_, score)| floor.map_or(true, |f| **score > f))
            .map(|(p, s)| (*p, *s))
            .collect();
        members.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
        Ok(members.into_iter().take(limit).map(|(p, _)| p).collect())
    }

    async fn get_affinity(&self, viewer_id: Uuid, author_id: Uuid) -> Result<Option<f64>> {
        self.check()?;
        Ok(self
            .affinities
            .lock()
            .get(&(viewer_id, author_id))
            .and_then(Expiring::live))
    }

    async fn set_affinity(&self, viewer_id: Uuid, author_id: Uuid, score: f64) -> Result<()> {
        self.check()?;
        self.affinities.lock().insert(
            (viewer_id, author_id),
            Expiring::new(score, self.config.affinity_ttl),
        );
        Ok(())
    }

    async fn get_read_position(&self, user_id: Uuid) -> Result<Option<FeedCursor>> {
        self.check()?;
        Ok(self.positions.lock().get(&user_id).cloned())
    }

    async fn set_read_position(&self, cursor: &FeedCursor) -> Result<()> {
        self.check()?;
        self.positions.lock().insert(cursor.user_id, cursor.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(user: Uuid, post: u128, ts: DateTime<Utc>) -> UserTimelineEntry {
        UserTimelineEntry {
            user_id: user,
            post_id: Uuid::from_u128(post),
            author_id: Uuid::nil(),
            content: String::new(),
            created_at: ts,
            engagement_score: 0.0,
            like_count: 0,
            comment_count: 0,
            share_count: 0,
            inserted_at: ts,
        }
    }

    #[tokio::test]
    async fn test_timeline_insert_is_idempotent() {
        let store = InMemoryTimelineStore::new();
        let user = Uuid::new_v4();
        let now = Utc::now();

        assert_eq!(store.insert_batch(&[entry(user, 1, now)]).await.unwrap(), 1);
        assert_eq!(store.insert_batch(&[entry(user, 1, now)]).await.unwrap(), 0);
        assert_eq!(store.row_count(), 1);
    }

    #[tokio::test]
    async fn test_queue_claim_order_and_fencing() {
        let queue = InMemoryFanoutQueue::new();
        let now = Utc::now();
        let low = FanoutQueueItem::new(Uuid::new_v4(), Uuid::new_v4(), 0, now);
        let high = FanoutQueueItem::new(Uuid::new_v4(), Uuid::new_v4(), 5, now);
        queue.enqueue(&low).await.unwrap();
        queue.enqueue(&high).await.unwrap();

        let lease = now + ChronoDuration::seconds(30);
        let claimed = queue.claim_batch(10, "w1", lease, now).await.unwrap();
        assert_eq!(claimed[0].id, high.id);
        assert_eq!(claimed[0].version, 1);

        // A stale token cannot move the job
        let stale = ClaimToken {
            owner: "w1".into(),
            version: 0,
        };
        assert!(matches!(
            queue.complete(high.id, &stale, now).await,
            Err(QueueError::LeaseLost(_))
        ));

        // Nothing else is runnable until the lease expires
        assert!(queue.claim_batch(10, "w2", lease, now).await.unwrap().is_empty());
        let later = lease + ChronoDuration::seconds(1);
        let reclaimed = queue
            .claim_batch(1, "w2", later + ChronoDuration::seconds(30), later)
            .await
            .unwrap();
        assert_eq!(reclaimed[0].id, high.id);
        assert_eq!(reclaimed[0].version, 2);

        let original = claimed[0].claim_token().unwrap();
        assert!(matches!(
            queue.complete(high.id, &original, later).await,
            Err(QueueError::LeaseLost(_))
        ));
    }

    #[tokio::test]
    async fn test_cache_trims_recent_items() {
        let cache = InMemoryFeedCache::new(CacheConfig {
            max_timeline_items: 2,
            ..CacheConfig::default()
        });
        let user = Uuid::new_v4();
        let now = Utc::now();
        for (i, post) in [1u128, 2, 3].iter().enumerate() {
            cache
                .push_recent(
                    &[user],
                    Uuid::from_u128(*post),
                    now + ChronoDuration::seconds(i as i64),
                )
                .await
                .unwrap();
        }

        let recent = cache.recent_items(user, None, 10).await.unwrap();
        assert_eq!(recent, vec![Uuid::from_u128(3), Uuid::from_u128(2)]);
    }
}
