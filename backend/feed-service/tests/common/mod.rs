//! Shared harness for the integration suites: the whole engine wired to the
//! in-memory stores, with helpers to create users, posts and follows.
#![allow(dead_code)]

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

use feed_service::cache::CacheConfig;
use feed_service::config::{FanoutConfig, FeedConfig};
use feed_service::jobs::cache_updater::{cache_update_channel, CacheUpdater};
use feed_service::memory::{
    InMemoryCelebrityPostStore, InMemoryFanoutQueue, InMemoryFeedCache, InMemoryPostStore,
    InMemorySocialGraph, InMemoryTimelineStore,
};
use feed_service::models::{FeedItem, Post, UserProfile, Visibility};
use feed_service::services::fanout::FanoutStores;
use feed_service::services::{CelebrityPolicy, FanoutQueue, FanoutWorker, FeedService};

pub const CELEBRITY_THRESHOLD: i64 = 5;

pub fn fanout_config() -> FanoutConfig {
    FanoutConfig {
        celebrity_threshold: CELEBRITY_THRESHOLD,
        claim_batch_size: 10,
        job_concurrency: 2,
        max_retries: 3,
        retry_unit: Duration::from_millis(10),
        follower_page_size: 4,
        write_batch_size: 2,
        batch_max_retries: 1,
        batch_retry_step: Duration::from_millis(1),
        lease_duration: Duration::from_secs(30),
        store_timeout: Duration::from_secs(1),
        ..FanoutConfig::default()
    }
}

pub fn feed_config() -> FeedConfig {
    FeedConfig {
        default_limit: 10,
        max_limit: 50,
        store_timeout: Duration::from_secs(1),
        request_timeout: Duration::from_secs(5),
        ..FeedConfig::default()
    }
}

pub struct TestEnv {
    pub queue_repo: Arc<InMemoryFanoutQueue>,
    pub timeline: Arc<InMemoryTimelineStore>,
    pub celebrity_posts: Arc<InMemoryCelebrityPostStore>,
    pub posts: Arc<InMemoryPostStore>,
    pub graph: Arc<InMemorySocialGraph>,
    pub cache: Arc<InMemoryFeedCache>,
    pub stores: FanoutStores,
    pub queue: FanoutQueue,
    pub feed: Arc<FeedService>,
    pub worker: FanoutWorker,
    pub updater: CacheUpdater,
    pub policy: CelebrityPolicy,
    pub shutdown_tx: watch::Sender<bool>,
    pub shutdown_rx: watch::Receiver<bool>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(fanout_config())
    }

    pub fn with_config(config: FanoutConfig) -> Self {
        let queue_repo = Arc::new(InMemoryFanoutQueue::new());
        let timeline = Arc::new(InMemoryTimelineStore::new());
        let celebrity_posts = Arc::new(InMemoryCelebrityPostStore::new());
        let posts = Arc::new(InMemoryPostStore::new());
        let graph = Arc::new(InMemorySocialGraph::new());
        let cache = Arc::new(InMemoryFeedCache::new(CacheConfig::default()));
        let policy = CelebrityPolicy::new(config.celebrity_threshold);

        let stores = FanoutStores {
            queue: queue_repo.clone(),
            timeline: timeline.clone(),
            celebrity_posts: celebrity_posts.clone(),
            posts: posts.clone(),
            graph: graph.clone(),
            users: graph.clone(),
        };
        let (sender, rx) = cache_update_channel(64);
        let updater = CacheUpdater::new(cache.clone(), rx, &CacheConfig::default());
        let worker = FanoutWorker::new("worker-1", stores.clone(), sender, policy, config.clone());

        let queue = FanoutQueue::new(queue_repo.clone(), config.store_timeout);
        let feed = Arc::new(FeedService::new(
            timeline.clone(),
            celebrity_posts.clone(),
            posts.clone(),
            graph.clone(),
            cache.clone(),
            policy,
            feed_config(),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            queue_repo,
            timeline,
            celebrity_posts,
            posts,
            graph,
            cache,
            stores,
            queue,
            feed,
            worker,
            updater,
            policy,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// A second worker sharing this environment's stores.
    pub fn worker(&self, id: &str, config: FanoutConfig) -> FanoutWorker {
        let (sender, _rx) = cache_update_channel(64);
        FanoutWorker::new(id, self.stores.clone(), sender, self.policy, config)
    }

    pub fn user(&self, follower_count: i64) -> Uuid {
        let id = Uuid::new_v4();
        self.graph.add_user(UserProfile {
            id,
            username: format!("user_{}", &id.simple().to_string()[..8]),
            is_celebrity: false,
            follower_count,
            is_active: true,
        });
        id
    }

    pub fn celebrity(&self) -> Uuid {
        self.user(CELEBRITY_THRESHOLD * 10)
    }

    pub fn follow(&self, follower: Uuid, followee: Uuid) {
        self.graph.follow(follower, followee);
    }

    /// Store a post without enqueueing it.
    pub fn post_at(&self, author_id: Uuid, created_at: DateTime<Utc>) -> Post {
        let post = Post {
            id: Uuid::new_v4(),
            author_id,
            content: format!("post by {}", author_id),
            created_at,
            updated_at: created_at,
            is_deleted: false,
            like_count: 0,
            comment_count: 0,
            share_count: 0,
            engagement_score: 0.0,
            visibility: Visibility::Public,
        };
        self.posts.insert(post.clone());
        post
    }

    /// Store a post and enqueue its fan-out job, as post creation does.
    pub async fn publish_at(&self, author_id: Uuid, created_at: DateTime<Utc>) -> Post {
        let post = self.post_at(author_id, created_at);
        self.queue.enqueue_fanout(&post).await.unwrap();
        post
    }

    pub async fn publish(&self, author_id: Uuid) -> Post {
        self.publish_at(author_id, Utc::now() - ChronoDuration::seconds(1))
            .await
    }

    /// Poll until nothing is claimable, then apply queued cache updates.
    pub async fn run_workers(&mut self) -> usize {
        let mut processed = 0;
        loop {
            let claimed = self.worker.run_once(&self.shutdown_rx).await.unwrap();
            if claimed == 0 {
                break;
            }
            processed += claimed;
        }
        self.updater.drain().await;
        processed
    }
}

pub fn post_ids(items: &[FeedItem]) -> Vec<Uuid> {
    items.iter().map(|i| i.post_id).collect()
}
