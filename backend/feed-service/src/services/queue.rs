//! Operational API over the fan-out queue: enqueue at post creation, depth
//! per status, retention cleanup.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::FanoutQueueRepository;
use crate::error::{AppError, Result};
use crate::metrics;
use crate::models::{FanoutQueueItem, Post, QueueStats};
use crate::services::call_store;

#[derive(Clone)]
pub struct FanoutQueue {
    repo: Arc<dyn FanoutQueueRepository>,
    timeout: Duration,
}

impl FanoutQueue {
    pub fn new(repo: Arc<dyn FanoutQueueRepository>, timeout: Duration) -> Self {
        Self { repo, timeout }
    }

    /// Record a job for a freshly created post. Returns as soon as the job row
    /// exists; distribution happens on a worker.
    pub async fn enqueue_fanout(&self, post: &Post) -> Result<FanoutQueueItem> {
        self.enqueue_with_priority(post, 0).await
    }

    /// Same as [`enqueue_fanout`](Self::enqueue_fanout) with an explicit
    /// priority. Enqueueing a post twice returns the existing job.
    pub async fn enqueue_with_priority(&self, post: &Post, priority: i32) -> Result<FanoutQueueItem> {
        if post.is_deleted {
            return Err(AppError::BadRequest(format!("post {} is deleted", post.id)));
        }

        let item = FanoutQueueItem::new(post.id, post.author_id, priority, Utc::now());
        let repo = &self.repo;
        let stored = call_store("queue enqueue", self.timeout, async {
            repo.enqueue(&item).await.map_err(AppError::from)
        })
        .await?;

        if stored.id == item.id {
            info!(
                job_id = %stored.id,
                post_id = %post.id,
                author_id = %post.author_id,
                priority,
                "Fan-out job enqueued"
            );
        } else {
            debug!(job_id = %stored.id, post_id = %post.id, "Fan-out job already queued");
        }
        Ok(stored)
    }

    pub async fn get_job(&self, id: Uuid) -> Result<FanoutQueueItem> {
        let repo = &self.repo;
        call_store("queue get", self.timeout, async {
            repo.get(id).await.map_err(AppError::from)
        })
        .await?
        .ok_or_else(|| AppError::NotFound(format!("fanout job {}", id)))
    }

    /// Job counts per status. Also refreshes the queue depth gauge.
    pub async fn get_queue_stats(&self) -> Result<QueueStats> {
        let repo = &self.repo;
        let stats = call_store("queue stats", self.timeout, async {
            repo.stats().await.map_err(AppError::from)
        })
        .await?;
        metrics::set_queue_depth(&stats);
        Ok(stats)
    }

    /// Delete completed jobs processed more than `older_than` ago.
    pub async fn cleanup_completed_jobs(&self, older_than: Duration) -> Result<u64> {
        let age = ChronoDuration::from_std(older_than)
            .map_err(|_| AppError::BadRequest(format!("retention {:?} out of range", older_than)))?;
        let cutoff = Utc::now() - age;

        let repo = &self.repo;
        let deleted = call_store("queue cleanup", self.timeout, async {
            repo.cleanup_completed(cutoff).await.map_err(AppError::from)
        })
        .await?;

        metrics::record_cleanup_deleted(deleted);
        info!(deleted, cutoff = %cutoff, "Completed fan-out jobs cleaned up");
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryFanoutQueue;
    use crate::models::{FanoutStatus, Visibility};

    fn post() -> Post {
        let now = Utc::now();
        Post {
            id: Uuid::new_v4(),
            author_id: Uuid::new_v4(),
            content: "first post".into(),
            created_at: now,
            updated_at: now,
            is_deleted: false,
            like_count: 0,
            comment_count: 0,
            share_count: 0,
            engagement_score: 0.0,
            visibility: Visibility::Public,
        }
    }

    fn queue() -> (Arc<InMemoryFanoutQueue>, FanoutQueue) {
        let repo = Arc::new(InMemoryFanoutQueue::new());
        (repo.clone(), FanoutQueue::new(repo, Duration::from_secs(1)))
    }

    #[tokio::test]
    async fn test_enqueue_creates_pending_job() {
        let (_, queue) = queue();
        let post = post();

        let job = queue.enqueue_fanout(&post).await.unwrap();
        assert_eq!(job.status, FanoutStatus::Pending);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.post_id, post.id);
        assert_eq!(job.author_id, post.author_id);

        let fetched = queue.get_job(job.id).await.unwrap();
        assert_eq!(fetched, job);
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent_per_post() {
        let (repo, queue) = queue();
        let post = post();

        let first = queue.enqueue_fanout(&post).await.unwrap();
        let second = queue.enqueue_with_priority(&post, 5).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(repo.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_deleted_post_is_rejected() {
        let (repo, queue) = queue();
        let mut post = post();
        post.is_deleted = true;

        assert!(matches!(
            queue.enqueue_fanout(&post).await,
            Err(AppError::BadRequest(_))
        ));
        assert!(repo.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_stats_and_cleanup() {
        let (repo, queue) = queue();
        let done = queue.enqueue_fanout(&post()).await.unwrap();
        queue.enqueue_fanout(&post()).await.unwrap();

        let now = Utc::now();
        let claimed = repo
            .claim_batch(10, "w1", now + ChronoDuration::seconds(30), now)
            .await
            .unwrap();
        let token = claimed
            .iter()
            .find(|j| j.id == done.id)
            .and_then(|j| j.claim_token())
            .unwrap();
        repo.complete(done.id, &token, now - ChronoDuration::hours(2))
            .await
            .unwrap();

        let stats = queue.get_queue_stats().await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.processing, 1);
        assert_eq!(stats.total(), 2);

        assert_eq!(
            queue
                .cleanup_completed_jobs(Duration::from_secs(3 * 3600))
                .await
                .unwrap(),
            0
        );
        assert_eq!(
            queue
                .cleanup_completed_jobs(Duration::from_secs(3600))
                .await
                .unwrap(),
            1
        );
        assert!(matches!(
            queue.get_job(done.id).await,
            Err(AppError::NotFound(_))
        ));
    }
}
