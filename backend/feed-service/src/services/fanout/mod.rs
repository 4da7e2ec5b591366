//! Fan-out worker: turns one claimed queue job into timeline writes (push) or
//! a single celebrity-post row (pull).
//!
//! Delivery is at-least-once. Every write is an upsert keyed by
//! (recipient, post id), so a job that runs twice leaves one row per
//! recipient. Push progress is checkpointed per sub-batch; a retried or
//! re-claimed job resumes from the first undelivered follower position.

use chrono::{Duration as ChronoDuration, Utc};
use futures::stream::{self, StreamExt};
use resilience::{with_cancellation, with_retry, RetryConfig, RetryError};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clients::{PostStore, SocialGraph, UserDirectory};
use crate::config::FanoutConfig;
use crate::db::{CelebrityPostStore, FanoutQueueRepository, QueueError, TimelineStore};
use crate::error::{AppError, Result};
use crate::jobs::cache_updater::{CacheUpdate, CacheUpdateSender};
use crate::metrics;
use crate::models::{CelebrityPostEntry, ClaimToken, FanoutQueueItem, Post, UserTimelineEntry};
use crate::services::call_store;
use crate::services::classifier::{CelebrityPolicy, FanoutStrategy};

#[derive(Debug, Error)]
pub enum FanoutError {
    #[error("author not found: {0}")]
    AuthorNotFound(Uuid),

    #[error("post not found: {0}")]
    PostNotFound(Uuid),

    #[error("store error: {0}")]
    Store(#[from] AppError),

    #[error("timeline sub-batch failed after {attempts} attempts: {message}")]
    BatchWrite { attempts: u32, message: String },

    #[error("cancelled")]
    Cancelled,

    #[error("lease lost for job {0}")]
    LeaseLost(Uuid),
}

impl FanoutError {
    /// Missing authors or posts cannot appear by retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            FanoutError::AuthorNotFound(_) | FanoutError::PostNotFound(_) => false,
            FanoutError::Store(e) => e.is_transient(),
            FanoutError::BatchWrite { .. } => true,
            FanoutError::Cancelled | FanoutError::LeaseLost(_) => false,
        }
    }
}

impl From<QueueError> for FanoutError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::LeaseLost(id) => FanoutError::LeaseLost(id),
            other => FanoutError::Store(AppError::from(other)),
        }
    }
}

/// What a successful job did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Push { recipients: u64, rows_written: u64 },
    Pull,
    /// Private post: nothing to distribute
    Skipped,
}

impl Delivery {
    fn label(&self) -> &'static str {
        match self {
            Delivery::Push { .. } => "push",
            Delivery::Pull => "pull",
            Delivery::Skipped => "skipped",
        }
    }
}

/// Final state of one processing attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed(Delivery),
    Rescheduled { retry_count: i32, delay: Duration },
    Failed { error: String },
    /// Handed back on shutdown without consuming a retry
    Released,
    /// Another worker owns the job now
    LeaseLost,
    /// The queue could not record the outcome; the lease will expire
    Abandoned,
}

impl JobOutcome {
    fn label(&self) -> &'static str {
        match self {
            JobOutcome::Completed(_) => "completed",
            JobOutcome::Rescheduled { .. } => "rescheduled",
            JobOutcome::Failed { .. } => "failed",
            JobOutcome::Released => "released",
            JobOutcome::LeaseLost => "lease_lost",
            JobOutcome::Abandoned => "abandoned",
        }
    }
}

/// Delay before retry number `retry` (1-based): `retry² × unit`.
pub fn retry_delay(retry: i32, unit: Duration) -> Duration {
    let n = retry.max(1) as u32;
    unit.saturating_mul(n.saturating_mul(n))
}

fn to_chrono(d: Duration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or_else(|_| ChronoDuration::seconds(i64::from(u32::MAX)))
}

/// Stores and collaborators the worker reads and writes.
#[derive(Clone)]
pub struct FanoutStores {
    pub queue: Arc<dyn FanoutQueueRepository>,
    pub timeline: Arc<dyn TimelineStore>,
    pub celebrity_posts: Arc<dyn CelebrityPostStore>,
    pub posts: Arc<dyn PostStore>,
    pub graph: Arc<dyn SocialGraph>,
    pub users: Arc<dyn UserDirectory>,
}

pub struct FanoutWorker {
    worker_id: String,
    stores: FanoutStores,
    cache_updates: CacheUpdateSender,
    policy: CelebrityPolicy,
    config: FanoutConfig,
}

impl FanoutWorker {
    pub fn new(
        worker_id: impl Into<String>,
        stores: FanoutStores,
        cache_updates: CacheUpdateSender,
        policy: CelebrityPolicy,
        config: FanoutConfig,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            stores,
            cache_updates,
            policy,
            config,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Claim up to `n` runnable jobs under this worker's lease.
    pub async fn claim_batch(&self, n: usize) -> Result<Vec<FanoutQueueItem>> {
        let now = Utc::now();
        let lease_expires_at = now + to_chrono(self.config.lease_duration);

        let queue = self.stores.queue.clone();
        let owner = self.worker_id.clone();
        call_store("queue claim_batch", self.config.store_timeout, async move {
            queue
                .claim_batch(n, &owner, lease_expires_at, now)
                .await
                .map_err(AppError::from)
        })
        .await
    }

    /// One poll cycle: claim a batch and process it with bounded concurrency.
    /// Returns the number of jobs claimed.
    pub async fn run_once(&self, shutdown: &watch::Receiver<bool>) -> Result<usize> {
        if *shutdown.borrow() {
            return Ok(0);
        }

        let jobs = self.claim_batch(self.config.claim_batch_size).await?;
        let claimed = jobs.len();
        if claimed == 0 {
            return Ok(0);
        }
        debug!(worker_id = %self.worker_id, claimed, "Claimed fan-out jobs");

        stream::iter(jobs)
            .map(|job| self.process_job(job, shutdown.clone()))
            .buffer_unordered(self.config.job_concurrency.max(1))
            .for_each(|_| async {})
            .await;

        Ok(claimed)
    }

    /// Run one claimed job and record its outcome in the queue.
    pub async fn process_job(
        &self,
        job: FanoutQueueItem,
        mut shutdown: watch::Receiver<bool>,
    ) -> JobOutcome {
        let Some(token) = job.claim_token() else {
            warn!(job_id = %job.id, "Job has no claim token, skipping");
            return JobOutcome::LeaseLost;
        };

        let started = Instant::now();
        let result = self.execute(&job, &token, &mut shutdown).await;
        let strategy = match &result {
            Ok(delivery) => delivery.label(),
            Err(_) => "error",
        };
        metrics::record_job_duration(strategy, started.elapsed());

        let outcome = self.settle(&job, &token, result).await;
        metrics::record_job_outcome(outcome.label());
        outcome
    }

    async fn execute(
        &self,
        job: &FanoutQueueItem,
        token: &ClaimToken,
        shutdown: &mut watch::Receiver<bool>,
    ) -> std::result::Result<Delivery, FanoutError> {
        let users = self.stores.users.clone();
        let author_id = job.author_id;
        let author = self
            .guarded(shutdown, "get_user_by_id", async move {
                users.get_user_by_id(author_id).await
            })
            .await?
            .ok_or(FanoutError::AuthorNotFound(job.author_id))?;

        let posts = self.stores.posts.clone();
        let post_id = job.post_id;
        let post = self
            .guarded(shutdown, "get_post", async move { posts.get_post(post_id).await })
            .await?
            .filter(|p| !p.is_deleted)
            .ok_or(FanoutError::PostNotFound(job.post_id))?;

        if !post.visibility.is_distributable() {
            debug!(job_id = %job.id, post_id = %post.id, "Private post, nothing to fan out");
            return Ok(Delivery::Skipped);
        }

        match self.policy.classify_author(&author) {
            FanoutStrategy::Pull => {
                let entry = CelebrityPostEntry::from_post(&post, Utc::now());
                let celebrity_posts = self.stores.celebrity_posts.clone();
                self.guarded(shutdown, "celebrity insert", async move {
                    celebrity_posts.insert(&entry).await
                })
                .await?;

                info!(
                    job_id = %job.id,
                    post_id = %post.id,
                    author_id = %author.id,
                    follower_count = author.follower_count,
                    "Celebrity post stored for pull reads"
                );
                Ok(Delivery::Pull)
            }
            FanoutStrategy::Push => self.push_to_followers(job, token, &post, shutdown).await,
        }
    }

    /// Page through followers from the job's checkpoint, writing one atomic
    /// batch per sub-batch and checkpointing after each.
    async fn push_to_followers(
        &self,
        job: &FanoutQueueItem,
        token: &ClaimToken,
        post: &Post,
        shutdown: &mut watch::Receiver<bool>,
    ) -> std::result::Result<Delivery, FanoutError> {
        let page_size = self.config.follower_page_size.max(1);
        let batch_size = self.config.write_batch_size.max(1);
        let mut offset = job.progress_offset.max(0) as usize;
        let mut recipients: Vec<Uuid> = Vec::new();
        let mut rows_written = 0u64;

        if offset > 0 {
            info!(job_id = %job.id, offset, "Resuming fan-out from checkpoint");
        }

        loop {
            if *shutdown.borrow() {
                return Err(FanoutError::Cancelled);
            }

            let graph = self.stores.graph.clone();
            let author_id = post.author_id;
            let page = self
                .guarded(shutdown, "get_followers", async move {
                    graph.get_followers(author_id, page_size, offset).await
                })
                .await?;
            let page_len = page.len();

            for chunk in page.chunks(batch_size) {
                if *shutdown.borrow() {
                    return Err(FanoutError::Cancelled);
                }

                let now = Utc::now();
                let entries: Vec<UserTimelineEntry> = chunk
                    .iter()
                    .filter(|f| f.is_active)
                    .map(|f| UserTimelineEntry::for_recipient(f.user_id, post, now))
                    .collect();

                let written = self.write_sub_batch(&entries, shutdown).await?;
                rows_written += written;
                recipients.extend(entries.iter().map(|e| e.user_id));

                offset += chunk.len();
                self.checkpoint(job, token, offset).await?;
            }

            if page_len < page_size {
                break;
            }
        }

        metrics::record_rows_written(rows_written);

        if !recipients.is_empty() {
            self.cache_updates.submit(CacheUpdate {
                recipients: recipients.clone(),
                post_id: post.id,
                created_at: post.created_at,
            });
        }

        info!(
            job_id = %job.id,
            post_id = %post.id,
            recipients = recipients.len(),
            rows_written,
            "Push fan-out completed"
        );

        Ok(Delivery::Push {
            recipients: recipients.len() as u64,
            rows_written,
        })
    }

    /// One atomic multi-row write, retried as a whole with linear backoff.
    async fn write_sub_batch(
        &self,
        entries: &[UserTimelineEntry],
        shutdown: &watch::Receiver<bool>,
    ) -> std::result::Result<u64, FanoutError> {
        if entries.is_empty() {
            return Ok(0);
        }

        let config =
            RetryConfig::linear(self.config.batch_max_retries, self.config.batch_retry_step);
        let timeline = &self.stores.timeline;
        let timeout = self.config.store_timeout;
        let mut attempt = 0u32;

        // Shutdown interrupts both the writes and the backoff between them
        let mut shutdown = shutdown.clone();
        let result = with_cancellation(
            &mut shutdown,
            with_retry(config, move || {
                attempt += 1;
                if attempt > 1 {
                    metrics::record_batch_retry();
                }
                call_store("timeline insert_batch", timeout, timeline.insert_batch(entries))
            }),
        )
        .await
        .map_err(|_| FanoutError::Cancelled)?;

        match result {
            Ok(written) => Ok(written),
            Err(RetryError::Aborted(e)) => Err(FanoutError::Store(e)),
            Err(RetryError::Exhausted {
                attempts,
                last_error,
            }) => Err(FanoutError::BatchWrite {
                attempts,
                message: last_error.to_string(),
            }),
        }
    }

    async fn checkpoint(
        &self,
        job: &FanoutQueueItem,
        token: &ClaimToken,
        offset: usize,
    ) -> std::result::Result<(), FanoutError> {
        let lease_expires_at = Utc::now() + to_chrono(self.config.lease_duration);
        let queue = self.stores.queue.clone();
        let token = token.clone();
        let id = job.id;

        resilience::with_timeout(self.config.store_timeout, async move {
            queue
                .checkpoint(id, &token, offset as i64, lease_expires_at)
                .await
        })
        .await
        .map_err(|e| FanoutError::Store(AppError::from_timeout("queue checkpoint", e)))??;

        debug!(job_id = %job.id, offset, "Fan-out checkpoint recorded");
        Ok(())
    }

    /// Store call under both the store deadline and the shutdown signal.
    async fn guarded<T, F>(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        operation: &str,
        fut: F,
    ) -> std::result::Result<T, FanoutError>
    where
        F: Future<Output = Result<T>>,
    {
        with_cancellation(shutdown, call_store(operation, self.config.store_timeout, fut))
            .await
            .map_err(|_| FanoutError::Cancelled)?
            .map_err(FanoutError::Store)
    }

    /// Move the job to its next state according to the attempt's result.
    async fn settle(
        &self,
        job: &FanoutQueueItem,
        token: &ClaimToken,
        result: std::result::Result<Delivery, FanoutError>,
    ) -> JobOutcome {
        let now = Utc::now();
        let queue = &self.stores.queue;
        let timeout = self.config.store_timeout;

        let (transition, outcome) = match result {
            Ok(delivery) => (
                call_store("queue complete", timeout, async {
                    queue.complete(job.id, token, now).await.map_err(AppError::from)
                })
                .await,
                JobOutcome::Completed(delivery),
            ),
            Err(FanoutError::LeaseLost(_)) => {
                warn!(job_id = %job.id, worker_id = %self.worker_id, "Lease lost mid-job, abandoning");
                return JobOutcome::LeaseLost;
            }
            Err(FanoutError::Cancelled) => {
                info!(job_id = %job.id, "Fan-out cancelled, releasing job");
                (
                    call_store("queue release", timeout, async {
                        queue.release(job.id, token, now).await.map_err(AppError::from)
                    })
                    .await,
                    JobOutcome::Released,
                )
            }
            Err(e) if e.is_retryable() && job.retry_count < self.config.max_retries => {
                let retry_count = job.retry_count + 1;
                let delay = retry_delay(retry_count, self.config.retry_unit);
                let message = e.to_string();
                warn!(
                    job_id = %job.id,
                    post_id = %job.post_id,
                    retry_count,
                    delay_ms = delay.as_millis() as u64,
                    error = %message,
                    "Fan-out failed, rescheduling"
                );
                (
                    call_store("queue reschedule", timeout, async {
                        queue
                            .reschedule(job.id, token, retry_count, now + to_chrono(delay), &message, now)
                            .await
                            .map_err(AppError::from)
                    })
                    .await,
                    JobOutcome::Rescheduled { retry_count, delay },
                )
            }
            Err(e) => {
                let message = e.to_string();
                error!(
                    job_id = %job.id,
                    post_id = %job.post_id,
                    retry_count = job.retry_count,
                    retryable = e.is_retryable(),
                    error = %message,
                    "Fan-out failed permanently"
                );
                (
                    call_store("queue fail", timeout, async {
                        queue.fail(job.id, token, &message, now).await.map_err(AppError::from)
                    })
                    .await,
                    JobOutcome::Failed { error: message.clone() },
                )
            }
        };

        match transition {
            Ok(()) => outcome,
            Err(AppError::Conflict(msg)) => {
                warn!(job_id = %job.id, "Queue transition fenced off: {}", msg);
                JobOutcome::LeaseLost
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Could not record fan-out outcome");
                JobOutcome::Abandoned
            }
        }
    }
}
