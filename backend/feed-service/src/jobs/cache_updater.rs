//! Cache Updater Background Job
//!
//! Fan-out workers never touch Redis directly. After a post has been pushed
//! they hand a [`CacheUpdate`] to a bounded channel and move on; this job
//! drains the channel and applies each update:
//!
//! 1. Add the post to every recipient's recent-items sorted set (trimmed, with TTL)
//! 2. Invalidate the recipients' cached first pages
//!
//! Each update gets a small bounded retry. When the channel is full the update
//! is dropped and counted, so a cache outage cannot pile up background work.

use chrono::{DateTime, Utc};
use resilience::{with_retry, RetryConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{CacheConfig, FeedCacheStore};
use crate::error::Result;
use crate::metrics;

/// Step between cache update retries (retry `n` waits `n × step`)
const RETRY_STEP: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq)]
pub struct CacheUpdate {
    pub recipients: Vec<Uuid>,
    pub post_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Producer side handed to fan-out workers.
#[derive(Clone)]
pub struct CacheUpdateSender {
    tx: mpsc::Sender<CacheUpdate>,
}

impl CacheUpdateSender {
    /// Queue an update without waiting. Returns `false` when it was dropped.
    pub fn submit(&self, update: CacheUpdate) -> bool {
        match self.tx.try_send(update) {
            Ok(()) => true,
            Err(TrySendError::Full(update)) => {
                metrics::record_cache_update("dropped");
                warn!(
                    post_id = %update.post_id,
                    recipients = update.recipients.len(),
                    "Cache update queue full, dropping update"
                );
                false
            }
            Err(TrySendError::Closed(update)) => {
                metrics::record_cache_update("dropped");
                debug!(post_id = %update.post_id, "Cache updater stopped, dropping update");
                false
            }
        }
    }
}

/// Create the bounded update channel.
pub fn cache_update_channel(capacity: usize) -> (CacheUpdateSender, mpsc::Receiver<CacheUpdate>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (CacheUpdateSender { tx }, rx)
}

pub struct CacheUpdater {
    cache: Arc<dyn FeedCacheStore>,
    rx: mpsc::Receiver<CacheUpdate>,
    max_retries: u32,
}

impl CacheUpdater {
    pub fn new(
        cache: Arc<dyn FeedCacheStore>,
        rx: mpsc::Receiver<CacheUpdate>,
        config: &CacheConfig,
    ) -> Self {
        Self {
            cache,
            rx,
            max_retries: config.update_max_retries,
        }
    }

    /// Apply updates until shutdown or until every sender is gone.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting cache updater background job");

        // A dropped shutdown sender only stops us watching it
        let mut watching = true;

        loop {
            tokio::select! {
                changed = shutdown.changed(), if watching => {
                    match changed {
                        Ok(()) if *shutdown.borrow() => {
                            info!("Cache updater shutting down");
                            break;
                        }
                        Ok(()) => {}
                        Err(_) => watching = false,
                    }
                }
                update = self.rx.recv() => {
                    let Some(update) = update else {
                        info!("Cache update channel closed");
                        break;
                    };
                    self.handle(update).await;
                }
            }
        }

        let drained = self.drain().await;
        if drained > 0 {
            info!(drained, "Applied queued cache updates before stopping");
        }
    }

    /// Apply every update already queued without waiting for new ones.
    pub async fn drain(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(update) = self.rx.try_recv() {
            self.handle(update).await;
            applied += 1;
        }
        applied
    }

    async fn handle(&self, update: CacheUpdate) {
        match self.apply(&update).await {
            Ok(()) => metrics::record_cache_update("applied"),
            Err(e) => {
                metrics::record_cache_update("failed");
                warn!(
                    post_id = %update.post_id,
                    recipients = update.recipients.len(),
                    error = %e,
                    "Cache update failed"
                );
            }
        }
    }

    pub async fn apply(&self, update: &CacheUpdate) -> Result<()> {
        let config = RetryConfig::linear(self.max_retries, RETRY_STEP);
        let cache = &self.cache;

        with_retry(config, move || async move {
            cache
                .push_recent(&update.recipients, update.post_id, update.created_at)
                .await?;
            cache.invalidate_feeds(&update.recipients).await
        })
        .await
        .map_err(|e| e.into_inner())?;

        debug!(
            post_id = %update.post_id,
            recipients = update.recipients.len(),
            "Cache update applied"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CachedFeed;
    use crate::memory::InMemoryFeedCache;

    fn update(recipients: Vec<Uuid>) -> CacheUpdate {
        CacheUpdate {
            recipients,
            post_id: Uuid::new_v4(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_full_queue_drops_instead_of_blocking() {
        let (tx, _rx) = cache_update_channel(1);
        assert!(tx.submit(update(vec![])));
        assert!(!tx.submit(update(vec![])));
    }

    #[tokio::test]
    async fn test_apply_writes_recent_and_invalidates_first_page() {
        let cache = Arc::new(InMemoryFeedCache::default());
        let user = Uuid::new_v4();
        cache
            .set_feed(
                user,
                10,
                &CachedFeed {
                    items: vec![],
                    next_page_token: None,
                    has_more: false,
                    cached_at: 0,
                },
            )
            .await
            .unwrap();

        let (_tx, rx) = cache_update_channel(4);
        let updater = CacheUpdater::new(cache.clone(), rx, &CacheConfig::default());
        let up = update(vec![user]);
        updater.apply(&up).await.unwrap();

        assert_eq!(cache.recent_items(user, None, 10).await.unwrap(), vec![up.post_id]);
        assert!(!cache.has_feed(user));
    }

    #[tokio::test]
    async fn test_apply_retries_transient_failures() {
        let cache = Arc::new(InMemoryFeedCache::default());
        cache.fail_next_writes(2);

        let (_tx, rx) = cache_update_channel(4);
        let updater = CacheUpdater::new(
            cache.clone(),
            rx,
            &CacheConfig {
                update_max_retries: 2,
                ..CacheConfig::default()
            },
        );
        let user = Uuid::new_v4();
        updater.apply(&update(vec![user])).await.unwrap();
        assert_eq!(cache.recent_items(user, None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_run_drains_channel_until_senders_drop() {
        let cache = Arc::new(InMemoryFeedCache::default());
        let (tx, rx) = cache_update_channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let user = Uuid::new_v4();

        for _ in 0..3 {
            assert!(tx.submit(update(vec![user])));
        }
        drop(tx);

        CacheUpdater::new(cache.clone(), rx, &CacheConfig::default())
            .run(shutdown_rx)
            .await;
        assert_eq!(cache.recent_items(user, None, 10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_shutdown_applies_already_queued_updates() {
        let cache = Arc::new(InMemoryFeedCache::default());
        let (tx, rx) = cache_update_channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let user = Uuid::new_v4();

        shutdown_tx.send(true).unwrap();
        assert!(tx.submit(update(vec![user])));
        assert!(tx.submit(update(vec![user])));

        CacheUpdater::new(cache.clone(), rx, &CacheConfig::default())
            .run(shutdown_rx)
            .await;
        assert_eq!(cache.recent_items(user, None, 10).await.unwrap().len(), 2);
    }
}
