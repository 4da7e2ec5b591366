//! Fan-out Worker Polling Loop
//!
//! One loop per worker instance. Instances share nothing but the queue:
//! each tick claims a batch under its own lease and processes it. Shutdown
//! is observed between ticks and inside every job, where it releases the
//! job back to `pending`.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::services::FanoutWorker;

pub async fn start_fanout_worker(
    worker: Arc<FanoutWorker>,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        worker_id = %worker.worker_id(),
        poll_interval_ms = poll_interval.as_millis() as u64,
        "Starting fan-out worker"
    );

    let mut ticker = interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        if *shutdown.borrow() {
            break;
        }

        match worker.run_once(&shutdown).await {
            Ok(0) => {}
            Ok(claimed) => debug!(worker_id = %worker.worker_id(), claimed, "Poll cycle finished"),
            Err(e) => error!(worker_id = %worker.worker_id(), error = %e, "Failed to claim fan-out jobs"),
        }
    }

    info!(worker_id = %worker.worker_id(), "Fan-out worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FanoutConfig;
    use crate::jobs::cache_updater::cache_update_channel;
    use crate::memory::{
        InMemoryCelebrityPostStore, InMemoryFanoutQueue, InMemoryPostStore, InMemorySocialGraph,
        InMemoryTimelineStore,
    };
    use crate::services::fanout::FanoutStores;
    use crate::services::CelebrityPolicy;

    #[tokio::test]
    async fn test_worker_loop_stops_on_shutdown() {
        let graph = Arc::new(InMemorySocialGraph::new());
        let stores = FanoutStores {
            queue: Arc::new(InMemoryFanoutQueue::new()),
            timeline: Arc::new(InMemoryTimelineStore::new()),
            celebrity_posts: Arc::new(InMemoryCelebrityPostStore::new()),
            posts: Arc::new(InMemoryPostStore::new()),
            graph: graph.clone(),
            users: graph,
        };
        let (sender, _rx) = cache_update_channel(4);
        let worker = Arc::new(FanoutWorker::new(
            "loop-test",
            stores,
            sender,
            CelebrityPolicy::default(),
            FanoutConfig::default(),
        ));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(start_fanout_worker(worker, Duration::from_millis(5), rx));
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker loop did not stop")
            .unwrap();
    }
}
