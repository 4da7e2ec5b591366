//! Queue Cleaner Background Job
//!
//! Completed jobs are kept for a retention period for observability, then
//! deleted. Failed jobs are never removed here.

use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info};

use crate::services::FanoutQueue;

pub async fn start_queue_cleaner(
    queue: FanoutQueue,
    check_interval: Duration,
    retention: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        "Starting queue cleaner background job (check_interval={}s, retention={}h)",
        check_interval.as_secs(),
        retention.as_secs() / 3600
    );

    loop {
        tokio::select! {
            _ = sleep(check_interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        let cycle_start = Instant::now();
        match queue.cleanup_completed_jobs(retention).await {
            Ok(deleted) => info!(
                deleted,
                duration_ms = cycle_start.elapsed().as_millis() as u64,
                "Queue cleanup cycle completed"
            ),
            Err(e) => error!(
                error = %e,
                duration_ms = cycle_start.elapsed().as_millis() as u64,
                "Queue cleanup failed"
            ),
        }
    }

    info!("Queue cleaner stopped");
}
