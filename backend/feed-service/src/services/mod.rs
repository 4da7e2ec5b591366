//! Service layer: the fan-out write path, the feed read path and the
//! operational queue API.

pub mod classifier;
pub mod fanout;
pub mod feed;
pub mod queue;
pub mod ranking;

pub use classifier::{CelebrityPolicy, FanoutStrategy};
pub use fanout::{FanoutError, FanoutWorker, JobOutcome};
pub use feed::{FeedService, PageToken};
pub use queue::FanoutQueue;
pub use ranking::{AffinityResolver, FeedScorer, RankingWeights, WeightedScorer};

use std::future::Future;
use std::time::Duration;

use crate::error::{AppError, Result};

/// Run a store call under a deadline. Store errors pass through untouched;
/// an elapsed deadline becomes [`AppError::Timeout`].
pub(crate) async fn call_store<T, F>(operation: &str, timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    resilience::with_timeout(timeout, fut)
        .await
        .map_err(|e| AppError::from_timeout(operation, e))?
}
