/// Timeout and cancellation wrappers for async operations
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;

#[derive(Debug, thiserror::Error)]
pub enum TimeoutError {
    #[error("Operation timed out after {0:?}")]
    Elapsed(Duration),
    #[error("Operation cancelled")]
    Cancelled,
}

/// Execute a future with timeout
pub async fn with_timeout<F, T>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    timeout(duration, future)
        .await
        .map_err(|_| TimeoutError::Elapsed(duration))
}

/// Drive `future` until it completes or `shutdown` flips to `true`.
///
/// A dropped sender never cancels.
pub async fn with_cancellation<F, T>(
    shutdown: &mut watch::Receiver<bool>,
    future: F,
) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    if *shutdown.borrow() {
        return Err(TimeoutError::Cancelled);
    }

    tokio::select! {
        biased;
        _ = wait_for_shutdown(shutdown) => Err(TimeoutError::Cancelled),
        output = future => Ok(output),
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
