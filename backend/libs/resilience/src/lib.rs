/// Resilience patterns shared by the feed services
///
/// - **Retry**: bounded retries with linear or exponential backoff, keeping the last error
/// - **Timeout**: time limits on every external call
/// - **Cancellation**: stop waiting on a future once a shutdown signal fires
///
/// # Example: batch write with linear backoff
///
/// ```rust,no_run
/// use resilience::{with_retry, RetryConfig};
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() {
///     let config = RetryConfig::linear(3, Duration::from_secs(1));
///
///     let result = with_retry(config, || async {
///         // Your store write here
///         Ok::<_, String>(())
///     })
///     .await;
/// }
/// ```
///
/// # Example: store query with timeout
///
/// ```rust,no_run
/// use resilience::with_timeout;
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() {
///     let result = with_timeout(Duration::from_secs(2), async {
///         // Your database query
///         Ok::<_, String>(())
///     })
///     .await;
/// }
/// ```

pub mod retry;
pub mod timeout;

// Re-export main types for convenience
pub use retry::{with_retry, with_retry_if, Backoff, RetryConfig, RetryError};
pub use timeout::{with_cancellation, with_timeout, TimeoutError};
