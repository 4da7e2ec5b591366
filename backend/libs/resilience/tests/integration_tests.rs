/// Integration tests for resilience library
use resilience::{
    retry::{with_retry, Backoff, RetryConfig, RetryError},
    timeout::{with_cancellation, with_timeout, TimeoutError},
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

// ==================== Retry + Timeout ====================

#[tokio::test]
async fn test_retry_around_timed_out_calls() {
    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_clone = attempts.clone();

    let result = with_retry(RetryConfig::linear(2, Duration::from_millis(5)), move || {
        let n = attempts_clone.fetch_add(1, Ordering::SeqCst);
        async move {
            with_timeout(Duration::from_millis(20), async move {
                if n == 0 {
                    // First call hangs past the deadline
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                n
            })
            .await
        }
    })
    .await;

    assert_eq!(result.unwrap(), 1);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_retry_exhaustion_reports_timeout() {
    let result = with_retry(RetryConfig::linear(1, Duration::from_millis(1)), || async {
        with_timeout(Duration::from_millis(5), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
        })
        .await
    })
    .await;

    match result {
        Err(RetryError::Exhausted {
            attempts,
            last_error,
        }) => {
            assert_eq!(attempts, 2);
            assert!(matches!(last_error, TimeoutError::Elapsed(_)));
        }
        other => panic!("expected exhaustion, got {:?}", other),
    }
}

#[test]
fn test_linear_delays_strictly_increase() {
    let backoff = Backoff::Linear {
        step: Duration::from_millis(250),
    };
    let delays: Vec<Duration> = (1..=4).map(|n| backoff.delay_for(n)).collect();
    assert!(delays.windows(2).all(|w| w[0] < w[1]));
}

// ==================== Cancellation ====================

#[tokio::test]
async fn test_cancellation_stops_retry_loop() {
    let (tx, mut rx) = watch::channel(false);
    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_clone = attempts.clone();

    let handle = tokio::spawn(async move {
        with_cancellation(
            &mut rx,
            with_retry(RetryConfig::linear(100, Duration::from_millis(20)), move || {
                attempts_clone.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>("store unavailable") }
            }),
        )
        .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    tx.send(true).unwrap();

    let result = handle.await.unwrap();
    assert!(matches!(result, Err(TimeoutError::Cancelled)));
    assert!(attempts.load(Ordering::SeqCst) < 100);
}
