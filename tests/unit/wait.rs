//! Unit tests for the polling helpers

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use pgats::wait::{WaitError, eventually, eventually_true};

#[tokio::test]
async fn test_eventually_retries_until_ok() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let value = eventually(Duration::from_secs(1), Duration::from_millis(5), move || {
        let counter = counter.clone();
        async move {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= 3 { Ok(n) } else { Err(format!("attempt {n}")) }
        }
    })
    .await
    .unwrap();
    assert_eq!(value, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_eventually_returns_last_error() {
    let err = eventually(Duration::from_millis(30), Duration::from_millis(10), || async {
        Err::<(), _>("still failing".to_string())
    })
    .await
    .unwrap_err();
    match err {
        WaitError::Timeout { attempts, last } => {
            assert!(attempts >= 1);
            assert_eq!(last, "still failing");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_check_runs_at_least_once() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let result = eventually_true(Duration::ZERO, Duration::from_millis(10), move || {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            false
        }
    })
    .await;
    assert!(matches!(result, Err(WaitError::ConditionNotMet { attempts: 1 })));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_eventually_true_succeeds() {
    eventually_true(Duration::from_secs(1), Duration::from_millis(5), || async { true })
        .await
        .unwrap();
}
