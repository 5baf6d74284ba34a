//! Polling helpers for eventually-consistent conditions
//!
//! Certificate authentication taking effect or a janitor script completing a
//! cycle are observed by retrying a check at a fixed interval until a deadline.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WaitError<E: std::fmt::Display> {
    #[error("Timeout after {attempts} attempts waiting for condition; last error: {last}")]
    Timeout { attempts: u32, last: E },

    #[error("Timeout after {attempts} attempts waiting for condition")]
    ConditionNotMet { attempts: u32 },
}

/// Certificate authentication is given 30s to take effect
pub const CERT_AUTH_TIMEOUT: Duration = Duration::from_secs(30);
pub const CERT_AUTH_INTERVAL: Duration = Duration::from_secs(5);

/// Janitor counters and statefiles are polled for shorter windows
pub const JANITOR_TIMEOUT: Duration = Duration::from_secs(15);
pub const JANITOR_FAILURE_TIMEOUT: Duration = Duration::from_secs(10);
pub const JANITOR_INTERVAL: Duration = Duration::from_secs(2);

/// Retry `check` every `interval` until it returns `Ok` or `timeout` elapses
///
/// The check is always run at least once. On timeout the last error is returned.
pub async fn eventually<T, E, F, Fut>(
    timeout: Duration,
    interval: Duration,
    mut check: F,
) -> Result<T, WaitError<E>>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match check().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if tokio::time::Instant::now() + interval > deadline {
                    return Err(WaitError::Timeout { attempts, last: e });
                }
                tracing::debug!(attempt = attempts, error = %e, "Condition not met yet, retrying");
                tokio::time::sleep(interval).await;
            }
        }
    }
}

/// Retry a boolean predicate until it holds or `timeout` elapses
pub async fn eventually_true<F, Fut>(
    timeout: Duration,
    interval: Duration,
    mut predicate: F,
) -> Result<(), WaitError<String>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        if predicate().await {
            return Ok(());
        }
        if tokio::time::Instant::now() + interval > deadline {
            return Err(WaitError::ConditionNotMet { attempts });
        }
        tokio::time::sleep(interval).await;
    }
}
