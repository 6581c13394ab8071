//! Bounded retry around engine calls
//!
//! The engines never retry on their own. Background loops wrap their reads
//! and deletions here: a constant interval, a fixed attempt budget, and only
//! errors that [`Error::is_transient`] admits are tried again.

use crate::error::{Error, Result};
use backoff::ExponentialBackoffBuilder;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

pub const RETRY_INTERVAL: Duration = Duration::from_secs(1);
pub const RETRY_ATTEMPTS: u32 = 3;

/// Run `op` up to [`RETRY_ATTEMPTS`] times, one second apart
pub async fn with_retry<T, F, Fut>(op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_with(RETRY_INTERVAL, RETRY_ATTEMPTS, op).await
}

/// Run `op` up to `attempts` times with a constant `interval`
pub async fn retry_with<T, F, Fut>(interval: Duration, attempts: u32, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    // Multiplier 1 and no jitter makes the exponential policy constant.
    let policy = ExponentialBackoffBuilder::new()
        .with_initial_interval(interval)
        .with_max_interval(interval)
        .with_multiplier(1.0)
        .with_randomization_factor(0.0)
        .with_max_elapsed_time(None)
        .build();

    let mut attempt = 0u32;
    backoff::future::retry_notify(
        policy,
        || {
            attempt += 1;
            let last = attempt >= attempts.max(1);
            let fut = op();
            async move {
                fut.await.map_err(|e| {
                    if e.is_transient() && !last {
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            }
        },
        |e: Error, wait: Duration| {
            warn!(error = %e, retry_in_ms = wait.as_millis() as u64, "Transient failure, retrying");
        },
    )
    .await
}
