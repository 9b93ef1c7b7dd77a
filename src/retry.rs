//! Bounded retry with exponential backoff.
//!
//! Only the post-clone existence probe retries automatically; everything else
//! in the core fails fast and leaves retries to the caller.

use crate::error::{Error, Result};
use backoff::ExponentialBackoff;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Parameters of an exponential backoff schedule
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial_interval: Duration,
    pub multiplier: f64,
    /// Jitter applied to each interval (0.1 = ±10 %)
    pub randomization_factor: f64,
    pub max_interval: Duration,
    /// Total time budget; once spent the last error is returned
    pub max_elapsed: Duration,
}

impl BackoffPolicy {
    /// Schedule used to confirm a clone exists after the appliance lost
    /// track of the clone job
    pub fn volume_probe() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            multiplier: 2.0,
            randomization_factor: 0.1,
            max_interval: Duration::from_secs(30),
            max_elapsed: Duration::from_secs(30),
        }
    }

    pub fn to_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.initial_interval,
            initial_interval: self.initial_interval,
            multiplier: self.multiplier,
            randomization_factor: self.randomization_factor,
            max_interval: self.max_interval,
            max_elapsed_time: Some(self.max_elapsed),
            ..ExponentialBackoff::default()
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::volume_probe()
    }
}

/// Run `op` until it succeeds, fails with an error `should_retry` rejects,
/// or the policy's elapsed-time budget runs out.
pub async fn retry_with_backoff<T, F, Fut, P>(
    policy: &BackoffPolicy,
    operation: &str,
    mut op: F,
    should_retry: P,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&Error) -> bool,
{
    let should_retry = &should_retry;
    backoff::future::retry_notify(
        policy.to_backoff(),
        || {
            let attempt = op();
            async move {
                attempt.await.map_err(|e| {
                    if should_retry(&e) {
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            }
        },
        |e: Error, delay: Duration| {
            debug!(operation, error = %e, ?delay, "Retrying");
        },
    )
    .await
}
