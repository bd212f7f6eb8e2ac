/*!
 * Utility functions and helpers for benchfarm.
 *
 * Deadline and retry helpers shared by the connection factory and the
 * lifecycle dispatcher.
 */
use std::future::Future;
use std::time::{Duration, Instant};

use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::Error;

/// Run a future with a timeout
///
/// # Arguments
///
/// * `duration` - The timeout duration
/// * `future` - The future to run
///
/// # Returns
///
/// The result of the future, or [`Error::Timeout`] converted into the
/// caller's error type if the deadline passes first
pub async fn with_timeout<F, T, E>(duration: Duration, future: F) -> std::result::Result<T, E>
where
    F: Future<Output = std::result::Result<T, E>>,
    E: From<Error>,
{
    match timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(duration).into()),
    }
}

/// Exponential backoff policy
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_backoff: Duration,
    /// Upper bound on any single delay
    pub max_backoff: Duration,
    /// Growth factor applied after each failed attempt
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given failed attempt (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let millis = (self.initial_backoff.as_millis() as f64 * factor)
            .min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }
}

/// Run an operation until it succeeds, fails permanently or runs out of attempts
///
/// # Arguments
///
/// * `policy` - Attempt bound and backoff schedule
/// * `is_transient` - Decides whether an error is worth another attempt
/// * `operation` - Produces a fresh future for each attempt; receives the 1-based attempt number
///
/// # Returns
///
/// The first success, or the error of the last attempt made
pub async fn with_backoff<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    is_transient: P,
    mut operation: F,
) -> std::result::Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let start = Instant::now();
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!("Succeeded on attempt {}/{}", attempt, max_attempts);
                }
                return Ok(value);
            }
            Err(e) if attempt < max_attempts && is_transient(&e) => {
                let delay = policy.delay_after(attempt);
                warn!(
                    "Attempt {}/{} failed: {}; retrying in {:?}",
                    attempt, max_attempts, e, delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                warn!(
                    "Giving up after attempt {}/{} ({:?} elapsed): {}",
                    attempt,
                    max_attempts,
                    start.elapsed(),
                    e
                );
                return Err(e);
            }
        }
    }
}
