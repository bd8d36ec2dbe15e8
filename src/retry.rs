//! Backoff policies and the retry helper.
//!
//! Two policies share the same exponential-backoff-with-jitter math:
//!
//! - [`RetryConfig`] drives optional publish retries in the
//!   [`Publisher`](crate::Publisher). Only [`RpcError::NotConnected`] is
//!   retried; every other error fails immediately.
//! - [`ReconnectPolicy`] drives the connection manager's background
//!   reconnect loop.
//!
//! Delays grow by `multiplier` after each attempt, are capped at
//! `max_delay`, and every sleep is randomized by ±25% so that many clients
//! losing the same broker do not reconnect in lockstep.

use std::collections::hash_map::RandomState;
use std::future::Future;
use std::hash::BuildHasher;
use std::time::Duration;
use tokio::time::sleep;

use crate::log_debug;

/// Publish retry configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt (0 = no retries).
    pub max_attempts: u32,

    /// Backoff multiplier applied to the delay after each retry.
    pub multiplier: f32,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Upper bound on the delay between retries.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    /// - `max_attempts`: 3
    /// - `multiplier`: 2.0
    /// - `initial_delay`: 100ms
    /// - `max_delay`: 5s
    fn default() -> Self {
        // ---
        Self {
            max_attempts: 3,
            multiplier: 2.0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Reconnect policy for the connection manager.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect attempt.
    pub initial_delay: Duration,

    /// Backoff multiplier applied after each failed attempt.
    pub multiplier: f32,

    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,

    /// Give up after this many failed attempts; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    /// 500ms base, doubling, capped at 30s, unlimited attempts.
    fn default() -> Self {
        // ---
        Self {
            initial_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

/// Next backoff delay: `min(current * multiplier, max_delay)`.
pub(crate) fn next_delay(current: Duration, multiplier: f32, max_delay: Duration) -> Duration {
    // ---
    let grown = current.as_secs_f64() * f64::from(multiplier.max(1.0));
    Duration::from_secs_f64(grown.min(max_delay.as_secs_f64()))
}

/// Apply ±25% jitter to a duration.
///
/// Uses a simple multiplicative jitter: `delay * (0.75 + random(0.0..0.5))`
pub(crate) fn apply_jitter(delay: Duration) -> Duration {
    // ---
    let random_state = RandomState::new();
    let hash = random_state.hash_one(std::time::SystemTime::now());

    let random_factor = (hash % 1000) as f64 / 1000.0;
    let jitter_multiplier = 0.75 + (random_factor * 0.5);

    Duration::from_secs_f64(delay.as_secs_f64() * jitter_multiplier)
}

/// Retry an async operation with exponential backoff.
///
/// Retries only errors for which [`RpcError::is_retryable`] holds. With
/// `retry_config == None` the operation runs exactly once.
pub(crate) async fn retry_with_backoff<F, Fut, T>(
    retry_config: Option<&RetryConfig>,
    mut operation: F,
) -> crate::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = crate::Result<T>>,
{
    let Some(retry_config) = retry_config else {
        return operation().await;
    };

    let mut attempt = 0;
    let mut current_delay = retry_config.initial_delay;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(err) if err.is_retryable() => {
                attempt += 1;

                if attempt > retry_config.max_attempts {
                    log_debug!(
                        "retry exhausted after {} attempts, last error: {err}",
                        retry_config.max_attempts
                    );
                    return Err(err);
                }

                let jittered_delay = apply_jitter(current_delay);

                log_debug!(
                    "retry attempt {attempt}/{}, waiting {jittered_delay:?} (error: {err})",
                    retry_config.max_attempts
                );

                sleep(jittered_delay).await;

                current_delay =
                    next_delay(current_delay, retry_config.multiplier, retry_config.max_delay);
            }
            Err(err) => return Err(err),
        }
    }
}
