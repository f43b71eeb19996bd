//! Retry strategies for broker connection attempts.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use repeater_protocol::codec::duration_ms;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::BusError;

/// Decides whether, and after how long, a failed attempt is retried.
pub trait RetryStrategy: Send + Sync {
    /// Returns the delay after failed attempt `attempt` (1-based), or `None`
    /// to give up.
    fn delay_for_attempt(&self, attempt: u32) -> Option<Duration>;
}

/// Settings for [`ExponentialBackoff`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
    /// Delay after the first failed attempt.
    #[serde(rename = "initial_delay_ms", with = "duration_ms")]
    pub initial_delay: Duration,
    /// Backoff cap.
    #[serde(rename = "max_delay_ms", with = "duration_ms")]
    pub max_delay: Duration,
    /// Multiplier applied per attempt.
    pub backoff_factor: f64,
    /// Attempts before giving up; `0` retries forever.
    pub max_attempts: u32,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(15),
            backoff_factor: 2.0,
            max_attempts: 10,
        }
    }
}

/// Exponential backoff with ±25% jitter.
#[derive(Debug, Clone, Default)]
pub struct ExponentialBackoff {
    options: RetryOptions,
}

impl ExponentialBackoff {
    pub fn new(options: RetryOptions) -> Self {
        Self { options }
    }

    /// The delay before jitter is applied.
    fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.options.initial_delay.as_secs_f64() * self.options.backoff_factor.powi(exp);
        Duration::from_secs_f64(secs.min(self.options.max_delay.as_secs_f64()).max(0.0))
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        if self.options.max_attempts != 0 && attempt >= self.options.max_attempts {
            return None;
        }
        let capped = self.base_delay(attempt).as_secs_f64();
        let jitter = capped * 0.25;
        let offset = if jitter > 0.0 {
            rand::thread_rng().gen_range(-jitter..=jitter)
        } else {
            0.0
        };
        Some(Duration::from_secs_f64((capped + offset).max(0.0)))
    }
}

/// Runs `op` until it succeeds, the strategy gives up, or `cancel` fires.
///
/// `op` receives the 1-based attempt number. Exhaustion yields
/// [`BusError::ConnectFailed`] carrying the last error; cancellation yields
/// [`BusError::Closed`].
pub async fn retry<T, F, Fut>(
    strategy: &dyn RetryStrategy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, BusError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, BusError>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt = attempt.saturating_add(1);
        let error = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        let Some(delay) = strategy.delay_for_attempt(attempt) else {
            return Err(BusError::ConnectFailed {
                attempts: attempt,
                reason: error.to_string(),
            });
        };

        warn!(
            attempt,
            error = %error,
            delay_ms = delay.as_millis() as u64,
            "connection attempt failed, retrying"
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(BusError::Closed),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
