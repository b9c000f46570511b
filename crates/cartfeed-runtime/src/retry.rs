//! Exponential backoff shared by enumeration, lease writes, page fetches and handler retries.

use std::future::Future;
use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::FeedError;

/// Exponential backoff with a ceiling on attempts and on the delay between them.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    #[serde(rename = "initial_backoff_ms", with = "crate::options::millis")]
    pub initial_backoff: Duration,
    #[serde(rename = "max_backoff_ms", with = "crate::options::millis")]
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given (1-based) failed attempt.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30) as i32;
        let ms = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = ms.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    pub(crate) fn validate(&self, name: &str) -> Result<(), FeedError> {
        if self.max_attempts == 0 {
            return Err(FeedError::Configuration(format!(
                "{name}.max_attempts must be at least 1"
            )));
        }
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            return Err(FeedError::Configuration(format!(
                "{name}.multiplier must be >= 1.0"
            )));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(FeedError::Configuration(format!(
                "{name}.initial_backoff must not exceed max_backoff"
            )));
        }
        Ok(())
    }
}

/// Runs `op` until it succeeds, fails with a non-transient error, or the
/// attempt budget runs out. An exhausted budget turns into `Unavailable`.
pub async fn retry_transient<T, E, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, FeedError>
where
    E: Into<FeedError>,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err.into(),
        };
        if !err.is_transient() {
            return Err(err);
        }
        if attempt >= policy.max_attempts {
            return Err(FeedError::Unavailable(format!(
                "{what}: {err} (gave up after {attempt} attempts)"
            )));
        }
        let delay = policy.backoff_for(attempt);
        warn!(
            "{what} failed (attempt {attempt}/{}): {err}; retrying in {delay:?}",
            policy.max_attempts
        );
        tokio::time::sleep(delay).await;
    }
}
