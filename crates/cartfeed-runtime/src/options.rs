//! Processor tuning knobs and start policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FeedError;
use crate::retry::RetryPolicy;

/// Where a partition without a checkpoint starts reading.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StartFrom {
    /// Earliest record still retained by the source.
    #[default]
    Beginning,
    /// Only changes made after the partition is first read.
    Now,
    /// Changes committed at or after the given instant.
    Time(DateTime<Utc>),
}

/// What the dispatcher does once a batch exhausts its handler attempts.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop the partition pipeline without advancing its checkpoint.
    #[default]
    Halt,
    /// Log the failure, checkpoint past the batch and keep going.
    SkipAndAdvance,
}

/// Lease, polling and delivery tuning for one processor instance.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProcessorOptions {
    /// How long an unrenewed lease stays valid.
    #[serde(rename = "lease_ttl_ms", with = "millis")]
    pub lease_ttl: Duration,
    /// How often an owner renews its leases; must be shorter than `lease_ttl`.
    #[serde(rename = "renew_interval_ms", with = "millis")]
    pub renew_interval: Duration,
    /// Period of the enumerate / rebalance / acquire pass.
    #[serde(rename = "acquire_interval_ms", with = "millis")]
    pub acquire_interval: Duration,
    /// Pause after an empty page before polling the partition again.
    #[serde(rename = "feed_poll_delay_ms", with = "millis")]
    pub feed_poll_delay: Duration,
    pub max_items_per_page: usize,
    #[serde(rename = "handler_timeout_ms", with = "millis")]
    pub handler_timeout: Duration,
    /// Backoff and attempt ceiling for handler calls on one batch.
    pub handler_retry: RetryPolicy,
    pub failure_policy: FailurePolicy,
    /// Backoff for source and lease-store I/O.
    pub io_retry: RetryPolicy,
    /// How long `stop` waits for in-flight handler calls.
    #[serde(rename = "shutdown_grace_ms", with = "millis")]
    pub shutdown_grace: Duration,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(60),
            renew_interval: Duration::from_secs(20),
            acquire_interval: Duration::from_secs(13),
            feed_poll_delay: Duration::from_secs(5),
            max_items_per_page: 100,
            handler_timeout: Duration::from_secs(60),
            handler_retry: RetryPolicy {
                max_attempts: 5,
                initial_backoff: Duration::from_millis(500),
                max_backoff: Duration::from_secs(30),
                multiplier: 2.0,
            },
            failure_policy: FailurePolicy::Halt,
            io_retry: RetryPolicy::default(),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl ProcessorOptions {
    pub fn validate(&self) -> Result<(), FeedError> {
        let positive = [
            ("lease_ttl", self.lease_ttl),
            ("renew_interval", self.renew_interval),
            ("acquire_interval", self.acquire_interval),
            ("handler_timeout", self.handler_timeout),
        ];
        for (name, value) in positive {
            if value.is_zero() {
                return Err(FeedError::Configuration(format!("{name} must be positive")));
            }
        }
        if self.renew_interval >= self.lease_ttl {
            return Err(FeedError::Configuration(format!(
                "renew_interval ({:?}) must be shorter than lease_ttl ({:?})",
                self.renew_interval, self.lease_ttl
            )));
        }
        if self.max_items_per_page == 0 {
            return Err(FeedError::Configuration(
                "max_items_per_page must be at least 1".into(),
            ));
        }
        self.handler_retry.validate("handler_retry")?;
        self.io_retry.validate("io_retry")?;
        Ok(())
    }

    pub(crate) fn lease_ttl_delta(&self) -> Result<chrono::Duration, FeedError> {
        chrono::Duration::from_std(self.lease_ttl)
            .map_err(|e| FeedError::Configuration(format!("lease_ttl out of range: {e}")))
    }
}

/// Serde adapter storing a `Duration` as whole milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
