//! Storage façade for partition leases and worker presence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::FeedError;
use crate::models::{LeaseRecord, WorkerPresence};

/// Lease store contract used by the lease manager and partition enumerator.
///
/// Implementations must make `compare_and_swap` and `delete` atomic with
/// respect to `version`: that check is the only thing preventing two workers
/// from owning the same partition.
#[async_trait]
pub trait LeaseRepository: Send + Sync {
    /// Insert `lease` at version 1 unless the partition already has a lease.
    ///
    /// Returns the stored record when it was created, `None` when one existed.
    async fn create_if_absent(&self, lease: &LeaseRecord)
        -> Result<Option<LeaseRecord>, FeedError>;

    async fn get(&self, processor: &str, partition_id: &str)
        -> Result<Option<LeaseRecord>, FeedError>;

    /// All leases of a processor, ordered by partition id.
    async fn list(&self, processor: &str) -> Result<Vec<LeaseRecord>, FeedError>;

    /// Replace the stored lease if its version still equals `expected_version`.
    ///
    /// The stored copy of `next` gets `expected_version + 1` and is returned.
    /// A missing lease or a version mismatch is `FeedError::Conflict`.
    async fn compare_and_swap(
        &self,
        expected_version: u64,
        next: &LeaseRecord,
    ) -> Result<LeaseRecord, FeedError>;

    /// Delete a lease if its version still equals `expected_version`.
    async fn delete(
        &self,
        processor: &str,
        partition_id: &str,
        expected_version: u64,
    ) -> Result<(), FeedError>;

    /// Create or refresh the presence record of a worker.
    async fn heartbeat_worker(&self, presence: &WorkerPresence) -> Result<(), FeedError>;

    async fn list_workers(&self, processor: &str) -> Result<Vec<WorkerPresence>, FeedError>;

    async fn remove_worker(&self, processor: &str, worker_id: &str) -> Result<(), FeedError>;

    /// Delete presence records of `processor` that expired before `now`.
    /// Returns how many were removed.
    async fn prune_workers(&self, processor: &str, now: DateTime<Utc>)
        -> Result<u64, FeedError>;
}

pub(crate) fn conflict(partition_id: &str) -> FeedError {
    FeedError::Conflict {
        partition_id: partition_id.to_string(),
    }
}

#[cfg(any(feature = "lease-postgres", feature = "sqlite-persistence"))]
pub(crate) mod sql {
    use chrono::{DateTime, TimeZone, Utc};

    use crate::error::FeedError;

    pub(crate) fn map_driver_err(prefix: &str, e: impl std::fmt::Display) -> FeedError {
        FeedError::TransientIo(format!("{prefix}: {e}"))
    }

    pub(crate) fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
        dt.timestamp_millis()
    }

    pub(crate) fn ms_to_dt(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub(crate) fn seq_to_sql(seq: u64) -> i64 {
        i64::try_from(seq).unwrap_or(i64::MAX)
    }

    pub(crate) fn sql_to_seq(value: i64) -> u64 {
        u64::try_from(value).unwrap_or_default()
    }
}
