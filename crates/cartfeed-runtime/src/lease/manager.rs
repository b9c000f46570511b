//! Lease lifecycle for one worker: creation, acquisition, renewal, checkpoints, release.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use tokio::sync::Mutex;

use super::balance::{plan, RebalancePlan};
use super::repository::LeaseRepository;
use crate::error::FeedError;
use crate::identity::{PartitionId, Seq, WorkerId};
use crate::models::{LeaseRecord, PartitionDescriptor, WorkerPresence};
use crate::retry::{retry_transient, RetryPolicy};

/// An owned lease. All writes for the partition go through it so they are
/// serialized and always carry the latest known version.
#[derive(Debug)]
pub struct LeaseHandle {
    partition_id: PartitionId,
    token: String,
    record: Mutex<LeaseRecord>,
    lost: AtomicBool,
}

impl LeaseHandle {
    fn new(record: LeaseRecord) -> Self {
        Self {
            partition_id: record.partition_id.clone(),
            token: uuid::Uuid::new_v4().to_string(),
            record: Mutex::new(record),
            lost: AtomicBool::new(false),
        }
    }

    pub fn partition_id(&self) -> &str {
        &self.partition_id
    }

    /// Opaque token identifying this period of ownership.
    pub fn token(&self) -> &str {
        &self.token
    }

    pub async fn snapshot(&self) -> LeaseRecord {
        self.record.lock().await.clone()
    }

    pub async fn checkpoint(&self) -> Option<Seq> {
        self.record.lock().await.checkpoint
    }

    /// Held when not marked lost and the last known expiry is still ahead.
    pub async fn is_held(&self, worker_id: &str, now: DateTime<Utc>) -> bool {
        !self.is_lost() && self.record.lock().await.is_held_by(worker_id, now)
    }

    pub fn mark_lost(&self) {
        self.lost.store(true, Ordering::SeqCst);
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }
}

/// Lease manager bound to one processor and one worker identity.
pub struct LeaseManager {
    repository: Arc<dyn LeaseRepository>,
    processor: String,
    worker_id: WorkerId,
    lease_ttl: Duration,
    io_retry: RetryPolicy,
}

impl LeaseManager {
    pub fn new(
        repository: Arc<dyn LeaseRepository>,
        processor: impl Into<String>,
        worker_id: impl Into<WorkerId>,
        lease_ttl: Duration,
        io_retry: RetryPolicy,
    ) -> Self {
        Self {
            repository,
            processor: processor.into(),
            worker_id: worker_id.into(),
            lease_ttl,
            io_retry,
        }
    }

    pub fn processor(&self) -> &str {
        &self.processor
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub async fn list_leases(&self) -> Result<Vec<LeaseRecord>, FeedError> {
        retry_transient(&self.io_retry, "list leases", || {
            self.repository.list(&self.processor)
        })
        .await
    }

    pub async fn list_workers(&self) -> Result<Vec<WorkerPresence>, FeedError> {
        retry_transient(&self.io_retry, "list workers", || {
            self.repository.list_workers(&self.processor)
        })
        .await
    }

    /// Publishes this worker's presence until `now + lease_ttl` and drops
    /// presence records of workers that stopped heartbeating.
    pub async fn heartbeat(&self, now: DateTime<Utc>) -> Result<(), FeedError> {
        let presence = WorkerPresence {
            processor: self.processor.clone(),
            worker_id: self.worker_id.clone(),
            expires_at: now + self.lease_ttl,
        };
        retry_transient(&self.io_retry, "heartbeat worker presence", || {
            self.repository.heartbeat_worker(&presence)
        })
        .await?;
        let pruned = retry_transient(&self.io_retry, "prune worker presence", || {
            self.repository.prune_workers(&self.processor, now)
        })
        .await?;
        if pruned > 0 {
            debug!("pruned {pruned} expired worker presence record(s)");
        }
        Ok(())
    }

    pub async fn deregister(&self) -> Result<(), FeedError> {
        retry_transient(&self.io_retry, "remove worker presence", || {
            self.repository
                .remove_worker(&self.processor, &self.worker_id)
        })
        .await
    }

    /// Creates the lease of a newly discovered partition. Returns `true` when created.
    pub async fn ensure_lease(
        &self,
        partition: &PartitionDescriptor,
        checkpoint: Option<Seq>,
    ) -> Result<bool, FeedError> {
        let lease = LeaseRecord::new(self.processor.clone(), partition.id.clone(), checkpoint);
        let created = retry_transient(&self.io_retry, "create lease", || {
            self.repository.create_if_absent(&lease)
        })
        .await?;
        if created.is_some() {
            info!(
                "created lease for partition {} (checkpoint {:?})",
                partition.id, checkpoint
            );
        }
        Ok(created.is_some())
    }

    /// Deletes the lease of a retired partition. Returns `false` when it changed underneath us.
    pub async fn retire(&self, lease: &LeaseRecord) -> Result<bool, FeedError> {
        let result = retry_transient(&self.io_retry, "retire lease", || {
            self.repository
                .delete(&self.processor, &lease.partition_id, lease.version)
        })
        .await;
        match result {
            Ok(()) => {
                info!("retired lease of partition {}", lease.partition_id);
                Ok(true)
            }
            Err(FeedError::Conflict { .. }) => {
                warn!(
                    "lease of partition {} changed while retiring; will retry next sync",
                    lease.partition_id
                );
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Takes ownership of an unleased or expired lease.
    ///
    /// Returns `None` when the lease is held by another worker or another
    /// worker won the compare-and-swap.
    pub async fn acquire(
        &self,
        lease: &LeaseRecord,
        now: DateTime<Utc>,
    ) -> Result<Option<Arc<LeaseHandle>>, FeedError> {
        if !lease.is_available(now) && !lease.is_held_by(&self.worker_id, now) {
            return Ok(None);
        }
        let next = LeaseRecord {
            owner: Some(self.worker_id.clone()),
            expires_at: Some(now + self.lease_ttl),
            acquired_at: Some(now),
            ..lease.clone()
        };
        let result = retry_transient(&self.io_retry, "acquire lease", || {
            self.repository.compare_and_swap(lease.version, &next)
        })
        .await;
        match result {
            Ok(stored) => {
                info!(
                    "worker {} acquired partition {} (checkpoint {:?})",
                    self.worker_id, stored.partition_id, stored.checkpoint
                );
                Ok(Some(Arc::new(LeaseHandle::new(stored))))
            }
            Err(FeedError::Conflict { partition_id }) => {
                debug!("lost acquisition race for partition {partition_id}");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn swap_owned(
        &self,
        handle: &LeaseHandle,
        record: &mut LeaseRecord,
        next: LeaseRecord,
        what: &str,
    ) -> Result<(), FeedError> {
        if handle.is_lost() {
            return Err(FeedError::OwnershipLost {
                partition_id: handle.partition_id.clone(),
            });
        }
        let result = retry_transient(&self.io_retry, what, || {
            self.repository.compare_and_swap(record.version, &next)
        })
        .await;
        match result {
            Ok(stored) => {
                *record = stored;
                Ok(())
            }
            Err(FeedError::Conflict { partition_id }) => {
                handle.mark_lost();
                warn!(
                    "worker {} lost partition {partition_id} during {what}",
                    self.worker_id
                );
                Err(FeedError::OwnershipLost { partition_id })
            }
            Err(e) => Err(e),
        }
    }

    /// Extends the expiry of an owned lease.
    pub async fn renew(&self, handle: &LeaseHandle, now: DateTime<Utc>) -> Result<(), FeedError> {
        let mut record = handle.record.lock().await;
        let next = LeaseRecord {
            expires_at: Some(now + self.lease_ttl),
            ..record.clone()
        };
        self.swap_owned(handle, &mut record, next, "renew lease")
            .await
    }

    /// Advances the checkpoint of an owned lease; also extends its expiry.
    ///
    /// A value at or behind the stored checkpoint is a no-op.
    pub async fn checkpoint(
        &self,
        handle: &LeaseHandle,
        seq: Seq,
        now: DateTime<Utc>,
    ) -> Result<(), FeedError> {
        let mut record = handle.record.lock().await;
        if record.checkpoint.is_some_and(|current| current >= seq) {
            return Ok(());
        }
        let next = LeaseRecord {
            checkpoint: Some(seq),
            expires_at: Some(now + self.lease_ttl),
            ..record.clone()
        };
        self.swap_owned(handle, &mut record, next, "checkpoint")
            .await
    }

    /// Gives up ownership, keeping the checkpoint. Losing the race is not an error.
    pub async fn release(&self, handle: &LeaseHandle) -> Result<(), FeedError> {
        let mut record = handle.record.lock().await;
        if handle.is_lost() {
            return Ok(());
        }
        let next = LeaseRecord {
            owner: None,
            expires_at: None,
            acquired_at: None,
            ..record.clone()
        };
        match self
            .swap_owned(handle, &mut record, next, "release lease")
            .await
        {
            Ok(()) => {
                handle.mark_lost();
                info!(
                    "worker {} released partition {} at checkpoint {:?}",
                    self.worker_id, record.partition_id, record.checkpoint
                );
                Ok(())
            }
            Err(FeedError::OwnershipLost { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Rebalance plan for this worker over the observed leases and presences.
    pub fn plan(
        &self,
        leases: &[LeaseRecord],
        workers: &[WorkerPresence],
        excluded: &HashSet<PartitionId>,
        now: DateTime<Utc>,
    ) -> RebalancePlan {
        plan(&self.worker_id, leases, workers, excluded, now)
    }
}
