//! Partition discovery and lease bookkeeping for splits and merges.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::info;

use crate::error::FeedError;
use crate::identity::{PartitionId, Seq};
use crate::lease::LeaseManager;
use crate::models::{LeaseRecord, PartitionDescriptor};
use crate::retry::{retry_transient, RetryPolicy};
use crate::source::ChangeFeedSource;

/// Result of one enumeration pass.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SyncOutcome {
    pub partitions: Vec<PartitionDescriptor>,
    /// Partitions whose lease was created by this pass.
    pub discovered: Vec<PartitionId>,
    /// Parent partitions whose lease was deleted by this pass.
    pub retired: Vec<PartitionId>,
}

pub struct PartitionEnumerator {
    source: Arc<dyn ChangeFeedSource>,
    io_retry: RetryPolicy,
}

/// Checkpoint a child partition starts from: the lowest parent checkpoint, or
/// none when any parent is missing or has not checkpointed yet.
fn inherited_checkpoint(
    partition: &PartitionDescriptor,
    leases: &HashMap<&str, &LeaseRecord>,
) -> Option<Seq> {
    if partition.parents.is_empty() {
        return None;
    }
    partition
        .parents
        .iter()
        .map(|parent| leases.get(parent.as_str()).and_then(|l| l.checkpoint))
        .collect::<Option<Vec<Seq>>>()?
        .into_iter()
        .min()
}

impl PartitionEnumerator {
    pub fn new(source: Arc<dyn ChangeFeedSource>, io_retry: RetryPolicy) -> Self {
        Self { source, io_retry }
    }

    pub async fn list_partitions(&self) -> Result<Vec<PartitionDescriptor>, FeedError> {
        retry_transient(&self.io_retry, "list partitions", || {
            self.source.list_partitions()
        })
        .await
    }

    /// Creates leases for new partitions and retires leases of split or merged parents.
    pub async fn sync(&self, leases: &LeaseManager) -> Result<SyncOutcome, FeedError> {
        let partitions = self.list_partitions().await?;
        let existing = leases.list_leases().await?;
        let by_id: HashMap<&str, &LeaseRecord> = existing
            .iter()
            .map(|l| (l.partition_id.as_str(), l))
            .collect();

        let mut outcome = SyncOutcome::default();
        for partition in &partitions {
            if by_id.contains_key(partition.id.as_str()) {
                continue;
            }
            let checkpoint = inherited_checkpoint(partition, &by_id);
            if !partition.parents.is_empty() {
                info!(
                    "partition {} replaces {:?}; starting from inherited checkpoint {:?}",
                    partition.id, partition.parents, checkpoint
                );
            }
            if leases.ensure_lease(partition, checkpoint).await? {
                outcome.discovered.push(partition.id.clone());
            }
        }

        let live: HashSet<&str> = partitions.iter().map(|p| p.id.as_str()).collect();
        let parents: HashSet<&str> = partitions
            .iter()
            .flat_map(|p| p.parents.iter().map(String::as_str))
            .collect();
        for lease in &existing {
            let id = lease.partition_id.as_str();
            if !live.contains(id) && parents.contains(id) && leases.retire(lease).await? {
                outcome.retired.push(lease.partition_id.clone());
            }
        }

        outcome.partitions = partitions;
        Ok(outcome)
    }
}
