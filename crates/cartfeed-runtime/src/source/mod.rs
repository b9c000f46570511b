//! Source collaborator: the partitioned, paged change log being monitored.

mod memory;

pub use memory::InMemoryChangeFeed;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::error::FeedError;
use crate::identity::{PartitionId, Seq};
use crate::models::{ChangeRecord, PartitionDescriptor, ReadMetrics};
use crate::options::StartFrom;

/// Position a page read starts from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadPosition {
    Beginning,
    Now,
    Time(DateTime<Utc>),
    /// Strictly after the given sequence number.
    After(Seq),
}

impl ReadPosition {
    /// Resume point for a partition: its checkpoint when present, otherwise the start policy.
    pub fn resume(checkpoint: Option<Seq>, start_from: &StartFrom) -> Self {
        match (checkpoint, start_from) {
            (Some(seq), _) => ReadPosition::After(seq),
            (None, StartFrom::Beginning) => ReadPosition::Beginning,
            (None, StartFrom::Now) => ReadPosition::Now,
            (None, StartFrom::Time(at)) => ReadPosition::Time(*at),
        }
    }
}

/// One bounded page of changes.
#[derive(Clone, Debug, PartialEq)]
pub struct FeedPage {
    pub records: Vec<ChangeRecord>,
    /// Resume the next read strictly after this sequence number.
    pub continuation: Seq,
    pub metrics: ReadMetrics,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SourceError {
    #[error("transient source error: {0}")]
    Transient(String),
    #[error("partition {0} is gone")]
    Gone(PartitionId),
    #[error("partition {partition_id}: {detail}")]
    OutOfRange {
        partition_id: PartitionId,
        detail: String,
    },
    #[error("source unavailable: {0}")]
    Unavailable(String),
}

impl From<SourceError> for FeedError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::Transient(msg) => FeedError::TransientIo(msg),
            SourceError::Gone(partition_id) => FeedError::PartitionGone { partition_id },
            SourceError::OutOfRange {
                partition_id,
                detail,
            } => FeedError::CheckpointOutOfRange {
                partition_id,
                detail,
            },
            SourceError::Unavailable(msg) => FeedError::Unavailable(msg),
        }
    }
}

/// Partitioned, ordered, paged read access to the monitored store's change log.
#[async_trait]
pub trait ChangeFeedSource: Send + Sync {
    /// Current set of live partitions. Must be idempotent.
    async fn list_partitions(&self) -> Result<Vec<PartitionDescriptor>, SourceError>;

    /// Reads at most `max_items` changes of `partition_id` in sequence order.
    ///
    /// Returns `OutOfRange` when `position` falls before the retention window
    /// and `Gone` once the partition has been split or merged away.
    async fn read_page(
        &self,
        partition_id: &str,
        position: &ReadPosition,
        max_items: usize,
    ) -> Result<FeedPage, SourceError>;
}
