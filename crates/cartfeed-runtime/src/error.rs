//! Error taxonomy for the change-feed processor.

use thiserror::Error;

use crate::identity::PartitionId;

/// Errors raised by processor components.
///
/// Transient variants are retried inside the component that saw them;
/// partition-halting and fatal variants travel up to the controller.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FeedError {
    #[error("transient I/O failure: {0}")]
    TransientIo(String),
    #[error("lease version conflict on partition {partition_id}")]
    Conflict { partition_id: PartitionId },
    #[error("ownership of partition {partition_id} was lost")]
    OwnershipLost { partition_id: PartitionId },
    #[error("checkpoint of partition {partition_id} is outside the retention window: {detail}")]
    CheckpointOutOfRange {
        partition_id: PartitionId,
        detail: String,
    },
    #[error("partition {partition_id} was split or merged away")]
    PartitionGone { partition_id: PartitionId },
    #[error("handler failed on partition {partition_id} after {attempts} attempt(s): {message}")]
    HandlerFailure {
        partition_id: PartitionId,
        attempts: u32,
        message: String,
    },
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
    #[error("lifecycle error: {0}")]
    Lifecycle(&'static str),
}

impl FeedError {
    /// Errors worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, FeedError::TransientIo(_))
    }

    /// Errors that halt a single partition pipeline but leave the processor running.
    pub fn halts_partition(&self) -> bool {
        matches!(
            self,
            FeedError::CheckpointOutOfRange { .. } | FeedError::HandlerFailure { .. }
        )
    }

    /// Errors that stop the whole processor.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FeedError::Unavailable(_) | FeedError::Configuration(_)
        )
    }
}

pub type Result<T, E = FeedError> = std::result::Result<T, E>;
