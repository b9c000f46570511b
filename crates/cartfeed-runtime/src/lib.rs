//! Lease-coordinated change-feed processor.
//!
//! A processor consumes a partitioned, append-only change log with one or
//! more competing workers. Partition ownership and read position live in
//! versioned leases, so each partition is processed by one worker at a time
//! and resumes from its checkpoint after crashes and rebalances. Batches are
//! delivered to a [`ChangeHandler`] at least once, in order within a partition.

pub mod controller;
pub mod dispatcher;
pub mod enumerator;
pub mod error;
pub mod handler;
pub mod identity;
pub mod lease;
pub mod models;
pub mod options;
pub mod reader;
pub mod retry;
pub mod signal;
pub mod source;

#[cfg(test)]
mod test_support;

pub use controller::{HaltedPartition, ProcessorBuilder, ProcessorController};
pub use dispatcher::{Delivery, DeliveryOutcome, Dispatcher};
pub use enumerator::{PartitionEnumerator, SyncOutcome};
pub use error::{FeedError, Result};
pub use handler::{handler_fn, ChangeHandler, FnHandler, HandlerError, PartitionContext};
pub use identity::{PartitionId, Seq, WorkerId};
pub use lease::{
    plan, InMemoryLeaseRepository, LeaseHandle, LeaseManager, LeaseRepository, RebalancePlan,
};
#[cfg(feature = "lease-postgres")]
pub use lease::PostgresLeaseRepository;
#[cfg(feature = "sqlite-persistence")]
pub use lease::SqliteLeaseRepository;
pub use models::{
    ChangeRecord, HandlerBatch, LeaseRecord, LeaseStatus, PartitionDescriptor, ReadMetrics,
    WorkerPresence,
};
pub use options::{FailurePolicy, ProcessorOptions, StartFrom};
pub use reader::FeedReader;
pub use retry::RetryPolicy;
pub use signal::{stop_channel, StopHandle, StopSignal};
pub use source::{ChangeFeedSource, FeedPage, InMemoryChangeFeed, ReadPosition, SourceError};
