//! Identifiers shared by the processor components.

/// Source partition identifier (a physical partition or key range).
pub type PartitionId = String;

/// Processor instance name; distinguishes workers that share one lease set.
pub type WorkerId = String;

/// Monotonic logical sequence number of a change in the source log.
pub type Seq = u64;
