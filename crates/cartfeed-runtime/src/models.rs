//! Runtime domain models: partitions, change records, batches and leases.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::identity::{PartitionId, Seq, WorkerId};

/// A source partition as reported by the partition enumerator.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartitionDescriptor {
    pub id: PartitionId,
    /// Partitions this one was split from or merged out of.
    pub parents: Vec<PartitionId>,
}

impl PartitionDescriptor {
    pub fn root(id: impl Into<PartitionId>) -> Self {
        Self {
            id: id.into(),
            parents: Vec::new(),
        }
    }

    pub fn child_of(id: impl Into<PartitionId>, parents: Vec<PartitionId>) -> Self {
        Self {
            id: id.into(),
            parents,
        }
    }
}

/// The current state of one source entity at the time it changed.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ChangeRecord {
    pub partition_id: PartitionId,
    pub seq: Seq,
    pub timestamp: DateTime<Utc>,
    pub key: String,
    pub document: serde_json::Value,
}

impl ChangeRecord {
    /// Deserializes the document into a typed entity.
    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(&self.document)
    }
}

/// Read-consumption metrics and latency of the page a batch came from.
///
/// Informational only: nothing in the processor branches on these values.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ReadMetrics {
    /// Read units charged by the source for the page.
    pub request_charge: f64,
    /// Session token a reader can hand to another client for session consistency.
    pub session_token: Option<String>,
    /// Client-side latency of the page fetch.
    pub elapsed: Duration,
}

/// Ordered changes of one partition delivered to the handler in one call.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HandlerBatch {
    pub partition_id: PartitionId,
    pub records: Vec<ChangeRecord>,
    pub metrics: ReadMetrics,
}

impl HandlerBatch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn first_seq(&self) -> Option<Seq> {
        self.records.first().map(|r| r.seq)
    }

    pub fn last_seq(&self) -> Option<Seq> {
        self.records.last().map(|r| r.seq)
    }
}

/// Ownership state derived from a lease record at a point in time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaseStatus {
    Unleased,
    Leased,
    Expired,
}

/// Persisted ownership and checkpoint of one partition.
///
/// Every mutation is a compare-and-swap on `version`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaseRecord {
    pub processor: String,
    pub partition_id: PartitionId,
    pub owner: Option<WorkerId>,
    pub expires_at: Option<DateTime<Utc>>,
    pub acquired_at: Option<DateTime<Utc>>,
    /// Last sequence number fully processed; `None` means start policy applies.
    pub checkpoint: Option<Seq>,
    pub version: u64,
}

impl LeaseRecord {
    pub fn new(
        processor: impl Into<String>,
        partition_id: impl Into<PartitionId>,
        checkpoint: Option<Seq>,
    ) -> Self {
        Self {
            processor: processor.into(),
            partition_id: partition_id.into(),
            owner: None,
            expires_at: None,
            acquired_at: None,
            checkpoint,
            version: 0,
        }
    }

    pub fn status(&self, now: DateTime<Utc>) -> LeaseStatus {
        match (&self.owner, self.expires_at) {
            (None, _) => LeaseStatus::Unleased,
            (Some(_), Some(expires_at)) if now <= expires_at => LeaseStatus::Leased,
            (Some(_), _) => LeaseStatus::Expired,
        }
    }

    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        self.status(now) != LeaseStatus::Leased
    }

    pub fn is_held_by(&self, worker_id: &str, now: DateTime<Utc>) -> bool {
        self.status(now) == LeaseStatus::Leased && self.owner.as_deref() == Some(worker_id)
    }
}

/// Liveness record a worker heartbeats so peers can count it before it owns anything.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerPresence {
    pub processor: String,
    pub worker_id: WorkerId,
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use serde::Deserialize;

    use super::*;

    #[test]
    fn lease_status_follows_owner_and_expiry() {
        let now = Utc::now();
        let mut lease = LeaseRecord::new("proc", "0", None);
        assert_eq!(lease.status(now), LeaseStatus::Unleased);
        assert!(lease.is_available(now));

        lease.owner = Some("a".into());
        lease.expires_at = Some(now + Duration::seconds(10));
        assert_eq!(lease.status(now), LeaseStatus::Leased);
        assert!(lease.is_held_by("a", now));
        assert!(!lease.is_held_by("b", now));
        assert!(!lease.is_available(now));

        let later = now + Duration::seconds(11);
        assert_eq!(lease.status(later), LeaseStatus::Expired);
        assert!(!lease.is_held_by("a", later));
        assert!(lease.is_available(later));
    }

    #[test]
    fn owner_without_expiry_counts_as_expired() {
        let mut lease = LeaseRecord::new("proc", "0", Some(4));
        lease.owner = Some("a".into());
        assert_eq!(lease.status(Utc::now()), LeaseStatus::Expired);
    }

    #[test]
    fn change_record_decodes_typed_document() {
        #[derive(Deserialize)]
        struct Doc {
            id: String,
            qty: u32,
        }
        let record = ChangeRecord {
            partition_id: "0".into(),
            seq: 7,
            timestamp: Utc::now(),
            key: "c1".into(),
            document: serde_json::json!({"id": "c1", "qty": 3}),
        };
        let doc: Doc = record.decode().expect("decode");
        assert_eq!(doc.id, "c1");
        assert_eq!(doc.qty, 3);
    }

    #[test]
    fn batch_reports_sequence_bounds() {
        let now = Utc::now();
        let record = |seq| ChangeRecord {
            partition_id: "0".into(),
            seq,
            timestamp: now,
            key: "k".into(),
            document: serde_json::Value::Null,
        };
        let batch = HandlerBatch {
            partition_id: "0".into(),
            records: vec![record(3), record(5), record(9)],
            metrics: ReadMetrics::default(),
        };
        assert_eq!(batch.first_seq(), Some(3));
        assert_eq!(batch.last_seq(), Some(9));
        assert_eq!(batch.len(), 3);
    }
}
