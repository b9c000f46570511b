//! In-process change feed with hash-range partitions, splits, merges and retention.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use super::{ChangeFeedSource, FeedPage, ReadPosition, SourceError};
use crate::identity::{PartitionId, Seq};
use crate::models::{ChangeRecord, PartitionDescriptor, ReadMetrics};

fn key_hash(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut buffer = [0u8; 8];
    buffer.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(buffer)
}

struct PartitionState {
    parents: Vec<PartitionId>,
    /// Inclusive key-hash ranges routed to this partition.
    ranges: Vec<(u64, u64)>,
    records: Vec<ChangeRecord>,
    /// Highest sequence number of this partition dropped by retention.
    trimmed_through: Seq,
    trimmed_at: Option<DateTime<Utc>>,
    gone: bool,
}

impl PartitionState {
    fn owns(&self, hash: u64) -> bool {
        self.ranges.iter().any(|(lo, hi)| *lo <= hash && hash <= *hi)
    }
}

struct FeedState {
    head: Seq,
    next_partition: u32,
    partitions: BTreeMap<PartitionId, PartitionState>,
    transient_failures: u32,
    unavailable: bool,
}

impl FeedState {
    fn next_id(&mut self) -> PartitionId {
        let id = self.next_partition.to_string();
        self.next_partition += 1;
        id
    }

    fn live(&self, partition_id: &str) -> Result<&PartitionState, SourceError> {
        match self.partitions.get(partition_id) {
            Some(p) if !p.gone => Ok(p),
            _ => Err(SourceError::Gone(partition_id.to_string())),
        }
    }

    fn check_reachable(&mut self) -> Result<(), SourceError> {
        if self.unavailable {
            return Err(SourceError::Unavailable("change feed is offline".into()));
        }
        if self.transient_failures > 0 {
            self.transient_failures -= 1;
            return Err(SourceError::Transient("injected transient failure".into()));
        }
        Ok(())
    }
}

/// Change feed held in memory.
///
/// Keys route to partitions by a sha2 hash of the key, so a split or merge
/// moves every retained record of a key range into the child partitions with
/// its original sequence number.
pub struct InMemoryChangeFeed {
    state: Mutex<FeedState>,
    charge_per_record: f64,
}

impl InMemoryChangeFeed {
    pub fn new(partition_count: u32) -> Self {
        let count = partition_count.max(1);
        let width = u64::MAX / u64::from(count);
        let mut partitions = BTreeMap::new();
        for i in 0..count {
            let lo = u64::from(i) * width;
            let hi = if i + 1 == count {
                u64::MAX
            } else {
                u64::from(i + 1) * width - 1
            };
            partitions.insert(
                i.to_string(),
                PartitionState {
                    parents: Vec::new(),
                    ranges: vec![(lo, hi)],
                    records: Vec::new(),
                    trimmed_through: 0,
                    trimmed_at: None,
                    gone: false,
                },
            );
        }
        Self {
            state: Mutex::new(FeedState {
                head: 0,
                next_partition: count,
                partitions,
                transient_failures: 0,
                unavailable: false,
            }),
            charge_per_record: 0.5,
        }
    }

    /// Read units charged per returned record, on top of one unit per page.
    pub fn with_charge_per_record(mut self, charge: f64) -> Self {
        self.charge_per_record = charge;
        self
    }

    fn state(&self) -> Result<MutexGuard<'_, FeedState>, SourceError> {
        self.state
            .lock()
            .map_err(|_| SourceError::Unavailable("change feed state poisoned".into()))
    }

    pub fn upsert(
        &self,
        key: &str,
        document: serde_json::Value,
    ) -> Result<ChangeRecord, SourceError> {
        self.upsert_at(key, document, Utc::now())
    }

    /// Appends a change for `key` with an explicit commit timestamp.
    pub fn upsert_at(
        &self,
        key: &str,
        document: serde_json::Value,
        timestamp: DateTime<Utc>,
    ) -> Result<ChangeRecord, SourceError> {
        let hash = key_hash(key);
        let mut state = self.state()?;
        let seq = state.head + 1;
        let (partition_id, partition) = state
            .partitions
            .iter_mut()
            .find(|(_, p)| !p.gone && p.owns(hash))
            .ok_or_else(|| SourceError::Unavailable(format!("no partition owns key {key}")))?;
        let record = ChangeRecord {
            partition_id: partition_id.clone(),
            seq,
            timestamp,
            key: key.to_string(),
            document,
        };
        partition.records.push(record.clone());
        state.head = seq;
        Ok(record)
    }

    /// Live partition a key currently routes to.
    pub fn partition_of(&self, key: &str) -> Result<PartitionId, SourceError> {
        let hash = key_hash(key);
        let state = self.state()?;
        state
            .partitions
            .iter()
            .find(|(_, p)| !p.gone && p.owns(hash))
            .map(|(id, _)| id.clone())
            .ok_or_else(|| SourceError::Unavailable(format!("no partition owns key {key}")))
    }

    pub fn head_seq(&self) -> Result<Seq, SourceError> {
        Ok(self.state()?.head)
    }

    /// Splits a live partition into two children that share its key ranges and records.
    pub fn split(&self, partition_id: &str) -> Result<(PartitionId, PartitionId), SourceError> {
        let mut state = self.state()?;
        let parent = state.live(partition_id)?;
        let (left_ranges, right_ranges) = match parent.ranges.as_slice() {
            [(lo, hi)] if lo < hi => {
                let mid = lo + (hi - lo) / 2;
                (vec![(*lo, mid)], vec![(mid + 1, *hi)])
            }
            [_] => {
                return Err(SourceError::Unavailable(format!(
                    "partition {partition_id} covers a single key hash"
                )))
            }
            ranges => {
                let (left, right) = ranges.split_at(ranges.len() / 2);
                (left.to_vec(), right.to_vec())
            }
        };
        let trimmed_through = parent.trimmed_through;
        let trimmed_at = parent.trimmed_at;

        let left_id = state.next_id();
        let right_id = state.next_id();
        let records = match state.partitions.get_mut(partition_id) {
            Some(parent) => {
                parent.gone = true;
                std::mem::take(&mut parent.records)
            }
            None => return Err(SourceError::Gone(partition_id.to_string())),
        };

        let mut left = PartitionState {
            parents: vec![partition_id.to_string()],
            ranges: left_ranges,
            records: Vec::new(),
            trimmed_through,
            trimmed_at,
            gone: false,
        };
        let mut right = PartitionState {
            parents: vec![partition_id.to_string()],
            ranges: right_ranges,
            records: Vec::new(),
            trimmed_through,
            trimmed_at,
            gone: false,
        };
        for mut record in records {
            if left.owns(key_hash(&record.key)) {
                record.partition_id = left_id.clone();
                left.records.push(record);
            } else {
                record.partition_id = right_id.clone();
                right.records.push(record);
            }
        }
        state.partitions.insert(left_id.clone(), left);
        state.partitions.insert(right_id.clone(), right);
        Ok((left_id, right_id))
    }

    /// Merges two live partitions into a new child.
    pub fn merge(&self, first: &str, second: &str) -> Result<PartitionId, SourceError> {
        let mut state = self.state()?;
        state.live(first)?;
        state.live(second)?;
        if first == second {
            return Err(SourceError::Unavailable(
                "cannot merge a partition with itself".into(),
            ));
        }
        let child_id = state.next_id();
        let mut child = PartitionState {
            parents: vec![first.to_string(), second.to_string()],
            ranges: Vec::new(),
            records: Vec::new(),
            trimmed_through: 0,
            trimmed_at: None,
            gone: false,
        };
        for parent_id in [first, second] {
            if let Some(parent) = state.partitions.get_mut(parent_id) {
                parent.gone = true;
                child.ranges.extend(parent.ranges.iter().copied());
                child.records.append(&mut parent.records);
                if parent.trimmed_through > child.trimmed_through {
                    child.trimmed_through = parent.trimmed_through;
                    child.trimmed_at = parent.trimmed_at;
                }
            }
        }
        child.records.sort_by_key(|r| r.seq);
        for record in &mut child.records {
            record.partition_id = child_id.clone();
        }
        state.partitions.insert(child_id.clone(), child);
        Ok(child_id)
    }

    /// Drops every record with a sequence number up to and including `seq`.
    pub fn trim_through(&self, seq: Seq) -> Result<(), SourceError> {
        let mut state = self.state()?;
        for partition in state.partitions.values_mut() {
            let keep_from = partition.records.partition_point(|r| r.seq <= seq);
            if keep_from == 0 {
                continue;
            }
            if let Some(last) = partition.records.drain(..keep_from).last() {
                partition.trimmed_through = last.seq;
                partition.trimmed_at = Some(last.timestamp);
            }
        }
        Ok(())
    }

    /// Makes the next `count` calls fail with a transient error.
    pub fn inject_transient_failures(&self, count: u32) -> Result<(), SourceError> {
        self.state()?.transient_failures = count;
        Ok(())
    }

    pub fn set_unavailable(&self, unavailable: bool) -> Result<(), SourceError> {
        self.state()?.unavailable = unavailable;
        Ok(())
    }

    fn list_sync(&self) -> Result<Vec<PartitionDescriptor>, SourceError> {
        let mut state = self.state()?;
        state.check_reachable()?;
        Ok(state
            .partitions
            .iter()
            .filter(|(_, p)| !p.gone)
            .map(|(id, p)| PartitionDescriptor::child_of(id.clone(), p.parents.clone()))
            .collect())
    }

    fn read_sync(
        &self,
        partition_id: &str,
        position: &ReadPosition,
        max_items: usize,
    ) -> Result<FeedPage, SourceError> {
        let started = Instant::now();
        let mut state = self.state()?;
        state.check_reachable()?;
        let head = state.head;
        let partition = state.live(partition_id)?;

        let out_of_range = |detail: String| SourceError::OutOfRange {
            partition_id: partition_id.to_string(),
            detail,
        };
        let after = match position {
            ReadPosition::Beginning => partition.trimmed_through,
            ReadPosition::Now => head,
            ReadPosition::After(seq) => {
                if *seq < partition.trimmed_through {
                    return Err(out_of_range(format!(
                        "continuation {seq} predates retained changes (trimmed through {})",
                        partition.trimmed_through
                    )));
                }
                *seq
            }
            ReadPosition::Time(at) => {
                if let Some(trimmed_at) = partition.trimmed_at {
                    if *at <= trimmed_at {
                        return Err(out_of_range(format!(
                            "start time {at} predates retained changes (trimmed through {trimmed_at})"
                        )));
                    }
                }
                partition
                    .records
                    .iter()
                    .take_while(|r| r.timestamp < *at)
                    .last()
                    .map_or(partition.trimmed_through, |r| r.seq)
            }
        };

        let records: Vec<ChangeRecord> = partition
            .records
            .iter()
            .filter(|r| r.seq > after)
            .take(max_items)
            .cloned()
            .collect();
        let continuation = records.last().map_or(after, |r| r.seq);
        let request_charge = 1.0 + self.charge_per_record * records.len() as f64;
        Ok(FeedPage {
            records,
            continuation,
            metrics: ReadMetrics {
                request_charge,
                session_token: Some(format!("{partition_id}:{continuation}")),
                elapsed: started.elapsed(),
            },
        })
    }
}

#[async_trait]
impl ChangeFeedSource for InMemoryChangeFeed {
    async fn list_partitions(&self) -> Result<Vec<PartitionDescriptor>, SourceError> {
        self.list_sync()
    }

    async fn read_page(
        &self,
        partition_id: &str,
        position: &ReadPosition,
        max_items: usize,
    ) -> Result<FeedPage, SourceError> {
        self.read_sync(partition_id, position, max_items)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use serde_json::json;

    use super::*;

    fn seqs(page: &FeedPage) -> Vec<Seq> {
        page.records.iter().map(|r| r.seq).collect()
    }

    #[tokio::test]
    async fn pages_are_bounded_and_resumable() {
        let feed = InMemoryChangeFeed::new(1);
        for i in 0..5 {
            feed.upsert("cart-1", json!({ "n": i })).expect("upsert");
        }
        let first = feed
            .read_page("0", &ReadPosition::Beginning, 2)
            .await
            .expect("first page");
        assert_eq!(seqs(&first), vec![1, 2]);
        assert_eq!(first.continuation, 2);
        assert!(first.metrics.request_charge > 1.0);

        let rest = feed
            .read_page("0", &ReadPosition::After(first.continuation), 10)
            .await
            .expect("rest");
        assert_eq!(seqs(&rest), vec![3, 4, 5]);

        let empty = feed
            .read_page("0", &ReadPosition::After(5), 10)
            .await
            .expect("empty");
        assert!(empty.records.is_empty());
        assert_eq!(empty.continuation, 5);
    }

    #[tokio::test]
    async fn now_skips_existing_changes() {
        let feed = InMemoryChangeFeed::new(1);
        feed.upsert("a", json!(1)).expect("upsert");
        let page = feed
            .read_page("0", &ReadPosition::Now, 10)
            .await
            .expect("now");
        assert!(page.records.is_empty());
        feed.upsert("a", json!(2)).expect("upsert");
        let next = feed
            .read_page("0", &ReadPosition::After(page.continuation), 10)
            .await
            .expect("after now");
        assert_eq!(seqs(&next), vec![2]);
    }

    #[tokio::test]
    async fn trimmed_continuation_is_out_of_range() {
        let feed = InMemoryChangeFeed::new(1);
        for i in 0..4 {
            feed.upsert("a", json!(i)).expect("upsert");
        }
        feed.trim_through(2).expect("trim");
        let err = feed
            .read_page("0", &ReadPosition::After(1), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::OutOfRange { .. }));

        let ok = feed
            .read_page("0", &ReadPosition::After(2), 10)
            .await
            .expect("at horizon");
        assert_eq!(seqs(&ok), vec![3, 4]);
        let beginning = feed
            .read_page("0", &ReadPosition::Beginning, 10)
            .await
            .expect("beginning");
        assert_eq!(seqs(&beginning), vec![3, 4]);
    }

    #[tokio::test]
    async fn start_time_before_retention_is_out_of_range() {
        let feed = InMemoryChangeFeed::new(1);
        let t0 = Utc::now() - Duration::hours(2);
        feed.upsert_at("a", json!(1), t0).expect("upsert");
        feed.upsert_at("a", json!(2), t0 + Duration::hours(1))
            .expect("upsert");
        feed.trim_through(1).expect("trim");
        let err = feed
            .read_page("0", &ReadPosition::Time(t0 - Duration::minutes(1)), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::OutOfRange { .. }));

        let page = feed
            .read_page("0", &ReadPosition::Time(t0 + Duration::minutes(30)), 10)
            .await
            .expect("inside retention");
        assert_eq!(seqs(&page), vec![2]);
    }

    #[tokio::test]
    async fn split_moves_records_to_children_and_retires_parent() {
        let feed = InMemoryChangeFeed::new(1);
        for i in 0..20 {
            feed.upsert(&format!("cart-{i}"), json!(i)).expect("upsert");
        }
        let (left, right) = feed.split("0").expect("split");
        let partitions = feed.list_partitions().await.expect("list");
        let ids: Vec<_> = partitions.iter().map(|p| p.id.clone()).collect();
        assert_eq!(ids, vec![left.clone(), right.clone()]);
        assert!(partitions.iter().all(|p| p.parents == vec!["0".to_string()]));

        let err = feed
            .read_page("0", &ReadPosition::Beginning, 100)
            .await
            .unwrap_err();
        assert_eq!(err, SourceError::Gone("0".into()));

        let l = feed
            .read_page(&left, &ReadPosition::Beginning, 100)
            .await
            .expect("left");
        let r = feed
            .read_page(&right, &ReadPosition::Beginning, 100)
            .await
            .expect("right");
        assert_eq!(l.records.len() + r.records.len(), 20);
        assert!(l.records.iter().all(|rec| rec.partition_id == left));

        let next = feed.upsert("cart-3", json!("again")).expect("upsert");
        assert_eq!(next.partition_id, feed.partition_of("cart-3").expect("route"));
    }

    #[tokio::test]
    async fn merge_combines_parents_in_sequence_order() {
        let feed = InMemoryChangeFeed::new(2);
        for i in 0..10 {
            feed.upsert(&format!("k{i}"), json!(i)).expect("upsert");
        }
        let child = feed.merge("0", "1").expect("merge");
        let page = feed
            .read_page(&child, &ReadPosition::Beginning, 100)
            .await
            .expect("child page");
        assert_eq!(seqs(&page), (1..=10).collect::<Vec<_>>());
        let listed = feed.list_partitions().await.expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].parents, vec!["0".to_string(), "1".to_string()]);
    }

    #[tokio::test]
    async fn injected_failures_are_transient_then_clear() {
        let feed = InMemoryChangeFeed::new(1);
        feed.inject_transient_failures(1).expect("inject");
        assert!(matches!(
            feed.list_partitions().await,
            Err(SourceError::Transient(_))
        ));
        assert_eq!(feed.list_partitions().await.expect("list").len(), 1);
    }
}
