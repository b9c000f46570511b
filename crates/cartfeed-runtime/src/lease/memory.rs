//! In-process lease store for tests, demos and single-process deployments.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::repository::{conflict, LeaseRepository};
use crate::error::FeedError;
use crate::models::{LeaseRecord, WorkerPresence};

type Key = (String, String);

#[derive(Default)]
struct Tables {
    leases: BTreeMap<Key, LeaseRecord>,
    workers: BTreeMap<Key, WorkerPresence>,
}

/// Lease store held in memory. Clone the `Arc` around it to share between workers.
#[derive(Default)]
pub struct InMemoryLeaseRepository {
    tables: Mutex<Tables>,
    transient_failures: AtomicU32,
    offline: AtomicBool,
}

impl InMemoryLeaseRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` calls fail with a transient error.
    pub fn inject_transient_failures(&self, count: u32) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    /// While offline every call fails with a transient error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, FeedError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(FeedError::TransientIo("lease store offline".into()));
        }
        let injected = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(FeedError::TransientIo("injected lease store failure".into()));
        }
        self.tables
            .lock()
            .map_err(|_| FeedError::Unavailable("lease store state poisoned".into()))
    }

    fn key(processor: &str, id: &str) -> Key {
        (processor.to_string(), id.to_string())
    }
}

#[async_trait]
impl LeaseRepository for InMemoryLeaseRepository {
    async fn create_if_absent(
        &self,
        lease: &LeaseRecord,
    ) -> Result<Option<LeaseRecord>, FeedError> {
        let mut tables = self.tables()?;
        let key = Self::key(&lease.processor, &lease.partition_id);
        if tables.leases.contains_key(&key) {
            return Ok(None);
        }
        let stored = LeaseRecord {
            version: 1,
            ..lease.clone()
        };
        tables.leases.insert(key, stored.clone());
        Ok(Some(stored))
    }

    async fn get(
        &self,
        processor: &str,
        partition_id: &str,
    ) -> Result<Option<LeaseRecord>, FeedError> {
        let tables = self.tables()?;
        Ok(tables
            .leases
            .get(&Self::key(processor, partition_id))
            .cloned())
    }

    async fn list(&self, processor: &str) -> Result<Vec<LeaseRecord>, FeedError> {
        let tables = self.tables()?;
        Ok(tables
            .leases
            .values()
            .filter(|l| l.processor == processor)
            .cloned()
            .collect())
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        next: &LeaseRecord,
    ) -> Result<LeaseRecord, FeedError> {
        let mut tables = self.tables()?;
        let key = Self::key(&next.processor, &next.partition_id);
        match tables.leases.get_mut(&key) {
            Some(current) if current.version == expected_version => {
                *current = LeaseRecord {
                    version: expected_version + 1,
                    ..next.clone()
                };
                Ok(current.clone())
            }
            _ => Err(conflict(&next.partition_id)),
        }
    }

    async fn delete(
        &self,
        processor: &str,
        partition_id: &str,
        expected_version: u64,
    ) -> Result<(), FeedError> {
        let mut tables = self.tables()?;
        let key = Self::key(processor, partition_id);
        match tables.leases.get(&key) {
            Some(current) if current.version == expected_version => {
                tables.leases.remove(&key);
                Ok(())
            }
            _ => Err(conflict(partition_id)),
        }
    }

    async fn heartbeat_worker(&self, presence: &WorkerPresence) -> Result<(), FeedError> {
        let mut tables = self.tables()?;
        tables.workers.insert(
            Self::key(&presence.processor, &presence.worker_id),
            presence.clone(),
        );
        Ok(())
    }

    async fn list_workers(&self, processor: &str) -> Result<Vec<WorkerPresence>, FeedError> {
        let tables = self.tables()?;
        Ok(tables
            .workers
            .values()
            .filter(|w| w.processor == processor)
            .cloned()
            .collect())
    }

    async fn remove_worker(&self, processor: &str, worker_id: &str) -> Result<(), FeedError> {
        let mut tables = self.tables()?;
        tables.workers.remove(&Self::key(processor, worker_id));
        Ok(())
    }

    async fn prune_workers(
        &self,
        processor: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, FeedError> {
        let mut tables = self.tables()?;
        let before = tables.workers.len();
        tables
            .workers
            .retain(|_, w| w.processor != processor || w.expires_at >= now);
        Ok((before - tables.workers.len()) as u64)
    }
}
