//! SQLite-backed lease store.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::repository::sql::{dt_to_ms, map_driver_err, ms_to_dt, seq_to_sql, sql_to_seq};
use super::repository::{conflict, LeaseRepository};
use crate::error::FeedError;
use crate::models::{LeaseRecord, WorkerPresence};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS feed_leases (
    processor TEXT NOT NULL,
    partition_id TEXT NOT NULL,
    owner TEXT NULL,
    expires_at_ms INTEGER NULL,
    acquired_at_ms INTEGER NULL,
    checkpoint INTEGER NULL,
    version INTEGER NOT NULL,
    PRIMARY KEY (processor, partition_id)
);
CREATE TABLE IF NOT EXISTS feed_workers (
    processor TEXT NOT NULL,
    worker_id TEXT NOT NULL,
    expires_at_ms INTEGER NOT NULL,
    PRIMARY KEY (processor, worker_id)
);
";

const LEASE_COLUMNS: &str =
    "processor, partition_id, owner, expires_at_ms, acquired_at_ms, checkpoint, version";

fn row_to_lease(row: &Row<'_>) -> rusqlite::Result<LeaseRecord> {
    Ok(LeaseRecord {
        processor: row.get(0)?,
        partition_id: row.get(1)?,
        owner: row.get(2)?,
        expires_at: row.get::<_, Option<i64>>(3)?.map(ms_to_dt),
        acquired_at: row.get::<_, Option<i64>>(4)?.map(ms_to_dt),
        checkpoint: row.get::<_, Option<i64>>(5)?.map(sql_to_seq),
        version: sql_to_seq(row.get(6)?),
    })
}

/// Lease store in a SQLite database file (or `:memory:`).
///
/// Calls are short single statements executed under a connection mutex.
pub struct SqliteLeaseRepository {
    conn: Mutex<Connection>,
}

impl SqliteLeaseRepository {
    pub fn new(path: &str) -> Result<Self, FeedError> {
        let conn = Connection::open(path).map_err(|e| {
            FeedError::Unavailable(format!("open sqlite lease store {path}: {e}"))
        })?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| FeedError::Unavailable(format!("sqlite schema bootstrap: {e}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, FeedError> {
        self.conn
            .lock()
            .map_err(|_| FeedError::Unavailable("sqlite lease store poisoned".into()))
    }

    fn create_sync(&self, lease: &LeaseRecord) -> Result<Option<LeaseRecord>, FeedError> {
        let conn = self.conn()?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO feed_leases
                 (processor, partition_id, owner, expires_at_ms, acquired_at_ms, checkpoint, version)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1)",
                params![
                    lease.processor,
                    lease.partition_id,
                    lease.owner,
                    lease.expires_at.map(dt_to_ms),
                    lease.acquired_at.map(dt_to_ms),
                    lease.checkpoint.map(seq_to_sql),
                ],
            )
            .map_err(|e| map_driver_err("create lease", e))?;
        Ok((inserted == 1).then(|| LeaseRecord {
            version: 1,
            ..lease.clone()
        }))
    }

    fn get_sync(
        &self,
        processor: &str,
        partition_id: &str,
    ) -> Result<Option<LeaseRecord>, FeedError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "SELECT {LEASE_COLUMNS} FROM feed_leases WHERE processor = ?1 AND partition_id = ?2"
            ),
            params![processor, partition_id],
            row_to_lease,
        )
        .optional()
        .map_err(|e| map_driver_err("get lease", e))
    }

    fn list_sync(&self, processor: &str) -> Result<Vec<LeaseRecord>, FeedError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {LEASE_COLUMNS} FROM feed_leases WHERE processor = ?1 ORDER BY partition_id"
            ))
            .map_err(|e| map_driver_err("prepare list leases", e))?;
        let rows = stmt
            .query_map(params![processor], row_to_lease)
            .map_err(|e| map_driver_err("list leases", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| map_driver_err("read lease row", e))
    }

    fn cas_sync(
        &self,
        expected_version: u64,
        next: &LeaseRecord,
    ) -> Result<LeaseRecord, FeedError> {
        let conn = self.conn()?;
        let version = expected_version + 1;
        let updated = conn
            .execute(
                "UPDATE feed_leases
                 SET owner = ?3, expires_at_ms = ?4, acquired_at_ms = ?5, checkpoint = ?6, version = ?7
                 WHERE processor = ?1 AND partition_id = ?2 AND version = ?8",
                params![
                    next.processor,
                    next.partition_id,
                    next.owner,
                    next.expires_at.map(dt_to_ms),
                    next.acquired_at.map(dt_to_ms),
                    next.checkpoint.map(seq_to_sql),
                    seq_to_sql(version),
                    seq_to_sql(expected_version),
                ],
            )
            .map_err(|e| map_driver_err("compare-and-swap lease", e))?;
        if updated == 0 {
            return Err(conflict(&next.partition_id));
        }
        Ok(LeaseRecord {
            version,
            ..next.clone()
        })
    }

    fn delete_sync(
        &self,
        processor: &str,
        partition_id: &str,
        expected_version: u64,
    ) -> Result<(), FeedError> {
        let conn = self.conn()?;
        let deleted = conn
            .execute(
                "DELETE FROM feed_leases WHERE processor = ?1 AND partition_id = ?2 AND version = ?3",
                params![processor, partition_id, seq_to_sql(expected_version)],
            )
            .map_err(|e| map_driver_err("delete lease", e))?;
        if deleted == 0 {
            return Err(conflict(partition_id));
        }
        Ok(())
    }

    fn heartbeat_sync(&self, presence: &WorkerPresence) -> Result<(), FeedError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO feed_workers (processor, worker_id, expires_at_ms) VALUES (?1, ?2, ?3)
             ON CONFLICT(processor, worker_id) DO UPDATE SET expires_at_ms = excluded.expires_at_ms",
            params![
                presence.processor,
                presence.worker_id,
                dt_to_ms(presence.expires_at)
            ],
        )
        .map_err(|e| map_driver_err("heartbeat worker", e))?;
        Ok(())
    }

    fn list_workers_sync(&self, processor: &str) -> Result<Vec<WorkerPresence>, FeedError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT processor, worker_id, expires_at_ms FROM feed_workers
                 WHERE processor = ?1 ORDER BY worker_id",
            )
            .map_err(|e| map_driver_err("prepare list workers", e))?;
        let rows = stmt
            .query_map(params![processor], |row| {
                Ok(WorkerPresence {
                    processor: row.get(0)?,
                    worker_id: row.get(1)?,
                    expires_at: ms_to_dt(row.get(2)?),
                })
            })
            .map_err(|e| map_driver_err("list workers", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| map_driver_err("read worker row", e))
    }

    fn prune_workers_sync(&self, processor: &str, now: DateTime<Utc>) -> Result<u64, FeedError> {
        let conn = self.conn()?;
        let removed = conn
            .execute(
                "DELETE FROM feed_workers WHERE processor = ?1 AND expires_at_ms < ?2",
                params![processor, dt_to_ms(now)],
            )
            .map_err(|e| map_driver_err("prune workers", e))?;
        Ok(removed as u64)
    }

    fn remove_worker_sync(&self, processor: &str, worker_id: &str) -> Result<(), FeedError> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM feed_workers WHERE processor = ?1 AND worker_id = ?2",
            params![processor, worker_id],
        )
        .map_err(|e| map_driver_err("remove worker", e))?;
        Ok(())
    }
}

#[async_trait]
impl LeaseRepository for SqliteLeaseRepository {
    async fn create_if_absent(
        &self,
        lease: &LeaseRecord,
    ) -> Result<Option<LeaseRecord>, FeedError> {
        self.create_sync(lease)
    }

    async fn get(
        &self,
        processor: &str,
        partition_id: &str,
    ) -> Result<Option<LeaseRecord>, FeedError> {
        self.get_sync(processor, partition_id)
    }

    async fn list(&self, processor: &str) -> Result<Vec<LeaseRecord>, FeedError> {
        self.list_sync(processor)
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        next: &LeaseRecord,
    ) -> Result<LeaseRecord, FeedError> {
        self.cas_sync(expected_version, next)
    }

    async fn delete(
        &self,
        processor: &str,
        partition_id: &str,
        expected_version: u64,
    ) -> Result<(), FeedError> {
        self.delete_sync(processor, partition_id, expected_version)
    }

    async fn heartbeat_worker(&self, presence: &WorkerPresence) -> Result<(), FeedError> {
        self.heartbeat_sync(presence)
    }

    async fn list_workers(&self, processor: &str) -> Result<Vec<WorkerPresence>, FeedError> {
        self.list_workers_sync(processor)
    }

    async fn remove_worker(&self, processor: &str, worker_id: &str) -> Result<(), FeedError> {
        self.remove_worker_sync(processor, worker_id)
    }

    async fn prune_workers(
        &self,
        processor: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, FeedError> {
        self.prune_workers_sync(processor, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::contract::assert_lease_repository_contract;

    #[test]
    fn sqlite_repository_contract() {
        let repo = SqliteLeaseRepository::new(":memory:").expect("sqlite repo");
        tokio_test::block_on(assert_lease_repository_contract(&repo, "sqlite"));
    }

    #[test]
    fn leases_survive_reopening_the_file() {
        let path =
            std::env::temp_dir().join(format!("cartfeed-leases-{}.db", uuid::Uuid::new_v4()));
        let path = path.to_string_lossy().to_string();
        {
            let repo = SqliteLeaseRepository::new(&path).expect("open");
            tokio_test::block_on(repo.create_if_absent(&LeaseRecord::new("proc", "0", Some(42))))
                .expect("create");
        }
        let reopened = SqliteLeaseRepository::new(&path).expect("reopen");
        let lease = tokio_test::block_on(reopened.get("proc", "0"))
            .expect("get")
            .expect("persisted");
        assert_eq!(lease.checkpoint, Some(42));
        let _ = std::fs::remove_file(&path);
    }
}
