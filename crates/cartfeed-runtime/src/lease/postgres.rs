//! Postgres-backed lease store.
//!
//! This module is feature-gated behind `lease-postgres`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use tokio::sync::OnceCell;

use super::repository::sql::{dt_to_ms, map_driver_err, ms_to_dt, seq_to_sql, sql_to_seq};
use super::repository::{conflict, LeaseRepository};
use crate::error::FeedError;
use crate::models::{LeaseRecord, WorkerPresence};

fn is_valid_schema_ident(schema: &str) -> bool {
    !schema.is_empty()
        && schema
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn row_to_lease(row: &sqlx::postgres::PgRow) -> LeaseRecord {
    LeaseRecord {
        processor: row.get(0),
        partition_id: row.get(1),
        owner: row.get(2),
        expires_at: row.get::<Option<i64>, _>(3).map(ms_to_dt),
        acquired_at: row.get::<Option<i64>, _>(4).map(ms_to_dt),
        checkpoint: row.get::<Option<i64>, _>(5).map(sql_to_seq),
        version: sql_to_seq(row.get(6)),
    }
}

pub struct PostgresLeaseRepository {
    pool: Option<PgPool>,
    schema: String,
    init_error: Option<String>,
    schema_ready: OnceCell<()>,
}

impl PostgresLeaseRepository {
    /// Connects lazily; the schema is created on first use.
    pub fn new(database_url: &str) -> Self {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(database_url);
        let (pool, init_error) = match pool {
            Ok(pool) => (Some(pool), None),
            Err(e) => (None, Some(format!("failed to initialize lazy postgres pool: {e}"))),
        };
        Self {
            pool,
            schema: "public".to_string(),
            init_error,
            schema_ready: OnceCell::new(),
        }
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self {
            pool: Some(pool),
            schema: "public".to_string(),
            init_error: None,
            schema_ready: OnceCell::new(),
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    fn pool(&self) -> Result<&PgPool, FeedError> {
        if let Some(err) = &self.init_error {
            return Err(FeedError::Configuration(err.clone()));
        }
        self.pool
            .as_ref()
            .ok_or_else(|| FeedError::Configuration("no postgres pool".into()))
    }

    async fn ready(&self) -> Result<&PgPool, FeedError> {
        if !is_valid_schema_ident(&self.schema) {
            return Err(FeedError::Configuration(format!(
                "invalid schema name: {}",
                self.schema
            )));
        }
        let pool = self.pool()?;
        self.schema_ready
            .get_or_try_init(|| async {
                let schema = &self.schema;
                let statements = [
                    format!("CREATE SCHEMA IF NOT EXISTS \"{schema}\""),
                    format!(
                        "CREATE TABLE IF NOT EXISTS \"{schema}\".feed_leases (
                            processor TEXT NOT NULL,
                            partition_id TEXT NOT NULL,
                            owner TEXT NULL,
                            expires_at_ms BIGINT NULL,
                            acquired_at_ms BIGINT NULL,
                            checkpoint BIGINT NULL,
                            version BIGINT NOT NULL,
                            PRIMARY KEY (processor, partition_id)
                        )"
                    ),
                    format!(
                        "CREATE TABLE IF NOT EXISTS \"{schema}\".feed_workers (
                            processor TEXT NOT NULL,
                            worker_id TEXT NOT NULL,
                            expires_at_ms BIGINT NOT NULL,
                            PRIMARY KEY (processor, worker_id)
                        )"
                    ),
                ];
                for sql in &statements {
                    sqlx::query(sql)
                        .execute(pool)
                        .await
                        .map_err(|e| map_driver_err("schema bootstrap", e))?;
                }
                Ok::<(), FeedError>(())
            })
            .await?;
        Ok(pool)
    }
}

#[async_trait]
impl LeaseRepository for PostgresLeaseRepository {
    async fn create_if_absent(
        &self,
        lease: &LeaseRecord,
    ) -> Result<Option<LeaseRecord>, FeedError> {
        let pool = self.ready().await?;
        let sql = format!(
            "INSERT INTO \"{}\".feed_leases
             (processor, partition_id, owner, expires_at_ms, acquired_at_ms, checkpoint, version)
             VALUES ($1, $2, $3, $4, $5, $6, 1)
             ON CONFLICT (processor, partition_id) DO NOTHING",
            self.schema
        );
        let inserted = sqlx::query(&sql)
            .bind(&lease.processor)
            .bind(&lease.partition_id)
            .bind(&lease.owner)
            .bind(lease.expires_at.map(dt_to_ms))
            .bind(lease.acquired_at.map(dt_to_ms))
            .bind(lease.checkpoint.map(seq_to_sql))
            .execute(pool)
            .await
            .map_err(|e| map_driver_err("create lease", e))?
            .rows_affected();
        Ok((inserted == 1).then(|| LeaseRecord {
            version: 1,
            ..lease.clone()
        }))
    }

    async fn get(
        &self,
        processor: &str,
        partition_id: &str,
    ) -> Result<Option<LeaseRecord>, FeedError> {
        let pool = self.ready().await?;
        let sql = format!(
            "SELECT processor, partition_id, owner, expires_at_ms, acquired_at_ms, checkpoint, version
             FROM \"{}\".feed_leases
             WHERE processor = $1 AND partition_id = $2",
            self.schema
        );
        let row = sqlx::query(&sql)
            .bind(processor)
            .bind(partition_id)
            .fetch_optional(pool)
            .await
            .map_err(|e| map_driver_err("get lease", e))?;
        Ok(row.as_ref().map(row_to_lease))
    }

    async fn list(&self, processor: &str) -> Result<Vec<LeaseRecord>, FeedError> {
        let pool = self.ready().await?;
        let sql = format!(
            "SELECT processor, partition_id, owner, expires_at_ms, acquired_at_ms, checkpoint, version
             FROM \"{}\".feed_leases
             WHERE processor = $1
             ORDER BY partition_id ASC",
            self.schema
        );
        let rows = sqlx::query(&sql)
            .bind(processor)
            .fetch_all(pool)
            .await
            .map_err(|e| map_driver_err("list leases", e))?;
        Ok(rows.iter().map(row_to_lease).collect())
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        next: &LeaseRecord,
    ) -> Result<LeaseRecord, FeedError> {
        let pool = self.ready().await?;
        let version = expected_version + 1;
        let sql = format!(
            "UPDATE \"{}\".feed_leases
             SET owner = $3, expires_at_ms = $4, acquired_at_ms = $5, checkpoint = $6, version = $7
             WHERE processor = $1 AND partition_id = $2 AND version = $8",
            self.schema
        );
        let updated = sqlx::query(&sql)
            .bind(&next.processor)
            .bind(&next.partition_id)
            .bind(&next.owner)
            .bind(next.expires_at.map(dt_to_ms))
            .bind(next.acquired_at.map(dt_to_ms))
            .bind(next.checkpoint.map(seq_to_sql))
            .bind(seq_to_sql(version))
            .bind(seq_to_sql(expected_version))
            .execute(pool)
            .await
            .map_err(|e| map_driver_err("compare-and-swap lease", e))?
            .rows_affected();
        if updated == 0 {
            return Err(conflict(&next.partition_id));
        }
        Ok(LeaseRecord {
            version,
            ..next.clone()
        })
    }

    async fn delete(
        &self,
        processor: &str,
        partition_id: &str,
        expected_version: u64,
    ) -> Result<(), FeedError> {
        let pool = self.ready().await?;
        let sql = format!(
            "DELETE FROM \"{}\".feed_leases
             WHERE processor = $1 AND partition_id = $2 AND version = $3",
            self.schema
        );
        let deleted = sqlx::query(&sql)
            .bind(processor)
            .bind(partition_id)
            .bind(seq_to_sql(expected_version))
            .execute(pool)
            .await
            .map_err(|e| map_driver_err("delete lease", e))?
            .rows_affected();
        if deleted == 0 {
            return Err(conflict(partition_id));
        }
        Ok(())
    }

    async fn heartbeat_worker(&self, presence: &WorkerPresence) -> Result<(), FeedError> {
        let pool = self.ready().await?;
        let sql = format!(
            "INSERT INTO \"{}\".feed_workers (processor, worker_id, expires_at_ms)
             VALUES ($1, $2, $3)
             ON CONFLICT (processor, worker_id) DO UPDATE SET expires_at_ms = EXCLUDED.expires_at_ms",
            self.schema
        );
        sqlx::query(&sql)
            .bind(&presence.processor)
            .bind(&presence.worker_id)
            .bind(dt_to_ms(presence.expires_at))
            .execute(pool)
            .await
            .map_err(|e| map_driver_err("heartbeat worker", e))?;
        Ok(())
    }

    async fn list_workers(&self, processor: &str) -> Result<Vec<WorkerPresence>, FeedError> {
        let pool = self.ready().await?;
        let sql = format!(
            "SELECT processor, worker_id, expires_at_ms FROM \"{}\".feed_workers
             WHERE processor = $1 ORDER BY worker_id ASC",
            self.schema
        );
        let rows = sqlx::query(&sql)
            .bind(processor)
            .fetch_all(pool)
            .await
            .map_err(|e| map_driver_err("list workers", e))?;
        Ok(rows
            .iter()
            .map(|row| WorkerPresence {
                processor: row.get(0),
                worker_id: row.get(1),
                expires_at: ms_to_dt(row.get(2)),
            })
            .collect())
    }

    async fn remove_worker(&self, processor: &str, worker_id: &str) -> Result<(), FeedError> {
        let pool = self.ready().await?;
        let sql = format!(
            "DELETE FROM \"{}\".feed_workers WHERE processor = $1 AND worker_id = $2",
            self.schema
        );
        sqlx::query(&sql)
            .bind(processor)
            .bind(worker_id)
            .execute(pool)
            .await
            .map_err(|e| map_driver_err("remove worker", e))?;
        Ok(())
    }

    async fn prune_workers(
        &self,
        processor: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, FeedError> {
        let pool = self.ready().await?;
        let sql = format!(
            "DELETE FROM \"{}\".feed_workers WHERE processor = $1 AND expires_at_ms < $2",
            self.schema
        );
        let done = sqlx::query(&sql)
            .bind(processor)
            .bind(dt_to_ms(now))
            .execute(pool)
            .await
            .map_err(|e| map_driver_err("prune workers", e))?;
        Ok(done.rows_affected())
    }
}
