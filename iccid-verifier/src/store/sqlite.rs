//! SQLite implementation of [`RecordStore`]
//!
//! Every statement runs through `retry_on_lock` because the HTTP service and
//! the daemon share one database file.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use iccid_common::db::{BatchProcess, BatchState, RecordStatus, VerificationRecord};
use iccid_common::{time, Result};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::debug;

use super::{InsertOutcome, NewRecord, ProcessClaim, RecordFilter, RecordStore, MAX_PAGE_SIZE};
use crate::models::{RunTallies, VerificationOutcome};
use crate::utils::retry_on_lock;

const PROCESS_COLUMNS: &str = "batch, state, progress_current, progress_total, \
     active_count, inactive_count, error_count, owner, claim_expires_at_ms, \
     started_at, updated_at";

const RECORD_COLUMNS: &str = "id, identifier_full, identifier_key, batch, status, \
     assigned_number, verified_at, notes";

/// [`RecordStore`] over the shared SQLite pool
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    max_lock_wait_ms: u64,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool, max_lock_wait_ms: u64) -> Self {
        Self {
            pool,
            max_lock_wait_ms,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Append `WHERE` clauses for `filter`
fn push_filter<'a>(builder: &mut QueryBuilder<'a, Sqlite>, filter: &'a RecordFilter) {
    let mut joiner = " WHERE ";
    if let Some(batch) = &filter.batch {
        builder.push(joiner).push("batch = ").push_bind(batch.as_str());
        joiner = " AND ";
    }
    if let Some(status) = filter.status {
        builder.push(joiner).push("status = ").push_bind(status.as_str());
    }
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn insert_record(&self, record: &NewRecord) -> Result<InsertOutcome> {
        let pool = &self.pool;
        let created_at = time::to_db_text(&time::now());

        let rows = retry_on_lock("insert_record", self.max_lock_wait_ms, || async {
            let result = sqlx::query(
                r#"
                INSERT INTO verification_records
                    (identifier_full, identifier_key, batch, status, created_at)
                VALUES (?, ?, ?, 'PENDING', ?)
                ON CONFLICT(identifier_full) DO NOTHING
                "#,
            )
            .bind(&record.identifier_full)
            .bind(&record.identifier_key)
            .bind(&record.batch)
            .bind(&created_at)
            .execute(pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;

        Ok(if rows == 0 {
            InsertOutcome::Duplicate
        } else {
            InsertOutcome::Inserted
        })
    }

    async fn update_record_outcome(
        &self,
        identifier_full: &str,
        outcome: &VerificationOutcome,
        verified_at: DateTime<Utc>,
    ) -> Result<bool> {
        let pool = &self.pool;
        let verified_at = time::to_db_text(&verified_at);

        let rows = retry_on_lock("update_record_outcome", self.max_lock_wait_ms, || async {
            let result = sqlx::query(
                r#"
                UPDATE verification_records
                SET status = ?, assigned_number = ?, notes = ?, verified_at = ?
                WHERE identifier_full = ? AND status = 'PENDING'
                "#,
            )
            .bind(outcome.status().as_str())
            .bind(outcome.assigned_number())
            .bind(outcome.notes())
            .bind(&verified_at)
            .bind(identifier_full)
            .execute(pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;

        Ok(rows == 1)
    }

    async fn count_records(&self, filter: &RecordFilter) -> Result<u64> {
        let pool = &self.pool;

        let count = retry_on_lock("count_records", self.max_lock_wait_ms, || async {
            let mut builder = QueryBuilder::new("SELECT COUNT(*) FROM verification_records");
            push_filter(&mut builder, filter);
            let count: i64 = builder.build_query_scalar().fetch_one(pool).await?;
            Ok(count)
        })
        .await?;

        Ok(count.max(0) as u64)
    }

    async fn fetch_records(
        &self,
        filter: &RecordFilter,
        offset: u64,
        limit: u32,
    ) -> Result<Vec<VerificationRecord>> {
        let pool = &self.pool;
        let limit = limit.min(MAX_PAGE_SIZE) as i64;
        let offset = offset.min(i64::MAX as u64) as i64;

        let rows = retry_on_lock("fetch_records", self.max_lock_wait_ms, || async {
            let mut builder = QueryBuilder::new("SELECT ");
            builder.push(RECORD_COLUMNS).push(" FROM verification_records");
            push_filter(&mut builder, filter);
            builder
                .push(" ORDER BY id LIMIT ")
                .push_bind(limit)
                .push(" OFFSET ")
                .push_bind(offset);
            Ok(builder.build().fetch_all(pool).await?)
        })
        .await?;

        debug!(
            batch = ?filter.batch,
            status = ?filter.status,
            offset,
            limit,
            fetched = rows.len(),
            "Fetched record page"
        );

        rows.iter().map(VerificationRecord::from_row).collect()
    }

    async fn delete_records(&self, filter: &RecordFilter) -> Result<u64> {
        let pool = &self.pool;

        retry_on_lock("delete_records", self.max_lock_wait_ms, || async {
            let mut builder = QueryBuilder::new("DELETE FROM verification_records");
            push_filter(&mut builder, filter);
            Ok(builder.build().execute(pool).await?.rows_affected())
        })
        .await
    }

    async fn reset_records(&self, batch: &str, status: Option<RecordStatus>) -> Result<u64> {
        let pool = &self.pool;

        retry_on_lock("reset_records", self.max_lock_wait_ms, || async {
            let mut builder = QueryBuilder::<Sqlite>::new(
                "UPDATE verification_records \
                 SET status = 'PENDING', assigned_number = NULL, verified_at = NULL, notes = NULL \
                 WHERE status != 'PENDING' AND batch = ",
            );
            builder.push_bind(batch);
            if let Some(status) = status {
                builder.push(" AND status = ").push_bind(status.as_str());
            }
            Ok(builder.build().execute(pool).await?.rows_affected())
        })
        .await
    }

    async fn batch_names(&self) -> Result<Vec<String>> {
        let pool = &self.pool;

        retry_on_lock("batch_names", self.max_lock_wait_ms, || async {
            let names: Vec<String> = sqlx::query_scalar(
                "SELECT DISTINCT batch FROM verification_records ORDER BY batch",
            )
            .fetch_all(pool)
            .await?;
            Ok(names)
        })
        .await
    }

    async fn launch_process(&self, claim: &ProcessClaim) -> Result<Option<BatchProcess>> {
        let pool = &self.pool;
        let now_text = time::to_db_text(&time::now());
        let total = claim.total as i64;

        let rows = retry_on_lock("launch_process", self.max_lock_wait_ms, || async {
            let result = sqlx::query(
                r#"
                INSERT INTO batch_processes (
                    batch, state, progress_current, progress_total,
                    active_count, inactive_count, error_count,
                    owner, claim_expires_at_ms, started_at, updated_at
                ) VALUES (?, 'RUNNING', 0, ?, 0, 0, 0, ?, ?, ?, ?)
                ON CONFLICT(batch) DO UPDATE SET
                    state = 'RUNNING',
                    progress_current = 0,
                    progress_total = excluded.progress_total,
                    active_count = 0,
                    inactive_count = 0,
                    error_count = 0,
                    owner = excluded.owner,
                    claim_expires_at_ms = excluded.claim_expires_at_ms,
                    started_at = excluded.started_at,
                    updated_at = excluded.updated_at
                WHERE batch_processes.owner IS NULL
                   OR batch_processes.owner = excluded.owner
                   OR batch_processes.claim_expires_at_ms IS NULL
                   OR batch_processes.claim_expires_at_ms <= ?
                "#,
            )
            .bind(&claim.batch)
            .bind(total)
            .bind(&claim.owner)
            .bind(claim.lease_until_ms)
            .bind(&now_text)
            .bind(&now_text)
            .bind(claim.now_ms)
            .execute(pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if rows == 0 {
            debug!(batch = %claim.batch, "Launch refused: live claim held by another run");
            return Ok(None);
        }

        self.get_process(&claim.batch).await
    }

    async fn transition_state(
        &self,
        batch: &str,
        from: BatchState,
        to: BatchState,
    ) -> Result<bool> {
        let pool = &self.pool;
        let now_text = time::to_db_text(&time::now());

        let rows = retry_on_lock("transition_state", self.max_lock_wait_ms, || async {
            let result = sqlx::query(
                "UPDATE batch_processes SET state = ?, updated_at = ? WHERE batch = ? AND state = ?",
            )
            .bind(to.as_str())
            .bind(&now_text)
            .bind(batch)
            .bind(from.as_str())
            .execute(pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;

        Ok(rows == 1)
    }

    async fn update_progress(
        &self,
        batch: &str,
        owner: &str,
        tallies: &RunTallies,
        lease_until_ms: i64,
    ) -> Result<bool> {
        let pool = &self.pool;
        let now_text = time::to_db_text(&time::now());

        let rows = retry_on_lock("update_progress", self.max_lock_wait_ms, || async {
            let result = sqlx::query(
                r#"
                UPDATE batch_processes
                SET progress_current = ?, active_count = ?, inactive_count = ?, error_count = ?,
                    claim_expires_at_ms = ?, updated_at = ?
                WHERE batch = ? AND owner = ?
                "#,
            )
            .bind(tallies.processed as i64)
            .bind(tallies.active as i64)
            .bind(tallies.inactive as i64)
            .bind(tallies.errors as i64)
            .bind(lease_until_ms)
            .bind(&now_text)
            .bind(batch)
            .bind(owner)
            .execute(pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;

        Ok(rows == 1)
    }

    async fn renew_claim(&self, batch: &str, owner: &str, lease_until_ms: i64) -> Result<bool> {
        let pool = &self.pool;

        let rows = retry_on_lock("renew_claim", self.max_lock_wait_ms, || async {
            let result = sqlx::query(
                "UPDATE batch_processes SET claim_expires_at_ms = ? WHERE batch = ? AND owner = ?",
            )
            .bind(lease_until_ms)
            .bind(batch)
            .bind(owner)
            .execute(pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;

        Ok(rows == 1)
    }

    async fn finalize_process(&self, batch: &str, owner: &str, state: BatchState) -> Result<bool> {
        let pool = &self.pool;
        let now_text = time::to_db_text(&time::now());

        let rows = retry_on_lock("finalize_process", self.max_lock_wait_ms, || async {
            let result = sqlx::query(
                r#"
                UPDATE batch_processes
                SET state = ?, owner = NULL, claim_expires_at_ms = NULL, updated_at = ?
                WHERE batch = ? AND owner = ?
                "#,
            )
            .bind(state.as_str())
            .bind(&now_text)
            .bind(batch)
            .bind(owner)
            .execute(pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;

        Ok(rows == 1)
    }

    async fn release_claim(&self, batch: &str, owner: &str) -> Result<bool> {
        let pool = &self.pool;

        let rows = retry_on_lock("release_claim", self.max_lock_wait_ms, || async {
            let result = sqlx::query(
                r#"
                UPDATE batch_processes
                SET owner = NULL, claim_expires_at_ms = NULL
                WHERE batch = ? AND owner = ?
                "#,
            )
            .bind(batch)
            .bind(owner)
            .execute(pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;

        Ok(rows == 1)
    }

    async fn get_process(&self, batch: &str) -> Result<Option<BatchProcess>> {
        let pool = &self.pool;
        let sql = format!("SELECT {} FROM batch_processes WHERE batch = ?", PROCESS_COLUMNS);

        let row = retry_on_lock("get_process", self.max_lock_wait_ms, || async {
            Ok(sqlx::query(&sql).bind(batch).fetch_optional(pool).await?)
        })
        .await?;

        row.as_ref().map(BatchProcess::from_row).transpose()
    }

    async fn list_processes(&self, state: Option<BatchState>) -> Result<Vec<BatchProcess>> {
        let pool = &self.pool;

        let rows = retry_on_lock("list_processes", self.max_lock_wait_ms, || async {
            let mut builder = QueryBuilder::<Sqlite>::new("SELECT ");
            builder.push(PROCESS_COLUMNS).push(" FROM batch_processes");
            if let Some(state) = state {
                builder.push(" WHERE state = ").push_bind(state.as_str());
            }
            builder.push(" ORDER BY batch");
            Ok(builder.build().fetch_all(pool).await?)
        })
        .await?;

        rows.iter().map(BatchProcess::from_row).collect()
    }

    async fn delete_process(&self, batch: &str) -> Result<bool> {
        let pool = &self.pool;

        let rows = retry_on_lock("delete_process", self.max_lock_wait_ms, || async {
            let result = sqlx::query("DELETE FROM batch_processes WHERE batch = ?")
                .bind(batch)
                .execute(pool)
                .await?;
            Ok(result.rows_affected())
        })
        .await?;

        Ok(rows == 1)
    }
}
