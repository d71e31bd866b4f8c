//! Caller-facing batch operations
//!
//! Thin layer the HTTP handlers (or any other front end) call into. Every
//! failure comes back as a typed [`VerifyError`].

use iccid_common::db::{BatchProcess, RecordStatus, VerificationRecord};
use iccid_common::time;
use std::sync::Arc;
use tracing::info;

use crate::coordinator::{RunCoordinator, RunInfo};
use crate::error::{VerifyError, VerifyResult};
use crate::identifier::normalize;
use crate::models::{BatchOverview, BatchStats, DeleteReport, LoadReport};
use crate::store::{InsertOutcome, NewRecord, RecordFilter, RecordStore, MAX_PAGE_SIZE};

/// Upper bound for one `query_results` call
pub const MAX_QUERY_LIMIT: u32 = 10_000;

pub struct BatchService {
    store: Arc<dyn RecordStore>,
    coordinator: RunCoordinator,
}

impl BatchService {
    pub fn new(store: Arc<dyn RecordStore>, coordinator: RunCoordinator) -> Self {
        Self { store, coordinator }
    }

    pub fn coordinator(&self) -> &RunCoordinator {
        &self.coordinator
    }

    /// Insert `identifiers` as pending records of `name`.
    ///
    /// Identifiers already in the store (in any batch) are counted as
    /// duplicates; blank entries and entries without usable characters as
    /// invalid. Neither aborts the load.
    pub async fn load_batch(&self, name: &str, identifiers: &[String]) -> VerifyResult<LoadReport> {
        let batch = validate_batch_name(name)?;
        let mut report = LoadReport {
            batch: batch.to_string(),
            ..LoadReport::default()
        };

        for raw in identifiers {
            let identifier_full = raw.trim();
            let identifier_key = normalize(identifier_full);
            if identifier_full.is_empty() || identifier_key.is_empty() {
                report.invalid += 1;
                continue;
            }

            let record = NewRecord {
                identifier_full: identifier_full.to_string(),
                identifier_key,
                batch: batch.to_string(),
            };
            match self.store.insert_record(&record).await? {
                InsertOutcome::Inserted => report.inserted += 1,
                InsertOutcome::Duplicate => report.duplicates += 1,
            }
        }

        info!(
            batch,
            inserted = report.inserted,
            duplicates = report.duplicates,
            invalid = report.invalid,
            "Batch loaded"
        );
        Ok(report)
    }

    /// Launch a background run over `min(cap, pending)` records
    pub async fn start_verification(
        &self,
        batch: &str,
        cap: Option<u64>,
    ) -> VerifyResult<BatchProcess> {
        let batch = validate_batch_name(batch)?;
        self.coordinator.start(batch, cap).await
    }

    pub async fn pause(&self, batch: &str) -> VerifyResult<BatchProcess> {
        self.coordinator.pause(batch).await
    }

    pub async fn resume(&self, batch: &str) -> VerifyResult<BatchProcess> {
        self.coordinator.resume(batch).await
    }

    pub async fn stop(&self, batch: &str) -> VerifyResult<BatchProcess> {
        self.coordinator.stop(batch).await
    }

    /// Up to `limit` records ordered by id, read page by page
    pub async fn query_results(
        &self,
        batch: Option<&str>,
        status: Option<RecordStatus>,
        limit: u32,
    ) -> VerifyResult<Vec<VerificationRecord>> {
        if limit == 0 || limit > MAX_QUERY_LIMIT {
            return Err(VerifyError::InvalidInput(format!(
                "limit must be between 1 and {}",
                MAX_QUERY_LIMIT
            )));
        }

        let filter = RecordFilter {
            batch: batch.map(str::to_string),
            status,
        };

        let mut records = Vec::new();
        while records.len() < limit as usize {
            let want = (limit as usize - records.len()).min(MAX_PAGE_SIZE as usize) as u32;
            let page = self
                .store
                .fetch_records(&filter, records.len() as u64, want)
                .await?;
            let short = page.len() < want as usize;
            records.extend(page);
            if short {
                break;
            }
        }

        Ok(records)
    }

    /// Return verified records of `batch` to PENDING
    pub async fn reset_batch(&self, batch: &str, status: Option<RecordStatus>) -> VerifyResult<u64> {
        let process = self.require_batch(batch).await?;
        self.ensure_idle(batch, process.as_ref()).await?;

        let reset = self.store.reset_records(batch, status).await?;
        info!(batch, status = ?status, reset, "Batch records reset to PENDING");
        Ok(reset)
    }

    /// Remove a batch's records and lifecycle row
    pub async fn delete_batch(&self, batch: &str) -> VerifyResult<DeleteReport> {
        let process = self.require_batch(batch).await?;
        self.ensure_idle(batch, process.as_ref()).await?;
        if let Some(process) = &process {
            if !process.state.is_terminal() {
                return Err(VerifyError::AlreadyRunning {
                    batch: batch.to_string(),
                });
            }
        }

        let records_deleted = self.store.delete_records(&RecordFilter::batch(batch)).await?;
        let process_deleted = self.store.delete_process(batch).await?;
        info!(batch, records_deleted, process_deleted, "Batch deleted");

        Ok(DeleteReport {
            batch: batch.to_string(),
            records_deleted,
            process_deleted,
        })
    }

    pub async fn batch_stats(&self, batch: &str) -> VerifyResult<BatchStats> {
        let stats = self.collect_stats(batch).await?;
        if stats.total == 0 && self.store.get_process(batch).await?.is_none() {
            return Err(VerifyError::BatchNotFound(batch.to_string()));
        }
        Ok(stats)
    }

    /// Stats plus lifecycle row for one batch
    pub async fn batch_overview(&self, batch: &str) -> VerifyResult<BatchOverview> {
        let stats = self.collect_stats(batch).await?;
        let process = self.store.get_process(batch).await?;
        if stats.total == 0 && process.is_none() {
            return Err(VerifyError::BatchNotFound(batch.to_string()));
        }
        Ok(BatchOverview { stats, process })
    }

    /// Every batch with records or a lifecycle row, ordered by name
    pub async fn list_batches(&self) -> VerifyResult<Vec<BatchOverview>> {
        let mut names = self.store.batch_names().await?;
        let processes = self.store.list_processes(None).await?;
        for process in &processes {
            if !names.contains(&process.batch) {
                names.push(process.batch.clone());
            }
        }
        names.sort();

        let mut overviews = Vec::with_capacity(names.len());
        for name in names {
            let stats = self.collect_stats(&name).await?;
            let process = processes.iter().find(|p| p.batch == name).cloned();
            overviews.push(BatchOverview { stats, process });
        }
        Ok(overviews)
    }

    pub async fn active_runs(&self) -> Vec<RunInfo> {
        self.coordinator.active_runs().await
    }

    async fn collect_stats(&self, batch: &str) -> VerifyResult<BatchStats> {
        let mut stats = BatchStats {
            batch: batch.to_string(),
            ..BatchStats::default()
        };
        for status in RecordStatus::ALL {
            let count = self
                .store
                .count_records(&RecordFilter::batch(batch).with_status(status))
                .await?;
            match status {
                RecordStatus::Pending => stats.pending = count,
                RecordStatus::Active => stats.active = count,
                RecordStatus::Inactive => stats.inactive = count,
                RecordStatus::Error => stats.error = count,
            }
            stats.total += count;
        }
        Ok(stats)
    }

    /// Lifecycle row of an existing batch (`None` if never launched)
    async fn require_batch(&self, batch: &str) -> VerifyResult<Option<BatchProcess>> {
        let process = self.store.get_process(batch).await?;
        if process.is_none()
            && self.store.count_records(&RecordFilter::batch(batch)).await? == 0
        {
            return Err(VerifyError::BatchNotFound(batch.to_string()));
        }
        Ok(process)
    }

    /// Refuse while any run (here or elsewhere) holds the batch
    async fn ensure_idle(&self, batch: &str, process: Option<&BatchProcess>) -> VerifyResult<()> {
        if self.coordinator.is_running(batch).await {
            return Err(VerifyError::AlreadyRunning {
                batch: batch.to_string(),
            });
        }
        if let Some(process) = process {
            if process.has_live_claim(time::epoch_ms(&time::now())) {
                return Err(VerifyError::AlreadyClaimed {
                    batch: batch.to_string(),
                });
            }
        }
        Ok(())
    }
}

fn validate_batch_name(name: &str) -> VerifyResult<&str> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(VerifyError::InvalidInput("batch name must not be empty".into()));
    }
    Ok(trimmed)
}
