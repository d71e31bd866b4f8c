//! Persistent record store
//!
//! The engine, the lifecycle actors and the supervisor only talk to storage
//! through [`RecordStore`]. Every write the engine makes to a lifecycle row
//! is conditional on its claim token; actor transitions are compare-and-set
//! on the expected previous state.

pub mod sqlite;

pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use iccid_common::db::{BatchProcess, BatchState, RecordStatus, VerificationRecord};
use iccid_common::Result;

use crate::models::{RunTallies, VerificationOutcome};

/// Largest page any single range read returns
pub const MAX_PAGE_SIZE: u32 = 1000;

/// Batch/status filter for record queries; `None` matches everything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub batch: Option<String>,
    pub status: Option<RecordStatus>,
}

impl RecordFilter {
    pub fn batch(batch: impl Into<String>) -> Self {
        Self {
            batch: Some(batch.into()),
            status: None,
        }
    }

    /// Pending records of one batch
    pub fn pending_in(batch: impl Into<String>) -> Self {
        Self::batch(batch).with_status(RecordStatus::Pending)
    }

    pub fn with_status(mut self, status: RecordStatus) -> Self {
        self.status = Some(status);
        self
    }
}

/// A record to insert as `PENDING`
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub identifier_full: String,
    pub identifier_key: String,
    pub batch: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// `identifier_full` already exists; nothing written
    Duplicate,
}

/// Claim request made when an engine run launches a batch
#[derive(Debug, Clone)]
pub struct ProcessClaim {
    pub batch: String,
    /// Token identifying the run
    pub owner: String,
    /// Records the run intends to process
    pub total: u64,
    /// Epoch ms the claim is valid until
    pub lease_until_ms: i64,
    /// Epoch ms used to decide whether an existing lease has expired
    pub now_ms: i64,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    // --- verification records ---

    async fn insert_record(&self, record: &NewRecord) -> Result<InsertOutcome>;

    /// Write an outcome for a record that is still `PENDING`.
    ///
    /// Returns false when the record is missing or already verified.
    async fn update_record_outcome(
        &self,
        identifier_full: &str,
        outcome: &VerificationOutcome,
        verified_at: DateTime<Utc>,
    ) -> Result<bool>;

    async fn count_records(&self, filter: &RecordFilter) -> Result<u64>;

    /// Range read ordered by record id; `limit` is capped at [`MAX_PAGE_SIZE`]
    async fn fetch_records(
        &self,
        filter: &RecordFilter,
        offset: u64,
        limit: u32,
    ) -> Result<Vec<VerificationRecord>>;

    async fn delete_records(&self, filter: &RecordFilter) -> Result<u64>;

    /// Return verified records of `batch` to `PENDING`, optionally only those
    /// with `status`, clearing number, timestamp and notes
    async fn reset_records(&self, batch: &str, status: Option<RecordStatus>) -> Result<u64>;

    /// Distinct batch names that own at least one record
    async fn batch_names(&self) -> Result<Vec<String>>;

    // --- batch lifecycle rows ---

    /// Create or re-launch the row as `RUNNING` with zeroed tallies.
    ///
    /// Applies only when the row is absent, unowned, owned by the same token
    /// or its lease expired; returns `None` when another run holds it.
    async fn launch_process(&self, claim: &ProcessClaim) -> Result<Option<BatchProcess>>;

    /// Compare-and-set `state` from `from` to `to`
    async fn transition_state(&self, batch: &str, from: BatchState, to: BatchState)
        -> Result<bool>;

    /// Persist progress and renew the lease; false if `owner` lost the claim
    async fn update_progress(
        &self,
        batch: &str,
        owner: &str,
        tallies: &RunTallies,
        lease_until_ms: i64,
    ) -> Result<bool>;

    async fn renew_claim(&self, batch: &str, owner: &str, lease_until_ms: i64) -> Result<bool>;

    /// Write the run's final state and drop the claim
    async fn finalize_process(&self, batch: &str, owner: &str, state: BatchState) -> Result<bool>;

    /// Drop the claim without touching the state
    async fn release_claim(&self, batch: &str, owner: &str) -> Result<bool>;

    async fn get_process(&self, batch: &str) -> Result<Option<BatchProcess>>;

    /// Lifecycle rows ordered by batch name, optionally only in `state`
    async fn list_processes(&self, state: Option<BatchState>) -> Result<Vec<BatchProcess>>;

    async fn delete_process(&self, batch: &str) -> Result<bool>;
}
