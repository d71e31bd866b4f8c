//! Batch-level reports returned by the caller-facing operations

use iccid_common::db::BatchProcess;
use serde::{Deserialize, Serialize};

/// Result of loading identifiers into a batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadReport {
    pub batch: String,
    pub inserted: u64,
    /// Identifiers already present in the store (any batch)
    pub duplicates: u64,
    /// Blank entries or entries with no usable digits
    pub invalid: u64,
}

/// Record counts per status for one batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStats {
    pub batch: String,
    pub total: u64,
    pub pending: u64,
    pub active: u64,
    pub inactive: u64,
    pub error: u64,
}

impl BatchStats {
    /// Share of records already verified (0.0 - 100.0)
    pub fn verified_percentage(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            ((self.total - self.pending) as f64 / self.total as f64) * 100.0
        }
    }
}

/// Stats plus the lifecycle row, if the batch was ever launched
#[derive(Debug, Clone, Serialize)]
pub struct BatchOverview {
    pub stats: BatchStats,
    pub process: Option<BatchProcess>,
}

/// What `delete_batch` removed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeleteReport {
    pub batch: String,
    pub records_deleted: u64,
    pub process_deleted: bool,
}
