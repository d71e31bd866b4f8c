//! Row models shared by the service and the daemon

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, Row};
use std::fmt;
use std::str::FromStr;

use crate::{time, Error, Result};

/// Verification status of one identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordStatus {
    /// Loaded, not yet verified
    Pending,
    /// Portal reported an active line with an assigned number
    Active,
    /// Portal reported the SIM still needs activation
    Inactive,
    /// Verification could not determine a status
    Error,
}

impl RecordStatus {
    pub const ALL: [RecordStatus; 4] = [
        RecordStatus::Pending,
        RecordStatus::Active,
        RecordStatus::Inactive,
        RecordStatus::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "PENDING",
            RecordStatus::Active => "ACTIVE",
            RecordStatus::Inactive => "INACTIVE",
            RecordStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(RecordStatus::Pending),
            "ACTIVE" => Ok(RecordStatus::Active),
            "INACTIVE" => Ok(RecordStatus::Inactive),
            "ERROR" => Ok(RecordStatus::Error),
            other => Err(Error::InvalidInput(format!("Unknown record status: {}", other))),
        }
    }
}

/// Lifecycle state of a batch run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BatchState {
    Running,
    Paused,
    Stopped,
    Completed,
    Incomplete,
    Error,
}

impl BatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchState::Running => "RUNNING",
            BatchState::Paused => "PAUSED",
            BatchState::Stopped => "STOPPED",
            BatchState::Completed => "COMPLETED",
            BatchState::Incomplete => "INCOMPLETE",
            BatchState::Error => "ERROR",
        }
    }

    /// No engine loop is (or should be) driving the batch
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchState::Stopped | BatchState::Completed | BatchState::Incomplete | BatchState::Error
        )
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "RUNNING" => Ok(BatchState::Running),
            "PAUSED" => Ok(BatchState::Paused),
            "STOPPED" => Ok(BatchState::Stopped),
            "COMPLETED" => Ok(BatchState::Completed),
            "INCOMPLETE" => Ok(BatchState::Incomplete),
            "ERROR" => Ok(BatchState::Error),
            other => Err(Error::InvalidInput(format!("Unknown batch state: {}", other))),
        }
    }
}

/// One identifier to verify
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub id: i64,
    /// Identifier as supplied (unique)
    pub identifier_full: String,
    /// Normalized 13-character key submitted to the portal
    pub identifier_key: String,
    pub batch: String,
    pub status: RecordStatus,
    /// Present iff `status == Active`
    pub assigned_number: Option<String>,
    pub verified_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

impl VerificationRecord {
    pub fn from_row(row: &SqliteRow) -> Result<Self> {
        let status: String = row.try_get("status")?;
        let verified_at: Option<String> = row.try_get("verified_at")?;

        Ok(Self {
            id: row.try_get("id")?,
            identifier_full: row.try_get("identifier_full")?,
            identifier_key: row.try_get("identifier_key")?,
            batch: row.try_get("batch")?,
            status: status.parse()?,
            assigned_number: row.try_get("assigned_number")?,
            verified_at: verified_at.as_deref().map(time::from_db_text).transpose()?,
            notes: row.try_get("notes")?,
        })
    }
}

/// Persisted lifecycle row for one batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchProcess {
    pub batch: String,
    pub state: BatchState,
    pub progress_current: u64,
    pub progress_total: u64,
    pub active_count: u64,
    pub inactive_count: u64,
    pub error_count: u64,
    /// Claim token of the engine run currently driving the batch
    pub owner: Option<String>,
    /// Lease expiry for `owner`, epoch milliseconds
    pub claim_expires_at_ms: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BatchProcess {
    pub fn from_row(row: &SqliteRow) -> Result<Self> {
        let state: String = row.try_get("state")?;
        let started_at: String = row.try_get("started_at")?;
        let updated_at: String = row.try_get("updated_at")?;

        Ok(Self {
            batch: row.try_get("batch")?,
            state: state.parse()?,
            progress_current: row.try_get::<i64, _>("progress_current")?.max(0) as u64,
            progress_total: row.try_get::<i64, _>("progress_total")?.max(0) as u64,
            active_count: row.try_get::<i64, _>("active_count")?.max(0) as u64,
            inactive_count: row.try_get::<i64, _>("inactive_count")?.max(0) as u64,
            error_count: row.try_get::<i64, _>("error_count")?.max(0) as u64,
            owner: row.try_get("owner")?,
            claim_expires_at_ms: row.try_get("claim_expires_at_ms")?,
            started_at: time::from_db_text(&started_at)?,
            updated_at: time::from_db_text(&updated_at)?,
        })
    }

    /// Percentage complete (0.0 - 100.0)
    pub fn percentage(&self) -> f64 {
        if self.progress_total == 0 {
            0.0
        } else {
            (self.progress_current as f64 / self.progress_total as f64) * 100.0
        }
    }

    /// Claim held by someone whose lease has not run out at `now_ms`
    pub fn has_live_claim(&self, now_ms: i64) -> bool {
        match (&self.owner, self.claim_expires_at_ms) {
            (Some(_), Some(expires)) => expires > now_ms,
            _ => false,
        }
    }
}
