//! Engine run tallies and summaries

use iccid_common::db::{BatchState, RecordStatus};
use serde::Serialize;

/// Counters for one engine run; `processed` is the sum of the three outcomes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunTallies {
    pub processed: u64,
    pub active: u64,
    pub inactive: u64,
    pub errors: u64,
}

impl RunTallies {
    /// Count one persisted outcome
    pub fn record(&mut self, status: RecordStatus) {
        match status {
            RecordStatus::Active => self.active += 1,
            RecordStatus::Inactive => self.inactive += 1,
            RecordStatus::Error => self.errors += 1,
            // Outcomes are never pending
            RecordStatus::Pending => return,
        }
        self.processed += 1;
    }
}

/// How an engine run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunExit {
    /// Nothing left pending for the batch
    Completed,
    /// Cap reached or store drained while records remain pending
    Incomplete,
    /// An actor requested STOPPED
    Stopped,
    /// Cancelled locally (shutdown); claim released, state left for another actor
    Interrupted,
    /// Lifecycle row changed hands or disappeared; nothing written
    Abandoned,
}

impl RunExit {
    /// Lifecycle state this run wrote when it exited, if any
    pub fn final_state(&self) -> Option<BatchState> {
        match self {
            RunExit::Completed => Some(BatchState::Completed),
            RunExit::Incomplete => Some(BatchState::Incomplete),
            RunExit::Stopped => Some(BatchState::Stopped),
            RunExit::Interrupted | RunExit::Abandoned => None,
        }
    }
}

/// Aggregate result of one engine run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub batch: String,
    pub exit: RunExit,
    pub target: u64,
    pub tallies: RunTallies,
    pub duration_ms: u64,
}
