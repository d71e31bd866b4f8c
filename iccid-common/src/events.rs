//! Verification events and the broadcast EventBus
//!
//! The engine publishes progress here instead of calling back into a UI;
//! the HTTP service forwards events to SSE clients and tests subscribe
//! directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::db::{BatchState, RecordStatus};

/// Events emitted while batches are launched, verified and finalized
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum VerifierEvent {
    /// A batch was (re)launched and claimed by an engine run
    BatchLaunched {
        batch: String,
        /// Records this run intends to process
        total: u64,
        owner: String,
        timestamp: DateTime<Utc>,
    },

    /// One record was verified and its outcome persisted
    RecordVerified {
        batch: String,
        identifier_full: String,
        status: RecordStatus,
        assigned_number: Option<String>,
        /// 1-based position within the run
        current: u64,
        total: u64,
        timestamp: DateTime<Utc>,
    },

    /// A lifecycle transition was applied
    BatchStateChanged {
        batch: String,
        old_state: BatchState,
        new_state: BatchState,
        timestamp: DateTime<Utc>,
    },

    /// An engine run ended
    BatchFinished {
        batch: String,
        state: BatchState,
        processed: u64,
        active: u64,
        inactive: u64,
        errors: u64,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
}

impl VerifierEvent {
    /// Event name used for SSE `event:` lines
    pub fn event_type(&self) -> &str {
        match self {
            VerifierEvent::BatchLaunched { .. } => "BatchLaunched",
            VerifierEvent::RecordVerified { .. } => "RecordVerified",
            VerifierEvent::BatchStateChanged { .. } => "BatchStateChanged",
            VerifierEvent::BatchFinished { .. } => "BatchFinished",
        }
    }

    /// Batch the event belongs to
    pub fn batch(&self) -> &str {
        match self {
            VerifierEvent::BatchLaunched { batch, .. }
            | VerifierEvent::RecordVerified { batch, .. }
            | VerifierEvent::BatchStateChanged { batch, .. }
            | VerifierEvent::BatchFinished { batch, .. } => batch,
        }
    }
}

/// Broadcast bus for [`VerifierEvent`]s
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<VerifierEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus buffering up to `capacity` events per
    /// subscriber before the oldest are dropped
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<VerifierEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: VerifierEvent,
    ) -> Result<usize, broadcast::error::SendError<VerifierEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: VerifierEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
