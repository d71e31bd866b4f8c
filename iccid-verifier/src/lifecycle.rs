//! Batch lifecycle transitions requested by actors
//!
//! Any actor (HTTP caller, daemon, CLI) may pause, resume, stop or fail a
//! batch. Each request is a compare-and-set on the state it just read, so
//! two actors racing on one row cannot both apply a transition from the same
//! state. `COMPLETED` and `INCOMPLETE` are written only by the engine run
//! holding the claim.

use iccid_common::db::{BatchProcess, BatchState};
use iccid_common::events::{EventBus, VerifierEvent};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{VerifyError, VerifyResult};
use crate::store::RecordStore;

/// Read-check-swap rounds before giving up on a contended row
const MAX_CAS_ATTEMPTS: u32 = 5;

/// Whether an actor may move a batch from `from` to `to`
pub fn actor_transition_allowed(from: BatchState, to: BatchState) -> bool {
    use BatchState::*;
    matches!(
        (from, to),
        (Running, Paused) | (Paused, Running) | (Running, Stopped) | (Paused, Stopped)
            | (Running, Error)
            | (Paused, Error)
    )
}

/// Applies actor-requested transitions to lifecycle rows
#[derive(Clone)]
pub struct BatchLifecycle {
    store: Arc<dyn RecordStore>,
    event_bus: EventBus,
}

impl BatchLifecycle {
    pub fn new(store: Arc<dyn RecordStore>, event_bus: EventBus) -> Self {
        Self { store, event_bus }
    }

    /// RUNNING → PAUSED
    pub async fn pause(&self, batch: &str) -> VerifyResult<BatchProcess> {
        self.transition(batch, BatchState::Paused, false).await
    }

    /// PAUSED → RUNNING
    pub async fn resume(&self, batch: &str) -> VerifyResult<BatchProcess> {
        self.transition(batch, BatchState::Running, false).await
    }

    /// RUNNING/PAUSED → STOPPED; stopping a stopped batch is a no-op
    pub async fn stop(&self, batch: &str) -> VerifyResult<BatchProcess> {
        self.transition(batch, BatchState::Stopped, true).await
    }

    /// RUNNING/PAUSED → ERROR, for an actor that saw the run itself fail
    pub async fn fail(&self, batch: &str) -> VerifyResult<BatchProcess> {
        self.transition(batch, BatchState::Error, true).await
    }

    async fn transition(
        &self,
        batch: &str,
        to: BatchState,
        idempotent: bool,
    ) -> VerifyResult<BatchProcess> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let process = self
                .store
                .get_process(batch)
                .await?
                .ok_or_else(|| VerifyError::BatchNotFound(batch.to_string()))?;

            let from = process.state;
            if from == to && idempotent {
                return Ok(process);
            }
            if !actor_transition_allowed(from, to) {
                return Err(VerifyError::InvalidTransition {
                    batch: batch.to_string(),
                    from,
                    to,
                });
            }

            if self.store.transition_state(batch, from, to).await? {
                info!(
                    batch,
                    from = %from,
                    to = %to,
                    progress_pct = process.percentage(),
                    "Batch state changed"
                );
                self.event_bus.emit_lossy(VerifierEvent::BatchStateChanged {
                    batch: batch.to_string(),
                    old_state: from,
                    new_state: to,
                    timestamp: iccid_common::time::now(),
                });
                return self
                    .store
                    .get_process(batch)
                    .await?
                    .ok_or_else(|| VerifyError::BatchNotFound(batch.to_string()));
            }

            debug!(batch, attempt, from = %from, to = %to, "State changed underneath, re-reading");
        }

        Err(VerifyError::Store(iccid_common::Error::Internal(format!(
            "Batch {} state kept changing; gave up after {} attempts",
            batch, MAX_CAS_ATTEMPTS
        ))))
    }
}
