//! Daemon supervisor
//!
//! Polls for batches flagged RUNNING that nobody holds a live claim on and
//! drives them one at a time. Exclusivity across supervisor instances comes
//! from the engine's claim, not from this loop.

use iccid_common::db::BatchState;
use iccid_common::time;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SupervisorSettings;
use crate::engine::VerificationEngine;
use crate::error::{VerifyError, VerifyResult};
use crate::lifecycle::BatchLifecycle;
use crate::store::RecordStore;

/// Single-flight polling supervisor
pub struct Supervisor {
    store: Arc<dyn RecordStore>,
    engine: Arc<VerificationEngine>,
    lifecycle: BatchLifecycle,
    settings: SupervisorSettings,
    current: Option<String>,
}

impl Supervisor {
    pub fn new(
        store: Arc<dyn RecordStore>,
        engine: Arc<VerificationEngine>,
        lifecycle: BatchLifecycle,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            store,
            engine,
            lifecycle,
            settings,
            current: None,
        }
    }

    /// Batch being driven right now, if any
    pub fn current_assignment(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Poll until `cancel` fires
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            poll_interval_ms = self.settings.poll_interval_ms,
            assigned_batch = ?self.settings.assigned_batch,
            "Supervisor started"
        );

        while !cancel.is_cancelled() {
            let wait_ms = match self.poll_once(&cancel).await {
                Ok(driven) => {
                    if driven == 0 {
                        debug!("No runnable batches");
                    }
                    self.settings.poll_interval_ms
                }
                Err(e) => {
                    error!(error = %e, "Supervisor poll failed");
                    self.settings.error_backoff_ms
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(time::millis_to_duration(wait_ms)) => {}
                _ = cancel.cancelled() => {}
            }
        }

        info!("Supervisor stopped");
    }

    /// One polling pass; returns how many batches were driven
    pub async fn poll_once(&mut self, cancel: &CancellationToken) -> VerifyResult<usize> {
        let running = self.store.list_processes(Some(BatchState::Running)).await?;
        let now_ms = time::epoch_ms(&time::now());
        let mut driven = 0;

        for process in running {
            if cancel.is_cancelled() {
                break;
            }
            if let Some(assigned) = &self.settings.assigned_batch {
                if &process.batch != assigned {
                    continue;
                }
            }
            if self.current.as_deref() == Some(process.batch.as_str()) {
                continue;
            }
            if process.has_live_claim(now_ms) {
                debug!(batch = %process.batch, "Batch driven elsewhere; skipping");
                continue;
            }

            let batch = process.batch;
            self.current = Some(batch.clone());
            info!(batch = %batch, "Supervisor taking batch");

            let result = self.engine.run(&batch, None, cancel.clone()).await;
            self.current = None;

            match result {
                Ok(summary) => {
                    info!(
                        batch = %batch,
                        exit = ?summary.exit,
                        processed = summary.tallies.processed,
                        "Supervisor run ended"
                    );
                    driven += 1;
                }
                Err(VerifyError::AlreadyClaimed { .. }) => {
                    debug!(batch = %batch, "Claimed by another actor first");
                }
                Err(VerifyError::NoPendingRecords(_)) => {
                    // Flagged RUNNING with nothing left to do
                    if self
                        .store
                        .transition_state(&batch, BatchState::Running, BatchState::Completed)
                        .await?
                    {
                        info!(batch = %batch, "Nothing pending; batch settled as COMPLETED");
                    }
                }
                Err(e) => {
                    error!(batch = %batch, error = %e, "Supervisor run failed");
                    match self.lifecycle.fail(&batch).await {
                        Ok(_) | Err(VerifyError::InvalidTransition { .. }) => {}
                        Err(e) => warn!(batch = %batch, error = %e, "Could not mark batch as ERROR"),
                    }
                }
            }
        }

        Ok(driven)
    }
}
