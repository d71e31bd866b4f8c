//! In-process run table
//!
//! The HTTP service starts engine runs as background tasks. `RunCoordinator`
//! owns the table of those tasks keyed by batch name, each with its
//! cancellation token, and is the only place that spawns or cancels them.

use chrono::{DateTime, Utc};
use iccid_common::db::BatchProcess;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::engine::VerificationEngine;
use crate::error::{VerifyError, VerifyResult};
use crate::lifecycle::BatchLifecycle;

struct RunHandle {
    owner: String,
    target: u64,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Public view of an in-process run
#[derive(Debug, Clone, Serialize)]
pub struct RunInfo {
    pub batch: String,
    pub owner: String,
    pub target: u64,
    pub started_at: DateTime<Utc>,
}

/// Owns the background engine runs of this process
#[derive(Clone)]
pub struct RunCoordinator {
    engine: Arc<VerificationEngine>,
    lifecycle: BatchLifecycle,
    runs: Arc<RwLock<HashMap<String, RunHandle>>>,
}

impl RunCoordinator {
    pub fn new(engine: Arc<VerificationEngine>, lifecycle: BatchLifecycle) -> Self {
        Self {
            engine,
            lifecycle,
            runs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Claim `batch` and drive it in the background.
    ///
    /// Returns the freshly launched lifecycle row.
    pub async fn start(&self, batch: &str, cap: Option<u64>) -> VerifyResult<BatchProcess> {
        if self.is_running(batch).await {
            return Err(VerifyError::AlreadyRunning {
                batch: batch.to_string(),
            });
        }

        let ticket = self.engine.prepare(batch, cap).await?;
        let process = self
            .engine
            .store()
            .get_process(batch)
            .await?
            .ok_or_else(|| VerifyError::BatchNotFound(batch.to_string()))?;

        let cancel = CancellationToken::new();
        let owner = ticket.owner.clone();
        let target = ticket.target;

        // Hold the table while spawning so the task's own removal cannot
        // run before its entry exists
        let mut runs = self.runs.write().await;

        let task = {
            let engine = Arc::clone(&self.engine);
            let runs = Arc::clone(&self.runs);
            let cancel = cancel.clone();
            let batch = batch.to_string();
            let owner = owner.clone();

            tokio::spawn(async move {
                match engine.drive(ticket, cancel).await {
                    Ok(summary) => info!(
                        batch = %batch,
                        exit = ?summary.exit,
                        processed = summary.tallies.processed,
                        "Background run ended"
                    ),
                    Err(e) => error!(batch = %batch, error = %e, "Background run failed"),
                }

                let mut runs = runs.write().await;
                if runs.get(&batch).map(|h| h.owner == owner).unwrap_or(false) {
                    runs.remove(&batch);
                }
            })
        };

        runs.insert(
            batch.to_string(),
            RunHandle {
                owner,
                target,
                started_at: Utc::now(),
                cancel,
                task,
            },
        );

        Ok(process)
    }

    pub async fn pause(&self, batch: &str) -> VerifyResult<BatchProcess> {
        self.lifecycle.pause(batch).await
    }

    pub async fn resume(&self, batch: &str) -> VerifyResult<BatchProcess> {
        self.lifecycle.resume(batch).await
    }

    /// Write STOPPED, then wake the local run (if any) out of its sleeps.
    ///
    /// The record in flight still completes; runs owned by other processes
    /// see STOPPED at their next checkpoint.
    pub async fn stop(&self, batch: &str) -> VerifyResult<BatchProcess> {
        let process = self.lifecycle.stop(batch).await?;

        if let Some(handle) = self.runs.read().await.get(batch) {
            handle.cancel.cancel();
        }

        Ok(process)
    }

    /// Whether this process still drives `batch`
    pub async fn is_running(&self, batch: &str) -> bool {
        self.runs
            .read()
            .await
            .get(batch)
            .map(|h| !h.task.is_finished())
            .unwrap_or(false)
    }

    /// Runs currently driven by this process, ordered by batch
    pub async fn active_runs(&self) -> Vec<RunInfo> {
        let runs = self.runs.read().await;
        let mut infos: Vec<RunInfo> = runs
            .iter()
            .filter(|(_, h)| !h.task.is_finished())
            .map(|(batch, h)| RunInfo {
                batch: batch.clone(),
                owner: h.owner.clone(),
                target: h.target,
                started_at: h.started_at,
            })
            .collect();
        infos.sort_by(|a, b| a.batch.cmp(&b.batch));
        infos
    }

    /// Cancel every run and wait for them to release their claims
    pub async fn shutdown(&self) {
        let handles: Vec<(String, RunHandle)> = self.runs.write().await.drain().collect();
        if handles.is_empty() {
            return;
        }

        info!(runs = handles.len(), "Interrupting background runs");
        for (_, handle) in &handles {
            handle.cancel.cancel();
        }
        for (batch, handle) in handles {
            if let Err(e) = handle.task.await {
                warn!(batch = %batch, error = %e, "Run task ended abnormally");
            }
        }
    }
}
