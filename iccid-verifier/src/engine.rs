//! Batch verification engine
//!
//! One run verifies up to `target` pending records of a batch, one at a time,
//! through a single browser session:
//!
//! 1. `prepare` counts pending records and claims the lifecycle row
//!    (conditional upsert keyed on a fresh owner token).
//! 2. `drive` pages through pending records in chunks no larger than the
//!    store's page ceiling. Before each record it re-reads the lifecycle row
//!    (checkpoint): STOPPED ends the run, PAUSED blocks it, a foreign owner
//!    abandons it.
//! 3. Each record is verified through the retry policy, its outcome
//!    persisted, and progress written back under the claim. The claim is
//!    renewed while a record is in flight. A record whose attempts died with
//!    the browser gets one more try on a relaunched session.
//! 4. On exit the run writes COMPLETED when nothing is pending any more,
//!    INCOMPLETE otherwise, or ERROR when the loop itself failed.
//!
//! Cancelling the run's token without a STOPPED state (process shutdown)
//! releases the claim and leaves the row for another actor to pick up. A
//! stop that lands alongside the cancellation is finalized as a stop.

use iccid_common::db::{BatchState, VerificationRecord};
use iccid_common::events::{EventBus, VerifierEvent};
use iccid_common::time;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::browser::{BrowserLauncher, BrowserSession};
use crate::config::EngineSettings;
use crate::error::{VerifyError, VerifyResult};
use crate::models::{RunExit, RunSummary, RunTallies, VerificationOutcome};
use crate::portal::{AttemptsFailed, Classifier, RetryPolicy};
use crate::store::{ProcessClaim, RecordFilter, RecordStore, MAX_PAGE_SIZE};

/// A claimed batch, ready to be driven
#[derive(Debug, Clone)]
pub struct RunTicket {
    pub batch: String,
    /// Claim token written to the lifecycle row
    pub owner: String,
    /// Records this run will process at most
    pub target: u64,
}

/// Result of a lifecycle checkpoint
enum Checkpoint {
    Proceed,
    Exit(RunExit),
}

/// Result of handling one record
enum RecordStep {
    Counted,
    /// Outcome not persisted; record left as it was
    Skipped,
    Exit(RunExit),
}

/// Drives verification runs for any batch
pub struct VerificationEngine {
    store: Arc<dyn RecordStore>,
    launcher: Arc<dyn BrowserLauncher>,
    classifier: Arc<dyn Classifier>,
    retry: RetryPolicy,
    settings: EngineSettings,
    event_bus: EventBus,
}

impl VerificationEngine {
    pub fn new(
        store: Arc<dyn RecordStore>,
        launcher: Arc<dyn BrowserLauncher>,
        classifier: Arc<dyn Classifier>,
        retry: RetryPolicy,
        settings: EngineSettings,
        event_bus: EventBus,
    ) -> Self {
        Self {
            store,
            launcher,
            classifier,
            retry,
            settings,
            event_bus,
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Claim `batch` for a new run over `min(cap, pending)` records.
    ///
    /// Fails with `NoPendingRecords` (nothing written) when the batch has no
    /// pending records, and `AlreadyClaimed` when another run holds a live
    /// claim.
    pub async fn prepare(&self, batch: &str, cap: Option<u64>) -> VerifyResult<RunTicket> {
        if batch.trim().is_empty() {
            return Err(VerifyError::InvalidInput("batch name must not be empty".into()));
        }
        if cap == Some(0) {
            return Err(VerifyError::InvalidInput("cap must be at least 1".into()));
        }

        let pending = self
            .store
            .count_records(&RecordFilter::pending_in(batch))
            .await?;
        if pending == 0 {
            info!(batch, "No pending records; nothing to launch");
            return Err(VerifyError::NoPendingRecords(batch.to_string()));
        }

        let target = cap.map_or(pending, |cap| cap.min(pending));
        let owner = Uuid::new_v4().to_string();
        let now_ms = time::epoch_ms(&time::now());
        let claim = ProcessClaim {
            batch: batch.to_string(),
            owner: owner.clone(),
            total: target,
            lease_until_ms: now_ms + self.lease_ms(),
            now_ms,
        };

        if self.store.launch_process(&claim).await?.is_none() {
            warn!(batch, "Batch is claimed by another run");
            return Err(VerifyError::AlreadyClaimed {
                batch: batch.to_string(),
            });
        }

        info!(batch, owner = %owner, target, pending, "Batch launched");
        self.event_bus.emit_lossy(VerifierEvent::BatchLaunched {
            batch: batch.to_string(),
            total: target,
            owner: owner.clone(),
            timestamp: time::now(),
        });

        Ok(RunTicket {
            batch: batch.to_string(),
            owner,
            target,
        })
    }

    /// `prepare` then `drive`
    pub async fn run(
        &self,
        batch: &str,
        cap: Option<u64>,
        cancel: CancellationToken,
    ) -> VerifyResult<RunSummary> {
        let ticket = self.prepare(batch, cap).await?;
        self.drive(ticket, cancel).await
    }

    /// Run the control loop for a claimed batch until it finishes, is
    /// stopped, loses its claim or is cancelled.
    pub async fn drive(
        &self,
        ticket: RunTicket,
        cancel: CancellationToken,
    ) -> VerifyResult<RunSummary> {
        let started = Instant::now();
        let mut tallies = RunTallies::default();

        let mut session = match self.launcher.launch().await {
            Ok(session) => session,
            Err(e) => {
                let err = VerifyError::from(e);
                self.mark_failed(&ticket, &tallies, started, &err).await;
                return Err(err);
            }
        };

        let result = self
            .control_loop(&ticket, &mut session, &mut tallies, &cancel)
            .await;

        if let Err(e) = session.close().await {
            warn!(batch = %ticket.batch, error = %e, "Failed to close browser session");
        }

        let exit = match result {
            Ok(exit) => exit,
            Err(err) => {
                self.mark_failed(&ticket, &tallies, started, &err).await;
                return Err(err);
            }
        };

        let exit = match self.finish(&ticket, exit).await {
            Ok(exit) => exit,
            Err(err) => {
                self.mark_failed(&ticket, &tallies, started, &err).await;
                return Err(err);
            }
        };

        let summary = RunSummary {
            batch: ticket.batch.clone(),
            exit,
            target: ticket.target,
            tallies,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        info!(
            batch = %summary.batch,
            exit = ?summary.exit,
            processed = tallies.processed,
            active = tallies.active,
            inactive = tallies.inactive,
            errors = tallies.errors,
            elapsed_ms = summary.duration_ms,
            "Verification run finished"
        );

        if let Some(state) = exit.final_state() {
            self.emit_finished(&ticket.batch, state, &tallies, summary.duration_ms);
        }

        Ok(summary)
    }

    async fn control_loop(
        &self,
        ticket: &RunTicket,
        session: &mut Box<dyn BrowserSession>,
        tallies: &mut RunTallies,
        cancel: &CancellationToken,
    ) -> VerifyResult<RunExit> {
        let filter = RecordFilter::pending_in(&ticket.batch);
        let chunk_size = self.settings.chunk_size.clamp(1, MAX_PAGE_SIZE) as u64;
        // Records whose outcome could not be written stay pending; they sit
        // at the front of the id-ordered pending set and are paged past.
        let mut skipped: HashSet<String> = HashSet::new();
        let mut empty_reads = 0u32;

        while tallies.processed < ticket.target {
            if let Checkpoint::Exit(exit) = self.checkpoint(ticket, cancel).await? {
                return Ok(exit);
            }

            let remaining = ticket.target - tallies.processed;
            let limit = remaining.min(chunk_size) as u32;
            let chunk: Vec<VerificationRecord> = self
                .store
                .fetch_records(&filter, skipped.len() as u64, limit)
                .await?
                .into_iter()
                .filter(|record| !skipped.contains(&record.identifier_full))
                .collect();

            debug!(batch = %ticket.batch, size = chunk.len(), remaining, "Fetched chunk");

            if chunk.is_empty() {
                let pending = self.store.count_records(&filter).await?;
                if pending <= skipped.len() as u64 {
                    info!(batch = %ticket.batch, "No pending records left");
                    break;
                }

                empty_reads += 1;
                if empty_reads > self.settings.max_empty_chunk_retries {
                    warn!(
                        batch = %ticket.batch,
                        pending,
                        empty_reads,
                        "Pending records reported but none readable; giving up on this run"
                    );
                    break;
                }

                warn!(
                    batch = %ticket.batch,
                    pending,
                    empty_reads,
                    "Empty chunk while records are pending; retrying"
                );
                if !self
                    .store
                    .renew_claim(&ticket.batch, &ticket.owner, self.lease_until())
                    .await?
                {
                    warn!(batch = %ticket.batch, "Claim lost while waiting for records");
                    return Ok(RunExit::Abandoned);
                }
                self.sleep_or_cancel(self.settings.empty_chunk_retry_ms, cancel)
                    .await;
                continue;
            }
            empty_reads = 0;

            for (index, record) in chunk.iter().enumerate() {
                if tallies.processed >= ticket.target {
                    break;
                }
                // The chunk's first record was covered by the checkpoint above
                if index > 0 {
                    if let Checkpoint::Exit(exit) = self.checkpoint(ticket, cancel).await? {
                        return Ok(exit);
                    }
                }

                match self.process_record(ticket, session, record, tallies).await? {
                    RecordStep::Counted => {}
                    RecordStep::Skipped => {
                        skipped.insert(record.identifier_full.clone());
                    }
                    RecordStep::Exit(exit) => return Ok(exit),
                }

                if tallies.processed < ticket.target {
                    self.sleep_or_cancel(self.settings.record_delay_ms, cancel)
                        .await;
                }
            }
        }

        Ok(RunExit::Completed)
    }

    /// Verify, persist and count one record
    async fn process_record(
        &self,
        ticket: &RunTicket,
        session: &mut Box<dyn BrowserSession>,
        record: &VerificationRecord,
        tallies: &mut RunTallies,
    ) -> VerifyResult<RecordStep> {
        let key = record.identifier_key.as_str();
        let outcome = match self.verify_under_claim(ticket, &mut **session, key).await {
            Ok(outcome) => outcome,
            Err(failure) if failure.needs_new_session() => {
                warn!(
                    batch = %ticket.batch,
                    identifier = %record.identifier_full,
                    error = %failure.error,
                    "Browser session unusable; relaunching"
                );
                self.relaunch(ticket, session).await?;
                self.verify_under_claim(ticket, &mut **session, key)
                    .await
                    .unwrap_or_else(AttemptsFailed::into_outcome)
            }
            Err(failure) => failure.into_outcome(),
        };

        match self
            .store
            .update_record_outcome(&record.identifier_full, &outcome, time::now())
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                warn!(
                    batch = %ticket.batch,
                    identifier = %record.identifier_full,
                    "Record no longer pending; outcome discarded"
                );
                return Ok(RecordStep::Skipped);
            }
            Err(e) => {
                warn!(
                    batch = %ticket.batch,
                    identifier = %record.identifier_full,
                    error = %e,
                    "Failed to persist outcome; record stays pending"
                );
                return Ok(RecordStep::Skipped);
            }
        }

        tallies.record(outcome.status());

        match self
            .store
            .update_progress(&ticket.batch, &ticket.owner, tallies, self.lease_until())
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                warn!(batch = %ticket.batch, "Claim lost; abandoning run");
                return Ok(RecordStep::Exit(RunExit::Abandoned));
            }
            // The next successful write carries the full tallies
            Err(e) => warn!(batch = %ticket.batch, error = %e, "Failed to persist progress"),
        }

        info!(
            batch = %ticket.batch,
            identifier = %record.identifier_full,
            status = %outcome.status(),
            number = outcome.assigned_number().unwrap_or("-"),
            current = tallies.processed,
            total = ticket.target,
            "Record verified"
        );

        self.event_bus.emit_lossy(VerifierEvent::RecordVerified {
            batch: ticket.batch.clone(),
            identifier_full: record.identifier_full.clone(),
            status: outcome.status(),
            assigned_number: outcome.assigned_number().map(str::to_string),
            current: tallies.processed,
            total: ticket.target,
            timestamp: time::now(),
        });

        Ok(RecordStep::Counted)
    }

    /// Run the retry policy for `key`, renewing the claim until it returns
    async fn verify_under_claim(
        &self,
        ticket: &RunTicket,
        session: &mut dyn BrowserSession,
        key: &str,
    ) -> Result<VerificationOutcome, AttemptsFailed> {
        let verify = self.retry.verify(self.classifier.as_ref(), session, key);
        tokio::pin!(verify);

        let mut heartbeat = tokio::time::interval(time::millis_to_duration(self.heartbeat_ms()));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        heartbeat.tick().await;

        loop {
            tokio::select! {
                result = &mut verify => return result,
                _ = heartbeat.tick() => {
                    match self
                        .store
                        .renew_claim(&ticket.batch, &ticket.owner, self.lease_until())
                        .await
                    {
                        Ok(true) => debug!(batch = %ticket.batch, key, "Claim renewed mid-record"),
                        // The progress write after this record notices the loss
                        Ok(false) => warn!(batch = %ticket.batch, key, "Claim lost mid-record"),
                        Err(e) => warn!(batch = %ticket.batch, error = %e, "Failed to renew claim"),
                    }
                }
            }
        }
    }

    /// Swap a dead browser session for a fresh one
    async fn relaunch(
        &self,
        ticket: &RunTicket,
        session: &mut Box<dyn BrowserSession>,
    ) -> VerifyResult<()> {
        if let Err(e) = session.close().await {
            debug!(batch = %ticket.batch, error = %e, "Closing the lost session failed");
        }
        *session = self.launcher.launch().await?;
        info!(batch = %ticket.batch, "Browser session relaunched");
        Ok(())
    }

    /// True when the row is STOPPED under this run's claim
    async fn stop_requested(&self, ticket: &RunTicket) -> VerifyResult<bool> {
        Ok(self
            .store
            .get_process(&ticket.batch)
            .await?
            .map(|p| {
                p.state == BatchState::Stopped && p.owner.as_deref() == Some(ticket.owner.as_str())
            })
            .unwrap_or(false))
    }

    /// Re-read the lifecycle row; block while PAUSED
    async fn checkpoint(
        &self,
        ticket: &RunTicket,
        cancel: &CancellationToken,
    ) -> VerifyResult<Checkpoint> {
        let mut announced_pause = false;

        loop {
            let Some(process) = self.store.get_process(&ticket.batch).await? else {
                warn!(batch = %ticket.batch, "Lifecycle row disappeared; abandoning run");
                return Ok(Checkpoint::Exit(RunExit::Abandoned));
            };

            if process.owner.as_deref() != Some(ticket.owner.as_str()) {
                warn!(batch = %ticket.batch, "Batch claimed by another run; abandoning");
                return Ok(Checkpoint::Exit(RunExit::Abandoned));
            }

            match process.state {
                BatchState::Running => {
                    if cancel.is_cancelled() {
                        return Ok(Checkpoint::Exit(RunExit::Interrupted));
                    }
                    if announced_pause {
                        info!(batch = %ticket.batch, "Batch resumed");
                    }
                    return Ok(Checkpoint::Proceed);
                }
                BatchState::Stopped => {
                    info!(batch = %ticket.batch, "Stop observed");
                    return Ok(Checkpoint::Exit(RunExit::Stopped));
                }
                BatchState::Paused => {
                    if cancel.is_cancelled() {
                        return Ok(Checkpoint::Exit(RunExit::Interrupted));
                    }
                    if !announced_pause {
                        info!(batch = %ticket.batch, "Batch paused; waiting");
                        announced_pause = true;
                    }
                    if !self
                        .store
                        .renew_claim(&ticket.batch, &ticket.owner, self.lease_until())
                        .await?
                    {
                        return Ok(Checkpoint::Exit(RunExit::Abandoned));
                    }
                    self.sleep_or_cancel(self.settings.pause_poll_ms, cancel)
                        .await;
                }
                other => {
                    warn!(batch = %ticket.batch, state = %other, "Unexpected state under claim; abandoning");
                    return Ok(Checkpoint::Exit(RunExit::Abandoned));
                }
            }
        }
    }

    /// Write the final state for a loop exit
    async fn finish(&self, ticket: &RunTicket, exit: RunExit) -> VerifyResult<RunExit> {
        let batch = ticket.batch.as_str();

        let state = match exit {
            RunExit::Abandoned => return Ok(RunExit::Abandoned),
            RunExit::Interrupted => {
                // A stop written just before the cancellation still wins
                if self.stop_requested(ticket).await? {
                    info!(batch, "Stop observed with cancellation");
                    BatchState::Stopped
                } else {
                    self.store.release_claim(batch, &ticket.owner).await?;
                    info!(batch, "Run interrupted; claim released");
                    return Ok(RunExit::Interrupted);
                }
            }
            RunExit::Stopped => BatchState::Stopped,
            RunExit::Completed | RunExit::Incomplete => {
                // A stop requested during the last record still wins
                if self.stop_requested(ticket).await? {
                    BatchState::Stopped
                } else if self
                    .store
                    .count_records(&RecordFilter::pending_in(batch))
                    .await?
                    == 0
                {
                    BatchState::Completed
                } else {
                    BatchState::Incomplete
                }
            }
        };

        if !self.store.finalize_process(batch, &ticket.owner, state).await? {
            warn!(batch, state = %state, "Claim lost before finalizing");
            return Ok(RunExit::Abandoned);
        }

        if state != BatchState::Stopped {
            self.event_bus.emit_lossy(VerifierEvent::BatchStateChanged {
                batch: batch.to_string(),
                old_state: BatchState::Running,
                new_state: state,
                timestamp: time::now(),
            });
        }

        Ok(match state {
            BatchState::Completed => RunExit::Completed,
            BatchState::Incomplete => RunExit::Incomplete,
            _ => RunExit::Stopped,
        })
    }

    /// Force ERROR after the control loop itself failed
    async fn mark_failed(
        &self,
        ticket: &RunTicket,
        tallies: &RunTallies,
        started: Instant,
        err: &VerifyError,
    ) {
        error!(batch = %ticket.batch, error = %err, "Verification run failed");

        match self
            .store
            .finalize_process(&ticket.batch, &ticket.owner, BatchState::Error)
            .await
        {
            Ok(true) => {
                self.event_bus.emit_lossy(VerifierEvent::BatchStateChanged {
                    batch: ticket.batch.clone(),
                    old_state: BatchState::Running,
                    new_state: BatchState::Error,
                    timestamp: time::now(),
                });
                self.emit_finished(
                    &ticket.batch,
                    BatchState::Error,
                    tallies,
                    started.elapsed().as_millis() as u64,
                );
            }
            Ok(false) => warn!(batch = %ticket.batch, "Claim already gone; ERROR not recorded"),
            Err(e) => error!(batch = %ticket.batch, error = %e, "Failed to record ERROR state"),
        }
    }

    fn emit_finished(&self, batch: &str, state: BatchState, tallies: &RunTallies, duration_ms: u64) {
        self.event_bus.emit_lossy(VerifierEvent::BatchFinished {
            batch: batch.to_string(),
            state,
            processed: tallies.processed,
            active: tallies.active,
            inactive: tallies.inactive,
            errors: tallies.errors,
            duration_ms,
            timestamp: time::now(),
        });
    }

    fn lease_ms(&self) -> i64 {
        self.settings.claim_lease_ms.min(i64::MAX as u64) as i64
    }

    /// Claim renewal period while a record is in flight
    fn heartbeat_ms(&self) -> u64 {
        (self.settings.claim_lease_ms / 3).max(1)
    }

    fn lease_until(&self) -> i64 {
        time::epoch_ms(&time::now()).saturating_add(self.lease_ms())
    }

    /// Sleep unless cancelled first; returns false when cancelled
    async fn sleep_or_cancel(&self, millis: u64, cancel: &CancellationToken) -> bool {
        if millis == 0 {
            return !cancel.is_cancelled();
        }
        tokio::select! {
            _ = tokio::time::sleep(time::millis_to_duration(millis)) => true,
            _ = cancel.cancelled() => false,
        }
    }
}
