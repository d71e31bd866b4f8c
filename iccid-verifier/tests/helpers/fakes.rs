//! Scripted browser, classifier and store doubles

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use iccid_common::db::{BatchProcess, BatchState, RecordStatus, VerificationRecord};
use iccid_common::{Error, Result};
use iccid_verifier::browser::{
    BrowserError, BrowserLauncher, BrowserSession, ElementRef, Selector,
};
use iccid_verifier::models::{RunTallies, VerificationOutcome};
use iccid_verifier::portal::Classifier;
use iccid_verifier::store::{InsertOutcome, NewRecord, ProcessClaim, RecordFilter, RecordStore};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Session that does nothing; used with a scripted classifier.
///
/// With `reads_left` set, page reads fail with `invalid session id` once
/// the budget is spent, the way chromedriver answers after a tab crash.
pub struct NullSession {
    closed: Arc<AtomicUsize>,
    reads_left: Option<usize>,
}

#[async_trait]
impl BrowserSession for NullSession {
    async fn navigate(&mut self, _url: &str, _timeout: Duration) -> std::result::Result<(), BrowserError> {
        Ok(())
    }

    async fn find_visible(
        &mut self,
        _selector: &Selector,
        _timeout: Duration,
    ) -> std::result::Result<Option<ElementRef>, BrowserError> {
        Ok(None)
    }

    async fn click(&mut self, _element: &ElementRef) -> std::result::Result<(), BrowserError> {
        Ok(())
    }

    async fn clear(&mut self, _element: &ElementRef) -> std::result::Result<(), BrowserError> {
        Ok(())
    }

    async fn type_text(&mut self, _element: &ElementRef, _text: &str) -> std::result::Result<(), BrowserError> {
        Ok(())
    }

    async fn press_enter(&mut self, _element: &ElementRef) -> std::result::Result<(), BrowserError> {
        Ok(())
    }

    async fn page_source(&mut self) -> std::result::Result<String, BrowserError> {
        match self.reads_left.as_mut() {
            Some(0) => Err(BrowserError::Protocol {
                error: "invalid session id".to_string(),
                message: "session deleted because of page crash".to_string(),
            }),
            Some(left) => {
                *left -= 1;
                Ok(String::new())
            }
            None => Ok(String::new()),
        }
    }

    async fn input_value(&mut self, _element: &ElementRef) -> std::result::Result<String, BrowserError> {
        Ok(String::new())
    }

    async fn close(&mut self) -> std::result::Result<(), BrowserError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out [`NullSession`]s and counts launches and closes
#[derive(Default)]
pub struct NullLauncher {
    pub launched: AtomicUsize,
    pub closed: Arc<AtomicUsize>,
    first_session_reads: Option<usize>,
}

impl NullLauncher {
    /// The first session dies after `reads` page reads; later ones live on
    pub fn crashing_after(reads: usize) -> Self {
        Self {
            first_session_reads: Some(reads),
            ..Self::default()
        }
    }

    pub fn launches(&self) -> usize {
        self.launched.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrowserLauncher for NullLauncher {
    async fn launch(&self) -> std::result::Result<Box<dyn BrowserSession>, BrowserError> {
        let previous = self.launched.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(NullSession {
            closed: Arc::clone(&self.closed),
            reads_left: if previous == 0 {
                self.first_session_reads
            } else {
                None
            },
        }))
    }
}

/// Launcher whose browser never starts
pub struct FailingLauncher;

#[async_trait]
impl BrowserLauncher for FailingLauncher {
    async fn launch(&self) -> std::result::Result<Box<dyn BrowserSession>, BrowserError> {
        Err(BrowserError::Transport("connection refused".to_string()))
    }
}

/// Side effect run when the classifier sees a key
#[derive(Clone)]
pub enum Hook {
    /// Actor transition on the lifecycle row
    Transition {
        store: Arc<dyn RecordStore>,
        batch: String,
        from: BatchState,
        to: BatchState,
    },
    /// Lifecycle row removed under the run
    DeleteProcess {
        store: Arc<dyn RecordStore>,
        batch: String,
    },
    /// Local cancellation, as on shutdown
    Cancel(CancellationToken),
    /// A slow portal
    Delay(Duration),
}

type Scripted = std::result::Result<VerificationOutcome, BrowserError>;

/// Classifier answering from per-key queues.
///
/// Keys without a queued answer resolve INACTIVE.
#[derive(Default)]
pub struct ScriptedClassifier {
    answers: Mutex<HashMap<String, VecDeque<Scripted>>>,
    hooks: Mutex<HashMap<String, Hook>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn answer(self, key: impl Into<String>, answer: Scripted) -> Self {
        self.answers
            .lock()
            .unwrap()
            .entry(key.into())
            .or_default()
            .push_back(answer);
        self
    }

    /// Run `hook` the first time `key` is classified
    pub fn on_key(self, key: impl Into<String>, hook: Hook) -> Self {
        self.hooks.lock().unwrap().insert(key.into(), hook);
        self
    }

    /// Keys classified so far, one entry per attempt
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn attempts_for(&self, key: &str) -> usize {
        self.calls().iter().filter(|k| k.as_str() == key).count()
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn classify(
        &self,
        _session: &mut dyn BrowserSession,
        key: &str,
    ) -> std::result::Result<VerificationOutcome, BrowserError> {
        self.calls.lock().unwrap().push(key.to_string());

        let hook = self.hooks.lock().unwrap().remove(key);
        match hook {
            Some(Hook::Transition {
                store,
                batch,
                from,
                to,
            }) => {
                store.transition_state(&batch, from, to).await.unwrap();
            }
            Some(Hook::DeleteProcess { store, batch }) => {
                store.delete_process(&batch).await.unwrap();
            }
            Some(Hook::Cancel(token)) => token.cancel(),
            Some(Hook::Delay(delay)) => tokio::time::sleep(delay).await,
            None => {}
        }

        let answer = self
            .answers
            .lock()
            .unwrap()
            .get_mut(key)
            .and_then(|queue| queue.pop_front());
        answer.unwrap_or_else(|| Ok(VerificationOutcome::inactive()))
    }
}

/// Classifier that reads the page, so a dead session surfaces as an error
#[derive(Default)]
pub struct PageReadingClassifier {
    calls: AtomicUsize,
}

impl PageReadingClassifier {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Classifier for PageReadingClassifier {
    async fn classify(
        &self,
        session: &mut dyn BrowserSession,
        _key: &str,
    ) -> std::result::Result<VerificationOutcome, BrowserError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        session.page_source().await?;
        Ok(VerificationOutcome::inactive())
    }
}

/// Store wrapper that injects empty pages and failed outcome writes
pub struct FaultyStore {
    inner: Arc<dyn RecordStore>,
    empty_fetches: AtomicU32,
    failing_outcomes: Mutex<HashSet<String>>,
    stop_behind_cancel: Option<CancellationToken>,
    stop_written: AtomicBool,
}

impl FaultyStore {
    pub fn new(inner: Arc<dyn RecordStore>) -> Self {
        Self {
            inner,
            empty_fetches: AtomicU32::new(0),
            failing_outcomes: Mutex::new(HashSet::new()),
            stop_behind_cancel: None,
            stop_written: AtomicBool::new(false),
        }
    }

    /// Once `token` is cancelled, the next lifecycle read returns the
    /// RUNNING row it saw and writes STOPPED right behind it
    pub fn with_stop_behind_cancel(mut self, token: CancellationToken) -> Self {
        self.stop_behind_cancel = Some(token);
        self
    }

    /// The next `count` range reads come back empty
    pub fn with_empty_fetches(self, count: u32) -> Self {
        self.empty_fetches.store(count, Ordering::SeqCst);
        self
    }

    /// Outcome writes for `identifier_full` fail
    pub fn with_failing_outcome(self, identifier_full: impl Into<String>) -> Self {
        self.failing_outcomes
            .lock()
            .unwrap()
            .insert(identifier_full.into());
        self
    }
}

#[async_trait]
impl RecordStore for FaultyStore {
    async fn insert_record(&self, record: &NewRecord) -> Result<InsertOutcome> {
        self.inner.insert_record(record).await
    }

    async fn update_record_outcome(
        &self,
        identifier_full: &str,
        outcome: &VerificationOutcome,
        verified_at: DateTime<Utc>,
    ) -> Result<bool> {
        if self.failing_outcomes.lock().unwrap().contains(identifier_full) {
            return Err(Error::Internal("disk I/O error".to_string()));
        }
        self.inner
            .update_record_outcome(identifier_full, outcome, verified_at)
            .await
    }

    async fn count_records(&self, filter: &RecordFilter) -> Result<u64> {
        self.inner.count_records(filter).await
    }

    async fn fetch_records(
        &self,
        filter: &RecordFilter,
        offset: u64,
        limit: u32,
    ) -> Result<Vec<VerificationRecord>> {
        let empty = self
            .empty_fetches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if empty {
            return Ok(Vec::new());
        }
        self.inner.fetch_records(filter, offset, limit).await
    }

    async fn delete_records(&self, filter: &RecordFilter) -> Result<u64> {
        self.inner.delete_records(filter).await
    }

    async fn reset_records(&self, batch: &str, status: Option<RecordStatus>) -> Result<u64> {
        self.inner.reset_records(batch, status).await
    }

    async fn batch_names(&self) -> Result<Vec<String>> {
        self.inner.batch_names().await
    }

    async fn launch_process(&self, claim: &ProcessClaim) -> Result<Option<BatchProcess>> {
        self.inner.launch_process(claim).await
    }

    async fn transition_state(
        &self,
        batch: &str,
        from: BatchState,
        to: BatchState,
    ) -> Result<bool> {
        self.inner.transition_state(batch, from, to).await
    }

    async fn update_progress(
        &self,
        batch: &str,
        owner: &str,
        tallies: &RunTallies,
        lease_until_ms: i64,
    ) -> Result<bool> {
        self.inner
            .update_progress(batch, owner, tallies, lease_until_ms)
            .await
    }

    async fn renew_claim(&self, batch: &str, owner: &str, lease_until_ms: i64) -> Result<bool> {
        self.inner.renew_claim(batch, owner, lease_until_ms).await
    }

    async fn finalize_process(&self, batch: &str, owner: &str, state: BatchState) -> Result<bool> {
        self.inner.finalize_process(batch, owner, state).await
    }

    async fn release_claim(&self, batch: &str, owner: &str) -> Result<bool> {
        self.inner.release_claim(batch, owner).await
    }

    async fn get_process(&self, batch: &str) -> Result<Option<BatchProcess>> {
        let row = self.inner.get_process(batch).await?;

        let cancelled = self
            .stop_behind_cancel
            .as_ref()
            .map(|token| token.is_cancelled())
            .unwrap_or(false);
        let running = row.as_ref().map(|p| p.state == BatchState::Running).unwrap_or(false);
        if cancelled && running && !self.stop_written.swap(true, Ordering::SeqCst) {
            self.inner
                .transition_state(batch, BatchState::Running, BatchState::Stopped)
                .await?;
        }

        Ok(row)
    }

    async fn list_processes(&self, state: Option<BatchState>) -> Result<Vec<BatchProcess>> {
        self.inner.list_processes(state).await
    }

    async fn delete_process(&self, batch: &str) -> Result<bool> {
        self.inner.delete_process(batch).await
    }
}
