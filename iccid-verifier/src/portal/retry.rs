//! Bounded retry around one classification
//!
//! Only automation failures (`Err`) are retried. An `ERROR` outcome returned
//! cleanly by the classifier is the record's result.

use std::time::Duration;
use tracing::warn;

use super::Classifier;
use crate::browser::{BrowserError, BrowserSession};
use crate::config::RetrySettings;
use crate::models::VerificationOutcome;

/// Exponential backoff retry policy
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff,
        }
    }

    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self::new(
            settings.max_attempts,
            Duration::from_millis(settings.initial_backoff_ms),
            Duration::from_millis(settings.max_backoff_ms),
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Wait after failed attempt number `attempt` (1-based): the initial
    /// backoff doubled per attempt, capped
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Classify `key`, retrying automation failures.
    ///
    /// Stops early when the session is lost, since every further command on
    /// it fails the same way. The caller decides whether a failure becomes an
    /// `ERROR` outcome or earns another try on a new session.
    pub async fn verify(
        &self,
        classifier: &dyn Classifier,
        session: &mut dyn BrowserSession,
        key: &str,
    ) -> Result<VerificationOutcome, AttemptsFailed> {
        let mut attempt = 1;

        loop {
            match classifier.classify(session, key).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_session_lost() || attempt >= self.max_attempts => {
                    warn!(key, attempt, error = %e, "Verification attempts exhausted");
                    return Err(AttemptsFailed {
                        attempts: attempt,
                        error: e,
                    });
                }
                Err(e) => {
                    let backoff = self.backoff_after(attempt);
                    warn!(
                        key,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Verification attempt failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Last automation failure of a [`RetryPolicy::verify`] call
#[derive(Debug)]
pub struct AttemptsFailed {
    pub attempts: u32,
    pub error: BrowserError,
}

impl AttemptsFailed {
    pub fn needs_new_session(&self) -> bool {
        self.error.needs_new_session()
    }

    /// The `ERROR` outcome recorded for the key
    pub fn into_outcome(self) -> VerificationOutcome {
        VerificationOutcome::error(format!(
            "automation failure after {} attempts: {}",
            self.attempts, self.error
        ))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}
