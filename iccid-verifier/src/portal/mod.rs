//! Portal verification: one classified submission plus bounded retry

pub mod classifier;
pub mod retry;

pub use classifier::PortalClassifier;
pub use retry::{AttemptsFailed, RetryPolicy};

use async_trait::async_trait;

use crate::browser::{BrowserError, BrowserSession};
use crate::models::VerificationOutcome;

/// Resolves one key to an outcome using a live browser session.
///
/// A clean `Ok` (including an `ERROR` outcome) is final for the record;
/// `Err` means the automation itself failed and the attempt may be retried.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(
        &self,
        session: &mut dyn BrowserSession,
        key: &str,
    ) -> Result<VerificationOutcome, BrowserError>;
}
