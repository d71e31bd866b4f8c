//! Portal session classifier
//!
//! Submits one key to the activation portal and watches the rendered page
//! for one of two signals:
//! - inactive: the page mentions the activation link or phrase
//! - active: the auto-validated number field holds a full phone number
//!
//! The portal gives no completion event, so observation is a fixed settle
//! delay followed by a bounded number of polling rounds. The inactive
//! signal is checked first on every round; that precedence is an observed
//! portal behaviour, not a documented one.

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use super::Classifier;
use crate::browser::{BrowserError, BrowserSession, Selector};
use crate::config::PortalSettings;
use crate::models::VerificationOutcome;

pub const NOTE_PAGE_TIMEOUT: &str = "page load timeout";
pub const NOTE_INPUT_MISSING: &str = "input field not found";
pub const NOTE_INDETERMINATE: &str = "indeterminate response (timeout)";

/// [`Classifier`] for the activation portal
pub struct PortalClassifier {
    settings: PortalSettings,
}

impl PortalClassifier {
    pub fn new(settings: PortalSettings) -> Self {
        Self { settings }
    }

    /// Click the first visible cookie banner button, if any
    async fn dismiss_cookie_banner(&self, session: &mut dyn BrowserSession) {
        let timeout = ms(self.settings.cookie_timeout_ms);

        for label in &self.settings.cookie_buttons {
            match session
                .find_visible(&Selector::button_with_text(label), timeout)
                .await
            {
                Ok(Some(button)) => {
                    if let Err(e) = session.click(&button).await {
                        debug!(label = %label, error = %e, "Cookie button click failed");
                        continue;
                    }
                    debug!(label = %label, "Cookie banner dismissed");
                    pause(self.settings.cookie_settle_ms).await;
                    return;
                }
                Ok(None) => {}
                Err(e) => debug!(label = %label, error = %e, "Cookie button lookup failed"),
            }
        }
    }

    /// One observation round; `None` when neither signal is present yet
    async fn observe(
        &self,
        session: &mut dyn BrowserSession,
    ) -> Result<Option<VerificationOutcome>, BrowserError> {
        let source = session.page_source().await?;
        if self
            .settings
            .inactive_markers
            .iter()
            .any(|marker| source.contains(marker.as_str()))
        {
            return Ok(Some(VerificationOutcome::inactive()));
        }

        let active_field = Selector::placeholder_contains(&self.settings.active_placeholder);
        if let Some(field) = session
            .find_visible(&active_field, ms(self.settings.active_field_timeout_ms))
            .await?
        {
            let value = session.input_value(&field).await?;
            let value = value.trim();
            if is_assigned_number(value, self.settings.number_digits) {
                return Ok(Some(VerificationOutcome::active(value)));
            }
        }

        Ok(None)
    }
}

#[async_trait]
impl Classifier for PortalClassifier {
    async fn classify(
        &self,
        session: &mut dyn BrowserSession,
        key: &str,
    ) -> Result<VerificationOutcome, BrowserError> {
        let s = &self.settings;

        match session.navigate(&s.url, ms(s.page_load_timeout_ms)).await {
            Ok(()) => {}
            Err(BrowserError::Timeout(msg)) => {
                debug!(key, error = %msg, "Portal page load timed out");
                return Ok(VerificationOutcome::error(NOTE_PAGE_TIMEOUT));
            }
            Err(e) => return Err(e),
        }
        pause(s.post_load_delay_ms).await;

        self.dismiss_cookie_banner(session).await;

        let input_selector = Selector::placeholder_contains(&s.input_placeholder);
        let Some(input) = session
            .find_visible(&input_selector, ms(s.input_timeout_ms))
            .await?
        else {
            return Ok(VerificationOutcome::error(NOTE_INPUT_MISSING));
        };

        session.click(&input).await?;
        pause(s.keystroke_delay_ms).await;
        session.clear(&input).await?;
        pause(s.keystroke_delay_ms).await;
        session.type_text(&input, key).await?;
        pause(s.pre_submit_delay_ms).await;
        session.press_enter(&input).await?;

        pause(s.settle_delay_ms).await;

        for round in 1..=s.poll_rounds {
            match self.observe(session).await {
                Ok(Some(outcome)) => {
                    debug!(key, round, status = %outcome.status(), "Portal signal observed");
                    return Ok(outcome);
                }
                Ok(None) => {}
                // The page may be mid-render; the next round looks again
                Err(e) => debug!(key, round, error = %e, "Signal check failed"),
            }
            if round < s.poll_rounds {
                pause(s.poll_interval_ms).await;
            }
        }

        Ok(VerificationOutcome::error(NOTE_INDETERMINATE))
    }
}

/// Exactly `digits` ASCII digits
fn is_assigned_number(value: &str, digits: usize) -> bool {
    value.len() == digits && value.chars().all(|c| c.is_ascii_digit())
}

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

async fn pause(millis: u64) {
    if millis > 0 {
        tokio::time::sleep(ms(millis)).await;
    }
}
