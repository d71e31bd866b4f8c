//! Verifier configuration
//!
//! Tunables live in `<root>/iccid-verifier.toml`. Every section and field
//! is optional; missing values fall back to the defaults below, then a few
//! environment variables override the file.
//!
//! ```toml
//! [portal]
//! url = "https://mibait.com/haz-tu-portabilidad"
//! settle_delay_ms = 5000
//!
//! [engine]
//! record_delay_ms = 3000
//!
//! [supervisor]
//! assigned_batch = "LOTE_1"
//! ```

use iccid_common::{config::load_toml_or_default, Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::store::MAX_PAGE_SIZE;

/// Config file name inside the root folder
pub const CONFIG_FILE: &str = "iccid-verifier.toml";

/// WebDriver endpoint override
pub const WEBDRIVER_URL_ENV: &str = "ICCID_WEBDRIVER_URL";
/// Portal URL override
pub const PORTAL_URL_ENV: &str = "ICCID_PORTAL_URL";
/// Restricts the supervisor to one batch
pub const ASSIGNED_BATCH_ENV: &str = "ICCID_ASSIGNED_BATCH";

/// Top-level verifier configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    pub portal: PortalSettings,
    pub retry: RetrySettings,
    pub engine: EngineSettings,
    pub supervisor: SupervisorSettings,
    pub webdriver: WebDriverSettings,
}

/// Portal location, page markers and every classifier timing bound
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalSettings {
    pub url: String,
    /// Placeholder substring of the identifier input
    pub input_placeholder: String,
    /// Placeholder substring of the auto-validated number field
    pub active_placeholder: String,
    /// Page text that means the SIM still needs activation
    pub inactive_markers: Vec<String>,
    /// Labels of cookie banner buttons worth clicking
    pub cookie_buttons: Vec<String>,
    pub page_load_timeout_ms: u64,
    pub post_load_delay_ms: u64,
    pub cookie_timeout_ms: u64,
    pub cookie_settle_ms: u64,
    pub input_timeout_ms: u64,
    pub keystroke_delay_ms: u64,
    pub pre_submit_delay_ms: u64,
    /// Wait after submitting before the first signal check
    pub settle_delay_ms: u64,
    pub poll_rounds: u32,
    pub poll_interval_ms: u64,
    pub active_field_timeout_ms: u64,
    /// Digits in an assigned phone number
    pub number_digits: usize,
}

impl Default for PortalSettings {
    fn default() -> Self {
        Self {
            url: "https://mibait.com/haz-tu-portabilidad".to_string(),
            input_placeholder: "13 dígitos".to_string(),
            active_placeholder: "Validación automática".to_string(),
            inactive_markers: vec![
                "btz.mx/whatsappbait".to_string(),
                "necesita activarse".to_string(),
            ],
            cookie_buttons: vec!["close".to_string(), "Aceptar".to_string()],
            page_load_timeout_ms: 15_000,
            post_load_delay_ms: 2_000,
            cookie_timeout_ms: 2_000,
            cookie_settle_ms: 500,
            input_timeout_ms: 5_000,
            keystroke_delay_ms: 300,
            pre_submit_delay_ms: 500,
            settle_delay_ms: 5_000,
            poll_rounds: 10,
            poll_interval_ms: 500,
            active_field_timeout_ms: 500,
            number_digits: 10,
        }
    }
}

/// Bounded retry around one classification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 4_000,
            max_backoff_ms: 10_000,
        }
    }
}

/// Control loop pacing and claim lease
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Records fetched per chunk (at most the store's page ceiling)
    pub chunk_size: u32,
    /// Throttle between consecutive records
    pub record_delay_ms: u64,
    /// Re-check interval while a batch is paused
    pub pause_poll_ms: u64,
    /// Wait before re-reading a chunk that came back empty
    pub empty_chunk_retry_ms: u64,
    /// Empty reads tolerated in a row before treating the batch as drained
    pub max_empty_chunk_retries: u32,
    /// Claim lease, renewed with every progress write
    pub claim_lease_ms: u64,
    /// Budget for retrying "database is locked"
    pub max_lock_wait_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            chunk_size: MAX_PAGE_SIZE,
            record_delay_ms: 3_000,
            pause_poll_ms: 2_000,
            empty_chunk_retry_ms: 5_000,
            max_empty_chunk_retries: 12,
            claim_lease_ms: 300_000,
            max_lock_wait_ms: 5_000,
        }
    }
}

/// Daemon polling behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    pub poll_interval_ms: u64,
    /// Sleep after a failed poll
    pub error_backoff_ms: u64,
    /// Only drive this batch when set
    pub assigned_batch: Option<String>,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10_000,
            error_backoff_ms: 30_000,
            assigned_batch: None,
        }
    }
}

/// WebDriver endpoint and browser capabilities
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebDriverSettings {
    pub endpoint: String,
    pub headless: bool,
    pub window_width: u32,
    pub window_height: u32,
    pub user_agent: Option<String>,
    /// Per-request HTTP timeout towards the driver
    pub request_timeout_ms: u64,
    /// Poll interval while waiting for an element to become visible
    pub element_poll_ms: u64,
}

impl Default for WebDriverSettings {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9515".to_string(),
            headless: true,
            window_width: 1920,
            window_height: 1080,
            user_agent: Some(
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
                    .to_string(),
            ),
            request_timeout_ms: 60_000,
            element_poll_ms: 100,
        }
    }
}

impl VerifierConfig {
    /// Path of the config file inside `root`
    pub fn file_path(root: &Path) -> PathBuf {
        root.join(CONFIG_FILE)
    }

    /// Load `<root>/iccid-verifier.toml`, apply environment overrides and validate
    pub fn load(root: &Path) -> Result<Self> {
        let path = Self::file_path(root);
        let mut config: VerifierConfig = load_toml_or_default(&path)?;
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        info!(path = %path.display(), "Verifier configuration loaded");
        Ok(config)
    }

    /// Apply overrides from `lookup` (normally the process environment)
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(url) = non_empty(WEBDRIVER_URL_ENV) {
            info!("WebDriver endpoint from {}: {}", WEBDRIVER_URL_ENV, url);
            self.webdriver.endpoint = url;
        }
        if let Some(url) = non_empty(PORTAL_URL_ENV) {
            info!("Portal URL from {}: {}", PORTAL_URL_ENV, url);
            self.portal.url = url;
        }
        if let Some(batch) = non_empty(ASSIGNED_BATCH_ENV) {
            info!("Assigned batch from {}: {}", ASSIGNED_BATCH_ENV, batch);
            self.supervisor.assigned_batch = Some(batch.trim().to_string());
        }
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.engine.chunk_size == 0 || self.engine.chunk_size > MAX_PAGE_SIZE {
            return Err(Error::Config(format!(
                "engine.chunk_size must be between 1 and {}, got {}",
                MAX_PAGE_SIZE, self.engine.chunk_size
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(Error::Config(
                "retry.initial_backoff_ms must not exceed retry.max_backoff_ms".into(),
            ));
        }
        if self.portal.poll_rounds == 0 {
            return Err(Error::Config("portal.poll_rounds must be at least 1".into()));
        }
        if self.engine.claim_lease_ms == 0 {
            return Err(Error::Config("engine.claim_lease_ms must be positive".into()));
        }
        if self.portal.url.trim().is_empty() || self.webdriver.endpoint.trim().is_empty() {
            return Err(Error::Config(
                "portal.url and webdriver.endpoint must be set".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_match_portal_behaviour() {
        let config = VerifierConfig::default();
        assert_eq!(config.portal.page_load_timeout_ms, 15_000);
        assert_eq!(config.portal.poll_rounds, 10);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.initial_backoff_ms, 4_000);
        assert_eq!(config.retry.max_backoff_ms, 10_000);
        assert_eq!(config.engine.chunk_size, 1000);
        assert_eq!(config.engine.record_delay_ms, 3_000);
        assert_eq!(config.supervisor.poll_interval_ms, 10_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config: VerifierConfig =
            load_toml_or_default(&VerifierConfig::file_path(dir.path())).unwrap();
        assert_eq!(config.portal.url, PortalSettings::default().url);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            VerifierConfig::file_path(dir.path()),
            "[engine]\nrecord_delay_ms = 250\n\n[supervisor]\nassigned_batch = \"LOTE_9\"\n",
        )
        .unwrap();

        let config: VerifierConfig =
            load_toml_or_default(&VerifierConfig::file_path(dir.path())).unwrap();
        assert_eq!(config.engine.record_delay_ms, 250);
        assert_eq!(config.engine.pause_poll_ms, 2_000);
        assert_eq!(config.supervisor.assigned_batch.as_deref(), Some("LOTE_9"));
    }

    #[test]
    fn test_overrides_replace_file_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            (WEBDRIVER_URL_ENV, "http://grid:4444"),
            (ASSIGNED_BATCH_ENV, " LOTE_3 "),
            (PORTAL_URL_ENV, "   "),
        ]);
        let mut config = VerifierConfig::default();
        config.apply_overrides(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(config.webdriver.endpoint, "http://grid:4444");
        assert_eq!(config.supervisor.assigned_batch.as_deref(), Some("LOTE_3"));
        // Blank values are ignored
        assert_eq!(config.portal.url, PortalSettings::default().url);
    }

    #[test]
    fn test_validate_rejects_oversized_chunks() {
        let mut config = VerifierConfig::default();
        config.engine.chunk_size = MAX_PAGE_SIZE + 1;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.engine.chunk_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut config = VerifierConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }
}
