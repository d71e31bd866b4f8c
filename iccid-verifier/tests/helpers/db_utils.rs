//! Store and config fixtures

use iccid_common::db::init_database;
use iccid_verifier::config::VerifierConfig;
use iccid_verifier::store::{InsertOutcome, NewRecord, RecordStore, SqliteStore};
use std::sync::Arc;
use tempfile::TempDir;

/// Fresh database in a temp dir
///
/// Returns (TempDir, store) - TempDir must be kept alive for duration of test
pub async fn create_test_store() -> (TempDir, Arc<SqliteStore>) {
    let temp_dir = TempDir::new().unwrap();
    let pool = init_database(&temp_dir.path().join("test_iccid.db"))
        .await
        .unwrap();
    (temp_dir, Arc::new(SqliteStore::new(pool, 2_000)))
}

/// Defaults with every wait shrunk to a few milliseconds
pub fn fast_config() -> VerifierConfig {
    let mut config = VerifierConfig::default();
    config.retry.initial_backoff_ms = 1;
    config.retry.max_backoff_ms = 2;
    config.engine.record_delay_ms = 0;
    config.engine.pause_poll_ms = 10;
    config.engine.empty_chunk_retry_ms = 5;
    config.engine.max_empty_chunk_retries = 3;
    config.supervisor.poll_interval_ms = 10;
    config.supervisor.error_backoff_ms = 10;
    config
}

/// Full identifier number `n` as a carrier would print it
pub fn sample_iccid(n: u64) -> String {
    format!("895214{:013}F", n)
}

/// Normalized key of `sample_iccid(n)`
pub fn key(n: u64) -> String {
    format!("{:013}", n)
}

/// Insert `sample_iccid(n)` for each `n` as pending records of `batch`
pub async fn load_records(store: &dyn RecordStore, batch: &str, numbers: &[u64]) {
    for &n in numbers {
        let outcome = store
            .insert_record(&NewRecord {
                identifier_full: sample_iccid(n),
                identifier_key: key(n),
                batch: batch.to_string(),
            })
            .await
            .unwrap();
        assert_eq!(outcome, InsertOutcome::Inserted);
    }
}
