//! Lock-contention retry for store writes
//!
//! The HTTP service and the daemon share one SQLite file, so a write can
//! briefly hit "database is locked".

use iccid_common::{Error, Result};
use std::time::{Duration, Instant};

/// First backoff step
const INITIAL_BACKOFF_MS: u64 = 10;
/// Backoff ceiling
const MAX_BACKOFF_MS: u64 = 1000;

/// Run `operation` again while SQLite reports lock contention.
///
/// Waits 10ms after the first lock error and doubles the wait each time, up
/// to 1s between attempts. Gives up once `max_wait_ms` has passed since the
/// first attempt. Any error other than lock contention is returned as is.
pub async fn retry_on_lock<F, Fut, T>(
    operation_name: &str,
    max_wait_ms: u64,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let started = Instant::now();
    let budget = Duration::from_millis(max_wait_ms);
    let mut attempts = 0u32;
    let mut wait_ms = INITIAL_BACKOFF_MS;

    loop {
        attempts += 1;

        let err = match operation().await {
            Ok(value) => {
                if attempts > 1 {
                    tracing::debug!(
                        operation = operation_name,
                        attempts,
                        waited_ms = started.elapsed().as_millis(),
                        "Store write went through after lock contention"
                    );
                }
                return Ok(value);
            }
            Err(err) if err.is_lock_contention() => err,
            Err(err) => return Err(err),
        };

        let waited = started.elapsed();
        if waited >= budget {
            tracing::error!(
                operation = operation_name,
                attempts,
                waited_ms = waited.as_millis(),
                max_wait_ms,
                error = %err,
                "Giving up on locked database"
            );
            return Err(Error::Internal(format!(
                "Database locked after {} attempts ({} ms elapsed, max {} ms)",
                attempts,
                waited.as_millis(),
                max_wait_ms
            )));
        }

        tracing::warn!(
            operation = operation_name,
            attempts,
            wait_ms,
            "Database locked; backing off"
        );
        tokio::time::sleep(Duration::from_millis(wait_ms)).await;
        wait_ms = (wait_ms * 2).min(MAX_BACKOFF_MS);
    }
}
