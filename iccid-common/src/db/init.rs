//! Database initialization
//!
//! Creates the SQLite file on first run and applies the schema idempotently.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

/// Default SQLite busy timeout before a lock error surfaces to retry logic
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 250;

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .min_connections(1)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    // WAL lets the daemon and the service read while one of them writes
    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;

    // Short busy wait; longer contention is handled by retry_on_lock
    let pragma_sql = format!("PRAGMA busy_timeout = {}", DEFAULT_BUSY_TIMEOUT_MS);
    sqlx::query(&pragma_sql).execute(&pool).await?;

    create_schema(&pool).await?;

    Ok(pool)
}

/// Apply all tables and indexes (idempotent)
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_verification_records_table(pool).await?;
    create_batch_processes_table(pool).await?;
    Ok(())
}

pub async fn create_verification_records_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS verification_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            identifier_full TEXT NOT NULL UNIQUE,
            identifier_key TEXT NOT NULL,
            batch TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'PENDING'
                CHECK (status IN ('PENDING', 'ACTIVE', 'INACTIVE', 'ERROR')),
            assigned_number TEXT,
            verified_at TEXT,
            notes TEXT,
            created_at TEXT NOT NULL,
            CHECK ((status = 'ACTIVE') = (assigned_number IS NOT NULL))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_verification_records_batch_status \
         ON verification_records (batch, status)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn create_batch_processes_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS batch_processes (
            batch TEXT PRIMARY KEY,
            state TEXT NOT NULL
                CHECK (state IN ('RUNNING', 'PAUSED', 'STOPPED', 'COMPLETED', 'INCOMPLETE', 'ERROR')),
            progress_current INTEGER NOT NULL DEFAULT 0,
            progress_total INTEGER NOT NULL DEFAULT 0,
            active_count INTEGER NOT NULL DEFAULT 0,
            inactive_count INTEGER NOT NULL DEFAULT 0,
            error_count INTEGER NOT NULL DEFAULT 0,
            owner TEXT,
            claim_expires_at_ms INTEGER,
            started_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            CHECK (progress_current <= progress_total),
            CHECK (active_count + inactive_count + error_count <= progress_current)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_batch_processes_state ON batch_processes (state)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
