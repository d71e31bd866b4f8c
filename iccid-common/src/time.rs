//! Timestamp utilities
//!
//! Timestamps are stored as RFC 3339 text with millisecond precision and a
//! `Z` suffix so they sort lexically. Claim leases are stored as epoch
//! milliseconds.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::{Error, Result};

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Convert milliseconds to duration
pub fn millis_to_duration(millis: u64) -> std::time::Duration {
    std::time::Duration::from_millis(millis)
}

/// Format a timestamp for storage
pub fn to_db_text(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored timestamp
pub fn from_db_text(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("Failed to parse timestamp '{}': {}", text, e)))
}

/// Epoch milliseconds of `ts`
pub fn epoch_ms(ts: &DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}
