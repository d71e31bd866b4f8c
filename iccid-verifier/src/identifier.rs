//! ICCID normalization
//!
//! The portal accepts the last 13 digits of an ICCID, without the issuer
//! prefix or the trailing `F` filler some exports carry.

/// Issuer prefix stripped from full-length identifiers
pub const ISSUER_PREFIX: &str = "895214";

/// Length of the key the portal accepts
pub const KEY_LENGTH: usize = 13;

/// Turn a loosely formatted identifier into the portal key.
///
/// Keeps only digits and `F` (case-insensitive), drops the issuer prefix when
/// the remainder is longer than a key, drops trailing `F`s and keeps the
/// final 13 characters. Never fails; malformed input yields a shorter key.
/// Idempotent on every input.
pub fn normalize(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| c.to_ascii_uppercase())
        .filter(|c| c.is_ascii_digit() || *c == 'F')
        .collect();

    // Only a value longer than a key can still carry the prefix
    let unprefixed = if cleaned.len() > KEY_LENGTH {
        cleaned.strip_prefix(ISSUER_PREFIX).unwrap_or(&cleaned)
    } else {
        &cleaned
    };

    let trimmed = unprefixed.trim_end_matches('F');
    let start = trimmed.len().saturating_sub(KEY_LENGTH);
    trimmed[start..].to_string()
}
