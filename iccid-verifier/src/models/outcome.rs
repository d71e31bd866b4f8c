//! Result of one portal verification

use iccid_common::db::RecordStatus;
use serde::Serialize;

/// Classified outcome of verifying one identifier.
///
/// Built only through the constructors, so the status is never `PENDING`
/// and a number is present exactly when the status is `ACTIVE`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationOutcome {
    status: RecordStatus,
    assigned_number: Option<String>,
    notes: String,
}

impl VerificationOutcome {
    pub fn active(number: impl Into<String>) -> Self {
        let number = number.into();
        Self {
            status: RecordStatus::Active,
            notes: format!("active with number {}", number),
            assigned_number: Some(number),
        }
    }

    pub fn inactive() -> Self {
        Self {
            status: RecordStatus::Inactive,
            assigned_number: None,
            notes: "requires activation".to_string(),
        }
    }

    pub fn error(notes: impl Into<String>) -> Self {
        Self {
            status: RecordStatus::Error,
            assigned_number: None,
            notes: notes.into(),
        }
    }

    pub fn status(&self) -> RecordStatus {
        self.status
    }

    pub fn assigned_number(&self) -> Option<&str> {
        self.assigned_number.as_deref()
    }

    pub fn notes(&self) -> &str {
        &self.notes
    }
}
