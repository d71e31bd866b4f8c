//! Verifier data models

pub mod batch;
pub mod outcome;
pub mod run;

pub use batch::{BatchOverview, BatchStats, DeleteReport, LoadReport};
pub use outcome::VerificationOutcome;
pub use run::{RunExit, RunSummary, RunTallies};
