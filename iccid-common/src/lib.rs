//! # ICCID Common Library
//!
//! Shared code for the verifier service and the supervisor daemon:
//! - Error type
//! - Root folder and config file resolution
//! - SQLite initialization, schema and row models
//! - Verification event types and the broadcast EventBus
//! - Timestamp helpers

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod time;

pub use error::{Error, Result};
