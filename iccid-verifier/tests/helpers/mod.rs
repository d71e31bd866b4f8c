//! Test Helper Utilities
//!
//! Shared fixtures for iccid-verifier integration tests

#![allow(dead_code)]

pub mod db_utils;
pub mod fakes;

pub use db_utils::{create_test_store, fast_config, key, load_records, sample_iccid};
pub use fakes::{
    FailingLauncher, FaultyStore, Hook, NullLauncher, NullSession, PageReadingClassifier,
    ScriptedClassifier,
};
