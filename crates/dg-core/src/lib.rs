//! devguard core library.
//!
//! This library provides the guardian that keeps an IDE's device-identity
//! fields pinned to a host-chosen target:
//! - Identity stores (flat JSON and embedded key/value) with merge writes
//! - Drift detection and the enforcement loop
//! - The file channel shared by a host and a standalone guardian
//! - Process supervision for in-process and standalone guardians
//! - License gating, backup sweeping, and store protection
//! - Structured logging and CLI exit codes
//!
//! The binary entry point is in `main.rs`.

pub mod backup;
pub mod channel;
pub mod drift;
pub mod enforce;
pub mod exit_codes;
pub mod inspector;
pub mod license;
pub mod logging;
pub mod protect;
pub mod service;
pub mod settings;
pub mod stable_id;
pub mod store;
pub mod supervisor;
pub mod variant;
pub mod worker;

// Re-export test utilities for integration tests
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use service::{GuardianService, GuardianStatus, StartReport, StopReport};
pub use settings::{GuardianSettings, SettingsOverrides};
