//! Error types for devguard.
//!
//! This module provides structured error handling with:
//! - Stable error codes for machine parsing
//! - Category classification for error grouping
//! - Recoverability hints for hosts
//! - Remediation suggestions for humans
//!
//! # Host-Facing Output
//!
//! Errors serialize to structured JSON through [`Error::to_json`]:
//! ```json
//! {
//!   "code": 10,
//!   "category": "config",
//!   "message": "configuration error: targetIdentity must not be empty",
//!   "recoverable": true,
//!   "remediation": "Rewrite the guardian config ..."
//! }
//! ```
//!
//! Failures local to one monitored path (`PathLocked`, `Store`) are absorbed
//! by the enforcement loop and only ever surface in records and logs.
//! Failures starting or configuring the guardian are returned to the host.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for devguard operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Guardian config file errors (missing, malformed, invalid values).
    Config,
    /// Identity store read/write errors.
    Store,
    /// Standalone process lifecycle errors.
    Process,
    /// File I/O and serialization errors.
    Io,
    /// Platform compatibility errors.
    Platform,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Config => write!(f, "config"),
            ErrorCategory::Store => write!(f, "store"),
            ErrorCategory::Process => write!(f, "process"),
            ErrorCategory::Io => write!(f, "io"),
            ErrorCategory::Platform => write!(f, "platform"),
        }
    }
}

/// Unified error type for devguard.
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors (10-19)
    #[error("configuration error: {0}")]
    Config(String),

    #[error("guardian config not found at {}", path.display())]
    ConfigMissing { path: PathBuf },

    #[error("invalid target identity: {0}")]
    InvalidIdentity(String),

    // Store errors (20-29)
    #[error("identity store {} is locked (gave up after {attempts} attempts)", path.display())]
    PathLocked { path: PathBuf, attempts: u32 },

    #[error("identity store {} failed: {reason}", path.display())]
    Store { path: PathBuf, reason: String },

    // Process errors (30-39)
    #[error("failed to spawn standalone guardian: {0}")]
    ProcessSpawn(String),

    #[error("stale guardian pid {pid}: {reason}")]
    StaleProcess { pid: u32, reason: String },

    #[error("process {pid} not found")]
    ProcessNotFound { pid: u32 },

    #[error("a guardian is already running (pid {pid})")]
    AlreadyRunning { pid: u32 },

    #[error("guardian pid {pid} did not stop within {seconds}s")]
    StopTimeout { pid: u32, seconds: u64 },

    // I/O errors (60-69)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Platform errors (70-79)
    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),
}

impl Error {
    /// Returns the error code for this error type.
    ///
    /// Error codes are stable and grouped by category:
    /// - 10-19: Configuration errors
    /// - 20-29: Store errors
    /// - 30-39: Process errors
    /// - 60-69: I/O errors
    /// - 70-79: Platform errors
    pub fn code(&self) -> u32 {
        match self {
            Error::Config(_) => 10,
            Error::ConfigMissing { .. } => 11,
            Error::InvalidIdentity(_) => 12,
            Error::PathLocked { .. } => 20,
            Error::Store { .. } => 21,
            Error::ProcessSpawn(_) => 30,
            Error::StaleProcess { .. } => 31,
            Error::ProcessNotFound { .. } => 32,
            Error::AlreadyRunning { .. } => 33,
            Error::StopTimeout { .. } => 34,
            Error::Io(_) => 60,
            Error::Json(_) => 61,
            Error::UnsupportedPlatform(_) => 70,
        }
    }

    /// Returns the error category for grouping and filtering.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Config(_) | Error::ConfigMissing { .. } | Error::InvalidIdentity(_) => {
                ErrorCategory::Config
            }

            Error::PathLocked { .. } | Error::Store { .. } => ErrorCategory::Store,

            Error::ProcessSpawn(_)
            | Error::StaleProcess { .. }
            | Error::ProcessNotFound { .. }
            | Error::AlreadyRunning { .. }
            | Error::StopTimeout { .. } => ErrorCategory::Process,

            Error::Io(_) | Error::Json(_) => ErrorCategory::Io,

            Error::UnsupportedPlatform(_) => ErrorCategory::Platform,
        }
    }

    /// Returns whether this error is potentially recoverable.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Config(_) => true,
            Error::ConfigMissing { .. } => true,
            Error::InvalidIdentity(_) => true,

            // Lock contention clears once the IDE releases the file.
            Error::PathLocked { .. } => true,
            Error::Store { .. } => true,

            Error::ProcessSpawn(_) => true,
            Error::StaleProcess { .. } => true,
            Error::ProcessNotFound { .. } => false,
            Error::AlreadyRunning { .. } => false,
            Error::StopTimeout { .. } => true,

            Error::Io(_) => true,
            Error::Json(_) => true,

            Error::UnsupportedPlatform(_) => false,
        }
    }

    /// Returns a human-readable remediation hint.
    pub fn remediation(&self) -> &'static str {
        match self {
            Error::Config(_) => {
                "Rewrite the guardian config with 'devguard start', or check it against 'devguard schema'."
            }
            Error::ConfigMissing { .. } => {
                "The standalone guardian was started without a config file. Start it through 'devguard start'."
            }
            Error::InvalidIdentity(_) => {
                "Every target identity field needs a non-empty value. Regenerate with 'devguard identity'."
            }
            Error::PathLocked { .. } => {
                "The IDE is holding the store open. The guardian retries on the next tick; close the IDE if it persists."
            }
            Error::Store { .. } => {
                "Check that the identity store is readable and well-formed. A corrupt store is never overwritten."
            }
            Error::ProcessSpawn(_) => {
                "The standalone guardian could not be launched. Retry, or start in-process with '--mode in-process'."
            }
            Error::StaleProcess { .. } => {
                "A leftover pid file was found. It is discarded automatically on the next start."
            }
            Error::ProcessNotFound { .. } => {
                "The guardian process already exited. Nothing to stop."
            }
            Error::AlreadyRunning { .. } => {
                "Stop the running guardian with 'devguard stop' before starting another one."
            }
            Error::StopTimeout { .. } => {
                "The guardian did not clean up in time. Its pid file is reconciled as stale on the next start."
            }
            Error::Io(_) => {
                "Check disk space and permissions on the channel directory and identity stores."
            }
            Error::Json(_) => {
                "Invalid JSON. Check syntax with 'jq .' or regenerate the file."
            }
            Error::UnsupportedPlatform(_) => {
                "This feature is not available on your platform. Use in-process mode instead."
            }
        }
    }

    /// Structured representation for JSON output.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "code": self.code(),
            "category": self.category(),
            "message": self.to_string(),
            "recoverable": self.is_recoverable(),
            "remediation": self.remediation(),
        })
    }
}
