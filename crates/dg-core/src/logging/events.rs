//! Structured event vocabulary.
//!
//! Every event carries a stable name (used as the tracing target), a
//! [`Stage`], and the correlation IDs of its [`LogContext`].

use serde::{Deserialize, Serialize};

/// Log levels for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<tracing::Level> for Level {
    fn from(level: tracing::Level) -> Self {
        match level {
            tracing::Level::TRACE => Level::Trace,
            tracing::Level::DEBUG => Level::Debug,
            tracing::Level::INFO => Level::Info,
            tracing::Level::WARN => Level::Warn,
            tracing::Level::ERROR => Level::Error,
        }
    }
}

/// Phases of guardian work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Startup and configuration.
    Init,
    /// Waiting between ticks, change notifications.
    Watch,
    /// Reading stores and classifying drift.
    Detect,
    /// Writing corrections, backup sweeps, protection.
    Correct,
    /// Standalone process lifecycle.
    Supervise,
    /// License checks.
    License,
    /// Config/PID/log file channel.
    Channel,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Init => "init",
            Stage::Watch => "watch",
            Stage::Detect => "detect",
            Stage::Correct => "correct",
            Stage::Supervise => "supervise",
            Stage::License => "license",
            Stage::Channel => "channel",
        };
        write!(f, "{}", s)
    }
}

/// Standard event names used in logging.
pub mod event_names {
    // Guardian lifecycle
    pub const GUARDIAN_STARTED: &str = "guardian.started";
    pub const GUARDIAN_STOPPED: &str = "guardian.stopped";
    pub const GUARDIAN_RUN_RESET: &str = "guardian.run_reset";
    pub const GUARDIAN_UNENFORCED_FIELDS: &str = "guardian.unenforced_fields";

    // Watch
    pub const WATCH_TICK: &str = "watch.tick";
    pub const WATCH_WAKE: &str = "watch.wake";
    pub const WATCH_POLL_ONLY: &str = "watch.poll_only";

    // Detect
    pub const DETECT_DRIFT: &str = "detect.drift";
    pub const DETECT_IN_FLIGHT: &str = "detect.in_flight";
    pub const DETECT_READ_FAILED: &str = "detect.read_failed";
    pub const DETECT_SKIPPED: &str = "detect.skipped";

    // Correct
    pub const CORRECT_APPLIED: &str = "correct.applied";
    pub const CORRECT_DEFERRED: &str = "correct.deferred";
    pub const CORRECT_FAILED: &str = "correct.failed";
    pub const CORRECT_BACKUP_REMOVED: &str = "correct.backup_removed";
    pub const CORRECT_PROTECTION: &str = "correct.protection";

    // Supervise
    pub const SUPERVISE_SPAWNED: &str = "supervise.spawned";
    pub const SUPERVISE_STALE_PID: &str = "supervise.stale_pid";
    pub const SUPERVISE_RETIRED: &str = "supervise.retired";
    pub const SUPERVISE_STOP_SIGNALED: &str = "supervise.stop_signaled";
    pub const SUPERVISE_STOP_TIMEOUT: &str = "supervise.stop_timeout";
    pub const SUPERVISE_REAPED: &str = "supervise.reaped";

    // License
    pub const LICENSE_INVALID: &str = "license.invalid";

    // Channel
    pub const CHANNEL_CONFIG_WRITTEN: &str = "channel.config_written";
    pub const CHANNEL_CONFIG_RELOADED: &str = "channel.config_reloaded";
    pub const CHANNEL_CONFIG_REJECTED: &str = "channel.config_rejected";
    pub const CHANNEL_CLEANUP: &str = "channel.cleanup";

    // Errors
    pub const INTERNAL_ERROR: &str = "internal_error";
}

/// Correlation IDs attached to every event of one guardian run.
#[derive(Debug, Clone)]
pub struct LogContext {
    /// Unique ID for this run.
    pub run_id: String,
    /// Host identifier.
    pub host_id: String,
    /// `in-process` or `standalone` once known.
    pub mode: Option<String>,
}

impl LogContext {
    pub fn new(run_id: impl Into<String>, host_id: impl Into<String>) -> Self {
        LogContext {
            run_id: run_id.into(),
            host_id: host_id.into(),
            mode: None,
        }
    }

    pub fn with_mode(mut self, mode: impl ToString) -> Self {
        self.mode = Some(mode.to_string());
        self
    }

    /// Context for a fresh run on this host.
    pub fn for_new_run() -> Self {
        LogContext::new(super::generate_run_id(), super::get_host_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_serialization() {
        assert_eq!(serde_json::to_string(&Stage::Detect).unwrap(), "\"detect\"");
        assert_eq!(Stage::Supervise.to_string(), "supervise");
    }

    #[test]
    fn test_log_context_with_mode() {
        let ctx = LogContext::new("dg-1", "host-abc").with_mode("standalone");
        assert_eq!(ctx.run_id, "dg-1");
        assert_eq!(ctx.mode.as_deref(), Some("standalone"));
    }

    #[test]
    fn test_event_names_are_stage_prefixed() {
        assert!(event_names::DETECT_DRIFT.starts_with("detect."));
        assert!(event_names::CORRECT_DEFERRED.starts_with("correct."));
        assert!(event_names::SUPERVISE_STALE_PID.starts_with("supervise."));
    }
}
