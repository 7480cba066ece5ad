//! Structured logging for devguard.
//!
//! Two output modes:
//! - Human-readable console output for interactive use
//! - Machine-parseable JSONL for hosts that scrape the guardian's stderr
//!
//! # Usage
//!
//! ```ignore
//! use dg_core::logging::{init_logging, LogConfig, LogContext, Stage, event_names};
//!
//! init_logging(&LogConfig::from_env(None, None));
//! let ctx = LogContext::for_new_run().with_mode("in-process");
//! dg_core::log_event!(ctx, INFO, event_names::GUARDIAN_STARTED, Stage::Init, "guardian started");
//! ```
//!
//! stdout is reserved for command payloads; all log output goes to stderr.
//! Enforcement records additionally go to the channel log (see
//! [`crate::channel`]), which is the only log a standalone guardian has.

pub mod config;
pub mod events;
pub mod layer;

pub use config::{LogConfig, LogFormat, LogLevel};
pub use events::{event_names, Level, LogContext, Stage};
pub use layer::JsonlLayer;

use sha2::{Digest, Sha256};
use std::io::IsTerminal;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the logging subsystem.
///
/// Call once at startup. A second call is a no-op.
pub fn init_logging(config: &LogConfig) {
    // RUST_LOG directives apply only when DG_LOG is unset.
    let level_filter = || EnvFilter::default().add_directive(LevelFilter::from(config.level).into());
    let filter = if std::env::var_os("DG_LOG").is_none() {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| level_filter())
    } else {
        level_filter()
    };

    match config.format {
        LogFormat::Human => {
            let use_ansi = std::io::stderr().is_terminal();
            let fmt_layer = fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_ansi(use_ansi);

            if config.timestamps {
                let _ = tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt_layer)
                    .try_init();
            } else {
                let _ = tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt_layer.without_time())
                    .try_init();
            }
        }
        LogFormat::Jsonl => {
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(JsonlLayer::stderr())
                .try_init();
        }
    }
}

/// Generate a unique run ID.
pub fn generate_run_id() -> String {
    dg_common::RunId::new().to_string()
}

/// Host ID for log correlation.
///
/// Derived from the machine-id on Linux, otherwise from the hostname.
/// Never the raw value.
pub fn get_host_id() -> String {
    if let Ok(id) = std::fs::read_to_string("/etc/machine-id") {
        let id = id.trim();
        if id.len() >= 8 {
            return format!("host-{}", &hash_string(id)[..8]);
        }
    }

    for var in ["HOSTNAME", "COMPUTERNAME"] {
        if let Ok(hostname) = std::env::var(var) {
            return format!("host-{}", &hash_string(&hostname)[..8]);
        }
    }

    format!("host-{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
}

fn hash_string(s: &str) -> String {
    hex::encode(Sha256::digest(s.as_bytes()))
}

/// Truncate a potentially sensitive string for logging.
pub fn redact_for_log(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    let head: String = s.chars().take(max_len).collect();
    format!("{}...(truncated)", head)
}

/// Structured event logging with context.
///
/// ```ignore
/// log_event!(ctx, INFO, event_names::CORRECT_APPLIED, Stage::Correct, "corrected",
///     path = path_str.as_str(), fields = 2);
/// ```
#[macro_export]
macro_rules! log_event {
    (@emit $level:ident, $ctx:expr, $event:expr, $stage:expr, $msg:expr $(, $key:ident = $val:expr)*) => {
        tracing::$level!(
            target: $event,
            run_id = %$ctx.run_id,
            host_id = %$ctx.host_id,
            mode = $ctx.mode.as_deref().unwrap_or(""),
            stage = %$stage,
            $($key = $val,)*
            "{}", $msg
        )
    };
    ($ctx:expr, INFO, $event:expr, $stage:expr, $msg:expr $(, $key:ident = $val:expr)*) => {
        $crate::log_event!(@emit info, $ctx, $event, $stage, $msg $(, $key = $val)*)
    };
    ($ctx:expr, DEBUG, $event:expr, $stage:expr, $msg:expr $(, $key:ident = $val:expr)*) => {
        $crate::log_event!(@emit debug, $ctx, $event, $stage, $msg $(, $key = $val)*)
    };
    ($ctx:expr, WARN, $event:expr, $stage:expr, $msg:expr $(, $key:ident = $val:expr)*) => {
        $crate::log_event!(@emit warn, $ctx, $event, $stage, $msg $(, $key = $val)*)
    };
    ($ctx:expr, ERROR, $event:expr, $stage:expr, $msg:expr $(, $key:ident = $val:expr)*) => {
        $crate::log_event!(@emit error, $ctx, $event, $stage, $msg $(, $key = $val)*)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_run_id() {
        let id1 = generate_run_id();
        let id2 = generate_run_id();
        assert!(id1.starts_with("dg-"));
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_get_host_id() {
        let host_id = get_host_id();
        assert!(host_id.starts_with("host-"));
        assert_eq!(host_id.len(), 13);
    }

    #[test]
    fn test_redact_for_log() {
        assert_eq!(redact_for_log("short", 10), "short");
        let redacted = redact_for_log("0123456789abcdef", 4);
        assert_eq!(redacted, "0123...(truncated)");
        // Multi-byte input never splits a character.
        assert_eq!(redact_for_log("ééééé", 2), "éé...(truncated)");
    }

    #[test]
    fn test_log_config_defaults() {
        let config = LogConfig::default();
        assert_eq!(config.format, LogFormat::Human);
        assert_eq!(config.level, LogLevel::Info);
    }
}
