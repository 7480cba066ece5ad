//! Exit codes for the `devguard` CLI.
//!
//! Hosts branch on these instead of parsing output.
//!
//! Exit code ranges:
//! - 0-2: Operational outcomes
//! - 10-19: User/environment errors (recoverable by user action)
//! - 20-29: Internal errors

use dg_common::Error;

/// Exit codes for devguard operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    // ========================================================================
    // Operational Outcomes (0-2)
    // ========================================================================
    /// Command succeeded
    Clean = 0,

    /// `status`: a guardian is enforcing
    Guarding = 1,

    /// `status`: no guardian is enforcing
    NotGuarding = 2,

    // ========================================================================
    // User / Environment Errors (10-19)
    // ========================================================================
    /// Invalid arguments
    ArgsError = 10,

    /// Guardian config missing, malformed, or invalid
    ConfigError = 11,

    /// Another guardian holds enforcement
    LockError = 14,

    /// Target identity rejected
    IdentityError = 16,

    // ========================================================================
    // Internal Errors (20-29)
    // ========================================================================
    /// Internal error (bug - please report)
    InternalError = 20,

    /// I/O error
    IoError = 21,

    /// Guardian did not stop in time
    TimeoutError = 22,

    /// Standalone guardian could not be launched
    SpawnError = 23,
}

impl ExitCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Operational outcome rather than an error (codes 0-2).
    pub fn is_operational(self) -> bool {
        (self as i32) < 10
    }

    pub fn is_user_error(self) -> bool {
        (10..20).contains(&(self as i32))
    }

    pub fn is_error(self) -> bool {
        (self as i32) >= 10
    }

    /// Code name for JSON output.
    pub fn code_name(&self) -> &'static str {
        match self {
            ExitCode::Clean => "OK_CLEAN",
            ExitCode::Guarding => "OK_GUARDING",
            ExitCode::NotGuarding => "OK_NOT_GUARDING",
            ExitCode::ArgsError => "ERR_ARGS",
            ExitCode::ConfigError => "ERR_CONFIG",
            ExitCode::LockError => "ERR_LOCK",
            ExitCode::IdentityError => "ERR_IDENTITY",
            ExitCode::InternalError => "ERR_INTERNAL",
            ExitCode::IoError => "ERR_IO",
            ExitCode::TimeoutError => "ERR_TIMEOUT",
            ExitCode::SpawnError => "ERR_SPAWN",
        }
    }
}

impl From<&Error> for ExitCode {
    fn from(err: &Error) -> Self {
        match err {
            Error::Config(_) | Error::ConfigMissing { .. } => ExitCode::ConfigError,
            Error::InvalidIdentity(_) => ExitCode::IdentityError,
            Error::AlreadyRunning { .. } => ExitCode::LockError,
            Error::StopTimeout { .. } => ExitCode::TimeoutError,
            Error::ProcessSpawn(_) => ExitCode::SpawnError,
            Error::Io(_) | Error::Json(_) | Error::Store { .. } | Error::PathLocked { .. } => {
                ExitCode::IoError
            }
            Error::UnsupportedPlatform(_) => ExitCode::ArgsError,
            Error::StaleProcess { .. } | Error::ProcessNotFound { .. } => ExitCode::InternalError,
        }
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.code_name(), self.as_i32())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ranges() {
        assert!(ExitCode::NotGuarding.is_operational());
        assert!(ExitCode::LockError.is_user_error());
        assert!(ExitCode::SpawnError.is_error());
        assert!(!ExitCode::SpawnError.is_user_error());
    }

    #[test]
    fn test_error_mapping() {
        assert_eq!(
            ExitCode::from(&Error::Config("bad".into())),
            ExitCode::ConfigError
        );
        assert_eq!(
            ExitCode::from(&Error::StopTimeout { pid: 1, seconds: 5 }),
            ExitCode::TimeoutError
        );
        assert_eq!(
            ExitCode::from(&Error::ProcessSpawn("x".into())).as_i32(),
            23
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(ExitCode::Guarding.to_string(), "OK_GUARDING (1)");
    }
}
