//! Process inspection and signalling.
//!
//! The supervisor never trusts a PID on its own: a PID file may outlive its
//! process and the PID may since have been reused. A PID only counts as a
//! live guardian when the process exists and its command line carries the
//! [`GuardianSignature`].

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;
#[cfg(target_os = "linux")]
pub mod procfs;
#[cfg(all(unix, not(target_os = "linux")))]
pub mod ps;

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dg_common::ProcessId;
use serde::Serialize;

/// Subcommand a standalone guardian is launched with.
pub const WORKER_SUBCOMMAND: &str = "worker";

/// A process as seen by an inspector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    pub pid: ProcessId,
    pub command_line: Vec<String>,
    /// `false` for zombies and processes that are exiting.
    pub is_alive: bool,
}

/// Looks up processes by PID.
pub trait ProcessInspector: Send + Sync {
    /// `None` when no such process exists.
    fn inspect(&self, pid: ProcessId) -> Option<ProcessInfo>;

    fn is_alive(&self, pid: ProcessId) -> bool {
        self.inspect(pid).map(|p| p.is_alive).unwrap_or(false)
    }
}

/// What a standalone guardian's command line looks like:
/// `<exe> worker --config <config path>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardianSignature {
    pub exe_name: String,
    pub config_path: PathBuf,
}

impl GuardianSignature {
    pub fn new(exe_name: impl Into<String>, config_path: impl Into<PathBuf>) -> Self {
        GuardianSignature {
            exe_name: exe_name.into(),
            config_path: config_path.into(),
        }
    }

    /// Signature of a worker launched from `exe`.
    pub fn for_exe(exe: &Path, config_path: impl Into<PathBuf>) -> Self {
        let exe_name = exe
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| exe.to_string_lossy().into_owned());
        Self::new(exe_name, config_path)
    }

    /// Arguments that make a command line match this signature.
    pub fn worker_args(&self) -> Vec<OsString> {
        vec![
            OsString::from(WORKER_SUBCOMMAND),
            OsString::from("--config"),
            self.config_path.clone().into_os_string(),
        ]
    }

    pub fn matches(&self, process: &ProcessInfo) -> bool {
        let Some(argv0) = process.command_line.first() else {
            return false;
        };
        let exe_matches = Path::new(argv0)
            .file_name()
            .map(|n| n.to_string_lossy() == self.exe_name.as_str())
            .unwrap_or(false);
        if !exe_matches {
            return false;
        }
        let args = &process.command_line[1..];
        let has_worker = args.iter().any(|a| a == WORKER_SUBCOMMAND);
        let config = self.config_path.to_string_lossy();
        let config_inline = format!("--config={}", config);
        let has_config = args.iter().any(|a| *a == config || *a == config_inline);
        has_worker && has_config
    }
}

/// Whether `pid` is a live process matching `signature`.
pub fn is_live_guardian(
    inspector: &dyn ProcessInspector,
    pid: ProcessId,
    signature: &GuardianSignature,
) -> bool {
    inspector
        .inspect(pid)
        .map(|p| p.is_alive && signature.matches(&p))
        .unwrap_or(false)
}

/// Inspector for the current platform.
pub fn system_inspector() -> Arc<dyn ProcessInspector> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(procfs::ProcfsInspector::new())
    }
    #[cfg(all(unix, not(target_os = "linux")))]
    {
        Arc::new(ps::PsInspector)
    }
    #[cfg(not(unix))]
    {
        Arc::new(UnsupportedInspector)
    }
}

/// Reports every PID as absent.
#[cfg(not(unix))]
#[derive(Debug, Default)]
pub struct UnsupportedInspector;

#[cfg(not(unix))]
impl ProcessInspector for UnsupportedInspector {
    fn inspect(&self, _pid: ProcessId) -> Option<ProcessInfo> {
        None
    }
}

/// Result of a signal delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalResult {
    Delivered,
    /// The process no longer exists.
    NoSuchProcess,
    PermissionDenied,
}

/// Send SIGTERM to `pid`.
#[cfg(unix)]
pub fn terminate(pid: ProcessId) -> std::io::Result<SignalResult> {
    send_signal(pid, libc::SIGTERM)
}

#[cfg(not(unix))]
pub fn terminate(_pid: ProcessId) -> std::io::Result<SignalResult> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "signals are not supported on this platform",
    ))
}

#[cfg(unix)]
fn send_signal(pid: ProcessId, signal: i32) -> std::io::Result<SignalResult> {
    let Ok(raw) = i32::try_from(pid.0) else {
        return Ok(SignalResult::NoSuchProcess);
    };
    // SAFETY: kill(2) has no memory-safety preconditions; raw is a positive PID.
    let result = unsafe { libc::kill(raw, signal) };
    if result == 0 {
        return Ok(SignalResult::Delivered);
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ESRCH) => Ok(SignalResult::NoSuchProcess),
        Some(libc::EPERM) => Ok(SignalResult::PermissionDenied),
        _ => Err(err),
    }
}

/// Whether any process with `pid` exists (zombies included).
#[cfg(unix)]
pub fn process_exists(pid: ProcessId) -> bool {
    // Signal 0 checks existence without delivering; EPERM means it exists.
    !matches!(send_signal(pid, 0), Ok(SignalResult::NoSuchProcess) | Err(_))
}

#[cfg(not(unix))]
pub fn process_exists(_pid: ProcessId) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(cmd: &[&str]) -> ProcessInfo {
        ProcessInfo {
            pid: ProcessId(42),
            command_line: cmd.iter().map(|s| s.to_string()).collect(),
            is_alive: true,
        }
    }

    #[test]
    fn test_signature_matches_worker_command_line() {
        let sig = GuardianSignature::new("devguard", "/tmp/devguard/guardian-config.json");
        assert!(sig.matches(&info(&[
            "/usr/local/bin/devguard",
            "worker",
            "--config",
            "/tmp/devguard/guardian-config.json",
        ])));
        assert!(sig.matches(&info(&[
            "devguard",
            "-q",
            "worker",
            "--config=/tmp/devguard/guardian-config.json",
        ])));
    }

    #[test]
    fn test_signature_rejects_reused_pid() {
        let sig = GuardianSignature::new("devguard", "/tmp/devguard/guardian-config.json");
        assert!(!sig.matches(&info(&["/bin/sleep", "100"])));
        assert!(!sig.matches(&info(&["devguard", "status"])));
        assert!(!sig.matches(&info(&[
            "devguard",
            "worker",
            "--config",
            "/other/guardian-config.json",
        ])));
        assert!(!sig.matches(&info(&[])));
    }

    #[test]
    fn test_worker_args_round_trip() {
        let sig = GuardianSignature::for_exe(Path::new("/opt/bin/devguard"), "/c/cfg.json");
        assert_eq!(sig.exe_name, "devguard");
        let mut cmd = vec!["/opt/bin/devguard".to_string()];
        cmd.extend(sig.worker_args().iter().map(|a| a.to_string_lossy().into_owned()));
        assert!(sig.matches(&info(&cmd.iter().map(String::as_str).collect::<Vec<_>>())));
    }

    #[cfg(unix)]
    #[test]
    fn test_process_exists_self_and_missing() {
        assert!(process_exists(ProcessId::current()));
        // PIDs above the kernel maximum never exist.
        assert!(!process_exists(ProcessId(i32::MAX as u32)));
    }
}
