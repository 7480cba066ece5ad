//! `ps`-based inspector for Unix systems without procfs.
//!
//! `ps -o args=` loses argument boundaries, so arguments are split on
//! whitespace. Paths containing spaces will not match a signature.

use std::process::Command;

use super::{ProcessInfo, ProcessInspector};
use dg_common::ProcessId;

#[derive(Debug, Default, Clone, Copy)]
pub struct PsInspector;

/// Parse one `ps -o stat= -o args=` line.
fn parse_line(pid: ProcessId, line: &str) -> Option<ProcessInfo> {
    let line = line.trim();
    let (stat, args) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let state = stat.chars().next()?;
    Some(ProcessInfo {
        pid,
        command_line: args.split_whitespace().map(str::to_string).collect(),
        is_alive: state != 'Z',
    })
}

impl ProcessInspector for PsInspector {
    fn inspect(&self, pid: ProcessId) -> Option<ProcessInfo> {
        let output = Command::new("ps")
            .args(["-p", &pid.to_string(), "-o", "stat=", "-o", "args="])
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout.lines().find(|l| !l.trim().is_empty()).and_then(|l| parse_line(pid, l))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line() {
        let info = parse_line(ProcessId(9), "Ss   /usr/local/bin/devguard worker --config /tmp/c.json").unwrap();
        assert!(info.is_alive);
        assert_eq!(info.command_line[1], "worker");
        let zombie = parse_line(ProcessId(9), "Z+ ").unwrap();
        assert!(!zombie.is_alive);
        assert!(zombie.command_line.is_empty());
    }
}
