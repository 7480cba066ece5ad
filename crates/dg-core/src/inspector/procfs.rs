//! `/proc`-based inspector (Linux).

use std::path::PathBuf;

use super::{ProcessInfo, ProcessInspector};
use dg_common::ProcessId;

#[derive(Debug, Clone)]
pub struct ProcfsInspector {
    root: PathBuf,
}

impl ProcfsInspector {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Read from an alternate procfs mount (fixtures in tests).
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        ProcfsInspector { root: root.into() }
    }

    fn state(&self, pid: ProcessId) -> Option<char> {
        let stat = std::fs::read_to_string(self.root.join(pid.to_string()).join("stat")).ok()?;
        parse_state(&stat)
    }
}

impl Default for ProcfsInspector {
    fn default() -> Self {
        Self::new()
    }
}

/// State character from `/proc/<pid>/stat` (`pid (comm) S ...`).
pub fn parse_state(stat: &str) -> Option<char> {
    let comm_end = stat.rfind(')')?;
    stat.get(comm_end + 2..)?.chars().next()
}

/// NUL-separated argv from `/proc/<pid>/cmdline`.
pub fn parse_cmdline(raw: &[u8]) -> Vec<String> {
    raw.split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect()
}

impl ProcessInspector for ProcfsInspector {
    fn inspect(&self, pid: ProcessId) -> Option<ProcessInfo> {
        let state = self.state(pid)?;
        let cmdline = std::fs::read(self.root.join(pid.to_string()).join("cmdline")).unwrap_or_default();
        Some(ProcessInfo {
            pid,
            command_line: parse_cmdline(&cmdline),
            is_alive: !matches!(state, 'Z' | 'X' | 'x'),
        })
    }
}
