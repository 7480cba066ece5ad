//! Process and run identity types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Process ID wrapper with display formatting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(pub u32);

impl ProcessId {
    /// PID of the current process.
    pub fn current() -> Self {
        ProcessId(std::process::id())
    }

    /// Parse the PID file format: plain decimal text, surrounding whitespace tolerated.
    pub fn parse(s: &str) -> Option<Self> {
        let pid = s.trim().parse::<u32>().ok()?;
        if pid == 0 {
            return None;
        }
        Some(ProcessId(pid))
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ProcessId {
    fn from(pid: u32) -> Self {
        ProcessId(pid)
    }
}

/// Identifier for one guardian run (one start..stop of an enforcement loop).
///
/// Format: `dg-YYYYMMDD-HHMMSS-XXXXXXXX`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    /// Generate a new run ID.
    pub fn new() -> Self {
        let now = chrono::Utc::now();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        RunId(format!(
            "dg-{}-{}-{}",
            now.format("%Y%m%d"),
            now.format("%H%M%S"),
            &suffix[..8]
        ))
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_id_parse() {
        assert_eq!(ProcessId::parse("1234"), Some(ProcessId(1234)));
        assert_eq!(ProcessId::parse(" 99\n"), Some(ProcessId(99)));
        assert_eq!(ProcessId::parse("0"), None);
        assert_eq!(ProcessId::parse("-5"), None);
        assert_eq!(ProcessId::parse("12 34"), None);
        assert_eq!(ProcessId::parse(""), None);
    }

    #[test]
    fn test_run_id_format() {
        let id = RunId::new();
        assert!(id.0.starts_with("dg-"));
        assert_eq!(id.0.len(), "dg-20260101-000000-".len() + 8);
        assert_ne!(RunId::new(), RunId::new());
    }
}
