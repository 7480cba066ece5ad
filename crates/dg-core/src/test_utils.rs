//! Test utilities for dg-core.
//!
//! This module provides test infrastructure including:
//! - Common assertions
//! - IDE home fixtures with real identity stores
//! - Real child processes for supervision tests
//! - Tempdir management

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use rusqlite::{params, Connection};
use serde_json::{Map, Value};

use crate::variant::{strategy_for, IdeLayout};
use dg_common::IdeVariant;

pub use crate::inspector::mock::MockInspector;

// ============================================================================
// Macros
// ============================================================================

/// Assert that a Result is Ok and return the value.
#[macro_export]
macro_rules! assert_ok {
    ($expr:expr) => {
        match $expr {
            Ok(val) => val,
            Err(e) => panic!("Expected Ok, got Err: {:?}", e),
        }
    };
    ($expr:expr, $msg:expr) => {
        match $expr {
            Ok(val) => val,
            Err(e) => panic!("{}: {:?}", $msg, e),
        }
    };
}

/// Assert that a Result is Err.
#[macro_export]
macro_rules! assert_err {
    ($expr:expr) => {
        match $expr {
            Ok(val) => panic!("Expected Err, got Ok: {:?}", val),
            Err(_) => {}
        }
    };
    ($expr:expr, $msg:expr) => {
        match $expr {
            Ok(val) => panic!("{}: got Ok({:?})", $msg, val),
            Err(_) => {}
        }
    };
}

// ============================================================================
// Tempdir Helper
// ============================================================================

/// Create a temporary directory that is automatically cleaned up.
#[cfg(feature = "test-tempdir")]
pub fn temp_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("Failed to create temp dir")
}

/// Poll `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

// ============================================================================
// IDE Fixtures
// ============================================================================

/// A fake IDE installation under a scratch home directory.
#[derive(Debug, Clone)]
pub struct IdeFixture {
    pub layout: IdeLayout,
    pub variant: IdeVariant,
}

impl IdeFixture {
    /// Layout rooted at `home`; the storage directory is created.
    pub fn new(home: &Path, variant: IdeVariant) -> Self {
        let fixture = IdeFixture {
            layout: IdeLayout::with_home(home),
            variant,
        };
        std::fs::create_dir_all(fixture.storage_dir()).expect("create globalStorage");
        fixture
    }

    pub fn storage_dir(&self) -> PathBuf {
        strategy_for(self.variant).global_storage_dir(&self.layout)
    }

    pub fn json_path(&self) -> PathBuf {
        self.storage_dir().join("storage.json")
    }

    pub fn kv_path(&self) -> PathBuf {
        self.storage_dir().join("state.vscdb")
    }

    /// Write `storage.json` from `(key, value)` pairs, in order.
    pub fn write_json(&self, pairs: &[(&str, &str)]) {
        let doc: Map<String, Value> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect();
        self.write_json_value(&Value::Object(doc));
    }

    pub fn write_json_value(&self, doc: &Value) {
        let text = serde_json::to_string_pretty(doc).expect("serialize storage.json");
        std::fs::write(self.json_path(), text).expect("write storage.json");
    }

    pub fn read_json(&self) -> Map<String, Value> {
        let text = std::fs::read_to_string(self.json_path()).expect("read storage.json");
        serde_json::from_str(&text).expect("parse storage.json")
    }

    pub fn json_value(&self, key: &str) -> Option<String> {
        self.read_json()
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }

    /// Create `state.vscdb` with an `ItemTable` holding `rows`.
    pub fn create_kv(&self, rows: &[(&str, &str)]) {
        let conn = Connection::open(self.kv_path()).expect("open state.vscdb");
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS ItemTable (key TEXT UNIQUE ON CONFLICT REPLACE, value BLOB)",
        )
        .expect("create ItemTable");
        for (k, v) in rows {
            conn.execute(
                "INSERT INTO ItemTable (key, value) VALUES (?1, ?2)",
                params![k, v],
            )
            .expect("insert row");
        }
    }

    pub fn kv_value(&self, key: &str) -> Option<String> {
        let conn = Connection::open(self.kv_path()).ok()?;
        conn.query_row(
            "SELECT CAST(value AS TEXT) FROM ItemTable WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .ok()
    }

    /// Open a connection holding an exclusive write transaction on the KV
    /// store. The lock is held until the connection is dropped.
    pub fn lock_kv(&self) -> Connection {
        let conn = Connection::open(self.kv_path()).expect("open state.vscdb");
        conn.execute_batch("BEGIN EXCLUSIVE").expect("begin exclusive");
        conn
    }
}

// ============================================================================
// Real Processes
// ============================================================================

/// Handle to a spawned process for test control. Killed on drop.
pub struct ProcessHandle {
    pid: u32,
    child: std::sync::Mutex<std::process::Child>,
}

impl ProcessHandle {
    /// Spawn `sleep <seconds>` in its own session.
    pub fn spawn_sleep(seconds: u64) -> std::io::Result<Self> {
        Self::spawn_with_options("sleep", &[&seconds.max(1).to_string()], true)
    }

    /// Spawn a process, optionally in its own process group (new session).
    #[cfg(unix)]
    pub fn spawn_with_options(
        program: &str,
        args: &[&str],
        new_pgrp: bool,
    ) -> std::io::Result<Self> {
        use std::os::unix::process::CommandExt;

        let mut cmd = std::process::Command::new(program);
        cmd.args(args);

        if new_pgrp {
            // SAFETY: setsid() is async-signal-safe and runs in the child pre-exec
            unsafe {
                cmd.pre_exec(|| {
                    libc::setsid();
                    Ok(())
                });
            }
        }

        let child = cmd.spawn()?;
        let pid = child.id();
        Ok(Self {
            pid,
            child: std::sync::Mutex::new(child),
        })
    }

    #[cfg(not(unix))]
    pub fn spawn_with_options(
        program: &str,
        args: &[&str],
        _new_pgrp: bool,
    ) -> std::io::Result<Self> {
        let child = std::process::Command::new(program).args(args).spawn()?;
        let pid = child.id();
        Ok(Self {
            pid,
            child: std::sync::Mutex::new(child),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_running(&self) -> bool {
        let Ok(mut child) = self.child.lock() else {
            return false;
        };
        matches!(child.try_wait(), Ok(None))
    }

    /// Kill and reap.
    pub fn kill(&self) {
        if let Ok(mut child) = self.child.lock() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_fixture_round_trip() {
        let dir = tempdir().unwrap();
        let fixture = IdeFixture::new(dir.path(), IdeVariant::Cursor);
        fixture.write_json(&[("a", "1"), ("b", "2")]);
        assert_eq!(fixture.json_value("b").as_deref(), Some("2"));
        fixture.create_kv(&[("k", "v")]);
        assert_eq!(fixture.kv_value("k").as_deref(), Some("v"));
    }

    #[test]
    fn test_wait_until() {
        assert!(wait_until(Duration::from_millis(50), || true));
        assert!(!wait_until(Duration::from_millis(20), || false));
    }

    #[cfg(unix)]
    #[test]
    fn test_process_handle_kill() {
        let proc = ProcessHandle::spawn_sleep(30).unwrap();
        assert!(proc.is_running());
        proc.kill();
        assert!(!proc.is_running());
    }
}
