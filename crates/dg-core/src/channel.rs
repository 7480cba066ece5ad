//! File-based control channel between a host and a standalone guardian.
//!
//! Three files live in one directory (default `$TMPDIR/devguard/`):
//!
//! - `guardian-config.json`: the run configuration, written atomically by the
//!   host and deleted by the guardian on clean stop.
//! - `guardian.pid`: decimal PID of the standalone guardian, no newline.
//! - `guardian.log`: append-only, one line per enforcement record.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use thiserror::Error;

use crate::enforce::{ConfigSource, EnforcementRecord, RecordSink};
use crate::logging::event_names;
use dg_common::{GuardianConfig, ProcessId};

/// Environment variable overriding the channel directory.
pub const ENV_CHANNEL_DIR: &str = "DG_CHANNEL_DIR";

pub const CONFIG_FILE: &str = "guardian-config.json";
pub const PID_FILE: &str = "guardian.pid";
pub const LOG_FILE: &str = "guardian.log";

/// Lines of the log returned by status.
pub const RECENT_LOG_LINES: usize = 10;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel config not found at {path}")]
    Missing { path: PathBuf },

    #[error("invalid channel config at {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ChannelError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        ChannelError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl From<ChannelError> for dg_common::Error {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Missing { path } => dg_common::Error::ConfigMissing { path },
            ChannelError::Invalid { path, reason } => {
                dg_common::Error::Config(format!("{}: {}", path.display(), reason))
            }
            ChannelError::Io { source, .. } => dg_common::Error::Io(source),
        }
    }
}

/// Locations of the channel files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPaths {
    dir: PathBuf,
}

impl ChannelPaths {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        ChannelPaths { dir: dir.into() }
    }

    /// `$DG_CHANNEL_DIR`, else `<temp dir>/devguard`.
    pub fn from_env() -> Self {
        match std::env::var_os(ENV_CHANNEL_DIR) {
            Some(dir) if !dir.is_empty() => Self::new(dir),
            _ => Self::default_location(),
        }
    }

    pub fn default_location() -> Self {
        Self::new(std::env::temp_dir().join("devguard"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.join(CONFIG_FILE)
    }

    pub fn pid_path(&self) -> PathBuf {
        self.dir.join(PID_FILE)
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    fn ensure_dir(&self) -> Result<(), ChannelError> {
        fs::create_dir_all(&self.dir).map_err(|e| ChannelError::io(&self.dir, e))
    }

    // -- config --------------------------------------------------------------

    pub fn write_config(&self, config: &GuardianConfig) -> Result<(), ChannelError> {
        self.ensure_dir()?;
        let path = self.config_path();
        let content = config.to_json_pretty().map_err(|e| ChannelError::Invalid {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        write_atomic(&path, content.as_bytes())?;
        tracing::debug!(
            target: event_names::CHANNEL_CONFIG_WRITTEN,
            path = %path.display(),
            "channel config written"
        );
        Ok(())
    }

    pub fn read_config(&self) -> Result<GuardianConfig, ChannelError> {
        read_config_at(&self.config_path())
    }

    pub fn remove_config(&self) -> Result<(), ChannelError> {
        remove_if_exists(&self.config_path())
    }

    // -- pid -----------------------------------------------------------------

    pub fn write_pid(&self, pid: ProcessId) -> Result<(), ChannelError> {
        self.ensure_dir()?;
        write_atomic(&self.pid_path(), pid.to_string().as_bytes())
    }

    /// PID recorded in the PID file. Unparseable contents read as `None`.
    pub fn read_pid(&self) -> Result<Option<ProcessId>, ChannelError> {
        let path = self.pid_path();
        match fs::read_to_string(&path) {
            Ok(content) => Ok(ProcessId::parse(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ChannelError::io(&path, e)),
        }
    }

    pub fn pid_file_exists(&self) -> bool {
        self.pid_path().exists()
    }

    pub fn remove_pid(&self) -> Result<(), ChannelError> {
        remove_if_exists(&self.pid_path())
    }

    /// Remove the PID file only if it still names `pid`.
    ///
    /// A guardian exiting after being superseded must not delete its
    /// successor's PID file.
    pub fn remove_pid_if_owned(&self, pid: ProcessId) -> Result<bool, ChannelError> {
        if self.read_pid()? != Some(pid) {
            return Ok(false);
        }
        self.remove_pid()?;
        Ok(true)
    }

    // -- log -----------------------------------------------------------------

    pub fn append_log(&self, line: &str) -> Result<(), ChannelError> {
        self.ensure_dir()?;
        let path = self.log_path();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| ChannelError::io(&path, e))?;
        let mut buf = line.trim_end_matches('\n').to_string();
        buf.push('\n');
        file.write_all(buf.as_bytes())
            .map_err(|e| ChannelError::io(&path, e))
    }

    /// Last `limit` non-empty lines of the log (oldest first).
    pub fn recent_log_lines(&self, limit: usize) -> Vec<String> {
        let Ok(content) = fs::read_to_string(self.log_path()) else {
            return Vec::new();
        };
        let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
        let start = lines.len().saturating_sub(limit);
        lines[start..].iter().map(|l| l.to_string()).collect()
    }

    /// Remove the config and (if owned by `pid`) the PID file.
    ///
    /// With `Some(pid)` the config is removed only while the PID file still
    /// names `pid` or is already gone; once a successor has claimed the
    /// channel its config stays.
    pub fn cleanup(&self, pid: Option<ProcessId>) -> Vec<ChannelError> {
        let mut errors = Vec::new();
        let owned = match pid {
            Some(pid) => self
                .remove_pid_if_owned(pid)
                .map(|removed| removed || !self.pid_file_exists()),
            None => self.remove_pid().map(|_| true),
        };
        match owned {
            Ok(true) => {
                if let Err(e) = self.remove_config() {
                    errors.push(e);
                }
            }
            Ok(false) => {}
            Err(e) => errors.push(e),
        }
        tracing::debug!(
            target: event_names::CHANNEL_CLEANUP,
            dir = %self.dir.display(),
            errors = errors.len(),
            "channel cleaned up"
        );
        errors
    }
}

impl Default for ChannelPaths {
    fn default() -> Self {
        Self::from_env()
    }
}

fn read_config_at(path: &Path) -> Result<GuardianConfig, ChannelError> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ChannelError::Missing {
                path: path.to_path_buf(),
            })
        }
        Err(e) => return Err(ChannelError::io(path, e)),
    };
    GuardianConfig::from_json_str(&content).map_err(|e| ChannelError::Invalid {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Temp sibling + fsync + rename.
fn write_atomic(path: &Path, content: &[u8]) -> Result<(), ChannelError> {
    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("channel");
    let tmp_path = path.with_file_name(format!(".{}.{}.tmp", file_name, std::process::id()));
    let written = (|| {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)
    })();
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp_path);
        return Err(ChannelError::io(path, e));
    }
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<(), ChannelError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ChannelError::io(path, e)),
    }
}

/// Change marker for a file: mtime, length, and inode (Unix).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: Option<SystemTime>,
    len: u64,
    inode: u64,
}

impl FileStamp {
    fn of(path: &Path) -> Option<Self> {
        let meta = fs::metadata(path).ok()?;
        #[cfg(unix)]
        let inode = {
            use std::os::unix::fs::MetadataExt;
            meta.ino()
        };
        #[cfg(not(unix))]
        let inode = 0;
        Some(FileStamp {
            modified: meta.modified().ok(),
            len: meta.len(),
            inode,
        })
    }
}

/// The channel config as seen by a running standalone guardian.
///
/// Re-read whenever the file changes. A rewrite that fails to parse or
/// validate is rejected and the last good config stays in force. A missing
/// file also leaves the current config in force.
#[derive(Debug)]
pub struct KnownGoodConfig {
    path: PathBuf,
    stamp: Option<FileStamp>,
    current: GuardianConfig,
}

impl KnownGoodConfig {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ChannelError> {
        let path = path.into();
        let stamp = FileStamp::of(&path);
        let current = read_config_at(&path)?;
        Ok(KnownGoodConfig {
            path,
            stamp,
            current,
        })
    }

    pub fn current(&self) -> &GuardianConfig {
        &self.current
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigSource for KnownGoodConfig {
    fn poll(&mut self) -> Option<GuardianConfig> {
        let stamp = FileStamp::of(&self.path)?;
        if Some(stamp) == self.stamp {
            return None;
        }
        self.stamp = Some(stamp);
        match read_config_at(&self.path) {
            Ok(config) if config == self.current => None,
            Ok(config) => {
                tracing::info!(
                    target: event_names::CHANNEL_CONFIG_RELOADED,
                    path = %self.path.display(),
                    ide = config.selected_ide.as_str(),
                    "channel config reloaded"
                );
                self.current = config.clone();
                Some(config)
            }
            Err(e) => {
                tracing::warn!(
                    target: event_names::CHANNEL_CONFIG_REJECTED,
                    path = %self.path.display(),
                    error = %e,
                    "rejected channel config rewrite; keeping last good config"
                );
                None
            }
        }
    }
}

/// Appends enforcement records to the channel log.
#[derive(Debug, Clone)]
pub struct ChannelLogSink {
    paths: ChannelPaths,
}

impl ChannelLogSink {
    pub fn new(paths: ChannelPaths) -> Self {
        ChannelLogSink { paths }
    }
}

impl RecordSink for ChannelLogSink {
    fn record(&self, record: &EnforcementRecord) {
        if let Err(e) = self.paths.append_log(&record.to_log_line()) {
            tracing::debug!(
                target: event_names::INTERNAL_ERROR,
                error = %e,
                "failed to append to channel log"
            );
        }
    }
}
