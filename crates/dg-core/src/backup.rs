//! Backup sweeping.
//!
//! IDEs and cleanup tools leave copies of the identity stores next to them
//! (`storage.json.bak`, `state.vscdb.backup`, `storage.json-backup-1700000000`).
//! Cleanup tools also leave whole backup directories (`cursor-backup`,
//! `vscode-storage-backup`, `backup-1700000000`). A restored copy brings the
//! old identity back, so while backup monitoring is enabled each tick removes
//! them. The system temp directory is swept one level deep only.

use std::path::{Path, PathBuf};

use regex::Regex;

use crate::variant::MonitoredPath;

/// Subdirectory depth scanned below each backup directory.
const MAX_DEPTH: usize = 1;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

/// Names of whole backup directories left by cleanup tools.
const BACKUP_DIR_PATTERN: &str = r"^(?:(?:cursor|augment|workspace-augment)-backup|vscode-[\w.-]*-backup)(?:[-_.][\w.-]*)?$|^backup-\d+$";

#[derive(Debug, Clone)]
pub struct BackupSweeper {
    pattern: Regex,
    dir_pattern: Regex,
    dirs: Vec<PathBuf>,
    shallow_dirs: Vec<PathBuf>,
}

impl BackupSweeper {
    /// Sweeper for backups of files named `store_names`, searched in `dirs`.
    pub fn new<S: AsRef<str>>(store_names: &[S], dirs: Vec<PathBuf>) -> Result<Self, regex::Error> {
        let names = store_names
            .iter()
            .map(|n| regex::escape(n.as_ref()))
            .collect::<Vec<_>>()
            .join("|");
        let pattern = Regex::new(&format!(
            r"^(?:{names})(?:\.(?:bak|backup|old)(?:\.\d+)?|[.-]backup-\d+)$"
        ))?;
        Ok(BackupSweeper {
            pattern,
            dir_pattern: Regex::new(BACKUP_DIR_PATTERN)?,
            dirs,
            shallow_dirs: Vec::new(),
        })
    }

    /// Also sweep the top level of `dir`, without descending.
    pub fn with_shallow_dir(mut self, dir: PathBuf) -> Self {
        if !self.dirs.contains(&dir) && !self.shallow_dirs.contains(&dir) {
            self.shallow_dirs.push(dir);
        }
        self
    }

    /// Sweeper for the stores of one monitored set. Each store's own
    /// directory is always searched.
    pub fn for_paths(paths: &[MonitoredPath], mut dirs: Vec<PathBuf>) -> Result<Self, regex::Error> {
        let mut names: Vec<String> = paths.iter().map(MonitoredPath::file_name).collect();
        names.sort();
        names.dedup();
        for dir in paths.iter().filter_map(MonitoredPath::dir) {
            if !dirs.iter().any(|d| d == dir) {
                dirs.push(dir.to_path_buf());
            }
        }
        Self::new(&names, dirs)
    }

    pub fn is_backup_name(&self, name: &str) -> bool {
        self.pattern.is_match(name)
    }

    pub fn is_backup_dir_name(&self, name: &str) -> bool {
        self.dir_pattern.is_match(name)
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    pub fn shallow_dirs(&self) -> &[PathBuf] {
        &self.shallow_dirs
    }

    /// Remove every backup found. Missing directories are skipped.
    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        for dir in &self.dirs {
            self.sweep_dir(dir, 0, MAX_DEPTH, &mut report);
        }
        for dir in &self.shallow_dirs {
            self.sweep_dir(dir, 0, 0, &mut report);
        }
        report
    }

    fn sweep_dir(&self, dir: &Path, depth: usize, max_depth: usize, report: &mut SweepReport) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                if self.is_backup_dir_name(&entry.file_name().to_string_lossy()) {
                    match std::fs::remove_dir_all(&path) {
                        Ok(()) => report.removed.push(path),
                        Err(e) => report.failed.push((path, e.to_string())),
                    }
                } else if depth < max_depth {
                    self.sweep_dir(&path, depth + 1, max_depth, report);
                }
                continue;
            }
            let name = entry.file_name();
            if !self.is_backup_name(&name.to_string_lossy()) {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => report.removed.push(path),
                Err(e) => report.failed.push((path, e.to_string())),
            }
        }
    }
}
