//! Enhanced protection: corrected flat-JSON stores are left read-only
//! between corrections.
//!
//! Only files this process marked are ever made writable again.

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Default)]
pub struct Protector {
    protected: BTreeSet<PathBuf>,
}

impl Protector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `path` read-only.
    pub fn protect(&mut self, path: &Path) -> io::Result<()> {
        let mut perms = std::fs::metadata(path)?.permissions();
        if !perms.readonly() {
            perms.set_readonly(true);
            std::fs::set_permissions(path, perms)?;
        }
        self.protected.insert(path.to_path_buf());
        Ok(())
    }

    /// Make a file we protected writable again. No-op for files we never marked.
    pub fn unprotect(&mut self, path: &Path) -> io::Result<()> {
        if !self.protected.remove(path) {
            return Ok(());
        }
        match make_writable(path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    pub fn is_protected(&self, path: &Path) -> bool {
        self.protected.contains(path)
    }

    pub fn protected(&self) -> impl Iterator<Item = &Path> {
        self.protected.iter().map(PathBuf::as_path)
    }

    /// Restore write access to everything we protected.
    pub fn release_all(&mut self) -> Vec<(PathBuf, io::Error)> {
        let paths: Vec<PathBuf> = self.protected.iter().cloned().collect();
        paths
            .into_iter()
            .filter_map(|p| self.unprotect(&p).err().map(|e| (p, e)))
            .collect()
    }
}

#[cfg(unix)]
fn make_writable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(perms.mode() | 0o200);
    std::fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
#[allow(clippy::permissions_set_readonly_false)]
fn make_writable(path: &Path) -> io::Result<()> {
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_readonly(false);
    std::fs::set_permissions(path, perms)
}
