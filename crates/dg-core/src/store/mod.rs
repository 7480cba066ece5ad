//! Identity stores: read identity fields from, and merge-write them into,
//! the IDE's own storage files.
//!
//! Two formats are supported:
//! - [`JsonStore`]: a flat JSON object (`storage.json`), replaced atomically
//! - [`KvStore`]: the SQLite `ItemTable` (`state.vscdb`), updated in one
//!   transaction
//!
//! A merge write touches only the keys it is given; every other key, and the
//! key order of JSON documents, is preserved. A store that is busy reports
//! [`StoreError::Locked`], which callers retry under a [`RetryPolicy`].

pub mod json;
pub mod kv;
pub mod retry;

pub use json::JsonStore;
pub use kv::KvStore;
pub use retry::RetryPolicy;

use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::variant::{MonitoredPath, StorageKind};
use dg_common::IdentityFields;

/// Errors from one identity store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{} is locked by another writer: {reason}", path.display())]
    Locked { path: PathBuf, reason: String },

    #[error("{} is not a usable identity store: {reason}", path.display())]
    Malformed { path: PathBuf, reason: String },

    #[error("{} does not exist", path.display())]
    Missing { path: PathBuf },

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("database error at {}: {source}", path.display())]
    Sqlite {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
}

impl StoreError {
    /// Wrap an I/O error, classifying sharing/lock violations as `Locked`.
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        if is_lock_error(&source) {
            StoreError::Locked {
                path: path.to_path_buf(),
                reason: source.to_string(),
            }
        } else if source.kind() == std::io::ErrorKind::NotFound {
            StoreError::Missing {
                path: path.to_path_buf(),
            }
        } else {
            StoreError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }

    /// Wrap a SQLite error, classifying BUSY/LOCKED as `Locked`.
    pub fn sqlite(path: &Path, source: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match source.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => StoreError::Locked {
                path: path.to_path_buf(),
                reason: source.to_string(),
            },
            Some(ErrorCode::CannotOpen) => StoreError::Missing {
                path: path.to_path_buf(),
            },
            Some(ErrorCode::NotADatabase) | Some(ErrorCode::DatabaseCorrupt) => {
                StoreError::Malformed {
                    path: path.to_path_buf(),
                    reason: source.to_string(),
                }
            }
            _ => StoreError::Sqlite {
                path: path.to_path_buf(),
                source,
            },
        }
    }

    pub fn is_locked(&self) -> bool {
        matches!(self, StoreError::Locked { .. })
    }

    pub fn path(&self) -> &Path {
        match self {
            StoreError::Locked { path, .. }
            | StoreError::Malformed { path, .. }
            | StoreError::Missing { path }
            | StoreError::Io { path, .. }
            | StoreError::Sqlite { path, .. } => path,
        }
    }

    /// Convert for host-facing reporting.
    pub fn into_error(self, attempts: u32) -> dg_common::Error {
        match self {
            StoreError::Locked { path, .. } => dg_common::Error::PathLocked { path, attempts },
            other => dg_common::Error::Store {
                path: other.path().to_path_buf(),
                reason: other.to_string(),
            },
        }
    }
}

/// Whether an OS error means "someone else holds this file right now".
pub fn is_lock_error(err: &std::io::Error) -> bool {
    if err.kind() == std::io::ErrorKind::WouldBlock {
        return true;
    }
    match err.raw_os_error() {
        #[cfg(unix)]
        Some(code) => code == libc::EBUSY || code == libc::ETXTBSY || code == libc::EAGAIN,
        // ERROR_SHARING_VIOLATION, ERROR_LOCK_VIOLATION
        #[cfg(windows)]
        Some(code) => code == 32 || code == 33,
        #[cfg(not(any(unix, windows)))]
        Some(_) => false,
        None => false,
    }
}

/// Read and merge-write access to one identity store.
pub trait IdentityStore: Send {
    fn path(&self) -> &Path;

    /// Whether the store currently exists on disk.
    fn exists(&self) -> bool;

    /// Whether a merge write may create the store when it is absent.
    fn can_create(&self) -> bool {
        false
    }

    /// Current identity values. An absent store reads as empty.
    fn read(&self) -> Result<IdentityFields, StoreError>;

    /// Overwrite exactly `fields`, preserving everything else.
    fn merge_write(&self, fields: &IdentityFields) -> Result<(), StoreError>;
}

/// Opens the store backing a monitored path.
pub trait StoreOpener: Send + Sync {
    fn open(&self, path: &MonitoredPath) -> Box<dyn IdentityStore>;
}

/// Opens the real on-disk store for each storage kind.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskStoreOpener;

impl StoreOpener for DiskStoreOpener {
    fn open(&self, path: &MonitoredPath) -> Box<dyn IdentityStore> {
        match path.kind {
            StorageKind::FlatJson => Box::new(JsonStore::new(&path.path)),
            StorageKind::EmbeddedKv => Box::new(KvStore::new(&path.path, path.fields.clone())),
        }
    }
}
