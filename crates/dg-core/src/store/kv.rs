//! Embedded key/value identity store (`state.vscdb`, SQLite `ItemTable`).

use std::path::{Path, PathBuf};

use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OpenFlags, TransactionBehavior};

use super::{IdentityStore, StoreError};
use dg_common::IdentityFields;

const TABLE: &str = "ItemTable";

/// The IDE's SQLite item table. Never created by the guardian.
#[derive(Debug, Clone)]
pub struct KvStore {
    path: PathBuf,
    /// Keys read back by [`IdentityStore::read`].
    keys: Vec<String>,
}

impl KvStore {
    pub fn new(path: impl Into<PathBuf>, keys: Vec<String>) -> Self {
        KvStore {
            path: path.into(),
            keys,
        }
    }

    fn open(&self, flags: OpenFlags) -> Result<Connection, StoreError> {
        if !self.path.is_file() {
            return Err(StoreError::Missing {
                path: self.path.clone(),
            });
        }
        let conn = Connection::open_with_flags(&self.path, flags | OpenFlags::SQLITE_OPEN_NO_MUTEX)
            .map_err(|e| StoreError::sqlite(&self.path, e))?;
        // Busy stores surface immediately; the caller owns the retry schedule.
        conn.busy_timeout(std::time::Duration::ZERO)
            .map_err(|e| StoreError::sqlite(&self.path, e))?;
        Ok(conn)
    }

    fn check_table(&self, conn: &Connection) -> Result<(), StoreError> {
        let present: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![TABLE],
                |row| row.get(0),
            )
            .map_err(|e| StoreError::sqlite(&self.path, e))?;
        if present == 0 {
            return Err(StoreError::Malformed {
                path: self.path.clone(),
                reason: format!("no {} table", TABLE),
            });
        }
        Ok(())
    }
}

fn value_to_string(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Some(String::from_utf8_lossy(bytes).into_owned())
        }
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Null => None,
    }
}

impl IdentityStore for KvStore {
    fn path(&self) -> &Path {
        &self.path
    }

    fn exists(&self) -> bool {
        self.path.is_file()
    }

    fn read(&self) -> Result<IdentityFields, StoreError> {
        if !self.exists() {
            return Ok(IdentityFields::new());
        }
        let conn = self.open(OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        self.check_table(&conn)?;
        let mut stmt = conn
            .prepare("SELECT value FROM ItemTable WHERE key = ?1")
            .map_err(|e| StoreError::sqlite(&self.path, e))?;

        let mut out = IdentityFields::new();
        for key in &self.keys {
            let mut rows = stmt
                .query(params![key])
                .map_err(|e| StoreError::sqlite(&self.path, e))?;
            if let Some(row) = rows.next().map_err(|e| StoreError::sqlite(&self.path, e))? {
                let value = row
                    .get_ref(0)
                    .map_err(|e| StoreError::sqlite(&self.path, e))?;
                if let Some(v) = value_to_string(value) {
                    out.insert(key.clone(), v);
                }
            }
        }
        Ok(out)
    }

    fn merge_write(&self, fields: &IdentityFields) -> Result<(), StoreError> {
        let mut conn = self.open(OpenFlags::SQLITE_OPEN_READ_WRITE)?;
        self.check_table(&conn)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| StoreError::sqlite(&self.path, e))?;
        for (key, value) in fields {
            let updated = tx
                .execute(
                    "UPDATE ItemTable SET value = ?2 WHERE key = ?1",
                    params![key, value],
                )
                .map_err(|e| StoreError::sqlite(&self.path, e))?;
            if updated == 0 {
                tx.execute(
                    "INSERT INTO ItemTable (key, value) VALUES (?1, ?2)",
                    params![key, value],
                )
                .map_err(|e| StoreError::sqlite(&self.path, e))?;
            }
        }
        tx.commit().map_err(|e| StoreError::sqlite(&self.path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_db(path: &Path, rows: &[(&str, &str)]) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            "CREATE TABLE ItemTable (key TEXT UNIQUE ON CONFLICT REPLACE, value BLOB)",
        )
        .unwrap();
        for (k, v) in rows {
            conn.execute(
                "INSERT INTO ItemTable (key, value) VALUES (?1, ?2)",
                params![k, v],
            )
            .unwrap();
        }
    }

    fn keys() -> Vec<String> {
        vec!["telemetry.devDeviceId".into(), "telemetry.machineId".into()]
    }

    #[test]
    fn test_read_declared_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.vscdb");
        create_db(
            &path,
            &[("telemetry.devDeviceId", "dev"), ("other.key", "x")],
        );
        let read = KvStore::new(&path, keys()).read().unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read["telemetry.devDeviceId"], "dev");
    }

    #[test]
    fn test_merge_updates_and_inserts() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.vscdb");
        create_db(
            &path,
            &[("telemetry.devDeviceId", "old"), ("unrelated", "keep")],
        );
        let store = KvStore::new(&path, keys());
        let mut fields = IdentityFields::new();
        fields.insert("telemetry.devDeviceId".into(), "new".into());
        fields.insert("telemetry.machineId".into(), "m".into());
        store.merge_write(&fields).unwrap();

        assert_eq!(store.read().unwrap(), fields);
        let conn = Connection::open(&path).unwrap();
        let kept: String = conn
            .query_row(
                "SELECT value FROM ItemTable WHERE key = 'unrelated'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(kept, "keep");
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM ItemTable", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 3);
    }

    #[test]
    fn test_never_creates_container() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.vscdb");
        let store = KvStore::new(&path, keys());
        assert!(store.read().unwrap().is_empty());
        let mut fields = IdentityFields::new();
        fields.insert("telemetry.devDeviceId".into(), "x".into());
        assert!(matches!(
            store.merge_write(&fields),
            Err(StoreError::Missing { .. })
        ));
        assert!(!path.exists());
    }

    #[test]
    fn test_missing_table_is_malformed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.vscdb");
        Connection::open(&path)
            .unwrap()
            .execute_batch("CREATE TABLE other (a TEXT)")
            .unwrap();
        let store = KvStore::new(&path, keys());
        assert!(matches!(store.read(), Err(StoreError::Malformed { .. })));
    }

    #[test]
    fn test_busy_database_reports_locked() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.vscdb");
        create_db(&path, &[("telemetry.devDeviceId", "old")]);

        let mut holder = Connection::open(&path).unwrap();
        let _tx = holder
            .transaction_with_behavior(TransactionBehavior::Exclusive)
            .unwrap();

        let mut fields = IdentityFields::new();
        fields.insert("telemetry.devDeviceId".into(), "new".into());
        let err = KvStore::new(&path, keys()).merge_write(&fields).unwrap_err();
        assert!(err.is_locked(), "expected Locked, got {err:?}");
    }
}
