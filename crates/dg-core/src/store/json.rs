//! Flat-JSON identity store (`storage.json`).

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use super::{IdentityStore, StoreError};
use dg_common::IdentityFields;

/// Marker in the names of our own temp files, so they are never mistaken
/// for the IDE's in-flight artifacts or for backups.
pub const TEMP_MARKER: &str = ".devguard-";

/// A flat JSON object of identity values, replaced atomically on write.
#[derive(Debug, Clone)]
pub struct JsonStore {
    path: PathBuf,
}

impl JsonStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonStore { path: path.into() }
    }

    /// Hidden sibling used for the write-then-rename: `.<name>.devguard-<pid>.tmp`.
    pub fn temp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "store.json".to_string());
        self.path.with_file_name(format!(
            ".{}{}{}.tmp",
            name,
            TEMP_MARKER,
            std::process::id()
        ))
    }

    /// Parse the current document. `Ok(None)` when the file does not exist.
    fn load(&self) -> Result<Option<Map<String, Value>>, StoreError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(&self.path, e)),
        };
        parse_document(&self.path, &content).map(Some)
    }

    fn write_atomic(&self, content: &[u8]) -> Result<(), StoreError> {
        let tmp_path = self.temp_path();
        let result = (|| {
            let mut file = fs::File::create(&tmp_path).map_err(|e| StoreError::io(&tmp_path, e))?;
            file.write_all(content)
                .map_err(|e| StoreError::io(&tmp_path, e))?;
            file.sync_all().map_err(|e| StoreError::io(&tmp_path, e))?;
            if let Ok(meta) = fs::metadata(&self.path) {
                let _ = fs::set_permissions(&tmp_path, meta.permissions());
            }
            fs::rename(&tmp_path, &self.path).map_err(|e| StoreError::io(&self.path, e))
        })();
        if result.is_err() {
            let _ = fs::remove_file(&tmp_path);
        }
        result
    }
}

/// Parse a flat identity document. Only a JSON object is accepted.
pub fn parse_document(path: &Path, content: &str) -> Result<Map<String, Value>, StoreError> {
    match serde_json::from_str::<Value>(content) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(StoreError::Malformed {
            path: path.to_path_buf(),
            reason: format!("expected a JSON object, found {}", json_type_name(&other)),
        }),
        Err(e) => Err(StoreError::Malformed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }),
    }
}

/// Overwrite `fields` in `doc`; existing keys keep their position.
pub fn merge_fields(doc: &mut Map<String, Value>, fields: &IdentityFields) {
    for (key, value) in fields {
        doc.insert(key.clone(), Value::String(value.clone()));
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

impl IdentityStore for JsonStore {
    fn path(&self) -> &Path {
        &self.path
    }

    fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// A deleted `storage.json` is recreated as long as its directory exists.
    fn can_create(&self) -> bool {
        self.path.parent().map(Path::is_dir).unwrap_or(false)
    }

    fn read(&self) -> Result<IdentityFields, StoreError> {
        let Some(doc) = self.load()? else {
            return Ok(IdentityFields::new());
        };
        Ok(doc
            .into_iter()
            .filter_map(|(k, v)| match v {
                Value::String(s) => Some((k, s)),
                _ => None,
            })
            .collect())
    }

    fn merge_write(&self, fields: &IdentityFields) -> Result<(), StoreError> {
        let mut doc = match self.load()? {
            Some(doc) => doc,
            None if self.can_create() => Map::new(),
            None => {
                return Err(StoreError::Missing {
                    path: self.path.clone(),
                })
            }
        };
        merge_fields(&mut doc, fields);
        let mut content = serde_json::to_vec_pretty(&Value::Object(doc)).map_err(|e| {
            StoreError::Malformed {
                path: self.path.clone(),
                reason: e.to_string(),
            }
        })?;
        content.push(b'\n');
        self.write_atomic(&content)
    }
}
