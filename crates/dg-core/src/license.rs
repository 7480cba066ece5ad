//! License gate consulted by the enforcement loop at every tick.
//!
//! The guardian never talks to the activation server. It trusts either a
//! cache file the host maintains ([`ActivationCacheGate`]) or a flag the
//! in-process host flips directly ([`SharedFlagGate`]).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Environment override for the activation cache location.
pub const ENV_ACTIVATION_FILE: &str = "DG_ACTIVATION_FILE";

pub trait LicenseGate: Send + Sync {
    fn is_valid(&self) -> bool;

    /// Short description for logs and status.
    fn describe(&self) -> String {
        "license gate".to_string()
    }
}

/// Why the activation cache was judged the way it was.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivationState {
    /// Active; `expires_at` is `None` for a non-expiring activation.
    Valid { expires_at: Option<DateTime<Utc>> },
    Expired { expires_at: DateTime<Utc> },
    Missing,
    Unreadable(String),
}

impl ActivationState {
    pub fn is_valid(&self) -> bool {
        matches!(self, ActivationState::Valid { .. })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActivationDocument {
    activation: Option<Activation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Activation {
    expires_at: Option<String>,
}

/// Reads `{"activation": {"expiresAt": "<RFC3339>"}}` from the host's cache.
#[derive(Debug, Clone)]
pub struct ActivationCacheGate {
    path: PathBuf,
}

impl ActivationCacheGate {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ActivationCacheGate { path: path.into() }
    }

    /// `~/.devguard/activation.json`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".devguard").join("activation.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> ActivationState {
        self.state_at(Utc::now())
    }

    pub fn state_at(&self, now: DateTime<Utc>) -> ActivationState {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return ActivationState::Missing,
            Err(e) => return ActivationState::Unreadable(e.to_string()),
        };
        let doc: ActivationDocument = match serde_json::from_str(&content) {
            Ok(doc) => doc,
            Err(e) => return ActivationState::Unreadable(e.to_string()),
        };
        let Some(activation) = doc.activation else {
            return ActivationState::Missing;
        };
        let Some(raw) = activation.expires_at else {
            return ActivationState::Valid { expires_at: None };
        };
        match DateTime::parse_from_rfc3339(&raw) {
            Ok(ts) => {
                let expires_at = ts.with_timezone(&Utc);
                if now > expires_at {
                    ActivationState::Expired { expires_at }
                } else {
                    ActivationState::Valid {
                        expires_at: Some(expires_at),
                    }
                }
            }
            Err(e) => ActivationState::Unreadable(format!("expiresAt: {}", e)),
        }
    }
}

impl LicenseGate for ActivationCacheGate {
    fn is_valid(&self) -> bool {
        self.state().is_valid()
    }

    fn describe(&self) -> String {
        format!("activation cache {}", self.path.display())
    }
}

/// License state pushed by an in-process host.
#[derive(Debug, Clone)]
pub struct SharedFlagGate {
    flag: Arc<AtomicBool>,
}

impl SharedFlagGate {
    pub fn new(valid: bool) -> Self {
        SharedFlagGate {
            flag: Arc::new(AtomicBool::new(valid)),
        }
    }

    pub fn set(&self, valid: bool) {
        self.flag.store(valid, Ordering::SeqCst);
    }

    pub fn handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flag)
    }
}

impl LicenseGate for SharedFlagGate {
    fn is_valid(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    fn describe(&self) -> String {
        "host license flag".to_string()
    }
}
