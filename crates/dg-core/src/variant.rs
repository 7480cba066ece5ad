//! IDE variants and where they keep their identity.
//!
//! Each [`IdeVariant`] maps to an [`IdeStrategy`] that knows the storage
//! layout of that IDE: which files hold identity fields, which fields each
//! file carries, and which temp-file suffixes the IDE uses for its own
//! atomic replaces.

use std::path::{Path, PathBuf};

use dg_common::identity::fields;
use dg_common::{GuardianConfig, IdeVariant};

/// On-disk format of an identity store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    /// Flat JSON object of string values (`storage.json`).
    FlatJson,
    /// SQLite key/value table (`state.vscdb`).
    EmbeddedKv,
}

/// One identity store the guardian watches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoredPath {
    pub path: PathBuf,
    pub kind: StorageKind,
    /// Identity fields this store carries.
    pub fields: Vec<String>,
    /// Suffixes of the sibling files the IDE writes during its own replace.
    pub in_flight_suffixes: Vec<String>,
}

impl MonitoredPath {
    pub fn new(path: impl Into<PathBuf>, kind: StorageKind) -> Self {
        MonitoredPath {
            path: path.into(),
            kind,
            fields: Vec::new(),
            in_flight_suffixes: Vec::new(),
        }
    }

    pub fn with_fields<S: Into<String>>(mut self, fields: impl IntoIterator<Item = S>) -> Self {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_in_flight_suffixes<S: Into<String>>(
        mut self,
        suffixes: impl IntoIterator<Item = S>,
    ) -> Self {
        self.in_flight_suffixes = suffixes.into_iter().map(Into::into).collect();
        self
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn dir(&self) -> Option<&Path> {
        self.path.parent()
    }

    /// Candidate in-flight artifacts: `<name><suffix>` next to the store.
    pub fn in_flight_candidates(&self) -> Vec<PathBuf> {
        let name = self.file_name();
        let Some(dir) = self.dir() else {
            return Vec::new();
        };
        self.in_flight_suffixes
            .iter()
            .map(|suffix| dir.join(format!("{}{}", name, suffix)))
            .collect()
    }
}

/// Host operating system family, for per-platform IDE layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    MacOs,
    Windows,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            Platform::MacOs
        } else if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Linux
        }
    }
}

/// Resolves IDE data directories from a home directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdeLayout {
    pub home: PathBuf,
    pub platform: Platform,
}

impl IdeLayout {
    /// Layout for the current user, or `None` without a home directory.
    pub fn detect() -> Option<Self> {
        dirs::home_dir().map(Self::with_home)
    }

    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        IdeLayout {
            home: home.into(),
            platform: Platform::current(),
        }
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// `<config root>/<app>/User`.
    pub fn user_dir(&self, app_dir: &str) -> PathBuf {
        let root = match self.platform {
            Platform::Linux => self.home.join(".config"),
            Platform::MacOs => self.home.join("Library").join("Application Support"),
            Platform::Windows => self.home.join("AppData").join("Roaming"),
        };
        root.join(app_dir).join("User")
    }
}

/// Storage layout of one IDE.
pub trait IdeStrategy: Send + Sync {
    fn variant(&self) -> IdeVariant;

    /// Directory name under the platform config root.
    fn app_dir_name(&self) -> &'static str;

    /// Identity fields a store of `kind` carries.
    fn fields_for(&self, kind: StorageKind) -> &'static [&'static str];

    /// Suffixes of the IDE's own temp files for a store of `kind`.
    fn in_flight_suffixes(&self, kind: StorageKind) -> &'static [&'static str];

    fn global_storage_dir(&self, layout: &IdeLayout) -> PathBuf {
        layout.user_dir(self.app_dir_name()).join("globalStorage")
    }

    /// All identity stores of this IDE.
    fn paths_for(&self, layout: &IdeLayout) -> Vec<MonitoredPath> {
        let dir = self.global_storage_dir(layout);
        [
            (dir.join("storage.json"), StorageKind::FlatJson),
            (dir.join("state.vscdb"), StorageKind::EmbeddedKv),
        ]
        .into_iter()
        .map(|(path, kind)| {
            MonitoredPath::new(path, kind)
                .with_fields(self.fields_for(kind).iter().copied())
                .with_in_flight_suffixes(self.in_flight_suffixes(kind).iter().copied())
        })
        .collect()
    }

    /// Directories swept for backup copies of the stores.
    fn backup_dirs(&self, layout: &IdeLayout) -> Vec<PathBuf> {
        let user = layout.user_dir(self.app_dir_name());
        vec![user.join("globalStorage"), user.join("workspaceStorage")]
    }
}

const JSON_FIELDS: &[&str] = &[
    fields::MACHINE_ID,
    fields::MAC_MACHINE_ID,
    fields::DEV_DEVICE_ID,
    fields::SQM_ID,
    fields::SERVICE_MACHINE_ID,
];

const KV_FIELDS: &[&str] = fields::ALL;

const JSON_IN_FLIGHT: &[&str] = &[".tmp", ".vsctmp"];
const KV_IN_FLIGHT: &[&str] = &["-journal"];

pub struct CursorStrategy;

impl IdeStrategy for CursorStrategy {
    fn variant(&self) -> IdeVariant {
        IdeVariant::Cursor
    }

    fn app_dir_name(&self) -> &'static str {
        "Cursor"
    }

    fn fields_for(&self, kind: StorageKind) -> &'static [&'static str] {
        match kind {
            StorageKind::FlatJson => JSON_FIELDS,
            StorageKind::EmbeddedKv => KV_FIELDS,
        }
    }

    fn in_flight_suffixes(&self, kind: StorageKind) -> &'static [&'static str] {
        match kind {
            StorageKind::FlatJson => JSON_IN_FLIGHT,
            StorageKind::EmbeddedKv => KV_IN_FLIGHT,
        }
    }
}

pub struct VsCodeStrategy;

impl IdeStrategy for VsCodeStrategy {
    fn variant(&self) -> IdeVariant {
        IdeVariant::VsCode
    }

    fn app_dir_name(&self) -> &'static str {
        "Code"
    }

    fn fields_for(&self, kind: StorageKind) -> &'static [&'static str] {
        match kind {
            StorageKind::FlatJson => JSON_FIELDS,
            StorageKind::EmbeddedKv => KV_FIELDS,
        }
    }

    fn in_flight_suffixes(&self, kind: StorageKind) -> &'static [&'static str] {
        match kind {
            StorageKind::FlatJson => JSON_IN_FLIGHT,
            StorageKind::EmbeddedKv => KV_IN_FLIGHT,
        }
    }
}

pub fn strategy_for(variant: IdeVariant) -> &'static dyn IdeStrategy {
    match variant {
        IdeVariant::Cursor => &CursorStrategy,
        IdeVariant::VsCode => &VsCodeStrategy,
    }
}

/// The monitored set for one guardian run.
///
/// Embedded-KV stores are included only with database monitoring on. A
/// config-level `inFlightSuffixes` replaces the JSON stores' suffixes.
pub fn monitored_paths(config: &GuardianConfig, layout: &IdeLayout) -> Vec<MonitoredPath> {
    let strategy = strategy_for(config.selected_ide);
    strategy
        .paths_for(layout)
        .into_iter()
        .filter(|p| {
            p.kind != StorageKind::EmbeddedKv || config.feature_flags.enable_database_monitoring
        })
        .map(|p| match (&config.in_flight_suffixes, p.kind) {
            (Some(suffixes), StorageKind::FlatJson) => {
                p.with_in_flight_suffixes(suffixes.iter().cloned())
            }
            _ => p,
        })
        .collect()
}

/// Target fields that no store in `paths` carries. They are never enforced.
pub fn unenforced_fields(config: &GuardianConfig, paths: &[MonitoredPath]) -> Vec<String> {
    config
        .target_identity
        .iter()
        .filter(|(field, _)| !paths.iter().any(|p| p.fields.iter().any(|f| f == field)))
        .map(|(field, _)| field.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dg_common::{FeatureFlags, TargetIdentity};

    fn config(ide: IdeVariant, db: bool) -> GuardianConfig {
        GuardianConfig::new(
            TargetIdentity::new().with_field(fields::DEV_DEVICE_ID, "d"),
            ide,
        )
        .with_feature_flags(FeatureFlags {
            enable_database_monitoring: db,
            ..FeatureFlags::default()
        })
    }

    #[test]
    fn test_platform_roots() {
        let layout = IdeLayout::with_home("/home/u").with_platform(Platform::Linux);
        assert_eq!(
            CursorStrategy.global_storage_dir(&layout),
            PathBuf::from("/home/u/.config/Cursor/User/globalStorage")
        );
        let mac = IdeLayout::with_home("/Users/u").with_platform(Platform::MacOs);
        assert_eq!(
            VsCodeStrategy.global_storage_dir(&mac),
            PathBuf::from("/Users/u/Library/Application Support/Code/User/globalStorage")
        );
        let win = IdeLayout::with_home("C:/Users/u").with_platform(Platform::Windows);
        assert!(CursorStrategy
            .global_storage_dir(&win)
            .ends_with("AppData/Roaming/Cursor/User/globalStorage"));
    }

    #[test]
    fn test_database_flag_controls_kv_paths() {
        let layout = IdeLayout::with_home("/h");
        let with_db = monitored_paths(&config(IdeVariant::Cursor, true), &layout);
        assert_eq!(with_db.len(), 2);
        let without_db = monitored_paths(&config(IdeVariant::Cursor, false), &layout);
        assert_eq!(without_db.len(), 1);
        assert_eq!(without_db[0].kind, StorageKind::FlatJson);
    }

    #[test]
    fn test_suffix_override_applies_to_json_only() {
        let layout = IdeLayout::with_home("/h");
        let cfg = config(IdeVariant::VsCode, true).with_in_flight_suffixes(vec![".partial".into()]);
        let paths = monitored_paths(&cfg, &layout);
        let json = paths.iter().find(|p| p.kind == StorageKind::FlatJson).unwrap();
        assert_eq!(json.in_flight_suffixes, vec![".partial".to_string()]);
        let kv = paths.iter().find(|p| p.kind == StorageKind::EmbeddedKv).unwrap();
        assert_eq!(kv.in_flight_suffixes, vec!["-journal".to_string()]);
    }

    #[test]
    fn test_in_flight_candidates() {
        let p = MonitoredPath::new("/d/storage.json", StorageKind::FlatJson)
            .with_in_flight_suffixes([".tmp", ".vsctmp"]);
        assert_eq!(
            p.in_flight_candidates(),
            vec![
                PathBuf::from("/d/storage.json.tmp"),
                PathBuf::from("/d/storage.json.vsctmp")
            ]
        );
    }

    #[test]
    fn test_unenforced_fields_named() {
        let layout = IdeLayout::with_home("/h");
        let cfg = GuardianConfig::new(
            TargetIdentity::from_pairs([(fields::DEV_DEVICE_ID, "d"), ("id", "B")]),
            IdeVariant::Cursor,
        );
        let paths = monitored_paths(&cfg, &layout);
        assert_eq!(unenforced_fields(&cfg, &paths), vec!["id".to_string()]);
        assert!(unenforced_fields(&config(IdeVariant::VsCode, false), &paths).is_empty());
    }
}
