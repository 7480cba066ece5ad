//! Typed guardian configuration.
//!
//! [`GuardianConfig`] is the only state shared between a host and a
//! standalone guardian. It is serialized to the channel config file and is
//! the sole source of truth the standalone process trusts, so it is strictly
//! validated on load: missing or wrong-typed fields are rejected instead of
//! defaulted.

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};
use crate::id::ProcessId;
use crate::identity::TargetIdentity;

/// Supported IDE variants. Each has its own identity-storage layout.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum IdeVariant {
    /// Cursor editor.
    Cursor,
    /// Visual Studio Code.
    #[serde(rename = "vscode")]
    #[value(name = "vscode")]
    VsCode,
}

impl IdeVariant {
    pub const ALL: [IdeVariant; 2] = [IdeVariant::Cursor, IdeVariant::VsCode];

    pub fn as_str(&self) -> &'static str {
        match self {
            IdeVariant::Cursor => "cursor",
            IdeVariant::VsCode => "vscode",
        }
    }
}

impl fmt::Display for IdeVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for IdeVariant {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "cursor" => Ok(IdeVariant::Cursor),
            "vscode" | "code" | "vs-code" => Ok(IdeVariant::VsCode),
            other => Err(Error::Config(format!("unknown IDE variant: {}", other))),
        }
    }
}

/// Optional guardian behaviors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlags {
    /// Remove backup copies of monitored stores so the IDE cannot restore from them.
    pub enable_backup_monitoring: bool,
    /// Include embedded key/value databases in the monitored set.
    pub enable_database_monitoring: bool,
    /// Mark corrected flat-JSON stores read-only between corrections.
    pub enable_enhanced_protection: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        FeatureFlags {
            enable_backup_monitoring: true,
            enable_database_monitoring: true,
            enable_enhanced_protection: true,
        }
    }
}

/// Execution mode of a guardian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum GuardianMode {
    /// Enforcement thread inside the host process; stops with the host.
    InProcess,
    /// Detached OS process that outlives the host.
    Standalone,
}

impl fmt::Display for GuardianMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardianMode::InProcess => write!(f, "in-process"),
            GuardianMode::Standalone => write!(f, "standalone"),
        }
    }
}

/// Guardian run configuration (the channel config file).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GuardianConfig {
    /// Field name → pinned value.
    pub target_identity: TargetIdentity,
    /// IDE whose stores are monitored.
    #[serde(rename = "selectedIDE")]
    pub selected_ide: IdeVariant,
    /// Optional behaviors.
    pub feature_flags: FeatureFlags,
    /// When the host created this config.
    pub started_at: DateTime<Utc>,
    /// Overrides the IDE's temp-file suffixes used to detect an in-flight
    /// atomic replace (e.g. `[".tmp", ".vsctmp"]`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_flight_suffixes: Option<Vec<String>>,
}

impl GuardianConfig {
    /// New config with all features enabled, stamped now.
    pub fn new(target_identity: TargetIdentity, selected_ide: IdeVariant) -> Self {
        GuardianConfig {
            target_identity,
            selected_ide,
            feature_flags: FeatureFlags::default(),
            started_at: Utc::now(),
            in_flight_suffixes: None,
        }
    }

    pub fn with_feature_flags(mut self, flags: FeatureFlags) -> Self {
        self.feature_flags = flags;
        self
    }

    pub fn with_in_flight_suffixes(mut self, suffixes: Vec<String>) -> Self {
        self.in_flight_suffixes = Some(suffixes);
        self
    }

    /// Parse and validate a config document.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: GuardianConfig =
            serde_json::from_str(s).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Semantic validation beyond what the types enforce.
    pub fn validate(&self) -> Result<()> {
        self.target_identity
            .validate()
            .map_err(|e| Error::Config(e.to_string()))?;
        if let Some(suffixes) = &self.in_flight_suffixes {
            if suffixes.iter().any(|s| s.is_empty() || s.contains('/')) {
                return Err(Error::Config(
                    "inFlightSuffixes entries must be non-empty file-name suffixes".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Whether `other` describes a different run (new target or IDE).
    pub fn differs_in_target(&self, other: &GuardianConfig) -> bool {
        self.target_identity != other.target_identity
            || self.selected_ide != other.selected_ide
            || self.feature_flags != other.feature_flags
            || self.in_flight_suffixes != other.in_flight_suffixes
    }
}

/// A running guardian as seen by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessHandle {
    pub pid: ProcessId,
    pub mode: GuardianMode,
    pub started_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::fields;

    fn sample_json() -> &'static str {
        r#"{
            "targetIdentity": {"telemetry.devDeviceId": "abc"},
            "selectedIDE": "cursor",
            "featureFlags": {
                "enableBackupMonitoring": true,
                "enableDatabaseMonitoring": false,
                "enableEnhancedProtection": true
            },
            "startedAt": "2026-01-15T14:30:22Z"
        }"#
    }

    #[test]
    fn test_parse_valid_config() {
        let config = GuardianConfig::from_json_str(sample_json()).unwrap();
        assert_eq!(config.selected_ide, IdeVariant::Cursor);
        assert_eq!(config.target_identity.get(fields::DEV_DEVICE_ID), Some("abc"));
        assert!(!config.feature_flags.enable_database_monitoring);
        assert!(config.in_flight_suffixes.is_none());
    }

    #[test]
    fn test_missing_feature_flags_rejected() {
        let json = r#"{
            "targetIdentity": {"telemetry.devDeviceId": "abc"},
            "selectedIDE": "cursor",
            "startedAt": "2026-01-15T14:30:22Z"
        }"#;
        assert!(matches!(GuardianConfig::from_json_str(json), Err(Error::Config(_))));
    }

    #[test]
    fn test_wrong_typed_flag_rejected() {
        let json = sample_json().replace(
            "\"enableBackupMonitoring\": true",
            "\"enableBackupMonitoring\": \"yes\"",
        );
        assert!(GuardianConfig::from_json_str(&json).is_err());
    }

    #[test]
    fn test_unknown_ide_rejected() {
        let json = sample_json().replace("\"cursor\"", "\"notepad\"");
        assert!(GuardianConfig::from_json_str(&json).is_err());
    }

    #[test]
    fn test_empty_identity_rejected() {
        let json = sample_json().replace(r#"{"telemetry.devDeviceId": "abc"}"#, "{}");
        assert!(matches!(GuardianConfig::from_json_str(&json), Err(Error::Config(_))));
    }

    #[test]
    fn test_round_trip_uses_wire_names() {
        let config = GuardianConfig::new(
            TargetIdentity::new().with_field(fields::MACHINE_ID, "m"),
            IdeVariant::VsCode,
        );
        let json = config.to_json_pretty().unwrap();
        assert!(json.contains("\"selectedIDE\": \"vscode\""));
        assert!(json.contains("\"enableEnhancedProtection\""));
        assert!(!json.contains("inFlightSuffixes"));
        let back = GuardianConfig::from_json_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_ide_variant_from_str() {
        assert_eq!("Cursor".parse::<IdeVariant>().unwrap(), IdeVariant::Cursor);
        assert_eq!("code".parse::<IdeVariant>().unwrap(), IdeVariant::VsCode);
        assert!("emacs".parse::<IdeVariant>().is_err());
    }

    #[test]
    fn test_mode_serialization() {
        assert_eq!(
            serde_json::to_string(&GuardianMode::InProcess).unwrap(),
            "\"in-process\""
        );
        assert_eq!(GuardianMode::Standalone.to_string(), "standalone");
    }
}
