//! Identity field model.
//!
//! A [`TargetIdentity`] is the ordered set of identity fields the guardian
//! pins. Each monitored store declares which of these fields it carries; a
//! correction writes exactly that subset and nothing else.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// Raw identity values read from, or written to, one store.
pub type IdentityFields = BTreeMap<String, String>;

/// Well-known identity field names used by the supported IDE variants.
pub mod fields {
    pub const MACHINE_ID: &str = "telemetry.machineId";
    pub const MAC_MACHINE_ID: &str = "telemetry.macMachineId";
    pub const DEV_DEVICE_ID: &str = "telemetry.devDeviceId";
    pub const SQM_ID: &str = "telemetry.sqmId";
    pub const SERVICE_MACHINE_ID: &str = "storage.serviceMachineId";

    /// All fields the built-in strategies know about.
    pub const ALL: &[&str] = &[
        MACHINE_ID,
        MAC_MACHINE_ID,
        DEV_DEVICE_ID,
        SQM_ID,
        SERVICE_MACHINE_ID,
    ];
}

/// The identity values the guardian pins, keyed by field name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct TargetIdentity(BTreeMap<String, String>);

impl TargetIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(field, value)` pairs.
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        TargetIdentity(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn with_field(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }

    /// The target values for `declared` fields that this identity defines.
    ///
    /// Declared fields the identity does not define are skipped: a store is
    /// only ever asked to hold values the host actually pinned.
    pub fn subset<S: AsRef<str>>(&self, declared: &[S]) -> IdentityFields {
        declared
            .iter()
            .filter_map(|f| {
                let f = f.as_ref();
                self.0.get(f).map(|v| (f.to_string(), v.clone()))
            })
            .collect()
    }

    /// Reject empty identities and empty values.
    pub fn validate(&self) -> Result<()> {
        if self.0.is_empty() {
            return Err(Error::InvalidIdentity(
                "targetIdentity must define at least one field".to_string(),
            ));
        }
        for (field, value) in &self.0 {
            if field.trim().is_empty() {
                return Err(Error::InvalidIdentity("empty field name".to_string()));
            }
            if value.trim().is_empty() {
                return Err(Error::InvalidIdentity(format!(
                    "field '{}' has an empty value",
                    field
                )));
            }
        }
        Ok(())
    }

    /// Shortened values for status output.
    pub fn summary(&self) -> BTreeMap<String, String> {
        self.0
            .iter()
            .map(|(k, v)| (k.clone(), shorten(v, 12)))
            .collect()
    }
}

fn shorten(value: &str, keep: usize) -> String {
    if value.chars().count() <= keep {
        return value.to_string();
    }
    let head: String = value.chars().take(keep).collect();
    format!("{}...", head)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subset_only_declared_and_defined() {
        let target = TargetIdentity::from_pairs([
            (fields::DEV_DEVICE_ID, "dev-1"),
            (fields::MACHINE_ID, "machine-1"),
        ]);
        let declared = [fields::DEV_DEVICE_ID, fields::SQM_ID];
        let subset = target.subset(&declared);
        assert_eq!(subset.len(), 1);
        assert_eq!(subset.get(fields::DEV_DEVICE_ID).map(String::as_str), Some("dev-1"));
    }

    #[test]
    fn test_validate_rejects_empty() {
        assert!(TargetIdentity::new().validate().is_err());
        let blank = TargetIdentity::new().with_field(fields::DEV_DEVICE_ID, "  ");
        assert!(matches!(blank.validate(), Err(Error::InvalidIdentity(_))));
        let ok = TargetIdentity::new().with_field(fields::DEV_DEVICE_ID, "x");
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_summary_truncates_long_values() {
        let target = TargetIdentity::new()
            .with_field("short", "abc")
            .with_field("long", "0123456789abcdef0123");
        let summary = target.summary();
        assert_eq!(summary["short"], "abc");
        assert_eq!(summary["long"], "0123456789ab...");
    }

    #[test]
    fn test_serializes_as_plain_object() {
        let target = TargetIdentity::new().with_field("b", "2").with_field("a", "1");
        let json = serde_json::to_string(&target).unwrap();
        assert_eq!(json, r#"{"a":"1","b":"2"}"#);
    }
}
