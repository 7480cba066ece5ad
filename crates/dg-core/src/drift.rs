//! Drift classification.
//!
//! Compares what a store holds against the pinned identity, restricted to
//! the fields that store declares. An in-flight IDE replace (its temp
//! sibling is present) suppresses correction for that tick.

use std::path::{Path, PathBuf};

use crate::store::{IdentityStore, StoreError};
use crate::variant::MonitoredPath;
use dg_common::{IdentityFields, TargetIdentity};

/// One declared field whose stored value differs from the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDelta {
    pub field: String,
    /// `None` when the store lacks the field.
    pub current: Option<String>,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Every declared field already holds its target value.
    NoOp,
    /// At least one declared field differs.
    Drift { deltas: Vec<FieldDelta> },
    /// Drift observed while the IDE's own replace is under way.
    InFlightReplace {
        artifact: PathBuf,
        deltas: Vec<FieldDelta>,
    },
}

impl Classification {
    pub fn deltas(&self) -> &[FieldDelta] {
        match self {
            Classification::NoOp => &[],
            Classification::Drift { deltas } | Classification::InFlightReplace { deltas, .. } => {
                deltas
            }
        }
    }
}

/// Declared fields (that the target defines) whose current value differs.
pub fn deltas(
    current: &IdentityFields,
    target: &TargetIdentity,
    declared: &[String],
) -> Vec<FieldDelta> {
    target
        .subset(declared)
        .into_iter()
        .filter(|(field, want)| current.get(field) != Some(want))
        .map(|(field, want)| FieldDelta {
            current: current.get(&field).cloned(),
            field,
            target: want,
        })
        .collect()
}

/// Classify one observation. `in_flight` is the IDE temp sibling, if any.
pub fn classify(
    current: &IdentityFields,
    target: &TargetIdentity,
    declared: &[String],
    in_flight: Option<&Path>,
) -> Classification {
    let deltas = deltas(current, target, declared);
    if deltas.is_empty() {
        return Classification::NoOp;
    }
    match in_flight {
        Some(artifact) => Classification::InFlightReplace {
            artifact: artifact.to_path_buf(),
            deltas,
        },
        None => Classification::Drift { deltas },
    }
}

/// First existing in-flight artifact next to the store.
pub fn find_in_flight(path: &MonitoredPath) -> Option<PathBuf> {
    path.in_flight_candidates()
        .into_iter()
        .find(|candidate| candidate.exists())
}

/// A store read plus its classification.
#[derive(Debug, Clone)]
pub struct Observation {
    pub current: IdentityFields,
    pub classification: Classification,
}

/// Reads stores and classifies them against one target identity.
#[derive(Debug, Clone)]
pub struct DriftDetector {
    target: TargetIdentity,
}

impl DriftDetector {
    pub fn new(target: TargetIdentity) -> Self {
        DriftDetector { target }
    }

    pub fn target(&self) -> &TargetIdentity {
        &self.target
    }

    /// Values a correction of `path` writes.
    pub fn expected(&self, path: &MonitoredPath) -> IdentityFields {
        self.target.subset(&path.fields)
    }

    /// Read the store and scan for in-flight siblings.
    pub fn observe(
        &self,
        path: &MonitoredPath,
        store: &dyn IdentityStore,
    ) -> Result<Observation, StoreError> {
        let current = store.read()?;
        let in_flight = find_in_flight(path);
        let classification = classify(&current, &self.target, &path.fields, in_flight.as_deref());
        Ok(Observation {
            current,
            classification,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variant::StorageKind;
    use dg_common::identity::fields;

    fn target() -> TargetIdentity {
        TargetIdentity::from_pairs([(fields::DEV_DEVICE_ID, "dev"), (fields::MACHINE_ID, "mach")])
    }

    fn current(pairs: &[(&str, &str)]) -> IdentityFields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn declared(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_noop_when_all_declared_match() {
        let cur = current(&[(fields::DEV_DEVICE_ID, "dev"), (fields::MACHINE_ID, "other")]);
        // machineId is not declared, so its mismatch is irrelevant.
        let c = classify(&cur, &target(), &declared(&[fields::DEV_DEVICE_ID]), None);
        assert_eq!(c, Classification::NoOp);
    }

    #[test]
    fn test_drift_lists_each_differing_field() {
        let cur = current(&[(fields::DEV_DEVICE_ID, "bad")]);
        let c = classify(
            &cur,
            &target(),
            &declared(&[fields::DEV_DEVICE_ID, fields::MACHINE_ID]),
            None,
        );
        let deltas = c.deltas();
        assert_eq!(deltas.len(), 2);
        assert_eq!(deltas[0].field, fields::DEV_DEVICE_ID);
        assert_eq!(deltas[0].current.as_deref(), Some("bad"));
        assert_eq!(deltas[1].current, None);
        assert!(matches!(c, Classification::Drift { .. }));
    }

    #[test]
    fn test_declared_field_without_target_ignored() {
        let cur = current(&[]);
        let c = classify(&cur, &target(), &declared(&[fields::SQM_ID]), None);
        assert_eq!(c, Classification::NoOp);
    }

    #[test]
    fn test_in_flight_only_when_drifted() {
        let artifact = Path::new("/d/storage.json.tmp");
        let ok = current(&[(fields::DEV_DEVICE_ID, "dev")]);
        let c = classify(&ok, &target(), &declared(&[fields::DEV_DEVICE_ID]), Some(artifact));
        assert_eq!(c, Classification::NoOp);

        let bad = current(&[(fields::DEV_DEVICE_ID, "x")]);
        let c = classify(&bad, &target(), &declared(&[fields::DEV_DEVICE_ID]), Some(artifact));
        assert!(matches!(c, Classification::InFlightReplace { .. }));
    }

    #[test]
    fn test_find_in_flight_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mp = MonitoredPath::new(dir.path().join("storage.json"), StorageKind::FlatJson)
            .with_in_flight_suffixes([".tmp", ".vsctmp"]);
        assert_eq!(find_in_flight(&mp), None);
        std::fs::write(dir.path().join("storage.json.vsctmp"), "{}").unwrap();
        assert_eq!(
            find_in_flight(&mp),
            Some(dir.path().join("storage.json.vsctmp"))
        );
    }
}
