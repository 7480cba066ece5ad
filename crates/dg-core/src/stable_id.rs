//! Stable per-host identity seed and target-identity derivation.
//!
//! The seed is a SHA-256 over stable host facts, cached in a primary and a
//! backup file so it survives cleanup of either one. Each read heals the
//! other copy.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};

use dg_common::identity::fields;
use dg_common::TargetIdentity;

const PRIMARY_FILE: &str = "stable-id.cache";
const BACKUP_FILE: &str = "stable-id.backup";
const SEED_LEN: usize = 64;

/// Host facts that feed the seed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostFacts(BTreeMap<String, String>);

impl HostFacts {
    /// Facts of the running host.
    pub fn collect() -> Self {
        let mut facts = BTreeMap::new();
        facts.insert("os".to_string(), std::env::consts::OS.to_string());
        facts.insert("arch".to_string(), std::env::consts::ARCH.to_string());
        if let Some(host) = hostname() {
            facts.insert("hostname".to_string(), host);
        }
        if let Some(user) = std::env::var("USER")
            .ok()
            .or_else(|| std::env::var("USERNAME").ok())
        {
            facts.insert("user".to_string(), user);
        }
        if let Some(home) = dirs::home_dir() {
            facts.insert("home".to_string(), home.to_string_lossy().into_owned());
        }
        if let Ok(machine_id) = fs::read_to_string("/etc/machine-id") {
            facts.insert("machineId".to_string(), machine_id.trim().to_string());
        }
        HostFacts(facts)
    }

    pub fn from_pairs<K: Into<String>, V: Into<String>>(
        pairs: impl IntoIterator<Item = (K, V)>,
    ) -> Self {
        HostFacts(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    fn digest(&self, extra: Option<&str>) -> String {
        let mut hasher = Sha256::new();
        for (key, value) in &self.0 {
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
            hasher.update(b"\n");
        }
        if let Some(extra) = extra {
            hasher.update(b"salt=");
            hasher.update(extra.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

fn hostname() -> Option<String> {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::env::var("COMPUTERNAME").ok())
        .or_else(|| fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
}

/// Where a seed came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SeedSource {
    PrimaryCache,
    /// Primary cache was missing or corrupt and was restored from the backup.
    BackupCache,
    Generated,
    Forced,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StableId {
    pub seed: String,
    pub source: SeedSource,
}

#[derive(Debug, Clone)]
pub struct StableIdGenerator {
    cache_dir: PathBuf,
    facts: HostFacts,
}

impl StableIdGenerator {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        StableIdGenerator {
            cache_dir: cache_dir.into(),
            facts: HostFacts::collect(),
        }
    }

    /// `~/.devguard`.
    pub fn default_cache_dir() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".devguard"))
    }

    pub fn with_facts(mut self, facts: HostFacts) -> Self {
        self.facts = facts;
        self
    }

    pub fn primary_path(&self) -> PathBuf {
        self.cache_dir.join(PRIMARY_FILE)
    }

    pub fn backup_path(&self) -> PathBuf {
        self.cache_dir.join(BACKUP_FILE)
    }

    /// Cached seed if present, else a fresh one from host facts.
    ///
    /// Cache write failures are logged and otherwise ignored; the seed is
    /// still returned.
    pub fn get_or_create(&self) -> StableId {
        if let Some(seed) = read_seed(&self.primary_path()) {
            self.write_seed(&self.backup_path(), &seed);
            return StableId {
                seed,
                source: SeedSource::PrimaryCache,
            };
        }
        if let Some(seed) = read_seed(&self.backup_path()) {
            self.write_seed(&self.primary_path(), &seed);
            return StableId {
                seed,
                source: SeedSource::BackupCache,
            };
        }
        let seed = self.facts.digest(None);
        self.store(&seed);
        StableId {
            seed,
            source: SeedSource::Generated,
        }
    }

    /// Discard the cache and mint a seed that differs from any earlier one.
    pub fn force_new(&self) -> StableId {
        self.clear();
        let salt = uuid::Uuid::new_v4().to_string();
        let seed = self.facts.digest(Some(&salt));
        self.store(&seed);
        StableId {
            seed,
            source: SeedSource::Forced,
        }
    }

    /// Remove both cache files.
    pub fn clear(&self) {
        for path in [self.primary_path(), self.backup_path()] {
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "failed to remove identity cache");
                }
            }
        }
    }

    fn store(&self, seed: &str) {
        self.write_seed(&self.primary_path(), seed);
        self.write_seed(&self.backup_path(), seed);
    }

    fn write_seed(&self, path: &Path, seed: &str) {
        let result = fs::create_dir_all(&self.cache_dir).and_then(|_| fs::write(path, seed));
        if let Err(e) = result {
            tracing::warn!(path = %path.display(), error = %e, "failed to write identity cache");
        }
    }
}

/// A cache file holds exactly 64 hex characters; anything else is corrupt.
fn read_seed(path: &Path) -> Option<String> {
    let content = fs::read_to_string(path).ok()?;
    let seed = content.trim();
    if seed.len() == SEED_LEN && seed.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(seed.to_ascii_lowercase())
    } else {
        None
    }
}

fn field_digest(seed: &str, field: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update(b":");
    hasher.update(field.as_bytes());
    hasher.finalize().into()
}

fn field_uuid(seed: &str, field: &str) -> uuid::Uuid {
    let digest = field_digest(seed, field);
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    uuid::Builder::from_random_bytes(bytes).into_uuid()
}

/// Expand a seed into the identity values the IDE stores.
///
/// Deterministic: the same seed always yields the same identity.
pub fn derive_target_identity(seed: &str) -> TargetIdentity {
    let upper_uuid = field_uuid(seed, fields::SQM_ID).to_string().to_uppercase();
    TargetIdentity::new()
        .with_field(fields::MACHINE_ID, hex::encode(field_digest(seed, fields::MACHINE_ID)))
        .with_field(
            fields::MAC_MACHINE_ID,
            hex::encode(field_digest(seed, fields::MAC_MACHINE_ID)),
        )
        .with_field(fields::DEV_DEVICE_ID, field_uuid(seed, fields::DEV_DEVICE_ID).to_string())
        .with_field(fields::SQM_ID, format!("{{{}}}", upper_uuid))
        .with_field(
            fields::SERVICE_MACHINE_ID,
            field_uuid(seed, fields::SERVICE_MACHINE_ID).to_string(),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn generator(dir: &Path) -> StableIdGenerator {
        StableIdGenerator::new(dir).with_facts(HostFacts::from_pairs([
            ("os", "linux"),
            ("hostname", "box"),
        ]))
    }

    #[test]
    fn test_generate_then_cached() {
        let dir = tempdir().unwrap();
        let gen = generator(dir.path());
        let first = gen.get_or_create();
        assert_eq!(first.source, SeedSource::Generated);
        assert_eq!(first.seed.len(), 64);
        let second = gen.get_or_create();
        assert_eq!(second.source, SeedSource::PrimaryCache);
        assert_eq!(second.seed, first.seed);
    }

    #[test]
    fn test_backup_heals_primary() {
        let dir = tempdir().unwrap();
        let gen = generator(dir.path());
        let original = gen.get_or_create().seed;
        fs::write(gen.primary_path(), "corrupt").unwrap();
        let healed = gen.get_or_create();
        assert_eq!(healed.source, SeedSource::BackupCache);
        assert_eq!(healed.seed, original);
        assert_eq!(fs::read_to_string(gen.primary_path()).unwrap(), original);
    }

    #[test]
    fn test_primary_heals_backup() {
        let dir = tempdir().unwrap();
        let gen = generator(dir.path());
        let original = gen.get_or_create().seed;
        fs::remove_file(gen.backup_path()).unwrap();
        assert_eq!(gen.get_or_create().source, SeedSource::PrimaryCache);
        assert_eq!(fs::read_to_string(gen.backup_path()).unwrap(), original);
    }

    #[test]
    fn test_force_new_differs() {
        let dir = tempdir().unwrap();
        let gen = generator(dir.path());
        let original = gen.get_or_create().seed;
        let forced = gen.force_new();
        assert_eq!(forced.source, SeedSource::Forced);
        assert_ne!(forced.seed, original);
        assert_eq!(gen.get_or_create().seed, forced.seed);
    }

    #[test]
    fn test_same_facts_same_seed() {
        let a = tempdir().unwrap();
        let b = tempdir().unwrap();
        assert_eq!(
            generator(a.path()).get_or_create().seed,
            generator(b.path()).get_or_create().seed
        );
    }

    #[test]
    fn test_derived_identity_formats() {
        let seed = "a".repeat(64);
        let identity = derive_target_identity(&seed);
        assert_eq!(identity.len(), 5);
        let machine = identity.get(fields::MACHINE_ID).unwrap();
        assert_eq!(machine.len(), 64);
        assert!(machine.chars().all(|c| c.is_ascii_hexdigit()));
        let dev = uuid::Uuid::parse_str(identity.get(fields::DEV_DEVICE_ID).unwrap()).unwrap();
        assert_eq!(dev.get_version_num(), 4);
        let sqm = identity.get(fields::SQM_ID).unwrap();
        assert!(sqm.starts_with('{') && sqm.ends_with('}'));
        assert_eq!(sqm, sqm.to_uppercase());
        assert!(identity.validate().is_ok());
        assert_eq!(derive_target_identity(&seed), identity);
    }
}
