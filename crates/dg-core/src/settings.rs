//! Ambient guardian settings.
//!
//! Resolution order for each setting: CLI flag → `DG_*` environment
//! variable → built-in default. The run configuration itself
//! ([`dg_common::GuardianConfig`]) travels through the channel and is not
//! resolved here.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::channel::{ChannelPaths, ENV_CHANNEL_DIR};
use crate::enforce::LoopSettings;
use crate::license::{ActivationCacheGate, ENV_ACTIVATION_FILE};
use crate::store::RetryPolicy;
use crate::supervisor::SupervisorSettings;
use crate::variant::IdeLayout;
use dg_common::{Error, Result};

pub const ENV_POLL_INTERVAL_MS: &str = "DG_POLL_INTERVAL_MS";
pub const ENV_RETRY_ATTEMPTS: &str = "DG_RETRY_ATTEMPTS";
pub const ENV_STOP_TIMEOUT_MS: &str = "DG_STOP_TIMEOUT_MS";
pub const ENV_STARTUP_GRACE_MS: &str = "DG_STARTUP_GRACE_MS";
pub const ENV_IDE_HOME: &str = "DG_IDE_HOME";
pub const ENV_NO_WATCH: &str = "DG_NO_WATCH";

const DEFAULT_POLL_INTERVAL_MS: u64 = 2_000;
const DEFAULT_STOP_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_STARTUP_GRACE_MS: u64 = 300;
const MIN_POLL_INTERVAL_MS: u64 = 10;

/// Where a setting's value came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingSource {
    CliArgument,
    Environment,
    #[default]
    BuiltinDefault,
}

/// Values given on the command line. `None` defers to the environment.
#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub poll_interval_ms: Option<u64>,
    pub retry_attempts: Option<u32>,
    pub stop_timeout_ms: Option<u64>,
    pub channel_dir: Option<PathBuf>,
    pub activation_file: Option<PathBuf>,
    pub ide_home: Option<PathBuf>,
    pub no_watch: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardianSettings {
    pub poll_interval_ms: u64,
    pub retry_attempts: u32,
    pub stop_timeout_ms: u64,
    pub startup_grace_ms: u64,
    pub channel_dir: Option<PathBuf>,
    pub activation_file: Option<PathBuf>,
    pub ide_home: Option<PathBuf>,
    pub watch_changes: bool,
    pub poll_interval_source: SettingSource,
    pub channel_dir_source: SettingSource,
}

impl Default for GuardianSettings {
    fn default() -> Self {
        GuardianSettings {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            retry_attempts: RetryPolicy::default().max_attempts,
            stop_timeout_ms: DEFAULT_STOP_TIMEOUT_MS,
            startup_grace_ms: DEFAULT_STARTUP_GRACE_MS,
            channel_dir: None,
            activation_file: None,
            ide_home: None,
            watch_changes: true,
            poll_interval_source: SettingSource::BuiltinDefault,
            channel_dir_source: SettingSource::BuiltinDefault,
        }
    }
}

impl GuardianSettings {
    /// Resolve from CLI overrides and the process environment.
    pub fn resolve(overrides: &SettingsOverrides) -> Result<Self> {
        Self::resolve_with(overrides, |key| std::env::var(key).ok())
    }

    /// Resolve with an explicit environment lookup.
    pub fn resolve_with(
        overrides: &SettingsOverrides,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let lookup = |key: &str| env(key).filter(|v| !v.trim().is_empty());
        let mut settings = GuardianSettings::default();

        if let Some(ms) = overrides.poll_interval_ms {
            settings.poll_interval_ms = ms;
            settings.poll_interval_source = SettingSource::CliArgument;
        } else if let Some(raw) = lookup(ENV_POLL_INTERVAL_MS) {
            settings.poll_interval_ms = parse_number(ENV_POLL_INTERVAL_MS, &raw)?;
            settings.poll_interval_source = SettingSource::Environment;
        }
        if settings.poll_interval_ms < MIN_POLL_INTERVAL_MS {
            return Err(Error::Config(format!(
                "poll interval must be at least {}ms",
                MIN_POLL_INTERVAL_MS
            )));
        }

        settings.retry_attempts = match overrides.retry_attempts {
            Some(n) => n,
            None => match lookup(ENV_RETRY_ATTEMPTS) {
                Some(raw) => parse_number(ENV_RETRY_ATTEMPTS, &raw)?,
                None => settings.retry_attempts,
            },
        }
        .max(1);

        settings.stop_timeout_ms = match overrides.stop_timeout_ms {
            Some(ms) => ms,
            None => match lookup(ENV_STOP_TIMEOUT_MS) {
                Some(raw) => parse_number(ENV_STOP_TIMEOUT_MS, &raw)?,
                None => settings.stop_timeout_ms,
            },
        };

        if let Some(raw) = lookup(ENV_STARTUP_GRACE_MS) {
            settings.startup_grace_ms = parse_number(ENV_STARTUP_GRACE_MS, &raw)?;
        }

        if let Some(dir) = &overrides.channel_dir {
            settings.channel_dir = Some(dir.clone());
            settings.channel_dir_source = SettingSource::CliArgument;
        } else if let Some(dir) = lookup(ENV_CHANNEL_DIR) {
            settings.channel_dir = Some(PathBuf::from(dir));
            settings.channel_dir_source = SettingSource::Environment;
        }

        settings.activation_file = overrides
            .activation_file
            .clone()
            .or_else(|| lookup(ENV_ACTIVATION_FILE).map(PathBuf::from));
        settings.ide_home = overrides
            .ide_home
            .clone()
            .or_else(|| lookup(ENV_IDE_HOME).map(PathBuf::from));
        settings.watch_changes = !(overrides.no_watch || lookup(ENV_NO_WATCH).is_some_and(|v| truthy(&v)));

        Ok(settings)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn channel(&self) -> ChannelPaths {
        match &self.channel_dir {
            Some(dir) => ChannelPaths::new(dir),
            None => ChannelPaths::default_location(),
        }
    }

    pub fn ide_layout(&self) -> Result<IdeLayout> {
        match &self.ide_home {
            Some(home) => Ok(IdeLayout::with_home(home)),
            None => IdeLayout::detect().ok_or_else(|| {
                Error::Config(format!(
                    "cannot determine home directory; set {}",
                    ENV_IDE_HOME
                ))
            }),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts,
            ..RetryPolicy::default()
        }
    }

    pub fn loop_settings(&self) -> Result<LoopSettings> {
        let mut settings = LoopSettings::new(self.ide_layout()?);
        settings.poll_interval = self.poll_interval();
        settings.retry = self.retry_policy();
        settings.watch_changes = self.watch_changes;
        Ok(settings)
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            stop_timeout: Duration::from_millis(self.stop_timeout_ms),
            startup_grace: Duration::from_millis(self.startup_grace_ms),
            ..SupervisorSettings::default()
        }
    }

    pub fn activation_gate(&self) -> Result<ActivationCacheGate> {
        self.activation_file
            .clone()
            .or_else(ActivationCacheGate::default_path)
            .map(ActivationCacheGate::new)
            .ok_or_else(|| {
                Error::Config(format!(
                    "cannot locate activation cache; set {}",
                    ENV_ACTIVATION_FILE
                ))
            })
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| Error::Config(format!("{} must be a non-negative integer, got '{}'", key, raw)))
}

fn truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let s = GuardianSettings::resolve_with(&SettingsOverrides::default(), env_of(&[])).unwrap();
        assert_eq!(s.poll_interval(), Duration::from_secs(2));
        assert_eq!(s.retry_attempts, 3);
        assert_eq!(s.poll_interval_source, SettingSource::BuiltinDefault);
        assert!(s.watch_changes);
        assert!(s.channel().dir().ends_with("devguard"));
    }

    #[test]
    fn test_cli_beats_env() {
        let overrides = SettingsOverrides {
            poll_interval_ms: Some(500),
            channel_dir: Some(PathBuf::from("/cli/chan")),
            ..Default::default()
        };
        let env = env_of(&[
            (ENV_POLL_INTERVAL_MS, "900"),
            (ENV_CHANNEL_DIR, "/env/chan"),
            (ENV_RETRY_ATTEMPTS, "5"),
        ]);
        let s = GuardianSettings::resolve_with(&overrides, env).unwrap();
        assert_eq!(s.poll_interval_ms, 500);
        assert_eq!(s.poll_interval_source, SettingSource::CliArgument);
        assert_eq!(s.channel().dir(), std::path::Path::new("/cli/chan"));
        assert_eq!(s.retry_attempts, 5);
    }

    #[test]
    fn test_env_used_without_cli() {
        let env = env_of(&[
            (ENV_POLL_INTERVAL_MS, "250"),
            (ENV_CHANNEL_DIR, "/env/chan"),
            (ENV_NO_WATCH, "1"),
            (ENV_IDE_HOME, "/home/test"),
        ]);
        let s = GuardianSettings::resolve_with(&SettingsOverrides::default(), env).unwrap();
        assert_eq!(s.poll_interval_ms, 250);
        assert_eq!(s.channel_dir_source, SettingSource::Environment);
        assert!(!s.watch_changes);
        assert_eq!(
            s.ide_layout().unwrap().home,
            PathBuf::from("/home/test")
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        let env = env_of(&[(ENV_POLL_INTERVAL_MS, "fast")]);
        assert!(GuardianSettings::resolve_with(&SettingsOverrides::default(), env).is_err());
        let too_fast = SettingsOverrides {
            poll_interval_ms: Some(1),
            ..Default::default()
        };
        assert!(GuardianSettings::resolve_with(&too_fast, env_of(&[])).is_err());
    }

    #[test]
    fn test_retry_attempts_floor() {
        let overrides = SettingsOverrides {
            retry_attempts: Some(0),
            ..Default::default()
        };
        let s = GuardianSettings::resolve_with(&overrides, env_of(&[])).unwrap();
        assert_eq!(s.retry_policy().max_attempts, 1);
    }
}
