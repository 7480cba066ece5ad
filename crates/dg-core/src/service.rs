//! Host-facing guardian API.
//!
//! A host owns one [`GuardianService`]. Every report it returns serializes to
//! camelCase JSON so it can be handed to a UI unchanged.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

use crate::channel::{ChannelLogSink, RECENT_LOG_LINES};
use crate::enforce::{LoopState, LoopStats};
use crate::inspector;
use crate::license::{LicenseGate, ENV_ACTIVATION_FILE};
use crate::settings::{
    GuardianSettings, ENV_IDE_HOME, ENV_NO_WATCH, ENV_POLL_INTERVAL_MS, ENV_RETRY_ATTEMPTS,
};
use crate::store::DiskStoreOpener;
use crate::supervisor::{
    DetachedLauncher, InProcessDeps, ProcessSupervisor, StandaloneStatus, StopOutcome,
    SupervisorStatus,
};
use dg_common::{
    Error, GuardianConfig, GuardianMode, IdeVariant, ProcessId, Result, TargetIdentity,
};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartReport {
    pub success: bool,
    pub mode: GuardianMode,
    pub target_identity_summary: BTreeMap<String, String>,
    pub pid: ProcessId,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopReport {
    pub success: bool,
    pub in_process_stopped: bool,
    pub standalone: StopOutcome,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InProcessSummary {
    pub is_guarding: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loop_state: Option<LoopState>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelPathsReport {
    pub config_path: PathBuf,
    pub pid_path: PathBuf,
    pub log_path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardianStatus {
    pub is_guarding: bool,
    pub mode: Option<GuardianMode>,
    #[serde(rename = "selectedIDE")]
    pub selected_ide: Option<IdeVariant>,
    /// The pinned identity, values in full.
    pub target_identity: Option<TargetIdentity>,
    /// Shortened values, for display.
    pub target_identity_summary: Option<BTreeMap<String, String>>,
    pub standalone: StandaloneStatus,
    pub in_process: InProcessSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<LoopStats>,
    pub recent_log: Vec<String>,
    pub paths: ChannelPathsReport,
}

pub struct GuardianService {
    supervisor: ProcessSupervisor,
}

impl GuardianService {
    /// Service for the running executable with the system process inspector.
    pub fn new(settings: &GuardianSettings) -> Result<Self> {
        let gate: Arc<dyn LicenseGate> = Arc::new(settings.activation_gate()?);
        Self::with_gate(settings, gate)
    }

    /// Like [`GuardianService::new`], with the host supplying the in-process
    /// license gate.
    pub fn with_gate(settings: &GuardianSettings, gate: Arc<dyn LicenseGate>) -> Result<Self> {
        let channel = settings.channel();
        let deps = InProcessDeps {
            loop_settings: settings.loop_settings()?,
            opener: Arc::new(DiskStoreOpener),
            gate,
            sink: Arc::new(ChannelLogSink::new(channel.clone())),
        };
        let launcher = worker_launcher(settings)?;
        let supervisor = ProcessSupervisor::new(
            channel,
            inspector::system_inspector(),
            Arc::new(launcher),
            deps,
        )
        .with_settings(settings.supervisor_settings());
        Ok(Self::from_supervisor(supervisor))
    }

    pub fn from_supervisor(supervisor: ProcessSupervisor) -> Self {
        GuardianService { supervisor }
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    /// Start guarding in `mode`, retiring any running guardian first.
    pub fn start(&mut self, config: GuardianConfig, mode: GuardianMode) -> Result<StartReport> {
        let summary = config.target_identity.summary();
        let handle = match mode {
            GuardianMode::InProcess => self.supervisor.start_in_process(config)?,
            GuardianMode::Standalone => self.supervisor.start_standalone(config)?,
        };
        Ok(StartReport {
            success: true,
            mode,
            target_identity_summary: summary,
            pid: handle.pid,
        })
    }

    /// Stop every guardian this host can reach.
    pub fn stop(&mut self) -> Result<StopReport> {
        let in_process_stopped = self.supervisor.stop_in_process().is_some();
        let standalone = self.supervisor.stop_standalone()?;
        Ok(StopReport {
            success: standalone.is_success(),
            in_process_stopped,
            standalone,
        })
    }

    pub fn status(&mut self) -> GuardianStatus {
        let status: SupervisorStatus = self.supervisor.status();
        let config = if status.is_guarding() {
            self.supervisor.current_config()
        } else {
            None
        };
        let channel = self.supervisor.channel();
        GuardianStatus {
            is_guarding: status.is_guarding(),
            mode: status.active_mode(),
            selected_ide: config.as_ref().map(|c| c.selected_ide),
            target_identity_summary: config.as_ref().map(|c| c.target_identity.summary()),
            target_identity: config.map(|c| c.target_identity),
            in_process: InProcessSummary {
                is_guarding: status
                    .in_process
                    .as_ref()
                    .map(|p| p.is_guarding)
                    .unwrap_or(false),
                loop_state: status.in_process.as_ref().map(|p| p.loop_state),
            },
            stats: status.in_process.as_ref().map(|p| p.stats.clone()),
            standalone: status.standalone,
            recent_log: channel.recent_log_lines(RECENT_LOG_LINES),
            paths: ChannelPathsReport {
                config_path: channel.config_path(),
                pid_path: channel.pid_path(),
                log_path: channel.log_path(),
            },
        }
    }

    /// Pin a new target identity on the running guardian. Returns `false`
    /// when nothing is running.
    pub fn update_target(&mut self, identity: TargetIdentity) -> Result<bool> {
        identity.validate()?;
        let Some(mut config) = self.supervisor.current_config() else {
            return Ok(false);
        };
        config.target_identity = identity;
        Ok(self.supervisor.rewrite_config(config)?)
    }

    /// Stop, then start again with the running guardian's config and mode.
    pub fn restart(&mut self) -> Result<StartReport> {
        let status = self.supervisor.status();
        let mode = status.active_mode().unwrap_or(GuardianMode::Standalone);
        let config = self
            .supervisor
            .current_config()
            .ok_or_else(|| Error::ConfigMissing {
                path: self.supervisor.channel().config_path(),
            })?;
        self.stop()?;
        self.start(config, mode)
    }
}

/// A launcher that carries this host's resolved settings into the worker.
fn worker_launcher(settings: &GuardianSettings) -> Result<DetachedLauncher> {
    let mut launcher = DetachedLauncher::current_exe()?
        .with_env(ENV_POLL_INTERVAL_MS, settings.poll_interval_ms.to_string())
        .with_env(ENV_RETRY_ATTEMPTS, settings.retry_attempts.to_string());
    if let Some(path) = &settings.activation_file {
        launcher = launcher.with_env(ENV_ACTIVATION_FILE, path);
    }
    if let Some(home) = &settings.ide_home {
        launcher = launcher.with_env(ENV_IDE_HOME, home);
    }
    if !settings.watch_changes {
        launcher = launcher.with_env(ENV_NO_WATCH, "1");
    }
    Ok(launcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelPaths;
    use crate::enforce::{LoopSettings, NullSink};
    use crate::inspector::mock::MockInspector;
    use crate::license::SharedFlagGate;
    use crate::supervisor::{SupervisorSettings, WorkerLauncher};
    use crate::variant::IdeLayout;
    use dg_common::identity::fields;
    use std::fs;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::tempdir;

    struct NeverLauncher;

    impl WorkerLauncher for NeverLauncher {
        fn signature(&self, config_path: &Path) -> inspector::GuardianSignature {
            inspector::GuardianSignature::new("devguard", config_path)
        }

        fn launch(&self, _: &Path) -> std::result::Result<ProcessId, crate::supervisor::SupervisorError> {
            Err(crate::supervisor::SupervisorError::Spawn("disabled in tests".to_string()))
        }
    }

    fn service(dir: &Path) -> GuardianService {
        let home = dir.join("home");
        let mut loop_settings = LoopSettings::new(IdeLayout::with_home(&home));
        loop_settings.poll_interval = Duration::from_millis(10);
        loop_settings.watch_changes = false;
        loop_settings.temp_dir = None;
        let supervisor = ProcessSupervisor::new(
            ChannelPaths::new(dir.join("chan")),
            Arc::new(MockInspector::new()),
            Arc::new(NeverLauncher),
            InProcessDeps {
                loop_settings,
                opener: Arc::new(DiskStoreOpener),
                gate: Arc::new(SharedFlagGate::new(true)),
                sink: Arc::new(NullSink),
            },
        )
        .with_settings(SupervisorSettings {
            stop_timeout: Duration::from_millis(50),
            startup_grace: Duration::from_millis(5),
            poll_interval: Duration::from_millis(5),
        });
        GuardianService::from_supervisor(supervisor)
    }

    fn config(value: &str) -> GuardianConfig {
        GuardianConfig::new(
            TargetIdentity::new().with_field(fields::DEV_DEVICE_ID, value),
            IdeVariant::Cursor,
        )
    }

    #[test]
    fn test_in_process_lifecycle_reports() {
        let dir = tempdir().unwrap();
        let mut svc = service(dir.path());

        let report = svc.start(config("pinned-value-1234567"), GuardianMode::InProcess).unwrap();
        assert!(report.success);
        assert_eq!(
            report.target_identity_summary[fields::DEV_DEVICE_ID],
            "pinned-value..."
        );

        let status = svc.status();
        assert!(status.is_guarding);
        assert_eq!(status.mode, Some(GuardianMode::InProcess));
        assert_eq!(status.selected_ide, Some(IdeVariant::Cursor));
        assert_eq!(
            status
                .target_identity
                .as_ref()
                .and_then(|t| t.get(fields::DEV_DEVICE_ID)),
            Some("pinned-value-1234567")
        );
        assert_eq!(
            status.target_identity_summary.as_ref().unwrap()[fields::DEV_DEVICE_ID],
            "pinned-value..."
        );
        assert!(!status.standalone.is_running);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["isGuarding"], true);
        assert_eq!(json["selectedIDE"], "cursor");
        assert_eq!(json["inProcess"]["isGuarding"], true);
        assert_eq!(
            json["targetIdentity"][fields::DEV_DEVICE_ID],
            "pinned-value-1234567"
        );

        let stop = svc.stop().unwrap();
        assert!(stop.success);
        assert!(stop.in_process_stopped);
        assert!(!svc.status().is_guarding);
    }

    #[test]
    fn test_update_target_reaches_running_loop() {
        let dir = tempdir().unwrap();
        let store_dir = dir.path().join("home/.config/Cursor/User/globalStorage");
        fs::create_dir_all(&store_dir).unwrap();
        let store = store_dir.join("storage.json");
        fs::write(&store, "{}").unwrap();

        let mut svc = service(dir.path());
        let mut cfg = config("first");
        cfg.feature_flags.enable_enhanced_protection = false;
        svc.start(cfg, GuardianMode::InProcess).unwrap();
        assert!(svc
            .update_target(TargetIdentity::new().with_field(fields::DEV_DEVICE_ID, "second"))
            .unwrap());

        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        loop {
            let doc: serde_json::Value =
                serde_json::from_str(&fs::read_to_string(&store).unwrap_or_default())
                    .unwrap_or_default();
            if doc[fields::DEV_DEVICE_ID] == "second" {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "rewrite never applied");
            std::thread::sleep(Duration::from_millis(10));
        }
        svc.stop().unwrap();
    }

    #[test]
    fn test_update_target_without_guardian() {
        let dir = tempdir().unwrap();
        let mut svc = service(dir.path());
        assert!(!svc
            .update_target(TargetIdentity::new().with_field(fields::DEV_DEVICE_ID, "x"))
            .unwrap());
        assert!(svc.update_target(TargetIdentity::new()).is_err());
    }

    #[test]
    fn test_standalone_spawn_failure_reported() {
        let dir = tempdir().unwrap();
        let mut svc = service(dir.path());
        let err = svc.start(config("v"), GuardianMode::Standalone).unwrap_err();
        assert!(matches!(err, Error::ProcessSpawn(_)));
        assert!(!svc.supervisor().channel().config_path().exists());
    }

    #[test]
    fn test_restart_without_config_fails() {
        let dir = tempdir().unwrap();
        let mut svc = service(dir.path());
        assert!(matches!(svc.restart(), Err(Error::ConfigMissing { .. })));
    }
}
