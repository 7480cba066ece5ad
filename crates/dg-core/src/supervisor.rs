//! Guardian process supervision.
//!
//! The supervisor owns at most one in-process guardian (a dedicated thread
//! running an [`EnforcementLoop`]) and tracks at most one standalone guardian
//! (a detached `devguard worker` process, found through the PID file).
//! Starting either mode first retires whatever is already running, so exactly
//! one guardian enforces a monitored set at a time.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::channel::{ChannelError, ChannelPaths};
use crate::enforce::{
    EnforcementLoop, LoopExit, LoopSettings, LoopShared, LoopState, LoopStats, RecordSink,
    SharedConfig,
};
use crate::inspector::{self, GuardianSignature, ProcessInspector, SignalResult};
use crate::license::LicenseGate;
use crate::log_event;
use crate::logging::{event_names, LogContext, Stage};
use crate::store::StoreOpener;
use crate::variant;
use dg_common::{GuardianConfig, GuardianMode, ProcessHandle, ProcessId};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Common(#[from] dg_common::Error),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("failed to spawn guardian: {0}")]
    Spawn(String),
}

impl From<SupervisorError> for dg_common::Error {
    fn from(err: SupervisorError) -> Self {
        match err {
            SupervisorError::Common(e) => e,
            SupervisorError::Channel(e) => e.into(),
            SupervisorError::Spawn(msg) => dg_common::Error::ProcessSpawn(msg),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Stopped,
    StartingInProcess,
    StartingStandalone,
    Running,
    Stopping,
}

/// How a standalone stop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum StopOutcome {
    NotRunning,
    Stopped { pid: ProcessId },
    /// The PID file named a process that was not a live guardian.
    StaleCleared { pid: ProcessId },
    /// Still alive after the stop timeout.
    TimedOut { pid: ProcessId },
}

impl StopOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, StopOutcome::TimedOut { .. })
    }
}

// ---------------------------------------------------------------------------
// Launchers
// ---------------------------------------------------------------------------

/// Starts standalone guardian processes.
pub trait WorkerLauncher: Send + Sync {
    /// What the launched process's command line looks like.
    fn signature(&self, config_path: &Path) -> GuardianSignature;

    /// Spawn a detached worker reading `config_path`. The launcher reaps it.
    fn launch(&self, config_path: &Path) -> Result<ProcessId, SupervisorError>;
}

/// Spawns `<exe> worker --config <path>` in its own session with null stdio.
#[derive(Debug, Clone)]
pub struct DetachedLauncher {
    exe: PathBuf,
    env: Vec<(OsString, OsString)>,
}

impl DetachedLauncher {
    pub fn new(exe: impl Into<PathBuf>) -> Self {
        DetachedLauncher {
            exe: exe.into(),
            env: Vec::new(),
        }
    }

    /// Launch the running executable.
    pub fn current_exe() -> Result<Self, SupervisorError> {
        let exe = std::env::current_exe()
            .map_err(|e| SupervisorError::Spawn(format!("cannot locate executable: {}", e)))?;
        Ok(Self::new(exe))
    }

    pub fn with_env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn exe(&self) -> &Path {
        &self.exe
    }
}

impl WorkerLauncher for DetachedLauncher {
    fn signature(&self, config_path: &Path) -> GuardianSignature {
        GuardianSignature::for_exe(&self.exe, config_path)
    }

    fn launch(&self, config_path: &Path) -> Result<ProcessId, SupervisorError> {
        let mut cmd = Command::new(&self.exe);
        cmd.args(self.signature(config_path).worker_args())
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // SAFETY: setsid() is async-signal-safe and touches no parent state.
            unsafe {
                cmd.pre_exec(|| {
                    libc::setsid();
                    Ok(())
                });
            }
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| SupervisorError::Spawn(format!("{}: {}", self.exe.display(), e)))?;
        let pid = ProcessId(child.id());
        std::thread::Builder::new()
            .name(format!("devguard-reap-{}", pid))
            .spawn(move || {
                let _ = child.wait();
            })
            .map_err(|e| SupervisorError::Spawn(format!("reaper thread: {}", e)))?;
        Ok(pid)
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Timing knobs for supervision.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// How long `stop_standalone` waits for the guardian to exit.
    pub stop_timeout: Duration,
    /// How long a fresh standalone must survive to count as started.
    pub startup_grace: Duration,
    /// Poll step while waiting.
    pub poll_interval: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        SupervisorSettings {
            stop_timeout: Duration::from_secs(5),
            startup_grace: Duration::from_millis(300),
            poll_interval: Duration::from_millis(50),
        }
    }
}

/// What an in-process guardian needs besides its config.
#[derive(Clone)]
pub struct InProcessDeps {
    pub loop_settings: LoopSettings,
    pub opener: Arc<dyn StoreOpener>,
    pub gate: Arc<dyn LicenseGate>,
    pub sink: Arc<dyn RecordSink>,
}

struct InProcessGuardian {
    handle: ProcessHandle,
    stop: Arc<AtomicBool>,
    shared: Arc<LoopShared>,
    config: SharedConfig,
    thread: Option<JoinHandle<LoopExit>>,
}

impl InProcessGuardian {
    fn stop(&mut self) -> Option<LoopExit> {
        self.stop.store(true, Ordering::SeqCst);
        self.thread.take().and_then(|t| t.join().ok())
    }
}

/// In-process guardian as reported by status.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InProcessStatus {
    pub is_guarding: bool,
    pub loop_state: LoopState,
    pub handle: ProcessHandle,
    pub stats: LoopStats,
}

/// Standalone guardian as reported by status.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StandaloneStatus {
    pub is_running: bool,
    pub pid: Option<ProcessId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<ProcessHandle>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorStatus {
    pub state: SupervisorState,
    pub in_process: Option<InProcessStatus>,
    pub standalone: StandaloneStatus,
}

impl SupervisorStatus {
    pub fn is_guarding(&self) -> bool {
        self.standalone.is_running
            || self.in_process.as_ref().map(|p| p.is_guarding).unwrap_or(false)
    }

    pub fn active_mode(&self) -> Option<GuardianMode> {
        if self.in_process.as_ref().map(|p| p.is_guarding).unwrap_or(false) {
            Some(GuardianMode::InProcess)
        } else if self.standalone.is_running {
            Some(GuardianMode::Standalone)
        } else {
            None
        }
    }
}

pub struct ProcessSupervisor {
    channel: ChannelPaths,
    inspector: Arc<dyn ProcessInspector>,
    launcher: Arc<dyn WorkerLauncher>,
    settings: SupervisorSettings,
    deps: InProcessDeps,
    in_process: Option<InProcessGuardian>,
    state: SupervisorState,
    ctx: LogContext,
}

impl ProcessSupervisor {
    pub fn new(
        channel: ChannelPaths,
        inspector: Arc<dyn ProcessInspector>,
        launcher: Arc<dyn WorkerLauncher>,
        deps: InProcessDeps,
    ) -> Self {
        ProcessSupervisor {
            channel,
            inspector,
            launcher,
            settings: SupervisorSettings::default(),
            deps,
            in_process: None,
            state: SupervisorState::Stopped,
            ctx: LogContext::for_new_run(),
        }
    }

    pub fn with_settings(mut self, settings: SupervisorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_log_context(mut self, ctx: LogContext) -> Self {
        self.ctx = ctx;
        self
    }

    pub fn channel(&self) -> &ChannelPaths {
        &self.channel
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    fn signature(&self) -> GuardianSignature {
        self.launcher.signature(&self.channel.config_path())
    }

    /// The live standalone guardian, if any. A PID file that names no live,
    /// signature-matching process is discarded.
    pub fn reconcile(&self) -> Result<Option<ProcessId>, SupervisorError> {
        let pid = match self.channel.read_pid()? {
            Some(pid) => pid,
            None => {
                if self.channel.pid_file_exists() {
                    log_event!(
                        self.ctx,
                        INFO,
                        event_names::SUPERVISE_STALE_PID,
                        Stage::Supervise,
                        "discarding unreadable PID file"
                    );
                    self.channel.remove_pid()?;
                }
                return Ok(None);
            }
        };
        if inspector::is_live_guardian(self.inspector.as_ref(), pid, &self.signature()) {
            return Ok(Some(pid));
        }
        log_event!(
            self.ctx,
            INFO,
            event_names::SUPERVISE_STALE_PID,
            Stage::Supervise,
            "discarding stale PID file",
            pid = pid.0
        );
        self.channel.remove_pid_if_owned(pid)?;
        Ok(None)
    }

    /// Start the enforcement loop on a dedicated thread in this process.
    pub fn start_in_process(
        &mut self,
        config: GuardianConfig,
    ) -> Result<ProcessHandle, SupervisorError> {
        config.validate()?;
        self.check_enforceable(&config)?;
        let previous = self.state;
        self.state = SupervisorState::StartingInProcess;
        if let Err(e) = self.retire_standalone("superseded by in-process guardian") {
            self.state = previous;
            return Err(e);
        }
        self.stop_in_process();
        self.state = SupervisorState::StartingInProcess;

        let shared_config = SharedConfig::new(config.clone());
        let ctx = LogContext::for_new_run().with_mode(GuardianMode::InProcess);
        let mut enforcement = EnforcementLoop::new(
            config,
            self.deps.loop_settings.clone(),
            Arc::clone(&self.deps.opener),
            Arc::clone(&self.deps.gate),
            Arc::clone(&self.deps.sink),
        )
        .with_config_source(Box::new(shared_config.subscribe()))
        .with_log_context(ctx);

        let stop = Arc::new(AtomicBool::new(false));
        let shared = enforcement.shared();
        let flag = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name("devguard-guardian".to_string())
            .spawn(move || enforcement.run_until(|| flag.load(Ordering::SeqCst)))
            .map_err(|e| {
                self.state = SupervisorState::Stopped;
                SupervisorError::Spawn(format!("guardian thread: {}", e))
            })?;

        let handle = ProcessHandle {
            pid: ProcessId::current(),
            mode: GuardianMode::InProcess,
            started_at: Utc::now(),
        };
        self.in_process = Some(InProcessGuardian {
            handle,
            stop,
            shared,
            config: shared_config,
            thread: Some(thread),
        });
        self.state = SupervisorState::Running;
        log_event!(
            self.ctx,
            INFO,
            event_names::SUPERVISE_SPAWNED,
            Stage::Supervise,
            "in-process guardian started",
            mode = "in-process"
        );
        Ok(handle)
    }

    /// Write the channel config and spawn a detached guardian process.
    pub fn start_standalone(
        &mut self,
        config: GuardianConfig,
    ) -> Result<ProcessHandle, SupervisorError> {
        config.validate()?;
        self.check_enforceable(&config)?;
        let previous = self.state;
        self.state = SupervisorState::StartingStandalone;
        if let Err(e) = self.retire_standalone("superseded by new standalone guardian") {
            self.state = previous;
            return Err(e);
        }
        if self.stop_in_process().is_some() {
            log_event!(
                self.ctx,
                INFO,
                event_names::SUPERVISE_RETIRED,
                Stage::Supervise,
                "in-process guardian retired",
                reason = "superseded by standalone guardian"
            );
        }
        self.state = SupervisorState::StartingStandalone;

        if let Err(e) = self.channel.write_config(&config) {
            self.state = SupervisorState::Stopped;
            return Err(e.into());
        }
        let pid = match self.launcher.launch(&self.channel.config_path()) {
            Ok(pid) => pid,
            Err(e) => {
                let _ = self.channel.remove_config();
                self.state = SupervisorState::Stopped;
                return Err(e);
            }
        };
        self.channel.write_pid(pid)?;

        if !self.survives_startup(pid) {
            self.state = SupervisorState::Stopped;
            let _ = self.channel.remove_pid_if_owned(pid);
            return Err(SupervisorError::Spawn(format!(
                "guardian process {} exited during startup",
                pid
            )));
        }

        self.state = SupervisorState::Running;
        log_event!(
            self.ctx,
            INFO,
            event_names::SUPERVISE_SPAWNED,
            Stage::Supervise,
            "standalone guardian spawned",
            mode = "standalone",
            pid = pid.0
        );
        Ok(ProcessHandle {
            pid,
            mode: GuardianMode::Standalone,
            started_at: config.started_at,
        })
    }

    fn survives_startup(&self, pid: ProcessId) -> bool {
        let deadline = Instant::now() + self.settings.startup_grace;
        loop {
            if !self.inspector.is_alive(pid) {
                return false;
            }
            if Instant::now() >= deadline {
                return true;
            }
            std::thread::sleep(self.settings.poll_interval);
        }
    }

    /// Stop the standalone guardian before another one takes over. A
    /// guardian that outlives the stop timeout, or cannot be signalled,
    /// blocks the start.
    fn retire_standalone(&mut self, reason: &str) -> Result<(), SupervisorError> {
        match self.stop_standalone()? {
            StopOutcome::Stopped { pid } => {
                log_event!(
                    self.ctx,
                    INFO,
                    event_names::SUPERVISE_RETIRED,
                    Stage::Supervise,
                    "standalone guardian retired",
                    pid = pid.0,
                    reason = reason
                );
                Ok(())
            }
            StopOutcome::TimedOut { pid } => Err(SupervisorError::Common(
                dg_common::Error::StopTimeout {
                    pid: pid.0,
                    seconds: self.settings.stop_timeout.as_millis().div_ceil(1000) as u64,
                },
            )),
            StopOutcome::NotRunning | StopOutcome::StaleCleared { .. } => Ok(()),
        }
    }

    /// Reject a config none of whose target fields is carried by a monitored
    /// store of its IDE.
    fn check_enforceable(&self, config: &GuardianConfig) -> Result<(), SupervisorError> {
        let paths = variant::monitored_paths(config, &self.deps.loop_settings.layout);
        let unenforced = variant::unenforced_fields(config, &paths);
        if unenforced.len() < config.target_identity.len() {
            return Ok(());
        }
        Err(SupervisorError::Common(dg_common::Error::InvalidIdentity(
            format!(
                "no monitored store of {} carries any of: {}",
                config.selected_ide,
                unenforced.join(", ")
            ),
        )))
    }

    /// Stop the in-process guardian and wait for its thread.
    pub fn stop_in_process(&mut self) -> Option<LoopExit> {
        let mut guardian = self.in_process.take()?;
        self.state = SupervisorState::Stopping;
        let exit = guardian.stop();
        self.state = SupervisorState::Stopped;
        Some(exit.unwrap_or(LoopExit::Stopped))
    }

    /// SIGTERM the standalone guardian and wait for it to exit.
    pub fn stop_standalone(&mut self) -> Result<StopOutcome, SupervisorError> {
        let recorded = self.channel.read_pid()?;
        let Some(pid) = self.reconcile()? else {
            return Ok(match recorded {
                Some(pid) => StopOutcome::StaleCleared { pid },
                None => StopOutcome::NotRunning,
            });
        };

        let previous = self.state;
        self.state = SupervisorState::Stopping;
        match inspector::terminate(pid) {
            Ok(SignalResult::Delivered) => {
                log_event!(
                    self.ctx,
                    INFO,
                    event_names::SUPERVISE_STOP_SIGNALED,
                    Stage::Supervise,
                    "sent SIGTERM to standalone guardian",
                    pid = pid.0
                );
            }
            Ok(SignalResult::NoSuchProcess) => {}
            Ok(SignalResult::PermissionDenied) => {
                self.state = previous;
                return Err(SupervisorError::Common(dg_common::Error::Io(
                    std::io::Error::new(
                        std::io::ErrorKind::PermissionDenied,
                        format!("not permitted to signal guardian process {}", pid),
                    ),
                )));
            }
            Err(e) => {
                self.state = previous;
                return Err(SupervisorError::Common(dg_common::Error::Io(e)));
            }
        }

        let signature = self.signature();
        let deadline = Instant::now() + self.settings.stop_timeout;
        while inspector::is_live_guardian(self.inspector.as_ref(), pid, &signature) {
            if Instant::now() >= deadline {
                self.state = previous;
                log_event!(
                    self.ctx,
                    WARN,
                    event_names::SUPERVISE_STOP_TIMEOUT,
                    Stage::Supervise,
                    "standalone guardian did not exit before timeout",
                    pid = pid.0,
                    timeout_ms = self.settings.stop_timeout.as_millis() as u64
                );
                return Ok(StopOutcome::TimedOut { pid });
            }
            std::thread::sleep(self.settings.poll_interval);
        }

        // The guardian cleans up after itself; this covers one that was killed.
        self.channel.cleanup(Some(pid));
        self.state = SupervisorState::Stopped;
        log_event!(
            self.ctx,
            INFO,
            event_names::SUPERVISE_REAPED,
            Stage::Supervise,
            "standalone guardian stopped",
            pid = pid.0
        );
        Ok(StopOutcome::Stopped { pid })
    }

    /// Rewrite the running guardian's config. Picked up at its next tick.
    pub fn rewrite_config(&mut self, config: GuardianConfig) -> Result<bool, SupervisorError> {
        config.validate()?;
        self.check_enforceable(&config)?;
        if let Some(guardian) = self.in_process.as_ref().filter(|g| g.shared.is_guarding()) {
            guardian.config.replace(config);
            return Ok(true);
        }
        if self.reconcile()?.is_some() {
            self.channel.write_config(&config)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Config of whichever guardian is running.
    pub fn current_config(&self) -> Option<GuardianConfig> {
        if let Some(guardian) = self.in_process.as_ref().filter(|g| g.shared.is_guarding()) {
            return guardian.config.current();
        }
        self.channel.read_config().ok()
    }

    pub fn status(&mut self) -> SupervisorStatus {
        let in_process = self.in_process.as_ref().map(|g| InProcessStatus {
            is_guarding: g.shared.is_guarding(),
            loop_state: g.shared.state(),
            handle: g.handle,
            stats: g.shared.stats(),
        });
        let pid = self.reconcile().ok().flatten();
        let handle = pid.map(|pid| ProcessHandle {
            pid,
            mode: GuardianMode::Standalone,
            started_at: pid_file_time(&self.channel.pid_path()).unwrap_or_else(Utc::now),
        });
        let status = SupervisorStatus {
            state: self.state,
            in_process,
            standalone: StandaloneStatus {
                is_running: pid.is_some(),
                pid,
                handle,
            },
        };
        if !status.is_guarding() && self.state == SupervisorState::Running {
            self.state = SupervisorState::Stopped;
        }
        SupervisorStatus {
            state: self.state,
            ..status
        }
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        // In-process guardians die with their host.
        self.stop_in_process();
    }
}

fn pid_file_time(path: &Path) -> Option<DateTime<Utc>> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    Some(DateTime::<Utc>::from(modified))
}
