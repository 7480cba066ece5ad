//! The enforcement loop.
//!
//! One loop owns one guardian run: it ticks on a fixed poll interval (plus
//! an out-of-cycle tick on file-change notifications), and on every tick
//!
//! 1. skips if a previous tick is still running,
//! 2. stops if the license gate says so,
//! 3. reads and classifies every monitored store, correcting drift with a
//!    single merge write per store,
//! 4. sweeps backups when backup monitoring is on.
//!
//! Per-path failures never stop the loop; they become `deferred` or
//! `failed` records and the path is tried again next tick.
//!
//! The loop is synchronous and owns no thread. [`EnforcementLoop::tick`] is
//! the testable unit; [`EnforcementLoop::run_until`] drives it.

pub mod watch;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backup::BackupSweeper;
use crate::drift::{Classification, DriftDetector, FieldDelta};
use crate::license::LicenseGate;
use crate::log_event;
use crate::logging::{event_names, redact_for_log, LogContext, Stage};
use crate::protect::Protector;
use crate::store::{IdentityStore, RetryPolicy, StoreOpener};
use crate::variant::{self, IdeLayout, MonitoredPath, StorageKind};
use dg_common::{GuardianConfig, IdentityFields};

use watch::ChangeWatcher;

/// Number of recent records kept for status output.
const RECENT_RECORDS: usize = 50;

/// Value prefix shown in log lines.
const LOG_VALUE_KEEP: usize = 12;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    NoOp,
    Corrected,
    Deferred,
    Failed,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::NoOp => write!(f, "no-op"),
            Outcome::Corrected => write!(f, "corrected"),
            Outcome::Deferred => write!(f, "deferred"),
            Outcome::Failed => write!(f, "failed"),
        }
    }
}

/// One field of an enforcement record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldChange {
    pub field: String,
    pub previous_value: Option<String>,
    pub corrected_value: String,
}

impl From<&FieldDelta> for FieldChange {
    fn from(delta: &FieldDelta) -> Self {
        FieldChange {
            field: delta.field.clone(),
            previous_value: delta.current.clone(),
            corrected_value: delta.target.clone(),
        }
    }
}

/// What happened to one store on one tick. Drifted fields are listed together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnforcementRecord {
    pub path: PathBuf,
    pub fields: Vec<FieldChange>,
    pub timestamp: DateTime<Utc>,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl EnforcementRecord {
    pub fn new(path: impl Into<PathBuf>, outcome: Outcome) -> Self {
        EnforcementRecord {
            path: path.into(),
            fields: Vec::new(),
            timestamp: Utc::now(),
            outcome,
            detail: None,
        }
    }

    pub fn with_fields(mut self, deltas: &[FieldDelta]) -> Self {
        self.fields = deltas.iter().map(FieldChange::from).collect();
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Single human-readable line for the channel log.
    pub fn to_log_line(&self) -> String {
        let mut line = format!(
            "[{}] {} {}",
            self.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            self.outcome,
            self.path.display()
        );
        for change in &self.fields {
            let previous = change
                .previous_value
                .as_deref()
                .map(|v| redact_for_log(v, LOG_VALUE_KEEP))
                .unwrap_or_else(|| "<absent>".to_string());
            line.push_str(&format!(
                " {}: {} -> {};",
                change.field,
                previous,
                redact_for_log(&change.corrected_value, LOG_VALUE_KEEP)
            ));
        }
        if let Some(detail) = &self.detail {
            line.push_str(&format!(" ({})", detail));
        }
        line
    }
}

/// Where enforcement records go besides the tracing log.
pub trait RecordSink: Send + Sync {
    fn record(&self, record: &EnforcementRecord);
}

/// Discards records.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl RecordSink for NullSink {
    fn record(&self, _record: &EnforcementRecord) {}
}

/// Keeps records in memory.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<EnforcementRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<EnforcementRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl RecordSink for MemorySink {
    fn record(&self, record: &EnforcementRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Loop state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Idle,
    Watching,
    DriftDetected,
    Correcting,
    LicenseInvalid,
    Stopping,
    Stopped,
}

/// Why a loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopExit {
    /// Stop requested by the owner.
    Stopped,
    /// The license gate reported invalid.
    LicenseInvalid,
}

/// Counters for status output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopStats {
    pub ticks: u64,
    pub skipped_ticks: u64,
    pub corrections: u64,
    pub deferrals: u64,
    pub failures: u64,
    pub backups_removed: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub last_tick_at: Option<DateTime<Utc>>,
}

/// State observable from other threads while the loop runs.
#[derive(Debug)]
pub struct LoopShared {
    busy: AtomicBool,
    state: Mutex<LoopState>,
    stats: Mutex<LoopStats>,
    recent: Mutex<VecDeque<EnforcementRecord>>,
}

impl Default for LoopShared {
    fn default() -> Self {
        LoopShared {
            busy: AtomicBool::new(false),
            state: Mutex::new(LoopState::Idle),
            stats: Mutex::new(LoopStats::default()),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_RECORDS)),
        }
    }
}

impl LoopShared {
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> LoopState {
        self.state.lock().map(|s| *s).unwrap_or(LoopState::Stopped)
    }

    pub fn stats(&self) -> LoopStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn recent_records(&self) -> Vec<EnforcementRecord> {
        self.recent
            .lock()
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// `true` while the loop is between start and stop.
    pub fn is_guarding(&self) -> bool {
        !matches!(
            self.state(),
            LoopState::Idle | LoopState::LicenseInvalid | LoopState::Stopping | LoopState::Stopped
        )
    }

    fn set_state(&self, state: LoopState) {
        if let Ok(mut s) = self.state.lock() {
            *s = state;
        }
    }

    fn update_stats(&self, f: impl FnOnce(&mut LoopStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }

    fn push_record(&self, record: &EnforcementRecord) {
        if let Ok(mut recent) = self.recent.lock() {
            if recent.len() >= RECENT_RECORDS {
                recent.pop_front();
            }
            recent.push_back(record.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Config source
// ---------------------------------------------------------------------------

/// Supplies config rewrites to a running loop.
pub trait ConfigSource: Send {
    /// A config that differs from the last one returned, if any.
    fn poll(&mut self) -> Option<GuardianConfig>;
}

/// Never changes.
#[derive(Debug, Default)]
pub struct FixedConfig;

impl ConfigSource for FixedConfig {
    fn poll(&mut self) -> Option<GuardianConfig> {
        None
    }
}

/// Config shared with an in-process host.
#[derive(Debug, Clone)]
pub struct SharedConfig {
    inner: Arc<RwLock<(u64, GuardianConfig)>>,
}

impl SharedConfig {
    pub fn new(config: GuardianConfig) -> Self {
        SharedConfig {
            inner: Arc::new(RwLock::new((0, config))),
        }
    }

    /// Replace the config; the loop picks it up at its next tick boundary.
    pub fn replace(&self, config: GuardianConfig) {
        if let Ok(mut inner) = self.inner.write() {
            inner.0 += 1;
            inner.1 = config;
        }
    }

    pub fn current(&self) -> Option<GuardianConfig> {
        self.inner.read().ok().map(|inner| inner.1.clone())
    }

    /// A reader that reports changes made after this call.
    pub fn subscribe(&self) -> SharedConfigReader {
        let seen = self.inner.read().map(|inner| inner.0).unwrap_or(0);
        SharedConfigReader {
            shared: self.clone(),
            seen,
        }
    }
}

pub struct SharedConfigReader {
    shared: SharedConfig,
    seen: u64,
}

impl ConfigSource for SharedConfigReader {
    fn poll(&mut self) -> Option<GuardianConfig> {
        let inner = self.shared.inner.read().ok()?;
        if inner.0 == self.seen {
            return None;
        }
        self.seen = inner.0;
        Some(inner.1.clone())
    }
}

// ---------------------------------------------------------------------------
// The loop
// ---------------------------------------------------------------------------

/// Timing and environment for a loop.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    /// Baseline tick cadence.
    pub poll_interval: Duration,
    /// Granularity of stop checks while waiting.
    pub stop_check_interval: Duration,
    pub retry: RetryPolicy,
    pub layout: IdeLayout,
    /// Use file-change notifications when available.
    pub watch_changes: bool,
    /// Swept shallowly for backups when backup monitoring is on.
    pub temp_dir: Option<PathBuf>,
}

impl LoopSettings {
    pub fn new(layout: IdeLayout) -> Self {
        LoopSettings {
            poll_interval: Duration::from_secs(2),
            stop_check_interval: Duration::from_millis(100),
            retry: RetryPolicy::default(),
            layout,
            watch_changes: true,
            temp_dir: Some(std::env::temp_dir()),
        }
    }
}

/// Result of one tick.
#[derive(Debug, Clone)]
pub struct TickOutcome {
    pub tick_number: u64,
    /// Another tick was already running.
    pub skipped: bool,
    pub records: Vec<EnforcementRecord>,
    pub backups_removed: usize,
    pub exit: Option<LoopExit>,
}

impl TickOutcome {
    fn skipped(tick_number: u64) -> Self {
        TickOutcome {
            tick_number,
            skipped: true,
            records: Vec::new(),
            backups_removed: 0,
            exit: None,
        }
    }

    pub fn count(&self, outcome: Outcome) -> usize {
        self.records.iter().filter(|r| r.outcome == outcome).count()
    }
}

pub struct EnforcementLoop {
    config: GuardianConfig,
    paths: Vec<MonitoredPath>,
    detector: DriftDetector,
    sweeper: Option<BackupSweeper>,
    protector: Protector,
    opener: Arc<dyn StoreOpener>,
    gate: Arc<dyn LicenseGate>,
    sink: Arc<dyn RecordSink>,
    source: Box<dyn ConfigSource>,
    settings: LoopSettings,
    shared: Arc<LoopShared>,
    ctx: LogContext,
    tick_count: u64,
}

impl EnforcementLoop {
    pub fn new(
        config: GuardianConfig,
        settings: LoopSettings,
        opener: Arc<dyn StoreOpener>,
        gate: Arc<dyn LicenseGate>,
        sink: Arc<dyn RecordSink>,
    ) -> Self {
        let paths = variant::monitored_paths(&config, &settings.layout);
        let mut this = EnforcementLoop {
            detector: DriftDetector::new(config.target_identity.clone()),
            sweeper: None,
            protector: Protector::new(),
            paths,
            config,
            opener,
            gate,
            sink,
            source: Box::new(FixedConfig),
            settings,
            shared: Arc::new(LoopShared::default()),
            ctx: LogContext::for_new_run(),
            tick_count: 0,
        };
        this.sweeper = this.build_sweeper();
        this
    }

    pub fn with_config_source(mut self, source: Box<dyn ConfigSource>) -> Self {
        self.source = source;
        self
    }

    pub fn with_log_context(mut self, ctx: LogContext) -> Self {
        self.ctx = ctx;
        self
    }

    /// Replace the monitored set (tests and custom layouts).
    pub fn with_paths(mut self, paths: Vec<MonitoredPath>) -> Self {
        self.paths = paths;
        self.sweeper = self.build_sweeper();
        self
    }

    pub fn shared(&self) -> Arc<LoopShared> {
        Arc::clone(&self.shared)
    }

    pub fn config(&self) -> &GuardianConfig {
        &self.config
    }

    pub fn paths(&self) -> &[MonitoredPath] {
        &self.paths
    }

    pub fn state(&self) -> LoopState {
        self.shared.state()
    }

    fn build_sweeper(&self) -> Option<BackupSweeper> {
        if !self.config.feature_flags.enable_backup_monitoring {
            return None;
        }
        let strategy = variant::strategy_for(self.config.selected_ide);
        match BackupSweeper::for_paths(&self.paths, strategy.backup_dirs(&self.settings.layout)) {
            Ok(sweeper) => Some(match &self.settings.temp_dir {
                Some(tmp) => sweeper.with_shallow_dir(tmp.clone()),
                None => sweeper,
            }),
            Err(e) => {
                log_event!(
                    self.ctx,
                    WARN,
                    event_names::INTERNAL_ERROR,
                    Stage::Init,
                    "backup monitoring disabled",
                    error = e.to_string().as_str()
                );
                None
            }
        }
    }

    /// Idle → Watching.
    pub fn begin(&mut self) {
        let now = Utc::now();
        self.shared.update_stats(|s| s.started_at = Some(now));
        self.shared.set_state(LoopState::Watching);
        log_event!(
            self.ctx,
            INFO,
            event_names::GUARDIAN_STARTED,
            Stage::Init,
            "guardian started",
            ide = self.config.selected_ide.as_str(),
            paths = self.paths.len() as u64,
            fields = self.config.target_identity.len() as u64
        );
        self.warn_unenforced();
    }

    /// Target fields no monitored store carries.
    pub fn unenforced_fields(&self) -> Vec<String> {
        variant::unenforced_fields(&self.config, &self.paths)
    }

    fn warn_unenforced(&self) {
        let unenforced = self.unenforced_fields();
        if unenforced.is_empty() {
            return;
        }
        log_event!(
            self.ctx,
            WARN,
            event_names::GUARDIAN_UNENFORCED_FIELDS,
            Stage::Init,
            "target fields not carried by any monitored store are never enforced",
            ide = self.config.selected_ide.as_str(),
            fields = unenforced.join(",").as_str()
        );
    }

    /// Apply a pending config rewrite. A different target starts a new run.
    fn reload_config(&mut self) {
        let Some(next) = self.source.poll() else {
            return;
        };
        if !next.differs_in_target(&self.config) {
            self.config = next;
            return;
        }
        if let Some(mode) = self.ctx.mode.clone() {
            self.ctx = LogContext::for_new_run().with_mode(mode);
        } else {
            self.ctx = LogContext::for_new_run();
        }
        self.release_protection();
        self.paths = variant::monitored_paths(&next, &self.settings.layout);
        self.detector = DriftDetector::new(next.target_identity.clone());
        self.config = next;
        self.sweeper = self.build_sweeper();
        log_event!(
            self.ctx,
            INFO,
            event_names::GUARDIAN_RUN_RESET,
            Stage::Channel,
            "config rewritten; starting a new run",
            ide = self.config.selected_ide.as_str(),
            paths = self.paths.len() as u64
        );
        self.warn_unenforced();
    }

    /// Run one tick.
    pub fn tick(&mut self) -> TickOutcome {
        if self
            .shared
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.shared.update_stats(|s| s.skipped_ticks += 1);
            return TickOutcome::skipped(self.tick_count);
        }
        let outcome = self.tick_inner();
        self.shared.busy.store(false, Ordering::SeqCst);
        outcome
    }

    fn tick_inner(&mut self) -> TickOutcome {
        self.tick_count += 1;
        let tick_number = self.tick_count;
        let now = Utc::now();
        self.shared.update_stats(|s| {
            s.ticks += 1;
            s.last_tick_at = Some(now);
        });

        if !self.gate.is_valid() {
            self.shared.set_state(LoopState::LicenseInvalid);
            log_event!(
                self.ctx,
                WARN,
                event_names::LICENSE_INVALID,
                Stage::License,
                "license no longer valid; stopping",
                gate = self.gate.describe().as_str()
            );
            return TickOutcome {
                tick_number,
                skipped: false,
                records: Vec::new(),
                backups_removed: 0,
                exit: Some(LoopExit::LicenseInvalid),
            };
        }

        log_event!(
            self.ctx,
            DEBUG,
            event_names::WATCH_TICK,
            Stage::Watch,
            "tick",
            tick = tick_number
        );

        let paths = self.paths.clone();
        let mut records = Vec::with_capacity(paths.len());
        for path in &paths {
            let record = self.enforce_path(path);
            self.emit(&record);
            records.push(record);
        }
        self.shared.set_state(LoopState::Watching);

        let backups_removed = self.sweep_backups();

        TickOutcome {
            tick_number,
            skipped: false,
            records,
            backups_removed,
            exit: None,
        }
    }

    fn enforce_path(&mut self, path: &MonitoredPath) -> EnforcementRecord {
        let store = self.opener.open(path);
        if !store.exists() && !store.can_create() {
            return EnforcementRecord::new(&path.path, Outcome::NoOp).with_detail("store absent");
        }

        let observed = self
            .settings
            .retry
            .run(|| self.detector.observe(path, store.as_ref()));
        let observation = match observed.result {
            Ok(o) => o,
            Err(e) if e.is_locked() => {
                return EnforcementRecord::new(&path.path, Outcome::Deferred).with_detail(format!(
                    "read locked after {} attempts: {}",
                    observed.attempts, e
                ));
            }
            Err(e) => {
                log_event!(
                    self.ctx,
                    WARN,
                    event_names::DETECT_READ_FAILED,
                    Stage::Detect,
                    "failed to read identity store",
                    path = path.path.display().to_string().as_str(),
                    error = e.to_string().as_str()
                );
                return EnforcementRecord::new(&path.path, Outcome::Failed)
                    .with_detail(e.to_string());
            }
        };

        match observation.classification {
            Classification::NoOp => EnforcementRecord::new(&path.path, Outcome::NoOp),
            Classification::InFlightReplace { artifact, deltas } => {
                log_event!(
                    self.ctx,
                    DEBUG,
                    event_names::DETECT_IN_FLIGHT,
                    Stage::Detect,
                    "IDE replace in flight; deferring",
                    path = path.path.display().to_string().as_str(),
                    artifact = artifact.display().to_string().as_str()
                );
                EnforcementRecord::new(&path.path, Outcome::Deferred)
                    .with_fields(&deltas)
                    .with_detail(format!("in-flight replace: {}", artifact.display()))
            }
            Classification::Drift { deltas } => {
                self.shared.set_state(LoopState::DriftDetected);
                log_event!(
                    self.ctx,
                    INFO,
                    event_names::DETECT_DRIFT,
                    Stage::Detect,
                    "identity drift detected",
                    path = path.path.display().to_string().as_str(),
                    fields = deltas.len() as u64
                );
                self.correct(path, store.as_ref(), &deltas)
            }
        }
    }

    fn correct(
        &mut self,
        path: &MonitoredPath,
        store: &dyn IdentityStore,
        deltas: &[FieldDelta],
    ) -> EnforcementRecord {
        self.shared.set_state(LoopState::Correcting);
        let protect = self.config.feature_flags.enable_enhanced_protection
            && path.kind == StorageKind::FlatJson;

        if protect {
            if let Err(e) = self.protector.unprotect(&path.path) {
                log_event!(
                    self.ctx,
                    WARN,
                    event_names::CORRECT_PROTECTION,
                    Stage::Correct,
                    "could not clear read-only flag",
                    path = path.path.display().to_string().as_str(),
                    error = e.to_string().as_str()
                );
            }
        }

        // Every drifted field in one write.
        let expected: IdentityFields = deltas
            .iter()
            .map(|d| (d.field.clone(), d.target.clone()))
            .collect();
        let written = self.settings.retry.run(|| store.merge_write(&expected));
        let record = EnforcementRecord::new(&path.path, Outcome::Corrected).with_fields(deltas);

        match written.result {
            Ok(()) => {
                if protect {
                    if let Err(e) = self.protector.protect(&path.path) {
                        log_event!(
                            self.ctx,
                            WARN,
                            event_names::CORRECT_PROTECTION,
                            Stage::Correct,
                            "could not mark store read-only",
                            path = path.path.display().to_string().as_str(),
                            error = e.to_string().as_str()
                        );
                    }
                }
                log_event!(
                    self.ctx,
                    INFO,
                    event_names::CORRECT_APPLIED,
                    Stage::Correct,
                    "identity corrected",
                    path = path.path.display().to_string().as_str(),
                    fields = deltas.len() as u64,
                    attempts = written.attempts
                );
                record
            }
            Err(e) if e.is_locked() => {
                log_event!(
                    self.ctx,
                    WARN,
                    event_names::CORRECT_DEFERRED,
                    Stage::Correct,
                    "store locked; deferring to next tick",
                    path = path.path.display().to_string().as_str(),
                    attempts = written.attempts
                );
                EnforcementRecord {
                    outcome: Outcome::Deferred,
                    ..record
                }
                .with_detail(format!("locked after {} attempts", written.attempts))
            }
            Err(e) => {
                log_event!(
                    self.ctx,
                    ERROR,
                    event_names::CORRECT_FAILED,
                    Stage::Correct,
                    "correction failed",
                    path = path.path.display().to_string().as_str(),
                    error = e.to_string().as_str()
                );
                EnforcementRecord {
                    outcome: Outcome::Failed,
                    ..record
                }
                .with_detail(e.to_string())
            }
        }
    }

    fn emit(&self, record: &EnforcementRecord) {
        self.shared.update_stats(|s| match record.outcome {
            Outcome::Corrected => s.corrections += 1,
            Outcome::Deferred => s.deferrals += 1,
            Outcome::Failed => s.failures += 1,
            Outcome::NoOp => {}
        });
        if record.outcome != Outcome::NoOp {
            self.shared.push_record(record);
            self.sink.record(record);
        }
    }

    fn sweep_backups(&self) -> usize {
        let Some(sweeper) = &self.sweeper else {
            return 0;
        };
        let report = sweeper.sweep();
        for removed in &report.removed {
            log_event!(
                self.ctx,
                INFO,
                event_names::CORRECT_BACKUP_REMOVED,
                Stage::Correct,
                "removed identity backup",
                path = removed.display().to_string().as_str()
            );
        }
        for (path, error) in &report.failed {
            log_event!(
                self.ctx,
                DEBUG,
                event_names::CORRECT_BACKUP_REMOVED,
                Stage::Correct,
                "could not remove identity backup",
                path = path.display().to_string().as_str(),
                error = error.as_str()
            );
        }
        let removed = report.removed.len();
        self.shared
            .update_stats(|s| s.backups_removed += removed as u64);
        removed
    }

    fn release_protection(&mut self) {
        for (path, error) in self.protector.release_all() {
            log_event!(
                self.ctx,
                WARN,
                event_names::CORRECT_PROTECTION,
                Stage::Correct,
                "could not restore write access",
                path = path.display().to_string().as_str(),
                error = error.to_string().as_str()
            );
        }
    }

    /// Stopping → Stopped. Write access is restored to protected stores.
    pub fn finish(&mut self, exit: LoopExit) -> LoopExit {
        self.shared.set_state(LoopState::Stopping);
        self.release_protection();
        self.shared.set_state(LoopState::Stopped);
        let stats = self.shared.stats();
        log_event!(
            self.ctx,
            INFO,
            event_names::GUARDIAN_STOPPED,
            Stage::Init,
            "guardian stopped",
            reason = match exit {
                LoopExit::Stopped => "stopped",
                LoopExit::LicenseInvalid => "license_invalid",
            },
            ticks = stats.ticks,
            corrections = stats.corrections
        );
        exit
    }

    /// Tick until `should_stop` returns true or the license lapses.
    ///
    /// `should_stop` is checked at every tick boundary and every
    /// `stop_check_interval` while waiting.
    pub fn run_until(&mut self, should_stop: impl Fn() -> bool) -> LoopExit {
        self.begin();
        let mut watcher = self.start_watcher();

        loop {
            if should_stop() {
                return self.finish(LoopExit::Stopped);
            }
            let paths_before = self.paths.clone();
            self.reload_config();
            if self.paths != paths_before && watcher.is_some() {
                watcher = self.start_watcher();
            }
            let outcome = self.tick();
            if let Some(exit) = outcome.exit {
                return self.finish(exit);
            }
            if self.wait_for_next_tick(watcher.as_ref(), &should_stop) {
                return self.finish(LoopExit::Stopped);
            }
        }
    }

    fn start_watcher(&self) -> Option<ChangeWatcher> {
        if !self.settings.watch_changes {
            return None;
        }
        match ChangeWatcher::start(&self.paths) {
            Ok(w) => Some(w),
            Err(reason) => {
                log_event!(
                    self.ctx,
                    INFO,
                    event_names::WATCH_POLL_ONLY,
                    Stage::Watch,
                    "change notifications unavailable; polling only",
                    reason = reason.as_str()
                );
                None
            }
        }
    }

    /// Wait out the poll interval. Returns `true` when a stop was requested.
    fn wait_for_next_tick(
        &self,
        watcher: Option<&ChangeWatcher>,
        should_stop: &impl Fn() -> bool,
    ) -> bool {
        let deadline = Instant::now() + self.settings.poll_interval;
        loop {
            if should_stop() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let slice = self.settings.stop_check_interval.min(deadline - now);
            match watcher {
                Some(w) if w.wait(slice) => {
                    log_event!(
                        self.ctx,
                        DEBUG,
                        event_names::WATCH_WAKE,
                        Stage::Watch,
                        "store changed; ticking early"
                    );
                    return should_stop();
                }
                Some(_) => {}
                None => std::thread::sleep(slice),
            }
        }
    }
}
