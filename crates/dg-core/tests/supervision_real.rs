#![cfg(all(feature = "test-utils", unix))]

//! Supervision against real processes: stale PID files and a real
//! standalone guardian launched from the built binary.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dg_common::identity::fields;
use dg_common::{FeatureFlags, GuardianConfig, IdeVariant, ProcessId, TargetIdentity};
use dg_core::channel::ChannelPaths;
use dg_core::enforce::{LoopSettings, NullSink};
use dg_core::inspector;
use dg_core::license::{SharedFlagGate, ENV_ACTIVATION_FILE};
use dg_core::settings::{ENV_IDE_HOME, ENV_NO_WATCH, ENV_POLL_INTERVAL_MS};
use dg_core::store::DiskStoreOpener;
use dg_core::supervisor::{
    DetachedLauncher, InProcessDeps, ProcessSupervisor, StopOutcome, SupervisorSettings,
};
use dg_core::test_utils::{wait_until, IdeFixture, ProcessHandle};
use dg_core::variant::IdeLayout;

const DEV_TARGET: &str = "0f0f0f0f-1111-4222-8333-444444444444";

fn supervisor(channel_dir: &Path, home: &Path, launcher: DetachedLauncher) -> ProcessSupervisor {
    let mut loop_settings = LoopSettings::new(IdeLayout::with_home(home));
    loop_settings.poll_interval = Duration::from_millis(20);
    loop_settings.watch_changes = false;
    loop_settings.temp_dir = None;
    ProcessSupervisor::new(
        ChannelPaths::new(channel_dir),
        inspector::system_inspector(),
        Arc::new(launcher),
        InProcessDeps {
            loop_settings,
            opener: Arc::new(DiskStoreOpener),
            gate: Arc::new(SharedFlagGate::new(true)),
            sink: Arc::new(NullSink),
        },
    )
    .with_settings(SupervisorSettings {
        stop_timeout: Duration::from_secs(5),
        startup_grace: Duration::from_millis(200),
        poll_interval: Duration::from_millis(20),
    })
}

fn config() -> GuardianConfig {
    GuardianConfig::new(
        TargetIdentity::new().with_field(fields::DEV_DEVICE_ID, DEV_TARGET),
        IdeVariant::VsCode,
    )
    .with_feature_flags(FeatureFlags {
        enable_backup_monitoring: false,
        enable_database_monitoring: false,
        enable_enhanced_protection: false,
    })
}

#[test]
fn test_reused_pid_is_not_a_guardian() {
    let dir = tempfile::tempdir().unwrap();
    let sleeper = ProcessHandle::spawn_sleep(60).expect("spawn sleep");
    let channel = ChannelPaths::new(dir.path().join("chan"));
    channel.write_config(&config()).unwrap();
    channel.write_pid(ProcessId(sleeper.pid())).unwrap();

    let sup = supervisor(
        channel.dir(),
        &dir.path().join("home"),
        DetachedLauncher::new("/usr/local/bin/devguard"),
    );
    assert_eq!(sup.reconcile().unwrap(), None);
    assert!(!channel.pid_path().exists());
    assert!(sleeper.is_running());
}

#[test]
fn test_stop_never_signals_unrelated_process() {
    let dir = tempfile::tempdir().unwrap();
    let sleeper = ProcessHandle::spawn_sleep(60).expect("spawn sleep");
    let channel = ChannelPaths::new(dir.path().join("chan"));
    channel.write_pid(ProcessId(sleeper.pid())).unwrap();

    let mut sup = supervisor(
        channel.dir(),
        &dir.path().join("home"),
        DetachedLauncher::new("/usr/local/bin/devguard"),
    );
    let outcome = sup.stop_standalone().unwrap();
    assert_eq!(
        outcome,
        StopOutcome::StaleCleared {
            pid: ProcessId(sleeper.pid())
        }
    );
    std::thread::sleep(Duration::from_millis(50));
    assert!(sleeper.is_running());
}

#[test]
fn test_start_over_stale_pid_file() {
    let dir = tempfile::tempdir().unwrap();
    let home = dir.path().join("home");
    IdeFixture::new(&home, IdeVariant::VsCode);
    let activation = dir.path().join("activation.json");
    std::fs::write(&activation, r#"{"activation": {}}"#).unwrap();
    let sleeper = ProcessHandle::spawn_sleep(60).expect("spawn sleep");

    let channel_dir = dir.path().join("chan");
    let channel = ChannelPaths::new(&channel_dir);
    channel.write_pid(ProcessId(sleeper.pid())).unwrap();

    let launcher = DetachedLauncher::new(env!("CARGO_BIN_EXE_devguard"))
        .with_env(ENV_IDE_HOME, &home)
        .with_env(ENV_ACTIVATION_FILE, &activation)
        .with_env(ENV_POLL_INTERVAL_MS, "20")
        .with_env(ENV_NO_WATCH, "1");
    let mut sup = supervisor(&channel_dir, &home, launcher);

    let handle = sup.start_standalone(config()).expect("start standalone");
    assert_ne!(handle.pid, ProcessId(sleeper.pid()));
    assert_eq!(channel.read_pid().unwrap(), Some(handle.pid));
    std::thread::sleep(Duration::from_millis(50));
    assert!(sleeper.is_running());

    assert_eq!(
        sup.stop_standalone().unwrap(),
        StopOutcome::Stopped { pid: handle.pid }
    );
    assert!(sleeper.is_running());
}

#[test]
fn test_standalone_guardian_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let home = dir.path().join("home");
    let fixture = IdeFixture::new(&home, IdeVariant::VsCode);
    fixture.write_json(&[("keep", "me"), (fields::DEV_DEVICE_ID, "stale")]);
    let activation = dir.path().join("activation.json");
    std::fs::write(&activation, r#"{"activation": {}}"#).unwrap();

    let launcher = DetachedLauncher::new(env!("CARGO_BIN_EXE_devguard"))
        .with_env(ENV_IDE_HOME, &home)
        .with_env(ENV_ACTIVATION_FILE, &activation)
        .with_env(ENV_POLL_INTERVAL_MS, "20")
        .with_env(ENV_NO_WATCH, "1");
    let channel_dir = dir.path().join("chan");
    let mut sup = supervisor(&channel_dir, &home, launcher);

    let handle = sup.start_standalone(config()).expect("start standalone");
    assert_eq!(sup.reconcile().unwrap(), Some(handle.pid));
    assert!(wait_until(Duration::from_secs(10), || {
        fixture.json_value(fields::DEV_DEVICE_ID).as_deref() == Some(DEV_TARGET)
    }));
    assert_eq!(fixture.json_value("keep").as_deref(), Some("me"));
    assert!(sup.status().is_guarding());

    let outcome = sup.stop_standalone().unwrap();
    assert_eq!(outcome, StopOutcome::Stopped { pid: handle.pid });
    let channel = ChannelPaths::new(&channel_dir);
    assert!(!channel.config_path().exists());
    assert!(!channel.pid_path().exists());
    let log = channel.recent_log_lines(10);
    assert!(log.iter().any(|l| l.contains("corrected")));
}

#[test]
fn test_standalone_exits_when_license_lapses() {
    let dir = tempfile::tempdir().unwrap();
    let home = dir.path().join("home");
    IdeFixture::new(&home, IdeVariant::VsCode);
    let activation = dir.path().join("activation.json");
    std::fs::write(&activation, r#"{"activation": {}}"#).unwrap();

    let launcher = DetachedLauncher::new(env!("CARGO_BIN_EXE_devguard"))
        .with_env(ENV_IDE_HOME, &home)
        .with_env(ENV_ACTIVATION_FILE, &activation)
        .with_env(ENV_POLL_INTERVAL_MS, "20")
        .with_env(ENV_NO_WATCH, "1");
    let channel_dir = dir.path().join("chan");
    let mut sup = supervisor(&channel_dir, &home, launcher);
    sup.start_standalone(config()).expect("start standalone");

    std::fs::remove_file(&activation).unwrap();
    let channel = ChannelPaths::new(&channel_dir);
    assert!(wait_until(Duration::from_secs(10), || {
        !channel.config_path().exists() && !channel.pid_path().exists()
    }));
    assert!(!sup.status().is_guarding());
}
