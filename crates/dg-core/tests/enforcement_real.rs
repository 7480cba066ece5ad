#![cfg(feature = "test-utils")]

//! Enforcement against real on-disk IDE layouts.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use dg_common::identity::fields;
use dg_common::{FeatureFlags, GuardianConfig, IdeVariant, TargetIdentity};
use dg_core::enforce::{EnforcementLoop, LoopExit, LoopSettings, MemorySink, Outcome};
use dg_core::license::SharedFlagGate;
use dg_core::store::{DiskStoreOpener, RetryPolicy};
use dg_core::test_utils::IdeFixture;

const DEV_TARGET: &str = "11111111-2222-4333-8444-555555555555";
const MACHINE_TARGET: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

fn target() -> TargetIdentity {
    TargetIdentity::from_pairs([
        (fields::DEV_DEVICE_ID, DEV_TARGET),
        (fields::MACHINE_ID, MACHINE_TARGET),
    ])
}

fn flags(database: bool) -> FeatureFlags {
    FeatureFlags {
        enable_backup_monitoring: false,
        enable_database_monitoring: database,
        enable_enhanced_protection: false,
    }
}

fn guardian(fixture: &IdeFixture, flags: FeatureFlags, gate: &SharedFlagGate) -> EnforcementLoop {
    let mut settings = LoopSettings::new(fixture.layout.clone());
    settings.poll_interval = Duration::from_millis(10);
    settings.stop_check_interval = Duration::from_millis(5);
    settings.watch_changes = false;
    settings.temp_dir = None;
    settings.retry = RetryPolicy {
        max_attempts: 2,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
    };
    EnforcementLoop::new(
        GuardianConfig::new(target(), fixture.variant).with_feature_flags(flags),
        settings,
        Arc::new(DiskStoreOpener),
        Arc::new(gate.clone()),
        Arc::new(MemorySink::new()),
    )
}

fn stale_json(fixture: &IdeFixture) {
    fixture.write_json(&[
        ("window.theme", "dark"),
        (fields::DEV_DEVICE_ID, "old-dev"),
        (fields::MACHINE_ID, "old-machine"),
        ("telemetry.firstSessionDate", "Mon, 01 Jan 2024"),
    ]);
}

#[test]
fn test_drift_corrected_in_both_stores() {
    let home = tempfile::tempdir().unwrap();
    let fixture = IdeFixture::new(home.path(), IdeVariant::Cursor);
    stale_json(&fixture);
    fixture.create_kv(&[
        (fields::DEV_DEVICE_ID, "old-dev"),
        ("workbench.panel", "{\"open\":true}"),
    ]);

    let gate = SharedFlagGate::new(true);
    let mut lp = guardian(&fixture, flags(true), &gate);
    let outcome = lp.tick();
    assert_eq!(outcome.count(Outcome::Corrected), 2);

    assert_eq!(fixture.json_value(fields::DEV_DEVICE_ID).as_deref(), Some(DEV_TARGET));
    assert_eq!(fixture.json_value(fields::MACHINE_ID).as_deref(), Some(MACHINE_TARGET));
    assert_eq!(fixture.json_value("window.theme").as_deref(), Some("dark"));
    let keys: Vec<String> = fixture.read_json().keys().cloned().collect();
    assert_eq!(keys[0], "window.theme");
    assert_eq!(keys[3], "telemetry.firstSessionDate");

    assert_eq!(fixture.kv_value(fields::DEV_DEVICE_ID).as_deref(), Some(DEV_TARGET));
    assert_eq!(fixture.kv_value(fields::MACHINE_ID).as_deref(), Some(MACHINE_TARGET));
    assert_eq!(fixture.kv_value("workbench.panel").as_deref(), Some("{\"open\":true}"));
}

#[test]
fn test_second_tick_is_noop() {
    let home = tempfile::tempdir().unwrap();
    let fixture = IdeFixture::new(home.path(), IdeVariant::VsCode);
    stale_json(&fixture);

    let gate = SharedFlagGate::new(true);
    let mut lp = guardian(&fixture, flags(false), &gate);
    assert_eq!(lp.tick().count(Outcome::Corrected), 1);
    let after_first = std::fs::read_to_string(fixture.json_path()).unwrap();

    let second = lp.tick();
    assert_eq!(second.count(Outcome::NoOp), second.records.len());
    assert_eq!(std::fs::read_to_string(fixture.json_path()).unwrap(), after_first);
    assert_eq!(lp.shared().stats().corrections, 1);
}

#[test]
fn test_in_flight_replace_waits_for_next_tick() {
    let home = tempfile::tempdir().unwrap();
    let fixture = IdeFixture::new(home.path(), IdeVariant::Cursor);
    stale_json(&fixture);
    let temp = fixture.storage_dir().join("storage.json.vsctmp");
    std::fs::write(&temp, "{}").unwrap();
    let before = std::fs::read_to_string(fixture.json_path()).unwrap();

    let gate = SharedFlagGate::new(true);
    let mut lp = guardian(&fixture, flags(false), &gate);
    let deferred = lp.tick();
    assert_eq!(deferred.count(Outcome::Deferred), 1);
    assert_eq!(std::fs::read_to_string(fixture.json_path()).unwrap(), before);
    assert!(temp.exists());

    std::fs::remove_file(&temp).unwrap();
    assert_eq!(lp.tick().count(Outcome::Corrected), 1);
    assert_eq!(fixture.json_value(fields::DEV_DEVICE_ID).as_deref(), Some(DEV_TARGET));
}

#[test]
fn test_locked_database_deferred_then_corrected() {
    let home = tempfile::tempdir().unwrap();
    let fixture = IdeFixture::new(home.path(), IdeVariant::Cursor);
    fixture.create_kv(&[(fields::DEV_DEVICE_ID, "old-dev")]);

    let gate = SharedFlagGate::new(true);
    let mut lp = guardian(&fixture, flags(true), &gate);

    let lock = fixture.lock_kv();
    let contended = lp.tick();
    let kv = contended
        .records
        .iter()
        .find(|r| r.path == fixture.kv_path())
        .unwrap();
    assert_eq!(kv.outcome, Outcome::Deferred);
    assert!(contended.exit.is_none());
    drop(lock);

    let freed = lp.tick();
    let kv = freed.records.iter().find(|r| r.path == fixture.kv_path()).unwrap();
    assert_eq!(kv.outcome, Outcome::Corrected);
    assert_eq!(fixture.kv_value(fields::DEV_DEVICE_ID).as_deref(), Some(DEV_TARGET));
}

#[test]
fn test_license_revocation_stops_loop() {
    let home = tempfile::tempdir().unwrap();
    let fixture = IdeFixture::new(home.path(), IdeVariant::Cursor);
    stale_json(&fixture);

    let gate = SharedFlagGate::new(true);
    let handle = gate.handle();
    let mut lp = guardian(&fixture, flags(false), &gate);
    let shared = lp.shared();

    let runner = std::thread::spawn(move || lp.run_until(|| false));
    assert!(dg_core::test_utils::wait_until(Duration::from_secs(5), || {
        shared.stats().ticks >= 2
    }));
    handle.store(false, Ordering::SeqCst);
    assert_eq!(runner.join().unwrap(), LoopExit::LicenseInvalid);
    assert!(!shared.is_guarding());

    // No writes after the stop.
    stale_json(&fixture);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(fixture.json_value(fields::DEV_DEVICE_ID).as_deref(), Some("old-dev"));
}

#[test]
fn test_backup_copies_swept() {
    let home = tempfile::tempdir().unwrap();
    let fixture = IdeFixture::new(home.path(), IdeVariant::VsCode);
    stale_json(&fixture);
    let bak = fixture.storage_dir().join("storage.json.bak");
    let old = fixture.storage_dir().join("state.vscdb.old");
    std::fs::write(&bak, "{}").unwrap();
    std::fs::write(&old, "").unwrap();

    let gate = SharedFlagGate::new(true);
    let mut lp = guardian(
        &fixture,
        FeatureFlags {
            enable_backup_monitoring: true,
            ..flags(true)
        },
        &gate,
    );
    let outcome = lp.tick();
    assert_eq!(outcome.backups_removed, 2);
    assert!(!bak.exists());
    assert!(!old.exists());
    assert!(fixture.json_path().exists());
}
