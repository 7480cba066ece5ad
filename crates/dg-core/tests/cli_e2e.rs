//! End-to-end tests of the `devguard` binary.

use assert_cmd::Command;
use predicates::prelude::*;

fn devguard(channel: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("devguard").unwrap();
    cmd.env("DG_CHANNEL_DIR", channel)
        .env("DG_LOG", "error")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_version_json() {
    let dir = tempfile::tempdir().unwrap();
    devguard(dir.path())
        .args(["version", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("devguard_version"));
}

#[test]
fn test_schema_describes_config() {
    let dir = tempfile::tempdir().unwrap();
    devguard(dir.path())
        .arg("schema")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("targetIdentity")
                .and(predicate::str::contains("selectedIDE"))
                .and(predicate::str::contains("featureFlags")),
        );
}

#[test]
fn test_status_without_guardian() {
    let dir = tempfile::tempdir().unwrap();
    devguard(dir.path())
        .args(["status", "--ide-home"])
        .arg(dir.path())
        .assert()
        .code(2)
        .stdout(predicate::str::contains("\"isGuarding\": false"));
}

#[test]
fn test_stop_without_guardian_is_clean() {
    let dir = tempfile::tempdir().unwrap();
    devguard(dir.path())
        .args(["stop", "--ide-home"])
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("not_running"));
}

#[test]
fn test_malformed_identity_rejected() {
    let dir = tempfile::tempdir().unwrap();
    devguard(dir.path())
        .args(["start", "--ide", "cursor", "--identity", "no-separator", "--ide-home"])
        .arg(dir.path())
        .assert()
        .code(16)
        .stderr(predicate::str::contains("ERR_IDENTITY"));
    assert!(!dir.path().join("guardian-config.json").exists());
}

#[test]
fn test_missing_config_file() {
    let dir = tempfile::tempdir().unwrap();
    devguard(dir.path())
        .args(["start", "--config"])
        .arg(dir.path().join("absent.json"))
        .assert()
        .code(11);
}

#[test]
fn test_identity_cached_and_forced() {
    let dir = tempfile::tempdir().unwrap();
    let cache = dir.path().join("cache");
    let run = |extra: &[&str]| -> serde_json::Value {
        let output = devguard(dir.path())
            .arg("identity")
            .arg("--cache-dir")
            .arg(&cache)
            .args(extra)
            .output()
            .unwrap();
        assert!(output.status.success());
        serde_json::from_slice(&output.stdout).unwrap()
    };

    let first = run(&[]);
    assert_eq!(first["source"], "generated");
    let second = run(&[]);
    assert_eq!(second["source"], "primary_cache");
    assert_eq!(first["seed"], second["seed"]);
    assert_eq!(first["targetIdentity"], second["targetIdentity"]);

    let forced = run(&["--force-new"]);
    assert_ne!(forced["seed"], first["seed"]);
}

#[cfg(all(unix, feature = "test-utils"))]
mod standalone {
    use super::*;
    use dg_common::identity::fields;
    use dg_common::IdeVariant;
    use dg_core::test_utils::{wait_until, IdeFixture};
    use std::time::Duration;

    const DEV_TARGET: &str = "abcdef01-2345-4678-89ab-cdef01234567";

    fn guarded(dir: &std::path::Path) -> Command {
        let mut cmd = devguard(&dir.join("chan"));
        cmd.env("DG_IDE_HOME", dir.join("home"))
            .env("DG_ACTIVATION_FILE", dir.join("activation.json"))
            .env("DG_POLL_INTERVAL_MS", "20")
            .env("DG_NO_WATCH", "1");
        cmd
    }

    #[test]
    fn test_start_status_stop() {
        let dir = tempfile::tempdir().unwrap();
        let fixture = IdeFixture::new(&dir.path().join("home"), IdeVariant::Cursor);
        fixture.write_json(&[("window.zoom", "1"), (fields::DEV_DEVICE_ID, "before")]);
        std::fs::write(dir.path().join("activation.json"), r#"{"activation": {}}"#).unwrap();

        guarded(dir.path())
            .args(["start", "--ide", "cursor", "--no-database-monitoring", "--identity"])
            .arg(format!("{}={}", fields::DEV_DEVICE_ID, DEV_TARGET))
            .assert()
            .success()
            .stdout(predicate::str::contains("\"success\": true"));

        assert!(wait_until(Duration::from_secs(10), || {
            fixture.json_value(fields::DEV_DEVICE_ID).as_deref() == Some(DEV_TARGET)
        }));
        assert_eq!(fixture.json_value("window.zoom").as_deref(), Some("1"));

        guarded(dir.path())
            .arg("status")
            .assert()
            .code(1)
            .stdout(
                predicate::str::contains("\"isGuarding\": true")
                    .and(predicate::str::contains("\"selectedIDE\": \"cursor\"")),
            );

        guarded(dir.path())
            .arg("stop")
            .assert()
            .success()
            .stdout(predicate::str::contains("\"result\": \"stopped\""));

        guarded(dir.path()).arg("status").assert().code(2);
        assert!(!dir.path().join("chan").join("guardian-config.json").exists());
    }
}
