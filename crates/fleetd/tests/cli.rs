//! Command-line tests against the built `fleetd` binary.

use std::process::Command;

fn fleetd() -> Command {
    Command::new(env!("CARGO_BIN_EXE_fleetd"))
}

#[test]
fn default_config_is_valid_toml() {
    let output = fleetd().arg("default-config").output().unwrap();
    assert!(output.status.success());

    let text = String::from_utf8(output.stdout).unwrap();
    assert!(text.contains("[manager]"));
    assert!(text.contains("reconcile_interval = \"30s\""));

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fleet.toml");
    std::fs::write(&path, text).unwrap();
    let status = fleetd()
        .args(["check", "--config"])
        .arg(&path)
        .status()
        .unwrap();
    assert!(status.success());
}

#[test]
fn check_accepts_seeded_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fleet.toml");
    std::fs::write(
        &path,
        r#"
[runtime]
profile = "test"

[[services]]
name = "billing"
source = "./services/billing"
command = ["./run.sh"]
"#,
    )
    .unwrap();

    let output = fleetd()
        .args(["check", "--config"])
        .arg(&path)
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("1 seed service(s)"));
    assert!(stdout.contains("profile test"));
}

#[test]
fn check_rejects_unknown_profile() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fleet.toml");
    std::fs::write(&path, "[runtime]\nprofile = \"kubernetes\"\n").unwrap();

    let output = fleetd()
        .args(["check", "--config"])
        .arg(&path)
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("unknown profile"));
}

#[test]
fn check_rejects_reserved_service_names() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fleet.toml");
    std::fs::write(
        &path,
        "[[services]]\nname = \"billing:v2\"\nsource = \"./billing\"\n",
    )
    .unwrap();

    let status = fleetd()
        .args(["check", "--config"])
        .arg(&path)
        .status()
        .unwrap();
    assert!(!status.success());
}
