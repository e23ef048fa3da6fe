//! Smoke tests -- verify the binary runs and key subcommands work.

use assert_cmd::Command;
use predicates::prelude::*;

fn cli() -> Command {
    let mut cmd = Command::cargo_bin("iruka-qa").unwrap();
    cmd.env_remove("IRUKA_QA_CONFIG")
        .env_remove("IRUKA_CALLBACK_SECRET")
        .env_remove("IRUKA_ALLOWED_DOMAINS")
        .env_remove("GAME_URL")
        .env_remove("RUN_DIR");
    cmd
}

/// A config file whose database lives in `dir`.
fn config_in(dir: &std::path::Path) -> std::path::PathBuf {
    let path = dir.join("iruka-qa.toml");
    let body = format!(
        "[server]\ndb_path = {:?}\nruns_dir = {:?}\n\n[submission]\nallowed_domains = [\"example.com\"]\n",
        dir.join("qa.db"),
        dir.join("runs"),
    );
    std::fs::write(&path, body).unwrap();
    path
}

#[test]
fn test_cli_help() {
    cli()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("release gating for game builds"));
}

#[test]
fn test_cli_version() {
    cli()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("iruka-qa"));
}

#[test]
fn test_subcommands_exist() {
    for args in [
        vec!["serve", "--help"],
        vec!["run", "--help"],
        vec!["verify-signature", "--help"],
        vec!["harness", "--help"],
        vec!["version", "history", "--help"],
    ] {
        cli().args(&args).assert().success();
    }
}

#[test]
fn test_verify_signature() {
    let dir = tempfile::TempDir::new().unwrap();
    let body_file = dir.path().join("body.json");
    std::fs::write(&body_file, br#"{"runId":"r1","status":"pass"}"#).unwrap();
    let good = iruka_qa::callback::sign(b"s3cret", br#"{"runId":"r1","status":"pass"}"#);

    cli()
        .args(["verify-signature", "--secret", "s3cret", "--signature", &good, "--body-file"])
        .arg(&body_file)
        .assert()
        .success()
        .stdout("valid\n");

    cli()
        .args(["verify-signature", "--secret", "other", "--signature", &good, "--body-file"])
        .arg(&body_file)
        .assert()
        .failure()
        .stdout("invalid\n");
}

#[test]
fn test_version_lifecycle_via_cli() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = config_in(dir.path());

    let out = cli()
        .arg("--config")
        .arg(&config)
        .args([
            "version",
            "create",
            "--game-id",
            "dolphin",
            "--label",
            "1.0.0",
            "--game-url",
            "https://cdn.example.com/dolphin/index.html",
        ])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let created: serde_json::Value = serde_json::from_slice(&out).unwrap();
    let id = created["id"].as_str().unwrap().to_string();
    assert_eq!(created["status"], "draft");

    cli()
        .arg("--config")
        .arg(&config)
        .args(["version", "submit", &id])
        .assert()
        .failure()
        .stderr(predicate::str::contains("attestations missing"));

    cli()
        .arg("--config")
        .arg(&config)
        .args(["version", "submit", &id, "--attest"])
        .assert()
        .success()
        .stdout(predicate::str::contains("draft -> uploaded"));

    cli()
        .arg("--config")
        .arg(&config)
        .args(["version", "history", &id])
        .assert()
        .success()
        .stdout(predicate::str::contains("draft -> uploaded"));
}

#[test]
fn test_version_create_rejects_foreign_host() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = config_in(dir.path());

    cli()
        .arg("--config")
        .arg(&config)
        .args([
            "version",
            "create",
            "--game-id",
            "x",
            "--label",
            "1",
            "--game-url",
            "https://evil.test/x",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("evil.test"));
}

#[test]
fn test_harness_records_timeout_when_frame_is_silent() {
    let dir = tempfile::TempDir::new().unwrap();
    let run_dir = dir.path().join("run");

    cli()
        .args([
            "harness",
            "--game-url",
            "https://cdn.example.com/dolphin/index.html",
            "--timeout-ms",
            "50",
            "--run-dir",
        ])
        .arg(&run_dir)
        .write_stdin("")
        .assert()
        .code(1)
        .stdout(predicate::str::contains(r#""op":"navigate""#))
        .stdout(predicate::str::contains(r#""type":"INIT""#));

    let dump: serde_json::Value =
        serde_json::from_slice(&std::fs::read(run_dir.join("bridge-artifacts.json")).unwrap()).unwrap();
    assert_eq!(dump["metadata"]["waitTimeout"]["type"], "READY");
    assert_eq!(dump["entries"][0]["type"], "INIT");
}
