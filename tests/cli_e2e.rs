//! End-to-end CLI tests for the downloader-compat binary.

#![allow(deprecated)]

mod support;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

use support::socket_guard::start_mock_server_or_skip;

/// Binary isolated from the user's config and log settings.
fn compat_cmd(config_home: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("downloader-compat").unwrap();
    cmd.env("XDG_CONFIG_HOME", config_home.path())
        .env_remove("RUST_LOG")
        .env_remove("ANDROID_FDSAN_DISABLED")
        .env("NO_COLOR", "1");
    cmd
}

#[test]
fn test_binary_help_displays_usage() {
    let home = TempDir::new().unwrap();
    compat_cmd(&home)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("compatibility layer"));
}

#[test]
fn test_binary_invalid_flag_returns_error() {
    let home = TempDir::new().unwrap();
    compat_cmd(&home)
        .arg("--invalid-flag")
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"));
}

#[test]
fn test_default_command_prints_capability_table() {
    let home = TempDir::new().unwrap();
    compat_cmd(&home)
        .arg("-q")
        .assert()
        .success()
        .stdout(predicate::str::contains("posix_semaphore"))
        .stdout(predicate::str::contains("I/O provider"));
}

#[test]
fn test_report_json_with_forced_emulation() {
    let home = TempDir::new().unwrap();
    let output = compat_cmd(&home)
        .args(["-q", "--force-emulate", "shm,sem,fork", "report", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["cpu_count"], 1);
    assert_eq!(report["tracker_neutralized"], true);
    assert_eq!(report["io_provider"], "resilient");
    for row in report["categories"].as_array().unwrap() {
        assert_eq!(row["backing"], "emulated");
    }
    let symbols: Vec<&str> = report["patches"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|patch| patch["symbol"].as_str())
        .collect();
    assert!(symbols.contains(&"sem_open"));
    assert!(symbols.contains(&"cpu_count"));
    assert!(symbols.contains(&"ensure_running"));
}

#[test]
fn test_check_passes_with_forced_emulation() {
    let home = TempDir::new().unwrap();
    compat_cmd(&home)
        .args(["-q", "--force-emulate", "shm,sem,fork", "check"])
        .assert()
        .success()
        .stdout(predicate::str::contains("PASS  Queue"))
        .stdout(predicate::str::contains("0 failed"));
}

#[test]
fn test_config_file_selects_native_io() {
    let home = TempDir::new().unwrap();
    let config_dir = home.path().join("downloader-compat");
    std::fs::create_dir_all(&config_dir).unwrap();
    std::fs::write(
        config_dir.join("config.toml"),
        "resilient_io = false\nforce_emulate = \"fork\" # no fork in tests\n",
    )
    .unwrap();

    let output = compat_cmd(&home)
        .args(["-q", "report", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["io_provider"], "native");
    assert_eq!(report["categories"][2]["category"], "process_fork");
    assert_eq!(report["categories"][2]["backing"], "emulated");
}

#[test]
fn test_fdsan_env_zero_keeps_diagnostic() {
    let home = TempDir::new().unwrap();
    let output = compat_cmd(&home)
        .env("ANDROID_FDSAN_DISABLED", "0")
        .args(["-q", "--force-emulate", "shm,sem,fork", "report", "--json"])
        .output()
        .unwrap();
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["diagnostic"], "left_enabled");
}

#[cfg(all(unix, not(target_os = "android")))]
#[test]
fn test_binary_exports_fdsan_flag_before_bootstrap() {
    let home = TempDir::new().unwrap();
    let output = compat_cmd(&home)
        .args(["-q", "--force-emulate", "shm,sem,fork", "report", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["diagnostic"], "environment_only");
}

#[test]
fn test_invalid_config_file_fails_with_line_number() {
    let home = TempDir::new().unwrap();
    let config = home.path().join("compat.toml");
    std::fs::write(&config, "neutralize_stdin = true\nretries = 3\n").unwrap();

    compat_cmd(&home)
        .arg("--config")
        .arg(&config)
        .arg("report")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown configuration key"))
        .stderr(predicate::str::contains("line 2"));
}

#[test]
fn test_missing_explicit_config_fails() {
    let home = TempDir::new().unwrap();
    compat_cmd(&home)
        .arg("--config")
        .arg(home.path().join("nope.toml"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read config file"));
}

#[tokio::test]
async fn test_fetch_writes_body_to_output() {
    let Some(mock_server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/paper.pdf"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"%PDF-1.4 body".to_vec()))
        .mount(&mock_server)
        .await;

    let home = TempDir::new().unwrap();
    let output = home.path().join("paper.pdf");
    compat_cmd(&home)
        .args(["-q", "--force-emulate", "shm,sem,fork", "fetch"])
        .arg(format!("{}/paper.pdf", mock_server.uri()))
        .arg("--output")
        .arg(&output)
        .assert()
        .success();
    assert_eq!(std::fs::read(&output).unwrap(), b"%PDF-1.4 body");
}

#[tokio::test]
async fn test_fetch_http_error_exits_non_zero() {
    let Some(mock_server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mock_server)
        .await;

    let home = TempDir::new().unwrap();
    let output = home.path().join("missing.pdf");
    compat_cmd(&home)
        .args(["-q", "--force-emulate", "shm,sem,fork", "fetch"])
        .arg(format!("{}/missing", mock_server.uri()))
        .arg("--output")
        .arg(&output)
        .assert()
        .failure()
        .stderr(predicate::str::contains("HTTP 404"));
    assert!(!output.exists());
}

#[test]
fn test_fetch_invalid_url_exits_non_zero() {
    let home = TempDir::new().unwrap();
    compat_cmd(&home)
        .args(["-q", "fetch", "not a url", "--output"])
        .arg(home.path().join("a").join("b.pdf"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid URL"));
}
