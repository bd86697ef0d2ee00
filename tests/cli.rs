use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Command isolated from the user's configuration and data directory
fn sentinel(data: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("sentinel").unwrap();
    cmd.arg("--config")
        .arg(data.path().join("missing.toml"))
        .env("SENTINEL_DATA_DIR", data.path())
        .env("SENTINEL_CONTAINER_ENABLED", "false")
        .env_remove("RUST_LOG");
    cmd
}

fn has(binary: &str) -> bool {
    if which::which(binary).is_err() {
        eprintln!("skipping: {} not installed", binary);
        return false;
    }
    true
}

#[test]
fn test_cli_version() {
    let data = TempDir::new().unwrap();
    sentinel(&data)
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("sentinel 0.1.0"));
}

#[test]
fn test_cli_help() {
    let data = TempDir::new().unwrap();
    sentinel(&data)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Risk-assessed, sandboxed and audited code execution"));
}

#[test]
fn test_cli_exec_missing_language() {
    let data = TempDir::new().unwrap();
    sentinel(&data)
        .args(["exec", "print(1)"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("required arguments were not provided"));
}

#[test]
fn test_cli_scan_critical() {
    let data = TempDir::new().unwrap();
    sentinel(&data)
        .args(["scan", "--language", "python", "import os\nos.system('ls')\neval('1')"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"risk_level\": \"critical\""));
}

#[test]
fn test_cli_scan_reads_file() {
    let data = TempDir::new().unwrap();
    let source = data.path().join("clean.py");
    std::fs::write(&source, "print('hello')\n").unwrap();

    sentinel(&data)
        .args(["scan", "--language", "python", "--file"])
        .arg(&source)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"risk_level\": \"low\""));
}

#[test]
fn test_cli_exec_bash_reports_subprocess_isolation() {
    if !has("bash") {
        return;
    }
    let data = TempDir::new().unwrap();
    sentinel(&data)
        .args(["exec", "--language", "bash", "echo hi"])
        .assert()
        .success()
        .stdout(predicate::str::contains("hi"))
        .stderr(predicate::str::contains("isolation=subprocess"));

    let audit = std::fs::read_to_string(data.path().join("audit.jsonl")).unwrap();
    assert_eq!(audit.lines().count(), 1);
    assert!(data.path().join("performance.json").exists());
}

#[test]
fn test_cli_exec_json_response() {
    if !has("bash") {
        return;
    }
    let data = TempDir::new().unwrap();
    let output = sentinel(&data)
        .args(["exec", "--language", "bash", "--json", "echo json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let response: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(response["success"], true);
    assert_eq!(response["backend"], "subprocess");
    assert_eq!(response["security_level"], "subprocess");
    assert_eq!(response["risk_assessment"]["risk_level"], "low");
}

#[test]
fn test_cli_exec_denied_language() {
    let data = TempDir::new().unwrap();
    sentinel(&data)
        .args(["exec", "--language", "ruby", "puts 1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not allowed"));
}

#[test]
fn test_cli_directive_help() {
    let data = TempDir::new().unwrap();
    sentinel(&data)
        .args(["directive", "/help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("/container cleanup"));
}

#[test]
fn test_cli_directive_status() {
    let data = TempDir::new().unwrap();
    sentinel(&data)
        .env("SENTINEL_SECURITY_LEVEL", "maximum")
        .args(["directive", "/status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Security level: maximum"));
}

#[test]
fn test_cli_batch() {
    let data = TempDir::new().unwrap();
    let input = concat!(
        "{\"language\": \"slash\", \"code\": \"/help\"}\n",
        "not json\n",
        "{\"language\": \"cobol\", \"code\": \"DISPLAY 1\"}\n",
    );

    let output = sentinel(&data).arg("batch").write_stdin(input).output().unwrap();
    assert!(!output.status.success());

    let stdout = String::from_utf8(output.stdout).unwrap();
    let lines: Vec<serde_json::Value> = stdout
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0]["backend"], "command");
    assert_eq!(lines[1]["line"], 2);
    assert_eq!(lines[2]["failure"], "configuration_denied");
}

#[test]
fn test_cli_show_config() {
    let data = TempDir::new().unwrap();
    sentinel(&data)
        .env("SENTINEL_CONTAINER_RUNTIME", "docker")
        .arg("show-config")
        .assert()
        .success()
        .stdout(predicate::str::contains("[policy]"))
        .stdout(predicate::str::contains("runtime = \"docker\""));
}

#[test]
fn test_cli_invalid_config_file() {
    let data = TempDir::new().unwrap();
    let path = data.path().join("bad.toml");
    std::fs::write(&path, "[logging]\nlevel = \"loud\"\n").unwrap();

    Command::cargo_bin("sentinel")
        .unwrap()
        .arg("--config")
        .arg(&path)
        .arg("show-config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid log level"));
}
