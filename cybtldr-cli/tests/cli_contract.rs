//! Integration tests for core CLI contract behavior.

use {predicates::prelude::*, std::fs, tempfile::tempdir};

const IMAGE_V0: &str = "\
0102030405
:000010000401020304FF
:000011000401020304FE
";

fn cli_cmd() -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("cybtldr");
    // Keep the developer's environment out of the contract.
    for var in [
        "CYBTLDR_PORT",
        "CYBTLDR_BAUD",
        "CYBTLDR_KEY",
        "CYBTLDR_NON_INTERACTIVE",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    for flag in ["--help", "-h"] {
        cli_cmd()
            .arg(flag)
            .assert()
            .success()
            .code(0)
            .stdout(predicate::str::contains("cybtldr"))
            .stderr(predicate::str::is_empty());
    }
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    for flag in ["--version", "-V"] {
        cli_cmd()
            .arg(flag)
            .assert()
            .success()
            .stdout(predicate::str::contains("cybtldr"))
            .stderr(predicate::str::is_empty());
    }
}

#[test]
fn help_lists_bootload_commands() {
    cli_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("program"))
        .stdout(predicate::str::contains("erase"))
        .stdout(predicate::str::contains("verify"))
        .stdout(predicate::str::contains("info"));
}

#[test]
fn completions_bash_exits_zero() {
    cli_cmd()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("cybtldr"));
}

#[test]
fn completions_without_shell_is_usage_error() {
    cli_cmd()
        .arg("completions")
        .assert()
        .failure()
        .code(2)
        .stdout(predicate::str::is_empty());
}

#[test]
fn info_prints_image_summary_to_stderr() {
    let dir = tempdir().expect("tempdir should be created");
    let image = dir.path().join("app.cyacd");
    fs::write(&image, IMAGE_V0).expect("write image");

    cli_cmd()
        .arg("info")
        .arg(&image)
        .assert()
        .success()
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("0x01020304"))
        .stderr(predicate::str::contains("Rows: 2"));
}

#[test]
fn info_json_writes_valid_json_to_stdout() {
    let dir = tempdir().expect("tempdir should be created");
    let image = dir.path().join("app.cyacd");
    fs::write(&image, IMAGE_V0).expect("write image");

    let output = cli_cmd()
        .arg("info")
        .arg("--json")
        .arg(&image)
        .output()
        .expect("command should execute");
    assert!(output.status.success());

    let parsed: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout should be JSON");
    assert_eq!(parsed["ok"], true);
    assert_eq!(parsed["data"]["format_version"], 0);
    assert_eq!(parsed["data"]["silicon_id"], "0x01020304");
    assert_eq!(parsed["data"]["rows"], 2);
    assert_eq!(parsed["data"]["arrays"][0]["last_row"], 0x11);
}

#[test]
fn info_json_error_keeps_stdout_clean() {
    let dir = tempdir().expect("tempdir should be created");
    let nonexistent = dir.path().join("not_exists.cyacd");

    cli_cmd()
        .arg("info")
        .arg("--json")
        .arg(nonexistent.as_os_str())
        .assert()
        .failure()
        .code(1)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("Error"));
}

#[test]
fn info_rejects_unknown_extension() {
    let dir = tempdir().expect("tempdir should be created");
    let image = dir.path().join("app.hex");
    fs::write(&image, IMAGE_V0).expect("write image");

    cli_cmd()
        .arg("info")
        .arg(&image)
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Error"));
}

#[test]
fn list_ports_json_returns_valid_json() {
    let output = cli_cmd()
        .args(["list-ports", "--json"])
        .output()
        .expect("command should execute");

    // Port enumeration may be unavailable in sandboxes; only a success must be JSON.
    if output.status.success() {
        let parsed: serde_json::Value =
            serde_json::from_slice(&output.stdout).expect("stdout should be JSON");
        assert!(parsed["data"]["ports"].is_array());
    }
}

#[test]
fn exit_code_two_for_unknown_command() {
    cli_cmd()
        .arg("unknown-command-xyz")
        .assert()
        .failure()
        .code(2)
        .stdout(predicate::str::is_empty());
}

#[test]
fn exit_code_two_for_invalid_flag() {
    cli_cmd()
        .arg("--invalid-flag-xyz")
        .assert()
        .failure()
        .code(2);
}

#[test]
fn program_without_file_is_usage_error() {
    cli_cmd()
        .arg("program")
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("FIRMWARE"));
}

#[test]
fn unknown_command_suggests_similar() {
    cli_cmd()
        .arg("porgram")
        .assert()
        .failure()
        .stderr(predicate::str::contains("program"));
}

#[test]
fn invalid_security_key_is_usage_error() {
    let dir = tempdir().expect("tempdir should be created");
    let image = dir.path().join("app.cyacd");
    fs::write(&image, IMAGE_V0).expect("write image");

    cli_cmd()
        .args(["--key", "not-a-key", "--port", "NO_SUCH_PORT", "program"])
        .arg(&image)
        .assert()
        .failure()
        .code(2)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("security key"));
}

#[test]
fn program_on_missing_port_reports_comm_code() {
    let dir = tempdir().expect("tempdir should be created");
    let image = dir.path().join("app.cyacd");
    fs::write(&image, IMAGE_V0).expect("write image");

    cli_cmd()
        .args(["--non-interactive", "--port", "INVALID_PORT_NAME_XYZ", "program"])
        .arg(&image)
        .assert()
        .failure()
        .code(1)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("0x20"));
}

#[test]
fn invalid_config_is_a_warning_not_fatal() {
    let dir = tempdir().expect("tempdir should be created");
    fs::write(dir.path().join("cybtldr.toml"), "invalid toml [[[").expect("write config");
    let image = dir.path().join("app.cyacd");
    fs::write(&image, IMAGE_V0).expect("write image");

    let output = cli_cmd()
        .current_dir(dir.path())
        .arg("info")
        .arg(&image)
        .output()
        .expect("command should execute");

    assert!(output.status.success(), "config errors must not be fatal");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("TOML"), "should warn about invalid TOML");
}
