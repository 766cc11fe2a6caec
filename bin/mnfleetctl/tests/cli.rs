//! ---
//! mnf_section: "05-networking-external-interfaces"
//! mnf_subsection: "tests"
//! mnf_type: "test"
//! mnf_scope: "code"
//! mnf_description: "End-to-end checks of the control CLI binary."
//! mnf_version: "v0.1.0"
//! mnf_owner: "tbd"
//! ---
use assert_cmd::Command;

fn ctl() -> Command {
    let mut cmd = Command::cargo_bin("mnfleetctl").unwrap();
    cmd.env_remove("MNFLEET_CONFIG");
    cmd
}

#[test]
fn label_expands_the_scheme() {
    ctl()
        .args(["label", "GLT-MN###", "7"])
        .assert()
        .success()
        .stdout("GLT-MN007\n");
}

#[test]
fn label_overflow_fails() {
    ctl().args(["label", "MN##", "100"]).assert().failure();
}

#[test]
fn missing_config_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    ctl()
        .current_dir(dir.path())
        .args(["directory", "show"])
        .assert()
        .failure();
}

#[test]
fn directory_show_prints_stored_servers() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("mnfleet.toml");
    std::fs::write(
        &config,
        format!(
            "[logging]\ndirectory = \"{}\"\nformat = \"pretty\"\n",
            dir.path().join("logs").display()
        ),
    )
    .unwrap();
    let servers = dir.path().join("servers.json");
    std::fs::write(
        &servers,
        r#"{"servers":[{"id":"100","label":"GLT_MN01","address":"10.0.0.1","config_line":null}]}"#,
    )
    .unwrap();

    let assert = ctl()
        .current_dir(dir.path())
        .arg("--config")
        .arg(&config)
        .arg("--directory")
        .arg(&servers)
        .args(["directory", "show"])
        .assert()
        .success();
    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).into_owned();
    assert!(stdout.contains("\"GLT_MN01\""));
    assert!(stdout.contains("\"10.0.0.1\""));
}
