//! ---
//! mnf_section: "01-core-functionality"
//! mnf_subsection: "tests"
//! mnf_type: "source"
//! mnf_scope: "code"
//! mnf_description: "Shared primitives and utilities for the fleet runtime."
//! mnf_version: "v0.1.0"
//! mnf_owner: "tbd"
//! ---
use std::fs;
use std::time::Duration;

use mnfleet_common::config::AppConfig;
use mnfleet_common::LogFormat;
use tempfile::tempdir;

const SAMPLE: &str = r#"
[provider]
location_id = 9
plan_id = 201
os_id = 215
script_id = 12345
ssh_key_ids = ["5a1b2c3d4e5f6"]

[ssh]
user = "root"
private_key_path = "/keys/fleet"
connect_timeout = 30
num_retries = 3
retry_delay = 5

[sync]
tolerance_blocks = 50
poll_interval = 120

[setup]
build_poll_interval = 15

[coins.GLT]
mn_conf_path = "/wallet/masternode.conf"
wallet_cli_path = "/wallet/globaltoken-cli"
node_port = 9319

[logging]
format = "structured-json"
"#;

#[test]
fn loads_first_existing_candidate() {
    let dir = tempdir().unwrap();
    let missing = dir.path().join("missing.toml");
    let present = dir.path().join("mnfleet.toml");
    fs::write(&present, SAMPLE).unwrap();

    let loaded = AppConfig::load_with_source(&[missing, present.clone()]).unwrap();
    assert_eq!(loaded.source, present);

    let config = loaded.config;
    assert_eq!(config.provider.plan_id, 201);
    assert_eq!(config.provider.script_id, Some(12345));
    assert_eq!(config.ssh.private_key().to_str(), Some("/keys/fleet"));
    assert_eq!(config.ssh.connect_timeout, Duration::from_secs(30));
    assert_eq!(config.ssh.num_retries, 3);
    assert_eq!(config.sync.tolerance_blocks, 50);
    assert_eq!(config.sync.poll_interval, Duration::from_secs(120));
    assert_eq!(config.setup.build_poll_interval, Duration::from_secs(15));
    assert_eq!(config.coin("GLT").unwrap().node_port, 9319);
    assert_eq!(config.logging.format, LogFormat::StructuredJson);
}

#[test]
fn reports_every_inspected_candidate() {
    let dir = tempdir().unwrap();
    let a = dir.path().join("a.toml");
    let b = dir.path().join("b.toml");
    let err = AppConfig::load(&[a, b]).unwrap_err().to_string();
    assert!(err.contains("a.toml"));
    assert!(err.contains("b.toml"));
}

#[test]
fn malformed_file_names_the_path() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("broken.toml");
    fs::write(&path, "[ssh\nuser = ").unwrap();
    let err = format!("{:#}", AppConfig::load(&[path]).unwrap_err());
    assert!(err.contains("broken.toml"));
}

#[test]
fn shipped_example_parses() {
    let config: AppConfig = include_str!("../../../configs/example.toml").parse().unwrap();
    assert_eq!(config.coins.len(), 2);
    assert_eq!(config.coin("SMART").unwrap().node_term("SMART"), "smartnode");
    assert_eq!(config.coin("GLT").unwrap().node_term("GLT"), "masternode");
    assert!(config.metrics.enabled);
}
