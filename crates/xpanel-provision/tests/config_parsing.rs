use std::{env, fs};

use xpanel_provision::StorageBackend;
use xpanel_provision::config::loader::load_config;

#[test]
fn config_parsing_and_env_overrides_and_validation() {
    // Create a temporary TOML configuration file
    let dir = tempfile::tempdir().expect("tmp dir");
    let path = dir.path().join("xpanel.toml");

    let toml_content = r#"
[storage]
backend = "memory"

[storage.sqlite]
path = "/tmp/x-ui.db"

[jobs]
store_path = "/tmp/xpanel-jobs.json"
batch_size = 25
batch_pause_ms = 0
max_targets = 3

[reconcile]
command = "/opt/x-ui/x-ui"
args = ["migrate"]
timeout_seconds = 10
restart_command = "systemctl"
restart_args = ["restart", "x-ui"]

[protocol]
shadowsocks_method = "aes-256-gcm"

[logging]
level = "debug"
"#;
    fs::write(&path, toml_content).expect("write toml");

    // 1) Valid config parses, unspecified keys keep their defaults
    let cfg = load_config(path.to_str()).expect("should parse config");
    assert_eq!(cfg.storage.backend, StorageBackend::Memory);
    assert_eq!(cfg.jobs.batch_size, 25);
    assert_eq!(cfg.jobs.max_targets, 3);
    assert_eq!(cfg.jobs.max_operations, 5000);
    assert_eq!(cfg.reconcile.restart_args, vec!["restart", "x-ui"]);
    assert_eq!(cfg.secret_defaults().shadowsocks_method, "aes-256-gcm");
    assert_eq!(cfg.logging.level.to_ascii_lowercase(), "debug");

    // 2) Env override should win over file
    unsafe {
        env::set_var("XPANEL__JOBS__BATCH_SIZE", "40");
    }
    let cfg_env = load_config(path.to_str()).expect("should parse config with env overrides");
    assert_eq!(cfg_env.jobs.batch_size, 40);
    unsafe {
        env::remove_var("XPANEL__JOBS__BATCH_SIZE");
    }

    // 3) Invalid values are rejected
    let invalid_path = dir.path().join("invalid.toml");
    let invalid_toml = r#"
[jobs]
batch_size = 0
"#;
    fs::write(&invalid_path, invalid_toml).expect("write invalid toml");
    let err = load_config(invalid_path.to_str()).expect_err("expected validation error");
    assert!(err.contains("batch_size must be > 0"));

    // 4) A missing file falls back to defaults
    let cfg = load_config(dir.path().join("absent.toml").to_str()).expect("defaults");
    assert_eq!(cfg.jobs.batch_size, 100);
    assert_eq!(cfg.reconcile.timeout_seconds, 30);
}
