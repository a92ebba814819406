use super::settings::{BackpressureMode, Settings};
use super::{load_config, load_config_from};
use serial_test::serial;
use std::env;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.server.host, "127.0.0.1");
    assert_eq!(settings.server.port, 15674);
    assert_eq!(settings.server.heartbeat_ms, 10_000);
    assert_eq!(settings.server.connect_timeout_ms, 5_000);
    assert_eq!(settings.broker.max_connections, 1000);
    assert_eq!(settings.broker.outbound_buffer, 256);
    assert_eq!(settings.broker.backpressure, BackpressureMode::Fail);
    assert_eq!(
        settings.auth.users.get("guest").map(String::as_str),
        Some("guest")
    );
    assert_eq!(settings.bind_addr(), "127.0.0.1:15674");
}

#[test]
#[serial]
fn load_config_from_file_overrides_defaults() {
    let tmp = TempDir::new().expect("create tempdir");
    let path = tmp.path().join("broker.toml");
    let toml = r#"
        [server]
        host = "0.0.0.0"
        port = 9000
        heartbeat_ms = 0
        connect_timeout_ms = 250

        [broker]
        outbound_buffer = 8
        backpressure = "block"
        block_timeout_ms = 50

        [auth]
        jwt_secret = "file_secret"

        [auth.users]
        admin = "password"
    "#;
    fs::write(&path, toml).expect("write config file");

    let cfg = load_config_from(path.to_str().unwrap()).expect("load_config failed");
    assert_eq!(cfg.server.host, "0.0.0.0");
    assert_eq!(cfg.server.port, 9000);
    assert_eq!(cfg.server.heartbeat_ms, 0);
    assert_eq!(cfg.server.connect_timeout_ms, 250);
    assert_eq!(cfg.server.log_level, "info");
    assert_eq!(cfg.broker.max_connections, 1000);
    assert_eq!(cfg.broker.outbound_buffer, 8);
    assert_eq!(cfg.broker.backpressure, BackpressureMode::Block);
    assert_eq!(cfg.broker.block_timeout_ms, 50);
    assert_eq!(cfg.auth.jwt_secret, "file_secret");
    assert_eq!(
        cfg.auth.users.get("admin").map(String::as_str),
        Some("password")
    );
    assert!(!cfg.auth.users.contains_key("guest"));
}

#[test]
#[serial]
fn load_config_reads_default_file_from_working_directory() {
    let tmp = TempDir::new().expect("create tempdir");
    let orig = env::current_dir().expect("current_dir");
    env::set_current_dir(tmp.path()).expect("set current dir");

    fs::create_dir_all("config").expect("create config dir");
    fs::write("config/default.toml", "[broker]\nmax_connections = 10\n")
        .expect("write config file");

    let cfg = load_config();

    env::set_current_dir(orig).expect("restore cwd");

    let cfg = cfg.expect("load_config failed");
    assert_eq!(cfg.broker.max_connections, 10);
    assert_eq!(cfg.server.port, 15674);
}

#[test]
#[serial]
fn environment_overrides_file() {
    let tmp = TempDir::new().expect("create tempdir");
    let path = tmp.path().join("broker.toml");
    fs::write(&path, "[server]\nport = 9000\n").expect("write config file");

    temp_env::with_vars(
        [
            ("STOMPCOOLER__SERVER__PORT", Some("9100")),
            ("STOMPCOOLER__BROKER__BACKPRESSURE", Some("block")),
        ],
        || {
            let cfg = load_config_from(path.to_str().unwrap()).expect("load_config failed");
            assert_eq!(cfg.server.port, 9100);
            assert_eq!(cfg.broker.backpressure, BackpressureMode::Block);
        },
    );
}

#[test]
#[serial]
fn missing_file_yields_defaults() {
    let cfg = load_config_from("/nonexistent/stompcooler").expect("load_config failed");
    assert_eq!(cfg.server.host, "127.0.0.1");
    assert_eq!(cfg.auth.token_ttl_secs, 86_400);
}
