use std::env;
use std::fs;
use std::time::Duration;

use serial_test::serial;
use tempfile::TempDir;

use super::settings::{Parity, Settings};
use super::{load_config, load_config_from};

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.bus.dispatch_interval(), Duration::from_millis(100));
    assert_eq!(settings.bus.default_max_retries, 3);
    assert_eq!(settings.bus.persistence_path, None);
    assert_eq!(settings.tcp.host, "127.0.0.1");
    assert_eq!(settings.serial.max_packet_size, 1024);
    assert_eq!(settings.serial.baud_rate, 9600);
    assert!(settings.serial.json_mode);
    assert!(settings.websocket.auto_reconnect);
}

#[test]
#[serial]
fn load_config_from_file_overrides_defaults() {
    // Run from a temporary directory so load_config picks up
    // config/default.toml from there.
    let tmp = TempDir::new().expect("create tempdir");
    let orig = env::current_dir().expect("current_dir");
    env::set_current_dir(tmp.path()).expect("set current dir");

    fs::create_dir_all("config").expect("create config dir");
    let toml = r#"
        [bus]
        dispatch_interval_ms = 25
        persistence_path = "/var/lib/astrobus"

        [tcp]
        host = "10.0.0.5"
        port = 7624

        [serial]
        port_name = "/dev/ttyUSB0"
        baud_rate = 115200
        parity = "even"
        encryption_key = "mount"

        [http.headers]
        apikey = "abc"
    "#;
    fs::write("config/default.toml", toml).expect("write config file");

    let cfg = load_config();

    // restore cwd before asserting so a failure does not leak into other tests
    env::set_current_dir(orig).expect("restore cwd");
    let cfg = cfg.expect("load_config failed");

    assert_eq!(cfg.bus.dispatch_interval_ms, 25);
    assert_eq!(cfg.bus.persistence_path.as_deref(), Some("/var/lib/astrobus"));
    assert_eq!(cfg.bus.default_max_retries, 3);
    assert_eq!(cfg.tcp.address(), "10.0.0.5:7624");
    assert_eq!(cfg.serial.port_name, "/dev/ttyUSB0");
    assert_eq!(cfg.serial.baud_rate, 115200);
    assert_eq!(cfg.serial.parity, Parity::Even);
    assert_eq!(cfg.serial.encryption_key.as_deref(), Some("mount"));
    assert_eq!(
        cfg.http.headers.get("apikey").map(String::as_str),
        Some("abc")
    );
}

#[test]
#[serial]
fn load_config_env_overrides_file() {
    let tmp = TempDir::new().expect("create tempdir");
    let path = tmp.path().join("bus.toml");
    fs::write(&path, "[tcp]\nport = 7000\n").expect("write config file");
    let base = path.with_extension("");

    let cfg = temp_env::with_vars(
        [
            ("ASTROBUS__TCP__PORT", Some("7001")),
            ("ASTROBUS__WEBSOCKET__URL", Some("ws://127.0.0.1:7626")),
        ],
        || load_config_from(base.to_str().expect("utf8 path")),
    )
    .expect("load_config failed");

    assert_eq!(cfg.tcp.port, 7001);
    assert_eq!(cfg.websocket.url, "ws://127.0.0.1:7626");
}

#[test]
#[serial]
fn load_config_missing_file_uses_defaults() {
    let tmp = TempDir::new().expect("create tempdir");
    let base = tmp.path().join("absent");
    let cfg = load_config_from(base.to_str().expect("utf8 path")).expect("load_config failed");
    assert_eq!(cfg, Settings::default());
}
