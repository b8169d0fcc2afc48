//! Config loading tests.
//!
//! Full-file loading through `ConfigLoader`, section defaults, validation of
//! services and listeners, and the `main` -> environment -> `common`
//! configurator flow used by the binary.

use marionette_common::config::{ConfigError, ConfigLoader, LogLevel, MasterConfig, PuppetKind};
use marionette_common::configurator::Configurator;
use marionette_common::consts::{DEFAULT_BACKLOG, DEFAULT_TIMEOUT_SECS};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

// ─── Helpers ────────────────────────────────────────────────────────

fn write_config(dir: &Path, body: &str) -> std::path::PathBuf {
    let path = dir.join("marionette.toml");
    fs::write(&path, body).unwrap();
    path
}

const FULL: &str = r#"
[master]
timeout = 30
nap_time = 0.5
proc_tag = "web"
pid_file = "/tmp/web.pid"
control_port = "/tmp/web.sock"
log_level = "debug"

[listen]
default = ["127.0.0.1:8080", "8081"]
admin = ["/tmp/admin.sock"]

[socket]
backlog = 64
tcp_nodelay = true

[[puppet]]
count = 4
payload = "echo"
listen = "default"

[[puppet]]
key = "admin"
count = 1
kind = "event"
proc_tag = "adm"
listen = "admin"

[[service]]
name = "redis"
command = ["redis-server", "--port", "{port}", "--bind", "{host}"]
health_check = true

[environments.production.workers]
default = 16
admin = 2
"#;

// ─── Loading ────────────────────────────────────────────────────────

#[test]
fn test_full_config_loads() {
    let dir = TempDir::new().unwrap();
    let config = MasterConfig::load(&write_config(dir.path(), FULL)).unwrap();
    config.validate().unwrap();

    assert_eq!(config.master.timeout, 30);
    assert_eq!(config.master.proc_tag.as_deref(), Some("web"));
    assert_eq!(config.master.log_level, LogLevel::Debug);
    assert_eq!(config.listen["default"].len(), 2);
    assert_eq!(config.socket.backlog, 64);
    assert_eq!(config.socket.tcp_nodelay, Some(true));

    let main = config.main_puppet().unwrap();
    assert_eq!(main.count, 4);
    assert_eq!(main.payload, "echo");
    assert_eq!(main.kind, PuppetKind::Loop);

    let admin = config.puppets.iter().find(|p| p.pool_key() == Some("admin")).unwrap();
    assert_eq!(admin.kind, PuppetKind::Event);
    assert_eq!(admin.proc_tag.as_deref(), Some("adm"));

    let redis = &config.services[0];
    assert_eq!(redis.listen_host, "127.0.0.1");
    assert_eq!(redis.stop_signal, "TERM");
    assert!(redis.listen_port.is_none());
    assert!(!redis.disabled);
}

#[test]
fn test_minimal_config_defaults() {
    let dir = TempDir::new().unwrap();
    let config = MasterConfig::load(&write_config(dir.path(), "[[puppet]]\n")).unwrap();
    config.validate().unwrap();

    assert_eq!(config.master.timeout, DEFAULT_TIMEOUT_SECS);
    assert_eq!(config.socket.backlog, DEFAULT_BACKLOG);
    assert_eq!(config.main_puppet().unwrap().payload, "idle");
    assert!(config.listen.is_empty());
}

#[test]
fn test_unknown_fields_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write_config(dir.path(), "[master]\ntimeout = 5\nworkers = 3\n");
    assert!(matches!(MasterConfig::load(&path), Err(ConfigError::ParseError(_))));
}

// ─── Validation ─────────────────────────────────────────────────────

#[test]
fn test_duplicate_service_rejected() {
    let config: MasterConfig = toml::from_str(
        r#"
        [[puppet]]
        [[service]]
        name = "a"
        command = ["true"]
        [[service]]
        name = "a"
        command = ["true"]
        "#,
    )
    .unwrap();
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("duplicate service"));
}

#[test]
fn test_empty_service_command_rejected() {
    let config: MasterConfig = toml::from_str(
        r#"
        [[puppet]]
        [[service]]
        name = "a"
        command = []
        "#,
    )
    .unwrap();
    assert!(config.validate().is_err());
}

#[test]
fn test_empty_listener_spec_rejected() {
    let config: MasterConfig = toml::from_str(
        r#"
        [listen]
        default = []
        [[puppet]]
        "#,
    )
    .unwrap();
    assert!(config.validate().is_err());
}

#[test]
fn test_zero_nap_time_rejected() {
    let config: MasterConfig = toml::from_str("[master]\nnap_time = 0.0\n[[puppet]]\n").unwrap();
    assert!(config.validate().is_err());
}

// ─── Configurator flow ──────────────────────────────────────────────

#[test]
fn test_main_environment_common_flow() {
    let dir = TempDir::new().unwrap();
    let mut config = MasterConfig::load(&write_config(dir.path(), FULL)).unwrap();

    let mut c: Configurator<MasterConfig> = Configurator::new();
    c.define("main", |c, cfg| c.call("production", cfg));
    c.define("production", |c, cfg| {
        cfg.apply_environment("production")?;
        c.call("common", cfg)
    });
    c.define("common", |_, cfg| cfg.validate());

    c.call("main", &mut config).unwrap();
    assert_eq!(config.main_puppet().unwrap().count, 16);
    assert_eq!(config.puppet_mut(Some("admin")).unwrap().count, 2);
}

#[test]
fn test_common_failure_surfaces_through_main() {
    let mut config = MasterConfig::default();

    let mut c: Configurator<MasterConfig> = Configurator::new();
    c.define("main", |c, cfg| c.call("common", cfg));
    c.define("common", |_, cfg| cfg.validate());

    let err = c.call("main", &mut config).unwrap_err();
    assert!(err.to_string().contains("main puppet"));
}
