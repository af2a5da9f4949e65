//! Configuration loading against a mutated process environment. These tests
//! touch global env vars, so they run serially.

use serial_test::serial;
use std::env;
use switchboard::config::AppConfig;

fn clear_env() {
    unsafe {
        for var in [
            "PORT",
            "AUTH_STATIC_KEY",
            "RATE_LIMIT_RPM",
            "BREAKER_OPEN_MS",
            "DB_URL",
            "AUDIT_SINK",
            "GW_SERVER__PORT",
            "CONFIG_FILE",
        ] {
            env::remove_var(var);
        }
    }
}

fn load() -> AppConfig {
    AppConfig::load_from_args(["switchboard"]).expect("config should load")
}

#[test]
#[serial]
fn defaults_apply_without_environment() {
    clear_env();
    let config = load();
    assert_eq!(config.server.port, 8080);
    assert_eq!(config.limits.rate_limit_rpm, 60);
    assert_eq!(config.limits.rate_limit_burst, 10);
    assert_eq!(config.resilience.breaker_failure_threshold, 5);
    assert_eq!(config.resilience.breaker_open_ms, 30_000);
    assert!(config.auth.static_key.is_none());
    assert!(config.persistence.db_url.is_none());
}

#[test]
#[serial]
fn bare_contract_names_override_defaults() {
    clear_env();
    unsafe {
        env::set_var("AUTH_STATIC_KEY", "dev-key-1");
        env::set_var("RATE_LIMIT_RPM", "120");
        env::set_var("BREAKER_OPEN_MS", "10000");
    }
    let config = load();
    assert_eq!(config.auth.static_key.as_deref(), Some("dev-key-1"));
    assert_eq!(config.limits.rate_limit_rpm, 120);
    assert_eq!(config.resilience.breaker_open_ms, 10_000);
    clear_env();
}

#[test]
#[serial]
fn prefixed_env_reaches_nested_keys() {
    clear_env();
    unsafe {
        env::set_var("GW_SERVER__PORT", "9191");
    }
    let config = load();
    assert_eq!(config.server.port, 9191);
    clear_env();
}

#[test]
#[serial]
fn audit_sink_defaults_follow_database_presence() {
    clear_env();
    let config = load();
    assert_eq!(
        config.audit_config().sink,
        switchboard::audit::AuditSinkKind::None
    );

    unsafe {
        env::set_var("DB_URL", "postgres://localhost/gw");
        env::set_var("AUDIT_SINK", "");
    }
    let config = load();
    assert_eq!(
        config.audit_config().sink,
        switchboard::audit::AuditSinkKind::Db
    );

    unsafe {
        env::set_var("AUDIT_SINK", "file");
    }
    let config = load();
    assert_eq!(
        config.audit_config().sink,
        switchboard::audit::AuditSinkKind::File
    );
    clear_env();
}
