use std::path::PathBuf;
use std::time::Duration;

use kernel_worker::config::secrets::{ExposeSecret, redacted};
use kernel_worker::config::{Config, DEFAULT_HEARTBEAT_SECS, DEFAULT_RUNTIME_ID, Overrides};
use kernel_worker::error::Error;

fn overrides() -> Overrides {
    Overrides {
        notebook_id: Some("nb-1".to_string()),
        auth_token: Some("tok-secret".to_string()),
        heartbeat_secs: Some(DEFAULT_HEARTBEAT_SECS),
        ..Overrides::default()
    }
}

// Environment is process-global, so every env-dependent check lives in
// this one test.
#[test]
fn config_from_env_loads_and_validates() {
    unsafe {
        std::env::remove_var("NOTEBOOK_ID");
        std::env::remove_var("AUTH_TOKEN");
        std::env::remove_var("RUNTIME_ID");
        std::env::remove_var("HEARTBEAT_INTERVAL_SECS");
    }
    assert!(matches!(Config::from_env(), Err(Error::Config(_))));

    unsafe {
        std::env::set_var("NOTEBOOK_ID", "nb-env");
        std::env::set_var("AUTH_TOKEN", "env-token");
    }
    let config = Config::from_env().unwrap();
    assert_eq!(config.notebook_id, "nb-env");
    assert_eq!(config.auth_token.expose_secret(), "env-token");
    assert_eq!(config.runtime_id, DEFAULT_RUNTIME_ID);
    assert_eq!(
        config.heartbeat_interval,
        Duration::from_secs(DEFAULT_HEARTBEAT_SECS)
    );
    assert!(!config.log_level.is_empty());

    unsafe {
        std::env::set_var("HEARTBEAT_INTERVAL_SECS", "2");
        std::env::set_var("RUNTIME_ID", "gpu-box");
    }
    let config = Config::from_env().unwrap();
    assert_eq!(config.heartbeat_interval, Duration::from_secs(2));
    assert_eq!(config.runtime_id, "gpu-box");

    unsafe {
        std::env::set_var("HEARTBEAT_INTERVAL_SECS", "soon");
    }
    assert!(matches!(Config::from_env(), Err(Error::Config(_))));

    unsafe {
        std::env::set_var("HEARTBEAT_INTERVAL_SECS", "0");
    }
    assert!(matches!(Config::from_env(), Err(Error::Config(_))));

    unsafe {
        std::env::set_var("AUTH_TOKEN", "   ");
        std::env::remove_var("HEARTBEAT_INTERVAL_SECS");
    }
    assert!(matches!(Config::from_env(), Err(Error::Config(_))));

    unsafe {
        std::env::remove_var("NOTEBOOK_ID");
        std::env::remove_var("AUTH_TOKEN");
        std::env::remove_var("RUNTIME_ID");
    }
}

#[test]
fn overrides_supply_required_values() {
    let config = Config::load(Overrides {
        runtime_id: Some("cli-runtime".to_string()),
        heartbeat_secs: Some(5),
        profile_path: Some(PathBuf::from("profiles/python.toml")),
        ..overrides()
    })
    .unwrap();

    assert_eq!(config.notebook_id, "nb-1");
    assert_eq!(config.runtime_id, "cli-runtime");
    assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
    assert_eq!(
        config.profile_path,
        Some(PathBuf::from("profiles/python.toml"))
    );
}

#[test]
fn zero_heartbeat_override_is_rejected() {
    let result = Config::load(Overrides {
        heartbeat_secs: Some(0),
        ..overrides()
    });
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn auth_token_is_redacted_in_debug_and_logs() {
    let config = Config::load(overrides()).unwrap();
    assert!(!format!("{config:?}").contains("tok-secret"));
    let hint = redacted(&config.auth_token);
    assert!(!hint.contains("tok-secret"));
    assert!(hint.contains("10"));
}
