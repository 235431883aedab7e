//! Typed configuration from environment variables and CLI overrides.
//!
//! Loads once at startup, fails fast if required values are missing.
//! Sensitive values are wrapped in secrecy::SecretString to prevent log leaks.

pub mod secrets;

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::{Error, Result};

pub const DEFAULT_RUNTIME_ID: &str = "kernel-worker";
pub const DEFAULT_HEARTBEAT_SECS: u64 = 15;

#[derive(Debug)]
pub struct Config {
    /// The notebook (work stream) this worker serves.
    pub notebook_id: String,
    pub auth_token: SecretString,
    /// Shared Postgres log. `None` runs against a process-local log.
    pub database_url: Option<SecretString>,
    /// Stable worker identity; session ids are derived from it.
    pub runtime_id: String,
    pub heartbeat_interval: Duration,
    /// Optional TOML worker profile.
    pub profile_path: Option<PathBuf>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

/// Values given on the command line. They win over the environment.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub notebook_id: Option<String>,
    pub auth_token: Option<String>,
    pub runtime_id: Option<String>,
    pub heartbeat_secs: Option<u64>,
    pub profile_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::load(Overrides::default())
    }

    /// Load from the environment, letting `overrides` take precedence.
    pub fn load(overrides: Overrides) -> Result<Self> {
        let notebook_id = overrides
            .notebook_id
            .map(Ok)
            .unwrap_or_else(|| required_var("NOTEBOOK_ID"))?;
        let auth_token = overrides
            .auth_token
            .map(Ok)
            .unwrap_or_else(|| required_var("AUTH_TOKEN"))?;
        if notebook_id.trim().is_empty() {
            return Err(Error::Config("notebook id must not be empty".to_string()));
        }
        if auth_token.trim().is_empty() {
            return Err(Error::Config("auth token must not be empty".to_string()));
        }

        let heartbeat_secs = match overrides.heartbeat_secs {
            Some(secs) => secs,
            None => optional_var("HEARTBEAT_INTERVAL_SECS")
                .map(|v| {
                    v.parse::<u64>().map_err(|_| {
                        Error::Config(format!("HEARTBEAT_INTERVAL_SECS is not a number: {v}"))
                    })
                })
                .transpose()?
                .unwrap_or(DEFAULT_HEARTBEAT_SECS),
        };
        if heartbeat_secs == 0 {
            return Err(Error::Config(
                "heartbeat interval must be at least one second".to_string(),
            ));
        }

        Ok(Self {
            notebook_id,
            auth_token: SecretString::from(auth_token),
            database_url: optional_var("DATABASE_URL").map(SecretString::from),
            runtime_id: overrides
                .runtime_id
                .or_else(|| optional_var("RUNTIME_ID"))
                .unwrap_or_else(|| DEFAULT_RUNTIME_ID.to_string()),
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            profile_path: overrides
                .profile_path
                .or_else(|| optional_var("WORKER_PROFILE").map(PathBuf::from)),
            otel_endpoint: optional_var("OTEL_ENDPOINT"),
            log_level: optional_var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}
