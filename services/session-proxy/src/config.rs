//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The login password is loaded from SESSION_PASSWORD or password_file,
//! never stored in the TOML directly to avoid leaking secrets.

use common::Secret;
use serde::Deserialize;
use session_auth::LoginCredentials;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub proxy: ProxyConfig,
    pub auth: AuthConfig,
}

/// Forwarding listener and upstream settings
#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    pub upstream_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Credential-issuing service and session timing
#[derive(Debug, Deserialize)]
pub struct AuthConfig {
    pub base_url: String,
    /// Account used for the automatic login at start-up and for
    /// `POST /session/login` without a body.
    #[serde(default)]
    pub email: Option<String>,
    #[serde(skip)]
    pub password: Option<Secret<String>>,
    /// Path to a file containing the password (alternative to SESSION_PASSWORD)
    #[serde(default)]
    pub password_file: Option<PathBuf>,
    /// Persist the credential pair here. Without it the session lives in memory.
    #[serde(default)]
    pub credential_file: Option<PathBuf>,
    #[serde(default = "default_stale_skew")]
    pub stale_skew_secs: u64,
    #[serde(default = "default_refresh_lead")]
    pub refresh_lead_secs: u64,
    #[serde(default = "default_auth_timeout")]
    pub timeout_secs: u64,
}

impl AuthConfig {
    /// Configured login credentials, if both email and password are present.
    pub fn credentials(&self) -> Option<LoginCredentials> {
        match (&self.email, &self.password) {
            (Some(email), Some(password)) => Some(LoginCredentials::new(email.clone(), password.expose().clone())),
            _ => None,
        }
    }

    pub fn settings(&self) -> session_pipeline::SessionSettings {
        session_pipeline::SessionSettings {
            stale_skew: Duration::from_secs(self.stale_skew_secs),
            refresh_lead: Duration::from_secs(self.refresh_lead_secs),
            refresh_timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

fn default_timeout() -> u64 {
    60
}

fn default_max_connections() -> usize {
    1000
}

fn default_stale_skew() -> u64 {
    session_auth::DEFAULT_STALE_SKEW.as_secs()
}

fn default_refresh_lead() -> u64 {
    session_auth::DEFAULT_REFRESH_LEAD.as_secs()
}

fn default_auth_timeout() -> u64 {
    session_auth::DEFAULT_ENDPOINT_TIMEOUT.as_secs()
}

fn require_http_url(field: &str, url: &str) -> common::Result<()> {
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(common::Error::Config(format!(
            "{field} must start with http:// or https://, got: {url}"
        )));
    }
    Ok(())
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Password resolution order:
    /// 1. SESSION_PASSWORD env var
    /// 2. password_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        require_http_url("upstream_url", &config.proxy.upstream_url)?;
        require_http_url("auth.base_url", &config.auth.base_url)?;

        if config.proxy.timeout_secs == 0 {
            return Err(common::Error::Config("timeout_secs must be greater than 0".into()));
        }
        if config.proxy.max_connections == 0 {
            return Err(common::Error::Config("max_connections must be greater than 0".into()));
        }
        if config.auth.timeout_secs == 0 {
            return Err(common::Error::Config("auth.timeout_secs must be greater than 0".into()));
        }
        if config.auth.refresh_lead_secs == 0 {
            return Err(common::Error::Config("refresh_lead_secs must be greater than 0".into()));
        }

        if let Ok(password) = std::env::var("SESSION_PASSWORD") {
            config.auth.password = Some(Secret::new(password));
        } else if let Some(ref password_file) = config.auth.password_file {
            let password = std::fs::read_to_string(password_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read password_file {}: {e}",
                    password_file.display()
                ))
            })?;
            let password = password.trim().to_owned();
            if !password.is_empty() {
                config.auth.password = Some(Secret::new(password));
            }
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("session-proxy.toml")
    }
}
