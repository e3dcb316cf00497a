//! Service configuration: TOML file plus environment overrides.
//!
//! Every field has a default, so an empty or missing file yields a working
//! local setup. Environment variables win over the file.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Used when no `--config` path is given and the file exists.
pub const DEFAULT_CONFIG_PATH: &str = "config/config.toml";

pub const ENV_SIGNING_SECRET: &str = "LLMPID_SIGNING_SECRET";
pub const ENV_DB_PATH: &str = "LLMPID_DB_PATH";
pub const ENV_PORT: &str = "LLMPID_PORT";
pub const ENV_LOG_DIR: &str = "LLMPID_LOG_DIR";
pub const ENV_DEFAULT_USER: &str = "DEFAULT_USER";
pub const ENV_DEFAULT_PASS: &str = "DEFAULT_PASS";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub request_timeout_secs: u64,
    /// Per-client login attempts per minute; `0` disables throttling.
    pub login_rate_limit_per_minute: u32,
    pub session_sweep_interval_secs: u64,
    /// Honour `X-Forwarded-For`/`X-Real-IP` from the caller. Enable only
    /// behind a reverse proxy that overwrites them.
    pub trust_proxy_headers: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            request_timeout_secs: 60,
            login_rate_limit_per_minute: 10,
            session_sweep_interval_secs: 300,
            trust_proxy_headers: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "~/.llmpid/auth.db".into(),
            busy_timeout_ms: 5_000,
        }
    }
}

impl DatabaseConfig {
    /// `path` with a leading `~` expanded.
    pub fn resolved_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.path).into_owned())
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Hex-encoded HMAC key. Generated per process when absent.
    pub signing_secret: Option<String>,
    pub user_token_ttl_minutes: i64,
    pub ext_sys_token_ttl_minutes: i64,
    /// `0` = unlimited concurrent sessions per subject.
    pub max_sessions_per_subject: u32,
    pub default_admin_username: Option<String>,
    pub default_admin_password: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            signing_secret: None,
            user_token_ttl_minutes: 60,
            ext_sys_token_ttl_minutes: 36_000,
            max_sessions_per_subject: 0,
            default_admin_username: None,
            default_admin_password: None,
        }
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "[redacted]");
        f.debug_struct("AuthConfig")
            .field("signing_secret", &redact(&self.signing_secret))
            .field("user_token_ttl_minutes", &self.user_token_ttl_minutes)
            .field("ext_sys_token_ttl_minutes", &self.ext_sys_token_ttl_minutes)
            .field("max_sessions_per_subject", &self.max_sessions_per_subject)
            .field("default_admin_username", &self.default_admin_username)
            .field("default_admin_password", &redact(&self.default_admin_password))
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    /// `"text"` or `"json"`.
    pub format: String,
    /// Also write daily-rotated log files here when set.
    pub dir: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
            dir: None,
        }
    }
}

impl LogConfig {
    /// `dir` with a leading `~` expanded.
    pub fn resolved_dir(&self) -> Option<PathBuf> {
        self.dir
            .as_deref()
            .map(|dir| PathBuf::from(shellexpand::tilde(dir).into_owned()))
    }
}

impl Config {
    /// Load from `path`, or from [`DEFAULT_CONFIG_PATH`] if it exists, then
    /// apply process environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            None => Self::default(),
        };
        config.apply_env_overrides_from(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| anyhow::anyhow!("Invalid TOML: {e}"))
    }

    /// Apply overrides from a key lookup. Tests pass a map instead of the
    /// process environment.
    pub fn apply_env_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(secret) = lookup(ENV_SIGNING_SECRET).filter(|v| !v.is_empty()) {
            self.auth.signing_secret = Some(secret);
        }
        if let Some(path) = lookup(ENV_DB_PATH).filter(|v| !v.is_empty()) {
            self.database.path = path;
        }
        if let Some(port) = lookup(ENV_PORT).filter(|v| !v.is_empty()) {
            self.gateway.port = port
                .parse()
                .with_context(|| format!("{ENV_PORT} must be a port number, got '{port}'"))?;
        }
        if let Some(dir) = lookup(ENV_LOG_DIR).filter(|v| !v.is_empty()) {
            self.log.dir = Some(dir);
        }
        if let Some(user) = lookup(ENV_DEFAULT_USER).filter(|v| !v.is_empty()) {
            self.auth.default_admin_username = Some(user);
        }
        if let Some(pass) = lookup(ENV_DEFAULT_PASS).filter(|v| !v.is_empty()) {
            self.auth.default_admin_password = Some(pass);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.auth.user_token_ttl_minutes <= 0 || self.auth.ext_sys_token_ttl_minutes <= 0 {
            bail!("auth token TTLs must be positive");
        }
        if self.gateway.request_timeout_secs == 0 {
            bail!("gateway.request_timeout_secs must be positive");
        }
        if self.gateway.session_sweep_interval_secs == 0 {
            bail!("gateway.session_sweep_interval_secs must be positive");
        }
        if !matches!(self.log.format.as_str(), "text" | "json") {
            bail!("log.format must be \"text\" or \"json\", got '{}'", self.log.format);
        }
        if let Some(secret) = &self.auth.signing_secret {
            crate::auth::SigningKey::from_hex(secret)
                .context("auth.signing_secret must be hex encoding at least 32 bytes")?;
        }
        Ok(())
    }

    /// Default admin credentials, when both halves are configured.
    pub fn default_admin(&self) -> Option<(&str, &str)> {
        match (
            self.auth.default_admin_username.as_deref(),
            self.auth.default_admin_password.as_deref(),
        ) {
            (Some(user), Some(pass)) => Some((user, pass)),
            _ => None,
        }
    }
}
