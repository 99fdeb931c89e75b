//! Configuration for doorlink.
//!
//! TOML profiles, credential resolution (env + keyring + plaintext), and
//! translation to `doorlink_core::DeviceConfig`. The core crate never
//! touches disk; this crate is the only place that does.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use doorlink_core::{
    CloudEndpoints, ConnectionTuning, CoreError, DeviceConfig, TlsMode, TransportConfig,
};

const ENV_PREFIX: &str = "DOORLINK_";
const USERNAME_ENV: &str = "DOORLINK_USERNAME";
const PASSWORD_ENV: &str = "DOORLINK_PASSWORD";
const KEYRING_SERVICE: &str = "doorlink";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("no credentials configured for profile '{profile}'")]
    NoCredentials { profile: String },

    #[error("unknown profile '{profile}'")]
    UnknownProfile { profile: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("keyring error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error(transparent)]
    Device(#[from] CoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    /// Profile used when none is named.
    pub default_profile: Option<String>,

    /// Global defaults.
    #[serde(default)]
    pub defaults: Defaults,

    /// Named device profiles.
    #[serde(default)]
    pub profiles: HashMap<String, Profile>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_profile: Some("default".into()),
            defaults: Defaults::default(),
            profiles: HashMap::new(),
        }
    }
}

impl Config {
    /// Look up `name`, or the default profile when `name` is `None`.
    pub fn profile<'a>(&'a self, name: Option<&'a str>) -> Result<(&'a str, &'a Profile), ConfigError> {
        let name = name
            .or(self.default_profile.as_deref())
            .unwrap_or("default");
        self.profiles
            .get(name)
            .map(|profile| (name, profile))
            .ok_or_else(|| ConfigError::UnknownProfile {
                profile: name.into(),
            })
    }
}

/// Tuning applied to every profile unless the profile overrides it.
#[derive(Debug, Deserialize, Serialize)]
pub struct Defaults {
    /// HTTP request timeout for the identity handshake (seconds).
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    #[serde(default = "default_status_timeout")]
    pub status_timeout: u64,

    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,

    #[serde(default = "default_keepalive")]
    pub keepalive: u64,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            connect_timeout: default_connect_timeout(),
            status_timeout: default_status_timeout(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            keepalive: default_keepalive(),
        }
    }
}

fn default_timeout() -> u64 {
    30
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_status_timeout() -> u64 {
    5
}
fn default_max_reconnect_attempts() -> u32 {
    5
}
fn default_reconnect_base_delay_ms() -> u64 {
    1000
}
fn default_keepalive() -> u64 {
    30
}

/// One garage door and the cloud tenancy it lives in.
#[derive(Debug, Deserialize, Serialize)]
pub struct Profile {
    /// Device identifier (topic prefix).
    pub device_id: String,

    #[serde(default = "default_region")]
    pub region: String,

    pub user_pool_id: String,
    pub client_id: String,
    pub identity_pool_id: String,

    /// Broker hostname, without scheme or path.
    pub broker_host: String,

    /// Account username (falls back to `DOORLINK_USERNAME`).
    pub username: Option<String>,

    /// Plaintext password. Prefer the keyring.
    pub password: Option<String>,

    /// Path to an extra CA certificate for the identity endpoints.
    pub ca_cert: Option<PathBuf>,

    // Per-profile overrides of `Defaults`.
    pub timeout: Option<u64>,
    pub connect_timeout: Option<u64>,
    pub status_timeout: Option<u64>,
    pub max_reconnect_attempts: Option<u32>,
    pub reconnect_base_delay_ms: Option<u64>,
    pub keepalive: Option<u64>,
}

fn default_region() -> String {
    "us-east-1".into()
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("com", "doorlink", "doorlink").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("doorlink");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the full Config from the canonical file + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load from `path`, then apply `DOORLINK_`-prefixed environment
/// variables (`__` separates nesting, e.g. `DOORLINK_DEFAULTS__TIMEOUT`).
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    debug!(path = %path.display(), "loading config");

    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"));

    let config: Config = figment.extract()?;
    Ok(config)
}

/// Load config, returning a default if the file doesn't exist.
pub fn load_config_or_default() -> Config {
    load_config().unwrap_or_default()
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write to the canonical config path.
pub fn save_config(cfg: &Config) -> Result<(), ConfigError> {
    save_config_to(cfg, &config_path())
}

pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

// ── Credential resolution ───────────────────────────────────────────

pub fn resolve_username(profile: &Profile, profile_name: &str) -> Result<String, ConfigError> {
    profile
        .username
        .clone()
        .or_else(|| std::env::var(USERNAME_ENV).ok())
        .ok_or_else(|| ConfigError::NoCredentials {
            profile: profile_name.into(),
        })
}

/// Resolve the password: `DOORLINK_PASSWORD`, then the system keyring
/// (`doorlink` / `{profile}/password`), then plaintext in the profile.
pub fn resolve_password(profile: &Profile, profile_name: &str) -> Result<SecretString, ConfigError> {
    password_chain(
        std::env::var(PASSWORD_ENV).ok(),
        || keyring_password(profile_name),
        profile,
        profile_name,
    )
}

/// Store a password in the system keyring for `profile_name`.
pub fn store_password(profile_name: &str, password: &str) -> Result<(), ConfigError> {
    keyring::Entry::new(KEYRING_SERVICE, &keyring_user(profile_name))?.set_password(password)?;
    Ok(())
}

fn keyring_user(profile_name: &str) -> String {
    format!("{profile_name}/password")
}

fn keyring_password(profile_name: &str) -> Option<String> {
    keyring::Entry::new(KEYRING_SERVICE, &keyring_user(profile_name))
        .and_then(|entry| entry.get_password())
        .ok()
}

fn password_chain(
    env: Option<String>,
    keyring: impl FnOnce() -> Option<String>,
    profile: &Profile,
    profile_name: &str,
) -> Result<SecretString, ConfigError> {
    // 1. Env var
    if let Some(pw) = env {
        debug!("password from environment");
        return Ok(SecretString::from(pw));
    }

    // 2. Keyring
    if let Some(pw) = keyring() {
        debug!("password from keyring");
        return Ok(SecretString::from(pw));
    }

    // 3. Plaintext in config
    if let Some(ref pw) = profile.password {
        return Ok(SecretString::from(pw.clone()));
    }

    Err(ConfigError::NoCredentials {
        profile: profile_name.into(),
    })
}

// ── Translation ─────────────────────────────────────────────────────

/// Connection tuning for `profile`, falling back to `defaults`.
pub fn tuning_for(profile: &Profile, defaults: &Defaults) -> ConnectionTuning {
    ConnectionTuning {
        connect_timeout: Duration::from_secs(profile.connect_timeout.unwrap_or(defaults.connect_timeout)),
        status_timeout: Duration::from_secs(profile.status_timeout.unwrap_or(defaults.status_timeout)),
        max_reconnect_attempts: profile
            .max_reconnect_attempts
            .unwrap_or(defaults.max_reconnect_attempts),
        reconnect_base_delay: Duration::from_millis(
            profile
                .reconnect_base_delay_ms
                .unwrap_or(defaults.reconnect_base_delay_ms),
        ),
        keepalive_interval: Duration::from_secs(profile.keepalive.unwrap_or(defaults.keepalive)),
    }
}

/// Build a `DeviceConfig` from a profile, resolving credentials.
pub fn profile_to_device_config(
    profile: &Profile,
    profile_name: &str,
    defaults: &Defaults,
) -> Result<DeviceConfig, ConfigError> {
    let username = resolve_username(profile, profile_name)?;
    let password = resolve_password(profile, profile_name)?;
    build_device_config(profile, defaults, username, password)
}

fn build_device_config(
    profile: &Profile,
    defaults: &Defaults,
    username: String,
    password: SecretString,
) -> Result<DeviceConfig, ConfigError> {
    let endpoints = CloudEndpoints::for_region(
        &profile.region,
        &profile.user_pool_id,
        &profile.client_id,
        &profile.identity_pool_id,
        &profile.broker_host,
    )
    .map_err(|e| ConfigError::Validation {
        field: "region".into(),
        reason: e.to_string(),
    })?;

    let tls = profile
        .ca_cert
        .clone()
        .map_or(TlsMode::System, TlsMode::CustomCa);
    let transport = TransportConfig {
        tls,
        timeout: Duration::from_secs(profile.timeout.unwrap_or(defaults.timeout)),
    };

    Ok(
        DeviceConfig::new(username, password, profile.device_id.clone(), endpoints)?
            .with_tuning(tuning_for(profile, defaults))
            .with_transport(transport),
    )
}
