use crate::error::BswError;
use crate::fsutil::{expand_path, write_atomic_text_file};
use crate::lifecycle::LifecyclePolicy;
use crate::logging::parse_level;
use crate::session::SessionBackend;
use crate::update::{DEFAULT_LINKS_URL, DEFAULT_PLATFORM_TAG, DEFAULT_USER_AGENT};
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_VERSION: u32 = 1;
pub const DEFAULT_CONFIG_YAML: &str = include_str!("../config/default.yaml");

pub const CONFIG_ENV: &str = "BSW_CONFIG";
pub const CONFIG_DIR_ENV: &str = "BSW_CONFIG_DIR";
pub const SERVERS_DIR_ENV: &str = "BSW_SERVERS_DIR";

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub version: u32,
    pub paths: Paths,
    pub distribution: DistributionConfig,
    pub session: SessionConfig,
    pub backup: BackupConfig,
    pub stop: StopConfig,
    pub status: StatusConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Paths {
    pub servers_root: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DistributionConfig {
    pub links_url: String,
    pub platform_tag: String,
    pub links_timeout_sec: u64,
    pub download_timeout_sec: u64,
    pub user_agent: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    pub backend: SessionBackend,
    pub prefix: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
#[serde(default, deny_unknown_fields)]
pub struct BackupConfig {
    pub cooldown_min: Option<u64>,
    pub retention: Option<usize>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct StopConfig {
    pub wait_for_exit: bool,
    pub wait_timeout_sec: u64,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct StatusConfig {
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            paths: Paths::default(),
            distribution: DistributionConfig::default(),
            session: SessionConfig::default(),
            backup: BackupConfig::default(),
            stop: StopConfig::default(),
            status: StatusConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            servers_root: "~/.bedrock_servers".to_string(),
        }
    }
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            links_url: DEFAULT_LINKS_URL.to_string(),
            platform_tag: DEFAULT_PLATFORM_TAG.to_string(),
            links_timeout_sec: 10,
            download_timeout_sec: 30,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backend: SessionBackend::Screen,
            prefix: "bsw-".to_string(),
        }
    }
}

impl Default for StopConfig {
    fn default() -> Self {
        Self {
            wait_for_exit: false,
            wait_timeout_sec: 60,
            poll_interval_ms: 500,
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self { timeout_ms: 2000 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}

impl Config {
    /// Servers root after applying `BSW_SERVERS_DIR` and `~/` expansion.
    pub fn servers_root(&self) -> PathBuf {
        servers_root_with(self, env::var(SERVERS_DIR_ENV).ok())
    }

    pub fn policy(&self) -> LifecyclePolicy {
        LifecyclePolicy {
            platform_tag: self.distribution.platform_tag.clone(),
            backup_cooldown_min: self.backup.cooldown_min,
            backup_retention: self.backup.retention,
            wait_for_exit: self.stop.wait_for_exit,
            wait_timeout: Duration::from_secs(self.stop.wait_timeout_sec),
            poll_interval: Duration::from_millis(self.stop.poll_interval_ms),
        }
    }
}

fn servers_root_with(cfg: &Config, env_override: Option<String>) -> PathBuf {
    match env_override {
        Some(path) if !path.trim().is_empty() => expand_path(path.trim()),
        _ => expand_path(cfg.paths.servers_root.trim()),
    }
}

pub fn resolve_config_path(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var(CONFIG_ENV) {
        return PathBuf::from(path);
    }
    let mut base = default_config_dir();
    base.push("config.yaml");
    base
}

pub fn default_config_dir() -> PathBuf {
    if let Ok(path) = env::var(CONFIG_DIR_ENV) {
        return PathBuf::from(path);
    }
    let mut base = home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push(".config");
    base.push("bsw");
    base
}

pub fn read_config_from_str(content: &str) -> Result<Config, BswError> {
    let cfg: Config = serde_yaml::from_str(content)?;
    if cfg.version != CONFIG_VERSION {
        return Err(BswError::Config(format!(
            "unsupported config version {}",
            cfg.version
        )));
    }
    validate_config(&cfg)?;
    Ok(cfg)
}

/// Reads and validates the file at `path`; a missing file is an error.
pub fn read_config(path: &Path) -> Result<Config, BswError> {
    let content = fs::read_to_string(path)?;
    read_config_from_str(&content)
}

/// Like [`read_config`], but an absent file yields the defaults.
pub fn load_config(path: &Path) -> Result<Config, BswError> {
    match fs::read_to_string(path) {
        Ok(content) => read_config_from_str(&content),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Config::default()),
        Err(err) => Err(err.into()),
    }
}

/// Writes the default config unless a file already exists. Returns whether
/// a file was written.
pub fn init_config(path: &Path) -> Result<bool, BswError> {
    if path.exists() {
        return Ok(false);
    }
    write_atomic_text_file(path, DEFAULT_CONFIG_YAML, Some(0o644))?;
    Ok(true)
}

pub fn validate_config(cfg: &Config) -> Result<(), BswError> {
    if cfg.paths.servers_root.trim().is_empty() {
        return Err(BswError::Config(
            "paths.servers_root must be non-empty".to_string(),
        ));
    }
    let url = cfg.distribution.links_url.trim();
    if !(url.starts_with("https://") || url.starts_with("http://")) {
        return Err(BswError::Config(format!(
            "distribution.links_url must be an http(s) URL: {url:?}"
        )));
    }
    if cfg.distribution.platform_tag.trim().is_empty() {
        return Err(BswError::Config(
            "distribution.platform_tag must be non-empty".to_string(),
        ));
    }
    if cfg.distribution.links_timeout_sec == 0 || cfg.distribution.download_timeout_sec == 0 {
        return Err(BswError::Config(
            "distribution timeouts must be greater than 0".to_string(),
        ));
    }
    let prefix = &cfg.session.prefix;
    if prefix.is_empty()
        || prefix
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || matches!(c, '.' | ':' | '='))
    {
        return Err(BswError::Config(format!(
            "session.prefix must be non-empty without whitespace, '.', ':' or '=': {prefix:?}"
        )));
    }
    if cfg.backup.retention == Some(0) {
        return Err(BswError::Config(
            "backup.retention must be at least 1 (use null to keep every backup)".to_string(),
        ));
    }
    if cfg.stop.wait_timeout_sec == 0 || cfg.stop.poll_interval_ms == 0 {
        return Err(BswError::Config(
            "stop.wait_timeout_sec and stop.poll_interval_ms must be greater than 0".to_string(),
        ));
    }
    if cfg.status.timeout_ms == 0 {
        return Err(BswError::Config(
            "status.timeout_ms must be greater than 0".to_string(),
        ));
    }
    if parse_level(&cfg.logging.level).is_none() {
        return Err(BswError::Config(format!(
            "logging.level must be one of trace, debug, info, warn, error: {:?}",
            cfg.logging.level
        )));
    }
    Ok(())
}
