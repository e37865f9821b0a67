//! User configuration – reads/writes `~/.experimentor/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use experimentor_types::RelayConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write config at {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid relay settings: {0}")]
    Invalid(String),
}

/// Persisted settings of the `experimentor` binary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Experiment file used by `experimentor run` when none is given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_experiment: Option<PathBuf>,

    /// Relay endpoints and timings used by every command.
    #[serde(default)]
    pub relay: RelayConfig,
}

impl Config {
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] if the relay settings cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.relay
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}

/// `~/.experimentor/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".experimentor").join("config.toml")
}

/// The saved config with environment overrides, or defaults (plus
/// overrides) when no file exists.
pub fn load() -> Result<Config, ConfigError> {
    let mut cfg = load_from(&config_path())?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    cfg.validate()?;
    Ok(cfg)
}

/// `None` if `path` does not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Some(toml::from_str(&raw)?))
}

/// Apply `EXPERIMENTOR_*` environment variables to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `EXPERIMENTOR_HOST` | `relay.host` |
/// | `EXPERIMENTOR_FANIN_PORT` | `relay.fanin_port` |
/// | `EXPERIMENTOR_FANOUT_PORT` | `relay.fanout_port` |
/// | `EXPERIMENTOR_PUBLISHER_EXIT` | `relay.publisher_exit` |
/// | `EXPERIMENTOR_SUBSCRIBER_EXIT` | `relay.subscriber_exit` |
///
/// Ports that do not parse are ignored with a warning.
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides(cfg, |var| std::env::var(var).ok());
}

pub(crate) fn apply_overrides(cfg: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    let relay = &mut cfg.relay;
    if let Some(host) = lookup("EXPERIMENTOR_HOST") {
        relay.host = host;
    }
    for (var, port) in [
        ("EXPERIMENTOR_FANIN_PORT", &mut relay.fanin_port),
        ("EXPERIMENTOR_FANOUT_PORT", &mut relay.fanout_port),
    ] {
        if let Some(raw) = lookup(var) {
            match raw.parse::<u16>() {
                Ok(p) => *port = p,
                Err(_) => warn!(var, value = %raw, "ignoring invalid port"),
            }
        }
    }
    if let Some(exit) = lookup("EXPERIMENTOR_PUBLISHER_EXIT") {
        relay.publisher_exit = exit;
    }
    if let Some(exit) = lookup("EXPERIMENTOR_SUBSCRIBER_EXIT") {
        relay.subscriber_exit = exit;
    }
}

pub fn save(cfg: &Config) -> Result<(), ConfigError> {
    save_to(cfg, &config_path())
}

/// Write `cfg` readable by the owner only, creating the directory if needed.
pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    let write_err = |source: std::io::Error| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_err)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700)).map_err(write_err)?;
        }
    }
    let raw = toml::to_string_pretty(cfg)?;
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(write_err)?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(write_err)?;
    Ok(())
}
