use crate::error::PkiError;
use crate::fields::parse_duration;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix of environment overrides, e.g. `RUSTPKI__SERVER__LISTEN`.
pub const ENV_PREFIX: &str = "RUSTPKI";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub engine: EngineConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    /// Engine paths are served under `/v1/<mount_path>/`.
    pub mount_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8200".to_string(),
            mount_path: "pki".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Local,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Local,
            path: PathBuf::from("./data/pki"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub default_lease_ttl: String,
    pub max_lease_ttl: String,
    pub mount_uuid: String,
    pub auto_tidy_poll_interval: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_lease_ttl: "768h".to_string(),
            max_lease_ttl: "768h".to_string(),
            mount_uuid: uuid::Uuid::new_v4().to_string(),
            auto_tidy_poll_interval: "1m".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn default_lease_ttl(&self) -> crate::Result<Duration> {
        config_duration("engine.default_lease_ttl", &self.default_lease_ttl)
    }

    pub fn max_lease_ttl(&self) -> crate::Result<Duration> {
        config_duration("engine.max_lease_ttl", &self.max_lease_ttl)
    }

    pub fn auto_tidy_poll_interval(&self) -> crate::Result<Duration> {
        config_duration("engine.auto_tidy_poll_interval", &self.auto_tidy_poll_interval)
    }

    pub fn validate(&self) -> crate::Result<()> {
        let default_ttl = self.default_lease_ttl()?;
        let max_ttl = self.max_lease_ttl()?;
        if max_ttl.is_zero() {
            return Err(PkiError::InvalidConfig(
                "engine.max_lease_ttl must be greater than 0".to_string(),
            ));
        }
        if default_ttl > max_ttl {
            return Err(PkiError::InvalidConfig(
                "engine.default_lease_ttl must not exceed engine.max_lease_ttl".to_string(),
            ));
        }
        if self.auto_tidy_poll_interval()?.is_zero() {
            return Err(PkiError::InvalidConfig(
                "engine.auto_tidy_poll_interval must be greater than 0".to_string(),
            ));
        }
        if self.mount_uuid.trim().is_empty() {
            return Err(PkiError::InvalidConfig(
                "engine.mount_uuid cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn config_duration(name: &str, value: &str) -> crate::Result<Duration> {
    parse_duration(value)
        .map_err(|e| PkiError::InvalidConfig(format!("{name}: {e}")))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Loads a TOML file and layers `RUSTPKI__*` environment overrides on top.
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).format(config::FileFormat::Toml))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;
        let config: Config = settings.try_deserialize()?;
        Ok(config)
    }

    pub fn from_toml_str(s: &str) -> crate::Result<Self> {
        toml::from_str(s).map_err(|e| PkiError::Config(e.to_string()))
    }

    pub fn listen_addr(&self) -> crate::Result<SocketAddr> {
        self.server.listen.parse().map_err(|e| {
            PkiError::InvalidConfig(format!("server.listen {:?}: {e}", self.server.listen))
        })
    }

    pub fn validate(&self) -> crate::Result<()> {
        self.listen_addr()?;

        let mount = self.server.mount_path.trim_matches('/');
        if mount.is_empty() || mount.contains('/') {
            return Err(PkiError::InvalidConfig(
                "server.mount_path must be a single non-empty path segment".to_string(),
            ));
        }

        if self.storage.backend == StorageBackend::Local
            && self.storage.path.as_os_str().is_empty()
        {
            return Err(PkiError::InvalidConfig(
                "storage.path cannot be empty for the local backend".to_string(),
            ));
        }

        self.engine.validate()?;

        if self
            .logging
            .level
            .parse::<tracing::Level>()
            .is_err()
        {
            return Err(PkiError::InvalidConfig(format!(
                "logging.level {:?} is not a valid level",
                self.logging.level
            )));
        }
        Ok(())
    }
}
