use std::io;
use std::path::{Path, PathBuf};

use rdmx_lambda::LambdaConfig;
use rdmx_logging::LogConfig;
use rdmx_verbs::config::InvalidConfig;
use rdmx_verbs::{HandshakeConfig, RdmaConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error(transparent)]
    Invalid(#[from] InvalidConfig),
}

/// Everything one `rdmx` process can be configured with. Every section and
/// every field is optional in the file.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub rdma: RdmaConfig,

    #[serde(default)]
    pub handshake: HandshakeConfig,

    #[serde(default)]
    pub lambda: LambdaConfig,
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Parses and validates.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), InvalidConfig> {
        self.rdma.validate()?;
        self.handshake.validate()?;
        self.lambda.validate()?;
        if self.log.level.trim().is_empty() {
            return Err(InvalidConfig::new("log", "level must not be empty"));
        }
        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}
