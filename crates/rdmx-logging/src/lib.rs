//! Logging setup shared by the rdmx binaries.
//!
//! Everything in the workspace logs through `tracing`; this crate only owns
//! subscriber construction. `RUST_LOG` always wins over the configured level.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub use tracing::{debug, error, info, trace, warn};

/// How often the log file is rolled over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rotation {
    Hourly,
    #[default]
    Daily,
    Never,
}

impl From<Rotation> for rolling::Rotation {
    fn from(r: Rotation) -> Self {
        match r {
            Rotation::Hourly => rolling::Rotation::HOURLY,
            Rotation::Daily => rolling::Rotation::DAILY,
            Rotation::Never => rolling::Rotation::NEVER,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Level filter used when `RUST_LOG` is unset.
    #[serde(default = "default_level")]
    pub level: String,

    /// Directory for log files. No file output when absent.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    #[serde(default = "default_prefix")]
    pub file_prefix: String,

    #[serde(default)]
    pub rotation: Rotation,

    #[serde(default)]
    pub json_format: bool,

    /// Console output goes to stderr so that stdout stays free for
    /// mode output (received messages, lambda results).
    #[serde(default = "default_true")]
    pub console_output: bool,
}

fn default_level() -> String {
    "info".into()
}

fn default_prefix() -> String {
    "rdmx".into()
}

fn default_true() -> bool {
    true
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: default_level(),
            log_dir: None,
            file_prefix: default_prefix(),
            rotation: Rotation::default(),
            json_format: false,
            console_output: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("invalid log filter {filter:?}: {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("failed to create log file appender in {dir}: {reason}")]
    Appender { dir: PathBuf, reason: String },

    #[error("a global subscriber is already installed")]
    AlreadyInitialized,
}

/// Builds the filter: `RUST_LOG` when set, otherwise the configured level.
pub fn build_filter(config: &LogConfig) -> Result<EnvFilter, LogError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.level).map_err(|e| LogError::InvalidFilter {
        filter: config.level.clone(),
        reason: e.to_string(),
    })
}

/// Installs the global subscriber. Call once at startup and keep the returned
/// guard alive for as long as file output should be flushed.
pub fn init_logging(config: &LogConfig) -> Result<Option<WorkerGuard>, LogError> {
    let registry = tracing_subscriber::registry().with(build_filter(config)?);

    let console_layer: Option<Box<dyn tracing_subscriber::Layer<_> + Send + Sync>> =
        match (config.console_output, config.json_format) {
            (false, _) => None,
            (true, true) => Some(Box::new(fmt::layer().json().with_writer(std::io::stderr))),
            (true, false) => Some(Box::new(fmt::layer().with_writer(std::io::stderr))),
        };

    let (file_layer, guard): (
        Option<Box<dyn tracing_subscriber::Layer<_> + Send + Sync>>,
        Option<WorkerGuard>,
    ) = match config.log_dir {
        Some(ref log_dir) => {
            let appender = rolling::RollingFileAppender::builder()
                .rotation(config.rotation.into())
                .filename_prefix(&config.file_prefix)
                .filename_suffix("log")
                .build(log_dir)
                .map_err(|e| LogError::Appender {
                    dir: log_dir.clone(),
                    reason: e.to_string(),
                })?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer: Box<dyn tracing_subscriber::Layer<_> + Send + Sync> = if config.json_format
            {
                Box::new(fmt::layer().json().with_ansi(false).with_writer(writer))
            } else {
                Box::new(fmt::layer().with_ansi(false).with_writer(writer))
            };
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    registry
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|_| LogError::AlreadyInitialized)?;

    Ok(guard)
}
