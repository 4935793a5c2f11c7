//! Process-level glue shared by the `rdmx` binary: the aggregated
//! configuration file, shutdown signal wiring and a console line feed that
//! gives up when shutdown is requested.

pub mod config;
pub mod lines;
pub mod signal;

pub use config::{AppConfig, ConfigError};
pub use lines::LineFeed;
pub use signal::{spawn_shutdown_watcher, wait_for_shutdown_signal};
