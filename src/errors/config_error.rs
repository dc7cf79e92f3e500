//! Error types for configuration loading.

use thiserror::Error;

/// Errors that can occur while loading or validating a [`BenchConfig`].
///
/// [`BenchConfig`]: crate::benchmarks::BenchConfig
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Configuration validation error for field '{field}': {message}")]
    Validation { field: String, message: String },

    #[error("Invalid command line argument '{argument}': {message}")]
    InvalidArgument { argument: String, message: String },
}
