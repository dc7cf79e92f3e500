//! Error types for the benchmark harness.
//!
//! Each concern gets its own enum instead of a generic wrapper like `anyhow`
//! or `Box<dyn Error>`, so callers can match on the exact failure.

mod config_error;
mod harness_error;

pub use config_error::ConfigError;
pub use harness_error::HarnessError;

/// Result type alias for protocol operations.
pub type HarnessResult<T> = std::result::Result<T, HarnessError>;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
