//! Error types raised while running a benchmark protocol.

use thiserror::Error;

/// Errors that terminate a single backend run.
///
/// None of these are retried: the controller converts them into the
/// backend's `Error` state and a closing log line.
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Invalid workload: {field} must be greater than 0 (got {value})")]
    InvalidWorkload { field: &'static str, value: u32 },

    #[error("No compute-capable GPU adapter is available")]
    NoDeviceAvailable,

    #[error("GPU device request denied: {message}")]
    DeviceRequestDenied { message: String },

    #[error("Required {limit} of {required} bytes exceeds the device maximum of {available} bytes")]
    LimitExceeded {
        limit: &'static str,
        required: u64,
        available: u64,
    },

    #[error("GPU buffer allocation failed: {message}")]
    AllocationError { message: String },

    #[error("WGSL compile error: {message}")]
    CompileError { message: String },

    #[error("GPU dispatch failed: {message}")]
    DispatchError { message: String },

    #[error("Failed to load artifact from {location}: {message}")]
    ArtifactError { location: String, message: String },

    #[error("Failed to fetch model from {location}: status {status}")]
    ModelFetchError { location: String, status: u16 },

    #[error("Failed to load inference runtime: {message}")]
    RuntimeLoadError { message: String },

    #[error("Inference session error: {message}")]
    SessionError { message: String },

    #[error("Runtime selected the {selected} backend but {requested} was requested")]
    BackendMismatch { requested: String, selected: String },

    #[error("Backend panicked: {message}")]
    BackendPanicked { message: String },
}

impl HarnessError {
    pub fn session(message: impl Into<String>) -> Self {
        HarnessError::SessionError {
            message: message.into(),
        }
    }

    pub fn dispatch(message: impl Into<String>) -> Self {
        HarnessError::DispatchError {
            message: message.into(),
        }
    }

    pub fn runtime_load(message: impl Into<String>) -> Self {
        HarnessError::RuntimeLoadError {
            message: message.into(),
        }
    }
}
