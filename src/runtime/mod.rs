//! External inference runtime path.
//!
//! The benchmark logic only sees the [`SessionBackend`] and
//! [`InferenceSession`] capabilities. How a runtime gets into the process is
//! the job of a [`RuntimeLoader`]: the in-process reference runtime, or a
//! shared library opened at run time.

pub mod adapter;
pub mod cache;
pub mod dynamic;
pub mod onnx;
pub mod reference;

use crate::errors::{HarnessError, HarnessResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

pub use adapter::{ExternalConfig, ExternalRuntimeAdapter};
pub use cache::RuntimeCache;
pub use dynamic::PluginRuntimeLoader;
pub use reference::{ReferenceRuntime, ReferenceRuntimeLoader};

/// Execution target requested from (and reported by) a runtime session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionBackend {
    #[default]
    Gpu,
    Cpu,
}

impl fmt::Display for ExecutionBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionBackend::Gpu => write!(f, "gpu"),
            ExecutionBackend::Cpu => write!(f, "cpu"),
        }
    }
}

/// Named row-major f32 tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub name: String,
    pub dims: Vec<usize>,
    pub data: Vec<f32>,
}

impl Tensor {
    pub fn new(name: impl Into<String>, dims: Vec<usize>, data: Vec<f32>) -> HarnessResult<Self> {
        let name = name.into();
        let expected: usize = dims.iter().product();
        if expected != data.len() {
            return Err(HarnessError::session(format!(
                "tensor '{}' has {} elements but shape {:?} needs {}",
                name,
                data.len(),
                dims,
                expected
            )));
        }
        Ok(Self { name, dims, data })
    }
}

/// A model instance ready to execute.
pub trait InferenceSession: Send {
    /// The backend the runtime actually chose, which may differ from the one requested.
    fn selected_backend(&self) -> ExecutionBackend;

    fn input_names(&self) -> Vec<String>;

    /// Runs one inference pass to completion.
    fn run(&mut self, inputs: &[Tensor]) -> HarnessResult<Vec<Tensor>>;
}

/// A loaded runtime able to create sessions from serialized models.
pub trait SessionBackend: Send + Sync {
    fn name(&self) -> &str;

    fn create_session(
        &self,
        model: &[u8],
        preference: ExecutionBackend,
    ) -> HarnessResult<Box<dyn InferenceSession>>;
}

/// Strategy for bringing a runtime into the process.
pub trait RuntimeLoader: Send + Sync {
    fn describe(&self) -> String;

    fn load(&self) -> HarnessResult<Arc<dyn SessionBackend>>;
}

/// Which runtime the external side loads.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RuntimeSpec {
    #[default]
    Reference,
    Plugin {
        path: PathBuf,
    },
}

impl RuntimeSpec {
    pub fn loader(&self) -> Box<dyn RuntimeLoader> {
        match self {
            RuntimeSpec::Reference => Box::new(ReferenceRuntimeLoader),
            RuntimeSpec::Plugin { path } => Box::new(PluginRuntimeLoader::new(path.clone())),
        }
    }
}

/// Finds the tensor called `name`.
pub(crate) fn find_input<'a>(inputs: &'a [Tensor], name: &str) -> HarnessResult<&'a Tensor> {
    inputs
        .iter()
        .find(|tensor| tensor.name == name)
        .ok_or_else(|| HarnessError::session(format!("missing input tensor '{}'", name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_shape_must_match_data() {
        assert!(Tensor::new("A", vec![2, 3], vec![0.0; 6]).is_ok());
        assert!(matches!(
            Tensor::new("A", vec![2, 3], vec![0.0; 5]),
            Err(HarnessError::SessionError { .. })
        ));
    }

    #[test]
    fn test_runtime_spec_from_json() {
        let spec: RuntimeSpec =
            serde_json::from_str(r#"{"kind": "plugin", "path": "libgemmrt.so"}"#).unwrap();
        assert_eq!(
            spec,
            RuntimeSpec::Plugin {
                path: PathBuf::from("libgemmrt.so")
            }
        );
        assert_eq!(RuntimeSpec::default().loader().describe(), "reference runtime");
    }
}
