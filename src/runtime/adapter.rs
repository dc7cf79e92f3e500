//! Drives an external runtime through the benchmark protocol.

use super::cache::RuntimeCache;
use super::onnx;
use super::{ExecutionBackend, InferenceSession, SessionBackend, Tensor};
use crate::artifacts::{self, ArtifactSource};
use crate::benchmarks::backend::BenchBackend;
use crate::benchmarks::log_stream::LogStream;
use crate::errors::{HarnessError, HarnessResult};
use crate::gpu::provisioner::random_matrix;
use crate::workload::WorkloadDescriptor;
use log::warn;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::sync::Arc;

/// Settings of the external path.
#[derive(Debug, Clone, Default)]
pub struct ExternalConfig {
    pub model: ArtifactSource,
    pub preference: ExecutionBackend,
    /// Accept a session on a different backend than requested, with a warning.
    pub allow_backend_fallback: bool,
    pub seed: u64,
}

/// Loads the runtime through `cache`, reporting every failure as a runtime load error.
pub fn ensure_runtime_loaded(cache: &RuntimeCache) -> HarnessResult<Arc<dyn SessionBackend>> {
    cache.ensure_loaded().map_err(|e| match e {
        err @ HarnessError::RuntimeLoadError { .. } => err,
        other => HarnessError::runtime_load(other.to_string()),
    })
}

/// Retrieves the model bytes. The embedded source encodes a MatMul model
/// shaped for `workload`.
pub fn fetch_model(source: &ArtifactSource, workload: &WorkloadDescriptor) -> HarnessResult<Vec<u8>> {
    match artifacts::fetch_bytes(source) {
        Ok(Some(bytes)) => Ok(bytes),
        Ok(None) => Ok(onnx::encode_matmul_model(
            workload.m(),
            workload.k(),
            workload.n(),
        )),
        Err(failure) => Err(failure.into_model_error(source)),
    }
}

/// Creates a session and verifies the backend the runtime actually selected.
pub fn create_session(
    runtime: &dyn SessionBackend,
    model: &[u8],
    preference: ExecutionBackend,
    allow_backend_fallback: bool,
) -> HarnessResult<Box<dyn InferenceSession>> {
    let session = runtime.create_session(model, preference)?;
    let selected = session.selected_backend();
    if selected != preference {
        if !allow_backend_fallback {
            return Err(HarnessError::BackendMismatch {
                requested: preference.to_string(),
                selected: selected.to_string(),
            });
        }
        warn!(
            "{} selected the {} backend instead of {}, continuing",
            runtime.name(),
            selected,
            preference
        );
    }
    Ok(session)
}

/// One inference pass; the outputs are discarded.
pub fn run_inference(session: &mut dyn InferenceSession, inputs: &[Tensor]) -> HarnessResult<()> {
    session.run(inputs).map(|_| ())
}

/// Random `A` (`[m, k]`) and `B` (`[k, n]`) feeds.
pub fn build_inputs(workload: &WorkloadDescriptor, seed: u64) -> HarnessResult<Vec<Tensor>> {
    let (m, n, k) = (
        workload.m() as usize,
        workload.n() as usize,
        workload.k() as usize,
    );
    let mut rng = StdRng::seed_from_u64(seed);
    Ok(vec![
        Tensor::new("A", vec![m, k], random_matrix(workload.a_len(), &mut rng))?,
        Tensor::new("B", vec![k, n], random_matrix(workload.b_len(), &mut rng))?,
    ])
}

struct ExternalRun {
    runtime: Arc<dyn SessionBackend>,
    model: Vec<u8>,
    inputs: Vec<Tensor>,
    session: Option<Box<dyn InferenceSession>>,
}

pub struct ExternalRuntimeAdapter {
    config: ExternalConfig,
    cache: Arc<RuntimeCache>,
    run: Option<ExternalRun>,
}

impl ExternalRuntimeAdapter {
    pub fn new(config: ExternalConfig, cache: Arc<RuntimeCache>) -> Self {
        Self {
            config,
            cache,
            run: None,
        }
    }

    fn active_run(&mut self) -> HarnessResult<&mut ExternalRun> {
        self.run
            .as_mut()
            .ok_or_else(|| HarnessError::session("external runtime is not provisioned"))
    }
}

impl BenchBackend for ExternalRuntimeAdapter {
    fn name(&self) -> &str {
        "External Runtime"
    }

    fn provision(&mut self, workload: &WorkloadDescriptor, log: &LogStream) -> HarnessResult<()> {
        if !self.cache.is_loaded() {
            log.push(format!("Loading {}...", self.cache.describe()));
        }
        let runtime = ensure_runtime_loaded(&self.cache)?;
        log.push(format!("Runtime: {}", runtime.name()));

        let model = fetch_model(&self.config.model, workload)?;
        log.push(format!("Model size: {} bytes", model.len()));

        let inputs = build_inputs(workload, self.config.seed)?;
        self.run = Some(ExternalRun {
            runtime,
            model,
            inputs,
            session: None,
        });
        Ok(())
    }

    fn initialize(&mut self, log: &LogStream) -> HarnessResult<()> {
        let preference = self.config.preference;
        let allow_fallback = self.config.allow_backend_fallback;
        let run = self.active_run()?;

        log.push(format!(
            "Creating inference session with {} backend...",
            preference
        ));
        let session = create_session(run.runtime.as_ref(), &run.model, preference, allow_fallback)?;
        let selected = session.selected_backend();
        if selected != preference {
            log.push(format!(
                "Warning: runtime selected the {} backend instead of {}",
                selected, preference
            ));
        }
        run.session = Some(session);
        Ok(())
    }

    fn execute_pass(&mut self) -> HarnessResult<()> {
        let run = self.active_run()?;
        let session = run
            .session
            .as_mut()
            .ok_or_else(|| HarnessError::session("inference session has not been created"))?;
        run_inference(session.as_mut(), &run.inputs)
    }

    fn release(&mut self, log: &LogStream) {
        if let Some(run) = self.run.take() {
            drop(run.session);
            log.push("Released inference session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ReferenceRuntime;

    #[test]
    fn test_embedded_model_matches_workload() {
        let workload = WorkloadDescriptor::new(8, 4, 2, 1).unwrap();
        let bytes = fetch_model(&ArtifactSource::Embedded, &workload).unwrap();
        let graph = onnx::decode_matmul_model(&bytes).unwrap();
        assert_eq!(graph.dims(), (8, 2, 4));
    }

    #[test]
    fn test_inputs_follow_model_shapes() {
        let workload = WorkloadDescriptor::new(3, 5, 7, 1).unwrap();
        let inputs = build_inputs(&workload, 42).unwrap();
        assert_eq!(inputs[0].name, "A");
        assert_eq!(inputs[0].dims, vec![3, 7]);
        assert_eq!(inputs[1].name, "B");
        assert_eq!(inputs[1].dims, vec![7, 5]);
    }

    #[test]
    fn test_cpu_session_satisfies_cpu_preference() {
        let runtime = ReferenceRuntime::new();
        let model = onnx::encode_matmul_model(4, 4, 4);
        let session = create_session(&runtime, &model, ExecutionBackend::Cpu, false).unwrap();
        assert_eq!(session.selected_backend(), ExecutionBackend::Cpu);
    }
}
