//! Direct GPU dispatch of the tiled GEMM kernel.

use super::pipeline::{self, GemmPipeline};
use super::provisioner::{BufferSet, DevicePreference, GpuDevice, GpuProvisioner};
use super::shaders::TileSize;
use crate::artifacts::{self, ArtifactSource};
use crate::benchmarks::backend::BenchBackend;
use crate::benchmarks::log_stream::LogStream;
use crate::errors::{HarnessError, HarnessResult};
use crate::workload::WorkloadDescriptor;
use log::warn;

/// Settings of the native path.
#[derive(Debug, Clone, Default)]
pub struct NativeConfig {
    pub preference: DevicePreference,
    pub tile: TileSize,
    pub kernel: ArtifactSource,
    pub seed: u64,
}

/// Resources of one provisioned run. Fields drop in declaration order, so the
/// pipeline goes before the buffers it binds and the buffers before the device.
struct NativeRun {
    pipeline: Option<GemmPipeline>,
    buffers: BufferSet,
    device: GpuDevice,
    source: String,
    grid: (u32, u32),
}

pub struct NativeBackend {
    config: NativeConfig,
    provisioner: GpuProvisioner,
    run: Option<NativeRun>,
}

impl NativeBackend {
    pub fn new(config: NativeConfig) -> Self {
        Self {
            config,
            provisioner: GpuProvisioner::new(),
            run: None,
        }
    }

    fn active_run(&mut self) -> HarnessResult<&mut NativeRun> {
        self.run
            .as_mut()
            .ok_or_else(|| HarnessError::session("native backend is not provisioned"))
    }
}

impl BenchBackend for NativeBackend {
    fn name(&self) -> &str {
        "Native WebGPU"
    }

    fn provision(&mut self, workload: &WorkloadDescriptor, log: &LogStream) -> HarnessResult<()> {
        log.push("Requesting GPU adapter...");
        let device = self
            .provisioner
            .acquire_device(self.config.preference, workload)?;
        log.push(format!("GPU: {}", device.describe()));

        let kernel = artifacts::load_kernel_source(&self.config.kernel, self.config.tile)?;
        if !kernel.tile_injected {
            warn!(
                "Kernel from {} has no tile placeholder, dispatch grid assumes tile {}",
                self.config.kernel,
                self.config.tile.get()
            );
            log.push("Warning: kernel tile size is not tied to the dispatch grid");
        }

        let grid = pipeline::dispatch_grid(workload, self.config.tile);
        let largest = grid.0.max(grid.1);
        if largest > device.max_workgroups_per_dimension {
            return Err(HarnessError::LimitExceeded {
                limit: "max_compute_workgroups_per_dimension",
                required: largest as u64,
                available: device.max_workgroups_per_dimension as u64,
            });
        }

        log.push("Uploading matrix data to GPU...");
        let buffers = self
            .provisioner
            .allocate(&device, workload, self.config.seed)?;

        self.run = Some(NativeRun {
            pipeline: None,
            buffers,
            device,
            source: kernel.source,
            grid,
        });
        Ok(())
    }

    fn initialize(&mut self, log: &LogStream) -> HarnessResult<()> {
        let run = self.active_run()?;
        let kernel = pipeline::compile(&run.device, &run.source)?;
        for warning in &kernel.warnings {
            log.push(format!("Shader warning: {}", warning));
        }
        run.pipeline = Some(pipeline::build_pipeline(&run.device, &kernel, &run.buffers)?);
        Ok(())
    }

    fn execute_pass(&mut self) -> HarnessResult<()> {
        let run = self.active_run()?;
        let compiled = run
            .pipeline
            .as_ref()
            .ok_or_else(|| HarnessError::session("kernel has not been compiled"))?;
        pipeline::dispatch(&run.device, compiled, run.grid)?;
        pipeline::wait_idle(&run.device)
    }

    fn release(&mut self, log: &LogStream) {
        if let Some(run) = self.run.take() {
            drop(run.pipeline);
            self.provisioner.release(run.buffers, run.device);
            log.push("Released GPU buffers and device");
        }
    }
}

impl Drop for NativeBackend {
    fn drop(&mut self) {
        if self.run.is_some() {
            warn!("Native backend dropped while provisioned, releasing");
            self.run = None;
        }
    }
}
