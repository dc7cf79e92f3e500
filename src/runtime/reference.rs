//! In-process reference runtime for single-node MatMul models.
//!
//! GPU sessions run an untiled kernel through wgpu. When no usable device is
//! available the runtime quietly creates a CPU session instead and reports
//! [`ExecutionBackend::Cpu`], the same way third-party runtimes downgrade.

use super::onnx::{self, MatMulGraph};
use super::{ExecutionBackend, InferenceSession, RuntimeLoader, SessionBackend, Tensor, find_input};
use crate::errors::{HarnessError, HarnessResult};
use crate::gpu::pipeline::{self, GemmPipeline};
use crate::gpu::provisioner::{BufferSet, DevicePreference, GpuDevice, GpuProvisioner};
use crate::gpu::shaders::{self, TileSize};
use crate::workload::WorkloadDescriptor;
use log::{debug, warn};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;

/// Tile of the untiled kernel's workgroups.
const REFERENCE_TILE: u32 = 8;

pub struct ReferenceRuntime {
    provisioner: GpuProvisioner,
    threads: usize,
}

impl ReferenceRuntime {
    pub fn new() -> Self {
        Self {
            provisioner: GpuProvisioner::new(),
            threads: thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    fn create_gpu_session(&self, graph: &MatMulGraph) -> HarnessResult<GpuMatMulSession> {
        let (m, k, n) = graph.dims();
        let workload = WorkloadDescriptor::new(
            dim_u32(m, "M")?,
            dim_u32(n, "N")?,
            dim_u32(k, "K")?,
            1,
        )?;
        let tile = TileSize::new(REFERENCE_TILE).unwrap_or_default();

        let device = self
            .provisioner
            .acquire_device(DevicePreference::HighPerformance, &workload)?;
        let buffers = self.provisioner.create_buffers(&device, &workload)?;
        let kernel = pipeline::compile(&device, &shaders::naive_matmul_wgsl(tile))?;
        for warning in &kernel.warnings {
            debug!("Reference kernel warning: {}", warning);
        }
        let compiled = pipeline::build_pipeline(&device, &kernel, &buffers)?;

        let staging = device.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Staging Buffer"),
            size: workload.c_bytes(),
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Ok(GpuMatMulSession {
            pipeline: compiled,
            staging,
            buffers,
            device,
            grid: pipeline::dispatch_grid(&workload, tile),
            graph: graph.clone(),
        })
    }
}

impl Default for ReferenceRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBackend for ReferenceRuntime {
    fn name(&self) -> &str {
        "reference runtime"
    }

    fn create_session(
        &self,
        model: &[u8],
        preference: ExecutionBackend,
    ) -> HarnessResult<Box<dyn InferenceSession>> {
        let graph = onnx::decode_matmul_model(model)?;
        if preference == ExecutionBackend::Gpu {
            match self.create_gpu_session(&graph) {
                Ok(session) => return Ok(Box::new(session)),
                Err(e) => warn!("GPU session unavailable ({}), using CPU", e),
            }
        }
        Ok(Box::new(CpuMatMulSession::new(graph, self.threads)))
    }
}

/// Loader for [`ReferenceRuntime`]; nothing is fetched.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceRuntimeLoader;

impl RuntimeLoader for ReferenceRuntimeLoader {
    fn describe(&self) -> String {
        "reference runtime".to_string()
    }

    fn load(&self) -> HarnessResult<Arc<dyn SessionBackend>> {
        Ok(Arc::new(ReferenceRuntime::new()))
    }
}

fn dim_u32(value: usize, field: &'static str) -> HarnessResult<u32> {
    u32::try_from(value)
        .map_err(|_| HarnessError::session(format!("dimension {} = {} does not fit in u32", field, value)))
}

/// Validates the A and B feeds against the graph and returns their data.
fn operands<'a>(graph: &MatMulGraph, inputs: &'a [Tensor]) -> HarnessResult<(&'a [f32], &'a [f32])> {
    let mut data = [&[][..], &[][..]];
    for (slot, declared) in data.iter_mut().zip(graph.inputs.iter()) {
        let tensor = find_input(inputs, &declared.name)?;
        let expected: Vec<usize> = declared.dims.iter().map(|d| *d as usize).collect();
        if tensor.dims != expected {
            return Err(HarnessError::session(format!(
                "input '{}' has shape {:?}, model expects {:?}",
                declared.name, tensor.dims, expected
            )));
        }
        *slot = tensor.data.as_slice();
    }
    Ok((data[0], data[1]))
}

fn output_tensor(graph: &MatMulGraph, data: Vec<f32>) -> HarnessResult<Vec<Tensor>> {
    let (m, _, n) = graph.dims();
    Ok(vec![Tensor::new(graph.output.name.clone(), vec![m, n], data)?])
}

/// Session whose passes run on the GPU. Fields drop in declaration order.
struct GpuMatMulSession {
    pipeline: GemmPipeline,
    staging: wgpu::Buffer,
    buffers: BufferSet,
    device: GpuDevice,
    grid: (u32, u32),
    graph: MatMulGraph,
}

impl GpuMatMulSession {
    fn read_output(&self) -> HarnessResult<Vec<f32>> {
        let slice = self.staging.slice(..);
        let (sender, receiver) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        pipeline::wait_idle(&self.device)?;

        receiver
            .recv()
            .map_err(|e| HarnessError::session(format!("readback never completed: {}", e)))?
            .map_err(|e| HarnessError::session(format!("readback failed: {}", e)))?;

        let data = slice.get_mapped_range();
        let result: Vec<f32> = bytemuck::cast_slice(&data).to_vec();
        drop(data);
        self.staging.unmap();
        Ok(result)
    }
}

impl InferenceSession for GpuMatMulSession {
    fn selected_backend(&self) -> ExecutionBackend {
        ExecutionBackend::Gpu
    }

    fn input_names(&self) -> Vec<String> {
        self.graph.input_names()
    }

    fn run(&mut self, inputs: &[Tensor]) -> HarnessResult<Vec<Tensor>> {
        let (a, b) = operands(&self.graph, inputs)?;
        let queue = &self.device.queue;
        queue.write_buffer(&self.buffers.a, 0, bytemuck::cast_slice(a));
        queue.write_buffer(&self.buffers.b, 0, bytemuck::cast_slice(b));

        let mut encoder = self
            .device
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor::default());
        pipeline::encode_pass(&mut encoder, &self.pipeline, self.grid);
        encoder.copy_buffer_to_buffer(&self.buffers.c, 0, &self.staging, 0, self.staging.size());
        pipeline::submit(&self.device, encoder)?;

        let data = self.read_output()?;
        output_tensor(&self.graph, data)
    }
}

impl Drop for GpuMatMulSession {
    fn drop(&mut self) {
        self.staging.destroy();
    }
}

/// Session computing the product on CPU threads, one band of rows each.
pub struct CpuMatMulSession {
    graph: MatMulGraph,
    threads: usize,
}

impl CpuMatMulSession {
    pub fn new(graph: MatMulGraph, threads: usize) -> Self {
        Self {
            graph,
            threads: threads.max(1),
        }
    }
}

impl InferenceSession for CpuMatMulSession {
    fn selected_backend(&self) -> ExecutionBackend {
        ExecutionBackend::Cpu
    }

    fn input_names(&self) -> Vec<String> {
        self.graph.input_names()
    }

    fn run(&mut self, inputs: &[Tensor]) -> HarnessResult<Vec<Tensor>> {
        let (a, b) = operands(&self.graph, inputs)?;
        let (m, k, n) = self.graph.dims();
        let mut c = vec![0.0f32; m * n];

        let rows_per_thread = m.div_ceil(self.threads).max(1);
        thread::scope(|scope| {
            for (band, out) in c.chunks_mut(rows_per_thread * n).enumerate() {
                let first_row = band * rows_per_thread;
                scope.spawn(move || matmul_rows(a, b, out, first_row, k, n));
            }
        });

        output_tensor(&self.graph, c)
    }
}

/// Fills `out` with rows `first_row..` of `A * B`.
fn matmul_rows(a: &[f32], b: &[f32], out: &mut [f32], first_row: usize, k: usize, n: usize) {
    for (offset, row) in out.chunks_mut(n).enumerate() {
        let a_row = &a[(first_row + offset) * k..][..k];
        for (i, &a_val) in a_row.iter().enumerate() {
            let b_row = &b[i * n..][..n];
            for (c_val, &b_val) in row.iter_mut().zip(b_row) {
                *c_val += a_val * b_val;
            }
        }
    }
}
