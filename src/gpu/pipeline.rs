//! Kernel compilation, pipeline construction and dispatch.

use super::provisioner::{BufferSet, GpuDevice};
use super::shaders::TileSize;
use crate::errors::{HarnessError, HarnessResult};
use crate::workload::WorkloadDescriptor;
use pollster::FutureExt;

/// Kernel entry point.
pub const ENTRY_POINT: &str = "main";

/// Binding positions the kernels are written against. The order is part of
/// the kernel contract and is never permuted.
pub mod bindings {
    pub const PARAMS: u32 = 0;
    pub const A: u32 = 1;
    pub const B: u32 = 2;
    pub const C: u32 = 3;
}

/// A successfully compiled shader module and its non-fatal diagnostics.
pub struct CompiledKernel {
    pub module: wgpu::ShaderModule,
    pub warnings: Vec<String>,
}

/// Compute pipeline plus the bind group wiring the run's buffers to it.
pub struct GemmPipeline {
    pipeline: wgpu::ComputePipeline,
    bind_group: wgpu::BindGroup,
}

/// Compiles WGSL `source`. Any error-severity diagnostic fails the compile;
/// warnings are returned alongside the module.
pub fn compile(gpu: &GpuDevice, source: &str) -> HarnessResult<CompiledKernel> {
    gpu.device.push_error_scope(wgpu::ErrorFilter::Validation);
    let module = gpu
        .device
        .create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("GEMM Shader"),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });
    let compilation_info = module.get_compilation_info().block_on();
    let scope_error = gpu.device.pop_error_scope().block_on();

    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    for message in compilation_info.messages {
        let text = match &message.location {
            Some(location) => format!(
                "{}:{}: {}",
                location.line_number, location.line_position, message.message
            ),
            None => message.message.clone(),
        };
        match message.message_type {
            wgpu::CompilationMessageType::Error => errors.push(text),
            wgpu::CompilationMessageType::Warning => warnings.push(text),
            wgpu::CompilationMessageType::Info => {}
        }
    }

    if errors.is_empty() {
        if let Some(e) = scope_error {
            errors.push(e.to_string());
        }
    }
    if !errors.is_empty() {
        return Err(HarnessError::CompileError {
            message: errors.join("; "),
        });
    }

    Ok(CompiledKernel { module, warnings })
}

fn buffer_entry(binding: u32, ty: wgpu::BufferBindingType) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// The fixed layout: params uniform, A and B read-only, C read-write.
pub fn gemm_bind_group_layout(device: &wgpu::Device) -> wgpu::BindGroupLayout {
    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("GEMM Bind Group Layout"),
        entries: &[
            buffer_entry(bindings::PARAMS, wgpu::BufferBindingType::Uniform),
            buffer_entry(
                bindings::A,
                wgpu::BufferBindingType::Storage { read_only: true },
            ),
            buffer_entry(
                bindings::B,
                wgpu::BufferBindingType::Storage { read_only: true },
            ),
            buffer_entry(
                bindings::C,
                wgpu::BufferBindingType::Storage { read_only: false },
            ),
        ],
    })
}

/// Builds the compute pipeline and binds `buffers` at their fixed positions.
///
/// A kernel whose bindings disagree with the fixed layout is reported as a
/// compile error.
pub fn build_pipeline(
    gpu: &GpuDevice,
    kernel: &CompiledKernel,
    buffers: &BufferSet,
) -> HarnessResult<GemmPipeline> {
    let device = &gpu.device;
    device.push_error_scope(wgpu::ErrorFilter::Validation);

    let bind_group_layout = gemm_bind_group_layout(device);
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("GEMM Pipeline Layout"),
        bind_group_layouts: &[&bind_group_layout],
        push_constant_ranges: &[],
    });

    let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some("GEMM Pipeline"),
        layout: Some(&pipeline_layout),
        module: &kernel.module,
        entry_point: Some(ENTRY_POINT),
        compilation_options: Default::default(),
        cache: None,
    });

    let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("GEMM Bind Group"),
        layout: &bind_group_layout,
        entries: &[
            wgpu::BindGroupEntry {
                binding: bindings::PARAMS,
                resource: buffers.params.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: bindings::A,
                resource: buffers.a.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: bindings::B,
                resource: buffers.b.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: bindings::C,
                resource: buffers.c.as_entire_binding(),
            },
        ],
    });

    if let Some(e) = device.pop_error_scope().block_on() {
        return Err(HarnessError::CompileError {
            message: format!("pipeline creation failed: {}", e),
        });
    }

    Ok(GemmPipeline {
        pipeline,
        bind_group,
    })
}

/// Workgroup counts `(ceil(N / tile), ceil(M / tile))`.
pub fn dispatch_grid(workload: &WorkloadDescriptor, tile: TileSize) -> (u32, u32) {
    (
        workload.n().div_ceil(tile.get()),
        workload.m().div_ceil(tile.get()),
    )
}

/// Encodes one compute pass and submits it. Does not wait for completion.
pub fn dispatch(gpu: &GpuDevice, pipeline: &GemmPipeline, grid: (u32, u32)) -> HarnessResult<()> {
    let mut encoder = gpu
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor::default());
    encode_pass(&mut encoder, pipeline, grid);
    submit(gpu, encoder)
}

/// Records one compute pass into `encoder`.
pub fn encode_pass(encoder: &mut wgpu::CommandEncoder, pipeline: &GemmPipeline, grid: (u32, u32)) {
    let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor::default());
    pass.set_pipeline(&pipeline.pipeline);
    pass.set_bind_group(0, &pipeline.bind_group, &[]);
    pass.dispatch_workgroups(grid.0, grid.1, 1);
}

/// Finishes `encoder` and submits it under a validation scope. Errors raised
/// by the encoder or by the submission itself fail the call.
pub fn submit(gpu: &GpuDevice, encoder: wgpu::CommandEncoder) -> HarnessResult<()> {
    gpu.device.push_error_scope(wgpu::ErrorFilter::Validation);
    gpu.queue.submit(Some(encoder.finish()));
    if let Some(e) = gpu.device.pop_error_scope().block_on() {
        return Err(HarnessError::dispatch(e.to_string()));
    }
    gpu.check_faults()
}

/// Blocks until all previously submitted work has retired, then surfaces any
/// error or device loss reported meanwhile.
pub fn wait_idle(gpu: &GpuDevice) -> HarnessResult<()> {
    gpu.device.poll(wgpu::Maintain::Wait);
    gpu.check_faults()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_grid_exact_multiple() {
        let workload = WorkloadDescriptor::square(1024, 1).unwrap();
        assert_eq!(dispatch_grid(&workload, TileSize::DEFAULT), (64, 64));
    }

    #[test]
    fn test_dispatch_grid_rounds_up() {
        let workload = WorkloadDescriptor::new(17, 33, 5, 1).unwrap();
        assert_eq!(dispatch_grid(&workload, TileSize::DEFAULT), (3, 2));

        let tile = TileSize::new(8).unwrap();
        assert_eq!(dispatch_grid(&workload, tile), (5, 3));
    }

    #[test]
    fn test_binding_positions() {
        assert_eq!(
            [bindings::PARAMS, bindings::A, bindings::B, bindings::C],
            [0, 1, 2, 3]
        );
    }
}
