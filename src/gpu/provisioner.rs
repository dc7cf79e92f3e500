//! GPU device acquisition, limit negotiation and buffer lifecycle.

use crate::errors::{HarnessError, HarnessResult};
use crate::workload::WorkloadDescriptor;
use log::{debug, error, info};
use pollster::FutureExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// Extra bytes requested on top of the largest operand.
pub const LIMIT_SLACK_BYTES: u64 = 4096;

/// Size of the uniform parameter buffer (`m`, `n`, `k`, `alpha`).
pub const PARAMS_SIZE_BYTES: u64 = std::mem::size_of::<GemmParams>() as u64;

/// Uniform parameters shared by every MatMul kernel in this crate.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GemmParams {
    pub m: u32,
    pub n: u32,
    pub k: u32,
    pub alpha: f32,
}

impl GemmParams {
    pub fn for_workload(workload: &WorkloadDescriptor) -> Self {
        Self {
            m: workload.m(),
            n: workload.n(),
            k: workload.k(),
            alpha: 1.0,
        }
    }
}

/// Adapter performance preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DevicePreference {
    /// Prefer the highest throughput adapter available.
    #[default]
    HighPerformance,
    LowPower,
}

impl DevicePreference {
    pub fn to_wgpu(self) -> wgpu::PowerPreference {
        match self {
            DevicePreference::HighPerformance => wgpu::PowerPreference::HighPerformance,
            DevicePreference::LowPower => wgpu::PowerPreference::LowPower,
        }
    }
}

/// Buffer-size limits requested from the device for one workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitSpec {
    pub max_storage_buffer_binding_size: u32,
    pub max_buffer_size: u64,
}

impl LimitSpec {
    /// Applies the negotiated sizes on top of `base`.
    pub fn apply(&self, base: wgpu::Limits) -> wgpu::Limits {
        wgpu::Limits {
            max_storage_buffer_binding_size: self.max_storage_buffer_binding_size,
            max_buffer_size: self.max_buffer_size,
            ..base
        }
    }
}

/// Computes the limits a workload needs from what the adapter advertises.
///
/// Each limit is the largest operand plus [`LIMIT_SLACK_BYTES`], clamped to
/// the advertised maximum. Fails before anything is allocated when the
/// largest operand alone does not fit.
pub fn negotiate_limits(
    advertised: &wgpu::Limits,
    workload: &WorkloadDescriptor,
) -> HarnessResult<LimitSpec> {
    let largest = workload.max_operand_bytes();
    let binding_max = advertised.max_storage_buffer_binding_size as u64;

    if largest > binding_max {
        return Err(HarnessError::LimitExceeded {
            limit: "max_storage_buffer_binding_size",
            required: largest,
            available: binding_max,
        });
    }
    if largest > advertised.max_buffer_size {
        return Err(HarnessError::LimitExceeded {
            limit: "max_buffer_size",
            required: largest,
            available: advertised.max_buffer_size,
        });
    }

    let needed = largest + LIMIT_SLACK_BYTES;
    Ok(LimitSpec {
        max_storage_buffer_binding_size: needed.min(binding_max) as u32,
        max_buffer_size: needed.min(advertised.max_buffer_size),
    })
}

/// First GPU failure reported outside an error scope: an uncaptured error or
/// the loss of the device. Later reports are dropped until it is taken.
#[derive(Debug, Clone, Default)]
pub struct DeviceFaults {
    first: Arc<Mutex<Option<String>>>,
}

impl DeviceFaults {
    pub fn record(&self, message: impl Into<String>) {
        let mut first = self.first.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if first.is_none() {
            *first = Some(message.into());
        }
    }

    pub fn take(&self) -> Option<String> {
        self.first
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

/// An opened device. Destroyed when released or dropped.
pub struct GpuDevice {
    pub info: wgpu::AdapterInfo,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub limits: LimitSpec,
    pub max_workgroups_per_dimension: u32,
    faults: DeviceFaults,
}

impl GpuDevice {
    /// Short adapter description for logs.
    pub fn describe(&self) -> String {
        format!("{} ({:?})", self.info.name, self.info.backend)
    }

    /// Fails with [`HarnessError::DispatchError`] if the device reported an
    /// error or was lost since the last check.
    pub fn check_faults(&self) -> HarnessResult<()> {
        match self.faults.take() {
            Some(message) => Err(HarnessError::dispatch(message)),
            None => Ok(()),
        }
    }
}

impl Drop for GpuDevice {
    fn drop(&mut self) {
        debug!("Destroying GPU device {}", self.info.name);
        self.device.destroy();
    }
}

/// Parameter buffer plus the three operand buffers of one run.
pub struct BufferSet {
    pub params: wgpu::Buffer,
    pub a: wgpu::Buffer,
    pub b: wgpu::Buffer,
    pub c: wgpu::Buffer,
}

impl BufferSet {
    fn destroy(&self) {
        self.params.destroy();
        self.a.destroy();
        self.b.destroy();
        self.c.destroy();
    }
}

impl Drop for BufferSet {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Acquires devices and manages the buffers of a run.
pub struct GpuProvisioner {
    instance: wgpu::Instance,
}

impl GpuProvisioner {
    pub fn new() -> Self {
        Self {
            instance: wgpu::Instance::new(&wgpu::InstanceDescriptor::default()),
        }
    }

    /// Finds a compute-capable adapter matching `preference`.
    pub fn acquire_adapter(&self, preference: DevicePreference) -> HarnessResult<wgpu::Adapter> {
        self.instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: preference.to_wgpu(),
                force_fallback_adapter: false,
                compatible_surface: None,
            })
            .block_on()
            .ok_or(HarnessError::NoDeviceAvailable)
    }

    /// Opens a device whose buffer limits fit `workload`.
    pub fn acquire_device(
        &self,
        preference: DevicePreference,
        workload: &WorkloadDescriptor,
    ) -> HarnessResult<GpuDevice> {
        let adapter = self.acquire_adapter(preference)?;
        let info = adapter.get_info();
        let advertised = adapter.limits();
        let limits = negotiate_limits(&advertised, workload)?;

        info!(
            "Requesting device on {} with {} byte binding limit",
            info.name, limits.max_storage_buffer_binding_size
        );

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("gemm-bench device"),
                    required_limits: limits.apply(advertised.clone()),
                    ..Default::default()
                },
                None,
            )
            .block_on()
            .map_err(|e| HarnessError::DeviceRequestDenied {
                message: e.to_string(),
            })?;

        let faults = DeviceFaults::default();
        let uncaptured = faults.clone();
        device.on_uncaptured_error(Box::new(move |e| {
            error!("Uncaptured GPU error: {}", e);
            uncaptured.record(e.to_string());
        }));
        let lost = faults.clone();
        device.set_device_lost_callback(move |reason, message| {
            if !matches!(reason, wgpu::DeviceLostReason::Destroyed) {
                error!("GPU device lost ({:?}): {}", reason, message);
                lost.record(format!("device lost: {}", message));
            }
        });

        Ok(GpuDevice {
            info,
            device,
            queue,
            limits,
            max_workgroups_per_dimension: advertised.max_compute_workgroups_per_dimension,
            faults,
        })
    }

    /// Creates the parameter and operand buffers for `workload` without
    /// uploading operand data. The parameter buffer is written immediately.
    pub fn create_buffers(
        &self,
        gpu: &GpuDevice,
        workload: &WorkloadDescriptor,
    ) -> HarnessResult<BufferSet> {
        let device = &gpu.device;
        device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let storage = |label: &str, size: u64, extra: wgpu::BufferUsages| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage: wgpu::BufferUsages::STORAGE | extra,
                mapped_at_creation: false,
            })
        };

        let buffers = BufferSet {
            params: device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("Params Buffer"),
                size: PARAMS_SIZE_BYTES,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            }),
            a: storage("A Buffer", workload.a_bytes(), wgpu::BufferUsages::COPY_DST),
            b: storage("B Buffer", workload.b_bytes(), wgpu::BufferUsages::COPY_DST),
            c: storage("C Buffer", workload.c_bytes(), wgpu::BufferUsages::COPY_SRC),
        };

        let validation = device.pop_error_scope().block_on();
        let out_of_memory = device.pop_error_scope().block_on();
        if let Some(e) = validation.or(out_of_memory) {
            return Err(HarnessError::AllocationError {
                message: e.to_string(),
            });
        }

        let params = GemmParams::for_workload(workload);
        gpu.queue
            .write_buffer(&buffers.params, 0, bytemuck::bytes_of(&params));
        Ok(buffers)
    }

    /// Allocates the buffers for `workload` and uploads uniformly distributed
    /// operands drawn from an RNG seeded with `seed`.
    pub fn allocate(
        &self,
        gpu: &GpuDevice,
        workload: &WorkloadDescriptor,
        seed: u64,
    ) -> HarnessResult<BufferSet> {
        let buffers = self.create_buffers(gpu, workload)?;

        let mut rng = StdRng::seed_from_u64(seed);
        let a_data = random_matrix(workload.a_len(), &mut rng);
        let b_data = random_matrix(workload.b_len(), &mut rng);
        gpu.queue
            .write_buffer(&buffers.a, 0, bytemuck::cast_slice(&a_data));
        gpu.queue
            .write_buffer(&buffers.b, 0, bytemuck::cast_slice(&b_data));

        Ok(buffers)
    }

    /// Destroys every buffer, then the device.
    pub fn release(&self, buffers: BufferSet, device: GpuDevice) {
        debug!("Releasing buffers and device {}", device.info.name);
        drop(buffers);
        drop(device);
    }
}

impl Default for GpuProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

/// `len` values drawn uniformly from `[0, 1)`.
pub fn random_matrix(len: usize, rng: &mut StdRng) -> Vec<f32> {
    (0..len).map(|_| rng.random::<f32>()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(binding: u32, buffer: u64) -> wgpu::Limits {
        wgpu::Limits {
            max_storage_buffer_binding_size: binding,
            max_buffer_size: buffer,
            ..Default::default()
        }
    }

    #[test]
    fn test_faults_keep_first_report_until_taken() {
        let faults = DeviceFaults::default();
        assert_eq!(faults.take(), None);

        faults.clone().record("buffer destroyed");
        faults.record("second failure");
        assert_eq!(faults.take().as_deref(), Some("buffer destroyed"));
        assert_eq!(faults.take(), None);
    }

    #[test]
    fn test_negotiate_adds_slack() {
        let workload = WorkloadDescriptor::square(1024, 5).unwrap();
        let negotiated = negotiate_limits(&limits(1 << 30, 1 << 30), &workload).unwrap();

        let expected = 1024 * 1024 * 4 + LIMIT_SLACK_BYTES;
        assert_eq!(negotiated.max_storage_buffer_binding_size as u64, expected);
        assert_eq!(negotiated.max_buffer_size, expected);
    }

    #[test]
    fn test_negotiate_uses_largest_operand() {
        let workload = WorkloadDescriptor::new(8, 1000, 2, 1).unwrap();
        let negotiated = negotiate_limits(&limits(1 << 30, 1 << 30), &workload).unwrap();
        assert_eq!(negotiated.max_buffer_size, 8 * 1000 * 4 + LIMIT_SLACK_BYTES);
    }

    #[test]
    fn test_negotiate_clamps_slack_to_device_maximum() {
        let workload = WorkloadDescriptor::square(1024, 1).unwrap();
        let exact = (1024 * 1024 * 4) as u32;
        let negotiated = negotiate_limits(&limits(exact, exact as u64 + 100), &workload).unwrap();

        assert_eq!(negotiated.max_storage_buffer_binding_size, exact);
        assert_eq!(negotiated.max_buffer_size, exact as u64 + 100);
    }

    #[test]
    fn test_negotiate_fails_fast_when_operand_exceeds_binding_limit() {
        let workload = WorkloadDescriptor::square(4096, 1).unwrap();
        assert!(negotiate_limits(&limits(128 << 20, 1 << 30), &workload).is_ok());

        let result = negotiate_limits(&limits(32 << 20, 1 << 30), &workload);
        assert!(matches!(
            result,
            Err(HarnessError::LimitExceeded {
                limit: "max_storage_buffer_binding_size",
                required: 67_108_864,
                available: 33_554_432,
            })
        ));
    }

    #[test]
    fn test_negotiate_fails_fast_when_operand_exceeds_buffer_limit() {
        let workload = WorkloadDescriptor::square(2048, 1).unwrap();
        let result = negotiate_limits(&limits(1 << 30, 1 << 20), &workload);
        assert!(matches!(
            result,
            Err(HarnessError::LimitExceeded {
                limit: "max_buffer_size",
                ..
            })
        ));
    }

    #[test]
    fn test_params_layout_is_sixteen_bytes() {
        assert_eq!(PARAMS_SIZE_BYTES, 16);
        let workload = WorkloadDescriptor::new(3, 4, 5, 1).unwrap();
        let params = GemmParams::for_workload(&workload);
        assert_eq!((params.m, params.n, params.k, params.alpha), (3, 4, 5, 1.0));
    }

    #[test]
    fn test_random_matrix_is_reproducible_and_in_range() {
        let first = random_matrix(64, &mut StdRng::seed_from_u64(7));
        let second = random_matrix(64, &mut StdRng::seed_from_u64(7));
        assert_eq!(first, second);
        assert!(first.iter().all(|v| (0.0..1.0).contains(v)));
    }
}
