//! Native GPU path: device provisioning, kernel composition and dispatch.
//!
//! # Lifecycle
//!
//! A run acquires one adapter and device through [`GpuProvisioner`], uploads
//! the operands into a [`BufferSet`], compiles the composed kernel and then
//! dispatches it repeatedly. Everything is destroyed in reverse order when the
//! run is released.
//!
//! ```ignore
//! use gemm_bench::gpu::{NativeBackend, NativeConfig};
//!
//! let mut backend = NativeBackend::new(NativeConfig::default());
//! let outcome = controller.run(Side::Native, &mut backend, &workload);
//! ```

pub mod native_backend;
pub mod pipeline;
pub mod provisioner;
pub mod shaders;

pub use native_backend::{NativeBackend, NativeConfig};
pub use pipeline::{CompiledKernel, GemmPipeline};
pub use provisioner::{
    BufferSet, DeviceFaults, DevicePreference, GemmParams, GpuDevice, GpuProvisioner,
};
pub use shaders::{ComposedKernel, TileSize};
