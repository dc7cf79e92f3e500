//! GPU matrix-multiply benchmark harness.
//!
//! This library compares two ways of computing `C = A * B` on the same GPU: a
//! hand-written tiled WGSL kernel dispatched directly through wgpu, and an
//! inference runtime executing an equivalent single-node MatMul model. Both
//! are measured under one protocol (warmup, timed passes, init cost reported
//! separately) and summarized side by side.

pub mod artifacts;
pub mod benchmarks;
pub mod errors;
pub mod gpu;
pub mod runtime;
pub mod workload;

pub use benchmarks::{BenchConfig, BenchResult, BenchmarkController, Comparison, Side};
pub use errors::{ConfigError, HarnessError, HarnessResult};
pub use workload::WorkloadDescriptor;
