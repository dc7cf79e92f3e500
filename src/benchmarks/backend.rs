//! The seam between the measurement protocol and a concrete compute path.

use super::log_stream::LogStream;
use crate::errors::HarnessResult;
use crate::workload::WorkloadDescriptor;

/// One compute path driven through the shared measurement protocol.
///
/// The protocol calls the methods strictly in order: `provision`, `initialize`,
/// one warmup `execute_pass`, `runs` timed `execute_pass` calls, `release`.
/// `release` is called exactly once whenever `provision` succeeded, including
/// when a later step failed. A failing `provision` must clean up anything it
/// acquired itself; `release` is not called in that case.
pub trait BenchBackend {
    /// Display name used in log lines.
    fn name(&self) -> &str;

    /// Acquires every resource the run needs (device, buffers, runtime, model, inputs).
    fn provision(&mut self, workload: &WorkloadDescriptor, log: &LogStream) -> HarnessResult<()>;

    /// One-time setup whose latency is reported as `init_ms`
    /// (kernel compilation, session creation).
    fn initialize(&mut self, log: &LogStream) -> HarnessResult<()>;

    /// Submits one unit of work and blocks until it has completed.
    fn execute_pass(&mut self) -> HarnessResult<()>;

    /// Releases everything acquired by `provision` and `initialize`.
    fn release(&mut self, log: &LogStream);
}
