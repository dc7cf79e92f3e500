//! Measurement protocol and result formatting.

use super::backend::BenchBackend;
use super::benchmark_types::{BenchResult, Comparison, Side, SideState};
use super::log_stream::LogStream;
use crate::errors::HarnessResult;
use crate::workload::WorkloadDescriptor;
use std::fmt::Write;
use std::time::Instant;

/// Source of monotonic timestamps in milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> f64;
}

/// Production clock backed by [`Instant`], immune to calendar adjustments.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> f64 {
        self.origin.elapsed().as_secs_f64() * 1_000.0
    }
}

/// Releases a provisioned backend when dropped, including during unwinding.
struct ReleaseGuard<'a> {
    backend: &'a mut dyn BenchBackend,
    log: &'a LogStream,
}

impl Drop for ReleaseGuard<'_> {
    fn drop(&mut self) {
        self.backend.release(self.log);
    }
}

/// Drives `backend` through the full protocol and returns its statistics.
///
/// Once provisioning has succeeded, `release` runs exactly once regardless of
/// how the remaining steps end, a panic included.
pub fn run_protocol<C>(
    backend: &mut dyn BenchBackend,
    workload: &WorkloadDescriptor,
    clock: &C,
    log: &LogStream,
) -> HarnessResult<BenchResult>
where
    C: Clock + ?Sized,
{
    backend.provision(workload, log)?;
    let mut guard = ReleaseGuard { backend, log };
    measure(&mut *guard.backend, workload, clock, log)
}

fn measure<C>(
    backend: &mut dyn BenchBackend,
    workload: &WorkloadDescriptor,
    clock: &C,
    log: &LogStream,
) -> HarnessResult<BenchResult>
where
    C: Clock + ?Sized,
{
    let init_start = clock.now_ms();
    backend.initialize(log)?;
    let init_ms = clock.now_ms() - init_start;
    log.push(format!("{} initialized in {:.1} ms", backend.name(), init_ms));

    log.push("Warmup pass...");
    backend.execute_pass()?;

    let runs = workload.runs();
    log.push(format!("Running {} timed passes...", runs));
    let mut times = Vec::with_capacity(runs as usize);
    for i in 0..runs {
        let start = clock.now_ms();
        backend.execute_pass()?;
        let elapsed = clock.now_ms() - start;
        times.push(elapsed);
        log.push(format!("  Run {}/{}: {:.2} ms", i + 1, runs, elapsed));
    }

    Ok(summarize(&times, workload, init_ms))
}

/// Aggregates timed pass durations (milliseconds) into a [`BenchResult`].
pub fn summarize(times: &[f64], workload: &WorkloadDescriptor, init_ms: f64) -> BenchResult {
    if times.is_empty() {
        return BenchResult {
            avg_ms: 0.0,
            gflops: 0.0,
            min_dispatch_ms: 0.0,
            init_ms,
            runs: 0,
        };
    }

    let avg_ms = times.iter().sum::<f64>() / times.len() as f64;
    let min_dispatch_ms = times.iter().copied().fold(f64::INFINITY, f64::min);
    let gflops = workload.flops() / (avg_ms * 1e6);

    BenchResult {
        avg_ms,
        gflops,
        min_dispatch_ms,
        init_ms,
        runs: times.len() as u32,
    }
}

/// Closing log line of a successful run.
pub fn done_line(result: &BenchResult) -> String {
    format!(
        "Done. Avg: {:.2} ms | {:.1} GFLOPS",
        result.avg_ms, result.gflops
    )
}

/// Renders a human readable report of both sides and, when available, the
/// head-to-head comparison.
pub fn format_report(
    workload: &WorkloadDescriptor,
    native: &SideState,
    external: &SideState,
    comparison: Option<&Comparison>,
) -> String {
    let mut out = String::new();
    let rule = "=".repeat(80);

    let _ = writeln!(out, "{rule}");
    let _ = writeln!(
        out,
        "GEMM {}x{}x{} ({} timed runs)",
        workload.m(),
        workload.n(),
        workload.k(),
        workload.runs()
    );
    let _ = writeln!(out, "{rule}");

    for (side, state) in [(Side::Native, native), (Side::External, external)] {
        let init_label = match side {
            Side::Native => "Shader compile",
            Side::External => "Session init",
        };
        let _ = writeln!(out, "\n{} [{:?}]", side, state.state);
        match (&state.result, &state.error) {
            (Some(result), _) => {
                let _ = writeln!(out, "   Avg time:      {:.2} ms", result.avg_ms);
                let _ = writeln!(out, "   GFLOPS:        {:.1}", result.gflops);
                let _ = writeln!(out, "   Min dispatch:  {:.2} ms", result.min_dispatch_ms);
                let _ = writeln!(out, "   {:<15}{:.1} ms", format!("{init_label}:"), result.init_ms);
                let _ = writeln!(out, "   Runs:          {}", result.runs);
            }
            (None, Some(error)) => {
                let _ = writeln!(out, "   Error: {error}");
            }
            (None, None) => {
                let _ = writeln!(out, "   (not run)");
            }
        }
    }

    if let Some(comparison) = comparison {
        let _ = writeln!(out, "\n{rule}");
        match comparison.winner {
            Some(winner) => {
                let _ = writeln!(
                    out,
                    "Speedup: {:.2}x, {} is faster on this GPU",
                    comparison.ratio, winner
                );
            }
            None => {
                let _ = writeln!(out, "Speedup: 1.00x, both backends tied");
            }
        }
        let _ = writeln!(
            out,
            "native {:.2} ms vs external {:.2} ms",
            comparison.native.avg_ms, comparison.external.avg_ms
        );
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summarize_reference_scenario() {
        let workload = WorkloadDescriptor::square(1024, 5).unwrap();
        let result = summarize(&[10.0, 9.0, 11.0, 10.0, 10.0], &workload, 3.5);

        assert!((result.avg_ms - 10.0).abs() < 1e-9);
        assert_eq!(result.min_dispatch_ms, 9.0);
        assert!((result.gflops - 214.748_364_8).abs() < 1e-6);
        assert_eq!(result.init_ms, 3.5);
        assert_eq!(result.runs, 5);
    }

    #[test]
    fn test_done_line_precision() {
        let result = BenchResult {
            avg_ms: 1.23456,
            gflops: 98.765,
            min_dispatch_ms: 1.0,
            init_ms: 0.0,
            runs: 3,
        };
        assert_eq!(done_line(&result), "Done. Avg: 1.23 ms | 98.8 GFLOPS");
    }

    #[test]
    fn test_report_shows_error_in_place_of_results() {
        let workload = WorkloadDescriptor::square(16, 1).unwrap();
        let report = format_report(
            &workload,
            &SideState::failed("No compute-capable GPU adapter is available"),
            &SideState::default(),
            None,
        );
        assert!(report.contains("Error: No compute-capable GPU adapter is available"));
        assert!(!report.contains("Speedup"));
    }
}
