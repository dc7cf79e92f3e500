//! Benchmark result and state types.

use serde::Serialize;
use std::fmt;

/// Aggregate statistics of one successful backend run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BenchResult {
    pub avg_ms: f64,
    pub gflops: f64,
    pub min_dispatch_ms: f64,
    /// One-time cost (kernel compile or session creation), never part of `avg_ms`.
    pub init_ms: f64,
    pub runs: u32,
}

/// The two compute paths being compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Direct wgpu dispatch of the tiled GEMM kernel.
    Native,
    /// Externally loaded inference runtime running a MatMul model.
    External,
}

impl Side {
    pub const ALL: [Side; 2] = [Side::Native, Side::External];

    pub fn label(&self) -> &'static str {
        match self {
            Side::Native => "native",
            Side::External => "external",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            Side::Native => 0,
            Side::External => 1,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BenchState {
    #[default]
    Idle,
    Running,
    Done,
    Error,
}

/// Per-backend state. `result` is set only in `Done`, `error` only in `Error`.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SideState {
    pub state: BenchState,
    pub result: Option<BenchResult>,
    pub error: Option<String>,
}

impl SideState {
    pub fn running() -> Self {
        Self {
            state: BenchState::Running,
            result: None,
            error: None,
        }
    }

    pub fn done(result: BenchResult) -> Self {
        Self {
            state: BenchState::Done,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            state: BenchState::Error,
            result: None,
            error: Some(message.into()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == BenchState::Running
    }
}

/// What happened to a run request.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(BenchResult),
    Failed(String),
    /// The backend was already running; nothing was started.
    Rejected,
}

/// Shortest average treated as distinct from zero when forming a ratio (1 ns).
pub const MIN_RESOLVABLE_MS: f64 = 1e-6;

/// Head-to-head report, only available when both sides are `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Comparison {
    pub native: BenchResult,
    pub external: BenchResult,
    /// Slower average over faster average, always `>= 1.0`.
    pub ratio: f64,
    /// Side with the lower `avg_ms`; `None` on an exact tie.
    pub winner: Option<Side>,
}

impl Comparison {
    /// Averages below [`MIN_RESOLVABLE_MS`] are divided as if they were that
    /// value, so the ratio stays finite; two such averages tie at `1.0`.
    pub fn new(native: BenchResult, external: BenchResult) -> Self {
        let fastest = native.avg_ms.min(external.avg_ms).max(MIN_RESOLVABLE_MS);
        let slowest = native.avg_ms.max(external.avg_ms).max(MIN_RESOLVABLE_MS);
        let ratio = slowest / fastest;
        let winner = if native.avg_ms < external.avg_ms {
            Some(Side::Native)
        } else if external.avg_ms < native.avg_ms {
            Some(Side::External)
        } else {
            None
        };

        Self {
            native,
            external,
            ratio,
            winner,
        }
    }
}
