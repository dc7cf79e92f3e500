//! Per-backend state machines and dual-backend orchestration.

use super::backend::BenchBackend;
use super::benchmark_types::{BenchResult, BenchState, Comparison, RunOutcome, Side, SideState};
use super::log_stream::{LogLine, LogStream};
use super::performance_metrics::{Clock, MonotonicClock, done_line, run_protocol};
use crate::errors::{HarnessError, HarnessResult};
use crate::workload::WorkloadDescriptor;
use log::{error, info, warn};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

struct SideSlot {
    state: Mutex<SideState>,
    log: LogStream,
}

impl SideSlot {
    fn new(side: Side) -> Self {
        Self {
            state: Mutex::new(SideState::default()),
            log: LogStream::new(side.label()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SideState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Owns the state and log of both backends and sequences their runs.
///
/// The controller is `Sync`: run requests may come from several threads. A
/// request for a side that is already `Running` is rejected and never starts
/// a second protocol instance.
pub struct BenchmarkController {
    clock: Arc<dyn Clock>,
    sides: [SideSlot; 2],
}

impl BenchmarkController {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            sides: [SideSlot::new(Side::Native), SideSlot::new(Side::External)],
        }
    }

    /// Runs one backend's full protocol.
    pub fn run(
        &self,
        side: Side,
        backend: &mut dyn BenchBackend,
        workload: &WorkloadDescriptor,
    ) -> RunOutcome {
        if !self.try_begin(&[side]) {
            warn!("{} benchmark already running, request rejected", side);
            return RunOutcome::Rejected;
        }
        self.execute(side, backend, workload)
    }

    /// Runs the native protocol to completion, then the external one, so the
    /// two backends never contend for the device. Rejected as a whole when
    /// either side is already running.
    pub fn run_both(
        &self,
        native: &mut dyn BenchBackend,
        external: &mut dyn BenchBackend,
        workload: &WorkloadDescriptor,
    ) -> (RunOutcome, RunOutcome) {
        if !self.try_begin(&Side::ALL) {
            warn!("A benchmark is already running, run-both request rejected");
            return (RunOutcome::Rejected, RunOutcome::Rejected);
        }

        self.slot(Side::Native).log.push(format!("--- {} ---", native.name()));
        let native_outcome = self.execute(Side::Native, native, workload);

        self.slot(Side::External)
            .log
            .push(format!("--- {} ---", external.name()));
        let external_outcome = self.execute(Side::External, external, workload);

        (native_outcome, external_outcome)
    }

    pub fn side_state(&self, side: Side) -> SideState {
        self.slot(side).lock().clone()
    }

    pub fn log_lines(&self, side: Side) -> Vec<LogLine> {
        self.slot(side).log.lines()
    }

    pub fn log_messages(&self, side: Side) -> Vec<String> {
        self.slot(side).log.messages()
    }

    pub fn is_running(&self, side: Side) -> bool {
        self.slot(side).lock().is_running()
    }

    /// Head-to-head report; `None` unless both sides are `Done`.
    pub fn comparison(&self) -> Option<Comparison> {
        let native = self.side_state(Side::Native);
        let external = self.side_state(Side::External);
        if native.state != BenchState::Done || external.state != BenchState::Done {
            return None;
        }
        Some(Comparison::new(native.result?, external.result?))
    }

    fn slot(&self, side: Side) -> &SideSlot {
        &self.sides[side.index()]
    }

    /// Atomically moves every listed side to `Running` and resets its log.
    /// Returns `false`, changing nothing, if any of them is already running.
    fn try_begin(&self, sides: &[Side]) -> bool {
        let mut guards: Vec<_> = sides.iter().map(|side| self.slot(*side).lock()).collect();
        if guards.iter().any(|state| state.is_running()) {
            return false;
        }
        for guard in guards.iter_mut() {
            **guard = SideState::running();
        }
        drop(guards);

        for side in sides {
            self.slot(*side).log.reset();
        }
        true
    }

    fn execute(
        &self,
        side: Side,
        backend: &mut dyn BenchBackend,
        workload: &WorkloadDescriptor,
    ) -> RunOutcome {
        let slot = self.slot(side);
        info!("Starting {} benchmark ({})", side, backend.name());

        match self.contain(backend, workload, &slot.log) {
            Ok(result) => {
                *slot.lock() = SideState::done(result);
                slot.log.push(done_line(&result));
                RunOutcome::Completed(result)
            }
            Err(e) => {
                let message = e.to_string();
                error!("{} benchmark failed: {}", side, message);
                *slot.lock() = SideState::failed(message.clone());
                slot.log.push(format!("ERROR: {}", message));
                RunOutcome::Failed(message)
            }
        }
    }

    /// Runs the protocol, turning a panicking backend into an ordinary
    /// failure so its side leaves `Running`.
    fn contain(
        &self,
        backend: &mut dyn BenchBackend,
        workload: &WorkloadDescriptor,
        log: &LogStream,
    ) -> HarnessResult<BenchResult> {
        panic::catch_unwind(AssertUnwindSafe(|| {
            run_protocol(backend, workload, self.clock.as_ref(), log)
        }))
        .unwrap_or_else(|payload| {
            Err(HarnessError::BackendPanicked {
                message: panic_message(payload.as_ref()),
            })
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl Default for BenchmarkController {
    fn default() -> Self {
        Self::new()
    }
}
