//! Benchmark protocol, state machine and configuration.
//!
//! Both compute paths implement [`BenchBackend`] and are driven through the
//! same measurement protocol by a [`BenchmarkController`], which keeps one
//! state machine and one log stream per side.

pub mod backend;
pub mod benchmark_types;
pub mod config;
pub mod controller;
pub mod log_stream;
pub mod performance_metrics;

pub use backend::BenchBackend;
pub use benchmark_types::{BenchResult, BenchState, Comparison, RunOutcome, Side, SideState};
pub use config::{BenchConfig, ConfigLoader, DEFAULT_CONFIG_PATH, SUPPORTED_SIZES};
pub use controller::BenchmarkController;
pub use log_stream::{LogLine, LogStream};
pub use performance_metrics::{Clock, MonotonicClock, format_report, run_protocol, summarize};
