//! GEMM benchmark CLI executable.

use gemm_bench::benchmarks::{
    BenchConfig, BenchState, BenchmarkController, Comparison, ConfigLoader, DEFAULT_CONFIG_PATH,
    SUPPORTED_SIZES, Side, SideState, format_report,
};
use gemm_bench::errors::{ConfigError, HarnessError};
use gemm_bench::gpu::NativeBackend;
use gemm_bench::runtime::{ExternalRuntimeAdapter, RuntimeCache};
use gemm_bench::workload::WorkloadDescriptor;
use log::{error, info};
use serde::Serialize;
use std::env;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Harness(#[from] HarnessError),

    #[error("Failed to serialize report: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Benchmark failed for: {sides}")]
    BenchmarkFailed { sides: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BackendSelection {
    Native,
    External,
    Both,
}

impl BackendSelection {
    fn sides(&self) -> &'static [Side] {
        match self {
            BackendSelection::Native => &[Side::Native],
            BackendSelection::External => &[Side::External],
            BackendSelection::Both => &Side::ALL,
        }
    }
}

#[derive(Debug)]
struct CliArgs {
    config_path: String,
    size: Option<u32>,
    runs: Option<u32>,
    backend: BackendSelection,
    json: bool,
    list_sizes: bool,
    help: bool,
}

#[derive(Serialize)]
struct JsonReport<'a> {
    workload: &'a WorkloadDescriptor,
    native: &'a SideState,
    external: &'a SideState,
    comparison: Option<&'a Comparison>,
}

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        error!("Benchmark execution failed: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), CliError> {
    let args = parse_args(env::args().skip(1))?;

    if args.help {
        print_usage();
        return Ok(());
    }
    if args.list_sizes {
        list_sizes();
        return Ok(());
    }

    let mut config = ConfigLoader::load_config(&args.config_path)?;
    apply_overrides(&mut config, &args);
    config.validate()?;
    let workload = config.workload()?;

    info!(
        "GEMM {}x{}x{}, {} runs, backend selection {:?}",
        workload.m(),
        workload.n(),
        workload.k(),
        workload.runs(),
        args.backend
    );

    let controller = BenchmarkController::new();
    let cache = Arc::new(RuntimeCache::new(config.runtime.loader()));
    let mut native = NativeBackend::new(config.native_config());
    let mut external = ExternalRuntimeAdapter::new(config.external_config(), cache);

    match args.backend {
        BackendSelection::Native => {
            controller.run(Side::Native, &mut native, &workload);
        }
        BackendSelection::External => {
            controller.run(Side::External, &mut external, &workload);
        }
        BackendSelection::Both => {
            controller.run_both(&mut native, &mut external, &workload);
        }
    }

    let native_state = controller.side_state(Side::Native);
    let external_state = controller.side_state(Side::External);
    let comparison = controller.comparison();

    if args.json {
        let report = JsonReport {
            workload: &workload,
            native: &native_state,
            external: &external_state,
            comparison: comparison.as_ref(),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!(
            "{}",
            format_report(&workload, &native_state, &external_state, comparison.as_ref())
        );
    }

    let failed: Vec<&str> = args
        .backend
        .sides()
        .iter()
        .filter(|side| controller.side_state(**side).state == BenchState::Error)
        .map(|side| side.label())
        .collect();
    if !failed.is_empty() {
        return Err(CliError::BenchmarkFailed {
            sides: failed.join(", "),
        });
    }

    Ok(())
}

fn apply_overrides(config: &mut BenchConfig, args: &CliArgs) {
    if let Some(size) = args.size {
        config.matrix_size = size;
    }
    if let Some(runs) = args.runs {
        config.runs = runs;
    }
}

fn parse_args<I>(args: I) -> Result<CliArgs, ConfigError>
where
    I: IntoIterator<Item = String>,
{
    let mut parsed = CliArgs {
        config_path: DEFAULT_CONFIG_PATH.to_string(),
        size: None,
        runs: None,
        backend: BackendSelection::Both,
        json: false,
        list_sizes: false,
        help: false,
    };

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--size" => parsed.size = Some(parse_number(&arg, args.next())?),
            "--runs" => parsed.runs = Some(parse_number(&arg, args.next())?),
            "--config" => parsed.config_path = require_value(&arg, args.next())?,
            "--backend" => {
                parsed.backend = match require_value(&arg, args.next())?.as_str() {
                    "native" => BackendSelection::Native,
                    "external" => BackendSelection::External,
                    "both" => BackendSelection::Both,
                    other => {
                        return Err(ConfigError::InvalidArgument {
                            argument: arg,
                            message: format!(
                                "expected native, external or both, got '{}'",
                                other
                            ),
                        });
                    }
                }
            }
            "--json" => parsed.json = true,
            "--list-sizes" => parsed.list_sizes = true,
            "--help" | "-h" => parsed.help = true,
            _ => {
                return Err(ConfigError::InvalidArgument {
                    argument: arg,
                    message: "unknown argument, see --help".to_string(),
                });
            }
        }
    }

    Ok(parsed)
}

fn require_value(flag: &str, value: Option<String>) -> Result<String, ConfigError> {
    value.ok_or_else(|| ConfigError::InvalidArgument {
        argument: flag.to_string(),
        message: "missing value".to_string(),
    })
}

fn parse_number(flag: &str, value: Option<String>) -> Result<u32, ConfigError> {
    let value = require_value(flag, value)?;
    match value.parse::<u32>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::InvalidArgument {
            argument: flag.to_string(),
            message: format!("expected a positive integer, got '{}'", value),
        }),
    }
}

fn list_sizes() {
    println!("Supported matrix sizes:");
    for size in SUPPORTED_SIZES {
        println!("  {size} x {size}");
    }
}

fn print_usage() {
    println!("Usage:");
    println!("  cargo run --bin gemm_bench --release                          # Benchmark both backends");
    println!("  cargo run --bin gemm_bench --release -- --backend native      # Native wgpu kernel only");
    println!("  cargo run --bin gemm_bench --release -- --backend external    # External runtime only");
    println!("  cargo run --bin gemm_bench --release -- --size 2048 --runs 10");
    println!("  cargo run --bin gemm_bench --release -- --config <path>       # Default: {DEFAULT_CONFIG_PATH}");
    println!("  cargo run --bin gemm_bench --release -- --json                # Machine-readable report");
    println!("  cargo run --bin gemm_bench --release -- --list-sizes");
}
