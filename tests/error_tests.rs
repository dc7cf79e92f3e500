//! Tests for error types in the benchmark harness.
//!
//! This module checks that each failure surfaces as the expected variant and
//! that the rendered messages carry the details shown in the report.

use gemm_bench::artifacts::{ArtifactSource, load_kernel_source};
use gemm_bench::benchmarks::ConfigLoader;
use gemm_bench::errors::{ConfigError, HarnessError};
use gemm_bench::gpu::TileSize;
use gemm_bench::workload::WorkloadDescriptor;
use std::fs;
use std::path::PathBuf;

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("gemm_bench_{}_{}", std::process::id(), name))
}

#[cfg(test)]
mod workload_error_tests {
    use super::*;

    #[test]
    fn test_zero_dimension_is_rejected() {
        let result = WorkloadDescriptor::new(1024, 0, 1024, 5);
        assert!(matches!(
            result,
            Err(HarnessError::InvalidWorkload { field: "N", value: 0 })
        ));
    }

    #[test]
    fn test_zero_runs_is_rejected() {
        let err = WorkloadDescriptor::square(1024, 0).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid workload: runs must be greater than 0 (got 0)"
        );
    }
}

#[cfg(test)]
mod harness_error_tests {
    use super::*;

    #[test]
    fn test_limit_exceeded_message() {
        let err = HarnessError::LimitExceeded {
            limit: "max_storage_buffer_binding_size",
            required: 67_108_864,
            available: 33_554_432,
        };
        assert_eq!(
            err.to_string(),
            "Required max_storage_buffer_binding_size of 67108864 bytes exceeds the device maximum of 33554432 bytes"
        );
    }

    #[test]
    fn test_model_fetch_error_carries_status() {
        let err = HarnessError::ModelFetchError {
            location: "http://localhost/gemm.onnx".to_string(),
            status: 404,
        };
        assert!(err.to_string().ends_with("status 404"));
    }

    #[test]
    fn test_dispatch_and_panic_messages() {
        let err = HarnessError::dispatch("device lost: driver reset");
        assert_eq!(err.to_string(), "GPU dispatch failed: device lost: driver reset");

        let err = HarnessError::BackendPanicked {
            message: "index out of bounds".to_string(),
        };
        assert_eq!(err.to_string(), "Backend panicked: index out of bounds");
    }

    #[test]
    fn test_missing_kernel_file_is_artifact_error() {
        let source = ArtifactSource::File {
            path: PathBuf::from("/nonexistent/gemm.wgsl"),
        };
        let result = load_kernel_source(&source, TileSize::DEFAULT);
        assert!(matches!(result, Err(HarnessError::ArtifactError { .. })));
    }

    #[test]
    fn test_kernel_file_without_placeholder_is_flagged() {
        let path = temp_path("plain.wgsl");
        fs::write(&path, "@compute @workgroup_size(16, 16) fn main() {}").unwrap();

        let kernel = load_kernel_source(&ArtifactSource::File { path: path.clone() }, TileSize::DEFAULT)
            .unwrap();
        assert!(!kernel.tile_injected);
        fs::remove_file(path).unwrap();
    }
}

#[cfg(test)]
mod config_error_tests {
    use super::*;

    #[test]
    fn test_malformed_config_is_parse_error() {
        let path = temp_path("broken.json");
        fs::write(&path, "{ \"matrix_size\": ").unwrap();

        let result = ConfigLoader::load_config(path.to_str().unwrap());
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_wrong_field_type_is_parse_error() {
        let path = temp_path("typed.json");
        fs::write(&path, r#"{"runs": "five"}"#).unwrap();

        let err = ConfigLoader::load_config(path.to_str().unwrap()).unwrap_err();
        assert!(err.to_string().starts_with("Failed to parse configuration file"));
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_config_file_overrides_defaults() {
        let path = temp_path("custom.json");
        fs::write(
            &path,
            r#"{"matrix_size": 2048, "runs": 10, "runtime": {"kind": "plugin", "path": "libgemmrt.so"}}"#,
        )
        .unwrap();

        let config = ConfigLoader::load_config(path.to_str().unwrap()).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.matrix_size, 2048);
        assert_eq!(config.runs, 10);
        assert_eq!(config.tile_size, 16);
        fs::remove_file(path).unwrap();
    }
}
