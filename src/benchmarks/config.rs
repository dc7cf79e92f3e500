//! Benchmark configuration and its JSON loader.

use crate::artifacts::ArtifactSource;
use crate::errors::{ConfigError, ConfigResult, HarnessResult};
use crate::gpu::NativeConfig;
use crate::gpu::provisioner::DevicePreference;
use crate::gpu::shaders::{MAX_TILE_SIZE, TileSize};
use crate::runtime::{ExecutionBackend, ExternalConfig, RuntimeSpec};
use crate::workload::WorkloadDescriptor;
use log::warn;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;

pub const DEFAULT_CONFIG_PATH: &str = "configs/gemm_bench.json";

/// Matrix sizes offered by `--list-sizes`. Any other positive size is accepted.
pub const SUPPORTED_SIZES: [u32; 3] = [1024, 2048, 4096];

/// Settings for one benchmark invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    /// Square dimension used for `M`, `N` and `K`.
    pub matrix_size: u32,
    pub runs: u32,
    pub tile_size: u32,
    pub power_preference: DevicePreference,
    pub kernel: ArtifactSource,
    pub model: ArtifactSource,
    pub runtime: RuntimeSpec,
    pub execution_backend: ExecutionBackend,
    pub allow_backend_fallback: bool,
    pub seed: u64,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            matrix_size: SUPPORTED_SIZES[0],
            runs: 5,
            tile_size: TileSize::DEFAULT.get(),
            power_preference: DevicePreference::HighPerformance,
            kernel: ArtifactSource::Embedded,
            model: ArtifactSource::Embedded,
            runtime: RuntimeSpec::Reference,
            execution_backend: ExecutionBackend::Gpu,
            allow_backend_fallback: false,
            seed: 42,
        }
    }
}

impl BenchConfig {
    /// Validates the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.matrix_size == 0 {
            return Err(ConfigError::Validation {
                field: "matrix_size".to_string(),
                message: "Matrix size must be greater than 0".to_string(),
            });
        }

        if self.runs == 0 {
            return Err(ConfigError::Validation {
                field: "runs".to_string(),
                message: "Number of runs must be greater than 0".to_string(),
            });
        }

        if TileSize::new(self.tile_size).is_none() {
            return Err(ConfigError::Validation {
                field: "tile_size".to_string(),
                message: format!("Tile size must be between 1 and {}", MAX_TILE_SIZE),
            });
        }

        Ok(())
    }

    pub fn workload(&self) -> HarnessResult<WorkloadDescriptor> {
        WorkloadDescriptor::square(self.matrix_size, self.runs)
    }

    pub fn tile(&self) -> TileSize {
        TileSize::new(self.tile_size).unwrap_or_default()
    }

    pub fn native_config(&self) -> NativeConfig {
        NativeConfig {
            preference: self.power_preference,
            tile: self.tile(),
            kernel: self.kernel.clone(),
            seed: self.seed,
        }
    }

    pub fn external_config(&self) -> ExternalConfig {
        ExternalConfig {
            model: self.model.clone(),
            preference: self.execution_backend,
            allow_backend_fallback: self.allow_backend_fallback,
            seed: self.seed,
        }
    }
}

/// Configuration loader that handles JSON files with fallbacks
pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads `path`, falling back to defaults when the file does not exist.
    pub fn load_config(path: &str) -> ConfigResult<BenchConfig> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(
                    "Config file '{}' not found, using default configuration",
                    path
                );
                return Ok(BenchConfig::default());
            }
            Err(e) => {
                return Err(ConfigError::Io {
                    path: path.to_string(),
                    source: e,
                });
            }
        };

        serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_string(),
            source: e,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BenchConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.matrix_size, 1024);
        assert_eq!(config.runs, 5);
        assert_eq!(config.tile(), TileSize::DEFAULT);
        assert!(!config.allow_backend_fallback);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: BenchConfig =
            serde_json::from_str(r#"{"matrix_size": 2048, "execution_backend": "cpu"}"#).unwrap();
        assert_eq!(config.matrix_size, 2048);
        assert_eq!(config.execution_backend, ExecutionBackend::Cpu);
        assert_eq!(config.runs, 5);
        assert_eq!(config.power_preference, DevicePreference::HighPerformance);
    }

    #[test]
    fn test_validation_rejects_zero_runs() {
        let config = BenchConfig {
            runs: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Validation { field, .. }) if field == "runs"
        ));
    }

    #[test]
    fn test_validation_rejects_oversized_tile() {
        let config = BenchConfig {
            tile_size: 32,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = ConfigLoader::load_config("does/not/exist.json").unwrap();
        assert_eq!(config, BenchConfig::default());
    }

    #[test]
    fn test_derived_configs_share_seed() {
        let config = BenchConfig {
            seed: 9,
            tile_size: 8,
            ..Default::default()
        };
        assert_eq!(config.native_config().seed, 9);
        assert_eq!(config.native_config().tile.get(), 8);
        assert_eq!(config.external_config().seed, 9);
        assert_eq!(config.workload().unwrap().m(), 1024);
    }
}
