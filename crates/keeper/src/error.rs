//! Error taxonomy: configuration and init errors are fatal, everything else
//! is isolated to the device it happened on.

use std::path::PathBuf;

use thiserror::Error;

use crate::DeviceId;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write default config file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid configuration:\n{}", format_violations(.0))]
    Invalid(Vec<String>),
}

fn format_violations(violations: &[String]) -> String {
    violations
        .iter()
        .map(|v| format!("  - {v}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Per-device workload errors. Recovered by the fleet, never fatal to the
/// process.
#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("device {0} marked failed after repeated work-unit errors")]
    DeviceFailed(DeviceId),

    #[error("CUDA driver error on device {device}: {source}")]
    Driver {
        device: DeviceId,
        #[source]
        source: cudarc::driver::DriverError,
    },

    #[error("cuBLAS error on device {device}: {source}")]
    Cublas {
        device: DeviceId,
        #[source]
        source: cudarc::cublas::result::CublasError,
    },

    #[error("work unit failed on device {device}: {reason}")]
    Unit { device: DeviceId, reason: String },
}

#[derive(Debug, Error)]
pub enum KeeperError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to initialize NVML: {0}")]
    Nvml(#[from] nvml_wrapper::error::NvmlError),

    #[error("none of the configured devices {0:?} are available")]
    NoAvailableDevices(Vec<DeviceId>),
}
