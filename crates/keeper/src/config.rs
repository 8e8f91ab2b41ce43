use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::policy::{IntensityPolicy, DEFAULT_MAX_UTILIZATION_CONTRIBUTION};
use crate::DeviceId;

#[derive(Parser)]
#[command(name = "gpu-keeper", about, version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the utilization keeper daemon
    Run(RunArgs),
    /// Print the effective configuration as YAML and exit
    #[command(name = "show-config")]
    ShowConfig(RunArgs),
    /// Probe NVML and print per-device information
    #[command(name = "test-devices")]
    TestDevices,
}

#[derive(Parser)]
pub struct RunArgs {
    #[arg(
        short = 'c',
        long,
        env = "GPU_KEEPER_CONFIG",
        value_hint = clap::ValueHint::FilePath,
        default_value = "config.yaml",
        help = "Path to the YAML config file; a default one is written if missing"
    )]
    pub config: PathBuf,
}

/// Daemon configuration. Immutable after startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeeperConfig {
    /// Device indices to keep loaded. Filtered by availability at init.
    pub target_devices: Vec<DeviceId>,
    /// Utilization percentage the fleet average should stay above.
    pub utilization_threshold: f64,
    /// Seconds between controller poll iterations.
    pub check_interval_secs: f64,
    pub workload: WorkloadConfig,
    pub logging: LoggingConfig,
}

impl Default for KeeperConfig {
    fn default() -> Self {
        Self {
            target_devices: vec![0],
            utilization_threshold: 30.0,
            check_interval_secs: 5.0,
            workload: WorkloadConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    /// Floor for any nonzero commanded intensity.
    pub base_intensity: f64,
    /// Hard cap on commanded intensity.
    pub max_intensity: f64,
    /// Matrix dimension of one work unit.
    pub unit_size: usize,
    /// Work units per loop iteration at full intensity.
    pub batch_size: usize,
    /// Assumed utilization percentage a fully loaded workload contributes.
    pub max_utilization_contribution: f64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            base_intensity: 0.5,
            max_intensity: 0.9,
            unit_size: 2048,
            batch_size: 10,
            max_utilization_contribution: DEFAULT_MAX_UTILIZATION_CONTRIBUTION,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Optional log file; rotated daily when set.
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl KeeperConfig {
    /// Loads and validates the config file, or writes the defaults to `path`
    /// and uses them when no file exists yet.
    ///
    /// Deliberately silent: it runs before the tracing subscriber is
    /// installed, so the caller reports the config source once logging is up.
    pub async fn load_or_init(path: &Path) -> Result<Self, ConfigError> {
        let config = if path.exists() {
            let yaml = tokio::fs::read_to_string(path)
                .await
                .map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
            serde_yaml::from_str(&yaml).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?
        } else {
            let config = Self::default();
            let yaml = serde_yaml::to_string(&config).expect("default config serializes");
            tokio::fs::write(path, yaml)
                .await
                .map_err(|source| ConfigError::Write {
                    path: path.to_path_buf(),
                    source,
                })?;
            config
        };

        config.validate()?;
        Ok(config)
    }

    /// Checks every field, collecting one message per violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut violations = Vec::new();

        if self.target_devices.is_empty() {
            violations.push("target_devices must not be empty".to_string());
        }
        if !(0.0..=100.0).contains(&self.utilization_threshold) {
            violations.push(format!(
                "utilization_threshold must be within [0, 100], got {}",
                self.utilization_threshold
            ));
        }
        if !self.check_interval_secs.is_finite() || self.check_interval_secs <= 0.0 {
            violations.push(format!(
                "check_interval_secs must be positive and finite, got {}",
                self.check_interval_secs
            ));
        }

        let w = &self.workload;
        if !(0.0..=1.0).contains(&w.base_intensity) {
            violations.push(format!(
                "workload.base_intensity must be within [0, 1], got {}",
                w.base_intensity
            ));
        }
        if !(0.0..=1.0).contains(&w.max_intensity) {
            violations.push(format!(
                "workload.max_intensity must be within [0, 1], got {}",
                w.max_intensity
            ));
        }
        if w.base_intensity > w.max_intensity {
            violations.push(format!(
                "workload.base_intensity ({}) must not exceed workload.max_intensity ({})",
                w.base_intensity, w.max_intensity
            ));
        }
        if w.unit_size == 0 {
            violations.push("workload.unit_size must be at least 1".to_string());
        }
        if w.batch_size == 0 {
            violations.push("workload.batch_size must be at least 1".to_string());
        }
        if !w.max_utilization_contribution.is_finite() || w.max_utilization_contribution <= 0.0 {
            violations.push(format!(
                "workload.max_utilization_contribution must be positive and finite, got {}",
                w.max_utilization_contribution
            ));
        }

        if !LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            violations.push(format!(
                "logging.level must be one of {LOG_LEVELS:?}, got {:?}",
                self.logging.level
            ));
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(violations))
        }
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs_f64(self.check_interval_secs)
    }

    pub fn intensity_policy(&self) -> IntensityPolicy {
        IntensityPolicy {
            threshold: self.utilization_threshold,
            base_intensity: self.workload.base_intensity,
            max_intensity: self.workload.max_intensity,
            max_utilization_contribution: self.workload.max_utilization_contribution,
        }
    }
}
