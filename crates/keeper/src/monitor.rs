//! Utilization sampling over NVML.
//!
//! Every query returns an `Option` instead of propagating driver errors into
//! the controller: a device that cannot be read this poll is simply excluded
//! from the average.

use nvml_wrapper::enum_wrappers::device::TemperatureSensor;
use nvml_wrapper::Nvml;

use crate::DeviceId;

const MB: f64 = 1024.0 * 1024.0;

/// Snapshot of one device, for the startup banner and diagnostics.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub memory_total_mb: f64,
    pub memory_used_mb: f64,
    pub utilization: f64,
    pub temperature_c: u32,
}

/// Read-side abstraction over the device query library.
pub trait UtilizationSource: Send + Sync {
    fn device_count(&self) -> u32;

    fn is_available(&self, device: DeviceId) -> bool;

    /// Current compute utilization in percent, `None` if the read failed.
    fn sample(&self, device: DeviceId) -> Option<f64>;

    fn device_info(&self, device: DeviceId) -> Option<DeviceInfo>;

    /// Mean over the devices that answered this poll; `None` when none did.
    fn average_utilization(&self, devices: &[DeviceId]) -> Option<f64> {
        let samples: Vec<f64> = devices.iter().filter_map(|&d| self.sample(d)).collect();
        if samples.is_empty() {
            return None;
        }
        Some(samples.iter().sum::<f64>() / samples.len() as f64)
    }
}

pub struct NvmlSource {
    nvml: Nvml,
}

impl NvmlSource {
    pub fn new() -> Result<Self, nvml_wrapper::error::NvmlError> {
        let nvml = match Nvml::init() {
            Ok(nvml) => {
                tracing::info!("NVML initialized successfully");
                nvml
            }
            Err(_) => {
                tracing::warn!("Standard NVML init failed, trying with explicit library path");
                let nvml = Nvml::builder()
                    .lib_path(std::ffi::OsStr::new("libnvidia-ml.so.1"))
                    .init()?;
                tracing::info!("NVML initialized with explicit library path");
                nvml
            }
        };
        Ok(Self { nvml })
    }
}

impl UtilizationSource for NvmlSource {
    fn device_count(&self) -> u32 {
        match self.nvml.device_count() {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!("failed to query device count: {e}");
                0
            }
        }
    }

    fn is_available(&self, device: DeviceId) -> bool {
        device < self.device_count() && self.nvml.device_by_index(device).is_ok()
    }

    fn sample(&self, device: DeviceId) -> Option<f64> {
        let utilization = self
            .nvml
            .device_by_index(device)
            .and_then(|d| d.utilization_rates());
        match utilization {
            Ok(rates) => Some(rates.gpu as f64),
            Err(e) => {
                tracing::debug!(device, "utilization read failed: {e}");
                None
            }
        }
    }

    fn device_info(&self, device: DeviceId) -> Option<DeviceInfo> {
        let query = || -> Result<DeviceInfo, nvml_wrapper::error::NvmlError> {
            let d = self.nvml.device_by_index(device)?;
            let memory = d.memory_info()?;
            Ok(DeviceInfo {
                name: d.name()?,
                memory_total_mb: memory.total as f64 / MB,
                memory_used_mb: memory.used as f64 / MB,
                utilization: d.utilization_rates()?.gpu as f64,
                temperature_c: d.temperature(TemperatureSensor::Gpu)?,
            })
        };
        match query() {
            Ok(info) => Some(info),
            Err(e) => {
                tracing::debug!(device, "device info read failed: {e}");
                None
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    use super::{DeviceInfo, UtilizationSource};
    use crate::DeviceId;

    /// Scriptable source: per-device samples can be rewritten mid-test.
    pub(crate) struct MockSource {
        available: HashSet<DeviceId>,
        samples: Mutex<HashMap<DeviceId, Option<f64>>>,
    }

    impl MockSource {
        pub(crate) fn new(available: &[DeviceId]) -> Self {
            Self {
                available: available.iter().copied().collect(),
                samples: Mutex::new(HashMap::new()),
            }
        }

        pub(crate) fn set_sample(&self, device: DeviceId, sample: Option<f64>) {
            self.samples.lock().unwrap().insert(device, sample);
        }
    }

    impl UtilizationSource for MockSource {
        fn device_count(&self) -> u32 {
            self.available.iter().max().map_or(0, |max| max + 1)
        }

        fn is_available(&self, device: DeviceId) -> bool {
            self.available.contains(&device)
        }

        fn sample(&self, device: DeviceId) -> Option<f64> {
            if !self.available.contains(&device) {
                return None;
            }
            self.samples.lock().unwrap().get(&device).copied().flatten()
        }

        fn device_info(&self, device: DeviceId) -> Option<DeviceInfo> {
            if !self.available.contains(&device) {
                return None;
            }
            Some(DeviceInfo {
                name: format!("Mock GPU {device}"),
                memory_total_mb: 16384.0,
                memory_used_mb: 1024.0,
                utilization: self.sample(device).unwrap_or(0.0),
                temperature_c: 40,
            })
        }
    }

    #[test]
    fn average_skips_failed_samples() {
        let source = MockSource::new(&[0, 1, 2]);
        source.set_sample(0, Some(10.0));
        source.set_sample(1, None);
        source.set_sample(2, Some(30.0));

        assert_eq!(source.average_utilization(&[0, 1, 2]), Some(20.0));
    }

    #[test]
    fn average_is_none_when_no_device_answers() {
        let source = MockSource::new(&[0, 1]);
        assert_eq!(source.average_utilization(&[0, 1]), None);
    }
}
