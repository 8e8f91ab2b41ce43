//! Fleet-wide fan-out over the per-device load generators.
//!
//! The fleet owns every generator; nothing else holds one. A failure on one
//! device is logged and never aborts the fan-out to the remaining devices.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::WorkloadConfig;
use crate::workload::backend::{self, ComputeBackend};
use crate::workload::generator::{GeneratorStatus, LoadGenerator};
use crate::DeviceId;

pub struct DeviceFleet {
    generators: BTreeMap<DeviceId, Arc<LoadGenerator>>,
}

impl DeviceFleet {
    /// Builds one generator per device with the default backend selection
    /// (CUDA when reachable, CPU otherwise).
    pub fn new(devices: &[DeviceId], config: Arc<WorkloadConfig>, shutdown: CancellationToken) -> Self {
        Self::with_backends(devices, config, shutdown, backend::select_backend)
    }

    /// Like `new` but with an explicit backend selector, so callers and tests
    /// can inject their own compute implementation.
    pub fn with_backends(
        devices: &[DeviceId],
        config: Arc<WorkloadConfig>,
        shutdown: CancellationToken,
        select: impl Fn(DeviceId, usize) -> Arc<dyn ComputeBackend>,
    ) -> Self {
        let generators = devices
            .iter()
            .map(|&device| {
                let backend = select(device, config.unit_size);
                let generator = Arc::new(LoadGenerator::new(
                    device,
                    config.clone(),
                    backend,
                    shutdown.child_token(),
                ));
                (device, generator)
            })
            .collect();
        tracing::info!(?devices, "device fleet initialized");
        Self { generators }
    }

    /// Brings every generator to `intensity`. Idempotent: a generator that is
    /// already running is adjusted in place, not restarted.
    pub async fn start_all(&self, intensity: f64) {
        for (&device, generator) in &self.generators {
            if let Err(e) = generator.adjust(intensity).await {
                tracing::error!(device, "failed to start load generator: {e}");
            }
        }
    }

    pub async fn stop_all(&self) {
        for generator in self.generators.values() {
            generator.stop().await;
        }
    }

    /// Applies per-device intensities; unknown devices are logged and
    /// skipped.
    pub async fn adjust_all(&self, intensities: &BTreeMap<DeviceId, f64>) {
        for (&device, &intensity) in intensities {
            match self.generators.get(&device) {
                Some(generator) => {
                    if let Err(e) = generator.adjust(intensity).await {
                        tracing::error!(device, "failed to adjust load generator: {e}");
                    }
                }
                None => tracing::warn!(device, "no load generator for device"),
            }
        }
    }

    pub fn status_all(&self) -> BTreeMap<DeviceId, GeneratorStatus> {
        self.generators
            .iter()
            .map(|(&device, generator)| (device, generator.status()))
            .collect()
    }

    /// Stops all generators, giving each its full join timeout.
    pub async fn cleanup(&self) {
        tracing::info!("cleaning up device fleet");
        for generator in self.generators.values() {
            generator.cleanup().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::workload::backend::mock::MockBackend;
    use crate::workload::generator::GeneratorState;

    fn test_config() -> Arc<WorkloadConfig> {
        Arc::new(WorkloadConfig {
            unit_size: 8,
            batch_size: 2,
            ..WorkloadConfig::default()
        })
    }

    fn fleet_with_failing_device(failing: DeviceId) -> DeviceFleet {
        DeviceFleet::with_backends(
            &[0, 1],
            test_config(),
            CancellationToken::new(),
            |device, _dim| {
                if device == failing {
                    Arc::new(MockBackend::failing(device))
                } else {
                    Arc::new(MockBackend::new(device, Duration::from_millis(1)))
                }
            },
        )
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 5s");
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn start_all_then_stop_all() {
        let fleet = DeviceFleet::with_backends(
            &[0, 1, 2],
            test_config(),
            CancellationToken::new(),
            |device, _dim| Arc::new(MockBackend::new(device, Duration::from_millis(1))),
        );

        fleet.start_all(0.6).await;
        for (device, status) in fleet.status_all() {
            assert_eq!(
                status.state,
                GeneratorState::Running { intensity: 0.6 },
                "device {device}"
            );
        }

        fleet.stop_all().await;
        for (device, status) in fleet.status_all() {
            assert_eq!(status.state, GeneratorState::Idle, "device {device}");
        }
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn one_failed_device_does_not_block_the_rest() {
        let fleet = fleet_with_failing_device(0);

        // First fan-out starts both; device 0 then fails its work units.
        fleet.start_all(1.0).await;
        wait_for(|| fleet.status_all()[&0].state == GeneratorState::Failed).await;

        // Second fan-out hits the failed device first (BTreeMap order) and
        // must still drive device 1.
        fleet.start_all(0.8).await;
        let status = fleet.status_all();
        assert_eq!(status[&0].state, GeneratorState::Failed);
        assert_eq!(status[&1].state, GeneratorState::Running { intensity: 0.8 });

        fleet.cleanup().await;
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn adjust_all_applies_per_device_intensities() {
        let fleet = DeviceFleet::with_backends(
            &[0, 1],
            test_config(),
            CancellationToken::new(),
            |device, _dim| Arc::new(MockBackend::new(device, Duration::from_millis(1))),
        );

        fleet.start_all(0.5).await;

        let mut intensities = BTreeMap::new();
        intensities.insert(0, 0.2);
        intensities.insert(1, 0.9);
        intensities.insert(7, 0.4); // unknown device, logged and skipped
        fleet.adjust_all(&intensities).await;

        let status = fleet.status_all();
        assert_eq!(status[&0].state, GeneratorState::Running { intensity: 0.2 });
        assert_eq!(status[&1].state, GeneratorState::Running { intensity: 0.9 });

        fleet.cleanup().await;
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn cleanup_leaves_every_generator_idle() {
        let fleet = DeviceFleet::with_backends(
            &[0, 1],
            test_config(),
            CancellationToken::new(),
            |device, _dim| Arc::new(MockBackend::new(device, Duration::from_millis(1))),
        );

        fleet.start_all(0.7).await;
        fleet.cleanup().await;

        for (device, status) in fleet.status_all() {
            assert_eq!(status.state, GeneratorState::Idle, "device {device}");
            assert!(!status.task_alive, "device {device} loop still alive");
        }
    }
}
