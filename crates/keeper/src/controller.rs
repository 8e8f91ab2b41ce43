//! The closed-loop controller: sample utilization, decide an intensity,
//! drive the fleet, sleep, repeat until shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::KeeperConfig;
use crate::error::KeeperError;
use crate::monitor::UtilizationSource;
use crate::policy::IntensityPolicy;
use crate::workload::DeviceFleet;
use crate::DeviceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Stopped,
    Initializing,
    Polling,
    Draining,
}

pub struct Controller {
    source: Arc<dyn UtilizationSource>,
    fleet: DeviceFleet,
    policy: IntensityPolicy,
    devices: Vec<DeviceId>,
    check_interval: Duration,
    state: ControllerState,
}

impl Controller {
    /// Resolves the target device set and builds the fleet. Fails when none
    /// of the configured devices is available; that is the only fatal init
    /// condition.
    pub fn new(
        config: &KeeperConfig,
        source: Arc<dyn UtilizationSource>,
        shutdown: CancellationToken,
    ) -> Result<Self, KeeperError> {
        tracing::info!(from = ?ControllerState::Stopped, to = ?ControllerState::Initializing, "controller state");

        let devices = resolve_devices(&config.target_devices, source.as_ref())?;
        let fleet = DeviceFleet::new(&devices, Arc::new(config.workload.clone()), shutdown);

        Ok(Self {
            source,
            fleet,
            policy: config.intensity_policy(),
            devices,
            check_interval: config.check_interval(),
            state: ControllerState::Initializing,
        })
    }

    #[cfg(test)]
    pub(crate) fn from_parts(
        source: Arc<dyn UtilizationSource>,
        fleet: DeviceFleet,
        policy: IntensityPolicy,
        devices: Vec<DeviceId>,
        check_interval: Duration,
    ) -> Self {
        Self {
            source,
            fleet,
            policy,
            devices,
            check_interval,
            state: ControllerState::Initializing,
        }
    }

    /// Runs the polling loop until `token` is cancelled, then drains the
    /// fleet. Single failed samples or generators never abort the loop.
    pub async fn run(&mut self, token: CancellationToken) {
        self.transition(ControllerState::Polling);

        loop {
            if token.is_cancelled() {
                break;
            }
            self.poll_once().await;
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.check_interval) => {}
            }
        }

        self.transition(ControllerState::Draining);
        self.fleet.cleanup().await;
        self.transition(ControllerState::Stopped);
    }

    /// One poll iteration: the utilization snapshot is taken in full before
    /// any fleet command is issued.
    async fn poll_once(&self) {
        let Some(average) = self.source.average_utilization(&self.devices) else {
            tracing::warn!("no device reported utilization this poll; leaving fleet unchanged");
            return;
        };

        let intensity = self.policy.required_intensity(average);
        tracing::info!(
            average_utilization = format_args!("{average:.1}"),
            threshold = self.policy.threshold,
            intensity = format_args!("{intensity:.2}"),
            "poll"
        );

        if intensity > 0.0 {
            self.fleet.start_all(intensity).await;
        } else {
            self.fleet.stop_all().await;
        }

        for (device, status) in self.fleet.status_all() {
            tracing::debug!(
                device,
                state = ?status.state,
                task_alive = status.task_alive,
                "generator status"
            );
        }
    }

    fn transition(&mut self, next: ControllerState) {
        tracing::info!(from = ?self.state, to = ?next, "controller state");
        self.state = next;
    }
}

/// Filters the configured device IDs through availability, logging each
/// skipped device and a startup banner for each admitted one.
fn resolve_devices(
    configured: &[DeviceId],
    source: &dyn UtilizationSource,
) -> Result<Vec<DeviceId>, KeeperError> {
    let mut devices = Vec::new();
    for &device in configured {
        if source.is_available(device) {
            devices.push(device);
        } else {
            tracing::warn!(device, "device unavailable, skipping");
        }
    }

    if devices.is_empty() {
        return Err(KeeperError::NoAvailableDevices(configured.to_vec()));
    }

    for &device in &devices {
        match source.device_info(device) {
            Some(info) => tracing::info!(
                device,
                name = %info.name,
                memory_total_mb = format_args!("{:.0}", info.memory_total_mb),
                memory_used_mb = format_args!("{:.0}", info.memory_used_mb),
                utilization = info.utilization,
                temperature_c = info.temperature_c,
                "target device"
            ),
            None => tracing::info!(device, "target device (no info available)"),
        }
    }

    Ok(devices)
}
