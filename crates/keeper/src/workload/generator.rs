//! Per-device load generator: a cancellable work loop at a settable
//! intensity.
//!
//! The slot mutex serializes start/stop/adjust, which is what guarantees at
//! most one active work loop per device. The loop itself only shares three
//! things with the outside: the intensity cell it re-reads every iteration,
//! the task-alive flag, and the failed flag it sets when it gives up.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::WorkloadConfig;
use crate::error::GeneratorError;
use crate::workload::backend::ComputeBackend;
use crate::DeviceId;

/// Bounded wait for a cancelled loop to exit. A loop stuck inside a device
/// kernel call cannot be force-killed safely, so a miss is logged, not fatal.
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause between batches at intensity 0; scaled by `1 - intensity`.
const BATCH_PAUSE: Duration = Duration::from_millis(100);

/// Consecutive work-unit failures before the loop gives up and the
/// generator is marked failed.
const MAX_CONSECUTIVE_UNIT_FAILURES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GeneratorState {
    Idle,
    Running { intensity: f64 },
    /// Work units kept failing; the loop exited and `start` is refused
    /// until `reset`.
    Failed,
    /// The loop missed its join timeout on stop.
    Stuck,
}

#[derive(Debug, Clone)]
pub struct GeneratorStatus {
    pub device: DeviceId,
    pub state: GeneratorState,
    pub task_alive: bool,
}

struct ActiveLoop {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct LoadGenerator {
    device: DeviceId,
    config: Arc<WorkloadConfig>,
    backend: Arc<dyn ComputeBackend>,
    shutdown: CancellationToken,
    join_timeout: Duration,
    /// f64 bits; written by the controller side, re-read by the loop every
    /// iteration.
    intensity: Arc<AtomicU64>,
    running: AtomicBool,
    stuck: AtomicBool,
    failed: Arc<AtomicBool>,
    task_alive: Arc<AtomicBool>,
    active: tokio::sync::Mutex<Option<ActiveLoop>>,
}

impl LoadGenerator {
    pub fn new(
        device: DeviceId,
        config: Arc<WorkloadConfig>,
        backend: Arc<dyn ComputeBackend>,
        shutdown: CancellationToken,
    ) -> Self {
        tracing::debug!(device, backend = backend.label(), "load generator created");
        Self {
            device,
            config,
            backend,
            shutdown,
            join_timeout: JOIN_TIMEOUT,
            intensity: Arc::new(AtomicU64::new(0.0f64.to_bits())),
            running: AtomicBool::new(false),
            stuck: AtomicBool::new(false),
            failed: Arc::new(AtomicBool::new(false)),
            task_alive: Arc::new(AtomicBool::new(false)),
            active: tokio::sync::Mutex::new(None),
        }
    }

    /// Shortens the bounded join so tests can hit the timeout path without
    /// waiting out the production value.
    #[cfg(test)]
    pub(crate) fn with_join_timeout(mut self, join_timeout: Duration) -> Self {
        self.join_timeout = join_timeout;
        self
    }

    /// Starts the work loop, stopping a previous one first. Returns once the
    /// loop task is spawned; it does not wait for the first work unit.
    pub async fn start(&self, intensity: f64) -> Result<(), GeneratorError> {
        let mut active = self.active.lock().await;

        if self.failed.load(Ordering::Acquire) {
            return Err(GeneratorError::DeviceFailed(self.device));
        }

        if let Some(previous) = active.take() {
            self.running.store(false, Ordering::Release);
            self.halt(previous).await;
        }

        let intensity = self.clamp_intensity(intensity);
        self.intensity.store(intensity.to_bits(), Ordering::Release);

        let token = self.shutdown.child_token();
        let handle = tokio::spawn(work_loop(
            self.device,
            self.config.clone(),
            self.backend.clone(),
            self.intensity.clone(),
            token.clone(),
            self.task_alive.clone(),
            self.failed.clone(),
        ));

        // A stuck marker describes the previous loop; the new one supersedes
        // it.
        self.stuck.store(false, Ordering::Release);
        self.running.store(true, Ordering::Release);
        *active = Some(ActiveLoop { token, handle });
        tracing::info!(device = self.device, intensity, "load generator started");
        Ok(())
    }

    /// Signals cancellation and waits up to the join timeout for the loop to
    /// exit. A timeout marks the generator stuck but is not escalated.
    pub async fn stop(&self) {
        let mut active = self.active.lock().await;
        let Some(previous) = active.take() else {
            return;
        };
        self.running.store(false, Ordering::Release);
        self.halt(previous).await;
        tracing::info!(device = self.device, "load generator stopped");
    }

    /// Updates the shared intensity of a running loop in place; takes effect
    /// within one work unit. Behaves as `start` when not running.
    pub async fn adjust(&self, intensity: f64) -> Result<(), GeneratorError> {
        {
            let active = self.active.lock().await;
            if active.is_some() && !self.failed.load(Ordering::Acquire) {
                let intensity = self.clamp_intensity(intensity);
                self.intensity.store(intensity.to_bits(), Ordering::Release);
                tracing::debug!(device = self.device, intensity, "intensity adjusted");
                return Ok(());
            }
        }
        self.start(intensity).await
    }

    /// Non-blocking snapshot; safe concurrently with start/stop/adjust.
    pub fn status(&self) -> GeneratorStatus {
        let state = if self.failed.load(Ordering::Acquire) {
            GeneratorState::Failed
        } else if self.stuck.load(Ordering::Acquire) {
            GeneratorState::Stuck
        } else if self.running.load(Ordering::Acquire) {
            GeneratorState::Running {
                intensity: f64::from_bits(self.intensity.load(Ordering::Acquire)),
            }
        } else {
            GeneratorState::Idle
        };
        GeneratorStatus {
            device: self.device,
            state,
            task_alive: self.task_alive.load(Ordering::Acquire),
        }
    }

    pub async fn cleanup(&self) {
        self.stop().await;
    }

    /// Clears a failed/stuck marker so the device can be retried.
    pub fn reset(&self) {
        self.failed.store(false, Ordering::Release);
        self.stuck.store(false, Ordering::Release);
    }

    async fn halt(&self, previous: ActiveLoop) {
        previous.token.cancel();
        match tokio::time::timeout(self.join_timeout, previous.handle).await {
            Ok(Ok(())) => {
                self.stuck.store(false, Ordering::Release);
            }
            Ok(Err(join_error)) => {
                tracing::warn!(device = self.device, "work loop panicked: {join_error}");
            }
            Err(_) => {
                self.stuck.store(true, Ordering::Release);
                tracing::warn!(
                    device = self.device,
                    timeout = ?self.join_timeout,
                    "work loop did not exit within the join timeout; marking stuck"
                );
            }
        }
    }

    fn clamp_intensity(&self, intensity: f64) -> f64 {
        if intensity.is_nan() {
            tracing::warn!(device = self.device, "intensity is NaN, treating as 0.0");
            return 0.0;
        }
        if !(0.0..=1.0).contains(&intensity) {
            let clamped = intensity.clamp(0.0, 1.0);
            tracing::warn!(
                device = self.device,
                intensity,
                clamped,
                "intensity outside [0.0, 1.0], clamping"
            );
            return clamped;
        }
        intensity
    }
}

async fn work_loop(
    device: DeviceId,
    config: Arc<WorkloadConfig>,
    backend: Arc<dyn ComputeBackend>,
    intensity: Arc<AtomicU64>,
    token: CancellationToken,
    task_alive: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
) {
    task_alive.store(true, Ordering::Release);
    let mut consecutive_failures = 0u32;

    loop {
        if token.is_cancelled() {
            break;
        }

        let intensity = f64::from_bits(intensity.load(Ordering::Acquire));
        let batch = ((config.batch_size as f64 * intensity).floor() as usize).max(1);

        let batch_result = {
            let backend = backend.clone();
            let token = token.clone();
            tokio::task::spawn_blocking(move || run_batch(&*backend, batch, &token)).await
        };

        match batch_result {
            Ok(Ok(())) => {
                consecutive_failures = 0;
            }
            Ok(Err(e)) => {
                consecutive_failures += 1;
                tracing::warn!(device, consecutive_failures, "work unit failed: {e}");
                if consecutive_failures >= MAX_CONSECUTIVE_UNIT_FAILURES {
                    tracing::error!(
                        device,
                        "giving up after {MAX_CONSECUTIVE_UNIT_FAILURES} consecutive work-unit failures"
                    );
                    failed.store(true, Ordering::Release);
                    break;
                }
            }
            Err(join_error) => {
                tracing::error!(device, "work batch panicked: {join_error}");
                failed.store(true, Ordering::Release);
                break;
            }
        }

        // Loop cadence is inversely proportional to intensity: full
        // intensity never sleeps, low intensity mostly sleeps.
        let pause = BATCH_PAUSE.mul_f64(1.0 - intensity);
        if !pause.is_zero() {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    task_alive.store(false, Ordering::Release);
    tracing::debug!(device, "work loop exited");
}

/// Runs up to `batch` units, checking cancellation before each one. Stops at
/// the first failed unit; the loop decides whether to continue or escalate.
fn run_batch(
    backend: &dyn ComputeBackend,
    batch: usize,
    token: &CancellationToken,
) -> Result<(), GeneratorError> {
    for _ in 0..batch {
        if token.is_cancelled() {
            return Ok(());
        }
        backend.run_unit()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::*;
    use crate::workload::backend::mock::MockBackend;

    fn test_config() -> Arc<WorkloadConfig> {
        Arc::new(WorkloadConfig {
            unit_size: 8,
            batch_size: 4,
            ..WorkloadConfig::default()
        })
    }

    fn generator_with(backend: Arc<MockBackend>) -> LoadGenerator {
        LoadGenerator::new(
            backend.device,
            test_config(),
            backend,
            CancellationToken::new(),
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
    async fn start_runs_and_stop_goes_idle() {
        let backend = Arc::new(MockBackend::new(0, Duration::from_millis(1)));
        let generator = generator_with(backend.clone());

        generator.start(0.7).await.unwrap();
        assert_eq!(
            generator.status().state,
            GeneratorState::Running { intensity: 0.7 }
        );

        wait_for(|| backend.units.load(Ordering::SeqCst) > 0).await;

        generator.stop().await;
        let status = generator.status();
        assert_eq!(status.state, GeneratorState::Idle);
        assert!(!status.task_alive, "loop must have exited after stop");
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn repeated_start_keeps_a_single_loop() {
        let backend = Arc::new(MockBackend::new(0, Duration::from_millis(2)));
        let generator = generator_with(backend.clone());

        for _ in 0..10 {
            generator.start(1.0).await.unwrap();
        }
        wait_for(|| backend.units.load(Ordering::SeqCst) > 20).await;
        generator.stop().await;

        assert_eq!(
            backend.max_in_flight(),
            1,
            "two work loops overlapped on the same device"
        );
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn start_then_immediate_stop_leaves_no_loop() {
        let backend = Arc::new(MockBackend::new(0, Duration::from_millis(1)));
        let generator = generator_with(backend.clone());

        for _ in 0..5 {
            generator.start(1.0).await.unwrap();
            generator.stop().await;
        }

        let status = generator.status();
        assert_eq!(status.state, GeneratorState::Idle);
        assert!(!status.task_alive);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn out_of_range_intensity_is_clamped() {
        let backend = Arc::new(MockBackend::new(0, Duration::from_millis(1)));
        let generator = generator_with(backend);

        generator.start(1.7).await.unwrap();
        assert_eq!(
            generator.status().state,
            GeneratorState::Running { intensity: 1.0 }
        );
        generator.stop().await;
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn adjust_updates_intensity_in_place() {
        let backend = Arc::new(MockBackend::new(0, Duration::from_millis(1)));
        let generator = generator_with(backend);

        generator.start(0.5).await.unwrap();
        generator.adjust(0.9).await.unwrap();
        assert_eq!(
            generator.status().state,
            GeneratorState::Running { intensity: 0.9 }
        );
        generator.stop().await;
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn adjust_while_idle_behaves_as_start() {
        let backend = Arc::new(MockBackend::new(0, Duration::from_millis(1)));
        let generator = generator_with(backend);

        generator.adjust(0.6).await.unwrap();
        assert_eq!(
            generator.status().state,
            GeneratorState::Running { intensity: 0.6 }
        );
        generator.stop().await;
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn repeated_unit_failures_mark_the_generator_failed() {
        let backend = Arc::new(MockBackend::failing(0));
        let generator = generator_with(backend);

        generator.start(1.0).await.unwrap();
        wait_for(|| generator.status().state == GeneratorState::Failed).await;

        let status = generator.status();
        assert!(!status.task_alive, "failed loop must exit, not spin");

        // A failed generator refuses to start until reset.
        assert!(matches!(
            generator.start(0.5).await,
            Err(GeneratorError::DeviceFailed(0))
        ));
        generator.reset();
        // The backend still fails, but start itself is accepted again.
        generator.start(0.5).await.unwrap();
        generator.stop().await;
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn stop_past_the_join_timeout_marks_the_generator_stuck() {
        // Each unit blocks well past the shortened join timeout, so the loop
        // cannot observe cancellation in time.
        let backend = Arc::new(MockBackend::new(0, Duration::from_millis(500)));
        let generator =
            generator_with(backend.clone()).with_join_timeout(Duration::from_millis(50));

        generator.start(1.0).await.unwrap();
        wait_for(|| backend.max_in_flight() >= 1).await;

        generator.stop().await;
        assert_eq!(generator.status().state, GeneratorState::Stuck);

        // The loop still honors its cancelled token once the unit returns.
        wait_for(|| !generator.status().task_alive).await;
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn start_after_a_stuck_stop_clears_the_marker() {
        let backend = Arc::new(MockBackend::new(0, Duration::from_millis(300)));
        let generator =
            generator_with(backend.clone()).with_join_timeout(Duration::from_millis(50));

        generator.start(1.0).await.unwrap();
        wait_for(|| backend.max_in_flight() >= 1).await;
        generator.stop().await;
        assert_eq!(generator.status().state, GeneratorState::Stuck);

        // Let the timed-out loop drain so only the new one is alive.
        wait_for(|| !generator.status().task_alive).await;

        generator.start(0.5).await.unwrap();
        assert_eq!(
            generator.status().state,
            GeneratorState::Running { intensity: 0.5 }
        );
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn stop_without_start_is_a_noop() {
        let backend = Arc::new(MockBackend::new(0, Duration::from_millis(1)));
        let generator = generator_with(backend);

        generator.stop().await;
        assert_eq!(generator.status().state, GeneratorState::Idle);
    }
}
