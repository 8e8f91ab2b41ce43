//! Pure mapping from a utilization reading to a synthetic-load intensity.

/// Assumed maximum utilization percentage a fully loaded synthetic workload
/// can add on top of existing load. Heuristic tuning knob, overridable via
/// `workload.max_utilization_contribution`.
pub const DEFAULT_MAX_UTILIZATION_CONTRIBUTION: f64 = 50.0;

#[derive(Debug, Clone, Copy)]
pub struct IntensityPolicy {
    /// Utilization percentage the fleet should stay above.
    pub threshold: f64,
    /// Floor for any nonzero correction.
    pub base_intensity: f64,
    /// Hard cap on commanded intensity.
    pub max_intensity: f64,
    pub max_utilization_contribution: f64,
}

impl IntensityPolicy {
    /// Maps the current utilization to the intensity the fleet should run at.
    ///
    /// At or above the threshold no load is needed. Below it, the gap is
    /// mapped linearly through `max_utilization_contribution`, clamped to
    /// `[0, max_intensity]`, and any strictly positive result below
    /// `base_intensity` is raised to it so a correction is never
    /// imperceptibly small. Deterministic, no hidden state.
    pub fn required_intensity(&self, current_utilization: f64) -> f64 {
        if current_utilization >= self.threshold {
            return 0.0;
        }

        let gap = self.threshold - current_utilization;
        let raw = gap / self.max_utilization_contribution * self.max_intensity;
        let clamped = raw.clamp(0.0, self.max_intensity);

        if clamped > 0.0 && clamped < self.base_intensity {
            self.base_intensity
        } else {
            clamped
        }
    }
}
