use serde::{Deserialize, Serialize};

/// Relative slack when deciding whether a span is a whole number of steps.
const STEP_TOLERANCE: f64 = 1e-9;

/// Runtime parameters derived from the configuration, fixed for the lifetime of a run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimParams {
    // Time
    pub macro_step_sec: f64,
    pub interval_sec: f64,
    pub horizon_sec: f64,

    // Step counts
    pub steps_per_interval: u64, // Macro-steps in a full interval, the last one possibly truncated
    pub horizon_steps: u64,      // Macro-steps until the run completes
}

impl SimParams {
    /// Builds the step counts for the given times. Every interval boundary and
    /// the horizon fall exactly on a macro-step boundary; the macro-step that
    /// would cross one is cut short.
    pub fn new(macro_step_sec: f64, interval_sec: f64, horizon_sec: f64) -> Self {
        let full_intervals = (horizon_sec / interval_sec * (1.0 + STEP_TOLERANCE)).floor();
        let tail_sec = horizon_sec - full_intervals * interval_sec;
        let steps_per_interval = steps_to_cover(interval_sec, macro_step_sec);
        let tail_steps = if tail_sec > horizon_sec * STEP_TOLERANCE { steps_to_cover(tail_sec, macro_step_sec) } else { 0 };
        SimParams {
            macro_step_sec,
            interval_sec,
            horizon_sec,
            steps_per_interval,
            horizon_steps: full_intervals as u64 * steps_per_interval + tail_steps,
        }
    }

    /// Total number of checkpoint intervals, counting a truncated final one.
    pub fn interval_count(&self) -> u64 {
        (self.horizon_sec / self.interval_sec * (1.0 - STEP_TOLERANCE)).ceil().max(1.0) as u64
    }
}

/// Macro-steps of `step_sec` needed to cover `span_sec`, the last one truncated.
pub fn steps_to_cover(span_sec: f64, step_sec: f64) -> u64 {
    if !(span_sec > 0.0) {
        return 0;
    }
    (span_sec / step_sec * (1.0 - STEP_TOLERANCE)).ceil().max(1.0) as u64
}
