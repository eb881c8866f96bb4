use cell_common::{steps_to_cover, SimParams};
use serde::{Deserialize, Serialize};

/// Simulated time, counted in whole macro-steps from the last interval
/// boundary so repeated additions never drift.
///
/// Every interval boundary and the horizon are reached exactly: the
/// macro-step that would cross one is cut short. The macro-step and the
/// interval are fixed for the life of a run. The horizon only changes through
/// [`SimulationClock::extend_horizon`], which is reserved for resuming from a
/// checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimulationClock {
    step_index: u64,
    /// Time of the boundary the current segment started from.
    origin_sec: f64,
    steps_since_origin: u64,
    macro_step_sec: f64,
    interval_sec: f64,
    horizon_sec: f64,
}

impl SimulationClock {
    pub fn new(params: &SimParams) -> Self {
        SimulationClock {
            step_index: 0,
            origin_sec: 0.0,
            steps_since_origin: 0,
            macro_step_sec: params.macro_step_sec,
            interval_sec: params.interval_sec,
            horizon_sec: params.horizon_sec,
        }
    }

    /// Macro-steps completed so far.
    pub fn step_index(&self) -> u64 {
        self.step_index
    }

    pub fn macro_step_sec(&self) -> f64 {
        self.macro_step_sec
    }

    pub fn interval_sec(&self) -> f64 {
        self.interval_sec
    }

    pub fn horizon_sec(&self) -> f64 {
        self.horizon_sec
    }

    /// End of the current segment: the next interval boundary or the horizon.
    fn segment_end(&self) -> f64 {
        let next_boundary = ((self.origin_sec / self.interval_sec) * (1.0 + 1e-12)).floor() + 1.0;
        (next_boundary * self.interval_sec).min(self.horizon_sec)
    }

    fn segment_steps(&self) -> u64 {
        steps_to_cover(self.segment_end() - self.origin_sec, self.macro_step_sec)
    }

    pub fn time_sec(&self) -> f64 {
        if self.steps_since_origin >= self.segment_steps() {
            self.segment_end()
        } else {
            self.origin_sec + self.steps_since_origin as f64 * self.macro_step_sec
        }
    }

    pub fn time_min(&self) -> f64 {
        self.time_sec() / 60.0
    }

    /// Length of the next macro-step; shorter than the macro-step only when
    /// an interval boundary or the horizon cuts it.
    pub fn step_dt(&self) -> f64 {
        (self.segment_end() - self.time_sec()).min(self.macro_step_sec)
    }

    /// Macro-steps left before the next interval boundary or the horizon.
    pub fn steps_to_boundary(&self) -> u64 {
        self.segment_steps().saturating_sub(self.steps_since_origin)
    }

    pub fn at_horizon(&self) -> bool {
        self.segment_end() >= self.horizon_sec && self.steps_to_boundary() == 0
    }

    pub fn progress_percent(&self) -> f64 {
        if self.at_horizon() {
            return 100.0;
        }
        100.0 * self.time_sec() / self.horizon_sec
    }

    pub(crate) fn advance(&mut self) {
        self.step_index += 1;
        self.steps_since_origin += 1;
        if self.steps_to_boundary() == 0 && self.segment_end() < self.horizon_sec {
            self.origin_sec = self.segment_end();
            self.steps_since_origin = 0;
        }
    }

    /// Moves the horizon out. The current time becomes the new segment origin,
    /// so a truncated final step stays where it ended.
    pub(crate) fn extend_horizon(&mut self, horizon_sec: f64) {
        if horizon_sec > self.horizon_sec {
            self.origin_sec = self.time_sec();
            self.steps_since_origin = 0;
            self.horizon_sec = horizon_sec;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> SimParams {
        SimParams::new(1.0, 60.0, 120.0)
    }

    fn run_to_horizon(clock: &mut SimulationClock) -> Vec<f64> {
        let mut boundaries = Vec::new();
        while !clock.at_horizon() {
            for _ in 0..clock.steps_to_boundary() {
                clock.advance();
            }
            boundaries.push(clock.time_sec());
        }
        boundaries
    }

    #[test]
    fn time_is_exact_after_many_steps() {
        let mut clock = SimulationClock::new(&SimParams::new(0.25, 60.0, 120.0));
        for _ in 0..240 {
            clock.advance();
        }
        assert_eq!(clock.time_sec(), 60.0);
        assert_eq!(clock.step_dt(), 0.25);
    }

    #[test]
    fn final_step_is_truncated_at_the_horizon() {
        let params = SimParams::new(1.0, 60.0, 60.3);
        let mut clock = SimulationClock::new(&params);
        assert_eq!(run_to_horizon(&mut clock), vec![60.0, 60.3]);
        assert_eq!(clock.step_index(), params.horizon_steps);
        assert_eq!(clock.progress_percent(), 100.0);
    }

    #[test]
    fn steps_are_cut_at_interval_boundaries() {
        let params = SimParams::new(5.0, 7.5, 30.0);
        let mut clock = SimulationClock::new(&params);
        let mut dts = Vec::new();
        while !clock.at_horizon() {
            dts.push(clock.step_dt());
            clock.advance();
        }
        assert_eq!(dts, vec![5.0, 2.5, 5.0, 2.5, 5.0, 2.5, 5.0, 2.5]);
        assert_eq!(clock.time_sec(), 30.0);
        assert_eq!(clock.step_index(), params.horizon_steps);
    }

    #[test]
    fn extension_continues_from_a_truncated_horizon() {
        let mut clock = SimulationClock::new(&SimParams::new(1.0, 60.0, 60.3));
        run_to_horizon(&mut clock);
        clock.extend_horizon(120.0);
        assert!(!clock.at_horizon());
        assert_eq!(clock.time_sec(), 60.3);
        assert_eq!(run_to_horizon(&mut clock), vec![120.0]);
    }

    #[test]
    fn horizon_only_grows() {
        let mut clock = SimulationClock::new(&params());
        clock.extend_horizon(60.0);
        assert_eq!(clock.horizon_sec(), 120.0);
        clock.extend_horizon(240.0);
        assert_eq!(clock.horizon_sec(), 240.0);
        assert_eq!(clock.steps_to_boundary(), 60);
        assert_eq!(clock.progress_percent(), 0.0);
    }
}
