use cell_common::ConfigError;
use minimal_cell_engine::metabolism::{IntegrationFailure, IntegrationStats, OdeIntegrator, OdeSystem, RosenbrockIntegrator};
use minimal_cell_engine::{CellSimulation, ErrorKind, RunConfig, RunStatus, SimError};

fn config(horizon_min: f64, interval_min: f64, seed: u64) -> RunConfig {
    RunConfig::with_timing(horizon_min, interval_min, Some(seed))
}

fn config_error(config: RunConfig) -> ConfigError {
    match CellSimulation::initialize(config) {
        Err(SimError::Configuration(err)) => err,
        Err(other) => panic!("expected a configuration error, got {}", other),
        Ok(_) => panic!("expected a configuration error"),
    }
}

#[test]
fn two_minute_run_completes_with_growing_volume() {
    let mut sim = CellSimulation::initialize(config(2.0, 1.0, 42)).unwrap();
    let v0 = sim.geometry().volume_l;

    let reports = sim.run_to_end().unwrap();
    assert_eq!(reports.len(), 2);
    assert_eq!(sim.status(), RunStatus::Completed);
    assert_eq!(sim.time_min(), 2.0);
    assert_eq!(sim.progress_percent(), 100.0);

    let last = reports.last().unwrap();
    assert_eq!(last.status, RunStatus::Completed);
    assert_eq!(last.time_min, 2.0);
    assert_eq!(last.macro_steps, 120);
    assert!(reports[0].growth.volume_l >= v0);
    assert!(reports[1].growth.volume_l >= reports[0].growth.volume_l);
    assert!(last.discrete_events > 0);
    assert!(last.metabolites.contains_key("glucose"));
    assert!(last.fluxes.contains_key("glucose_uptake"));
    assert!(last.growth.energy_charge > 0.0 && last.growth.energy_charge <= 1.0);
}

#[test]
fn initial_report_describes_the_starting_state() {
    let mut sim = CellSimulation::initialize(config(2.0, 1.0, 42)).unwrap();
    let initial = sim.record_initial_report();
    assert_eq!(initial.time_min, 0.0);
    assert_eq!(initial.macro_steps, 0);
    assert_eq!(initial.status, RunStatus::Pending);
    assert_eq!(initial.discrete_events, 0);
    assert_eq!(initial.growth.volume_l, sim.initial_volume_l());
    assert!(initial.metabolites["ATP"] > 0.0);

    sim.run_to_end().unwrap();
    let times: Vec<f64> = sim.get_recorded_reports().iter().map(|r| r.time_min).collect();
    assert_eq!(times, vec![0.0, 1.0, 2.0]);
}

#[test]
fn clock_matches_interval_count() {
    let mut sim = CellSimulation::initialize(config(3.0, 0.5, 7)).unwrap();
    let mut times = Vec::new();
    while sim.status().is_active() {
        times.push(sim.step_interval().unwrap().time_min);
    }
    assert_eq!(times, vec![0.5, 1.0, 1.5, 2.0, 2.5, 3.0]);
}

#[test]
fn values_stay_finite_and_non_negative() {
    let mut sim = CellSimulation::initialize(config(2.0, 1.0, 9)).unwrap();
    sim.run_to_end().unwrap();
    for (species, value) in sim.network().species().iter().zip(sim.state().concentrations()) {
        assert!(value.is_finite() && *value >= 0.0, "{} = {}", species.name, value);
    }
    for report in sim.get_recorded_reports() {
        assert!(report.metabolites.values().all(|c| c.is_finite() && *c >= 0.0));
    }
}

#[test]
fn same_seed_gives_the_same_trajectory() {
    let mut a = CellSimulation::initialize(config(1.0, 1.0, 1234)).unwrap();
    let mut b = CellSimulation::initialize(config(1.0, 1.0, 1234)).unwrap();
    assert_eq!(a.step_interval().unwrap(), b.step_interval().unwrap());
}

#[test]
fn out_of_range_timing_is_rejected() {
    assert!(matches!(config_error(config(501.0, 1.0, 1)), ConfigError::HorizonOutOfRange { .. }));
    assert!(matches!(config_error(config(0.5, 1.0, 1)), ConfigError::HorizonOutOfRange { .. }));
    assert!(matches!(config_error(config(10.0, 0.05, 1)), ConfigError::IntervalOutOfRange { .. }));

    let mut frozen = config(10.0, 1.0, 1);
    frozen.timing.macro_step_sec = 0.0;
    assert_eq!(config_error(frozen), ConfigError::MacroStepOutOfRange(0.0));
}

#[test]
fn uneven_horizon_and_interval_truncate_the_last_step() {
    let mut sim = CellSimulation::initialize(config(1.005, 0.125, 17)).unwrap();
    let mut times = Vec::new();
    while sim.status().is_active() {
        let report = sim.step_interval().unwrap();
        assert!(report.growth.volume_l > 0.0);
        times.push(report.time_min);
    }
    assert_eq!(times.len(), 9);
    assert_eq!(times[..8], [0.125, 0.25, 0.375, 0.5, 0.625, 0.75, 0.875, 1.0]);
    assert!((times[8] - 1.005).abs() < 1e-12);
    // 60 whole steps plus one of 0.3 s
    assert_eq!(sim.clock().step_index(), 61);
    assert_eq!(sim.status(), RunStatus::Completed);
    assert_eq!(sim.progress_percent(), 100.0);
}

#[test]
fn macro_step_that_does_not_divide_the_interval_is_cut_at_each_boundary() {
    let mut coarse = config(1.0, 0.125, 18);
    coarse.timing.macro_step_sec = 5.0;
    let mut sim = CellSimulation::initialize(coarse).unwrap();
    let reports = sim.run_to_end().unwrap();
    assert_eq!(reports.len(), 8);
    assert_eq!(reports.last().unwrap().time_min, 1.0);
    // Each 7.5 s interval is one 5 s step and one 2.5 s step.
    assert_eq!(reports.last().unwrap().macro_steps, 16);
}

#[test]
fn unknown_names_are_rejected() {
    let mut kinetics = config(2.0, 1.0, 1);
    kinetics.kinetics.insert("k_warp_drive".into(), 1.0);
    assert_eq!(config_error(kinetics), ConfigError::UnknownParameter("k_warp_drive".into()));

    let mut source = config(2.0, 1.0, 1);
    source.initial_conditions.source = "mycoplasma_xl".into();
    assert_eq!(config_error(source), ConfigError::UnknownSource("mycoplasma_xl".into()));

    let mut species = config(2.0, 1.0, 1);
    species.initial_conditions.counts.insert("protein_none".into(), 5);
    assert_eq!(config_error(species), ConfigError::UnknownSpecies("protein_none".into()));
}

#[test]
fn kinetic_override_changes_expression() {
    let mut fast = config(1.0, 1.0, 3);
    fast.kinetics.insert("k_transcription".into(), 0.1);
    let mut sim = CellSimulation::initialize(fast).unwrap();
    let start: u64 = sim
        .network()
        .species()
        .iter()
        .filter(|s| s.name.starts_with("mRNA_"))
        .map(|s| sim.state().count(s.id))
        .sum();
    let report = sim.step_interval().unwrap();
    assert!(report.expression.total_mrna > start);
}

#[test]
fn cancellation_stops_at_a_boundary() {
    let mut sim = CellSimulation::initialize(config(5.0, 1.0, 11)).unwrap();
    sim.step_interval().unwrap();

    let token = sim.cancel_token();
    std::thread::spawn(move || token.cancel()).join().unwrap();

    let report = sim.step_interval().unwrap();
    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(report.time_min, 1.0);
    assert_eq!(sim.status(), RunStatus::Cancelled);

    let err = sim.step_interval().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InactiveRun);
}

/// Delegates to ROS2 for a fixed number of calls, then never converges.
struct FailAfter {
    inner: RosenbrockIntegrator,
    remaining: u32,
}

impl OdeIntegrator for FailAfter {
    fn integrate(&mut self, system: &dyn OdeSystem, y: &mut [f64], dt: f64) -> Result<IntegrationStats, IntegrationFailure> {
        if self.remaining == 0 {
            return Err(IntegrationFailure::StepUnderflow { min_step_sec: 1e-10, components: vec![0] });
        }
        self.remaining -= 1;
        self.inner.integrate(system, y, dt)
    }

    fn step_hint(&self) -> f64 {
        self.inner.step_hint()
    }

    fn set_step_hint(&mut self, step_sec: f64) {
        self.inner.set_step_hint(step_sec);
    }
}

#[test]
fn exhausted_retries_fail_at_last_completed_boundary() {
    let config = config(2.0, 1.0, 5);
    let solver = FailAfter { inner: RosenbrockIntegrator::new(&config.integrator), remaining: 5 };
    let mut sim = CellSimulation::initialize_with_integrator(config, Box::new(solver)).unwrap();

    let err = sim.step_interval().unwrap_err();
    match &err {
        SimError::NumericalNonConvergence { time_sec, macro_step, attempts, species, .. } => {
            assert_eq!(*time_sec, 5.0);
            assert_eq!(*macro_step, 5);
            assert_eq!(*attempts, 4);
            assert!(!species.is_empty());
        }
        other => panic!("unexpected error {}", other),
    }
    assert!(err.is_fatal());
    assert_eq!(sim.status(), RunStatus::Failed);
    assert_eq!(sim.clock().step_index(), 5);
    assert_eq!(sim.time_min(), 5.0 / 60.0);

    let failure = sim.failure().unwrap();
    assert_eq!(failure.kind, ErrorKind::NumericalNonConvergence);
    assert_eq!(failure.time_sec, Some(5.0));

    assert!(matches!(sim.step_interval(), Err(SimError::InactiveRun { status: RunStatus::Failed, .. })));
}

#[test]
fn failure_on_first_step_reports_time_zero() {
    let config = config(1.0, 1.0, 6);
    let solver = FailAfter { inner: RosenbrockIntegrator::new(&config.integrator), remaining: 0 };
    let mut sim = CellSimulation::initialize_with_integrator(config, Box::new(solver)).unwrap();
    let before = sim.state().clone();

    let err = sim.step_interval().unwrap_err();
    assert_eq!(err.time_sec(), Some(0.0));
    assert_eq!(sim.status(), RunStatus::Failed);
    // Rolled back to the starting boundary, stochastic events included.
    assert_eq!(sim.state(), &before);
}
