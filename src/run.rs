//! A single replicate run and its lifecycle.
//!
//! [`CellSimulation`] is the run handle: it owns the network, the species
//! state, the clock, the geometry and the random stream of one replicate,
//! and exposes the narrow surface external callers use: `initialize`,
//! `step_interval`, `checkpoint_state`, `resume` and `cancel`.

use crate::bridge::SyncBridge;
use crate::checkpoint::{Checkpoint, RngState, SpeciesRecord, CHECKPOINT_SCHEMA_VERSION};
use crate::clock::SimulationClock;
use crate::error::{FailureReport, SimError, SimResult};
use crate::growth::{CellGeometry, GrowthModel};
use crate::metabolism::{MetabolicIntegrator, OdeIntegrator};
use crate::network::{build_catalog, Catalog, ParameterTable, ReactionNetwork};
use crate::species::{mm_to_count, Domain, SpeciesId, SpeciesState};
use crate::stochastic::EngineRng;
use cell_common::{
    ConfigError, ExpressionMetrics, GrowthMetrics, IntervalReport, ReplicationMetrics, RunConfig, RunStatus, SimParams,
};
use log::{debug, error, info};
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared flag asking a run to stop at its next macro-step boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Species looked up once for interval reports.
#[derive(Debug, Clone, Default)]
struct ReportLayout {
    mrnas: Vec<SpeciesId>,
    proteins: Vec<SpeciesId>,
    atp: Option<SpeciesId>,
    adp: Option<SpeciesId>,
    nad: Option<SpeciesId>,
    nadh: Option<SpeciesId>,
    forks: Option<SpeciesId>,
    chromosomes: Option<SpeciesId>,
    replicated_kb: Option<SpeciesId>,
    high_bound: Option<SpeciesId>,
    low_bound: Option<SpeciesId>,
}

impl ReportLayout {
    fn new(catalog: &Catalog) -> Self {
        let net = &catalog.network;
        ReportLayout {
            mrnas: catalog.mrnas.clone(),
            proteins: catalog.proteins.clone(),
            atp: net.lookup("ATP"),
            adp: net.lookup("ADP"),
            nad: net.lookup("NAD"),
            nadh: net.lookup("NADH"),
            forks: net.lookup("replication_forks"),
            chromosomes: net.lookup("chromosomes"),
            replicated_kb: net.lookup("replicated_kb"),
            high_bound: net.lookup("oric_high_bound"),
            low_bound: net.lookup("oric_low_bound"),
        }
    }
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}

/// Manages the state and execution of one replicate.
pub struct CellSimulation {
    config: RunConfig,
    params: SimParams,
    seed: u64,
    network: Arc<ReactionNetwork>,
    layout: ReportLayout,
    state: SpeciesState,
    clock: SimulationClock,
    geometry: CellGeometry,
    initial_volume_l: f64,
    bridge: SyncBridge,
    rng: EngineRng,
    status: RunStatus,
    cancel: CancelToken,
    failure: Option<FailureReport>,
    total_events: u64,
    recorded_reports: Vec<IntervalReport>,
}

/// Boundary values restored when a macro-step fails.
struct Rollback {
    state: SpeciesState,
    rng: EngineRng,
    geometry: CellGeometry,
    step_hint: f64,
}

impl CellSimulation {
    /// Validates `config` and builds the initial state. Nothing is stepped.
    pub fn initialize(config: RunConfig) -> SimResult<Self> {
        Self::build(config, None, |net, cfg| MetabolicIntegrator::new(net, &cfg.integrator))
    }

    /// Like [`CellSimulation::initialize`] with a caller-supplied ODE solver.
    pub fn initialize_with_integrator(config: RunConfig, solver: Box<dyn OdeIntegrator>) -> SimResult<Self> {
        let mut solver = Some(solver);
        Self::build(config, None, move |net, cfg| match solver.take() {
            Some(s) => MetabolicIntegrator::with_solver(net, s, cfg.integrator.max_retries),
            None => MetabolicIntegrator::new(net, &cfg.integrator),
        })
    }

    fn build(
        config: RunConfig,
        seed_override: Option<u64>,
        mut make_integrator: impl FnMut(&ReactionNetwork, &RunConfig) -> MetabolicIntegrator,
    ) -> SimResult<Self> {
        config.validate()?;
        let params = config.get_sim_params();
        let table = ParameterTable::with_overrides(&config.kinetics)?;
        let catalog = build_catalog(&config.initial_conditions.source, &table)?;
        let lipid_ids: Vec<SpeciesId> = catalog.lipids.iter().map(|(id, _)| *id).collect();
        let growth = GrowthModel::new(&catalog.network, &lipid_ids, &catalog.membrane_proteins, &config.cell)?;

        let (state, geometry) = initial_state(&catalog, &growth, &config)?;

        let seed = seed_override.or(config.initial_conditions.seed).unwrap_or_else(|| rand::rng().random());
        let metabolic = make_integrator(&catalog.network, &config);
        let bridge = SyncBridge::new(&catalog.network, metabolic, growth);
        let layout = ReportLayout::new(&catalog);
        let network = Arc::new(catalog.network);

        info!(
            "Initialized run: {} species, {} discrete + {} continuous reactions, V0={:.4e} L (r={:.1} nm), seed {}",
            network.species_count(),
            network.discrete_reactions().len(),
            network.continuous_reactions().len(),
            geometry.volume_l,
            geometry.radius_nm,
            seed
        );
        debug!("Simulation parameters: {:#?}", params);

        Ok(CellSimulation {
            config,
            params,
            seed,
            network,
            layout,
            state,
            clock: SimulationClock::new(&params),
            geometry,
            initial_volume_l: geometry.volume_l,
            bridge,
            rng: EngineRng::seed_from_u64(seed),
            status: RunStatus::Pending,
            cancel: CancelToken::default(),
            failure: None,
            total_events: 0,
            recorded_reports: Vec::new(),
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn params(&self) -> &SimParams {
        &self.params
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn network(&self) -> &Arc<ReactionNetwork> {
        &self.network
    }

    pub fn state(&self) -> &SpeciesState {
        &self.state
    }

    pub fn clock(&self) -> &SimulationClock {
        &self.clock
    }

    pub fn geometry(&self) -> &CellGeometry {
        &self.geometry
    }

    pub fn initial_volume_l(&self) -> f64 {
        self.initial_volume_l
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn failure(&self) -> Option<&FailureReport> {
        self.failure.as_ref()
    }

    pub fn time_min(&self) -> f64 {
        self.clock.time_min()
    }

    pub fn progress_percent(&self) -> f64 {
        self.clock.progress_percent()
    }

    pub fn bridge_mut(&mut self) -> &mut SyncBridge {
        &mut self.bridge
    }

    /// Requests a cooperative stop at the next macro-step boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A handle that can cancel this run from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Advances by one checkpoint interval (fewer macro-steps if the horizon
    /// is closer) and returns the report for the boundary reached.
    ///
    /// A fatal error marks the run failed, restores the last completed
    /// macro-step boundary and is returned to the caller.
    pub fn step_interval(&mut self) -> SimResult<IntervalReport> {
        if !self.status.is_active() {
            return Err(SimError::InactiveRun { operation: "step_interval", status: self.status });
        }
        self.status = RunStatus::Running;

        let steps = self.clock.steps_to_boundary();
        let mut events = 0u64;
        for _ in 0..steps {
            if self.cancel.is_cancelled() {
                self.status = RunStatus::Cancelled;
                self.total_events += events;
                info!("Run cancelled at t={:.2} min", self.clock.time_min());
                return Ok(self.record_report(events));
            }

            let rollback = Rollback {
                state: self.state.clone(),
                rng: self.rng.clone(),
                geometry: self.geometry,
                step_hint: self.bridge.metabolic().step_hint(),
            };
            match self.bridge.step(&self.network, &mut self.state, &mut self.rng, &mut self.geometry, &mut self.clock) {
                Ok(outcome) => {
                    events += outcome.events;
                    debug!(
                        "t={:.0} s: {} events, {} accepted / {} rejected ROS2 steps, V={:.4e} L",
                        self.clock.time_sec(),
                        outcome.events,
                        outcome.integration.accepted,
                        outcome.integration.rejected,
                        outcome.geometry.volume_l
                    );
                }
                Err(err) => {
                    self.state = rollback.state;
                    self.rng = rollback.rng;
                    self.geometry = rollback.geometry;
                    self.bridge.metabolic_mut().set_step_hint(rollback.step_hint);
                    self.status = RunStatus::Failed;
                    self.failure = Some(err.report());
                    error!("Run failed at t={:.2} min: {}", self.clock.time_min(), err);
                    return Err(err);
                }
            }
        }
        self.total_events += events;

        if self.clock.at_horizon() {
            self.status = RunStatus::Completed;
            info!("Run completed at t={:.2} min ({} discrete events)", self.clock.time_min(), self.total_events);
        } else if self.cancel.is_cancelled() {
            self.status = RunStatus::Cancelled;
            info!("Run cancelled at t={:.2} min", self.clock.time_min());
        } else {
            info!(
                "Interval done: t={:.2} min ({:.1}%), {} events, V={:.4e} L",
                self.clock.time_min(),
                self.progress_percent(),
                events,
                self.geometry.volume_l
            );
        }
        Ok(self.record_report(events))
    }

    /// Steps until the run stops being active, returning every report.
    pub fn run_to_end(&mut self) -> SimResult<Vec<IntervalReport>> {
        let mut reports = Vec::new();
        while self.status.is_active() {
            reports.push(self.step_interval()?);
        }
        Ok(reports)
    }

    /// Records the report for the boundary the run starts from (t=0 for a
    /// fresh run, the checkpoint time for a resumed one) before any stepping.
    pub fn record_initial_report(&mut self) -> IntervalReport {
        self.record_report(0)
    }

    fn record_report(&mut self, discrete_events: u64) -> IntervalReport {
        let report = self.report(discrete_events);
        self.recorded_reports.push(report.clone());
        report
    }

    pub fn get_recorded_reports(&self) -> &[IntervalReport] {
        &self.recorded_reports
    }

    /// Report for the current boundary.
    pub fn report(&self, discrete_events: u64) -> IntervalReport {
        let network = &self.network;
        let volume = self.geometry.volume_l;
        let model = self.bridge.metabolic().model();

        let metabolites: BTreeMap<String, f64> = model
            .species()
            .iter()
            .map(|id| (network.name(*id).to_string(), self.state.concentration_mm(*id, volume)))
            .collect();
        let fluxes: BTreeMap<String, f64> = network
            .continuous_reactions()
            .iter()
            .zip(self.bridge.boundary_fluxes(network, &self.state, &self.geometry))
            .map(|(r, v)| (r.name.clone(), v))
            .collect();

        let conc = |id: Option<SpeciesId>| id.map(|id| self.state.concentration_mm(id, volume)).unwrap_or(0.0);
        let count = |id: Option<SpeciesId>| id.map(|id| self.state.count(id)).unwrap_or(0);
        let (atp, adp) = (conc(self.layout.atp), conc(self.layout.adp));
        let (nad, nadh) = (conc(self.layout.nad), conc(self.layout.nadh));

        IntervalReport {
            time_min: self.clock.time_min(),
            macro_steps: self.clock.step_index(),
            status: self.status,
            progress_percent: self.progress_percent(),
            discrete_events,
            metabolites,
            fluxes,
            growth: GrowthMetrics {
                volume_l: volume,
                radius_nm: self.geometry.radius_nm,
                surface_area_nm2: self.geometry.surface_area_nm2,
                atp_adp_ratio: ratio(atp, adp),
                nad_nadh_ratio: ratio(nad, nadh),
                energy_charge: ratio(atp + 0.5 * adp, atp + adp),
            },
            expression: ExpressionMetrics {
                total_mrna: self.layout.mrnas.iter().map(|id| self.state.count(*id)).sum(),
                total_protein: self.layout.proteins.iter().map(|id| self.state.count(*id)).sum(),
            },
            replication: ReplicationMetrics {
                active_forks: count(self.layout.forks),
                completed_chromosomes: count(self.layout.chromosomes),
                replicated_kb: count(self.layout.replicated_kb),
                bound_high_affinity_sites: count(self.layout.high_bound),
                bound_low_affinity_sites: count(self.layout.low_bound),
            },
        }
    }

    /// Captures the run at its current macro-step boundary.
    pub fn checkpoint_state(&self) -> Checkpoint {
        let species = self
            .network
            .species()
            .iter()
            .map(|s| SpeciesRecord {
                name: s.name.clone(),
                domain: s.domain,
                unit: s.unit,
                count: self.state.count(s.id),
                concentration_mm: self.state.concentration(s.id),
                remainder: self.state.remainders()[s.id.index()],
            })
            .collect();
        Checkpoint {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
            config: self.config.clone(),
            seed: self.seed,
            status: self.status,
            clock: self.clock,
            geometry: self.geometry,
            species,
            rng: RngState::capture(&self.rng),
            integrator_step_hint: self.bridge.metabolic().step_hint(),
            state_version: self.state.version(),
            total_events: self.total_events,
        }
    }

    /// Rebuilds a run from a checkpoint. Continuing it follows the same
    /// trajectory the original run would have taken.
    pub fn resume(checkpoint: Checkpoint) -> SimResult<Self> {
        Self::resume_inner(checkpoint, None)
    }

    /// Resumes with a longer horizon, still bounded by the configuration limits.
    pub fn resume_with_horizon(checkpoint: Checkpoint, horizon_min: f64) -> SimResult<Self> {
        Self::resume_inner(checkpoint, Some(horizon_min))
    }

    fn resume_inner(checkpoint: Checkpoint, horizon_min: Option<f64>) -> SimResult<Self> {
        checkpoint.check_schema()?;
        let mut config = checkpoint.config.clone();
        if let Some(horizon) = horizon_min {
            if horizon < checkpoint.clock.horizon_sec() / 60.0 {
                return Err(ConfigError::InvalidValue {
                    field: "timing.horizon_min".to_string(),
                    reason: format!("a resumed horizon may only grow (checkpoint horizon {} min)", checkpoint.clock.horizon_sec() / 60.0),
                }
                .into());
            }
            config.timing.horizon_min = horizon;
        }

        let mut sim = Self::build(config, Some(checkpoint.seed), |net, cfg| MetabolicIntegrator::new(net, &cfg.integrator))?;
        let species = sim.network.species();
        let matches = species.len() == checkpoint.species.len()
            && species.iter().zip(&checkpoint.species).all(|(s, r)| s.name == r.name && s.domain == r.domain);
        if !matches {
            return Err(ConfigError::InvalidNetwork("checkpoint species do not match the rebuilt network".to_string()).into());
        }

        sim.state.restore(
            checkpoint.species.iter().map(|r| r.count).collect(),
            checkpoint.species.iter().map(|r| r.concentration_mm).collect(),
            checkpoint.species.iter().map(|r| r.remainder).collect(),
            checkpoint.state_version,
        );
        sim.clock = checkpoint.clock;
        sim.clock.extend_horizon(sim.params.horizon_sec);
        sim.geometry = checkpoint.geometry;
        sim.rng = checkpoint.rng.restore();
        sim.bridge.metabolic_mut().set_step_hint(checkpoint.integrator_step_hint);
        sim.total_events = checkpoint.total_events;
        sim.status = if sim.clock.at_horizon() { RunStatus::Completed } else { RunStatus::Pending };

        info!(
            "Resumed run at t={:.2} min of {:.2} min (seed {})",
            sim.clock.time_min(),
            sim.clock.horizon_sec() / 60.0,
            sim.seed
        );
        Ok(sim)
    }
}

/// Seeds species values from the catalog and the configured overrides.
fn initial_state(catalog: &Catalog, growth: &GrowthModel, config: &RunConfig) -> Result<(SpeciesState, CellGeometry), ConfigError> {
    let network = &catalog.network;
    let ic = &config.initial_conditions;
    let mut state = SpeciesState::new(network.species());

    for (id, count) in &catalog.initial_counts {
        state.set_count(*id, *count);
    }
    let mut counted: Vec<SpeciesId> = Vec::new();
    for (name, count) in &ic.counts {
        let id = network.lookup(name).ok_or_else(|| ConfigError::UnknownSpecies(name.clone()))?;
        if !state.domain(id).has_count() {
            return Err(ConfigError::InvalidValue {
                field: format!("initial_conditions.counts.{}", name),
                reason: "species is continuous-only; set a concentration instead".to_string(),
            });
        }
        state.set_count(id, *count);
        counted.push(id);
    }

    let derive: Vec<(SpeciesId, f64)> = catalog.lipids.iter().filter(|(id, _)| !counted.contains(id)).copied().collect();
    if !derive.is_empty() {
        for (id, count) in growth.lipids_for_radius(config.cell.initial_radius_nm, state.counts(), &derive)? {
            state.set_count(id, count);
        }
    }
    let geometry = growth.geometry(state.counts());
    if !(geometry.volume_l > 0.0) {
        return Err(ConfigError::InvalidValue {
            field: "initial_conditions".to_string(),
            reason: "initial membrane composition gives a zero volume".to_string(),
        });
    }

    let per_mm = mm_to_count(geometry.volume_l);
    let set_concentration = |state: &mut SpeciesState, id: SpeciesId, value: f64| match state.domain(id) {
        Domain::Continuous => state.set_concentration(id, value),
        Domain::Dual => state.set_count(id, (value * per_mm).round() as u64),
        Domain::Discrete => {}
    };
    for (id, value) in &catalog.initial_concentrations {
        if !counted.contains(id) {
            set_concentration(&mut state, *id, *value);
        }
    }
    for (name, value) in &ic.concentrations {
        let id = network.lookup(name).ok_or_else(|| ConfigError::UnknownSpecies(name.clone()))?;
        if !state.domain(id).has_concentration() || counted.contains(&id) {
            return Err(ConfigError::InvalidValue {
                field: format!("initial_conditions.concentrations.{}", name),
                reason: "species is discrete-only or already given as a count".to_string(),
            });
        }
        set_concentration(&mut state, id, *value);
    }

    Ok((state, geometry))
}
