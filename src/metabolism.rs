//! Deterministic integration of the continuous metabolic subnetwork.
//!
//! The ODE state holds every continuous and dual species in mM. Reaction
//! capacities (kcat times enzyme concentration, or a fixed Vmax) are frozen
//! for the whole macro-step in a [`Coefficients`] value rebuilt by the bridge
//! from post-SSA protein counts. The default solver is a two-stage
//! L-stable Rosenbrock method (ROS2) with an embedded error estimate, which
//! copes with the spread of time scales between fast isomerases and slow
//! biosynthesis without tiny explicit steps.

use crate::error::{Engine, SimError, SimResult};
use crate::network::{RateExpression, RateLaw, ReactionNetwork};
use crate::species::{count_to_mm, SpeciesId, SpeciesState};
use cell_common::IntegratorConfig;
use log::{trace, warn};
use nalgebra::{DMatrix, DVector};
use thiserror::Error;

/// Right-hand side of an autonomous ODE system `dy/dt = f(y)`.
pub trait OdeSystem {
    fn dimension(&self) -> usize;
    fn rhs(&self, y: &[f64], dydt: &mut [f64]);
}

/// Why a single integration attempt gave up. `components` lists the state
/// indices most responsible, for diagnostics.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IntegrationFailure {
    #[error("step size fell below {min_step_sec:e} s")]
    StepUnderflow { min_step_sec: f64, components: Vec<usize> },
    #[error("exceeded {limit} substeps")]
    TooManySubsteps { limit: u32, components: Vec<usize> },
    #[error("non-finite derivative")]
    NonFinite { components: Vec<usize> },
}

impl IntegrationFailure {
    pub fn components(&self) -> &[usize] {
        match self {
            IntegrationFailure::StepUnderflow { components, .. }
            | IntegrationFailure::TooManySubsteps { components, .. }
            | IntegrationFailure::NonFinite { components } => components,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IntegrationStats {
    pub accepted: u32,
    pub rejected: u32,
    /// Last accepted step size, in seconds.
    pub last_step_sec: f64,
}

/// A stiff solver advancing a system over a fixed window.
pub trait OdeIntegrator: Send {
    /// Advances `y` in place by `dt`. On error `y` is left in an unspecified state.
    fn integrate(&mut self, system: &dyn OdeSystem, y: &mut [f64], dt: f64) -> Result<IntegrationStats, IntegrationFailure>;

    /// Step size the next call starts from.
    fn step_hint(&self) -> f64;

    fn set_step_hint(&mut self, step_sec: f64);
}

const GAMMA: f64 = 1.0 + std::f64::consts::FRAC_1_SQRT_2;
const SAFETY: f64 = 0.9;
const MIN_FACTOR: f64 = 0.2;
const MAX_FACTOR: f64 = 5.0;
/// Number of components reported on failure.
const REPORTED_COMPONENTS: usize = 5;

/// ROS2 with finite-difference Jacobian and weighted RMS error control.
#[derive(Debug, Clone)]
pub struct RosenbrockIntegrator {
    rtol: f64,
    atol: f64,
    min_step: f64,
    max_step: f64,
    max_substeps: u32,
    step_hint: f64,
}

impl RosenbrockIntegrator {
    pub fn new(config: &IntegratorConfig) -> Self {
        RosenbrockIntegrator {
            rtol: config.rtol,
            atol: config.atol,
            min_step: config.min_step_sec,
            max_step: config.max_step_sec,
            max_substeps: config.max_substeps,
            step_hint: config.initial_step_sec,
        }
    }

    fn jacobian(&self, system: &dyn OdeSystem, y: &[f64], f0: &[f64]) -> DMatrix<f64> {
        let n = y.len();
        let mut jac = DMatrix::<f64>::zeros(n, n);
        let mut probe = y.to_vec();
        let mut f = vec![0.0; n];
        for j in 0..n {
            let delta = 1.5e-8 * y[j].abs().max(1.0e-3);
            probe[j] = y[j] + delta;
            system.rhs(&probe, &mut f);
            for i in 0..n {
                jac[(i, j)] = (f[i] - f0[i]) / delta;
            }
            probe[j] = y[j];
        }
        jac
    }

    /// Indices with the largest scaled magnitude of `values`.
    fn worst_components(&self, values: &[f64], y: &[f64]) -> Vec<usize> {
        let mut ranked: Vec<(usize, f64)> = values
            .iter()
            .zip(y)
            .enumerate()
            .map(|(i, (v, yi))| {
                let scaled = v.abs() / (self.atol + self.rtol * yi.abs());
                (i, if scaled.is_finite() { scaled } else { f64::MAX })
            })
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked.into_iter().take(REPORTED_COMPONENTS).map(|(i, _)| i).collect()
    }
}

impl OdeIntegrator for RosenbrockIntegrator {
    fn integrate(&mut self, system: &dyn OdeSystem, y: &mut [f64], dt: f64) -> Result<IntegrationStats, IntegrationFailure> {
        let n = system.dimension();
        let mut stats = IntegrationStats::default();
        if n == 0 || dt <= 0.0 {
            return Ok(stats);
        }

        let mut f0 = vec![0.0; n];
        let mut f1 = vec![0.0; n];
        let mut y1 = vec![0.0; n];
        let mut y_new = vec![0.0; n];
        let mut err = vec![0.0; n];

        let mut t = 0.0;
        let mut h = self.step_hint.clamp(self.min_step, self.max_step);
        let end_tolerance = 1.0e-12 * dt;

        while dt - t > end_tolerance {
            system.rhs(y, &mut f0);
            if let Some(bad) = f0.iter().position(|v| !v.is_finite()) {
                return Err(IntegrationFailure::NonFinite { components: vec![bad] });
            }
            let jac = self.jacobian(system, y, &f0);
            let b0 = DVector::from_column_slice(&f0);

            loop {
                if stats.accepted + stats.rejected >= self.max_substeps {
                    return Err(IntegrationFailure::TooManySubsteps {
                        limit: self.max_substeps,
                        components: self.worst_components(&f0, y),
                    });
                }
                if h < self.min_step {
                    return Err(IntegrationFailure::StepUnderflow {
                        min_step_sec: self.min_step,
                        components: self.worst_components(&err, y),
                    });
                }
                let step = h.min(dt - t);

                let iteration = DMatrix::<f64>::identity(n, n) - &jac * (GAMMA * step);
                let lu = iteration.lu();
                let Some(k1) = lu.solve(&b0) else {
                    stats.rejected += 1;
                    h *= MIN_FACTOR;
                    continue;
                };

                for i in 0..n {
                    y1[i] = y[i] + step * k1[i];
                }
                system.rhs(&y1, &mut f1);
                let b1 = DVector::from_iterator(n, (0..n).map(|i| f1[i] - 2.0 * k1[i]));
                let Some(k2) = lu.solve(&b1) else {
                    stats.rejected += 1;
                    h *= MIN_FACTOR;
                    continue;
                };

                let mut sum_sq = 0.0;
                let mut admissible = true;
                for i in 0..n {
                    y_new[i] = y[i] + step * (1.5 * k1[i] + 0.5 * k2[i]);
                    err[i] = 0.5 * step * (k1[i] + k2[i]);
                    if !y_new[i].is_finite() || y_new[i] < -self.atol {
                        admissible = false;
                    }
                    let scale = self.atol + self.rtol * y[i].abs().max(y_new[i].abs());
                    sum_sq += (err[i] / scale).powi(2);
                }
                let norm = (sum_sq / n as f64).sqrt();

                if !admissible {
                    stats.rejected += 1;
                    h = step * 0.5;
                    continue;
                }
                if !(norm <= 1.0) {
                    stats.rejected += 1;
                    h = step * (SAFETY / norm.sqrt()).clamp(MIN_FACTOR, 1.0);
                    continue;
                }

                for i in 0..n {
                    // Excursions below zero within tolerance are rounding, not chemistry.
                    y[i] = y_new[i].max(0.0);
                }
                t += step;
                stats.accepted += 1;
                stats.last_step_sec = step;

                let factor = if norm > 0.0 { (SAFETY / norm.sqrt()).clamp(MIN_FACTOR, MAX_FACTOR) } else { MAX_FACTOR };
                // A step truncated to hit the window end says nothing about the next one.
                if step == h {
                    h = (step * factor).min(self.max_step);
                }
                break;
            }
        }

        self.step_hint = h;
        trace!("ROS2: {} accepted, {} rejected, hint {:.3e} s", stats.accepted, stats.rejected, h);
        Ok(stats)
    }

    fn step_hint(&self) -> f64 {
        self.step_hint
    }

    fn set_step_hint(&mut self, step_sec: f64) {
        self.step_hint = step_sec;
    }
}

/// Per-reaction capacities for one macro-step, in mM/s (or 1/s for mass action).
#[derive(Debug, Clone, PartialEq)]
pub struct Coefficients {
    pub capacities: Vec<f64>,
    /// Volume the enzyme counts were converted with.
    pub volume_l: f64,
}

impl Coefficients {
    /// Capacities from the current enzyme counts. Reactions without an enzyme
    /// use their rate constant unchanged.
    pub fn from_state(network: &ReactionNetwork, state: &SpeciesState, volume_l: f64) -> Self {
        let per_molecule = count_to_mm(volume_l);
        let capacities = network
            .continuous_reactions()
            .iter()
            .map(|r| match r.enzyme {
                Some(enzyme) => r.rate_constant * state.count(enzyme) as f64 * per_molecule,
                None => r.rate_constant,
            })
            .collect();
        Coefficients { capacities, volume_l }
    }
}

#[derive(Debug, Clone)]
struct CompiledReaction {
    reactants: Vec<(usize, u32)>,
    products: Vec<(usize, u32)>,
    expression: RateExpression,
}

/// Continuous reactions rewritten over ODE state indices.
#[derive(Debug, Clone)]
pub struct MetabolicModel {
    species: Vec<SpeciesId>,
    reactions: Vec<CompiledReaction>,
}

impl MetabolicModel {
    pub fn new(network: &ReactionNetwork) -> Self {
        let species = network.ode_species();
        let mut slot = vec![usize::MAX; network.species_count()];
        for (i, id) in species.iter().enumerate() {
            slot[id.index()] = i;
        }
        // Building the network already checked that every participant has a concentration.
        let remap = |side: &[(SpeciesId, u32)]| -> Vec<(usize, u32)> {
            side.iter().map(|(id, c)| (slot[id.index()], *c)).collect()
        };
        let reactions = network
            .continuous_reactions()
            .iter()
            .filter_map(|r| match &r.law {
                RateLaw::Continuous(expression) => Some(CompiledReaction {
                    reactants: remap(&r.stoichiometry.reactants),
                    products: remap(&r.stoichiometry.products),
                    expression: expression.clone(),
                }),
                RateLaw::Discrete(_) => None,
            })
            .collect();
        MetabolicModel { species, reactions }
    }

    pub fn dimension(&self) -> usize {
        self.species.len()
    }

    pub fn species(&self) -> &[SpeciesId] {
        &self.species
    }

    pub fn gather(&self, state: &SpeciesState) -> Vec<f64> {
        self.species.iter().map(|id| state.concentration(*id)).collect()
    }

    fn scatter(&self, y: &[f64], state: &mut SpeciesState) {
        let concentrations = state.concentrations_mut();
        for (id, value) in self.species.iter().zip(y) {
            concentrations[id.index()] = *value;
        }
    }

    pub fn system<'a>(&'a self, coefficients: &'a Coefficients) -> MetabolicSystem<'a> {
        MetabolicSystem { model: self, coefficients }
    }

    /// Reaction rates (mM/s) at `y`.
    pub fn fluxes(&self, coefficients: &Coefficients, y: &[f64]) -> Vec<f64> {
        self.reactions
            .iter()
            .zip(&coefficients.capacities)
            .map(|(r, cap)| rate(r, *cap, y))
            .collect()
    }
}

fn rate(r: &CompiledReaction, capacity: f64, y: &[f64]) -> f64 {
    let conc = |i: usize| y[i].max(0.0);
    match &r.expression {
        RateExpression::MassAction => {
            let mut v = capacity;
            for &(i, coef) in &r.reactants {
                v *= conc(i).powi(coef as i32);
            }
            v
        }
        RateExpression::MichaelisMenten { km } => {
            let mut v = capacity;
            for (&(i, _), k) in r.reactants.iter().zip(km) {
                let s = conc(i);
                v *= s / (k + s);
            }
            v
        }
        RateExpression::ReversibleMichaelisMenten { km, keq } => {
            let s = conc(r.reactants[0].0);
            let p = conc(r.products[0].0);
            capacity * (s - p / keq) / (km + s)
        }
        RateExpression::Uptake { km, external_mm } => {
            let inside = conc(r.products[0].0);
            capacity * (external_mm - inside) / (km + external_mm + inside)
        }
    }
}

/// The metabolic ODE for one macro-step's coefficients.
pub struct MetabolicSystem<'a> {
    model: &'a MetabolicModel,
    coefficients: &'a Coefficients,
}

impl OdeSystem for MetabolicSystem<'_> {
    fn dimension(&self) -> usize {
        self.model.species.len()
    }

    fn rhs(&self, y: &[f64], dydt: &mut [f64]) {
        dydt.fill(0.0);
        for (r, cap) in self.model.reactions.iter().zip(&self.coefficients.capacities) {
            let v = rate(r, *cap, y);
            if v == 0.0 {
                continue;
            }
            for &(i, coef) in &r.reactants {
                dydt[i] -= coef as f64 * v;
            }
            for &(i, coef) in &r.products {
                dydt[i] += coef as f64 * v;
            }
        }
    }
}

/// Runs the solver for one macro-step with bounded retries.
pub struct MetabolicIntegrator {
    model: MetabolicModel,
    solver: Box<dyn OdeIntegrator>,
    max_retries: u32,
}

impl MetabolicIntegrator {
    pub fn new(network: &ReactionNetwork, config: &IntegratorConfig) -> Self {
        Self::with_solver(network, Box::new(RosenbrockIntegrator::new(config)), config.max_retries)
    }

    pub fn with_solver(network: &ReactionNetwork, solver: Box<dyn OdeIntegrator>, max_retries: u32) -> Self {
        MetabolicIntegrator { model: MetabolicModel::new(network), solver, max_retries }
    }

    pub fn model(&self) -> &MetabolicModel {
        &self.model
    }

    pub fn step_hint(&self) -> f64 {
        self.solver.step_hint()
    }

    pub fn set_step_hint(&mut self, step_sec: f64) {
        self.solver.set_step_hint(step_sec);
    }

    /// Integrates the continuous species held in `state` over `dt`.
    ///
    /// A failed attempt restores the starting values and retries from a step
    /// ten times smaller. When every attempt fails the run cannot continue.
    pub fn advance(
        &mut self,
        network: &ReactionNetwork,
        state: &mut SpeciesState,
        coefficients: &Coefficients,
        dt: f64,
        time_sec: f64,
        macro_step: u64,
    ) -> SimResult<IntegrationStats> {
        state.require_owner(Engine::Deterministic, time_sec)?;
        let start = self.model.gather(state);
        let system = self.model.system(coefficients);

        let mut last_failure = None;
        for attempt in 0..=self.max_retries {
            let mut y = start.clone();
            match self.solver.integrate(&system, &mut y, dt) {
                Ok(stats) => {
                    self.model.scatter(&y, state);
                    return Ok(stats);
                }
                Err(failure) => {
                    warn!(
                        "integrator attempt {} of {} failed in macro-step {} (t={:.1} s): {}",
                        attempt + 1,
                        self.max_retries + 1,
                        macro_step,
                        time_sec,
                        failure
                    );
                    let reduced = self.solver.step_hint() * 0.1;
                    self.solver.set_step_hint(reduced);
                    last_failure = Some(failure);
                }
            }
        }

        let (reason, species) = match last_failure {
            Some(failure) => {
                let names = failure
                    .components()
                    .iter()
                    .filter_map(|i| self.model.species.get(*i))
                    .map(|id| network.name(*id).to_string())
                    .collect();
                (failure.to_string(), names)
            }
            None => ("no attempt was made".to_string(), Vec::new()),
        };
        Err(SimError::NumericalNonConvergence {
            time_sec,
            macro_step,
            attempts: self.max_retries + 1,
            reason,
            species,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{NetworkBuilder, Reaction, Stoichiometry};
    use crate::species::Domain;

    fn continuous(
        name: &str,
        reactants: Vec<(SpeciesId, u32)>,
        products: Vec<(SpeciesId, u32)>,
        k: f64,
        expression: RateExpression,
    ) -> Reaction {
        Reaction {
            name: name.to_string(),
            stoichiometry: Stoichiometry { reactants, products },
            modifiers: Vec::new(),
            law: RateLaw::Continuous(expression),
            rate_constant: k,
            enzyme: None,
        }
    }

    /// A <-> B (fast), B -> C (slow): stiff and closed.
    fn stiff_chain() -> ReactionNetwork {
        let mut b = NetworkBuilder::new();
        let a = b.species("A", Domain::Continuous, None);
        let bb = b.species("B", Domain::Continuous, None);
        let c = b.species("C", Domain::Continuous, None);
        b.reaction(continuous(
            "isomerase",
            vec![(a, 1)],
            vec![(bb, 1)],
            1.0e4,
            RateExpression::ReversibleMichaelisMenten { km: 1.0, keq: 2.0 },
        ));
        b.reaction(continuous("slow", vec![(bb, 1)], vec![(c, 1)], 0.05, RateExpression::MassAction));
        b.build().unwrap()
    }

    fn state_with(network: &ReactionNetwork, values: &[(&str, f64)]) -> SpeciesState {
        let mut state = SpeciesState::new(network.species());
        for (name, v) in values {
            state.set_concentration(network.lookup(name).unwrap(), *v);
        }
        state.transfer_to_continuous(1.0e-17, 0.0).unwrap();
        state
    }

    #[test]
    fn stiff_closed_system_conserves_mass() {
        let network = stiff_chain();
        let mut state = state_with(&network, &[("A", 5.0), ("B", 0.0), ("C", 1.0)]);
        let mut integrator = MetabolicIntegrator::new(&network, &IntegratorConfig::default());
        let coefficients = Coefficients::from_state(&network, &state, 1.0e-17);

        for step in 0..10 {
            integrator.advance(&network, &mut state, &coefficients, 1.0, step as f64, step).unwrap();
        }
        let total: f64 = ["A", "B", "C"].iter().map(|n| state.concentration(network.lookup(n).unwrap())).sum();
        assert!((total - 6.0).abs() < 1.0e-4, "total = {}", total);

        // The fast isomerase holds B/A at Keq.
        let a = state.concentration(network.lookup("A").unwrap());
        let b = state.concentration(network.lookup("B").unwrap());
        assert!((b / a - 2.0).abs() < 1.0e-2, "ratio = {}", b / a);
    }

    #[test]
    fn fast_consumption_never_goes_negative() {
        let mut b = NetworkBuilder::new();
        let a = b.species("A", Domain::Continuous, None);
        let c = b.species("C", Domain::Continuous, None);
        b.reaction(continuous("burn", vec![(a, 1)], vec![(c, 1)], 50.0, RateExpression::MichaelisMenten { km: vec![0.01] }));
        let network = b.build().unwrap();
        let mut state = state_with(&network, &[("A", 2.0)]);
        let mut integrator = MetabolicIntegrator::new(&network, &IntegratorConfig::default());
        let coefficients = Coefficients::from_state(&network, &state, 1.0e-17);

        integrator.advance(&network, &mut state, &coefficients, 1.0, 0.0, 0).unwrap();
        assert!(state.concentration(a) >= 0.0);
        assert!(state.concentration(a) < 1.0e-3);
        assert!((state.concentration(c) - 2.0).abs() < 1.0e-3);
    }

    #[test]
    fn capacities_follow_enzyme_counts() {
        let mut b = NetworkBuilder::new();
        let s = b.species("S", Domain::Continuous, None);
        let enzyme = b.species("protein_E", Domain::Discrete, None);
        let mut reaction = continuous("cat", vec![(s, 1)], vec![], 10.0, RateExpression::MichaelisMenten { km: vec![1.0] });
        reaction.enzyme = Some(enzyme);
        b.reaction(reaction);
        let network = b.build().unwrap();

        let mut state = SpeciesState::new(network.species());
        state.set_count(enzyme, 100);
        let volume = 1.0e-17;
        let low = Coefficients::from_state(&network, &state, volume);
        state.set_count(enzyme, 300);
        let high = Coefficients::from_state(&network, &state, volume);
        assert!((high.capacities[0] / low.capacities[0] - 3.0).abs() < 1e-12);
        assert!((low.capacities[0] - 10.0 * 100.0 * count_to_mm(volume)).abs() < 1e-15);
    }

    #[test]
    fn uptake_levels_off_at_the_external_concentration() {
        let mut b = NetworkBuilder::new();
        let s = b.species("S", Domain::Continuous, None);
        b.reaction(continuous("import", vec![], vec![(s, 1)], 5.0, RateExpression::Uptake { km: 0.1, external_mm: 2.0 }));
        let network = b.build().unwrap();
        let mut integrator = MetabolicIntegrator::new(&network, &IntegratorConfig::default());

        for start in [0.0, 6.0] {
            let mut state = state_with(&network, &[("S", start)]);
            let coefficients = Coefficients::from_state(&network, &state, 1.0e-17);
            for step in 0..20 {
                integrator.advance(&network, &mut state, &coefficients, 1.0, step as f64, step).unwrap();
            }
            assert!((state.concentration(s) - 2.0).abs() < 1.0e-3, "from {}: {}", start, state.concentration(s));
        }
    }

    struct AlwaysFails;

    impl OdeIntegrator for AlwaysFails {
        fn integrate(&mut self, _: &dyn OdeSystem, y: &mut [f64], _: f64) -> Result<IntegrationStats, IntegrationFailure> {
            y.fill(f64::NAN);
            Err(IntegrationFailure::StepUnderflow { min_step_sec: 1e-10, components: vec![0] })
        }
        fn step_hint(&self) -> f64 {
            1.0
        }
        fn set_step_hint(&mut self, _: f64) {}
    }

    #[test]
    fn exhausted_retries_report_step_and_species() {
        let network = stiff_chain();
        let mut state = state_with(&network, &[("A", 1.0)]);
        let before = state.concentrations().to_vec();
        let mut integrator = MetabolicIntegrator::with_solver(&network, Box::new(AlwaysFails), 2);
        let coefficients = Coefficients::from_state(&network, &state, 1.0e-17);

        let err = integrator.advance(&network, &mut state, &coefficients, 1.0, 17.0, 17).unwrap_err();
        match err {
            SimError::NumericalNonConvergence { time_sec, macro_step, attempts, species, .. } => {
                assert_eq!(time_sec, 17.0);
                assert_eq!(macro_step, 17);
                assert_eq!(attempts, 3);
                assert_eq!(species, vec!["A".to_string()]);
            }
            other => panic!("unexpected error {other}"),
        }
        // Failed attempts never leak partial values into the state.
        assert_eq!(state.concentrations(), before.as_slice());
    }

    #[test]
    fn substep_limit_is_enforced() {
        let network = stiff_chain();
        let mut state = state_with(&network, &[("A", 5.0)]);
        let config = IntegratorConfig { max_substeps: 1, initial_step_sec: 1e-6, min_step_sec: 1e-10, max_retries: 0, ..IntegratorConfig::default() };
        let mut integrator = MetabolicIntegrator::new(&network, &config);
        let coefficients = Coefficients::from_state(&network, &state, 1.0e-17);
        let err = integrator.advance(&network, &mut state, &coefficients, 1.0, 0.0, 0).unwrap_err();
        assert!(matches!(err, SimError::NumericalNonConvergence { attempts: 1, .. }));
    }
}
