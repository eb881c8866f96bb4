//! One macro-step of coupled simulation.
//!
//! The six phases run strictly in order, every macro-step:
//!
//! 1. the stochastic engine fires discrete events for the macro-step,
//! 2. dual species are handed to the integrator and reaction capacities are
//!    rebuilt from the post-SSA enzyme counts,
//! 3. the integrator advances the metabolic ODE,
//! 4. dual species are rounded back to counts,
//! 5. geometry is recomputed from the membrane and continuous-only species
//!    are diluted into the new volume,
//! 6. the clock advances.
//!
//! Any error aborts the step before the clock moves, so the last completed
//! boundary is always the clock's current time.

use crate::clock::SimulationClock;
use crate::error::SimResult;
use crate::growth::{CellGeometry, GrowthModel};
use crate::metabolism::{Coefficients, IntegrationStats, MetabolicIntegrator};
use crate::network::ReactionNetwork;
use crate::species::SpeciesState;
use crate::stochastic::{EngineRng, StochasticEngine};
use log::trace;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BridgePhase {
    StochasticAdvance,
    CoefficientRefresh,
    MetabolicIntegration,
    CountWriteBack,
    GrowthUpdate,
    ClockAdvance,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MacroStepOutcome {
    pub events: u64,
    pub integration: IntegrationStats,
    pub geometry: CellGeometry,
}

pub struct SyncBridge {
    stochastic: StochasticEngine,
    metabolic: MetabolicIntegrator,
    growth: GrowthModel,
    last_coefficients: Option<Coefficients>,
    phase_log: Option<Vec<BridgePhase>>,
}

impl SyncBridge {
    pub fn new(network: &ReactionNetwork, metabolic: MetabolicIntegrator, growth: GrowthModel) -> Self {
        SyncBridge {
            stochastic: StochasticEngine::new(network),
            metabolic,
            growth,
            last_coefficients: None,
            phase_log: None,
        }
    }

    pub fn growth(&self) -> &GrowthModel {
        &self.growth
    }

    pub fn metabolic(&self) -> &MetabolicIntegrator {
        &self.metabolic
    }

    pub fn metabolic_mut(&mut self) -> &mut MetabolicIntegrator {
        &mut self.metabolic
    }

    pub fn stochastic_mut(&mut self) -> &mut StochasticEngine {
        &mut self.stochastic
    }

    /// Coefficients used by the most recent integration.
    pub fn last_coefficients(&self) -> Option<&Coefficients> {
        self.last_coefficients.as_ref()
    }

    /// Records the phases entered until [`SyncBridge::take_phases`] is called.
    pub fn record_phases(&mut self, enabled: bool) {
        self.phase_log = if enabled { Some(Vec::new()) } else { None };
    }

    pub fn take_phases(&mut self) -> Vec<BridgePhase> {
        self.phase_log.as_mut().map(std::mem::take).unwrap_or_default()
    }

    fn enter(&mut self, phase: BridgePhase) {
        if let Some(log) = self.phase_log.as_mut() {
            log.push(phase);
        }
    }

    /// Runs one macro-step. On error the clock is left at the step's start.
    pub fn step(
        &mut self,
        network: &ReactionNetwork,
        state: &mut SpeciesState,
        rng: &mut EngineRng,
        geometry: &mut CellGeometry,
        clock: &mut SimulationClock,
    ) -> SimResult<MacroStepOutcome> {
        let t0 = clock.time_sec();
        let dt = clock.step_dt();
        let step_index = clock.step_index();
        let volume_l = geometry.volume_l;

        self.enter(BridgePhase::StochasticAdvance);
        let summary = self.stochastic.advance(network, state, rng, dt, t0)?;

        self.enter(BridgePhase::CoefficientRefresh);
        state.transfer_to_continuous(volume_l, t0)?;
        let coefficients = Coefficients::from_state(network, state, volume_l);

        self.enter(BridgePhase::MetabolicIntegration);
        let integration = self.metabolic.advance(network, state, &coefficients, dt, t0, step_index)?;
        self.last_coefficients = Some(coefficients);

        self.enter(BridgePhase::CountWriteBack);
        state.transfer_to_discrete(volume_l, t0, network.species())?;

        self.enter(BridgePhase::GrowthUpdate);
        let next = self.growth.update(state, geometry, t0)?;
        state.dilute(volume_l, next.volume_l);
        *geometry = next;

        self.enter(BridgePhase::ClockAdvance);
        clock.advance();

        trace!(
            "macro-step {} done: {} events, {} ROS2 steps, V={:.4e} L",
            step_index,
            summary.events,
            integration.accepted,
            geometry.volume_l
        );
        Ok(MacroStepOutcome { events: summary.events, integration, geometry: *geometry })
    }

    /// Reaction rates (mM/s) at the current boundary, from the current enzyme
    /// counts and concentrations.
    pub fn boundary_fluxes(&self, network: &ReactionNetwork, state: &SpeciesState, geometry: &CellGeometry) -> Vec<f64> {
        let model = self.metabolic.model();
        let coefficients = Coefficients::from_state(network, state, geometry.volume_l);
        let y: Vec<f64> = model.species().iter().map(|id| state.concentration_mm(*id, geometry.volume_l)).collect();
        model.fluxes(&coefficients, &y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Engine, SimError};
    use crate::metabolism::{IntegrationFailure, OdeIntegrator, OdeSystem};
    use crate::network::{NetworkBuilder, Propensity, RateExpression, RateLaw, Reaction, Stoichiometry};
    use crate::species::{count_to_mm, Domain, SpeciesId};
    use cell_common::{CellConfig, IntegratorConfig, SimParams};
    use rand::SeedableRng;

    struct Fixture {
        network: ReactionNetwork,
        state: SpeciesState,
        geometry: CellGeometry,
        clock: SimulationClock,
        rng: EngineRng,
        enzyme: SpeciesId,
        lipid: SpeciesId,
    }

    /// Translation makes an enzyme that converts S to a lipid.
    fn fixture() -> (Fixture, GrowthModel) {
        let mut b = NetworkBuilder::new();
        let s = b.species("S", Domain::Continuous, None);
        let lipid = b.species("lipid_pg", Domain::Dual, None);
        let enzyme = b.species("protein_E", Domain::Discrete, None);
        let mrna = b.species("mRNA_E", Domain::Discrete, None);
        b.reaction(Reaction {
            name: "translation_E".into(),
            stoichiometry: Stoichiometry { reactants: vec![], products: vec![(enzyme, 1)] },
            modifiers: vec![mrna],
            law: RateLaw::Discrete(Propensity::Templated { k: 5.0, half_saturation: 0.0 }),
            rate_constant: 5.0,
            enzyme: None,
        });
        b.reaction(Reaction {
            name: "lipid_synthesis".into(),
            stoichiometry: Stoichiometry { reactants: vec![(s, 1)], products: vec![(lipid, 1)] },
            modifiers: vec![],
            law: RateLaw::Continuous(RateExpression::MichaelisMenten { km: vec![0.5] }),
            rate_constant: 2.0,
            enzyme: Some(enzyme),
        });
        let network = b.build().unwrap();

        let mut cell = CellConfig::default();
        cell.lipid_headgroup_area_nm2.remove("lipid_glycolipid");
        let growth = GrowthModel::new(&network, &[lipid], &[], &cell).unwrap();

        let mut state = SpeciesState::new(network.species());
        state.set_count(mrna, 20);
        state.set_count(enzyme, 100);
        state.set_count(lipid, 1_500_000);
        state.set_concentration(s, 10.0);
        let geometry = growth.geometry(state.counts());

        let params = SimParams { macro_step_sec: 1.0, interval_sec: 60.0, horizon_sec: 120.0, steps_per_interval: 60, horizon_steps: 120 };
        let fixture = Fixture {
            network,
            state,
            geometry,
            clock: SimulationClock::new(&params),
            rng: EngineRng::seed_from_u64(11),
            enzyme,
            lipid,
        };
        (fixture, growth)
    }

    #[test]
    fn phases_run_in_order_every_step() {
        let (mut f, growth) = fixture();
        let metabolic = MetabolicIntegrator::new(&f.network, &IntegratorConfig::default());
        let mut bridge = SyncBridge::new(&f.network, metabolic, growth);
        bridge.record_phases(true);

        for _ in 0..2 {
            bridge.step(&f.network, &mut f.state, &mut f.rng, &mut f.geometry, &mut f.clock).unwrap();
        }
        let expected = [
            BridgePhase::StochasticAdvance,
            BridgePhase::CoefficientRefresh,
            BridgePhase::MetabolicIntegration,
            BridgePhase::CountWriteBack,
            BridgePhase::GrowthUpdate,
            BridgePhase::ClockAdvance,
        ];
        let phases = bridge.take_phases();
        assert_eq!(&phases[..6], &expected);
        assert_eq!(&phases[6..], &expected);
        assert_eq!(f.clock.step_index(), 2);
        assert_eq!(f.state.owner(), Engine::Stochastic);
    }

    #[test]
    fn coefficients_use_post_ssa_enzyme_counts() {
        let (mut f, growth) = fixture();
        let metabolic = MetabolicIntegrator::new(&f.network, &IntegratorConfig::default());
        let mut bridge = SyncBridge::new(&f.network, metabolic, growth);
        let volume_before = f.geometry.volume_l;

        bridge.step(&f.network, &mut f.state, &mut f.rng, &mut f.geometry, &mut f.clock).unwrap();

        // Translation at 100 events/s must have fired within the step.
        let enzyme_after = f.state.count(f.enzyme);
        assert!(enzyme_after > 100);
        let capacity = bridge.last_coefficients().unwrap().capacities[0];
        let expected = 2.0 * enzyme_after as f64 * count_to_mm(volume_before);
        assert!((capacity - expected).abs() <= 1e-12 * expected);
    }

    #[test]
    fn lipid_synthesis_grows_the_cell_and_dilutes_substrate() {
        let (mut f, growth) = fixture();
        let metabolic = MetabolicIntegrator::new(&f.network, &IntegratorConfig::default());
        let mut bridge = SyncBridge::new(&f.network, metabolic, growth);
        let s = f.network.lookup("S").unwrap();
        let lipid_before = f.state.count(f.lipid);
        let amount_before = f.state.concentration(s) * f.geometry.volume_l;
        let volume_before = f.geometry.volume_l;

        bridge.step(&f.network, &mut f.state, &mut f.rng, &mut f.geometry, &mut f.clock).unwrap();

        let made = f.state.count(f.lipid) - lipid_before;
        assert!(made > 0);
        assert!(f.geometry.volume_l > volume_before);
        // Substrate consumed equals lipid made, in molecules, within one rounding unit.
        let consumed = (amount_before - f.state.concentration(s) * f.geometry.volume_l) * 6.022e23 * 1e-3;
        assert!((consumed - made as f64).abs() < 1.5, "consumed {} made {}", consumed, made);
    }

    struct NeverConverges;

    impl OdeIntegrator for NeverConverges {
        fn integrate(&mut self, _: &dyn OdeSystem, _: &mut [f64], _: f64) -> Result<IntegrationStats, IntegrationFailure> {
            Err(IntegrationFailure::TooManySubsteps { limit: 1, components: vec![0] })
        }
        fn step_hint(&self) -> f64 {
            1e-3
        }
        fn set_step_hint(&mut self, _: f64) {}
    }

    #[test]
    fn failed_integration_leaves_clock_at_step_start() {
        let (mut f, growth) = fixture();
        let metabolic = MetabolicIntegrator::with_solver(&f.network, Box::new(NeverConverges), 2);
        let mut bridge = SyncBridge::new(&f.network, metabolic, growth);
        bridge.record_phases(true);

        let err = bridge.step(&f.network, &mut f.state, &mut f.rng, &mut f.geometry, &mut f.clock).unwrap_err();
        assert!(matches!(err, SimError::NumericalNonConvergence { macro_step: 0, attempts: 3, time_sec, .. } if time_sec == 0.0));
        assert_eq!(f.clock.step_index(), 0);
        assert_eq!(bridge.take_phases().last(), Some(&BridgePhase::MetabolicIntegration));
    }
}
