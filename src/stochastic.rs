//! Exact stochastic simulation of the discrete subnetwork.
//!
//! Direct-method Gillespie with incremental propensity updates: after each
//! firing only the reactions whose inputs changed are recomputed, following
//! the dependency graph built with the network. The running total is rebuilt
//! from scratch at the start of every advance and periodically within one, so
//! floating-point drift in the incremental sum stays bounded.

use crate::error::{Engine, SimError, SimResult, Violation};
use crate::network::{Propensity, RateLaw, Reaction, ReactionNetwork};
use crate::species::SpeciesState;
use log::trace;
use rand::Rng;
use rand_chacha::ChaCha12Rng;
use rand_distr::Exp1;

/// Random number generator owned by one replicate. Its position can be
/// captured and restored exactly, which checkpoints rely on.
pub type EngineRng = ChaCha12Rng;

/// Events between full propensity refreshes.
const REFRESH_EVERY: u64 = 1_000;

/// Evaluates the propensity of a discrete reaction at the given counts.
///
/// Returns exactly zero when any reactant count is below its coefficient, so
/// infeasible reactions can never be selected.
pub fn propensity(reaction: &Reaction, counts: &[u64]) -> f64 {
    let RateLaw::Discrete(law) = &reaction.law else {
        return 0.0;
    };
    for &(id, coef) in &reaction.stoichiometry.reactants {
        if counts[id.index()] < coef as u64 {
            return 0.0;
        }
    }

    match law {
        Propensity::MassAction { k } => {
            let mut a = *k;
            for &(id, coef) in &reaction.stoichiometry.reactants {
                a *= combinations(counts[id.index()], coef);
            }
            a
        }
        Propensity::Templated { k, half_saturation } => {
            let mut a = *k;
            for id in &reaction.modifiers {
                a *= counts[id.index()] as f64;
            }
            if *half_saturation > 0.0 {
                for &(id, _) in &reaction.stoichiometry.reactants {
                    let n = counts[id.index()] as f64;
                    a *= n / (half_saturation + n);
                }
            }
            a
        }
        Propensity::Cooperative { k, cooperativity, partners } => {
            let mut a = *k;
            for &(id, coef) in &reaction.stoichiometry.reactants {
                a *= combinations(counts[id.index()], coef);
            }
            let occupied: u64 = partners.iter().map(|id| counts[id.index()]).sum();
            a * (1.0 + cooperativity * occupied as f64)
        }
        Propensity::Gated { k } => *k,
    }
}

/// Number of distinct ways to pick `s` molecules out of `n`.
fn combinations(n: u64, s: u32) -> f64 {
    let mut c = 1.0;
    for i in 0..s as u64 {
        c *= (n - i) as f64 / (i + 1) as f64;
    }
    c
}

/// One fired event, recorded when event logging is enabled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FiredEvent {
    /// Offset from the start of the advance, in seconds.
    pub offset_sec: f64,
    pub reaction: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdvanceSummary {
    pub events: u64,
    /// Simulated time actually covered. Always the full budget.
    pub elapsed_sec: f64,
}

/// Propensity cache plus the event loop over it.
#[derive(Debug, Clone, Default)]
pub struct StochasticEngine {
    propensities: Vec<f64>,
    total: f64,
    since_refresh: u64,
    event_log: Option<Vec<FiredEvent>>,
}

impl StochasticEngine {
    pub fn new(network: &ReactionNetwork) -> Self {
        StochasticEngine {
            propensities: vec![0.0; network.discrete_reactions().len()],
            total: 0.0,
            since_refresh: 0,
            event_log: None,
        }
    }

    /// Keeps every fired event until [`StochasticEngine::take_events`] is called.
    pub fn record_events(&mut self, enabled: bool) {
        self.event_log = if enabled { Some(Vec::new()) } else { None };
    }

    pub fn take_events(&mut self) -> Vec<FiredEvent> {
        self.event_log.as_mut().map(std::mem::take).unwrap_or_default()
    }

    pub fn propensities(&self) -> &[f64] {
        &self.propensities
    }

    pub fn total_propensity(&self) -> f64 {
        self.total
    }

    /// Recomputes every propensity and the total from the current counts.
    pub fn refresh_all(&mut self, network: &ReactionNetwork, counts: &[u64]) {
        self.total = 0.0;
        for (slot, reaction) in self.propensities.iter_mut().zip(network.discrete_reactions()) {
            *slot = propensity(reaction, counts);
            self.total += *slot;
        }
        self.since_refresh = 0;
    }

    /// Fires discrete events for `dt` seconds of simulated time.
    ///
    /// The waiting time that would cross the end of the budget is discarded
    /// without firing; the process is memoryless, so the next advance starts
    /// cleanly at the boundary. `time_sec` is the start of the macro-step and
    /// is only used for error reporting.
    pub fn advance(
        &mut self,
        network: &ReactionNetwork,
        state: &mut SpeciesState,
        rng: &mut EngineRng,
        dt: f64,
        time_sec: f64,
    ) -> SimResult<AdvanceSummary> {
        state.require_owner(Engine::Stochastic, time_sec)?;
        self.refresh_all(network, state.counts());

        let mut t = 0.0;
        let mut events = 0u64;
        loop {
            if !(self.total > 0.0) {
                break;
            }
            let draw: f64 = rng.sample(Exp1);
            let tau = draw / self.total;
            if t + tau >= dt {
                break;
            }
            t += tau;

            let threshold = rng.random::<f64>() * self.total;
            let Some(r) = self.select(threshold) else {
                // Incremental total drifted above the real sum; rebuild and redraw.
                self.refresh_all(network, state.counts());
                continue;
            };

            fire(network, state, r, time_sec)?;
            if let Some(log) = self.event_log.as_mut() {
                log.push(FiredEvent { offset_sec: t, reaction: r as u32 });
            }
            events += 1;

            self.since_refresh += 1;
            if self.since_refresh >= REFRESH_EVERY {
                self.refresh_all(network, state.counts());
            } else {
                let counts = state.counts();
                for &dep in network.refresh_after(r) {
                    let dep = dep as usize;
                    let updated = propensity(&network.discrete_reactions()[dep], counts);
                    self.total += updated - self.propensities[dep];
                    self.propensities[dep] = updated;
                }
            }
        }

        trace!("SSA advance fired {} events over {:.3} s (t0={:.1} s)", events, dt, time_sec);
        Ok(AdvanceSummary { events, elapsed_sec: dt })
    }

    /// Picks the reaction whose cumulative propensity first exceeds `threshold`,
    /// skipping zero entries. Falls back to the last positive entry when
    /// rounding leaves the threshold above the cumulative sum.
    fn select(&self, threshold: f64) -> Option<usize> {
        let mut cumulative = 0.0;
        let mut last_positive = None;
        for (i, &a) in self.propensities.iter().enumerate() {
            if a <= 0.0 {
                continue;
            }
            cumulative += a;
            last_positive = Some(i);
            if cumulative > threshold {
                return Some(i);
            }
        }
        last_positive
    }
}

/// Applies the stoichiometry of discrete reaction `r`.
fn fire(network: &ReactionNetwork, state: &mut SpeciesState, r: usize, time_sec: f64) -> SimResult<()> {
    for &(id, delta) in network.net_changes(r) {
        let counts = state.counts_mut();
        let slot = &mut counts[id.index()];
        let updated = if delta < 0 { slot.checked_sub(delta.unsigned_abs()) } else { slot.checked_add(delta as u64) };
        match updated {
            Some(value) => *slot = value,
            None => {
                return Err(SimError::invariant(
                    time_sec,
                    Violation::NegativeCount {
                        species: network.name(id).to_string(),
                        reaction: network.discrete_reactions()[r].name.clone(),
                    },
                ))
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{NetworkBuilder, Stoichiometry};
    use crate::species::{Domain, SpeciesId};
    use rand::SeedableRng;

    fn reaction(name: &str, reactants: Vec<(SpeciesId, u32)>, products: Vec<(SpeciesId, u32)>, law: Propensity) -> Reaction {
        let k = match &law {
            Propensity::MassAction { k }
            | Propensity::Templated { k, .. }
            | Propensity::Cooperative { k, .. }
            | Propensity::Gated { k } => *k,
        };
        Reaction {
            name: name.to_string(),
            stoichiometry: Stoichiometry { reactants, products },
            modifiers: Vec::new(),
            law: RateLaw::Discrete(law),
            rate_constant: k,
            enzyme: None,
        }
    }

    fn decay_network(k: f64) -> ReactionNetwork {
        let mut b = NetworkBuilder::new();
        let a = b.species("A", Domain::Discrete, None);
        b.reaction(reaction("decay", vec![(a, 1)], vec![], Propensity::MassAction { k }));
        b.build().unwrap()
    }

    #[test]
    fn mass_action_uses_combinations() {
        let r = reaction("dimer", vec![(SpeciesId(0), 2)], vec![(SpeciesId(1), 1)], Propensity::MassAction { k: 2.0 });
        // C(10, 2) = 45
        assert_eq!(propensity(&r, &[10, 0]), 90.0);
    }

    #[test]
    fn infeasible_reaction_has_exactly_zero_propensity() {
        let r = reaction(
            "bulk",
            vec![(SpeciesId(0), 100)],
            vec![(SpeciesId(1), 1)],
            Propensity::Templated { k: 5.0, half_saturation: 0.0 },
        );
        assert_eq!(propensity(&r, &[99, 0]), 0.0);
        assert!(propensity(&r, &[100, 0]) > 0.0);

        let gated = reaction("gate", vec![(SpeciesId(0), 3)], vec![], Propensity::Gated { k: 1.0 });
        assert_eq!(propensity(&gated, &[2]), 0.0);
        assert_eq!(propensity(&gated, &[3]), 1.0);
    }

    #[test]
    fn cooperative_binding_grows_with_occupied_partners() {
        let r = reaction(
            "bind",
            vec![(SpeciesId(0), 1), (SpeciesId(1), 1)],
            vec![(SpeciesId(2), 1)],
            Propensity::Cooperative { k: 1.0, cooperativity: 2.0, partners: vec![SpeciesId(2)] },
        );
        let empty = propensity(&r, &[10, 4, 0]);
        let loaded = propensity(&r, &[10, 4, 3]);
        assert_eq!(empty, 40.0);
        assert_eq!(loaded, 40.0 * 7.0);
    }

    #[test]
    fn decay_matches_expected_mean() {
        let network = decay_network(1.0);
        let mut state = SpeciesState::new(network.species());
        state.set_count(SpeciesId(0), 1_000);
        let mut engine = StochasticEngine::new(&network);
        let mut rng = EngineRng::seed_from_u64(42);

        let summary = engine.advance(&network, &mut state, &mut rng, 1.0, 0.0).unwrap();
        let remaining = state.count(SpeciesId(0));
        // 1000 * e^-1 = 368 with a standard deviation near 15.
        assert!((300..=440).contains(&remaining), "remaining = {}", remaining);
        assert_eq!(summary.events, 1_000 - remaining);
        assert_eq!(summary.elapsed_sec, 1.0);
    }

    #[test]
    fn same_seed_reproduces_event_sequence() {
        let network = decay_network(0.3);
        let run = |seed: u64| {
            let mut state = SpeciesState::new(network.species());
            state.set_count(SpeciesId(0), 500);
            let mut engine = StochasticEngine::new(&network);
            engine.record_events(true);
            let mut rng = EngineRng::seed_from_u64(seed);
            engine.advance(&network, &mut state, &mut rng, 2.0, 0.0).unwrap();
            engine.take_events()
        };
        let first = run(7);
        assert!(!first.is_empty());
        assert_eq!(first, run(7));
        assert_ne!(first, run(8));
    }

    #[test]
    fn incremental_propensities_match_full_refresh() {
        let mut b = NetworkBuilder::new();
        let a = b.species("A", Domain::Discrete, None);
        let bb = b.species("B", Domain::Discrete, None);
        let c = b.species("C", Domain::Discrete, None);
        b.reaction(reaction("ab", vec![(a, 1), (bb, 1)], vec![(c, 1)], Propensity::MassAction { k: 0.01 }));
        b.reaction(reaction("c", vec![(c, 1)], vec![(a, 1), (bb, 1)], Propensity::MassAction { k: 0.5 }));
        let network = b.build().unwrap();

        let mut state = SpeciesState::new(network.species());
        state.set_count(a, 200);
        state.set_count(bb, 150);
        let mut engine = StochasticEngine::new(&network);
        let mut rng = EngineRng::seed_from_u64(3);
        engine.advance(&network, &mut state, &mut rng, 0.5, 0.0).unwrap();

        let incremental = engine.propensities().to_vec();
        engine.refresh_all(&network, state.counts());
        for (x, y) in incremental.iter().zip(engine.propensities()) {
            assert!((x - y).abs() <= 1e-9 * y.abs().max(1.0));
        }
        // Both reactions conserve A + C and B + C.
        assert_eq!(state.count(a) + state.count(c), 200);
        assert_eq!(state.count(bb) + state.count(c), 150);
    }

    #[test]
    fn empty_network_advances_full_budget() {
        let network = decay_network(1.0);
        let mut state = SpeciesState::new(network.species());
        let mut engine = StochasticEngine::new(&network);
        let mut rng = EngineRng::seed_from_u64(1);
        let summary = engine.advance(&network, &mut state, &mut rng, 1.0, 0.0).unwrap();
        assert_eq!(summary.events, 0);
        assert_eq!(summary.elapsed_sec, 1.0);
    }

    #[test]
    fn advancing_while_integrator_owns_duals_is_rejected() {
        let mut b = NetworkBuilder::new();
        let atp = b.species("ATP", Domain::Dual, None);
        b.reaction(reaction("use", vec![(atp, 1)], vec![], Propensity::MassAction { k: 1.0 }));
        let network = b.build().unwrap();
        let mut state = SpeciesState::new(network.species());
        state.transfer_to_continuous(1.0e-17, 0.0).unwrap();

        let mut engine = StochasticEngine::new(&network);
        let mut rng = EngineRng::seed_from_u64(1);
        let err = engine.advance(&network, &mut state, &mut rng, 1.0, 3.0).unwrap_err();
        assert!(matches!(
            err,
            SimError::InvariantViolation { violation: Violation::OwnershipConflict { .. }, time_sec } if time_sec == 3.0
        ));
    }
}
