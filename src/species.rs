//! Shared species state for both engines.
//!
//! Discrete species live as molecule counts, continuous species as
//! concentrations (mM). Dual species are authoritative in exactly one of the
//! two representations at any instant: counts while the stochastic engine owns
//! them, concentrations while the deterministic integrator owns them. Ownership
//! only moves through [`SpeciesState::transfer_to_continuous`] and
//! [`SpeciesState::transfer_to_discrete`], which the bridge calls at
//! macro-step boundaries.

use crate::error::{Engine, SimError, SimResult, Violation};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Avogadro's number, molecules per mole.
pub const AVOGADRO: f64 = 6.022e23;

/// Stable index of a species within its reaction network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SpeciesId(pub u32);

impl SpeciesId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SpeciesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Discrete,
    Continuous,
    Dual,
}

impl Domain {
    pub fn has_count(self) -> bool {
        matches!(self, Domain::Discrete | Domain::Dual)
    }

    pub fn has_concentration(self) -> bool {
        matches!(self, Domain::Continuous | Domain::Dual)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Unit {
    Molecules,
    Millimolar,
}

/// Static description of a tracked species.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Species {
    pub id: SpeciesId,
    pub name: String,
    pub domain: Domain,
    pub unit: Unit,
    /// Where the species comes from (gene locus, pathway). Diagnostics only.
    pub origin: Option<String>,
}

/// Millimolar concentration of a single molecule in a volume of `volume_l` litres.
#[inline]
pub fn count_to_mm(volume_l: f64) -> f64 {
    1.0e3 / (AVOGADRO * volume_l)
}

/// Molecules per millimolar in a volume of `volume_l` litres.
#[inline]
pub fn mm_to_count(volume_l: f64) -> f64 {
    AVOGADRO * volume_l * 1.0e-3
}

/// Mutable values of every species, indexed by [`SpeciesId`].
#[derive(Debug, Clone, PartialEq)]
pub struct SpeciesState {
    domains: Vec<Domain>,
    counts: Vec<u64>,
    concentrations: Vec<f64>,
    /// Concentrations of dual species at the last handoff to the integrator.
    handoff_mm: Vec<f64>,
    /// Carried rounding remainder per dual species, always within [-0.5, 0.5].
    remainders: Vec<f64>,
    owner: Engine,
    version: u64,
}

impl SpeciesState {
    /// Creates a zeroed state with the stochastic engine owning dual species.
    pub fn new(species: &[Species]) -> Self {
        let n = species.len();
        SpeciesState {
            domains: species.iter().map(|s| s.domain).collect(),
            counts: vec![0; n],
            concentrations: vec![0.0; n],
            handoff_mm: vec![0.0; n],
            remainders: vec![0.0; n],
            owner: Engine::Stochastic,
            version: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    pub fn domain(&self, id: SpeciesId) -> Domain {
        self.domains[id.index()]
    }

    /// Engine currently holding dual species.
    pub fn owner(&self) -> Engine {
        self.owner
    }

    /// Number of ownership handoffs since the state was created.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Fails unless `engine` currently owns dual species.
    pub fn require_owner(&self, engine: Engine, time_sec: f64) -> SimResult<()> {
        if self.owner != engine {
            return Err(SimError::invariant(
                time_sec,
                Violation::OwnershipConflict { owner: self.owner, attempted: engine },
            ));
        }
        Ok(())
    }

    /// Molecule count of a discrete or dual species.
    #[inline]
    pub fn count(&self, id: SpeciesId) -> u64 {
        self.counts[id.index()]
    }

    /// Concentration (mM) of a continuous or dual species.
    #[inline]
    pub fn concentration(&self, id: SpeciesId) -> f64 {
        self.concentrations[id.index()]
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    pub fn concentrations(&self) -> &[f64] {
        &self.concentrations
    }

    pub fn remainders(&self) -> &[f64] {
        &self.remainders
    }

    pub(crate) fn counts_mut(&mut self) -> &mut [u64] {
        &mut self.counts
    }

    pub(crate) fn concentrations_mut(&mut self) -> &mut [f64] {
        &mut self.concentrations
    }

    pub fn set_count(&mut self, id: SpeciesId, value: u64) {
        self.counts[id.index()] = value;
    }

    pub fn set_concentration(&mut self, id: SpeciesId, value_mm: f64) {
        self.concentrations[id.index()] = value_mm;
    }

    /// Concentration of any species, converting counts through the given volume.
    pub fn concentration_mm(&self, id: SpeciesId, volume_l: f64) -> f64 {
        match self.domain(id) {
            Domain::Continuous => self.concentration(id),
            Domain::Discrete => self.count(id) as f64 * count_to_mm(volume_l),
            Domain::Dual => match self.owner {
                Engine::Stochastic => self.count(id) as f64 * count_to_mm(volume_l),
                Engine::Deterministic => self.concentration(id),
            },
        }
    }

    /// Hands dual species to the integrator, converting counts to mM in `volume_l`.
    pub fn transfer_to_continuous(&mut self, volume_l: f64, time_sec: f64) -> SimResult<()> {
        self.require_owner(Engine::Stochastic, time_sec)?;
        let factor = count_to_mm(volume_l);
        for i in 0..self.domains.len() {
            if self.domains[i] == Domain::Dual {
                let value = self.counts[i] as f64 * factor;
                self.concentrations[i] = value;
                self.handoff_mm[i] = value;
            }
        }
        self.owner = Engine::Deterministic;
        self.version += 1;
        Ok(())
    }

    /// Hands dual species back to the stochastic engine.
    ///
    /// The integrator's change since the handoff is converted to molecules and
    /// rounded to the nearest integer; the rounding error is carried into the
    /// next handoff so totals do not drift over thousands of macro-steps.
    pub fn transfer_to_discrete(&mut self, volume_l: f64, time_sec: f64, names: &[Species]) -> SimResult<()> {
        self.require_owner(Engine::Deterministic, time_sec)?;
        let factor = mm_to_count(volume_l);
        for i in 0..self.domains.len() {
            if self.domains[i] != Domain::Dual {
                continue;
            }
            let delta = (self.concentrations[i] - self.handoff_mm[i]) * factor;
            let exact = self.counts[i] as f64 + delta + self.remainders[i];
            let rounded = exact.round();
            if rounded < 0.0 {
                return Err(SimError::invariant(
                    time_sec,
                    Violation::NegativeConcentration {
                        species: names[i].name.clone(),
                        value_mm: self.concentrations[i],
                    },
                ));
            }
            self.remainders[i] = exact - rounded;
            self.counts[i] = rounded as u64;
        }
        self.owner = Engine::Stochastic;
        self.version += 1;
        Ok(())
    }

    /// Rescales continuous-only concentrations so molecule amounts are kept
    /// when the volume changes. Dual species are stored as counts here and
    /// need no adjustment.
    pub fn dilute(&mut self, previous_volume_l: f64, new_volume_l: f64) {
        if previous_volume_l == new_volume_l {
            return;
        }
        let ratio = previous_volume_l / new_volume_l;
        for (domain, value) in self.domains.iter().zip(self.concentrations.iter_mut()) {
            if *domain == Domain::Continuous {
                *value *= ratio;
            }
        }
    }

    /// Restores values captured in a checkpoint. Dual species are owned by the
    /// stochastic engine at every checkpoint boundary.
    pub(crate) fn restore(&mut self, counts: Vec<u64>, concentrations: Vec<f64>, remainders: Vec<f64>, version: u64) {
        self.counts = counts;
        self.concentrations = concentrations;
        self.remainders = remainders;
        self.handoff_mm = vec![0.0; self.domains.len()];
        self.owner = Engine::Stochastic;
        self.version = version;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn species(domains: &[Domain]) -> Vec<Species> {
        domains
            .iter()
            .enumerate()
            .map(|(i, d)| Species {
                id: SpeciesId(i as u32),
                name: format!("s{}", i),
                domain: *d,
                unit: if d.has_count() { Unit::Molecules } else { Unit::Millimolar },
                origin: None,
            })
            .collect()
    }

    #[test]
    fn unit_conversions_are_inverse() {
        let volume = 3.35e-17;
        let product = count_to_mm(volume) * mm_to_count(volume);
        assert!((product - 1.0).abs() < 1e-12);
    }

    #[test]
    fn handoff_round_trip_without_change_keeps_counts() {
        let list = species(&[Domain::Dual, Domain::Continuous]);
        let mut state = SpeciesState::new(&list);
        state.set_count(SpeciesId(0), 73_000);
        state.set_concentration(SpeciesId(1), 1.5);

        state.transfer_to_continuous(3.35e-17, 0.0).unwrap();
        assert_eq!(state.owner(), Engine::Deterministic);
        state.transfer_to_discrete(3.35e-17, 0.0, &list).unwrap();

        assert_eq!(state.count(SpeciesId(0)), 73_000);
        assert_eq!(state.owner(), Engine::Stochastic);
        assert_eq!(state.version(), 2);
    }

    #[test]
    fn carried_remainder_prevents_drift() {
        let list = species(&[Domain::Dual]);
        let mut state = SpeciesState::new(&list);
        state.set_count(SpeciesId(0), 1_000);
        let volume = 1.0e-17;
        let per_molecule = count_to_mm(volume);

        // Each handoff adds 0.4 molecules; naive rounding would never move.
        for _ in 0..10 {
            state.transfer_to_continuous(volume, 0.0).unwrap();
            let c = state.concentration(SpeciesId(0));
            state.set_concentration(SpeciesId(0), c + 0.4 * per_molecule);
            state.transfer_to_discrete(volume, 0.0, &list).unwrap();
            assert!(state.remainders()[0].abs() <= 0.5 + 1e-9);
        }
        assert_eq!(state.count(SpeciesId(0)), 1_004);
    }

    #[test]
    fn transfers_require_current_owner() {
        let list = species(&[Domain::Dual]);
        let mut state = SpeciesState::new(&list);
        let err = state.transfer_to_discrete(1.0e-17, 12.0, &list).unwrap_err();
        assert!(matches!(
            err,
            SimError::InvariantViolation {
                violation: Violation::OwnershipConflict { owner: Engine::Stochastic, attempted: Engine::Deterministic },
                ..
            }
        ));
    }

    #[test]
    fn negative_rounded_count_is_fatal() {
        let list = species(&[Domain::Dual]);
        let mut state = SpeciesState::new(&list);
        state.set_count(SpeciesId(0), 2);
        state.transfer_to_continuous(1.0e-17, 0.0).unwrap();
        state.set_concentration(SpeciesId(0), -1.0);
        let err = state.transfer_to_discrete(1.0e-17, 5.0, &list).unwrap_err();
        assert_eq!(err.time_sec(), Some(5.0));
    }

    #[test]
    fn dilution_preserves_continuous_amounts() {
        let list = species(&[Domain::Continuous, Domain::Discrete]);
        let mut state = SpeciesState::new(&list);
        state.set_concentration(SpeciesId(0), 2.0);
        state.set_count(SpeciesId(1), 10);
        state.dilute(1.0e-17, 2.0e-17);
        assert!((state.concentration(SpeciesId(0)) - 1.0).abs() < 1e-12);
        assert_eq!(state.count(SpeciesId(1)), 10);
    }
}
