//! Static reaction network: species catalog, reactions, and the dependency
//! graph the stochastic engine uses for incremental propensity updates.
//!
//! Reactions are immutable once the network is built. The only values that
//! change between macro-steps are the enzyme-derived capacities of continuous
//! reactions, which live outside the network (see [`crate::metabolism::Coefficients`]).

pub mod catalog;

use crate::species::{Domain, Species, SpeciesId, Unit};
use cell_common::ConfigError;
use std::collections::HashMap;

pub use catalog::{build_catalog, Catalog, ParameterTable};

/// Species → integer coefficient, for both sides of a reaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Stoichiometry {
    pub reactants: Vec<(SpeciesId, u32)>,
    pub products: Vec<(SpeciesId, u32)>,
}

impl Stoichiometry {
    /// Net change per species, with zero-net entries removed.
    pub fn net_changes(&self) -> Vec<(SpeciesId, i64)> {
        let mut net: Vec<(SpeciesId, i64)> = Vec::new();
        let mut add = |id: SpeciesId, delta: i64| match net.iter_mut().find(|(s, _)| *s == id) {
            Some(entry) => entry.1 += delta,
            None => net.push((id, delta)),
        };
        for &(id, coef) in &self.reactants {
            add(id, -(coef as i64));
        }
        for &(id, coef) in &self.products {
            add(id, coef as i64);
        }
        net.retain(|(_, d)| *d != 0);
        net
    }
}

/// Propensity functions for discrete-event reactions. Every propensity is
/// multiplied by a feasibility guard: it is exactly zero unless each reactant
/// count covers its stoichiometric coefficient.
#[derive(Debug, Clone, PartialEq)]
pub enum Propensity {
    /// `k · Π C(n_i, s_i)`, the combinatorial CME mass-action form.
    MassAction { k: f64 },
    /// `k · Π modifiers · Π n_i / (K + n_i)`: a template (gene, mRNA, fork)
    /// processed at rate `k`, saturating in the bulk substrates it consumes.
    Templated { k: f64, half_saturation: f64 },
    /// Mass action scaled by `1 + c · Σ partners`, for binding that gets
    /// easier as neighbouring sites fill.
    Cooperative { k: f64, cooperativity: f64, partners: Vec<SpeciesId> },
    /// Constant rate `k` whenever the feasibility guard passes.
    Gated { k: f64 },
}

/// Rate expressions for continuous reactions, in mM/s. The capacity of each
/// reaction (kcat times enzyme concentration, or a fixed Vmax) is supplied
/// separately every macro-step.
#[derive(Debug, Clone, PartialEq)]
pub enum RateExpression {
    /// `capacity · Π S_i^s_i`
    MassAction,
    /// `capacity · Π S_i / (Km_i + S_i)` over the distinct reactants.
    MichaelisMenten { km: Vec<f64> },
    /// `capacity · (S - P/Keq) / (Km + S)` for a single substrate/product pair.
    ReversibleMichaelisMenten { km: f64, keq: f64 },
    /// Facilitated transport of the single product against a fixed external
    /// concentration X: `capacity · (X - S) / (Km + X + S)`. Runs backwards
    /// once the inside concentration S exceeds X.
    Uptake { km: f64, external_mm: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RateLaw {
    Discrete(Propensity),
    Continuous(RateExpression),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionKind {
    DiscreteEvent,
    ContinuousRate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reaction {
    pub name: String,
    pub stoichiometry: Stoichiometry,
    /// Species read by the rate law but not consumed (templates, enzymes).
    pub modifiers: Vec<SpeciesId>,
    pub law: RateLaw,
    /// Rate constant: `k` for mass action, kcat (1/s) with an enzyme, Vmax (mM/s) without.
    pub rate_constant: f64,
    /// Enzyme whose concentration scales a continuous reaction's capacity.
    pub enzyme: Option<SpeciesId>,
}

impl Reaction {
    pub fn kind(&self) -> ReactionKind {
        match self.law {
            RateLaw::Discrete(_) => ReactionKind::DiscreteEvent,
            RateLaw::Continuous(_) => ReactionKind::ContinuousRate,
        }
    }

    /// Species whose values feed this reaction's rate.
    pub fn rate_inputs(&self) -> Vec<SpeciesId> {
        let mut inputs: Vec<SpeciesId> = self.stoichiometry.reactants.iter().map(|(id, _)| *id).collect();
        inputs.extend(self.modifiers.iter().copied());
        if let RateLaw::Discrete(Propensity::Cooperative { partners, .. }) = &self.law {
            inputs.extend(partners.iter().copied());
        }
        if let Some(enzyme) = self.enzyme {
            inputs.push(enzyme);
        }
        inputs.sort_unstable();
        inputs.dedup();
        inputs
    }
}

/// The immutable network for one run.
#[derive(Debug, Clone)]
pub struct ReactionNetwork {
    species: Vec<Species>,
    by_name: HashMap<String, SpeciesId>,
    discrete: Vec<Reaction>,
    continuous: Vec<Reaction>,
    /// For each discrete reaction, the reactions to refresh after it fires.
    refresh_after: Vec<Vec<u32>>,
    /// For each discrete reaction, its net change per species.
    net_changes: Vec<Vec<(SpeciesId, i64)>>,
}

impl ReactionNetwork {
    pub fn species(&self) -> &[Species] {
        &self.species
    }

    pub fn species_count(&self) -> usize {
        self.species.len()
    }

    pub fn lookup(&self, name: &str) -> Option<SpeciesId> {
        self.by_name.get(name).copied()
    }

    pub fn name(&self, id: SpeciesId) -> &str {
        &self.species[id.index()].name
    }

    pub fn discrete_reactions(&self) -> &[Reaction] {
        &self.discrete
    }

    pub fn continuous_reactions(&self) -> &[Reaction] {
        &self.continuous
    }

    #[inline]
    pub fn refresh_after(&self, reaction: usize) -> &[u32] {
        &self.refresh_after[reaction]
    }

    #[inline]
    pub fn net_changes(&self, reaction: usize) -> &[(SpeciesId, i64)] {
        &self.net_changes[reaction]
    }

    /// Species integrated by the metabolic ODE system, in id order.
    pub fn ode_species(&self) -> Vec<SpeciesId> {
        self.species.iter().filter(|s| s.domain.has_concentration()).map(|s| s.id).collect()
    }
}

/// Incrementally assembles a [`ReactionNetwork`], checking domain rules at `build`.
#[derive(Debug, Default)]
pub struct NetworkBuilder {
    species: Vec<Species>,
    by_name: HashMap<String, SpeciesId>,
    reactions: Vec<Reaction>,
}

impl NetworkBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a species, returning the existing id if the name is already known.
    pub fn species(&mut self, name: &str, domain: Domain, origin: Option<&str>) -> SpeciesId {
        if let Some(id) = self.by_name.get(name) {
            return *id;
        }
        let id = SpeciesId(self.species.len() as u32);
        let unit = match domain {
            Domain::Continuous => Unit::Millimolar,
            Domain::Discrete | Domain::Dual => Unit::Molecules,
        };
        self.species.push(Species {
            id,
            name: name.to_string(),
            domain,
            unit,
            origin: origin.map(str::to_string),
        });
        self.by_name.insert(name.to_string(), id);
        id
    }

    pub fn lookup(&self, name: &str) -> Option<SpeciesId> {
        self.by_name.get(name).copied()
    }

    pub fn reaction(&mut self, reaction: Reaction) -> &mut Self {
        self.reactions.push(reaction);
        self
    }

    pub fn build(self) -> Result<ReactionNetwork, ConfigError> {
        let NetworkBuilder { species, by_name, reactions } = self;
        let n = species.len();

        let mut discrete = Vec::new();
        let mut continuous = Vec::new();
        for reaction in reactions {
            check_reaction(&reaction, &species)?;
            match reaction.kind() {
                ReactionKind::DiscreteEvent => discrete.push(reaction),
                ReactionKind::ContinuousRate => continuous.push(reaction),
            }
        }

        // For each species, the discrete reactions whose propensity reads it.
        let mut dependents: Vec<Vec<u32>> = vec![Vec::new(); n];
        for (r, reaction) in discrete.iter().enumerate() {
            for id in reaction.rate_inputs() {
                dependents[id.index()].push(r as u32);
            }
        }

        let net_changes: Vec<Vec<(SpeciesId, i64)>> =
            discrete.iter().map(|r| r.stoichiometry.net_changes()).collect();

        let refresh_after = net_changes
            .iter()
            .map(|changes| {
                let mut affected: Vec<u32> = changes
                    .iter()
                    .flat_map(|(id, _)| dependents[id.index()].iter().copied())
                    .collect();
                affected.sort_unstable();
                affected.dedup();
                affected
            })
            .collect();

        Ok(ReactionNetwork {
            species,
            by_name,
            discrete,
            continuous,
            refresh_after,
            net_changes,
        })
    }
}

fn check_reaction(reaction: &Reaction, species: &[Species]) -> Result<(), ConfigError> {
    let fail = |msg: String| Err(ConfigError::InvalidNetwork(format!("reaction '{}': {}", reaction.name, msg)));

    if !(reaction.rate_constant.is_finite() && reaction.rate_constant >= 0.0) {
        return fail(format!("rate constant {} must be finite and non-negative", reaction.rate_constant));
    }

    let participants = reaction
        .stoichiometry
        .reactants
        .iter()
        .chain(reaction.stoichiometry.products.iter())
        .map(|(id, _)| *id);
    let kind = reaction.kind();
    for id in participants.chain(reaction.modifiers.iter().copied()) {
        let Some(s) = species.get(id.index()) else {
            return fail(format!("unknown species {}", id));
        };
        let allowed = match kind {
            ReactionKind::DiscreteEvent => s.domain.has_count(),
            ReactionKind::ContinuousRate => s.domain.has_concentration(),
        };
        if !allowed {
            return fail(format!("species '{}' ({:?}) cannot take part in a {:?} reaction", s.name, s.domain, kind));
        }
    }

    if let Some(enzyme) = reaction.enzyme {
        match species.get(enzyme.index()) {
            Some(s) if s.domain.has_count() => {}
            Some(s) => return fail(format!("enzyme '{}' must be a counted species", s.name)),
            None => return fail(format!("unknown enzyme {}", enzyme)),
        }
        if kind == ReactionKind::DiscreteEvent {
            return fail("discrete reactions take templates as modifiers, not enzymes".to_string());
        }
    }

    match &reaction.law {
        RateLaw::Continuous(RateExpression::MichaelisMenten { km }) => {
            if km.len() != reaction.stoichiometry.reactants.len() {
                return fail(format!("expected {} Km values, got {}", reaction.stoichiometry.reactants.len(), km.len()));
            }
            if km.iter().any(|k| !(*k > 0.0)) {
                return fail("Km values must be positive".to_string());
            }
        }
        RateLaw::Continuous(RateExpression::ReversibleMichaelisMenten { km, keq }) => {
            if reaction.stoichiometry.reactants.len() != 1 || reaction.stoichiometry.products.len() != 1 {
                return fail("reversible Michaelis-Menten needs one substrate and one product".to_string());
            }
            if !(*km > 0.0) || !(*keq > 0.0) {
                return fail("Km and Keq must be positive".to_string());
            }
        }
        RateLaw::Continuous(RateExpression::Uptake { km, external_mm }) => {
            if !(*km > 0.0) || !(*external_mm >= 0.0) {
                return fail("uptake needs positive Km and non-negative external concentration".to_string());
            }
            if !reaction.stoichiometry.reactants.is_empty() || reaction.stoichiometry.products.len() != 1 {
                return fail("uptake takes no reactants and exactly one product".to_string());
            }
        }
        RateLaw::Discrete(Propensity::Templated { half_saturation, .. }) if !(*half_saturation >= 0.0) => {
            return fail("half-saturation must be non-negative".to_string());
        }
        _ => {}
    }

    Ok(())
}
