//! Built-in initial-condition sources.
//!
//! A source is a reaction catalog plus initial values. The only source
//! shipped with the engine is `minimal_cell`: a fermentative core metabolism
//! whose enzyme capacities come from protein counts, per-gene expression and
//! DnaA-controlled chromosome replication.

use super::{NetworkBuilder, Propensity, RateExpression, RateLaw, Reaction, ReactionNetwork, Stoichiometry};
use crate::species::{Domain, SpeciesId};
use cell_common::ConfigError;
use std::collections::BTreeMap;

pub const MINIMAL_CELL: &str = "minimal_cell";

/// Chromosome length; termination needs this many replicated kilobases.
pub const GENOME_LENGTH_KB: u32 = 543;

/// Nucleotides per coarse-grained transcript.
pub const MRNA_NUCLEOTIDES: u32 = 100;

/// Residues per coarse-grained protein.
pub const PROTEIN_RESIDUES: u32 = 50;

/// Deoxynucleotides incorporated per replicated kilobase.
pub const DNTP_PER_KB: u32 = 100;

/// Phosphate groups carried by one molecule of the named species.
///
/// Every reaction in the `minimal_cell` catalog that does not cross the
/// membrane conserves the weighted sum of these over all species.
pub fn phosphate_groups(name: &str) -> u64 {
    match name {
        "Pi" | "G6P" | "F6P" | "DHAP" | "G3P" | "3PG" | "nmp_pool" | "lipid_pg" => 1,
        "ADP" | "FBP" => 2,
        "ATP" | "ntp_pool" | "dntp_pool" => 3,
        "replicated_kb" => DNTP_PER_KB as u64,
        "chromosomes" => DNTP_PER_KB as u64 * GENOME_LENGTH_KB as u64,
        other if other.starts_with("mRNA_") => MRNA_NUCLEOTIDES as u64,
        _ => 0,
    }
}

/// Immutable named rate parameters for one run: defaults plus `[kinetics]` overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterTable {
    values: BTreeMap<String, f64>,
}

impl ParameterTable {
    pub fn defaults() -> Self {
        let values = DEFAULT_PARAMETERS.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        ParameterTable { values }
    }

    /// Defaults with the given overrides applied. Unknown names are rejected.
    pub fn with_overrides(overrides: &BTreeMap<String, f64>) -> Result<Self, ConfigError> {
        let mut table = Self::defaults();
        for (name, value) in overrides {
            match table.values.get_mut(name) {
                Some(slot) => *slot = *value,
                None => return Err(ConfigError::UnknownParameter(name.clone())),
            }
        }
        Ok(table)
    }

    pub fn get(&self, name: &str) -> Result<f64, ConfigError> {
        self.values.get(name).copied().ok_or_else(|| ConfigError::UnknownParameter(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

const DEFAULT_PARAMETERS: &[(&str, f64)] = &[
    // Gene expression (1/s per template; half-saturation in molecules)
    ("k_transcription", 0.01),
    ("k_translation", 0.01),
    ("k_mrna_degradation", 0.0023),
    ("expression_half_saturation", 1000.0),
    // Transport
    ("kcat_glucose_uptake", 10.0),
    ("km_glucose_uptake", 0.1),
    ("glucose_external_mm", 5.0),
    ("kcat_aa_import", 0.5),
    ("km_aa_import", 0.1),
    ("aa_external_mm", 4.0),
    ("kcat_phosphate_import", 2.0),
    ("km_phosphate_import", 1.0),
    ("phosphate_external_mm", 18.0),
    ("k_lactate_export", 0.05),
    ("k_acetate_export", 0.05),
    // Glycolysis and fermentation (kcat in 1/s)
    ("kcat_hexokinase", 20.0),
    ("kcat_pgi", 100.0),
    ("keq_pgi", 0.5),
    ("kcat_pfk", 20.0),
    ("kcat_aldolase", 20.0),
    ("kcat_tpi", 200.0),
    ("keq_tpi", 1.0),
    ("kcat_gapdh", 40.0),
    ("kcat_lower_glycolysis", 40.0),
    ("kcat_ldh", 20.0),
    ("kcat_pdh", 10.0),
    ("kcat_acetate_kinase", 20.0),
    ("kcat_nadh_oxidase", 5.0),
    ("vmax_atp_maintenance", 0.1),
    // Biosynthesis
    ("kcat_aa_synthesis", 0.5),
    ("kcat_prpp_synthesis", 2.0),
    ("kcat_adenylate_kinase", 2.0),
    ("kcat_rnr", 0.3),
    ("kcat_pg_synthesis", 1.2),
    ("kcat_glycolipid_synthesis", 1.0),
    // Replication
    ("k_dnaa_bind_high", 1.0e-3),
    ("k_dnaa_unbind_high", 0.01),
    ("k_dnaa_bind_low", 3.0e-5),
    ("k_dnaa_unbind_low", 0.05),
    ("dnaa_cooperativity", 4.0),
    ("k_initiation", 0.5),
    ("k_elongation", 0.2),
    ("k_termination", 1.0),
    ("replication_half_saturation", 2000.0),
];

struct Gene {
    name: &'static str,
    initial_protein: u64,
    membrane: bool,
}

const GENES: &[Gene] = &[
    Gene { name: "ptsG", initial_protein: 100, membrane: true },
    Gene { name: "glk", initial_protein: 200, membrane: false },
    Gene { name: "pgi", initial_protein: 200, membrane: false },
    Gene { name: "pfkA", initial_protein: 200, membrane: false },
    Gene { name: "fba", initial_protein: 200, membrane: false },
    Gene { name: "tpiA", initial_protein: 200, membrane: false },
    Gene { name: "gapA", initial_protein: 200, membrane: false },
    Gene { name: "pyk", initial_protein: 200, membrane: false },
    Gene { name: "ldh", initial_protein: 200, membrane: false },
    Gene { name: "pdhA", initial_protein: 100, membrane: false },
    Gene { name: "ackA", initial_protein: 100, membrane: false },
    Gene { name: "nox", initial_protein: 100, membrane: false },
    Gene { name: "alaT", initial_protein: 100, membrane: false },
    Gene { name: "oppA", initial_protein: 50, membrane: true },
    Gene { name: "pstS", initial_protein: 50, membrane: true },
    Gene { name: "prs", initial_protein: 100, membrane: false },
    Gene { name: "adk", initial_protein: 100, membrane: false },
    Gene { name: "nrdE", initial_protein: 100, membrane: false },
    Gene { name: "pgsA", initial_protein: 100, membrane: false },
    Gene { name: "ugtP", initial_protein: 100, membrane: false },
    Gene { name: "dnaA", initial_protein: 100, membrane: false },
    Gene { name: "lmp", initial_protein: 1000, membrane: true },
];

/// Initial concentrations (mM) of metabolites.
const METABOLITES: &[(&str, Domain, f64)] = &[
    ("glucose", Domain::Continuous, 1.0),
    ("G6P", Domain::Continuous, 3.71),
    ("F6P", Domain::Continuous, 0.85),
    ("FBP", Domain::Continuous, 7.60),
    ("DHAP", Domain::Continuous, 0.64),
    ("G3P", Domain::Continuous, 0.10),
    ("3PG", Domain::Continuous, 1.10),
    ("pyruvate", Domain::Continuous, 3.37),
    ("lactate", Domain::Continuous, 0.50),
    ("acetyl_CoA", Domain::Continuous, 0.25),
    ("acetate", Domain::Continuous, 0.20),
    ("NAD", Domain::Continuous, 2.18),
    ("NADH", Domain::Continuous, 0.025),
    ("Pi", Domain::Dual, 17.82),
    ("ATP", Domain::Dual, 3.65),
    ("ADP", Domain::Dual, 0.22),
    ("amino_acids", Domain::Dual, 3.70),
    ("ntp_pool", Domain::Dual, 2.00),
    ("nmp_pool", Domain::Dual, 0.30),
    ("dntp_pool", Domain::Dual, 0.10),
];

/// Lipid classes with their share of the lipid membrane area. Initial
/// counts are derived from the initial radius.
const LIPIDS: &[(&str, f64)] = &[("lipid_pg", 0.7), ("lipid_glycolipid", 0.3)];

/// Replication machinery with initial counts.
const REPLICATION: &[(&str, u64)] = &[
    ("oric_high_free", 3),
    ("oric_high_bound", 0),
    ("oric_low_free", 8),
    ("oric_low_bound", 0),
    ("fork_slots", 3),
    ("replication_forks", 0),
    ("replicated_kb", 0),
    ("chromosomes", 1),
];

const INITIAL_MRNA: u64 = 2;

/// A reaction network plus the initial values that come with it.
#[derive(Debug, Clone)]
pub struct Catalog {
    pub network: ReactionNetwork,
    pub initial_counts: Vec<(SpeciesId, u64)>,
    /// Concentrations for continuous and dual species; dual values are
    /// converted to counts once the initial volume is known.
    pub initial_concentrations: Vec<(SpeciesId, f64)>,
    /// Lipid classes and their share of the lipid membrane area.
    pub lipids: Vec<(SpeciesId, f64)>,
    pub membrane_proteins: Vec<SpeciesId>,
    pub mrnas: Vec<SpeciesId>,
    pub proteins: Vec<SpeciesId>,
}

/// Builds the catalog named by `source` with the given parameters.
pub fn build_catalog(source: &str, params: &ParameterTable) -> Result<Catalog, ConfigError> {
    match source {
        MINIMAL_CELL => minimal_cell(params),
        other => Err(ConfigError::UnknownSource(other.to_string())),
    }
}

/// Shorthand for assembling reactions by species name.
struct Assembler {
    builder: NetworkBuilder,
}

impl Assembler {
    fn id(&self, name: &str) -> Result<SpeciesId, ConfigError> {
        self.builder
            .lookup(name)
            .ok_or_else(|| ConfigError::InvalidNetwork(format!("catalog references undeclared species '{}'", name)))
    }

    fn side(&self, entries: &[(&str, u32)]) -> Result<Vec<(SpeciesId, u32)>, ConfigError> {
        entries.iter().map(|(name, coef)| Ok((self.id(name)?, *coef))).collect()
    }

    fn discrete(
        &mut self,
        name: String,
        reactants: &[(&str, u32)],
        products: &[(&str, u32)],
        modifiers: &[&str],
        propensity: Propensity,
    ) -> Result<(), ConfigError> {
        let rate_constant = match &propensity {
            Propensity::MassAction { k }
            | Propensity::Templated { k, .. }
            | Propensity::Cooperative { k, .. }
            | Propensity::Gated { k } => *k,
        };
        let reaction = Reaction {
            name,
            stoichiometry: Stoichiometry { reactants: self.side(reactants)?, products: self.side(products)? },
            modifiers: modifiers.iter().map(|m| self.id(m)).collect::<Result<_, _>>()?,
            law: RateLaw::Discrete(propensity),
            rate_constant,
            enzyme: None,
        };
        self.builder.reaction(reaction);
        Ok(())
    }

    fn continuous(
        &mut self,
        name: &str,
        reactants: &[(&str, u32)],
        products: &[(&str, u32)],
        enzyme: Option<&str>,
        rate_constant: f64,
        expression: RateExpression,
    ) -> Result<(), ConfigError> {
        let reaction = Reaction {
            name: name.to_string(),
            stoichiometry: Stoichiometry { reactants: self.side(reactants)?, products: self.side(products)? },
            modifiers: Vec::new(),
            law: RateLaw::Continuous(expression),
            rate_constant,
            enzyme: enzyme.map(|e| self.id(e)).transpose()?,
        };
        self.builder.reaction(reaction);
        Ok(())
    }
}

fn mm(km: &[f64]) -> RateExpression {
    RateExpression::MichaelisMenten { km: km.to_vec() }
}

fn minimal_cell(p: &ParameterTable) -> Result<Catalog, ConfigError> {
    let mut a = Assembler { builder: NetworkBuilder::new() };
    let mut initial_counts = Vec::new();
    let mut initial_concentrations = Vec::new();
    let mut lipids = Vec::new();
    let mut membrane_proteins = Vec::new();
    let mut mrnas = Vec::new();
    let mut proteins = Vec::new();

    for (name, domain, value) in METABOLITES {
        let id = a.builder.species(name, *domain, Some("metabolism"));
        initial_concentrations.push((id, *value));
    }
    for (name, share) in LIPIDS {
        lipids.push((a.builder.species(name, Domain::Dual, Some("membrane")), *share));
    }
    for gene in GENES {
        let g = a.builder.species(&format!("gene_{}", gene.name), Domain::Discrete, Some("chromosome"));
        let m = a.builder.species(&format!("mRNA_{}", gene.name), Domain::Discrete, Some(gene.name));
        let origin = if gene.membrane { "membrane" } else { "cytosol" };
        let prot = a.builder.species(&format!("protein_{}", gene.name), Domain::Discrete, Some(origin));
        initial_counts.push((g, 1));
        initial_counts.push((m, INITIAL_MRNA));
        initial_counts.push((prot, gene.initial_protein));
        mrnas.push(m);
        proteins.push(prot);
        if gene.membrane {
            membrane_proteins.push(prot);
        }
    }
    for (name, count) in REPLICATION {
        let id = a.builder.species(name, Domain::Discrete, Some("replication"));
        initial_counts.push((id, *count));
    }

    add_gene_expression(&mut a, p)?;
    add_replication(&mut a, p)?;
    add_metabolism(&mut a, p)?;

    Ok(Catalog {
        network: a.builder.build()?,
        initial_counts,
        initial_concentrations,
        lipids,
        membrane_proteins,
        mrnas,
        proteins,
    })
}

fn add_gene_expression(a: &mut Assembler, p: &ParameterTable) -> Result<(), ConfigError> {
    let half = p.get("expression_half_saturation")?;
    let k_tx = p.get("k_transcription")?;
    let k_tl = p.get("k_translation")?;
    let k_deg = p.get("k_mrna_degradation")?;

    for gene in GENES {
        let g = format!("gene_{}", gene.name);
        let m = format!("mRNA_{}", gene.name);
        let prot = format!("protein_{}", gene.name);

        // Each incorporated NTP releases pyrophosphate, counted as two Pi.
        a.discrete(
            format!("transcription_{}", gene.name),
            &[("ntp_pool", MRNA_NUCLEOTIDES)],
            &[(&m, 1), ("Pi", 2 * MRNA_NUCLEOTIDES)],
            &[&g],
            Propensity::Templated { k: k_tx, half_saturation: half },
        )?;
        a.discrete(
            format!("translation_{}", gene.name),
            &[("amino_acids", PROTEIN_RESIDUES), ("ATP", 2 * PROTEIN_RESIDUES)],
            &[(&prot, 1), ("ADP", 2 * PROTEIN_RESIDUES), ("Pi", 2 * PROTEIN_RESIDUES)],
            &[&m],
            Propensity::Templated { k: k_tl, half_saturation: half },
        )?;
        a.discrete(
            format!("mrna_degradation_{}", gene.name),
            &[(&m, 1)],
            &[("nmp_pool", MRNA_NUCLEOTIDES)],
            &[],
            Propensity::MassAction { k: k_deg },
        )?;
    }
    Ok(())
}

fn add_replication(a: &mut Assembler, p: &ParameterTable) -> Result<(), ConfigError> {
    a.discrete(
        "dnaa_bind_high".into(),
        &[("protein_dnaA", 1), ("oric_high_free", 1)],
        &[("oric_high_bound", 1)],
        &[],
        Propensity::MassAction { k: p.get("k_dnaa_bind_high")? },
    )?;
    a.discrete(
        "dnaa_unbind_high".into(),
        &[("oric_high_bound", 1)],
        &[("protein_dnaA", 1), ("oric_high_free", 1)],
        &[],
        Propensity::MassAction { k: p.get("k_dnaa_unbind_high")? },
    )?;

    let partners = vec![a.id("oric_high_bound")?, a.id("oric_low_bound")?];
    a.discrete(
        "dnaa_bind_low".into(),
        &[("protein_dnaA", 1), ("oric_low_free", 1)],
        &[("oric_low_bound", 1)],
        &[],
        Propensity::Cooperative {
            k: p.get("k_dnaa_bind_low")?,
            cooperativity: p.get("dnaa_cooperativity")?,
            partners,
        },
    )?;
    a.discrete(
        "dnaa_unbind_low".into(),
        &[("oric_low_bound", 1)],
        &[("protein_dnaA", 1), ("oric_low_free", 1)],
        &[],
        Propensity::MassAction { k: p.get("k_dnaa_unbind_low")? },
    )?;

    // A fully loaded origin fires one fork and releases its DnaA.
    a.discrete(
        "replication_initiation".into(),
        &[("oric_high_bound", 3), ("oric_low_bound", 8), ("fork_slots", 1)],
        &[("oric_high_free", 3), ("oric_low_free", 8), ("replication_forks", 1), ("protein_dnaA", 11)],
        &[],
        Propensity::Gated { k: p.get("k_initiation")? },
    )?;
    a.discrete(
        "fork_elongation".into(),
        &[("dntp_pool", DNTP_PER_KB)],
        &[("replicated_kb", 1), ("Pi", 2 * DNTP_PER_KB)],
        &["replication_forks"],
        Propensity::Templated { k: p.get("k_elongation")?, half_saturation: p.get("replication_half_saturation")? },
    )?;
    a.discrete(
        "replication_termination".into(),
        &[("replication_forks", 1), ("replicated_kb", GENOME_LENGTH_KB)],
        &[("fork_slots", 1), ("chromosomes", 1)],
        &[],
        Propensity::Gated { k: p.get("k_termination")? },
    )?;
    Ok(())
}

fn add_metabolism(a: &mut Assembler, p: &ParameterTable) -> Result<(), ConfigError> {
    a.continuous(
        "glucose_uptake",
        &[],
        &[("glucose", 1)],
        Some("protein_ptsG"),
        p.get("kcat_glucose_uptake")?,
        RateExpression::Uptake { km: p.get("km_glucose_uptake")?, external_mm: p.get("glucose_external_mm")? },
    )?;
    a.continuous(
        "hexokinase",
        &[("glucose", 1), ("ATP", 1)],
        &[("G6P", 1), ("ADP", 1)],
        Some("protein_glk"),
        p.get("kcat_hexokinase")?,
        mm(&[0.1, 0.5]),
    )?;
    a.continuous(
        "phosphoglucose_isomerase",
        &[("G6P", 1)],
        &[("F6P", 1)],
        Some("protein_pgi"),
        p.get("kcat_pgi")?,
        RateExpression::ReversibleMichaelisMenten { km: 0.5, keq: p.get("keq_pgi")? },
    )?;
    a.continuous(
        "phosphofructokinase",
        &[("F6P", 1), ("ATP", 1)],
        &[("FBP", 1), ("ADP", 1)],
        Some("protein_pfkA"),
        p.get("kcat_pfk")?,
        mm(&[0.1, 0.5]),
    )?;
    a.continuous(
        "aldolase",
        &[("FBP", 1)],
        &[("DHAP", 1), ("G3P", 1)],
        Some("protein_fba"),
        p.get("kcat_aldolase")?,
        mm(&[0.5]),
    )?;
    a.continuous(
        "triose_phosphate_isomerase",
        &[("DHAP", 1)],
        &[("G3P", 1)],
        Some("protein_tpiA"),
        p.get("kcat_tpi")?,
        RateExpression::ReversibleMichaelisMenten { km: 0.5, keq: p.get("keq_tpi")? },
    )?;
    a.continuous(
        "gapdh_pgk",
        &[("G3P", 1), ("NAD", 1), ("Pi", 1), ("ADP", 1)],
        &[("3PG", 1), ("NADH", 1), ("ATP", 1)],
        Some("protein_gapA"),
        p.get("kcat_gapdh")?,
        mm(&[0.1, 0.1, 1.0, 0.1]),
    )?;
    a.continuous(
        "lower_glycolysis",
        &[("3PG", 1), ("ADP", 1)],
        &[("pyruvate", 1), ("ATP", 1)],
        Some("protein_pyk"),
        p.get("kcat_lower_glycolysis")?,
        mm(&[0.2, 0.1]),
    )?;
    a.continuous(
        "lactate_dehydrogenase",
        &[("pyruvate", 1), ("NADH", 1)],
        &[("lactate", 1), ("NAD", 1)],
        Some("protein_ldh"),
        p.get("kcat_ldh")?,
        mm(&[0.5, 0.01]),
    )?;
    a.continuous(
        "pyruvate_dehydrogenase",
        &[("pyruvate", 1), ("NAD", 1)],
        &[("acetyl_CoA", 1), ("NADH", 1)],
        Some("protein_pdhA"),
        p.get("kcat_pdh")?,
        mm(&[0.5, 0.1]),
    )?;
    a.continuous(
        "acetate_kinase",
        &[("acetyl_CoA", 1), ("ADP", 1), ("Pi", 1)],
        &[("acetate", 1), ("ATP", 1)],
        Some("protein_ackA"),
        p.get("kcat_acetate_kinase")?,
        mm(&[0.1, 0.1, 1.0]),
    )?;
    a.continuous(
        "nadh_oxidase",
        &[("NADH", 1)],
        &[("NAD", 1)],
        Some("protein_nox"),
        p.get("kcat_nadh_oxidase")?,
        mm(&[0.01]),
    )?;
    a.continuous(
        "atp_maintenance",
        &[("ATP", 1)],
        &[("ADP", 1), ("Pi", 1)],
        None,
        p.get("vmax_atp_maintenance")?,
        mm(&[0.5]),
    )?;
    a.continuous("lactate_export", &[("lactate", 1)], &[], None, p.get("k_lactate_export")?, RateExpression::MassAction)?;
    a.continuous("acetate_export", &[("acetate", 1)], &[], None, p.get("k_acetate_export")?, RateExpression::MassAction)?;

    a.continuous(
        "amino_acid_synthesis",
        &[("pyruvate", 1), ("ATP", 1), ("NADH", 1)],
        &[("amino_acids", 1), ("ADP", 1), ("Pi", 1), ("NAD", 1)],
        Some("protein_alaT"),
        p.get("kcat_aa_synthesis")?,
        mm(&[0.5, 0.5, 0.01]),
    )?;
    a.continuous(
        "amino_acid_import",
        &[],
        &[("amino_acids", 1)],
        Some("protein_oppA"),
        p.get("kcat_aa_import")?,
        RateExpression::Uptake { km: p.get("km_aa_import")?, external_mm: p.get("aa_external_mm")? },
    )?;
    a.continuous(
        "phosphate_import",
        &[],
        &[("Pi", 1)],
        Some("protein_pstS"),
        p.get("kcat_phosphate_import")?,
        RateExpression::Uptake { km: p.get("km_phosphate_import")?, external_mm: p.get("phosphate_external_mm")? },
    )?;
    a.continuous(
        "prpp_nucleotide_synthesis",
        &[("G6P", 1), ("ATP", 2)],
        &[("ntp_pool", 1), ("ADP", 2)],
        Some("protein_prs"),
        p.get("kcat_prpp_synthesis")?,
        mm(&[0.5, 0.5]),
    )?;
    a.continuous(
        "nucleotide_salvage",
        &[("nmp_pool", 1), ("ATP", 2)],
        &[("ntp_pool", 1), ("ADP", 2)],
        Some("protein_adk"),
        p.get("kcat_adenylate_kinase")?,
        mm(&[0.1, 0.5]),
    )?;
    a.continuous(
        "ribonucleotide_reduction",
        &[("ntp_pool", 1), ("NADH", 1)],
        &[("dntp_pool", 1), ("NAD", 1)],
        Some("protein_nrdE"),
        p.get("kcat_rnr")?,
        mm(&[0.5, 0.01]),
    )?;
    a.continuous(
        "phosphatidylglycerol_synthesis",
        &[("G3P", 1), ("acetyl_CoA", 2), ("ATP", 1)],
        &[("lipid_pg", 1), ("ADP", 1), ("Pi", 1)],
        Some("protein_pgsA"),
        p.get("kcat_pg_synthesis")?,
        mm(&[0.1, 0.1, 0.5]),
    )?;
    a.continuous(
        "glycolipid_synthesis",
        &[("G6P", 1), ("acetyl_CoA", 2), ("ATP", 1)],
        &[("lipid_glycolipid", 1), ("ADP", 1), ("Pi", 2)],
        Some("protein_ugtP"),
        p.get("kcat_glycolipid_synthesis")?,
        mm(&[0.1, 0.1, 0.5]),
    )?;
    Ok(())
}
