use serde::{Deserialize, Serialize};
use anyhow::Result;
use crate::sim_params::SimParams;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Valid horizon range, in simulated minutes.
pub const HORIZON_RANGE_MIN: (f64, f64) = (1.0, 500.0);
/// Valid checkpoint interval range, in simulated minutes.
pub const INTERVAL_RANGE_MIN: (f64, f64) = (0.1, 10.0);

/// Rejected configuration values. Always the caller's fault, never retried.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("horizon_min must be within [{min}, {max}] minutes, got {value}")]
    HorizonOutOfRange { value: f64, min: f64, max: f64 },
    #[error("interval_min must be within [{min}, {max}] minutes, got {value}")]
    IntervalOutOfRange { value: f64, min: f64, max: f64 },
    #[error("macro_step_sec must be positive and finite, got {0}")]
    MacroStepOutOfRange(f64),
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
    #[error("unknown initial-condition source '{0}'")]
    UnknownSource(String),
    #[error("unknown species '{0}' in initial-condition overrides")]
    UnknownSpecies(String),
    #[error("unknown kinetic parameter '{0}' in [kinetics] overrides")]
    UnknownParameter(String),
    #[error("invalid reaction network: {0}")]
    InvalidNetwork(String),
}

// Configuration for the simulated clock
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct TimingConfig {
    /// Total simulated time, in minutes.
    pub horizon_min: f64,
    /// Checkpoint interval, in minutes.
    #[serde(default = "default_interval_min")]
    pub interval_min: f64,
    /// Synchronization step between the stochastic and deterministic engines, in seconds.
    #[serde(default = "default_macro_step_sec")]
    pub macro_step_sec: f64,
}

// Initial conditions for the simulation, loaded from config.toml
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct InitialConditions {
    /// RNG seed for the stochastic engine. Absent means a fresh random seed per run.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Name of the initial-condition source (reaction catalog + initial values).
    #[serde(default = "default_source")]
    pub source: String,
    /// Overrides of initial molecule counts for discrete (or dual) species, by name.
    #[serde(default)]
    pub counts: BTreeMap<String, u64>,
    /// Overrides of initial concentrations (mM) for continuous (or dual) species, by name.
    #[serde(default)]
    pub concentrations: BTreeMap<String, f64>,
}

// Geometry constants used by the growth model
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct CellConfig {
    #[serde(default = "default_initial_radius_nm")]
    pub initial_radius_nm: f64,
    /// Membrane area occupied by a single membrane protein.
    #[serde(default = "default_membrane_protein_area_nm2")]
    pub membrane_protein_area_nm2: f64,
    /// Headgroup area per lipid class, keyed by lipid species name.
    #[serde(default = "default_lipid_headgroup_areas")]
    pub lipid_headgroup_area_nm2: BTreeMap<String, f64>,
}

// Settings for the stiff metabolic integrator
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct IntegratorConfig {
    #[serde(default = "default_rtol")]
    pub rtol: f64,
    #[serde(default = "default_atol")]
    pub atol: f64,
    #[serde(default = "default_initial_step_sec")]
    pub initial_step_sec: f64,
    #[serde(default = "default_min_step_sec")]
    pub min_step_sec: f64,
    #[serde(default = "default_max_step_sec")]
    pub max_step_sec: f64,
    #[serde(default = "default_max_substeps")]
    pub max_substeps: u32,
    /// Retries of a failed macro-step integration, each with a reduced step size.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

// Configuration for output settings, loaded from config.toml
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct OutputConfig {
    #[serde(default = "default_base_filename")]
    pub base_filename: String,
    /// Report output format: "json", "bincode", "messagepack"
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default = "default_true")]
    pub save_reports: bool,
    #[serde(default)]
    pub save_csv: bool,
    #[serde(default)]
    pub save_checkpoints: bool,
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: String,
    /// Checkpoint format: "json" or "messagepack"
    #[serde(default = "default_checkpoint_format")]
    pub checkpoint_format: String,
}

// Main simulation configuration structure, loaded from config.toml.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub timing: TimingConfig,
    #[serde(default)]
    pub initial_conditions: InitialConditions,
    #[serde(default)]
    pub cell: CellConfig,
    /// Per-run overrides of named rate parameters.
    #[serde(default)]
    pub kinetics: BTreeMap<String, f64>,
    #[serde(default)]
    pub integrator: IntegratorConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

impl Default for TimingConfig {
    fn default() -> Self {
        TimingConfig {
            horizon_min: 125.0,
            interval_min: default_interval_min(),
            macro_step_sec: default_macro_step_sec(),
        }
    }
}

impl Default for InitialConditions {
    fn default() -> Self {
        InitialConditions {
            seed: None,
            source: default_source(),
            counts: BTreeMap::new(),
            concentrations: BTreeMap::new(),
        }
    }
}

impl Default for CellConfig {
    fn default() -> Self {
        CellConfig {
            initial_radius_nm: default_initial_radius_nm(),
            membrane_protein_area_nm2: default_membrane_protein_area_nm2(),
            lipid_headgroup_area_nm2: default_lipid_headgroup_areas(),
        }
    }
}

impl Default for IntegratorConfig {
    fn default() -> Self {
        IntegratorConfig {
            rtol: default_rtol(),
            atol: default_atol(),
            initial_step_sec: default_initial_step_sec(),
            min_step_sec: default_min_step_sec(),
            max_step_sec: default_max_step_sec(),
            max_substeps: default_max_substeps(),
            max_retries: default_max_retries(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            base_filename: default_base_filename(),
            format: None,
            save_reports: true,
            save_csv: false,
            save_checkpoints: false,
            checkpoint_dir: default_checkpoint_dir(),
            checkpoint_format: default_checkpoint_format(),
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            timing: TimingConfig::default(),
            initial_conditions: InitialConditions::default(),
            cell: CellConfig::default(),
            kinetics: BTreeMap::new(),
            integrator: IntegratorConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

impl RunConfig {
    /// Loads the run configuration from a TOML file. Range validation is
    /// left to [`RunConfig::validate`] so callers can surface it as a typed error.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();

        let config_str = std::fs::read_to_string(path_ref)
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path_ref.display(), e))?;
        let config: RunConfig = toml::from_str(&config_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse TOML from '{}': {}", path_ref.display(), e))?;

        Ok(config)
    }

    /// Convenience constructor used by callers that only care about the clock.
    pub fn with_timing(horizon_min: f64, interval_min: f64, seed: Option<u64>) -> Self {
        let mut config = RunConfig::default();
        config.timing.horizon_min = horizon_min;
        config.timing.interval_min = interval_min;
        config.initial_conditions.seed = seed;
        config
    }

    /// Checks every documented range. Called by `initialize` before any state is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let timing = &self.timing;
        let (h_min, h_max) = HORIZON_RANGE_MIN;
        if !(timing.horizon_min >= h_min && timing.horizon_min <= h_max) {
            return Err(ConfigError::HorizonOutOfRange { value: timing.horizon_min, min: h_min, max: h_max });
        }
        let (i_min, i_max) = INTERVAL_RANGE_MIN;
        if !(timing.interval_min >= i_min && timing.interval_min <= i_max) {
            return Err(ConfigError::IntervalOutOfRange { value: timing.interval_min, min: i_min, max: i_max });
        }

        // Steps that would cross an interval boundary or the horizon are truncated by the clock.
        if !(timing.macro_step_sec > 0.0 && timing.macro_step_sec.is_finite()) {
            return Err(ConfigError::MacroStepOutOfRange(timing.macro_step_sec));
        }

        if self.initial_conditions.source.trim().is_empty() {
            return Err(invalid("initial_conditions.source", "must not be empty"));
        }
        for (name, value) in &self.initial_conditions.concentrations {
            if !(value.is_finite() && *value >= 0.0) {
                return Err(invalid(&format!("initial_conditions.concentrations.{}", name), "must be a finite, non-negative concentration"));
            }
        }

        let cell = &self.cell;
        if !(cell.initial_radius_nm > 0.0) {
            return Err(invalid("cell.initial_radius_nm", "must be positive"));
        }
        if !(cell.membrane_protein_area_nm2 >= 0.0) {
            return Err(invalid("cell.membrane_protein_area_nm2", "must be non-negative"));
        }
        for (name, area) in &cell.lipid_headgroup_area_nm2 {
            if !(*area > 0.0) {
                return Err(invalid(&format!("cell.lipid_headgroup_area_nm2.{}", name), "must be positive"));
            }
        }

        for (name, value) in &self.kinetics {
            if !(value.is_finite() && *value >= 0.0) {
                return Err(invalid(&format!("kinetics.{}", name), "must be a finite, non-negative number"));
            }
        }

        let integ = &self.integrator;
        if !(integ.rtol > 0.0) || !(integ.atol > 0.0) {
            return Err(invalid("integrator", "rtol and atol must be positive"));
        }
        if !(integ.min_step_sec > 0.0) || !(integ.initial_step_sec >= integ.min_step_sec) || !(integ.max_step_sec >= integ.initial_step_sec) {
            return Err(invalid("integrator", "steps must satisfy 0 < min_step_sec <= initial_step_sec <= max_step_sec"));
        }
        if integ.max_substeps == 0 {
            return Err(invalid("integrator.max_substeps", "must be at least 1"));
        }

        match self.output.checkpoint_format.as_str() {
            "json" | "messagepack" => {}
            other => return Err(invalid("output.checkpoint_format", &format!("unsupported format '{}'", other))),
        }

        Ok(())
    }

    /// Converts the configuration into the parameters used while stepping.
    /// Assumes the configuration has been validated.
    pub fn get_sim_params(&self) -> SimParams {
        let macro_step_sec = self.timing.macro_step_sec;
        let interval_sec = self.timing.interval_min * 60.0;
        let horizon_sec = self.timing.horizon_min * 60.0;

        SimParams::new(macro_step_sec, interval_sec, horizon_sec)
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue { field: field.to_string(), reason: reason.to_string() }
}

fn default_interval_min() -> f64 {
    1.0
}

fn default_macro_step_sec() -> f64 {
    1.0
}

fn default_source() -> String {
    "minimal_cell".to_string()
}

fn default_initial_radius_nm() -> f64 {
    200.0
}

fn default_membrane_protein_area_nm2() -> f64 {
    28.0
}

fn default_lipid_headgroup_areas() -> BTreeMap<String, f64> {
    let mut areas = BTreeMap::new();
    areas.insert("lipid_pg".to_string(), 0.65);
    areas.insert("lipid_glycolipid".to_string(), 0.60);
    areas
}

fn default_rtol() -> f64 {
    1e-6
}

fn default_atol() -> f64 {
    1e-8
}

fn default_initial_step_sec() -> f64 {
    1e-3
}

fn default_min_step_sec() -> f64 {
    1e-10
}

fn default_max_step_sec() -> f64 {
    1.0
}

fn default_max_substeps() -> u32 {
    5_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_filename() -> String {
    "minimal_cell".to_string()
}

fn default_true() -> bool {
    true
}

fn default_checkpoint_dir() -> String {
    "checkpoints".to_string()
}

fn default_checkpoint_format() -> String {
    "json".to_string()
}
