use serde::{Serialize, Deserialize};
use std::collections::BTreeMap;
use std::fmt;

/// Lifecycle of a single replicate run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl RunStatus {
    /// Whether the run can still be stepped.
    pub fn is_active(self) -> bool {
        matches!(self, RunStatus::Pending | RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Cell geometry and energy state at a report boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrowthMetrics {
    pub volume_l: f64,
    pub radius_nm: f64,
    pub surface_area_nm2: f64,
    pub atp_adp_ratio: f64,
    pub nad_nadh_ratio: f64,
    /// Adenylate energy charge, (ATP + ADP/2) / (ATP + ADP).
    pub energy_charge: f64,
}

/// Totals over the gene-expression subnetwork.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExpressionMetrics {
    pub total_mrna: u64,
    pub total_protein: u64,
}

/// Replication machinery occupancy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplicationMetrics {
    pub active_forks: u64,
    pub completed_chromosomes: u64,
    pub replicated_kb: u64,
    pub bound_high_affinity_sites: u64,
    pub bound_low_affinity_sites: u64,
}

/// A snapshot of the simulation state and metrics at a checkpoint-interval boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntervalReport {
    /// Simulated time at the boundary, in minutes.
    pub time_min: f64,
    /// Number of macro-steps completed since the start of the run.
    pub macro_steps: u64,
    pub status: RunStatus,
    /// Completion relative to the horizon, 0-100.
    pub progress_percent: f64,
    /// Discrete events fired during the interval that produced this report.
    pub discrete_events: u64,
    /// Concentrations (mM) of every continuous and dual species.
    pub metabolites: BTreeMap<String, f64>,
    /// Continuous reaction rates (mM/s) evaluated at the boundary.
    pub fluxes: BTreeMap<String, f64>,
    pub growth: GrowthMetrics,
    pub expression: ExpressionMetrics,
    pub replication: ReplicationMetrics,
}
