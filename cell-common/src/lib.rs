pub mod config;
pub mod sim_params;
pub mod snapshot;

// Re-export key types for easier use by dependent crates
pub use config::{RunConfig, TimingConfig, InitialConditions, CellConfig, IntegratorConfig, OutputConfig, ConfigError};
pub use sim_params::{steps_to_cover, SimParams};
pub use snapshot::{IntervalReport, GrowthMetrics, ExpressionMetrics, ReplicationMetrics, RunStatus};
