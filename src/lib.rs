//! Hybrid stochastic/deterministic simulation of a minimal cell.
//!
//! Gene expression and chromosome replication run as a discrete stochastic
//! reaction network; metabolism runs as a stiff ODE over concentrations. The
//! two engines are coupled only at fixed macro-step boundaries by the
//! [`bridge::SyncBridge`], and the cell volume is recomputed from membrane
//! composition after every macro-step.

pub mod bridge;
pub mod checkpoint;
pub mod clock;
pub mod error;
pub mod growth;
pub mod metabolism;
pub mod network;
pub mod replicates;
pub mod run;
pub mod species;
pub mod stochastic;

pub use checkpoint::{Checkpoint, CheckpointFormat, CheckpointStore};
pub use error::{ErrorKind, FailureReport, SimError, SimResult};
pub use replicates::{run_replicates, ReplicateOutcome};
pub use run::{CancelToken, CellSimulation};

pub use cell_common::{IntervalReport, RunConfig, RunStatus, SimParams};
