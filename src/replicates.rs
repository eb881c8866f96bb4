//! Independent replicates run in parallel.
//!
//! Every replicate builds its own network, state, clock and random stream
//! from the shared configuration; nothing mutable crosses replicate
//! boundaries, so a failure is confined to that replicate's outcome.

use crate::checkpoint::{CheckpointFormat, CheckpointStore};
use crate::error::{FailureReport, SimResult};
use crate::run::CellSimulation;
use cell_common::{IntervalReport, RunConfig, RunStatus};
use indicatif::{ParallelProgressIterator, ProgressBar, ProgressStyle};
use log::{error, info};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicateOutcome {
    pub seed: u64,
    pub status: RunStatus,
    pub reports: Vec<IntervalReport>,
    pub failure: Option<FailureReport>,
}

/// Runs one replicate per seed and returns the outcomes in seed order.
///
/// When `output.save_checkpoints` is set, every interval boundary is
/// persisted under `output.checkpoint_dir`, labelled by seed.
pub fn run_replicates(config: &RunConfig, seeds: &[u64]) -> Vec<ReplicateOutcome> {
    let progress_bar = ProgressBar::new(seeds.len() as u64);
    progress_bar.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} replicates {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    progress_bar.set_message("running");

    info!("Running {} replicates on {} Rayon threads.", seeds.len(), rayon::current_num_threads());
    let outcomes: Vec<ReplicateOutcome> = seeds
        .par_iter()
        .progress_with(progress_bar.clone())
        .map(|seed| run_one(config, *seed))
        .collect();

    let failed = outcomes.iter().filter(|o| o.status == RunStatus::Failed).count();
    progress_bar.finish_with_message(format!("done ({} failed)", failed));
    outcomes
}

fn run_one(config: &RunConfig, seed: u64) -> ReplicateOutcome {
    let mut config = config.clone();
    config.initial_conditions.seed = Some(seed);

    let mut reports = Vec::new();
    match drive(config, &mut reports) {
        Ok(status) => ReplicateOutcome { seed, status, reports, failure: None },
        Err(err) => {
            error!("Replicate {} failed: {}", seed, err);
            ReplicateOutcome { seed, status: RunStatus::Failed, reports, failure: Some(err.report()) }
        }
    }
}

fn drive(config: RunConfig, reports: &mut Vec<IntervalReport>) -> SimResult<RunStatus> {
    let store = if config.output.save_checkpoints {
        let format = CheckpointFormat::parse(&config.output.checkpoint_format)?;
        Some(
            CheckpointStore::new(&config.output.checkpoint_dir, format)
                .with_label(format!("replicate_{}", config.initial_conditions.seed.unwrap_or_default())),
        )
    } else {
        None
    };

    let mut sim = CellSimulation::initialize(config)?;
    reports.push(sim.record_initial_report());
    while sim.status().is_active() {
        reports.push(sim.step_interval()?);
        if let Some(store) = &store {
            store.save(&sim.checkpoint_state())?;
        }
    }
    Ok(sim.status())
}
