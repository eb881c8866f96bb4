use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, error, info, warn};
use rand::Rng;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;

use minimal_cell_engine::checkpoint::{CheckpointFormat, CheckpointStore};
use minimal_cell_engine::{run_replicates, CellSimulation, IntervalReport, RunConfig, RunStatus};

/// Hybrid stochastic/deterministic minimal-cell simulator.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to the run configuration.
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Number of independent replicates, each with its own seed.
    #[arg(short, long, default_value_t = 1)]
    replicates: u32,

    /// Seed override. Replicates use consecutive seeds starting here.
    #[arg(short, long)]
    seed: Option<u64>,

    /// Resume from a checkpoint file instead of starting a new run.
    #[arg(long)]
    resume: Option<PathBuf>,

    /// New horizon, in minutes, for a resumed run.
    #[arg(long, requires = "resume")]
    horizon_min: Option<f64>,
}

fn main() -> Result<()> {
    // Initialize the logger
    env_logger::init();
    let args = Args::parse();

    info!("Starting minimal cell engine...");
    info!("Using {} Rayon threads.", rayon::current_num_threads());

    if let Some(path) = &args.resume {
        let checkpoint = CheckpointStore::load(path).with_context(|| format!("loading checkpoint {}", path.display()))?;
        info!("Resuming from {} at t={:.2} min", path.display(), checkpoint.time_min());
        let sim = match args.horizon_min {
            Some(horizon) => CellSimulation::resume_with_horizon(checkpoint, horizon)?,
            None => CellSimulation::resume(checkpoint)?,
        };
        return run_single(sim);
    }

    // --- Load Configuration ---
    let mut config = RunConfig::load(&args.config)?;
    if let Some(seed) = args.seed {
        config.initial_conditions.seed = Some(seed);
    }
    config.validate().context("invalid configuration")?;

    if args.replicates <= 1 {
        let sim = CellSimulation::initialize(config)?;
        return run_single(sim);
    }

    let base_seed = config.initial_conditions.seed.unwrap_or_else(|| rand::rng().random());
    let seeds: Vec<u64> = (0..args.replicates as u64).map(|i| base_seed.wrapping_add(i)).collect();
    let start_time = Instant::now();
    let outcomes = run_replicates(&config, &seeds);
    info!("{} replicates finished in {:.3} seconds.", outcomes.len(), start_time.elapsed().as_secs_f64());

    let mut failed = 0;
    for outcome in &outcomes {
        let base = format!("{}_replicate_{}", config.output.base_filename, outcome.seed);
        if config.output.save_reports {
            save_reports(&base, config.output.format.as_deref(), &outcome.reports);
        }
        if config.output.save_csv {
            save_csv(&base, &outcome.reports)?;
        }
        match &outcome.failure {
            Some(failure) => {
                failed += 1;
                error!("Replicate {} {}: {}", outcome.seed, outcome.status, failure.message);
            }
            None => info!("Replicate {} {}", outcome.seed, outcome.status),
        }
    }
    if failed > 0 {
        anyhow::bail!("{} of {} replicates failed", failed, outcomes.len());
    }
    info!("Simulation Complete.");
    Ok(())
}

/// Steps one run interval by interval, checkpointing and writing results.
fn run_single(mut sim: CellSimulation) -> Result<()> {
    let output = sim.config().output.clone();
    let store = if output.save_checkpoints {
        let format = CheckpointFormat::parse(&output.checkpoint_format)?;
        Some(CheckpointStore::new(&output.checkpoint_dir, format).with_label(format!("seed_{}", sim.seed())))
    } else {
        None
    };
    debug!("Simulation parameters: {:#?}", sim.params());

    info!(
        "Starting simulation loop: {} intervals of {:.2} min (seed {}).",
        sim.params().interval_count(),
        sim.params().interval_sec / 60.0,
        sim.seed()
    );
    let initial = sim.record_initial_report();
    info!(
        "[{:5.1}%] t={:.2} min | V={:.4e} L | ATP/ADP {:.2} | initial state",
        initial.progress_percent, initial.time_min, initial.growth.volume_l, initial.growth.atp_adp_ratio
    );
    let start_time = Instant::now();
    let mut outcome = Ok(());
    while sim.status().is_active() {
        let interval_start = Instant::now();
        match sim.step_interval() {
            Ok(report) => {
                info!(
                    "[{:5.1}%] t={:.2} min | V={:.4e} L | ATP/ADP {:.2} | mRNA {} | protein {} | {:.2} s",
                    report.progress_percent,
                    report.time_min,
                    report.growth.volume_l,
                    report.growth.atp_adp_ratio,
                    report.expression.total_mrna,
                    report.expression.total_protein,
                    interval_start.elapsed().as_secs_f64()
                );
                if let Some(store) = &store {
                    if let Err(e) = store.save(&sim.checkpoint_state()) {
                        error!("Error writing checkpoint: {}", e);
                        outcome = Err(e);
                        break;
                    }
                }
            }
            Err(e) => {
                outcome = Err(e);
                break;
            }
        }
    }

    let total_duration = start_time.elapsed();
    info!(
        "Simulation finished with status {} in {:.3} seconds ({:.3} minutes).",
        sim.status(),
        total_duration.as_secs_f64(),
        total_duration.as_secs_f64() / 60.0
    );

    // --- Save Recorded Data ---
    let reports = sim.get_recorded_reports();
    if output.save_reports {
        save_reports(&output.base_filename, output.format.as_deref(), reports);
    } else {
        info!("Skipping saving reports as per config (save_reports is false).");
    }
    if output.save_csv {
        save_csv(&output.base_filename, reports)?;
    }

    if let Some(failure) = sim.failure() {
        warn!("Run failed at t={:?} s: {}", failure.time_sec, failure.message);
    }
    outcome?;
    if sim.status() == RunStatus::Cancelled {
        info!("Simulation cancelled.");
    } else {
        info!("Simulation Complete.");
    }
    Ok(())
}

fn save_reports(base_filename: &str, format: Option<&str>, reports: &[IntervalReport]) {
    let output_format = format.unwrap_or("json");
    match output_format {
        "json" => write_json(&format!("{}_reports.json", base_filename), reports),
        "bincode" => {
            // Binary format (compact)
            let filename = format!("{}_reports.bin", base_filename);
            match File::create(&filename) {
                Ok(file) => match bincode::serialize_into(file, reports) {
                    Ok(_) => info!("All reports saved to {} (binary format)", filename),
                    Err(e) => error!("Error serializing reports to bincode: {}", e),
                },
                Err(e) => error!("Error creating report file '{}': {}", filename, e),
            }
        }
        "messagepack" => {
            // MessagePack format (compact and cross-platform)
            let filename = format!("{}_reports.msgpack", base_filename);
            match &mut File::create(&filename) {
                Ok(file) => match rmp_serde::encode::write_named(file, reports) {
                    Ok(_) => info!("All reports saved to {} (MessagePack format)", filename),
                    Err(e) => error!("Error serializing reports to MessagePack: {}", e),
                },
                Err(e) => error!("Error creating report file '{}': {}", filename, e),
            }
        }
        _ => {
            error!("Unknown output format: {}. Using JSON instead.", output_format);
            write_json(&format!("{}_reports.json", base_filename), reports);
        }
    }
}

fn write_json(filename: &str, reports: &[IntervalReport]) {
    match File::create(filename) {
        Ok(mut file) => match serde_json::to_string(reports) {
            Ok(json_string) => {
                if let Err(e) = file.write_all(json_string.as_bytes()) {
                    error!("Error writing report JSON to file '{}': {}", filename, e);
                } else {
                    info!("All reports saved to {}", filename);
                }
            }
            Err(e) => error!("Error serializing reports to JSON: {}", e),
        },
        Err(e) => error!("Error creating report file '{}': {}", filename, e),
    }
}

/// Growth and energy time series, one row per interval boundary.
fn save_csv(base_filename: &str, reports: &[IntervalReport]) -> Result<()> {
    let filename = format!("{}_growth.csv", base_filename);
    let mut writer = csv::Writer::from_path(&filename).with_context(|| format!("creating {}", filename))?;
    writer.write_record([
        "time_min",
        "status",
        "volume_l",
        "radius_nm",
        "surface_area_nm2",
        "atp_adp_ratio",
        "nad_nadh_ratio",
        "energy_charge",
        "total_mrna",
        "total_protein",
        "active_forks",
        "replicated_kb",
        "discrete_events",
    ])?;
    for r in reports {
        writer.write_record(&[
            format!("{:.4}", r.time_min),
            r.status.to_string(),
            format!("{:.6e}", r.growth.volume_l),
            format!("{:.4}", r.growth.radius_nm),
            format!("{:.2}", r.growth.surface_area_nm2),
            format!("{:.4}", r.growth.atp_adp_ratio),
            format!("{:.4}", r.growth.nad_nadh_ratio),
            format!("{:.4}", r.growth.energy_charge),
            r.expression.total_mrna.to_string(),
            r.expression.total_protein.to_string(),
            r.replication.active_forks.to_string(),
            r.replication.replicated_kb.to_string(),
            r.discrete_events.to_string(),
        ])?;
    }
    writer.flush()?;
    info!("Growth series saved to {}", filename);
    Ok(())
}
