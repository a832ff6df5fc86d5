// Power analysis CLI
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use powersim::aggregate::aggregate;
use powersim::config::PowerStudyConfig;
use powersim::contrast::Cell;
use powersim::datagen::{
    empirical_sds, expected_cell_probabilities, generate, recover_random_effects,
    write_trials_csv,
};
use powersim::fit::{detect_cmdstan, write_stan_program, CmdStanModel};
use powersim::grid::{build_grid, CancelToken, GridProgress, GridRunner};
use powersim::ledger::{RunCounts, RunKind, RunLedger, RunRecord};
use powersim::results::{
    print_power_table, read_results, write_power_table_csv, write_power_table_json, ResultWriter,
};
use powersim::summary::summarize;

#[derive(Parser)]
#[command(name = "powersim")]
#[command(version = "0.1.0")]
#[command(
    about = "Simulation-based power analysis for a context x task binomial replication study",
    long_about = None
)]
struct Cli {
    /// Debug-level logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Simulate one design point and summarise it
    Explore {
        /// Study config JSON (defaults to the reference study)
        #[arg(short, long, value_name = "CONFIG")]
        config: Option<PathBuf>,

        #[arg(short = 'n', long, default_value = "40")]
        participants: usize,

        /// Trials per context x task cell
        #[arg(short, long, default_value = "100")]
        trials: usize,

        /// True interaction coefficient (log-odds)
        #[arg(short, long, default_value = "0.2")]
        effect: f64,

        #[arg(long, default_value = "1")]
        seed: u64,

        /// Also write the simulated trials to CSV
        #[arg(short, long, value_name = "OUTPUT")]
        output: Option<PathBuf>,
    },

    /// Generate a synthetic trial-level dataset
    GenerateData {
        #[arg(short, long, value_name = "CONFIG")]
        config: Option<PathBuf>,

        #[arg(short = 'n', long, default_value = "40")]
        participants: usize,

        /// Trials per context x task cell
        #[arg(short, long, default_value = "100")]
        trials: usize,

        /// True interaction coefficient (log-odds)
        #[arg(short, long, default_value = "0.2")]
        effect: f64,

        /// Random seed for reproducibility
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Output CSV file
        #[arg(short, long, value_name = "OUTPUT")]
        output: PathBuf,
    },

    /// Write the Stan program of the hierarchical model
    StanModel {
        /// Output .stan file
        #[arg(short, long, value_name = "OUTPUT")]
        output: PathBuf,
    },

    /// Run the full design grid
    Run {
        #[arg(short, long, value_name = "CONFIG")]
        config: Option<PathBuf>,

        /// Output directory for results, power tables and the compiled model
        #[arg(short, long, default_value = "power_results")]
        output_dir: PathBuf,

        /// Participant counts, comma separated
        #[arg(long, value_delimiter = ',')]
        participants: Option<Vec<usize>>,

        /// Trials per cell, comma separated
        #[arg(long, value_delimiter = ',')]
        trials: Option<Vec<usize>>,

        /// True interaction effects, comma separated
        #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
        effects: Option<Vec<f64>>,

        #[arg(long)]
        replications: Option<usize>,

        /// Evidence ratio needed for a detection
        #[arg(long)]
        threshold: Option<f64>,

        /// Concurrent model fits
        #[arg(long)]
        workers: Option<usize>,

        /// Chains run in parallel inside one fit
        #[arg(long)]
        cores_per_fit: Option<usize>,

        #[arg(long)]
        seed: Option<u64>,

        /// Pre-compiled model executable (skips cmdstan detection)
        #[arg(long, value_name = "EXE")]
        stan_exe: Option<PathBuf>,

        /// Stop dispatching new tasks after this many seconds
        #[arg(long)]
        time_limit_secs: Option<u64>,

        /// Run ledger directory (defaults to <output-dir>/ledger)
        #[arg(long)]
        ledger_dir: Option<PathBuf>,
    },

    /// Recompute the power table from a raw results CSV
    Aggregate {
        /// Raw results CSV written by `run`
        #[arg(value_name = "RESULTS")]
        input: PathBuf,

        #[arg(long, default_value = "10")]
        threshold: f64,

        /// Power table CSV
        #[arg(short, long, value_name = "OUTPUT")]
        output: Option<PathBuf>,

        /// Power table JSON
        #[arg(long, value_name = "JSON")]
        json: Option<PathBuf>,

        /// Record the re-aggregation in this ledger directory
        #[arg(long)]
        ledger_dir: Option<PathBuf>,
    },

    /// Write the reference study configuration as JSON
    InitConfig {
        #[arg(short, long, default_value = "powersim.json")]
        output: PathBuf,
    },

    /// List recent runs from a ledger
    History {
        #[arg(long, default_value = "power_results/ledger")]
        ledger_dir: PathBuf,

        #[arg(short = 'n', long, default_value = "10")]
        limit: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "powersim=debug" } else { "powersim=info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Explore {
            config,
            participants,
            trials,
            effect,
            seed,
            output,
        } => explore_command(config, participants, trials, effect, seed, output),
        Commands::GenerateData {
            config,
            participants,
            trials,
            effect,
            seed,
            output,
        } => generate_data_command(config, participants, trials, effect, seed, output),
        Commands::StanModel { output } => stan_model_command(output),
        Commands::Run {
            config,
            output_dir,
            participants,
            trials,
            effects,
            replications,
            threshold,
            workers,
            cores_per_fit,
            seed,
            stan_exe,
            time_limit_secs,
            ledger_dir,
        } => {
            let mut config = load_config(config.as_deref())?;
            let grid = &mut config.grid;
            if let Some(v) = participants {
                grid.participant_counts = v;
            }
            if let Some(v) = trials {
                grid.trial_counts = v;
            }
            if let Some(v) = effects {
                grid.effect_sizes = v;
            }
            if let Some(v) = replications {
                grid.n_replications = v;
            }
            if let Some(v) = threshold {
                grid.decision_threshold = v;
            }
            if let Some(v) = seed {
                grid.base_seed = v;
            }
            if workers.is_some() {
                config.execution.workers = workers;
            }
            if let Some(v) = cores_per_fit {
                config.execution.cores_per_fit = v;
            }
            run_command(config, output_dir, stan_exe, time_limit_secs, ledger_dir)
        }
        Commands::Aggregate {
            input,
            threshold,
            output,
            json,
            ledger_dir,
        } => aggregate_command(input, threshold, output, json, ledger_dir),
        Commands::InitConfig { output } => init_config_command(output),
        Commands::History { ledger_dir, limit } => history_command(ledger_dir, limit),
    }
}

fn load_config(path: Option<&Path>) -> Result<PowerStudyConfig> {
    let config = match path {
        Some(path) => PowerStudyConfig::from_json_file(path)?,
        None => PowerStudyConfig::default(),
    };
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn explore_command(
    config: Option<PathBuf>,
    participants: usize,
    trials: usize,
    effect: f64,
    seed: u64,
    output: Option<PathBuf>,
) -> Result<()> {
    let config = load_config(config.as_deref())?;
    let sim = &config.simulation;
    let fixed = sim.fixed_effects(effect);

    let data = generate(
        participants,
        trials,
        &fixed,
        &sim.random_effect_sds,
        &sim.correlations,
        seed,
    )
    .context("Invalid simulation parameters")?;
    let table = summarize(&data);

    println!("\n{}", "=".repeat(60));
    println!("Simulated dataset");
    println!("{}", "=".repeat(60));
    println!("Participants: {}", participants);
    println!("Trials per cell: {}", trials);
    println!("Interaction effect: {}", effect);
    println!("Seed: {}", seed);

    let observed = table.cell_rates();
    let expected = expected_cell_probabilities(&fixed);
    println!(
        "\n{:<10} {:>10} {:>10} {:>14}",
        "Cell", "Context", "Task", "Rate (exp.)"
    );
    println!("{}", "-".repeat(60));
    for cell in Cell::ALL {
        println!(
            "{:<10} {:>10.2} {:>10.2} {:>7.3} ({:.3})",
            format!("{}{}", cell.context, cell.task),
            cell.context_code(),
            cell.task_code(),
            observed[cell.index()],
            expected[cell.index()]
        );
    }

    println!(
        "\nSample interaction contrast (AB + BA) - (AA + BB): {:.4}",
        table.interaction_contrast()
    );

    let realised = empirical_sds(&recover_random_effects(&data, &fixed));
    let target = sim.random_effect_sds;
    println!("\nRandom-effect SDs (realised / configured):");
    println!("  intercept:    {:.3} / {:.3}", realised.intercept, target.intercept);
    println!("  context:      {:.3} / {:.3}", realised.context, target.context);
    println!("  task:         {:.3} / {:.3}", realised.task, target.task);
    println!("  interaction:  {:.3} / {:.3}", realised.interaction, target.interaction);

    if let Some(path) = output {
        write_trials_csv(&path, &data)?;
        println!("\n✓ Trials written to: {}", path.display());
    }

    Ok(())
}

fn generate_data_command(
    config: Option<PathBuf>,
    participants: usize,
    trials: usize,
    effect: f64,
    seed: u64,
    output: PathBuf,
) -> Result<()> {
    let config = load_config(config.as_deref())?;
    let sim = &config.simulation;

    info!(participants, trials, effect, seed, "generating synthetic dataset");
    let data = generate(
        participants,
        trials,
        &sim.fixed_effects(effect),
        &sim.random_effect_sds,
        &sim.correlations,
        seed,
    )
    .context("Invalid simulation parameters")?;

    write_trials_csv(&output, &data)?;

    println!("✓ Generated {} trials", data.len());
    println!("  Participants: {}", participants);
    println!("  Trials per cell: {}", trials);
    println!("  Output: {}", output.display());

    Ok(())
}

fn stan_model_command(output: PathBuf) -> Result<()> {
    write_stan_program(&output)?;
    println!("✓ Stan program written to: {}", output.display());
    println!("  Priors are supplied as data (prior_b_sd, prior_tau_scale, prior_lkj_eta)");
    Ok(())
}

fn run_command(
    config: PowerStudyConfig,
    output_dir: PathBuf,
    stan_exe: Option<PathBuf>,
    time_limit_secs: Option<u64>,
    ledger_dir: Option<PathBuf>,
) -> Result<()> {
    // Overrides are applied after loading, so validate again
    config.validate().context("Invalid configuration")?;

    fs::create_dir_all(&output_dir).with_context(|| {
        format!("Failed to create output directory: {}", output_dir.display())
    })?;
    let ledger = RunLedger::new(ledger_dir.unwrap_or_else(|| output_dir.join("ledger")))?;
    let mut record = RunRecord::new(RunKind::Grid).with_config(serde_json::to_value(&config)?);

    let model_dir = output_dir.join("model");
    let model = match stan_exe {
        Some(exe) => {
            CmdStanModel::from_executable(exe, model_dir.join("fits"), config.priors.clone())?
        }
        None => {
            let cmdstan_path = detect_cmdstan().context(
                "Failed to detect cmdstan. Please install cmdstan or set CMDSTAN environment variable",
            )?;
            info!(cmdstan = %cmdstan_path.display(), "found cmdstan");
            CmdStanModel::compile(&model_dir, &cmdstan_path, config.priors.clone())
                .context("Failed to compile Stan model")?
        }
    };
    info!(exe = %model.exe_path().display(), "model ready");

    let points = build_grid(&config.grid);
    let runner = GridRunner::new(
        config.simulation.clone(),
        &config.execution,
        config.compute_budget(),
        config.grid.base_seed,
    )?;

    let cancel = CancelToken::new();
    if let Some(secs) = time_limit_secs {
        cancel.cancel_after(Duration::from_secs(secs));
    }

    let results_path = output_dir.join("results.csv");
    let mut writer = ResultWriter::create(&results_path)?;
    let mut write_errors = 0usize;

    let progress = GridProgress::new();
    let run = runner.run(&points, &model, &progress, &cancel, |point, result| {
        if let Err(e) = writer.write(point, result) {
            write_errors += 1;
            warn!(%point, error = %e, "failed to persist result");
        }
    })?;

    let table = aggregate(&run.results, config.grid.decision_threshold)?;
    let power_csv = output_dir.join("power.csv");
    let power_json = output_dir.join("power.json");
    write_power_table_csv(&power_csv, &table)?;
    write_power_table_json(&power_json, &table)?;

    print_power_table(&table);

    record = record
        .with_counts(RunCounts {
            total: points.len(),
            completed: run.results.len(),
            failed: run.n_failed(),
            skipped: run.skipped,
        })
        .with_output(&results_path)
        .with_output(&power_csv)
        .with_output(&power_json);
    record.set_finished();
    ledger.log_run(&record)?;

    println!("\n✓ Results saved to: {}", output_dir.display());
    println!("  Raw results: {} ({} rows)", results_path.display(), writer.rows());
    println!("  Power table: {}", power_csv.display());
    println!("  Run id: {}", record.id);
    println!("  Elapsed: {:.1}s", run.elapsed.as_secs_f64());
    if run.skipped > 0 {
        println!(
            "\n⚠ Partial run: {} of {} tasks were not started",
            run.skipped,
            points.len()
        );
    }
    if write_errors > 0 {
        println!("\n⚠ {} results could not be written to disk", write_errors);
    }

    Ok(())
}

fn aggregate_command(
    input: PathBuf,
    threshold: f64,
    output: Option<PathBuf>,
    json: Option<PathBuf>,
    ledger_dir: Option<PathBuf>,
) -> Result<()> {
    let results = read_results(&input)?;
    info!(rows = results.len(), input = %input.display(), "loaded results");

    let table = aggregate(&results, threshold)?;
    print_power_table(&table);

    let mut record = RunRecord::new(RunKind::Reaggregate)
        .with_config(serde_json::json!({ "input": input.display().to_string(), "threshold": threshold }))
        .with_counts(RunCounts {
            total: results.len(),
            completed: results.len(),
            failed: table.total_failed,
            skipped: 0,
        });

    if let Some(path) = output {
        write_power_table_csv(&path, &table)?;
        println!("\n✓ Power table written to: {}", path.display());
        record = record.with_output(&path);
    }
    if let Some(path) = json {
        write_power_table_json(&path, &table)?;
        println!("✓ Power table JSON written to: {}", path.display());
        record = record.with_output(&path);
    }

    if let Some(dir) = ledger_dir {
        record.set_finished();
        RunLedger::new(dir)?.log_run(&record)?;
    }

    Ok(())
}

fn init_config_command(output: PathBuf) -> Result<()> {
    PowerStudyConfig::default().write_json_file(&output)?;
    println!("✓ Default configuration written to: {}", output.display());
    Ok(())
}

fn history_command(ledger_dir: PathBuf, limit: usize) -> Result<()> {
    let ledger = RunLedger::new(ledger_dir)?;
    let runs = ledger.recent_runs(limit)?;
    if runs.is_empty() {
        println!("No runs recorded in {}", ledger.root().display());
        return Ok(());
    }

    println!(
        "{:<38} {:<12} {:<20} {:>8} {:>8} {:>8}",
        "Run", "Kind", "Started", "Done", "Failed", "Skipped"
    );
    println!("{}", "-".repeat(100));
    for run in runs {
        println!(
            "{:<38} {:<12} {:<20} {:>8} {:>8} {:>8}",
            run.id.to_string(),
            run.kind.as_str(),
            run.started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            run.counts.completed,
            run.counts.failed,
            run.counts.skipped
        );
    }
    Ok(())
}
