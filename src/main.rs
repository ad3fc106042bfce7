//! MORPHEVO - CLI Entry Point
//!
//! Co-evolution of articulated creatures over a shared store.

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use morphevo::checkpoint::{Checkpoint, CheckpointError};
use morphevo::config::ConfigError;
use morphevo::coordinator::{self, CoordinatorError};
use morphevo::sim::SimError;
use morphevo::store::{self, StoreError};
use morphevo::{rng, Config, Coordinator, Simulator};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

#[derive(Parser)]
#[command(name = "morphevo")]
#[command(version)]
#[command(about = "Co-evolve morphology and control networks of simulated creatures")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Store and run selection for commands that work on an existing run
#[derive(Args)]
struct RunArgs {
    /// Store URL (mem://name, file://dir or a directory)
    #[arg(long)]
    store: String,

    /// Run name
    #[arg(long)]
    run: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate default configuration file
    Init {
        /// Output path
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },

    /// Create the initial random generation in the store
    Create {
        /// Configuration file (YAML)
        #[arg(short, long, default_value = "config.yaml")]
        config: PathBuf,

        /// Store URL overriding the configuration
        #[arg(long)]
        store: Option<String>,
    },

    /// Run the master role
    Master {
        #[arg(short, long, default_value = "config.yaml")]
        config: PathBuf,

        #[arg(long)]
        store: Option<String>,
    },

    /// Run one evaluation worker
    Worker {
        #[arg(short, long, default_value = "config.yaml")]
        config: PathBuf,

        #[arg(long)]
        store: Option<String>,

        /// Name of this worker's steady-state slot
        #[arg(long)]
        host: Option<String>,
    },

    /// Create or resume a run and drive it to completion on this host
    Run {
        #[arg(short, long, default_value = "config.yaml")]
        config: PathBuf,

        #[arg(long)]
        store: Option<String>,

        /// Local worker threads (0 evaluates in-process with rayon)
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Print generation index and score history
    Status {
        #[command(flatten)]
        target: RunArgs,

        /// Also write the score history as JSON
        #[arg(long)]
        json: Option<PathBuf>,
    },

    /// Set the run's pause flag
    Pause {
        #[command(flatten)]
        target: RunArgs,
    },

    /// Clear the run's pause flag
    Resume {
        #[command(flatten)]
        target: RunArgs,
    },

    /// Re-evaluate the best individual
    Eval {
        #[command(flatten)]
        target: RunArgs,

        #[arg(short, long, default_value = "config.yaml")]
        config: PathBuf,

        /// Write the signal log to this file
        #[arg(long)]
        trace: Option<PathBuf>,
    },

    /// Write the run's current generation as a checkpoint file
    Export {
        #[command(flatten)]
        target: RunArgs,

        #[arg(short, long)]
        output: PathBuf,
    },

    /// Delete store revisions older than a timestamp
    Pack {
        #[arg(long)]
        store: String,

        /// RFC 3339 timestamp
        #[arg(long)]
        before: String,
    },
}

/// Failures grouped by exit code
#[derive(Debug)]
enum CliError {
    Config(String),
    Persistence(String),
    Evolution(String),
}

impl CliError {
    fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => 2,
            Self::Persistence(_) => 3,
            Self::Evolution(_) => 4,
        }
    }
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "Configuration error: {}", msg),
            Self::Persistence(msg) => write!(f, "Persistence error: {}", msg),
            Self::Evolution(msg) => write!(f, "Evolution error: {}", msg),
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}

impl From<StoreError> for CliError {
    fn from(e: StoreError) -> Self {
        Self::Persistence(e.to_string())
    }
}

impl From<CheckpointError> for CliError {
    fn from(e: CheckpointError) -> Self {
        Self::Persistence(e.to_string())
    }
}

impl From<std::io::Error> for CliError {
    fn from(e: std::io::Error) -> Self {
        Self::Persistence(e.to_string())
    }
}

impl From<SimError> for CliError {
    fn from(e: SimError) -> Self {
        Self::Evolution(e.to_string())
    }
}

impl From<CoordinatorError> for CliError {
    fn from(e: CoordinatorError) -> Self {
        match e {
            CoordinatorError::Evolution(_) | CoordinatorError::Thread(_) => {
                Self::Evolution(e.to_string())
            }
            _ => Self::Persistence(e.to_string()),
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            eprintln!("{}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

fn init_logging(level: &str) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

/// Load the configuration, falling back to defaults when the file is absent
fn load_config(path: &Path, store: Option<String>) -> Result<Config, CliError> {
    let mut config = if path.exists() {
        Config::from_file(path)?
    } else {
        Config::default()
    };
    if let Some(url) = store {
        config.run.store = url;
    }
    config.validate()?;
    init_logging(&config.logging.log_level);
    if path.exists() {
        log::info!("Loaded config from {:?}", path);
    } else {
        log::info!("Using default configuration");
    }
    Ok(config)
}

fn target_coordinator(target: &RunArgs, config: &mut Config) -> Result<Coordinator, CliError> {
    config.run.name = target.run.clone();
    config.run.store = target.store.clone();
    let store = store::connect(&target.store)?;
    Ok(Coordinator::new(store, config))
}

fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Commands::Init { output } => {
            init_logging("info");
            Config::default().save(&output)?;
            println!("Configuration saved to: {:?}", output);
            Ok(())
        }

        Commands::Create { config, store } => {
            let config = load_config(&config, store)?;
            let coordinator = Coordinator::new(store::connect(&config.run.store)?, &config);
            let version = coordinator.create(&config)?;
            println!("Created run '{}' at version {}", config.run.name, version);
            Ok(())
        }

        Commands::Master { config, store } => {
            let config = load_config(&config, store)?;
            let coordinator = Coordinator::new(store::connect(&config.run.store)?, &config);
            let gen = coordinator.master()?;
            print_best(&gen);
            Ok(())
        }

        Commands::Worker {
            config,
            store,
            host,
        } => {
            let config = load_config(&config, store)?;
            let host = host.unwrap_or_else(|| format!("worker-{}", std::process::id()));
            let coordinator = Coordinator::new(store::connect(&config.run.store)?, &config);
            let evaluations = coordinator.worker(&Simulator::new(&config), &host)?;
            println!("Worker '{}' finished after {} evaluations", host, evaluations);
            Ok(())
        }

        Commands::Run {
            config,
            store,
            workers,
        } => {
            let config = load_config(&config, store)?;
            let workers = workers.unwrap_or(config.coordinator.workers);
            let start = Instant::now();
            let gen = coordinator::run_threaded(
                store::connect(&config.run.store)?,
                &config,
                &Simulator::new(&config),
                workers,
            )?;
            println!();
            println!("=== Run Complete ===");
            println!("Time: {:.2}s", start.elapsed().as_secs_f64());
            println!("Generation: {}", gen.generation);
            print_best(&gen);
            Ok(())
        }

        Commands::Status { target, json } => {
            init_logging("info");
            let coordinator = target_coordinator(&target, &mut Config::default())?;
            let (version, gen) = coordinator.load()?;
            println!("=== Run '{}' (version {}) ===", target.run, version);
            println!("Generation: {} / {}", gen.generation, gen.final_generation);
            println!("GA: {:?}", gen.ga);
            println!("Individuals: {} ({} unscored)", gen.individuals.len(), gen.left_to_eval().len());
            println!("Paused: {}  Finished: {}", gen.paused, gen.finished);
            println!("Updated: {}", gen.updated_at.to_rfc3339());
            println!();
            for summary in &gen.scores.scores {
                println!("{}", summary.summary());
            }
            print_best(&gen);
            if let Some(path) = json {
                gen.scores.save_json(&path.to_string_lossy())?;
                println!("Score history: {:?}", path);
            }
            Ok(())
        }

        Commands::Pause { target } => {
            init_logging("info");
            target_coordinator(&target, &mut Config::default())?.set_paused(true)?;
            Ok(())
        }

        Commands::Resume { target } => {
            init_logging("info");
            target_coordinator(&target, &mut Config::default())?.set_paused(false)?;
            Ok(())
        }

        Commands::Eval {
            target,
            config,
            trace,
        } => {
            let mut config = load_config(&config, None)?;
            let coordinator = target_coordinator(&target, &mut config)?;
            let (_, gen) = coordinator.load()?;
            let best = gen
                .best()
                .or_else(|| gen.individuals.first())
                .ok_or_else(|| CliError::Evolution("population is empty".to_string()))?;
            let writer: Option<Box<dyn std::io::Write>> = match &trace {
                Some(path) => Some(Box::new(BufWriter::new(std::fs::File::create(path)?))),
                None => None,
            };
            let mut bpg = best.bpg.clone();
            let seed = rng::seed(gen.seed, rng::EVAL, best.id);
            let outcome = Simulator::new(&config).run(&mut bpg, seed, writer)?;
            println!("Individual {}: stored score {:?}", best.id, best.score);
            println!(
                "Re-evaluated score: {:.4} ({} ticks after {} relax ticks)",
                outcome.score, outcome.ticks, outcome.relax_ticks
            );
            if let Some(path) = trace {
                println!("Signal log: {:?}", path);
            }
            Ok(())
        }

        Commands::Export { target, output } => {
            init_logging("info");
            let coordinator = target_coordinator(&target, &mut Config::default())?;
            let (_, gen) = coordinator.load()?;
            let checkpoint = Checkpoint::new(&target.run, gen);
            checkpoint.save(&output)?;
            println!(
                "Checkpoint written to {:?} ({:.2} MB)",
                output,
                checkpoint.size_bytes() as f64 / 1_000_000.0
            );
            Ok(())
        }

        Commands::Pack { store, before } => {
            init_logging("info");
            let before: DateTime<Utc> = DateTime::parse_from_rfc3339(&before)
                .map_err(|e| CliError::Config(format!("bad timestamp '{}': {}", before, e)))?
                .with_timezone(&Utc);
            let removed = store::connect(&store)?.pack_upto(before)?;
            println!("Removed {} revisions older than {}", removed, before.to_rfc3339());
            Ok(())
        }
    }
}

fn print_best(gen: &morphevo::Generation) {
    match gen.best() {
        Some(best) => println!(
            "Best: individual {} with score {:.4} ({} parts)",
            best.id,
            best.fitness(),
            best.bpg.len()
        ),
        None => println!("Best: none scored yet"),
    }
}
