use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};
use crossbeam_channel::unbounded;
use log::{error, info, warn};

use erdsim::core::cancel::CancellationToken;
use erdsim::core::config::{EngineConfig, StrategyKind};
use erdsim::core::domain::OptimizationType;
use erdsim::engine::external::espe::GetEspe;
use erdsim::engine::external::mcerd::McerdBackend;
use erdsim::engine::supervisor::{RunOutcome, SimulationSupervisor, StartOptions};
use erdsim::interface::monitor::Monitor;
use erdsim::solvers::base::Optimizer;
use erdsim::solvers::OptimizationState;

// --- CLI Definitions ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Simulate,
    Optimize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Strategy {
    Genetic,
    Gradient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Target {
    Recoil,
    Fluence,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Runs and optimizes MCERD recoil simulations", long_about = None)]
struct Args {
    /// JSON configuration holding the job, tools and parameters
    #[arg(short, long)]
    config: PathBuf,

    /// What to do with the job
    #[arg(short, long, value_enum, default_value_t = Mode::Simulate)]
    mode: Mode,

    /// Number of simulator processes (overrides the config)
    #[arg(short, long)]
    processes: Option<usize>,

    /// First seed (overrides the config)
    #[arg(short, long)]
    seed: Option<u64>,

    /// Measured spectrum to fit against
    #[arg(long)]
    measured: Option<PathBuf>,

    /// Search strategy for optimization
    #[arg(long, value_enum)]
    strategy: Option<Strategy>,

    /// Quantity to optimize
    #[arg(long, value_enum)]
    target: Option<Target>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

// --- Initialization Helpers ---

fn setup_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .init();
}

fn load_config(args: &Args) -> Result<EngineConfig> {
    let mut cfg = EngineConfig::from_file(&args.config)?;

    if let Some(n) = args.processes {
        cfg.supervisor.process_count = n.max(1);
        cfg.optimization.number_of_processes = n.max(1);
    }
    if let Some(seed) = args.seed {
        cfg.supervisor.seed = seed;
    }
    if let Some(path) = &args.measured {
        cfg.optimization.measured_spectrum = Some(path.clone());
    }
    if let Some(strategy) = args.strategy {
        cfg.optimization.strategy = match strategy {
            Strategy::Genetic => StrategyKind::Genetic,
            Strategy::Gradient => StrategyKind::Gradient,
        };
    }
    if let Some(target) = args.target {
        cfg.optimization.optimization_type = match target {
            Target::Recoil => OptimizationType::Recoil,
            Target::Fluence => OptimizationType::Fluence,
        };
    }
    Ok(cfg)
}

fn check_dependencies(cfg: &EngineConfig) -> Result<()> {
    // MCERD prints its usage and exits when run without arguments.
    match Command::new(&cfg.simulator.mcerd).output() {
        Ok(_) => Ok(()),
        Err(_) => Err(anyhow!(
            "Dependency Check Failed: '{}' could not be executed.\n\
             Simulations require the MCERD executable.\n\
             Install it or set simulator.mcerd in the config.",
            cfg.simulator.mcerd.display()
        )),
    }
}

fn build_supervisor(cfg: &EngineConfig) -> Result<SimulationSupervisor> {
    let backend = Arc::new(McerdBackend::new(&cfg.simulator.mcerd));
    let reconstructor = Arc::new(GetEspe::new(&cfg.simulator.get_espe));
    SimulationSupervisor::new(cfg.job.clone(), backend, reconstructor)
        .context("Failed to set up the simulation job")
}

// --- Modes ---

fn simulate(cfg: &EngineConfig, supervisor: &SimulationSupervisor) -> Result<()> {
    let mut monitor = Monitor::new();
    let mut run = supervisor
        .start(StartOptions::from(&cfg.supervisor))
        .map_err(|e| anyhow!("Simulation was not started: {}", e))?;
    info!("Simulation started from seed {}", run.first_seed());

    for event in run.by_ref() {
        monitor.handle_simulation_event(event);
    }
    let summary = run.wait();

    info!(
        "Simulation ended ({:?}) after {:.1}s: {} of {} processes finished, {} atoms",
        summary.outcome,
        summary.elapsed.as_secs_f64(),
        summary.finished - summary.failed,
        summary.seeds.len(),
        summary.atom_count
    );
    match summary.outcome {
        RunOutcome::Failed => Err(anyhow!("{} simulator process(es) failed", summary.failed)),
        _ => Ok(()),
    }
}

fn optimize(cfg: &EngineConfig, supervisor: SimulationSupervisor) -> Result<()> {
    let optimizer = Optimizer::new(supervisor, cfg.optimization.clone(), cfg.supervisor.clone());
    info!(
        "Optimizing {:?} with {}",
        cfg.optimization.optimization_type,
        optimizer.strategy_name()
    );

    let mut monitor = Monitor::new();
    let (tx, rx) = unbounded();
    monitor.set_channel(rx);

    let token = CancellationToken::new();
    let worker_token = token.clone();
    let handle = thread::Builder::new()
        .name("Solver-Worker".to_string())
        .spawn(move || optimizer.start_optimization(&worker_token, &tx))?;

    monitor.follow();

    let status = handle
        .join()
        .map_err(|_| anyhow!("Optimization thread panicked"))?;

    match status.state {
        OptimizationState::Finished => {
            info!(
                "Optimization finished with {} Pareto solutions after {} generations",
                status.pareto_front.len(),
                monitor.generation
            );
            Ok(())
        }
        state => {
            let reason = status.error.unwrap_or_else(|| format!("ended in state {}", state));
            Err(anyhow!("Optimization failed: {}", reason))
        }
    }
}

// --- Main ---

fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(args.verbose);

    let cfg = load_config(&args)?;

    if let Err(e) = check_dependencies(&cfg) {
        error!("{}", e);
        std::process::exit(1);
    }
    if args.mode == Mode::Optimize && cfg.optimization.measured_spectrum.is_none() {
        warn!("No measured spectrum given; the optimization will fail to prepare");
    }

    let supervisor = build_supervisor(&cfg)?;

    match args.mode {
        Mode::Simulate => simulate(&cfg, &supervisor),
        Mode::Optimize => optimize(&cfg, supervisor),
    }
}
