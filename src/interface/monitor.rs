use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, TryRecvError};
use log::info;

use crate::core::domain::SimulationState;
use crate::engine::evaluator::Candidate;
use crate::engine::progress::{ProgressRecord, WorkerStatus};
use crate::engine::supervisor::{SimulationStatus, SupervisorEvent};
use crate::solvers::{GenStats, OptimizationState, OptimizationStatus, SolverEvent};

// --- Constants ---
const HISTORY_CAPACITY: usize = 1000;
const LOG_CAPACITY: usize = 200;
const REPORT_INTERVAL: Duration = Duration::from_secs(5);

// --- Telemetry ---

/// Rolling objective history, one point per generation.
#[derive(Debug, Clone)]
pub struct Telemetry {
    pub best_history: VecDeque<(f64, f64)>, // (Generation, Objective)
    pub avg_history: VecDeque<(f64, f64)>,
    pub front_history: VecDeque<(f64, f64)>, // (Generation, Front size)

    pub global_min: f64,
    pub global_max: f64,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl Telemetry {
    pub fn new() -> Self {
        Self {
            best_history: VecDeque::with_capacity(HISTORY_CAPACITY),
            avg_history: VecDeque::with_capacity(HISTORY_CAPACITY),
            front_history: VecDeque::with_capacity(HISTORY_CAPACITY),
            global_min: f64::MAX,
            global_max: f64::MIN,
        }
    }

    pub fn ingest(&mut self, stats: &GenStats) {
        if self.best_history.len() >= HISTORY_CAPACITY {
            self.best_history.pop_front();
            self.avg_history.pop_front();
            self.front_history.pop_front();
        }

        if stats.best_objective.is_finite() && stats.best_objective < self.global_min {
            self.global_min = stats.best_objective;
        }
        if stats.worst_objective.is_finite() && stats.worst_objective > self.global_max {
            self.global_max = stats.worst_objective;
        }

        let x = stats.generation as f64;
        self.best_history.push_back((x, stats.best_objective));
        self.avg_history.push_back((x, stats.avg_objective));
        self.front_history.push_back((x, stats.front_size as f64));
    }

    pub fn len(&self) -> usize {
        self.best_history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.best_history.is_empty()
    }
}

// --- The Monitor ---

/// Collects everything a run reports and writes a readable trace of it
/// to the log.
pub struct Monitor {
    // Simulation
    pub workers: BTreeMap<u64, ProgressRecord>,
    pub simulation: Option<SimulationStatus>,
    pub finished_processes: usize,
    pub total_processes: usize,

    // Optimization
    pub rx: Option<Receiver<SolverEvent>>,
    pub optimization: Option<OptimizationStatus>,
    pub generation: usize,
    pub evaluations: usize,
    pub current_best: Option<Candidate>,
    pub finished: bool,

    pub telemetry: Telemetry,
    pub logs: VecDeque<String>,

    start_time: Instant,
    last_report: Instant,
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Monitor {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            workers: BTreeMap::new(),
            simulation: None,
            finished_processes: 0,
            total_processes: 0,
            rx: None,
            optimization: None,
            generation: 0,
            evaluations: 0,
            current_best: None,
            finished: false,
            telemetry: Telemetry::new(),
            logs: VecDeque::with_capacity(LOG_CAPACITY),
            start_time: now,
            last_report: now,
        }
    }

    pub fn set_channel(&mut self, rx: Receiver<SolverEvent>) {
        self.rx = Some(rx);
        self.finished = false;
        self.start_time = Instant::now();
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Drains pending solver events. Returns false once the solver side has
    /// hung up.
    pub fn tick(&mut self) -> bool {
        let Some(rx) = self.rx.clone() else {
            return false;
        };
        for _ in 0..100 {
            match rx.try_recv() {
                Ok(evt) => self.handle_solver_event(evt),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.log("Solver disconnected.");
                    self.rx = None;
                    return false;
                }
            }
        }
        true
    }

    /// Blocks on the solver channel until it closes.
    pub fn follow(&mut self) {
        let Some(rx) = self.rx.take() else {
            return;
        };
        for evt in rx.iter() {
            self.handle_solver_event(evt);
        }
    }

    pub fn handle_solver_event(&mut self, event: SolverEvent) {
        match event {
            SolverEvent::Log(msg) => self.log(msg),

            SolverEvent::Status(status) => self.handle_status(status),

            SolverEvent::Simulation(evt) => self.handle_simulation_event(evt),

            SolverEvent::GenerationUpdate(stats) => {
                self.generation = stats.generation;
                self.evaluations = stats.evaluations;
                self.telemetry.ingest(&stats);
                info!(
                    "Gen {:>4} | best {:.6} | avg {:.6} | front {} | valid {}/{} | {} left",
                    stats.generation,
                    stats.best_objective,
                    stats.avg_objective,
                    stats.front_size,
                    stats.valid_count,
                    stats.pop_size,
                    stats.evaluations_left
                );
            }

            SolverEvent::NewBest(candidate) => self.handle_new_best(candidate),

            SolverEvent::Finished => {
                self.finished = true;
                self.log("Optimization finished.");
            }
        }
    }

    fn handle_status(&mut self, status: OptimizationStatus) {
        let changed = self
            .optimization
            .as_ref()
            .map_or(true, |prev| prev.state != status.state);
        if changed {
            let line = match (&status.state, &status.error) {
                (OptimizationState::Error, Some(e)) => format!("Optimization error: {}", e),
                (state, _) => format!("Optimization state: {}", state),
            };
            self.log(line);
        }
        if status.state == OptimizationState::Finished && !status.pareto_front.is_empty() {
            self.log(format!("Pareto front holds {} solutions", status.pareto_front.len()));
        }
        self.optimization = Some(status);
    }

    fn handle_new_best(&mut self, candidate: Candidate) {
        let new = candidate.objectives_or_worst().primary;
        let improved = match &self.current_best {
            Some(curr) => new < curr.objectives_or_worst().primary,
            None => true,
        };
        if improved {
            self.log(format!(">>> New best: {:.6}", new));
            self.current_best = Some(candidate);
        }
    }

    pub fn handle_simulation_event(&mut self, event: SupervisorEvent) {
        self.finished_processes = event.finished_processes;
        self.total_processes = event.total_processes;

        let previous = self.simulation.map(|s| s.state);
        if previous != Some(event.status.state) {
            self.log(format!("Simulation state: {}", event.status.state));
        }
        self.simulation = Some(event.status);

        if let Some(record) = event.progress {
            if record.is_terminal() {
                let line = match record.status {
                    WorkerStatus::Failed => format!("Seed {} failed: {}", record.seed, record.message),
                    status => format!("Seed {} {:?}", record.seed, status),
                };
                self.log(line);
            }
            self.workers.insert(record.seed, record);
        }

        if self.last_report.elapsed() >= REPORT_INTERVAL
            || event.status.state == SimulationState::Done
        {
            self.last_report = Instant::now();
            info!("{}", self.summary());
        }
    }

    /// One-line picture of the simulation side.
    pub fn summary(&self) -> String {
        let atoms = self.simulation.map_or(0, |s| s.atom_count);
        let progress: Vec<String> = self
            .workers
            .values()
            .map(|r| {
                let phase = if r.presim { "pre" } else { "main" };
                format!("{}:{}{}%", r.seed, phase, r.percentage)
            })
            .collect();
        format!(
            "{}/{} processes done | {} atoms | {}",
            self.finished_processes,
            self.total_processes,
            atoms,
            progress.join(" ")
        )
    }

    /// Logs a message to the internal buffer.
    fn log(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        info!("{}", msg);
        if self.logs.len() >= LOG_CAPACITY {
            self.logs.pop_front();
        }
        self.logs.push_back(msg);
    }
}
