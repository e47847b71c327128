use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::Sender;
use log::{error, info, warn};
use parking_lot::Mutex;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::analysis::spectrum::Spectrum;
use crate::core::cancel::CancellationToken;
use crate::core::config::{OptimizationParams, StrategyKind, SupervisorConfig};
use crate::core::domain::{OptimizationType, RecoilDistribution, OPTIMIZATION_SEED};
use crate::engine::evaluator::{Candidate, Evaluator, ObjectiveValues};
use crate::engine::supervisor::{EspeOptions, SimulationSupervisor, StartOptions};
use crate::solvers::convergence::{ConvergenceGate, GateOutcome};
use crate::solvers::ga::GeneticAlgorithm;
use crate::solvers::gradient::GradientDescent;
use crate::solvers::objective::{recoil_points, FluenceEvaluator, RecoilEvaluator, SpectrumTarget};
use crate::solvers::{OptimizationState, OptimizationStatus, SearchStrategy, SolverEvent};

/// Names of the three recoils kept from a recoil optimization.
pub const FINAL_RECOIL_NAMES: [&str; 3] = ["optfirst", "optmed", "optlast"];

/// What preparation hands to the later stages.
struct Prepared {
    evaluator: Arc<dyn Evaluator>,
    initial: Vec<Vec<f64>>,
    /// Recoil simulated by the initial run and sampled by the gate.
    probe: RecoilDistribution,
}

/// Fits a simulation's recoil distribution or fluence to a measured
/// spectrum.
///
/// One optimizer runs once: Preparing, Simulating, Running, then Finished
/// or Error.
pub struct Optimizer {
    supervisor: SimulationSupervisor,
    params: OptimizationParams,
    run: SupervisorConfig,
    strategy: Box<dyn SearchStrategy>,
    measured: Option<Spectrum>,
    state: Mutex<OptimizationState>,
}

impl Optimizer {
    pub fn new(supervisor: SimulationSupervisor, params: OptimizationParams, run: SupervisorConfig) -> Self {
        let strategy: Box<dyn SearchStrategy> = match params.strategy {
            StrategyKind::Genetic => Box::new(GeneticAlgorithm::new(&params)),
            StrategyKind::Gradient => Box::new(GradientDescent::new(params.gradient.clone())),
        };
        Self {
            supervisor,
            params,
            run,
            strategy,
            measured: None,
            state: Mutex::new(OptimizationState::Preparing),
        }
    }

    pub fn with_strategy(mut self, strategy: Box<dyn SearchStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Uses `spectrum` instead of loading `measured_spectrum` from disk.
    pub fn with_measurement(mut self, spectrum: Spectrum) -> Self {
        self.measured = Some(spectrum);
        self
    }

    pub fn state(&self) -> OptimizationState {
        *self.state.lock()
    }

    pub fn strategy_name(&self) -> &str {
        self.strategy.name()
    }

    fn transition(&self, status: OptimizationStatus, tx: &Sender<SolverEvent>) -> bool {
        let mut state = self.state.lock();
        if !state.can_transition_to(status.state) {
            warn!("Ignoring optimization transition {} -> {}", *state, status.state);
            return false;
        }
        match &status.error {
            Some(e) => error!("Optimization {} -> {}: {}", *state, status.state, e),
            None => info!("Optimization {} -> {}", *state, status.state),
        }
        *state = status.state;
        drop(state);
        let _ = tx.send(SolverEvent::Status(status));
        true
    }

    fn fail(&self, message: String, elapsed: Duration, tx: &Sender<SolverEvent>) -> OptimizationStatus {
        let mut status = OptimizationStatus::new(OptimizationState::Error, 0);
        status.error = Some(message);
        status.elapsed = Some(elapsed);
        self.transition(status.clone(), tx);
        status
    }

    /// Runs the whole optimization on the calling thread and returns its
    /// final status. Results are stored in the job and written to disk.
    /// Cleanup runs on every exit path.
    pub fn start_optimization(&self, token: &CancellationToken, tx: &Sender<SolverEvent>) -> OptimizationStatus {
        let started = Instant::now();
        let budget = self.strategy.budget();

        if self.state() != OptimizationState::Preparing {
            let mut status = OptimizationStatus::new(self.state(), 0);
            status.error = Some("Optimization has already run".to_string());
            return status;
        }
        let _ = tx.send(SolverEvent::Status(OptimizationStatus::new(OptimizationState::Preparing, budget)));
        info!(
            "Starting {:?} optimization with {}",
            self.params.optimization_type,
            self.strategy.name()
        );

        let guard = match self.supervisor.begin_optimization() {
            Ok(g) => g,
            Err(e) => {
                return self.fail(format!("Could not start optimization: {}", e), started.elapsed(), tx);
            }
        };

        let status = self.run_stages(token, tx, started, budget);

        // Cleanup must precede saving: temporary fluence files share the
        // result prefix.
        self.clean_up(token);
        if status.pareto_front.is_empty() {
            // Nothing was accepted; only the probe recoil is left in the job.
            self.supervisor.update_job(|job| job.optimization_recoils.clear());
        } else if let Err(e) = self.supervisor.save_optimization_results() {
            warn!("Could not save optimization results: {}", e);
        }
        drop(guard);

        let _ = tx.send(SolverEvent::Finished);
        status
    }

    fn run_stages(
        &self,
        token: &CancellationToken,
        tx: &Sender<SolverEvent>,
        started: Instant,
        budget: usize,
    ) -> OptimizationStatus {
        let prepared = match self.prepare() {
            Ok(p) => p,
            Err(e) => {
                return self.fail(
                    format!("Preparation for optimization failed: {:#}", e),
                    started.elapsed(),
                    tx,
                )
            }
        };

        if !self.params.skip_simulation {
            self.transition(OptimizationStatus::new(OptimizationState::Simulating, budget), tx);
            if let Err(e) = self.simulate(&prepared.probe, token, tx) {
                return self.fail(format!("{:#}", e), started.elapsed(), tx);
            }
        }

        if token.is_cancellation_requested() {
            let mut status = OptimizationStatus::new(OptimizationState::Finished, budget);
            status.elapsed = Some(started.elapsed());
            self.transition(status.clone(), tx);
            return status;
        }

        self.transition(OptimizationStatus::new(OptimizationState::Running, budget), tx);
        let outcome = self.strategy.search(prepared.evaluator, prepared.initial, token, tx);

        if outcome.front.is_empty() {
            return self.fail(
                "Could not form the Pareto front. Optimization may have been stopped before any \
                 solutions were evaluated."
                    .to_string(),
                started.elapsed(),
                tx,
            );
        }

        let front_values: Vec<ObjectiveValues> = outcome.front.iter().map(Candidate::objectives_or_worst).collect();
        self.store_results(&outcome.front);

        let mut status = OptimizationStatus::new(
            OptimizationState::Finished,
            budget.saturating_sub(outcome.evaluations),
        );
        status.pareto_front = front_values;
        status.elapsed = Some(started.elapsed());
        self.transition(status.clone(), tx);
        status
    }

    // --- Stages ---

    fn prepare(&self) -> Result<Prepared> {
        let measured = match &self.measured {
            Some(s) => s.clone(),
            None => {
                let path = self
                    .params
                    .measured_spectrum
                    .as_ref()
                    .ok_or_else(|| anyhow!("Optimization could not be prepared, no measurement defined."))?;
                Spectrum::load(path)?
            }
        };
        if measured.is_empty() {
            bail!("Measured spectrum is empty");
        }
        let target = SpectrumTarget {
            measured: measured.to_bin_centres(self.params.channel_width),
            channel_width: self.params.channel_width,
            objective: self.params.objective,
        };

        self.supervisor.update_job(|job| {
            job.optimization_recoils.clear();
            job.optimized_fluence = None;
        });

        let mode = self.params.optimization_type;
        self.supervisor
            .combine_previous_erd_files(mode)
            .context("Could not combine earlier result files")?;

        let mut rng = ChaCha8Rng::seed_from_u64(self.params.seed);
        let (evaluator, initial, probe) = match mode {
            OptimizationType::Recoil => {
                let evaluator = RecoilEvaluator::new(self.supervisor.clone(), &self.params, target)?;
                let initial = evaluator.initial_population(self.initial_size(), &mut rng);
                let probe = evaluator.form_recoil(&evaluator.covering_solution(), "opt");
                let simulated = probe.clone();
                self.supervisor
                    .update_job(move |job| job.optimization_recoils = vec![simulated]);
                let evaluator: Arc<dyn Evaluator> = Arc::new(evaluator);
                (evaluator, initial, probe)
            }
            OptimizationType::Fluence => {
                let evaluator = FluenceEvaluator::new(self.supervisor.clone(), &self.params, target)?;
                let initial = evaluator.initial_population(self.initial_size(), &mut rng);
                let mut probe = self
                    .supervisor
                    .job()
                    .main_recoil()
                    .cloned()
                    .ok_or_else(|| anyhow!("Simulation has no recoil element"))?;
                probe.name = "optfl".to_string();
                let evaluator: Arc<dyn Evaluator> = Arc::new(evaluator);
                (evaluator, initial, probe)
            }
        };

        Ok(Prepared {
            evaluator,
            initial,
            probe,
        })
    }

    fn initial_size(&self) -> usize {
        match self.params.strategy {
            StrategyKind::Genetic => self.params.population_size.max(2),
            StrategyKind::Gradient => 1,
        }
    }

    /// Runs the initial simulation until its spectrum stops changing.
    fn simulate(&self, probe: &RecoilDistribution, token: &CancellationToken, tx: &Sender<SolverEvent>) -> Result<()> {
        let mode = self.params.optimization_type;
        let run_token = CancellationToken::new();
        let options = StartOptions {
            process_count: self.params.number_of_processes,
            start_value: Some(OPTIMIZATION_SEED),
            use_old_erd_files: true,
            optimization: Some(mode),
            ion_division: self.run.ion_division,
            token: Some(run_token.clone()),
            start_interval: self.run.start_interval(),
            status_interval: self.run.status_interval(),
            max_time: Some(self.params.check_max()),
        };
        let run = self.supervisor.start(options).map_err(|e| {
            anyhow!("Could not start simulation. Check that simulation is not currently running. ({})", e)
        })?;

        let gate = ConvergenceGate::from_params(&self.params, self.supervisor.job().settings.channel_width);
        let espe = EspeOptions {
            optimization: Some(mode),
            ..Default::default()
        };
        let sample = || match self.supervisor.calculate_espe(probe, &espe) {
            Ok(s) => Some(s),
            Err(e) => {
                warn!("Convergence sample failed: {:#}", e);
                None
            }
        };
        let report = gate.watch(run.events(), &run_token, token, sample, |event| {
            let _ = tx.send(SolverEvent::Simulation(event));
        });

        match report.outcome {
            GateOutcome::Converged { change } => info!(
                "Initial simulation converged after {} samples (change {:.4})",
                report.samples, change
            ),
            GateOutcome::TimedOut => info!("Initial simulation reached its time limit"),
            GateOutcome::Cancelled => info!("Initial simulation cancelled"),
            GateOutcome::SimulationEnded => info!("Initial simulation ran to completion"),
        }

        let summary = run.wait();
        let _ = tx.send(SolverEvent::Log(format!(
            "Initial simulation: {:?}, {} atoms in {:.1}s",
            summary.outcome,
            summary.atom_count,
            summary.elapsed.as_secs_f64()
        )));
        Ok(())
    }

    fn store_results(&self, front: &[Candidate]) {
        match self.params.optimization_type {
            OptimizationType::Recoil => {
                let Some(prefix_recoil) = self.supervisor.job().main_recoil().cloned() else {
                    return;
                };
                let shape = self.params.recoil_shape;
                let recoils: Vec<RecoilDistribution> = pick_final_solutions(front)
                    .iter()
                    .zip(FINAL_RECOIL_NAMES)
                    .map(|(c, name)| {
                        RecoilDistribution::new(
                            name,
                            prefix_recoil.element.clone(),
                            recoil_points(shape, &c.genes),
                        )
                    })
                    .collect();
                self.supervisor.update_job(move |job| job.optimization_recoils = recoils);
            }
            OptimizationType::Fluence => {
                let fluences: Vec<f64> = front.iter().filter_map(|c| c.genes.first().copied()).collect();
                if fluences.is_empty() {
                    return;
                }
                let mean = fluences.iter().sum::<f64>() / fluences.len() as f64;
                info!("Optimized fluence: {:e}", mean);
                self.supervisor.update_job(move |job| job.optimized_fluence = Some(mean));
            }
        }
    }

    fn clean_up(&self, token: &CancellationToken) {
        token.request_cancellation();
        self.supervisor.stop();
        if !self.supervisor.wait_until_idle(Duration::from_secs(5)) {
            warn!("Simulation still running after optimization cleanup");
        }
        let job = self.supervisor.job();
        if let Some(recoil) = job.main_recoil() {
            delete_temp_files(&job.directory, &recoil.prefix());
        }
    }
}

/// First (best primary), median and last (best secondary) candidates of a
/// front. Fewer are returned only when the front is empty.
pub fn pick_final_solutions(front: &[Candidate]) -> Vec<Candidate> {
    if front.is_empty() {
        return Vec::new();
    }
    let by = |m: usize| {
        let mut sorted: Vec<&Candidate> = front.iter().collect();
        sorted.sort_by(|a, b| {
            a.objectives_or_worst()
                .get(m)
                .partial_cmp(&b.objectives_or_worst().get(m))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        sorted
    };
    let by_primary = by(0);
    let by_secondary = by(1);
    vec![
        by_primary[0].clone(),
        by_secondary[by_secondary.len() / 2].clone(),
        by_secondary[0].clone(),
    ]
}

/// Removes scoring leftovers: `<prefix>-opt*` distribution files and every
/// `<prefix>-optfl*` file.
fn delete_temp_files(directory: &Path, prefix: &str) {
    let Ok(entries) = fs::read_dir(directory) else {
        return;
    };
    let opt = format!("{}-opt", prefix);
    let optfl = format!("{}-optfl", prefix);
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let scratch_recoil = name.starts_with(&opt)
            && (name.ends_with(".recoil") || name.ends_with(".scatter"))
            && !FINAL_RECOIL_NAMES.iter().any(|f| name.starts_with(&format!("{}-{}", prefix, f)));
        if scratch_recoil || name.starts_with(&optfl) {
            if let Err(e) = fs::remove_file(&path) {
                warn!("Could not remove {}: {}", path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::evaluator::CandidateStatus;

    fn cand(id: f64, a: f64, b: f64) -> Candidate {
        let mut c = Candidate::new(vec![id]);
        c.objectives = Some(ObjectiveValues::new(a, b));
        c.status = CandidateStatus::Evaluated;
        c
    }

    #[test]
    fn picks_first_median_last() {
        let front = vec![cand(0.0, 3.0, 2.0), cand(1.0, 1.0, 5.0), cand(2.0, 5.0, 1.0), cand(3.0, 2.0, 3.0)];
        let ids: Vec<f64> = pick_final_solutions(&front).iter().map(|c| c.genes[0]).collect();
        // by secondary: 2, 0, 3, 1 -> median index 2 is candidate 3
        assert_eq!(ids, vec![1.0, 3.0, 2.0]);
    }

    #[test]
    fn single_solution_front_repeats() {
        let front = vec![cand(7.0, 1.0, 1.0)];
        assert_eq!(pick_final_solutions(&front).len(), 3);
    }

    #[test]
    fn temp_files_are_removed_but_results_kept() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "7Li-opt.recoil",
            "7Li-opt12.recoil",
            "7Li-optfl.201.erd",
            "7Li-optfl3.recoil",
            "7Li-opt.201.erd",
            "7Li-optfirst.rec",
            "7Li-main.recoil",
        ] {
            fs::write(dir.path().join(name), "x").unwrap();
        }
        delete_temp_files(dir.path(), "7Li");
        let mut left: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        left.sort();
        assert_eq!(left, vec!["7Li-main.recoil", "7Li-opt.201.erd", "7Li-optfirst.rec"]);
    }
}
