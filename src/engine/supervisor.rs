use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Context;
use crossbeam_channel::{never, select, tick, unbounded, Receiver, Sender};
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;

use crate::analysis::spectrum::Spectrum;
use crate::core::cancel::CancellationToken;
use crate::core::config::SupervisorConfig;
use crate::core::domain::{
    IonDivision, OptimizationType, RecoilDistribution, SimulationJob, SimulationState,
};
use crate::core::naming;
use crate::engine::error::{EngineResult, StartRejection};
use crate::engine::external::espe::{EspeRequest, SpectrumReconstructor};
use crate::engine::external::mcerd::{SimulatorBackend, WorkerInput};
use crate::engine::progress::{ProgressRecord, WorkerStatus};
use crate::engine::tracker::{FileLineCounter, LineCounter, ResultFileTracker};

/// How often the coordinator re-checks cancellation while nothing happens.
const CANCEL_POLL: Duration = Duration::from_millis(50);

// --- Public Types ---

/// Aggregate state reported on every status tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SimulationStatus {
    pub atom_count: u64,
    pub state: SimulationState,
    pub optimizing: bool,
}

/// Options of one [`SimulationSupervisor::start`] call.
#[derive(Debug, Clone)]
pub struct StartOptions {
    pub process_count: usize,
    /// Requested first seed. Raised above every seed already used.
    pub start_value: Option<u64>,
    /// When false, earlier result files are deleted before starting.
    pub use_old_erd_files: bool,
    pub optimization: Option<OptimizationType>,
    pub ion_division: IonDivision,
    /// Caller-owned token; a fresh one is created when absent.
    pub token: Option<CancellationToken>,
    pub start_interval: Duration,
    pub status_interval: Duration,
    pub max_time: Option<Duration>,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            process_count: 1,
            start_value: None,
            use_old_erd_files: true,
            optimization: None,
            ion_division: IonDivision::None,
            token: None,
            start_interval: Duration::from_secs(5),
            status_interval: Duration::from_secs(1),
            max_time: None,
        }
    }
}

impl From<&SupervisorConfig> for StartOptions {
    fn from(cfg: &SupervisorConfig) -> Self {
        Self {
            process_count: cfg.process_count,
            start_value: Some(cfg.seed),
            use_old_erd_files: cfg.use_old_erd_files,
            ion_division: cfg.ion_division,
            start_interval: cfg.start_interval(),
            status_interval: cfg.status_interval(),
            max_time: cfg.max_time(),
            ..Default::default()
        }
    }
}

/// One update from a running simulation.
#[derive(Debug, Clone)]
pub struct SupervisorEvent {
    /// Worker output, `None` for periodic status ticks.
    pub progress: Option<ProgressRecord>,
    pub finished_processes: usize,
    pub total_processes: usize,
    pub status: SimulationStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every worker ran to completion.
    Finished,
    Cancelled,
    /// At least one worker failed or could not be launched.
    Failed,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    pub seeds: Vec<u64>,
    pub finished: usize,
    pub failed: usize,
    pub atom_count: u64,
    pub elapsed: Duration,
}

/// Handle of a started simulation. Iterating yields events until the run
/// has fully shut down.
pub struct SimulationRun {
    events: Receiver<SupervisorEvent>,
    handle: Option<JoinHandle<RunSummary>>,
    token: CancellationToken,
    first_seed: u64,
}

impl SimulationRun {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn first_seed(&self) -> u64 {
        self.first_seed
    }

    pub fn events(&self) -> &Receiver<SupervisorEvent> {
        &self.events
    }

    /// Blocks until the run is over. Unread events are discarded.
    pub fn wait(mut self) -> RunSummary {
        while self.events.recv().is_ok() {}
        self.join()
    }

    fn join(&mut self) -> RunSummary {
        let fallback = RunSummary {
            outcome: RunOutcome::Failed,
            seeds: Vec::new(),
            finished: 0,
            failed: 0,
            atom_count: 0,
            elapsed: Duration::ZERO,
        };
        match self.handle.take() {
            Some(h) => h.join().unwrap_or(fallback),
            None => fallback,
        }
    }
}

impl Iterator for SimulationRun {
    type Item = SupervisorEvent;

    fn next(&mut self) -> Option<SupervisorEvent> {
        self.events.recv().ok()
    }
}

/// Marks an optimization as in progress. Dropping it releases the job.
pub struct OptimizationGuard {
    inner: Arc<Inner>,
}

impl Drop for OptimizationGuard {
    fn drop(&mut self) {
        let mut activity = self.inner.activity.lock();
        activity.optimizing = false;
        self.inner.idle.notify_all();
    }
}

/// Options of [`SimulationSupervisor::calculate_espe`].
#[derive(Debug, Clone, Default)]
pub struct EspeOptions {
    pub optimization: Option<OptimizationType>,
    pub channel_width: Option<f64>,
    pub fluence: Option<f64>,
    pub write_to_file: bool,
    /// Delete the temporary distribution file afterwards.
    pub remove_recoil_file: bool,
}

// --- Internal State ---

#[derive(Debug, Default)]
struct Activity {
    running: bool,
    mode: Option<OptimizationType>,
    optimizing: bool,
}

struct Inner {
    job: RwLock<SimulationJob>,
    tracker: ResultFileTracker,
    tokens: Mutex<Vec<CancellationToken>>,
    activity: Mutex<Activity>,
    idle: Condvar,
    backend: Arc<dyn SimulatorBackend>,
    reconstructor: Arc<dyn SpectrumReconstructor>,
}

impl Inner {
    fn status(&self) -> SimulationStatus {
        let atom_count = self.tracker.total_atom_count();
        let activity = self.activity.lock();
        let state = if activity.running && activity.mode.is_none() {
            SimulationState::Running
        } else if !activity.running && !self.tracker.is_empty() {
            SimulationState::Done
        } else {
            SimulationState::NotRun
        };
        SimulationStatus {
            atom_count,
            state,
            optimizing: activity.optimizing || (activity.running && activity.mode.is_some()),
        }
    }
}

/// Clears the running state of a run however its coordinator exits.
struct ActiveRun {
    inner: Arc<Inner>,
    token: CancellationToken,
    name: String,
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        self.inner.tracker.update();
        self.inner.tokens.lock().retain(|t| !t.same_as(&self.token));
        {
            let mut activity = self.inner.activity.lock();
            activity.running = false;
            activity.mode = None;
        }
        self.inner.idle.notify_all();
        info!(
            "Simulation finished. Element {}, observed atoms: {}.",
            self.name,
            self.inner.tracker.total_atom_count()
        );
    }
}

// --- Supervisor ---

/// Runs and observes simulator workers for one simulation job.
#[derive(Clone)]
pub struct SimulationSupervisor {
    inner: Arc<Inner>,
}

impl SimulationSupervisor {
    pub fn new(
        job: SimulationJob,
        backend: Arc<dyn SimulatorBackend>,
        reconstructor: Arc<dyn SpectrumReconstructor>,
    ) -> EngineResult<Self> {
        Self::with_counter(job, backend, reconstructor, Arc::new(FileLineCounter))
    }

    /// Like [`new`](Self::new) with a custom line counter. Result files
    /// already in the job directory are picked up as settled.
    pub fn with_counter(
        job: SimulationJob,
        backend: Arc<dyn SimulatorBackend>,
        reconstructor: Arc<dyn SpectrumReconstructor>,
        counter: Arc<dyn LineCounter>,
    ) -> EngineResult<Self> {
        let stem = job
            .main_recoil()
            .map(RecoilDistribution::full_name)
            .unwrap_or_else(|| job.full_name());
        let tracker = ResultFileTracker::from_directory(&job.directory, &stem, counter)?;
        debug!("Found {} earlier result files for {}", tracker.len(), stem);

        Ok(Self {
            inner: Arc::new(Inner {
                job: RwLock::new(job),
                tracker,
                tokens: Mutex::new(Vec::new()),
                activity: Mutex::new(Activity::default()),
                idle: Condvar::new(),
                backend,
                reconstructor,
            }),
        })
    }

    pub fn job(&self) -> SimulationJob {
        self.inner.job.read().clone()
    }

    pub fn update_job<F: FnOnce(&mut SimulationJob)>(&self, f: F) {
        f(&mut self.inner.job.write());
    }

    pub fn directory(&self) -> PathBuf {
        self.inner.job.read().directory.clone()
    }

    pub fn tracker(&self) -> &ResultFileTracker {
        &self.inner.tracker
    }

    pub fn reconstructor(&self) -> &Arc<dyn SpectrumReconstructor> {
        &self.inner.reconstructor
    }

    // --- Lifecycle ---

    /// Starts `process_count` workers, one every `start_interval`.
    pub fn start(&self, options: StartOptions) -> Result<SimulationRun, StartRejection> {
        let mut activity = self.inner.activity.lock();
        if activity.running || (activity.optimizing && options.optimization.is_none()) {
            return Err(StartRejection::AlreadyRunning);
        }

        let job = self.job();
        let recoil = match options.optimization {
            Some(OptimizationType::Recoil) => job
                .optimization_recoils
                .first()
                .or_else(|| job.main_recoil())
                .cloned(),
            _ => job.main_recoil().cloned(),
        }
        .ok_or(StartRejection::NoRecoil)?;

        activity.running = true;
        activity.mode = options.optimization;
        drop(activity);

        if !options.use_old_erd_files {
            self.inner.tracker.clear();
            self.delete_simulation_results();
        }

        let first_seed = first_seed(
            self.inner.tracker.max_seed(),
            options.start_value.unwrap_or(job.settings.seed_number),
        );
        let process_count = options.process_count.max(1);
        let (presim, sim) = options.ion_division.ion_counts(
            job.settings.number_of_preions,
            job.settings.number_of_ions,
            process_count,
        );

        let token = options.token.clone().unwrap_or_default();
        self.inner.tokens.lock().push(token.clone());

        let stem = naming::run_stem(&recoil, options.optimization);
        info!(
            "Starting {} simulation process(es) for {} from seed {}",
            process_count, stem, first_seed
        );

        let plan = RunPlan {
            template: WorkerInput {
                seed: first_seed,
                directory: job.directory.clone(),
                stem,
                recoil: recoil.clone(),
                job,
                number_of_ions: sim,
                number_of_preions: presim,
                max_time: options.max_time,
            },
            process_count,
            track_files: options.optimization.is_none(),
            start_interval: options.start_interval,
            status_interval: options.status_interval,
        };

        let guard = ActiveRun {
            inner: self.inner.clone(),
            token: token.clone(),
            name: recoil.full_name(),
        };
        let (tx, rx) = unbounded();
        let coordinator_token = token.clone();
        let spawned = thread::Builder::new()
            .name(format!("supervisor-{}", recoil.full_name()))
            .spawn(move || coordinate(guard, plan, coordinator_token, tx));

        match spawned {
            Ok(handle) => Ok(SimulationRun {
                events: rx,
                handle: Some(handle),
                token,
                first_seed,
            }),
            // The guard was dropped with the closure, the job is idle again.
            Err(e) => {
                error!("Could not spawn supervisor thread: {}", e);
                Err(StartRejection::SpawnFailed)
            }
        }
    }

    /// Requests cancellation of every live run. Does not wait.
    pub fn stop(&self) {
        for token in self.inner.tokens.lock().iter() {
            token.request_cancellation();
        }
    }

    /// Blocks until no run is active. Returns false on timeout.
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut activity = self.inner.activity.lock();
        while activity.running {
            if self.inner.idle.wait_until(&mut activity, deadline).timed_out() {
                return !activity.running;
            }
        }
        true
    }

    /// Claims the job for an optimization. Plain simulations are rejected
    /// until the guard is dropped.
    pub fn begin_optimization(&self) -> Result<OptimizationGuard, StartRejection> {
        let mut activity = self.inner.activity.lock();
        if activity.running || activity.optimizing {
            return Err(StartRejection::AlreadyRunning);
        }
        activity.optimizing = true;
        Ok(OptimizationGuard {
            inner: self.inner.clone(),
        })
    }

    // --- Queries ---

    pub fn current_status(&self) -> SimulationStatus {
        self.inner.status()
    }

    pub fn atom_count(&self) -> u64 {
        self.inner.tracker.total_atom_count()
    }

    /// True while any run, plain or optimization, is active.
    pub fn is_running(&self) -> bool {
        self.inner.activity.lock().running
    }

    pub fn is_simulation_running(&self) -> bool {
        let a = self.inner.activity.lock();
        a.running && a.mode.is_none()
    }

    pub fn is_finished(&self) -> bool {
        !self.is_running() && !self.inner.tracker.is_empty()
    }

    pub fn is_optimization_running(&self) -> bool {
        let a = self.inner.activity.lock();
        a.optimizing || (a.running && a.mode.is_some())
    }

    pub fn is_optimization_finished(&self) -> bool {
        if self.is_optimization_running() {
            return false;
        }
        let job = self.inner.job.read();
        !job.optimization_recoils.is_empty() || job.optimized_fluence.is_some()
    }

    pub fn max_seed(&self) -> Option<u64> {
        self.inner.tracker.max_seed()
    }

    pub fn erd_files(&self) -> Vec<PathBuf> {
        self.inner.tracker.files()
    }

    // --- Spectra ---

    /// Reconstructs the energy spectrum of `recoil` from the result files of
    /// the given run kind. The distribution is written under the recoil's own
    /// name, so concurrent calls must use distinct recoil names.
    pub fn calculate_espe(
        &self,
        recoil: &RecoilDistribution,
        options: &EspeOptions,
    ) -> anyhow::Result<Spectrum> {
        let job = self.job();
        let suffix = job.settings.simulation_type.recoil_suffix();
        let name = recoil.full_name();
        let recoil_file = job.directory.join(format!("{}.{}", name, suffix));
        fs::write(&recoil_file, recoil.file_contents())
            .with_context(|| format!("Failed to write {}", recoil_file.display()))?;

        let stem = naming::run_stem(recoil, options.optimization);
        let erd_files = naming::matching_erd_files(&job.directory, &stem)?;

        let mut request = EspeRequest::from_job(
            &job,
            recoil_file.clone(),
            erd_files,
            options.channel_width.unwrap_or(job.settings.channel_width),
            options.fluence.unwrap_or(job.fluence),
        );
        if options.write_to_file {
            request.output_file = Some(job.directory.join(format!("{}.simu", name)));
        }

        let result = self.inner.reconstructor.reconstruct(&request);
        if options.remove_recoil_file {
            remove_best_effort(&recoil_file);
        }
        result
    }

    // --- Files ---

    /// Concatenates every tracked result file into the `combined` file of
    /// the given optimization run kind.
    pub fn combine_previous_erd_files(&self, mode: OptimizationType) -> EngineResult<PathBuf> {
        let job = self.job();
        let Some(recoil) = job.main_recoil() else {
            return Ok(job.directory.join(naming::combined_file_name(&job.full_name())));
        };
        let destination = job
            .directory
            .join(naming::combined_file_name(&naming::run_stem(recoil, Some(mode))));

        let mut dest = fs::File::create(&destination)?;
        for path in self.inner.tracker.files() {
            match fs::File::open(&path) {
                Ok(mut src) => {
                    std::io::copy(&mut src, &mut dest)?;
                }
                Err(e) => debug!("Skipping {}: {}", path.display(), e),
            }
        }
        dest.flush()?;
        Ok(destination)
    }

    /// Writes the accepted optimization results next to the simulation.
    pub fn save_optimization_results(&self) -> EngineResult<()> {
        let job = self.job();
        for recoil in &job.optimization_recoils {
            let path = job.directory.join(format!("{}.rec", recoil.full_name()));
            let json = serde_json::to_string_pretty(recoil)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            fs::write(path, json)?;
        }
        if let (Some(fluence), Some(recoil)) = (job.optimized_fluence, job.main_recoil()) {
            let path = job.directory.join(format!("{}-optfl.result", recoil.prefix()));
            fs::write(path, fluence.to_string())?;
        }
        Ok(())
    }

    /// Deletes result, distribution and spectrum files of plain runs.
    pub fn delete_simulation_results(&self) {
        let job = self.job();
        let prefixes: Vec<String> = job.recoils.iter().map(|r| r.full_name()).collect();
        remove_matching_files(
            &job.directory,
            &["recoil", "erd", "simu", "scatter", "prof"],
            |name| prefixes.iter().any(|p| name.starts_with(p.as_str())) && !name.contains("opt"),
        );
    }

    /// Deletes optimization output of one kind, or of both when `mode` is `None`.
    pub fn delete_optimization_results(&self, mode: Option<OptimizationType>) {
        if self.is_optimization_running() {
            self.stop();
        }
        let job = self.job();
        let Some(prefix) = job.main_recoil().map(|r| r.prefix()) else {
            return;
        };
        let opt = format!("{}-opt", prefix);
        let optfl = format!("{}-optfl", prefix);
        remove_matching_files(
            &job.directory,
            &["recoil", "erd", "simu", "scatter", "rec"],
            |name| match mode {
                Some(OptimizationType::Recoil) => name.starts_with(&opt) && !name.starts_with(&optfl),
                Some(OptimizationType::Fluence) => name.starts_with(&optfl),
                None => name.starts_with(&opt),
            },
        );

        self.update_job(|job| {
            if mode != Some(OptimizationType::Recoil) {
                job.optimized_fluence = None;
            }
            job.optimization_recoils.clear();
        });
    }

    /// Stops every run and optionally removes all results.
    pub fn reset(&self, remove_result_files: bool) {
        self.stop();
        if !self.wait_until_idle(Duration::from_secs(1)) {
            warn!("Simulation did not stop within a second of reset");
        }
        if remove_result_files {
            self.delete_simulation_results();
            self.delete_optimization_results(None);
            self.inner.tracker.clear();
        }
    }
}

fn first_seed(max_seed: Option<u64>, requested: u64) -> u64 {
    match max_seed {
        Some(max) if requested <= max => max + 1,
        _ => requested,
    }
}

fn remove_best_effort(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Could not remove {}: {}", path.display(), e);
        }
    }
}

fn remove_matching_files<F: Fn(&str) -> bool>(directory: &Path, extensions: &[&str], keep_if: F) {
    let Ok(entries) = fs::read_dir(directory) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let ext_ok = path
            .extension()
            .and_then(|e| e.to_str())
            .map_or(false, |e| extensions.contains(&e));
        let name_ok = path
            .file_name()
            .and_then(|n| n.to_str())
            .map_or(false, |n| keep_if(n));
        if ext_ok && name_ok {
            remove_best_effort(&path);
        }
    }
}

// --- Coordinator ---

struct RunPlan {
    template: WorkerInput,
    process_count: usize,
    track_files: bool,
    start_interval: Duration,
    status_interval: Duration,
}

/// Launches one worker and forwards its records to `progress`. Returns
/// false when the worker could not be started; a terminal record is sent
/// either way.
fn launch_worker(
    inner: &Inner,
    plan: &RunPlan,
    seed: u64,
    token: &CancellationToken,
    progress: &Sender<ProgressRecord>,
) -> bool {
    let mut input = plan.template.clone();
    input.seed = seed;

    let failed = |message: String| {
        let mut record = ProgressRecord::new(seed, &input.stem);
        record.status = WorkerStatus::Failed;
        record.message = message;
        let _ = progress.send(record);
        false
    };

    if plan.track_files {
        if let Err(e) = inner.tracker.add_active_file(&input.result_file()) {
            error!("Seed {} was not started: {}", seed, e);
            return failed(e.to_string());
        }
    }

    let stream = match inner.backend.launch(&input, token.clone()) {
        Ok(s) => s,
        Err(e) => {
            warn!("Could not launch {} with seed {}: {}", inner.backend.name(), seed, e);
            return failed(e.to_string());
        }
    };
    debug!("Launched {} worker with seed {}", inner.backend.name(), seed);

    let tx = progress.clone();
    let stem = input.stem.clone();
    let spawned = thread::Builder::new()
        .name(format!("worker-{}", seed))
        .spawn(move || {
            let mut last = ProgressRecord::new(seed, &stem);
            for record in stream {
                let terminal = record.is_terminal();
                last = record.clone();
                if tx.send(record).is_err() || terminal {
                    return;
                }
            }
            // The stream ended without saying why.
            last.status = WorkerStatus::Finished;
            let _ = tx.send(last);
        });

    match spawned {
        Ok(_) => true,
        Err(e) => failed(format!("could not spawn worker thread: {}", e)),
    }
}

fn coordinate(
    guard: ActiveRun,
    plan: RunPlan,
    token: CancellationToken,
    events: Sender<SupervisorEvent>,
) -> RunSummary {
    let started = Instant::now();
    let inner = guard.inner.clone();
    let total = plan.process_count;
    let (progress_tx, progress_rx) = unbounded::<ProgressRecord>();

    let mut seeds = Vec::with_capacity(total);
    let mut launched = 0usize;
    let mut finished = 0usize;
    let mut failed = 0usize;
    let mut cancelled = false;

    let launch_ticker = tick(plan.start_interval);
    let status_ticker = tick(plan.status_interval);
    let mut status = inner.status();

    let launch_next = |launched: &mut usize, seeds: &mut Vec<u64>| {
        let seed = plan.template.seed + *launched as u64;
        seeds.push(seed);
        *launched += 1;
        launch_worker(&inner, &plan, seed, &token, &progress_tx);
    };

    launch_next(&mut launched, &mut seeds);

    // Runs until every planned worker was launched and has ended, or until
    // cancellation stops further launches and the live workers have ended.
    while finished < launched || (launched < total && !cancelled) {
        if token.is_cancellation_requested() && !cancelled {
            cancelled = true;
            debug!("Cancellation requested, no further workers are launched");
        }

        let launches = if launched < total && !cancelled {
            launch_ticker.clone()
        } else {
            never()
        };
        let statuses = if cancelled { never() } else { status_ticker.clone() };

        select! {
            recv(progress_rx) -> msg => {
                // The coordinator holds a sender, so the channel never closes here.
                if let Ok(record) = msg {
                    if record.is_terminal() {
                        finished += 1;
                        match record.status {
                            WorkerStatus::Failed => {
                                failed += 1;
                                warn!("Worker {} failed: {}", record.seed, record.message);
                            }
                            WorkerStatus::Stopped => cancelled = true,
                            _ => {}
                        }
                    }
                    let _ = events.send(SupervisorEvent {
                        progress: Some(record),
                        finished_processes: finished,
                        total_processes: total,
                        status,
                    });
                }
            }
            recv(statuses) -> _ => {
                status = inner.status();
                let _ = events.send(SupervisorEvent {
                    progress: None,
                    finished_processes: finished,
                    total_processes: total,
                    status,
                });
            }
            recv(launches) -> _ => launch_next(&mut launched, &mut seeds),
            default(CANCEL_POLL) => {}
        }
    }

    let outcome = if cancelled || token.is_cancellation_requested() {
        RunOutcome::Cancelled
    } else if failed > 0 {
        RunOutcome::Failed
    } else {
        RunOutcome::Finished
    };

    // Settle files and release the job before the final status.
    drop(guard);

    let status = inner.status();
    let _ = events.send(SupervisorEvent {
        progress: None,
        finished_processes: finished,
        total_processes: total,
        status,
    });

    RunSummary {
        outcome,
        seeds,
        finished,
        failed,
        atom_count: status.atom_count,
        elapsed: started.elapsed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_seed_never_reuses() {
        assert_eq!(first_seed(None, 101), 101);
        assert_eq!(first_seed(Some(103), 101), 104);
        assert_eq!(first_seed(Some(103), 103), 104);
        assert_eq!(first_seed(Some(103), 500), 500);
    }
}
