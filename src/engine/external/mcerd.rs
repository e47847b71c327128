use std::fs;
use std::io::{BufRead, BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, warn};

use crate::core::cancel::CancellationToken;
use crate::core::domain::{Layer, RecoilDistribution, SimulationJob};
use crate::core::naming;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::progress::{ProgressParser, ProgressRecord, WorkerStatus};

/// How often a worker wakes up to check cancellation and its time limit.
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const SCRATCH_EXTENSIONS: [&str; 4] = ["out", "dat", "range", "pre"];

pub type ProgressStream = Box<dyn Iterator<Item = ProgressRecord> + Send>;

/// Something that can run one simulation worker and stream its progress.
pub trait SimulatorBackend: Send + Sync {
    /// Starts a worker. Fails only if the process could not be started;
    /// later problems are reported as terminal records on the stream.
    fn launch(&self, input: &WorkerInput, token: CancellationToken) -> EngineResult<ProgressStream>;

    fn name(&self) -> &str;
}

// --- Worker Input ---

/// Everything one simulator process needs: the job, the recoil it
/// simulates, its seed and the per-process ion counts.
#[derive(Debug, Clone)]
pub struct WorkerInput {
    pub seed: u64,
    pub directory: PathBuf,
    /// Shared stem of the input, scratch and result files.
    pub stem: String,
    pub recoil: RecoilDistribution,
    pub job: SimulationJob,
    pub number_of_ions: u64,
    pub number_of_preions: u64,
    pub max_time: Option<Duration>,
}

impl WorkerInput {
    pub fn result_file(&self) -> PathBuf {
        self.directory.join(naming::erd_file_name(&self.stem, self.seed))
    }

    pub fn recoil_file(&self) -> PathBuf {
        let suffix = self.job.settings.simulation_type.recoil_suffix();
        self.directory.join(format!("{}.{}", self.stem, suffix))
    }

    /// The simulator names its result file after the command file.
    pub fn command_file(&self) -> PathBuf {
        self.directory.join(&self.stem)
    }

    pub fn target_file(&self) -> PathBuf {
        self.directory.join(format!("{}.erd_target", self.stem))
    }

    pub fn detector_file(&self) -> PathBuf {
        self.directory.join(format!("{}.erd_detector", self.stem))
    }

    pub fn foils_file(&self) -> PathBuf {
        self.directory.join(format!("{}.foils", self.stem))
    }

    pub fn presimulation_file(&self) -> PathBuf {
        self.directory.join(format!("{}.pre", self.stem))
    }

    pub fn command_file_contents(&self) -> String {
        let job = &self.job;
        let s = &job.settings;
        let mut lines = vec![format!("Type of simulation: {}", s.simulation_type.as_mcerd_str())];
        lines.extend(job.beam.mcerd_params());
        lines.extend([
            format!("Target description file: {}", self.target_file().display()),
            format!("Detector description file: {}", self.detector_file().display()),
            format!("Recoiling atom: {}", self.recoil.prefix()),
            format!("Recoiling material distribution: {}", self.recoil_file().display()),
            format!("Target angle: {} deg", job.target.target_theta),
            format!(
                "Beam spot size: {:.1} {:.1} mm",
                job.beam.spot_size.0, job.beam.spot_size.1
            ),
            format!("Minimum angle of scattering: {} deg", s.minimum_scattering_angle),
            format!("Minimum main scattering angle: {} deg", s.minimum_main_scattering_angle),
            format!("Minimum energy of ions: {} MeV", s.minimum_energy),
            format!("Average number of recoils per primary ion: {}", s.number_of_recoils),
            format!("Recoil angle width (wide or narrow): {}", s.simulation_mode.as_mcerd_str()),
            format!("Presimulation * result file: {}", self.presimulation_file().display()),
            format!("Number of real ions per each scaling ion: {}", s.number_of_scaling_ions),
            format!("Number of ions: {}", self.number_of_ions),
            format!("Number of ions in the presimulation: {}", self.number_of_preions),
            format!("Seed number of the random number generator: {}", self.seed),
        ]);
        lines.join("\n")
    }

    pub fn detector_file_contents(&self) -> String {
        let detector = &self.job.detector;
        let foils = detector
            .foils
            .iter()
            .map(|f| f.mcerd_params().join("\n"))
            .collect::<Vec<_>>()
            .join("\n----------\n");

        let mut lines = detector.mcerd_params();
        lines.push(format!(
            "Description file for the detector foils: {}",
            self.foils_file().display()
        ));
        lines.push("==========".to_string());
        lines.push(foils);
        lines.join("\n")
    }

    pub fn target_file_contents(&self) -> EngineResult<String> {
        let layers: Vec<&Layer> = self.job.target.layers.iter().collect();
        layered_contents(&layers, true)
    }

    /// The simulator handles one layer per foil, so only the first is written.
    pub fn foils_file_contents(&self) -> EngineResult<String> {
        let layers: Vec<&Layer> = self
            .job
            .detector
            .foils
            .iter()
            .filter_map(|f| f.layers.first())
            .collect();
        layered_contents(&layers, false)
    }

    /// Writes every input file and removes a stale result file of the same seed.
    pub fn write_input_files(&self) -> EngineResult<()> {
        fs::create_dir_all(&self.directory)?;
        fs::write(self.command_file(), self.command_file_contents())?;
        fs::write(self.detector_file(), self.detector_file_contents())?;
        fs::write(self.target_file(), self.target_file_contents()?)?;
        fs::write(self.foils_file(), self.foils_file_contents()?)?;
        fs::write(self.recoil_file(), self.recoil.file_contents())?;

        let result = self.result_file();
        if result.exists() {
            fs::remove_file(&result)?;
        }
        Ok(())
    }

    /// Removes input and scratch files. Failures are logged, never raised.
    pub fn delete_input_files(&self) {
        for path in [
            self.command_file(),
            self.detector_file(),
            self.target_file(),
            self.foils_file(),
        ] {
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Could not remove {}: {}", path.display(), e);
                }
            }
        }
        remove_scratch_files(&self.directory, &self.stem);
    }
}

/// An element list followed by per-layer blocks that index into it.
fn layered_contents(layers: &[&Layer], surface_layer: bool) -> EngineResult<String> {
    let mut lines: Vec<String> = layers
        .iter()
        .flat_map(|l| l.elements.iter().map(|e| e.mcerd_mass()))
        .collect();

    if surface_layer {
        lines.extend(Layer::default_mcerd_params());
    }

    let mut index = 0;
    for layer in layers {
        lines.extend(layer.mcerd_params());
        for element in &layer.elements {
            let amount = element.mcerd_amount().ok_or_else(|| {
                EngineError::Preparation(format!(
                    "element {} in layer '{}' has no amount",
                    element.prefix(),
                    layer.name
                ))
            })?;
            lines.push(format!("{} {}", index, amount));
            index += 1;
        }
    }
    Ok(lines.join("\n"))
}

fn remove_scratch_files(directory: &Path, stem: &str) {
    let Ok(entries) = fs::read_dir(directory) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let matches_stem = path
            .file_name()
            .and_then(|n| n.to_str())
            .map_or(false, |n| n.starts_with(stem));
        let scratch = path
            .extension()
            .and_then(|e| e.to_str())
            .map_or(false, |e| SCRATCH_EXTENSIONS.contains(&e));
        if matches_stem && scratch {
            if let Err(e) = fs::remove_file(&path) {
                warn!("Could not remove {}: {}", path.display(), e);
            }
        }
    }
}

// --- Process Backend ---

/// Runs the `mcerd` executable as a child process.
pub struct McerdBackend {
    executable: PathBuf,
}

impl McerdBackend {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }
}

impl SimulatorBackend for McerdBackend {
    fn name(&self) -> &str {
        "MCERD"
    }

    fn launch(&self, input: &WorkerInput, token: CancellationToken) -> EngineResult<ProgressStream> {
        input.write_input_files()?;
        let run = WorkerRun::spawn(&self.executable, input.clone(), token)?;
        Ok(Box::new(run))
    }
}

/// A running simulator process, consumed as a stream of progress records.
///
/// The stream ends after exactly one terminal record. Dropping it early
/// kills the process.
pub struct WorkerRun {
    input: WorkerInput,
    child: Child,
    lines: Receiver<String>,
    readers: Vec<JoinHandle<()>>,
    parser: ProgressParser,
    token: CancellationToken,
    started: Instant,
    finished: bool,
}

impl WorkerRun {
    pub fn spawn(executable: &Path, input: WorkerInput, token: CancellationToken) -> EngineResult<Self> {
        let mut child = Command::new(executable)
            .arg(input.command_file())
            .current_dir(&input.directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| {
                input.delete_input_files();
                EngineError::LaunchFailure {
                    executable: executable.display().to_string(),
                    source,
                }
            })?;

        debug!("Started {} (pid {}) with seed {}", executable.display(), child.id(), input.seed);

        let (tx, rx) = unbounded();
        let mut readers = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            readers.push(spawn_reader(out, tx.clone()));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(spawn_reader(err, tx));
        }

        let parser = ProgressParser::new(input.seed, &input.stem);
        Ok(Self {
            input,
            child,
            lines: rx,
            readers,
            parser,
            token,
            started: Instant::now(),
            finished: false,
        })
    }

    pub fn seed(&self) -> u64 {
        self.input.seed
    }

    fn timed_out(&self) -> bool {
        self.input
            .max_time
            .map_or(false, |limit| self.started.elapsed() >= limit)
    }

    /// Kills the process and reaps it. Already exited processes are fine.
    fn kill(&mut self) {
        if let Err(e) = self.child.kill() {
            debug!("kill seed {}: {}", self.input.seed, e);
        }
        let _ = self.child.wait();
    }

    fn finish(&mut self, status: WorkerStatus, message: String) -> ProgressRecord {
        let record = self.parser.terminal(status, message);
        self.teardown(status == WorkerStatus::Finished);
        record
    }

    /// Reader threads are only joined once both pipes have closed; after a
    /// kill, grandchildren may still hold them open.
    fn teardown(&mut self, join_readers: bool) {
        self.finished = true;
        for handle in self.readers.drain(..) {
            if join_readers {
                let _ = handle.join();
            }
        }
        self.input.delete_input_files();
    }

    /// Terminal record for a process whose output has ended.
    fn exit_record(&mut self) -> ProgressRecord {
        match self.child.wait() {
            Ok(status) if status.success() => {
                self.finish(WorkerStatus::Finished, "Simulation finished".to_string())
            }
            Ok(status) => {
                let code = status
                    .code()
                    .map_or_else(|| "signal".to_string(), |c| c.to_string());
                warn!("Simulator with seed {} exited with code {}", self.input.seed, code);
                self.finish(WorkerStatus::Failed, format!("simulator exited with code {}", code))
            }
            Err(e) => self.finish(WorkerStatus::Failed, format!("could not wait for simulator: {}", e)),
        }
    }
}

impl Iterator for WorkerRun {
    type Item = ProgressRecord;

    fn next(&mut self) -> Option<ProgressRecord> {
        if self.finished {
            return None;
        }
        loop {
            if self.token.is_cancellation_requested() {
                self.kill();
                return Some(self.finish(WorkerStatus::Stopped, "Simulation was stopped".to_string()));
            }
            if self.timed_out() {
                self.kill();
                return Some(self.finish(WorkerStatus::TimedOut, "Simulation timed out.".to_string()));
            }

            match self.lines.recv_timeout(POLL_INTERVAL) {
                Ok(line) => {
                    debug!("[seed {}] {}", self.input.seed, line.trim_end());
                    if let Some(record) = self.parser.feed(&line) {
                        if record.is_terminal() {
                            // Let the process flush and exit on its own.
                            let _ = self.child.wait();
                            self.teardown(false);
                        }
                        return Some(record);
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Some(self.exit_record()),
            }
        }
    }
}

impl Drop for WorkerRun {
    fn drop(&mut self) {
        if !self.finished {
            self.kill();
            self.teardown(false);
        }
    }
}

/// Forwards output lines until EOF. Undecodable bytes are replaced, and the
/// pipe keeps draining after the receiver is gone so the simulator never
/// writes into a closed pipe.
fn spawn_reader<R: Read + Send + 'static>(source: R, tx: Sender<String>) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut reader = BufReader::new(source);
        let mut buf = Vec::new();
        let mut forwarding = true;
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    if !forwarding {
                        continue;
                    }
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']);
                    forwarding = tx.send(line.to_string()).is_ok();
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("Stopped reading simulator output: {}", e);
                    break;
                }
            }
        }
    })
}
