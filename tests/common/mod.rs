#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;

use erdsim::analysis::spectrum::Spectrum;
use erdsim::core::cancel::CancellationToken;
use erdsim::core::domain::{Element, RecoilDistribution, RecoilPoint, SimulationJob};
use erdsim::engine::error::EngineResult;
use erdsim::engine::external::espe::{EspeRequest, SpectrumReconstructor};
use erdsim::engine::external::mcerd::{ProgressStream, SimulatorBackend, WorkerInput};
use erdsim::engine::progress::{ProgressRecord, WorkerStatus};
use erdsim::engine::tracker::LineCounter;

/// A job with one 4He recoil rooted in `dir`.
pub fn job_in(dir: &Path) -> SimulationJob {
    let recoil = RecoilDistribution::new(
        "default",
        Element::new("He", Some(4), 4.0026),
        vec![
            RecoilPoint::new(0.0, 0.5),
            RecoilPoint::new(20.0, 0.5),
            RecoilPoint::new(20.01, 0.0001),
            RecoilPoint::new(100.0, 0.0001),
        ],
    );
    SimulationJob {
        directory: dir.to_path_buf(),
        recoils: vec![recoil],
        ..Default::default()
    }
}

pub fn write_lines(path: &Path, n: usize) {
    let body: String = (0..n).map(|i| format!("event {}\n", i)).collect();
    fs::write(path, body).unwrap();
}

// --- Simulator ---

/// Pretends to be the simulator: writes `lines` events to the result file
/// and reports a short run. With `hold` set it keeps running until
/// cancelled.
pub struct MockBackend {
    pub launched: Mutex<Vec<u64>>,
    pub lines: usize,
    pub hold: bool,
    pub fail_seed: Option<u64>,
}

impl MockBackend {
    pub fn new(lines: usize) -> Self {
        Self {
            launched: Mutex::new(Vec::new()),
            lines,
            hold: false,
            fail_seed: None,
        }
    }

    pub fn holding() -> Self {
        Self {
            hold: true,
            ..Self::new(1)
        }
    }

    pub fn seeds(&self) -> Vec<u64> {
        self.launched.lock().clone()
    }
}

impl SimulatorBackend for MockBackend {
    fn launch(&self, input: &WorkerInput, token: CancellationToken) -> EngineResult<ProgressStream> {
        self.launched.lock().push(input.seed);
        write_lines(&input.result_file(), self.lines);

        let mut running = ProgressRecord::new(input.seed, &input.stem);
        running.calculated = 50;
        running.total = 100;
        running.percentage = 50;

        let mut last = running.clone();
        if self.fail_seed == Some(input.seed) {
            last.status = WorkerStatus::Failed;
            last.message = "mock failure".to_string();
            return Ok(Box::new(std::iter::once(last)));
        }

        let hold = self.hold;
        let mut sent_running = false;
        let mut done = false;
        let stream = std::iter::from_fn(move || {
            if done {
                return None;
            }
            if !sent_running {
                sent_running = true;
                return Some(running.clone());
            }
            while hold && !token.is_cancellation_requested() {
                thread::sleep(Duration::from_millis(5));
            }
            done = true;
            last.status = if hold { WorkerStatus::Stopped } else { WorkerStatus::Finished };
            last.percentage = 100;
            Some(last.clone())
        });
        Ok(Box::new(stream))
    }

    fn name(&self) -> &str {
        "mock-mcerd"
    }
}

// --- Reconstruction ---

/// Returns a fixed-shape spectrum scaled linearly by the requested fluence.
pub struct MockReconstructor {
    pub requests: Mutex<Vec<EspeRequest>>,
}

impl MockReconstructor {
    pub fn new() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn shape(fluence: f64) -> Spectrum {
        let scale = fluence / 1.0e12;
        Spectrum::new(
            (0..20)
                .map(|i| {
                    let e = 1.0 + i as f64 * 0.025;
                    let h = 10.0 - (i as f64 - 10.0).abs();
                    (e, h * scale)
                })
                .collect(),
        )
    }
}

impl SpectrumReconstructor for MockReconstructor {
    fn reconstruct(&self, request: &EspeRequest) -> Result<Spectrum> {
        self.requests.lock().push(request.clone());
        Ok(Self::shape(request.fluence))
    }

    fn name(&self) -> &str {
        "mock-get_espe"
    }
}

// --- Line Counting ---

/// Reports a fixed count per file and remembers how often it was asked.
pub struct CountingLineCounter {
    pub calls: AtomicUsize,
    pub lines: u64,
    pub seen: Mutex<Vec<PathBuf>>,
}

impl CountingLineCounter {
    pub fn new(lines: u64) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            lines,
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl LineCounter for CountingLineCounter {
    fn count_lines(&self, path: &Path) -> u64 {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().push(path.to_path_buf());
        self.lines
    }
}
