use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::debug;
use parking_lot::{Mutex, RwLock};

use crate::core::naming;
use crate::engine::error::{EngineError, EngineResult, Partition};

/// Counts the observed atoms (lines) of a result file.
pub trait LineCounter: Send + Sync {
    fn count_lines(&self, path: &Path) -> u64;
}

/// Reads the file from disk. A missing or unreadable file counts as empty.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileLineCounter;

impl LineCounter for FileLineCounter {
    fn count_lines(&self, path: &Path) -> u64 {
        let Ok(file) = File::open(path) else {
            return 0;
        };
        let mut reader = BufReader::new(file);
        let mut buf = Vec::with_capacity(256);
        let mut lines = 0;
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => lines += 1,
                Err(_) => break,
            }
        }
        lines
    }
}

/// Snapshot of one tracked file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultFileRecord {
    pub path: PathBuf,
    pub seed: Option<u64>,
    pub active: bool,
}

#[derive(Debug, Default)]
struct Partitions {
    active: BTreeMap<PathBuf, Option<u64>>,
    settled: BTreeMap<PathBuf, Option<u64>>,
}

impl Partitions {
    fn partition_of(&self, path: &Path) -> Option<Partition> {
        if self.active.contains_key(path) {
            Some(Partition::Active)
        } else if self.settled.contains_key(path) {
            Some(Partition::Settled)
        } else {
            None
        }
    }
}

/// Cached settled counts. `generation` changes on every clear, so a count
/// taken before a clear is never stored after it.
#[derive(Debug, Default)]
struct CountCache {
    generation: u64,
    counts: HashMap<PathBuf, u64>,
}

/// Tracks which result files of one recoil are still being written
/// (active) and which are complete (settled).
///
/// Line counts of settled files are cached per path until [`clear`](Self::clear).
pub struct ResultFileTracker {
    stem: String,
    state: RwLock<Partitions>,
    cache: Mutex<CountCache>,
    counter: Arc<dyn LineCounter>,
}

impl ResultFileTracker {
    pub fn new(stem: &str) -> Self {
        Self::with_counter(stem, Arc::new(FileLineCounter))
    }

    pub fn with_counter(stem: &str, counter: Arc<dyn LineCounter>) -> Self {
        Self {
            stem: stem.to_string(),
            state: RwLock::new(Partitions::default()),
            cache: Mutex::new(CountCache::default()),
            counter,
        }
    }

    /// Builds a tracker whose settled partition holds every matching result
    /// file already present in `directory`.
    pub fn from_directory(
        directory: &Path,
        stem: &str,
        counter: Arc<dyn LineCounter>,
    ) -> EngineResult<Self> {
        let tracker = Self::with_counter(stem, counter);
        for path in naming::matching_erd_files(directory, stem)? {
            tracker.add_settled_file(&path)?;
        }
        Ok(tracker)
    }

    pub fn stem(&self) -> &str {
        &self.stem
    }

    /// Changes the naming stem. Existing records are dropped.
    pub fn set_stem(&mut self, stem: &str) {
        self.stem = stem.to_string();
        self.clear();
    }

    fn validate(&self, path: &Path) -> EngineResult<Option<u64>> {
        if !naming::is_erd_file(&self.stem, path) {
            return Err(EngineError::InvalidResultFile {
                path: path.to_path_buf(),
            });
        }
        Ok(naming::seed_of(path))
    }

    /// Registers a file a worker is about to write.
    pub fn add_active_file(&self, path: &Path) -> EngineResult<()> {
        let seed = self.validate(path)?;
        let mut state = self.state.write();
        if let Some(partition) = state.partition_of(path) {
            return Err(EngineError::DuplicateFile {
                path: path.to_path_buf(),
                partition,
            });
        }
        debug!("Tracking active result file {}", path.display());
        state.active.insert(path.to_path_buf(), seed);
        Ok(())
    }

    /// Registers a file that is already complete.
    pub fn add_settled_file(&self, path: &Path) -> EngineResult<()> {
        let seed = self.validate(path)?;
        let mut state = self.state.write();
        if let Some(partition) = state.partition_of(path) {
            return Err(EngineError::DuplicateFile {
                path: path.to_path_buf(),
                partition,
            });
        }
        state.settled.insert(path.to_path_buf(), seed);
        Ok(())
    }

    /// Moves every active file to the settled partition.
    pub fn update(&self) {
        let mut state = self.state.write();
        let active = std::mem::take(&mut state.active);
        state.settled.extend(active);
    }

    /// Forgets every file and drops cached counts.
    pub fn clear(&self) {
        let mut state = self.state.write();
        state.active.clear();
        state.settled.clear();
        let mut cache = self.cache.lock();
        cache.counts.clear();
        cache.generation += 1;
    }

    /// Line count of files still being written. Never cached.
    pub fn active_atom_count(&self) -> u64 {
        let paths: Vec<PathBuf> = self.state.read().active.keys().cloned().collect();
        paths.iter().map(|p| self.counter.count_lines(p)).sum()
    }

    /// Line count of settled files, each counted once.
    pub fn settled_atom_count(&self) -> u64 {
        let (paths, generation) = {
            let state = self.state.read();
            let paths: Vec<PathBuf> = state.settled.keys().cloned().collect();
            (paths, self.cache.lock().generation)
        };
        paths.iter().map(|p| self.cached_count(p, generation)).sum()
    }

    pub fn total_atom_count(&self) -> u64 {
        self.active_atom_count() + self.settled_atom_count()
    }

    /// Lookup and insert happen under one lock; a clear waits for the count.
    fn cached_count(&self, path: &Path, generation: u64) -> u64 {
        let mut cache = self.cache.lock();
        if let Some(&n) = cache.counts.get(path) {
            return n;
        }
        let n = self.counter.count_lines(path);
        if cache.generation == generation {
            cache.counts.insert(path.to_path_buf(), n);
        }
        n
    }

    /// Largest seed in either partition, `None` when nothing is tracked.
    pub fn max_seed(&self) -> Option<u64> {
        let state = self.state.read();
        state
            .active
            .values()
            .chain(state.settled.values())
            .filter_map(|s| *s)
            .max()
    }

    pub fn records(&self) -> Vec<ResultFileRecord> {
        let state = self.state.read();
        let active = state.active.iter().map(|(p, s)| ResultFileRecord {
            path: p.clone(),
            seed: *s,
            active: true,
        });
        let settled = state.settled.iter().map(|(p, s)| ResultFileRecord {
            path: p.clone(),
            seed: *s,
            active: false,
        });
        active.chain(settled).collect()
    }

    /// Paths of every tracked file, active first.
    pub fn files(&self) -> Vec<PathBuf> {
        let state = self.state.read();
        state
            .active
            .keys()
            .chain(state.settled.keys())
            .cloned()
            .collect()
    }

    pub fn active_len(&self) -> usize {
        self.state.read().active.len()
    }

    pub fn settled_len(&self) -> usize {
        self.state.read().settled.len()
    }

    pub fn len(&self) -> usize {
        let state = self.state.read();
        state.active.len() + state.settled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ResultFileTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("ResultFileTracker")
            .field("stem", &self.stem)
            .field("active", &state.active.len())
            .field("settled", &state.settled.len())
            .finish()
    }
}
