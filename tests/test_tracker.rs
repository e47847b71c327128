use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use erdsim::engine::error::{EngineError, Partition};
use erdsim::engine::tracker::{FileLineCounter, LineCounter, ResultFileTracker};
use tempfile::tempdir;

use crate::common::{write_lines, CountingLineCounter};

mod common;

const STEM: &str = "4He-default";

#[test]
fn test_partitions_stay_disjoint() {
    let tracker = ResultFileTracker::with_counter(STEM, CountingLineCounter::new(1));
    let path = Path::new("/tmp/sim/4He-default.101.erd");

    tracker.add_active_file(path).unwrap();
    match tracker.add_settled_file(path) {
        Err(EngineError::DuplicateFile { partition, .. }) => assert_eq!(partition, Partition::Active),
        other => panic!("expected duplicate error, got {:?}", other),
    }

    tracker.update();
    assert_eq!(tracker.active_len(), 0);
    assert_eq!(tracker.settled_len(), 1);

    match tracker.add_active_file(path) {
        Err(EngineError::DuplicateFile { partition, .. }) => assert_eq!(partition, Partition::Settled),
        other => panic!("expected duplicate error, got {:?}", other),
    }
}

#[test]
fn test_foreign_files_are_rejected() {
    let tracker = ResultFileTracker::with_counter(STEM, CountingLineCounter::new(1));
    for bad in ["4He-other.101.erd", "4He-default.101.txt", "4He-default.erd"] {
        assert!(
            matches!(tracker.add_active_file(Path::new(bad)), Err(EngineError::InvalidResultFile { .. })),
            "{} was accepted",
            bad
        );
    }
    assert!(tracker.is_empty());
}

#[test]
fn test_update_is_idempotent() {
    let tracker = ResultFileTracker::with_counter(STEM, CountingLineCounter::new(1));
    tracker.add_active_file(Path::new("4He-default.101.erd")).unwrap();
    tracker.add_active_file(Path::new("4He-default.102.erd")).unwrap();

    tracker.update();
    let first = tracker.records();
    tracker.update();
    assert_eq!(tracker.records(), first);
    assert!(first.iter().all(|r| !r.active));
    assert_eq!(tracker.max_seed(), Some(102));
}

#[test]
fn test_settled_counts_are_cached() {
    let counter = CountingLineCounter::new(7);
    let tracker = ResultFileTracker::with_counter(STEM, counter.clone());
    tracker.add_settled_file(Path::new("4He-default.101.erd")).unwrap();
    tracker.add_active_file(Path::new("4He-default.102.erd")).unwrap();

    assert_eq!(tracker.total_atom_count(), 14);
    assert_eq!(tracker.total_atom_count(), 14);
    // Settled once, active on every call.
    assert_eq!(counter.calls(), 3);

    tracker.clear();
    assert_eq!(tracker.total_atom_count(), 0);
    assert_eq!(tracker.max_seed(), None);
}

#[test]
fn test_existing_files_are_picked_up() {
    let dir = tempdir().unwrap();
    write_lines(&dir.path().join("4He-default.101.erd"), 3);
    write_lines(&dir.path().join("4He-default.105.erd"), 4);
    write_lines(&dir.path().join("4He-default.combined.erd"), 2);
    write_lines(&dir.path().join("4He-opt.201.erd"), 9);

    let counter = CountingLineCounter::new(1);
    let tracker = ResultFileTracker::from_directory(dir.path(), STEM, counter).unwrap();
    assert_eq!(tracker.settled_len(), 3);
    assert_eq!(tracker.active_len(), 0);
    // The combined file carries no seed.
    assert_eq!(tracker.max_seed(), Some(105));
}

#[test]
fn test_second_active_add_leaves_state_unchanged() {
    let tracker = ResultFileTracker::with_counter(STEM, CountingLineCounter::new(4));
    let path = Path::new("/tmp/sim/4He-default.101.erd");
    tracker.add_active_file(path).unwrap();

    let records = tracker.records();
    let total = tracker.total_atom_count();
    match tracker.add_active_file(path) {
        Err(EngineError::DuplicateFile { partition, .. }) => assert_eq!(partition, Partition::Active),
        other => panic!("expected duplicate error, got {:?}", other),
    }
    assert_eq!(tracker.records(), records);
    assert_eq!(tracker.total_atom_count(), total);
    assert_eq!(tracker.active_len(), 1);
}

/// Counts from disk, then parks the first call until released.
struct ParkedCounter {
    parked: AtomicBool,
    entered: Sender<()>,
    release: Receiver<()>,
}

impl LineCounter for ParkedCounter {
    fn count_lines(&self, path: &Path) -> u64 {
        let n = FileLineCounter.count_lines(path);
        if !self.parked.swap(true, Ordering::SeqCst) {
            let _ = self.entered.send(());
            let _ = self.release.recv();
        }
        n
    }
}

#[test]
fn test_clear_during_count_does_not_cache_stale_value() {
    let dir = tempdir().unwrap();
    let path: PathBuf = dir.path().join("4He-default.101.erd");
    write_lines(&path, 5);

    let (entered_tx, entered_rx) = bounded(1);
    let (release_tx, release_rx) = bounded(1);
    let counter = Arc::new(ParkedCounter {
        parked: AtomicBool::new(false),
        entered: entered_tx,
        release: release_rx,
    });
    let tracker = Arc::new(ResultFileTracker::with_counter(STEM, counter));
    tracker.add_settled_file(&path).unwrap();

    let reader = {
        let tracker = tracker.clone();
        thread::spawn(move || tracker.settled_atom_count())
    };
    entered_rx.recv().unwrap();
    let clearer = {
        let tracker = tracker.clone();
        thread::spawn(move || tracker.clear())
    };
    // A fresh run rewrites the same seed.
    thread::sleep(Duration::from_millis(50));
    write_lines(&path, 2);
    release_tx.send(()).unwrap();

    assert_eq!(reader.join().unwrap(), 5);
    clearer.join().unwrap();

    tracker.add_settled_file(&path).unwrap();
    assert_eq!(tracker.settled_atom_count(), 2);
}
