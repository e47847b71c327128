use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use erdsim::core::domain::{OptimizationType, SimulationState};
use erdsim::engine::error::StartRejection;
use erdsim::engine::progress::WorkerStatus;
use erdsim::engine::supervisor::{EspeOptions, RunOutcome, SimulationSupervisor, StartOptions};
use tempfile::tempdir;

use crate::common::{job_in, write_lines, MockBackend, MockReconstructor};

mod common;

fn quick(process_count: usize) -> StartOptions {
    StartOptions {
        process_count,
        start_value: Some(101),
        start_interval: Duration::from_millis(5),
        status_interval: Duration::from_millis(10),
        ..Default::default()
    }
}

fn supervisor(dir: &std::path::Path, backend: Arc<MockBackend>) -> SimulationSupervisor {
    SimulationSupervisor::new(job_in(dir), backend, Arc::new(MockReconstructor::new())).unwrap()
}

#[test]
fn test_three_processes_run_to_completion() {
    let dir = tempdir().unwrap();
    let backend = Arc::new(MockBackend::new(10));
    let sup = supervisor(dir.path(), backend.clone());

    let run = sup.start(quick(3)).unwrap();
    assert_eq!(run.first_seed(), 101);
    let summary = run.wait();

    assert_eq!(summary.outcome, RunOutcome::Finished);
    assert_eq!(summary.seeds, vec![101, 102, 103]);
    assert_eq!(summary.finished, 3);
    assert_eq!(summary.atom_count, 30);

    assert!(!sup.is_running());
    assert!(sup.is_finished());
    assert_eq!(sup.erd_files().len(), 3);
    assert_eq!(sup.current_status().state, SimulationState::Done);
    let mut seeds = backend.seeds();
    seeds.sort();
    assert_eq!(seeds, vec![101, 102, 103]);
}

#[test]
fn test_events_end_with_final_status() {
    let dir = tempdir().unwrap();
    let sup = supervisor(dir.path(), Arc::new(MockBackend::new(4)));

    let events: Vec<_> = sup.start(quick(2)).unwrap().collect();
    let last = events.last().unwrap();
    assert!(last.progress.is_none());
    assert_eq!(last.finished_processes, 2);
    assert_eq!(last.status.state, SimulationState::Done);
    assert_eq!(last.status.atom_count, 8);

    let terminal = events
        .iter()
        .filter(|e| e.progress.as_ref().map_or(false, |p| p.is_terminal()))
        .count();
    assert_eq!(terminal, 2);
}

#[test]
fn test_seeds_never_repeat_across_runs() {
    let dir = tempdir().unwrap();
    let backend = Arc::new(MockBackend::new(1));
    let sup = supervisor(dir.path(), backend.clone());

    sup.start(quick(2)).unwrap().wait();
    let second = sup.start(quick(1)).unwrap();
    assert_eq!(second.first_seed(), 103);
    second.wait();

    assert_eq!(sup.max_seed(), Some(103));
    assert_eq!(sup.erd_files().len(), 3);
}

#[test]
fn test_earlier_results_raise_the_first_seed() {
    let dir = tempdir().unwrap();
    write_lines(&dir.path().join("4He-default.150.erd"), 5);
    let sup = supervisor(dir.path(), Arc::new(MockBackend::new(1)));
    assert_eq!(sup.atom_count(), 5);

    let run = sup.start(quick(1)).unwrap();
    assert_eq!(run.first_seed(), 151);
    let summary = run.wait();
    assert_eq!(summary.atom_count, 6);
}

#[test]
fn test_fresh_start_discards_old_results() {
    let dir = tempdir().unwrap();
    write_lines(&dir.path().join("4He-default.150.erd"), 5);
    let sup = supervisor(dir.path(), Arc::new(MockBackend::new(2)));

    let options = StartOptions {
        use_old_erd_files: false,
        ..quick(1)
    };
    let run = sup.start(options).unwrap();
    assert_eq!(run.first_seed(), 101);
    run.wait();

    assert!(!dir.path().join("4He-default.150.erd").exists());
    assert_eq!(sup.atom_count(), 2);
}

#[test]
fn test_second_start_is_rejected_while_running() {
    let dir = tempdir().unwrap();
    let sup = supervisor(dir.path(), Arc::new(MockBackend::holding()));

    let run = sup.start(quick(1)).unwrap();
    assert!(sup.is_simulation_running());
    assert_eq!(sup.start(quick(1)).err(), Some(StartRejection::AlreadyRunning));
    assert!(sup.begin_optimization().is_err());

    sup.stop();
    let summary = run.wait();
    assert_eq!(summary.outcome, RunOutcome::Cancelled);
    assert!(sup.wait_until_idle(Duration::from_secs(1)));
    assert!(!sup.is_running());
}

#[test]
fn test_cancellation_stops_pending_launches() {
    let dir = tempdir().unwrap();
    let backend = Arc::new(MockBackend::holding());
    let sup = supervisor(dir.path(), backend.clone());

    let options = StartOptions {
        start_interval: Duration::from_secs(60),
        ..quick(4)
    };
    let run = sup.start(options).unwrap();
    run.token().request_cancellation();
    let summary = run.wait();

    assert_eq!(summary.outcome, RunOutcome::Cancelled);
    assert_eq!(backend.seeds(), vec![101]);
    assert_eq!(summary.seeds, vec![101]);
}

#[test]
fn test_failed_worker_marks_run_failed() {
    let dir = tempdir().unwrap();
    let backend = Arc::new(MockBackend {
        fail_seed: Some(102),
        ..MockBackend::new(1)
    });
    let sup = supervisor(dir.path(), backend);

    let summary = sup.start(quick(2)).unwrap().wait();
    assert_eq!(summary.outcome, RunOutcome::Failed);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.finished, 2);
}

#[test]
fn test_first_worker_failure_does_not_cancel_siblings() {
    let dir = tempdir().unwrap();
    let backend = Arc::new(MockBackend {
        fail_seed: Some(101),
        ..MockBackend::new(1)
    });
    let sup = supervisor(dir.path(), backend.clone());

    let summary = sup.start(quick(3)).unwrap().wait();
    assert_eq!(summary.seeds, vec![101, 102, 103]);
    assert_eq!(summary.outcome, RunOutcome::Failed);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.finished, 3);
    assert_eq!(backend.seeds().len(), 3);
}

#[test]
fn test_stop_ends_every_live_worker() {
    let dir = tempdir().unwrap();
    let backend = Arc::new(MockBackend::holding());
    let sup = supervisor(dir.path(), backend.clone());

    let mut run = sup.start(quick(3)).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while backend.seeds().len() < 3 {
        assert!(Instant::now() < deadline, "only {:?} launched", backend.seeds());
        thread::sleep(Duration::from_millis(5));
    }

    let stopped_at = Instant::now();
    sup.stop();
    let mut stopped: Vec<u64> = run
        .by_ref()
        .filter_map(|e| e.progress)
        .filter(|p| p.status == WorkerStatus::Stopped)
        .map(|p| p.seed)
        .collect();
    assert!(stopped_at.elapsed() < Duration::from_secs(2));
    stopped.sort();
    assert_eq!(stopped, vec![101, 102, 103]);

    let summary = run.wait();
    assert_eq!(summary.outcome, RunOutcome::Cancelled);
    assert_eq!(summary.finished, 3);
    assert!(!sup.is_running());
}

#[test]
fn test_spawn_failure_has_its_own_reason() {
    assert_ne!(StartRejection::SpawnFailed, StartRejection::AlreadyRunning);
    assert!(StartRejection::SpawnFailed.to_string().contains("spawned"));
}

#[test]
fn test_job_without_recoil_is_rejected() {
    let dir = tempdir().unwrap();
    let mut job = job_in(dir.path());
    job.recoils.clear();
    let sup =
        SimulationSupervisor::new(job, Arc::new(MockBackend::new(1)), Arc::new(MockReconstructor::new())).unwrap();
    assert_eq!(sup.start(quick(1)).err(), Some(StartRejection::NoRecoil));
    assert!(!sup.is_running());
}

#[test]
fn test_optimization_guard_blocks_plain_runs() {
    let dir = tempdir().unwrap();
    let sup = supervisor(dir.path(), Arc::new(MockBackend::new(1)));

    let guard = sup.begin_optimization().unwrap();
    assert!(sup.is_optimization_running());
    assert_eq!(sup.start(quick(1)).err(), Some(StartRejection::AlreadyRunning));

    // Runs started by the optimization itself are allowed.
    let options = StartOptions {
        optimization: Some(OptimizationType::Fluence),
        ..quick(1)
    };
    sup.start(options).unwrap().wait();
    assert!(dir.path().join("4He-optfl.101.erd").exists());
    // Optimization runs are not tracked as plain results.
    assert!(sup.erd_files().is_empty());

    drop(guard);
    assert!(!sup.is_optimization_running());
    let summary = sup.start(quick(1)).unwrap().wait();
    assert_eq!(summary.outcome, RunOutcome::Finished);
}

#[test]
fn test_espe_reads_matching_result_files() {
    let dir = tempdir().unwrap();
    let reconstructor = Arc::new(MockReconstructor::new());
    let sup = SimulationSupervisor::new(job_in(dir.path()), Arc::new(MockBackend::new(3)), reconstructor.clone())
        .unwrap();
    sup.start(quick(2)).unwrap().wait();

    let recoil = sup.job().main_recoil().cloned().unwrap();
    let spectrum = sup
        .calculate_espe(
            &recoil,
            &EspeOptions {
                remove_recoil_file: true,
                ..Default::default()
            },
        )
        .unwrap();
    assert!(!spectrum.is_empty());

    let requests = reconstructor.requests.lock();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].erd_files.len(), 2);
    assert!(!requests[0].recoil_file.exists());
}
