use std::time::{Duration, Instant};

use crossbeam_channel::{after, never, select, tick, Receiver};
use log::debug;

use crate::analysis::spectrum::{calculate_change, Spectrum};
use crate::core::cancel::CancellationToken;
use crate::core::config::OptimizationParams;
use crate::engine::supervisor::SupervisorEvent;

const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Why the initial simulation stopped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GateOutcome {
    /// Two successive samples differed by less than the stop percentage.
    Converged { change: f64 },
    /// `check_max` passed first.
    TimedOut,
    /// The optimization itself was cancelled.
    Cancelled,
    /// Every worker exited on its own.
    SimulationEnded,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GateReport {
    pub outcome: GateOutcome,
    pub samples: usize,
    pub last_change: f64,
    pub elapsed: Duration,
}

/// Watches a running simulation and stops it once the spectrum it
/// produces has stabilized.
///
/// Samples are compared with the previous sample, not with the measured
/// reference.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvergenceGate {
    pub stop_percent: f64,
    pub check_interval: Duration,
    pub check_min: Duration,
    pub check_max: Duration,
    pub channel_width: f64,
}

impl ConvergenceGate {
    pub fn from_params(params: &OptimizationParams, channel_width: f64) -> Self {
        Self {
            stop_percent: params.stop_percent,
            check_interval: params.check_interval(),
            check_min: params.check_min(),
            check_max: params.check_max(),
            channel_width,
        }
    }

    /// Runs until convergence, timeout, cancellation or the end of the
    /// simulation. `run_token` is cancelled on every exit except
    /// `SimulationEnded`; `on_event` sees every supervisor event.
    pub fn watch<S, E>(
        &self,
        events: &Receiver<SupervisorEvent>,
        run_token: &CancellationToken,
        outer: &CancellationToken,
        mut sample: S,
        mut on_event: E,
    ) -> GateReport
    where
        S: FnMut() -> Option<Spectrum>,
        E: FnMut(SupervisorEvent),
    {
        let started = Instant::now();
        let deadline = after(self.check_max);
        let mut first_check = Some(after(self.check_min));
        let interval = tick(self.check_interval.max(Duration::from_millis(1)));

        let mut previous: Option<Spectrum> = None;
        let mut samples = 0usize;
        let mut last_change = f64::INFINITY;

        let finish = |outcome: GateOutcome, samples: usize, last_change: f64| {
            if outcome != GateOutcome::SimulationEnded {
                run_token.request_cancellation();
            }
            GateReport {
                outcome,
                samples,
                last_change,
                elapsed: started.elapsed(),
            }
        };

        loop {
            if outer.propagate_to(run_token) {
                return finish(GateOutcome::Cancelled, samples, last_change);
            }

            let checks = match &first_check {
                Some(first) => first.clone(),
                None => never(),
            };
            let ticks = if first_check.is_some() { never() } else { interval.clone() };

            let mut due = false;
            select! {
                recv(events) -> msg => match msg {
                    Ok(event) => on_event(event),
                    Err(_) => return finish(GateOutcome::SimulationEnded, samples, last_change),
                },
                recv(checks) -> _ => {
                    first_check = None;
                    due = true;
                }
                recv(ticks) -> _ => due = true,
                recv(deadline) -> _ => return finish(GateOutcome::TimedOut, samples, last_change),
                default(CANCEL_POLL) => {}
            }

            if !due {
                continue;
            }

            let current = sample().unwrap_or_default();
            samples += 1;
            last_change = match &previous {
                Some(prev) => calculate_change(prev, &current, self.channel_width),
                None => f64::INFINITY,
            };
            debug!("Convergence sample {}: change {:.5}", samples, last_change);
            previous = Some(current);

            if last_change <= self.stop_percent {
                return finish(GateOutcome::Converged { change: last_change }, samples, last_change);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    fn gate(max_ms: u64) -> ConvergenceGate {
        ConvergenceGate {
            stop_percent: 0.3,
            check_interval: Duration::from_millis(10),
            check_min: Duration::ZERO,
            check_max: Duration::from_millis(max_ms),
            channel_width: 1.0,
        }
    }

    fn flat(height: f64) -> Spectrum {
        Spectrum::new((0..5).map(|i| (i as f64, height)).collect())
    }

    #[test]
    fn stable_spectra_converge_early() {
        let (_tx, rx) = unbounded();
        let run = CancellationToken::new();
        let report = gate(5_000).watch(&rx, &run, &CancellationToken::new(), || Some(flat(10.0)), |_| {});
        assert!(matches!(report.outcome, GateOutcome::Converged { .. }));
        assert_eq!(report.samples, 2);
        assert!(run.is_cancellation_requested());
        assert!(report.elapsed < Duration::from_secs(5));
    }

    #[test]
    fn moving_spectra_run_until_check_max() {
        let (_tx, rx) = unbounded();
        let run = CancellationToken::new();
        let mut h = 0.0;
        let report = gate(200).watch(
            &rx,
            &run,
            &CancellationToken::new(),
            || {
                h += 10.0;
                Some(flat(h))
            },
            |_| {},
        );
        assert_eq!(report.outcome, GateOutcome::TimedOut);
        assert!(report.samples > 1);
        assert!(run.is_cancellation_requested());
    }

    #[test]
    fn ended_simulation_is_not_cancelled() {
        let (tx, rx) = unbounded::<SupervisorEvent>();
        drop(tx);
        let run = CancellationToken::new();
        let report = gate(5_000).watch(&rx, &run, &CancellationToken::new(), || None, |_| {});
        assert_eq!(report.outcome, GateOutcome::SimulationEnded);
        assert!(!run.is_cancellation_requested());
    }

    #[test]
    fn outer_cancellation_reaches_the_run() {
        let (_tx, rx) = unbounded();
        let run = CancellationToken::new();
        let outer = CancellationToken::new();
        outer.request_cancellation();
        let report = gate(5_000).watch(&rx, &run, &outer, || None, |_| {});
        assert_eq!(report.outcome, GateOutcome::Cancelled);
        assert!(run.is_cancellation_requested());
    }
}
