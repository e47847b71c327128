use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use serde::Serialize;

use crate::core::cancel::CancellationToken;
use crate::engine::evaluator::{Candidate, Evaluator, ObjectiveValues};
use crate::engine::supervisor::SupervisorEvent;

pub mod base;
pub mod convergence;
pub mod ga;
pub mod gradient;
pub mod objective;

// --- State ---

/// Progress of one optimization. Moves strictly forward; `Error` is
/// reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum OptimizationState {
    Preparing,
    Simulating,
    Running,
    Finished,
    Error,
}

impl OptimizationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OptimizationState::Finished | OptimizationState::Error)
    }

    pub fn can_transition_to(&self, next: OptimizationState) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == OptimizationState::Error || next > *self
    }
}

impl fmt::Display for OptimizationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OptimizationState::Preparing => "Preparing",
            OptimizationState::Simulating => "Simulating",
            OptimizationState::Running => "Running",
            OptimizationState::Finished => "Finished",
            OptimizationState::Error => "Error",
        };
        f.write_str(s)
    }
}

/// Status record reported upward on every transition and generation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizationStatus {
    pub state: OptimizationState,
    pub evaluations_left: usize,
    pub pareto_front: Vec<ObjectiveValues>,
    pub error: Option<String>,
    pub elapsed: Option<Duration>,
}

impl OptimizationStatus {
    pub fn new(state: OptimizationState, evaluations_left: usize) -> Self {
        Self {
            state,
            evaluations_left,
            pareto_front: Vec::new(),
            error: None,
            elapsed: None,
        }
    }
}

/// Detailed statistics for a single generation/iteration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenStats {
    pub generation: usize,
    pub best_objective: f64,
    pub avg_objective: f64,
    pub worst_objective: f64,
    pub front_size: usize,
    pub valid_count: usize, // Candidates whose spectrum could be scored
    pub pop_size: usize,
    pub evaluations: usize,
    pub evaluations_left: usize,
    pub pareto_front: Vec<ObjectiveValues>,
    pub elapsed: Duration,
}

/// Events emitted by the optimizer and its strategies.
#[derive(Debug, Clone)]
pub enum SolverEvent {
    /// Diagnostic log message.
    Log(String),

    /// State transition of the optimization.
    Status(OptimizationStatus),

    /// Forwarded progress of the initial simulation.
    Simulation(SupervisorEvent),

    /// A completed generation or gradient step.
    GenerationUpdate(GenStats),

    /// A candidate that beats the best primary objective so far.
    NewBest(Candidate),

    /// Solver has finished its run.
    Finished,
}

// --- Strategy ---

/// What a strategy hands back: the non-dominated candidates it found.
#[derive(Debug, Clone, Default)]
pub struct SearchOutcome {
    pub front: Vec<Candidate>,
    pub evaluations: usize,
    pub cancelled: bool,
}

/// A search over the evaluator's space. Strategies are interchangeable;
/// both only ever talk to the [`Evaluator`].
pub trait SearchStrategy: Send + Sync {
    fn search(
        &self,
        evaluator: Arc<dyn Evaluator>,
        initial: Vec<Vec<f64>>,
        token: &CancellationToken,
        tx: &Sender<SolverEvent>,
    ) -> SearchOutcome;

    /// Budget reported as `evaluations_left` before the search starts.
    fn budget(&self) -> usize;

    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::OptimizationState::*;

    #[test]
    fn state_machine_only_moves_forward() {
        assert!(Preparing.can_transition_to(Simulating));
        assert!(Preparing.can_transition_to(Running));
        assert!(Simulating.can_transition_to(Running));
        assert!(Running.can_transition_to(Finished));
        assert!(Simulating.can_transition_to(Error));
        assert!(!Running.can_transition_to(Simulating));
        assert!(!Finished.can_transition_to(Error));
        assert!(!Error.can_transition_to(Preparing));
        assert!(!Running.can_transition_to(Running));
    }
}
