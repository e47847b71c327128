use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::Sender;
use log::{debug, info};
use nalgebra::DVector;
use rayon::prelude::*;

use crate::core::cancel::CancellationToken;
use crate::core::config::GradientParams;
use crate::engine::evaluator::{Candidate, CandidateStatus, Evaluator, SearchSpace};
use crate::solvers::{GenStats, SearchOutcome, SearchStrategy, SolverEvent};

/// Halvings tried by the line search before a step is given up.
const MAX_BACKTRACKS: usize = 10;
/// Fraction of the predicted decrease a step must achieve to be accepted.
const SUFFICIENT_DECREASE: f64 = 1e-4;

/// Projected gradient descent on the primary objective, with central
/// finite differences and a backtracking line search inside the box.
pub struct GradientDescent {
    params: GradientParams,
}

impl GradientDescent {
    pub fn new(params: GradientParams) -> Self {
        Self { params }
    }

    fn project(space: &SearchSpace, x: &DVector<f64>) -> DVector<f64> {
        let mut genes: Vec<f64> = x.iter().copied().collect();
        space.repair(&mut genes);
        DVector::from_vec(genes)
    }

    /// Central differences over the free genes. Returns the gradient and the
    /// number of evaluations spent.
    fn gradient(&self, evaluator: &dyn Evaluator, x: &DVector<f64>) -> (DVector<f64>, usize) {
        let space = evaluator.search_space();
        let free = space.free_indices();

        let partials: Vec<(usize, f64)> = free
            .par_iter()
            .map(|&i| {
                let h = (self.params.difference_step * space.range(i)).max(f64::EPSILON);
                let mut up = x.clone();
                let mut down = x.clone();
                up[i] = (x[i] + h).min(space.upper[i]);
                down[i] = (x[i] - h).max(space.lower[i]);
                let width = up[i] - down[i];
                if width <= 0.0 {
                    return (i, 0.0);
                }
                let f_up = evaluator.objective(up.as_slice()).unwrap_or(f64::INFINITY);
                let f_down = evaluator.objective(down.as_slice()).unwrap_or(f64::INFINITY);
                let d = (f_up - f_down) / width;
                (i, if d.is_finite() { d } else { 0.0 })
            })
            .collect();

        let mut g = DVector::zeros(x.len());
        for (i, d) in partials {
            g[i] = d;
        }
        (g, free.len() * 2)
    }

    fn score(evaluator: &dyn Evaluator, x: &DVector<f64>) -> Candidate {
        let mut c = Candidate::new(x.iter().copied().collect());
        match evaluator.evaluate(&c) {
            Ok(values) => {
                c.objectives = Some(values);
                c.status = CandidateStatus::Evaluated;
            }
            Err(e) => {
                debug!("Gradient point discarded: {:#}", e);
                c.status = CandidateStatus::Discarded;
            }
        }
        c
    }
}

impl SearchStrategy for GradientDescent {
    fn name(&self) -> &str {
        "Projected gradient descent"
    }

    fn budget(&self) -> usize {
        self.params.max_iterations
    }

    fn search(
        &self,
        evaluator: Arc<dyn Evaluator>,
        initial: Vec<Vec<f64>>,
        token: &CancellationToken,
        tx: &Sender<SolverEvent>,
    ) -> SearchOutcome {
        let started = Instant::now();
        let space = evaluator.search_space();
        let eval = evaluator.as_ref();

        let start = initial
            .into_iter()
            .next()
            .unwrap_or_else(|| space.lower.clone());
        let mut x = Self::project(space, &DVector::from_vec(start));
        let mut current = Self::score(eval, &x);
        let mut evaluations = 1;

        if current.status == CandidateStatus::Discarded {
            let _ = tx.send(SolverEvent::Log("Starting point could not be evaluated".to_string()));
            return SearchOutcome {
                front: Vec::new(),
                evaluations,
                cancelled: false,
            };
        }
        let _ = tx.send(SolverEvent::NewBest(current.clone()));

        let diagonal = space
            .free_indices()
            .iter()
            .map(|&i| space.range(i).powi(2))
            .sum::<f64>()
            .sqrt();
        let mut step = self.params.initial_step * diagonal;
        let mut cancelled = false;

        for iteration in 1..=self.params.max_iterations {
            if token.is_cancellation_requested() {
                cancelled = true;
                break;
            }

            let (g, spent) = self.gradient(eval, &x);
            evaluations += spent;
            let norm = g.norm();
            if !(norm.is_finite() && norm > 0.0) {
                debug!("Gradient vanished at iteration {}", iteration);
                break;
            }
            let direction = g.scale(-1.0 / norm);

            let fx = current.objectives_or_worst().primary;
            let mut t = step;
            let mut accepted = None;
            for _ in 0..MAX_BACKTRACKS {
                let trial_x = Self::project(space, &(&x + &direction * t));
                if trial_x == x {
                    t *= 0.5;
                    continue;
                }
                let trial = Self::score(eval, &trial_x);
                evaluations += 1;
                // Armijo condition on the projected step.
                let predicted = g.dot(&(&x - &trial_x));
                let f_trial = trial.objectives_or_worst().primary;
                if f_trial < fx && f_trial <= fx - SUFFICIENT_DECREASE * predicted {
                    accepted = Some((trial_x, trial));
                    break;
                }
                t *= 0.5;
            }

            let Some((next_x, next)) = accepted else {
                debug!("Line search found no descent at iteration {}", iteration);
                break;
            };
            let improvement = fx - next.objectives_or_worst().primary;
            x = next_x;
            current = next;
            step = t * 2.0;
            let _ = tx.send(SolverEvent::NewBest(current.clone()));

            let values = current.objectives_or_worst();
            let _ = tx.send(SolverEvent::GenerationUpdate(GenStats {
                generation: iteration,
                best_objective: values.primary,
                avg_objective: values.primary,
                worst_objective: values.primary,
                front_size: 1,
                valid_count: 1,
                pop_size: 1,
                evaluations,
                evaluations_left: self.params.max_iterations - iteration,
                pareto_front: vec![values],
                elapsed: started.elapsed(),
            }));

            if improvement < self.params.tolerance {
                break;
            }
        }

        info!("Gradient search finished. Total evals: {}", evaluations);
        SearchOutcome {
            front: vec![current],
            evaluations,
            cancelled,
        }
    }
}
