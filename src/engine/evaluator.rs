use anyhow::Result;
use rand::{Rng, RngCore};
use serde::Serialize;

use crate::core::domain::round_to;

/// Lifecycle of a candidate inside a search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateStatus {
    Born,
    Evaluated,
    /// Evaluation failed; the candidate ranks last.
    Discarded,
}

/// Scores of one candidate. Both are minimized.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ObjectiveValues {
    pub primary: f64,
    pub secondary: f64,
}

impl ObjectiveValues {
    pub fn new(primary: f64, secondary: f64) -> Self {
        Self { primary, secondary }
    }

    /// Score of a candidate whose spectrum could not be produced.
    pub fn worst() -> Self {
        Self::new(f64::INFINITY, f64::INFINITY)
    }

    pub fn get(&self, index: usize) -> f64 {
        if index == 0 {
            self.primary
        } else {
            self.secondary
        }
    }

    /// Pareto dominance for minimization.
    pub fn dominates(&self, other: &ObjectiveValues) -> bool {
        let mut better = false;
        for i in 0..2 {
            if self.get(i) > other.get(i) {
                return false;
            }
            if self.get(i) < other.get(i) {
                better = true;
            }
        }
        better
    }
}

/// One parameterization proposed by a search strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub genes: Vec<f64>,
    pub objectives: Option<ObjectiveValues>,
    pub status: CandidateStatus,
}

impl Candidate {
    pub fn new(genes: Vec<f64>) -> Self {
        Self {
            genes,
            objectives: None,
            status: CandidateStatus::Born,
        }
    }

    /// Scores of an evaluated candidate, the worst possible otherwise.
    pub fn objectives_or_worst(&self) -> ObjectiveValues {
        self.objectives.unwrap_or_else(ObjectiveValues::worst)
    }
}

// --- Search Space ---

/// Box bounds of a search. Fixed genes never move; gene precision is
/// enforced after every variation.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchSpace {
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
    fixed: Vec<Option<f64>>,
    decimals: Vec<Option<i32>>,
}

impl SearchSpace {
    pub fn new(lower: Vec<f64>, upper: Vec<f64>) -> Self {
        let n = lower.len().min(upper.len());
        Self {
            lower: lower[..n].to_vec(),
            upper: upper[..n].to_vec(),
            fixed: vec![None; n],
            decimals: vec![None; n],
        }
    }

    /// Pins gene `index` to `value`.
    pub fn fix(mut self, index: usize, value: f64) -> Self {
        if let Some(slot) = self.fixed.get_mut(index) {
            *slot = Some(value);
        }
        self
    }

    /// Rounds gene `index` to `decimals` places after every variation.
    pub fn precision(mut self, index: usize, decimals: i32) -> Self {
        if let Some(slot) = self.decimals.get_mut(index) {
            *slot = Some(decimals);
        }
        self
    }

    pub fn dim(&self) -> usize {
        self.lower.len()
    }

    pub fn is_free(&self, index: usize) -> bool {
        matches!(self.fixed.get(index), Some(None))
    }

    pub fn fixed_value(&self, index: usize) -> Option<f64> {
        self.fixed.get(index).copied().flatten()
    }

    pub fn free_indices(&self) -> Vec<usize> {
        (0..self.dim()).filter(|&i| self.is_free(i)).collect()
    }

    pub fn range(&self, index: usize) -> f64 {
        self.upper[index] - self.lower[index]
    }

    /// Restores fixed genes, rounds to precision and clamps into the box.
    pub fn repair(&self, genes: &mut [f64]) {
        for (i, g) in genes.iter_mut().enumerate().take(self.dim()) {
            if let Some(v) = self.fixed[i] {
                *g = v;
                continue;
            }
            if !g.is_finite() {
                *g = self.lower[i];
            }
            if let Some(d) = self.decimals[i] {
                *g = round_to(*g, d);
            }
            *g = g.clamp(self.lower[i], self.upper[i]);
        }
    }

    /// Uniformly random genes inside the box.
    pub fn random_genes(&self, rng: &mut dyn RngCore) -> Vec<f64> {
        let mut genes: Vec<f64> = (0..self.dim())
            .map(|i| {
                if self.range(i) > 0.0 {
                    rng.gen_range(self.lower[i]..=self.upper[i])
                } else {
                    self.lower[i]
                }
            })
            .collect();
        self.repair(&mut genes);
        genes
    }
}

// --- Evaluator ---

/// A generic interface for candidate scoring.
/// Implementations must be Thread-Safe (Sync).
pub trait Evaluator: Send + Sync {
    /// Scores one candidate against the reference.
    fn evaluate(&self, candidate: &Candidate) -> Result<ObjectiveValues>;

    /// The scalar objective single-objective strategies minimize.
    fn objective(&self, genes: &[f64]) -> Result<f64> {
        let candidate = Candidate::new(genes.to_vec());
        Ok(self.evaluate(&candidate)?.primary)
    }

    fn search_space(&self) -> &SearchSpace;

    /// Starting points of a search. Random inside the search space unless
    /// the evaluator knows better.
    fn initial_population(&self, size: usize, rng: &mut dyn RngCore) -> Vec<Vec<f64>> {
        (0..size).map(|_| self.search_space().random_genes(rng)).collect()
    }

    /// Returns the name of the engine (e.g., "recoil/get_espe").
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn dominance_is_strict() {
        let a = ObjectiveValues::new(1.0, 2.0);
        let b = ObjectiveValues::new(1.0, 3.0);
        assert!(a.dominates(&b));
        assert!(!b.dominates(&a));
        assert!(!a.dominates(&a));
        assert!(a.dominates(&ObjectiveValues::worst()));
    }

    #[test]
    fn repair_respects_fixed_and_precision() {
        let space = SearchSpace::new(vec![0.0, 0.0, 0.0], vec![10.0, 1.0, 10.0])
            .fix(0, 0.0)
            .precision(1, 2);
        let mut genes = vec![5.0, 0.12345, 42.0];
        space.repair(&mut genes);
        assert_eq!(genes, vec![0.0, 0.12, 10.0]);
        assert_eq!(space.free_indices(), vec![1, 2]);
    }

    #[test]
    fn random_genes_stay_inside() {
        let space = SearchSpace::new(vec![1.0, -1.0], vec![2.0, 1.0]).fix(1, 0.5);
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..100 {
            let g = space.random_genes(&mut rng);
            assert!((1.0..=2.0).contains(&g[0]));
            assert_eq!(g[1], 0.5);
        }
    }
}
