use rand::Rng;

use crate::engine::evaluator::SearchSpace;

/// A composable variation builder for real-coded candidates.
#[derive(Clone, Debug, Default)]
pub struct Variation {
    crossover: Option<(f64, f64)>, // (probability, distribution index)
    mutation: Option<(f64, f64)>,  // (probability, distribution index)
}

impl Variation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulated binary crossover, applied to a pair with `probability`.
    pub fn crossover(mut self, probability: f64, distribution_index: f64) -> Self {
        self.crossover = Some((probability, distribution_index));
        self
    }

    /// Polynomial mutation. Each free gene mutates with
    /// `probability / free genes`.
    pub fn mutation(mut self, probability: f64, distribution_index: f64) -> Self {
        self.mutation = Some((probability, distribution_index));
        self
    }

    /// Produces two children. Parents pass through unchanged when no
    /// operator fires.
    pub fn apply<R: Rng + ?Sized>(
        &self,
        parent_1: &[f64],
        parent_2: &[f64],
        space: &SearchSpace,
        rng: &mut R,
    ) -> (Vec<f64>, Vec<f64>) {
        let (mut c1, mut c2) = match self.crossover {
            Some((p, eta)) if rng.gen::<f64>() <= p => {
                simulated_binary_crossover(parent_1, parent_2, space, eta, rng)
            }
            _ => (parent_1.to_vec(), parent_2.to_vec()),
        };

        if let Some((p, eta)) = self.mutation {
            polynomial_mutation(&mut c1, space, p, eta, rng);
            polynomial_mutation(&mut c2, space, p, eta, rng);
        }

        space.repair(&mut c1);
        space.repair(&mut c2);
        (c1, c2)
    }
}

/// SBX on every free gene. Children are clamped into the box.
pub fn simulated_binary_crossover<R: Rng + ?Sized>(
    parent_1: &[f64],
    parent_2: &[f64],
    space: &SearchSpace,
    distribution_index: f64,
    rng: &mut R,
) -> (Vec<f64>, Vec<f64>) {
    let mut c1 = parent_1.to_vec();
    let mut c2 = parent_2.to_vec();
    let exponent = 1.0 / (distribution_index + 1.0);

    for j in space.free_indices() {
        let (Some(&a), Some(&b)) = (parent_1.get(j), parent_2.get(j)) else {
            continue;
        };
        let u: f64 = rng.gen();
        let beta = if u <= 0.5 {
            (2.0 * u).powf(exponent)
        } else {
            (1.0 / (2.0 * (1.0 - u))).powf(exponent)
        };
        c1[j] = (0.5 * ((1.0 + beta) * a + (1.0 - beta) * b)).clamp(space.lower[j], space.upper[j]);
        c2[j] = (0.5 * ((1.0 - beta) * a + (1.0 + beta) * b)).clamp(space.lower[j], space.upper[j]);
    }
    (c1, c2)
}

/// Bounded polynomial mutation in place.
pub fn polynomial_mutation<R: Rng + ?Sized>(
    genes: &mut [f64],
    space: &SearchSpace,
    probability: f64,
    distribution_index: f64,
    rng: &mut R,
) {
    let free = space.free_indices();
    if free.is_empty() {
        return;
    }
    let per_gene = probability / free.len() as f64;
    let exponent = 1.0 / (distribution_index + 1.0);

    for i in free {
        if i >= genes.len() || rng.gen::<f64>() >= per_gene {
            continue;
        }
        let (lo, hi) = (space.lower[i], space.upper[i]);
        let span = hi - lo;
        if span <= 0.0 {
            continue;
        }
        let r: f64 = rng.gen();
        let x = genes[i];
        let delta = if r < 0.5 {
            let norm = (x - lo) / span;
            (2.0 * r + (1.0 - 2.0 * r) * (1.0 - norm).powf(distribution_index + 1.0)).powf(exponent)
                - 1.0
        } else {
            let norm = (hi - x) / span;
            1.0 - (2.0 * (1.0 - r) + 2.0 * (r - 0.5) * (1.0 - norm).powf(distribution_index + 1.0))
                .powf(exponent)
        };
        genes[i] = (x + delta * span).clamp(lo, hi);
    }
}
