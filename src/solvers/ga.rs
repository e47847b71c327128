use std::cmp::Ordering;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::Sender;
use log::{debug, info};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

use crate::core::cancel::CancellationToken;
use crate::core::config::OptimizationParams;
use crate::engine::evaluator::{Candidate, CandidateStatus, Evaluator, ObjectiveValues};
use crate::engine::operators::Variation;
use crate::solvers::{GenStats, SearchOutcome, SearchStrategy, SolverEvent};

/// Elitist multi-objective genetic search (NSGA-II).
pub struct GeneticAlgorithm {
    generations: usize,
    population_size: usize,
    variation: Variation,
    seed: u64,
}

impl GeneticAlgorithm {
    pub fn new(params: &OptimizationParams) -> Self {
        Self {
            generations: params.evaluations,
            population_size: params.population_size.max(2),
            variation: Variation::new()
                .crossover(params.crossover_probability, params.distribution_index_crossover)
                .mutation(params.mutation_probability, params.distribution_index_mutation),
            seed: params.seed,
        }
    }

    // --- Helpers ---

    fn evaluate_batch(&self, evaluator: &dyn Evaluator, pop: &mut [Candidate]) -> usize {
        let count = AtomicUsize::new(0);

        pop.par_iter_mut()
            .filter(|c| c.status == CandidateStatus::Born)
            .for_each(|candidate| {
                count.fetch_add(1, AtomicOrdering::Relaxed);
                match evaluator.evaluate(candidate) {
                    Ok(values) => {
                        candidate.objectives = Some(values);
                        candidate.status = CandidateStatus::Evaluated;
                    }
                    Err(e) => {
                        debug!("Candidate discarded: {:#}", e);
                        candidate.objectives = None;
                        candidate.status = CandidateStatus::Discarded;
                    }
                }
            });

        count.into_inner()
    }

    /// Binary tournament on (front, crowding distance). A candidate may
    /// enter the pool more than once.
    fn tournament_select(
        &self,
        fronts: &[usize],
        crowding: &[f64],
        pool_size: usize,
        rng: &mut impl Rng,
    ) -> Vec<usize> {
        let n = fronts.len();
        (0..pool_size)
            .map(|_| {
                if n < 2 {
                    return 0;
                }
                let a = rng.gen_range(0..n);
                let mut b = rng.gen_range(0..n);
                while b == a {
                    b = rng.gen_range(0..n);
                }
                match fronts[a].cmp(&fronts[b]) {
                    Ordering::Less => a,
                    Ordering::Greater => b,
                    Ordering::Equal if crowding[b] > crowding[a] => b,
                    Ordering::Equal => a,
                }
            })
            .collect()
    }

    fn make_offspring(&self, pool: &[&Candidate], evaluator: &dyn Evaluator, rng: &mut ChaCha8Rng) -> Vec<Candidate> {
        let space = evaluator.search_space();
        let mut offspring = Vec::with_capacity(self.population_size);

        while offspring.len() < self.population_size {
            let p1 = pool[rng.gen_range(0..pool.len())];
            let mut p2 = pool[rng.gen_range(0..pool.len())];
            // Prefer a genuinely different partner when the pool has one.
            for _ in 0..10 {
                if p2.genes != p1.genes {
                    break;
                }
                p2 = pool[rng.gen_range(0..pool.len())];
            }

            let (c1, c2) = self.variation.apply(&p1.genes, &p2.genes, space, rng);
            offspring.push(Candidate::new(c1));
            if offspring.len() < self.population_size {
                offspring.push(Candidate::new(c2));
            }
        }
        offspring
    }

    fn stats(&self, generation: usize, population: &[Candidate], evaluations: usize, started: Instant) -> GenStats {
        let objectives: Vec<ObjectiveValues> = population.iter().map(Candidate::objectives_or_worst).collect();
        let fronts = non_dominated_sort(&objectives);
        let pareto_front: Vec<ObjectiveValues> = objectives
            .iter()
            .zip(&fronts)
            .filter(|(_, f)| **f == 0)
            .map(|(o, _)| *o)
            .collect();

        let valid: Vec<f64> = population
            .iter()
            .filter_map(|c| c.objectives.map(|o| o.primary))
            .filter(|p| p.is_finite())
            .collect();
        let (best, worst, avg) = if valid.is_empty() {
            (0.0, 0.0, 0.0)
        } else {
            let best = valid.iter().cloned().fold(f64::INFINITY, f64::min);
            let worst = valid.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            (best, worst, valid.iter().sum::<f64>() / valid.len() as f64)
        };

        GenStats {
            generation,
            best_objective: best,
            avg_objective: avg,
            worst_objective: worst,
            front_size: pareto_front.len(),
            valid_count: valid.len(),
            pop_size: population.len(),
            evaluations,
            evaluations_left: self.generations.saturating_sub(generation) * self.population_size,
            pareto_front,
            elapsed: started.elapsed(),
        }
    }
}

impl SearchStrategy for GeneticAlgorithm {
    fn name(&self) -> &str {
        "NSGA-II"
    }

    fn budget(&self) -> usize {
        self.generations * self.population_size
    }

    fn search(
        &self,
        evaluator: Arc<dyn Evaluator>,
        initial: Vec<Vec<f64>>,
        token: &CancellationToken,
        tx: &Sender<SolverEvent>,
    ) -> SearchOutcome {
        let started = Instant::now();
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let space = evaluator.search_space();

        // 1. Initialization Phase
        let _ = tx.send(SolverEvent::Log("Initializing Population...".to_string()));
        let mut population: Vec<Candidate> = initial
            .into_iter()
            .take(self.population_size)
            .map(Candidate::new)
            .collect();
        while population.len() < self.population_size {
            population.push(Candidate::new(space.random_genes(&mut rng)));
        }

        let mut total_evals = self.evaluate_batch(evaluator.as_ref(), &mut population);
        let mut best_primary = f64::INFINITY;
        report_new_best(&population, &mut best_primary, tx);

        let mut cancelled = false;

        // 2. Evolution Loop
        for gen in 1..=self.generations {
            if token.is_cancellation_requested() {
                cancelled = true;
                break;
            }

            // A. Mating pool
            let objectives: Vec<ObjectiveValues> = population.iter().map(Candidate::objectives_or_worst).collect();
            let fronts = non_dominated_sort(&objectives);
            let crowding = crowding_distance(&objectives, &fronts);
            let pool_size = (self.population_size as f64 / 2.0).round().max(1.0) as usize;
            let pool_idx = self.tournament_select(&fronts, &crowding, pool_size, &mut rng);
            let pool: Vec<&Candidate> = pool_idx.iter().map(|&i| &population[i]).collect();

            // B. Breeding
            let mut offspring = self.make_offspring(&pool, evaluator.as_ref(), &mut rng);

            // C. Evaluation
            total_evals += self.evaluate_batch(evaluator.as_ref(), &mut offspring);

            // D. Environmental selection
            population.extend(offspring);
            population = select_survivors(population, self.population_size);

            report_new_best(&population, &mut best_primary, tx);

            // E. Telemetry
            let stats = self.stats(gen, &population, total_evals, started);
            debug!(
                "Generation {}: best {:.5}, front {}",
                gen, stats.best_objective, stats.front_size
            );
            let _ = tx.send(SolverEvent::GenerationUpdate(stats));
        }

        let objectives: Vec<ObjectiveValues> = population.iter().map(Candidate::objectives_or_worst).collect();
        let fronts = non_dominated_sort(&objectives);
        let front: Vec<Candidate> = population
            .into_iter()
            .zip(fronts)
            .filter(|(c, f)| *f == 0 && c.status == CandidateStatus::Evaluated)
            .map(|(c, _)| c)
            .collect();

        info!("NSGA-II finished. Total evals: {}", total_evals);
        let _ = tx.send(SolverEvent::Log(format!("GA Finished. Total Evals: {}", total_evals)));

        SearchOutcome {
            front,
            evaluations: total_evals,
            cancelled,
        }
    }
}

fn report_new_best(population: &[Candidate], best: &mut f64, tx: &Sender<SolverEvent>) {
    let leader = population
        .iter()
        .filter(|c| c.status == CandidateStatus::Evaluated)
        .min_by(|a, b| {
            a.objectives_or_worst()
                .primary
                .partial_cmp(&b.objectives_or_worst().primary)
                .unwrap_or(Ordering::Equal)
        });
    if let Some(c) = leader {
        let p = c.objectives_or_worst().primary;
        if p < *best {
            *best = p;
            let _ = tx.send(SolverEvent::NewBest(c.clone()));
        }
    }
}

// --- Ranking ---

/// Front number of every solution, 0 being the non-dominated front.
pub fn non_dominated_sort(objectives: &[ObjectiveValues]) -> Vec<usize> {
    let n = objectives.len();
    let mut dominated_by: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut domination_count = vec![0usize; n];

    for i in 0..n {
        for j in 0..n {
            if i == j {
                continue;
            }
            if objectives[i].dominates(&objectives[j]) {
                dominated_by[i].push(j);
            } else if objectives[j].dominates(&objectives[i]) {
                domination_count[i] += 1;
            }
        }
    }

    let mut fronts = vec![usize::MAX; n];
    let mut current: Vec<usize> = (0..n).filter(|&i| domination_count[i] == 0).collect();
    let mut rank = 0;
    while !current.is_empty() {
        let mut next = Vec::new();
        for &i in &current {
            fronts[i] = rank;
            for &j in &dominated_by[i] {
                domination_count[j] -= 1;
                if domination_count[j] == 0 {
                    next.push(j);
                }
            }
        }
        rank += 1;
        current = next;
    }
    fronts
}

/// Crowding distance inside each front. Front edges get infinity.
pub fn crowding_distance(objectives: &[ObjectiveValues], fronts: &[usize]) -> Vec<f64> {
    let mut distance = vec![0.0; objectives.len()];
    let max_front = fronts.iter().copied().filter(|&f| f != usize::MAX).max();
    let Some(max_front) = max_front else {
        return distance;
    };

    for f in 0..=max_front {
        let members: Vec<usize> = (0..fronts.len()).filter(|&i| fronts[i] == f).collect();
        if members.is_empty() {
            continue;
        }
        for m in 0..2 {
            let mut sorted = members.clone();
            sorted.sort_by(|&a, &b| {
                objectives[a]
                    .get(m)
                    .partial_cmp(&objectives[b].get(m))
                    .unwrap_or(Ordering::Equal)
            });
            let lo = objectives[sorted[0]].get(m);
            let hi = objectives[sorted[sorted.len() - 1]].get(m);
            distance[sorted[0]] = f64::INFINITY;
            distance[sorted[sorted.len() - 1]] = f64::INFINITY;

            let span = hi - lo;
            if !(span.is_finite() && span > 0.0) {
                continue;
            }
            for k in 1..sorted.len().saturating_sub(1) {
                let gap = objectives[sorted[k + 1]].get(m) - objectives[sorted[k - 1]].get(m);
                if gap.is_finite() {
                    distance[sorted[k]] += gap / span;
                }
            }
        }
    }
    distance
}

/// Keeps the `size` best candidates by front, then by crowding distance.
pub fn select_survivors(population: Vec<Candidate>, size: usize) -> Vec<Candidate> {
    if population.len() <= size {
        return population;
    }
    let objectives: Vec<ObjectiveValues> = population.iter().map(Candidate::objectives_or_worst).collect();
    let fronts = non_dominated_sort(&objectives);
    let crowding = crowding_distance(&objectives, &fronts);

    let mut order: Vec<usize> = (0..population.len()).collect();
    order.sort_by(|&a, &b| {
        fronts[a]
            .cmp(&fronts[b])
            .then_with(|| crowding[b].partial_cmp(&crowding[a]).unwrap_or(Ordering::Equal))
    });
    order.truncate(size);
    order.sort_unstable();

    let mut keep = vec![false; population.len()];
    for i in order {
        keep[i] = true;
    }
    population
        .into_iter()
        .zip(keep)
        .filter(|(_, k)| *k)
        .map(|(c, _)| c)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(a: f64, b: f64) -> ObjectiveValues {
        ObjectiveValues::new(a, b)
    }

    #[test]
    fn sorts_into_fronts() {
        let objs = vec![obj(1.0, 5.0), obj(5.0, 1.0), obj(2.0, 6.0), obj(6.0, 6.0), obj(3.0, 3.0)];
        assert_eq!(non_dominated_sort(&objs), vec![0, 0, 1, 2, 0]);
    }

    #[test]
    fn edges_are_most_crowded() {
        let objs = vec![obj(1.0, 5.0), obj(3.0, 3.0), obj(5.0, 1.0)];
        let d = crowding_distance(&objs, &[0, 0, 0]);
        assert!(d[0].is_infinite() && d[2].is_infinite());
        assert!((d[1] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn survivors_prefer_better_fronts() {
        let pop: Vec<Candidate> = [(1.0, 5.0), (9.0, 9.0), (5.0, 1.0), (8.0, 8.0)]
            .iter()
            .enumerate()
            .map(|(i, &(a, b))| {
                let mut c = Candidate::new(vec![i as f64]);
                c.objectives = Some(obj(a, b));
                c.status = CandidateStatus::Evaluated;
                c
            })
            .collect();
        let kept = select_survivors(pop, 3);
        let ids: Vec<f64> = kept.iter().map(|c| c.genes[0]).collect();
        assert_eq!(ids, vec![0.0, 2.0, 3.0]);
    }
}
