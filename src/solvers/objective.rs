use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{bail, Result};
use log::debug;
use rand::{Rng, RngCore};

use crate::analysis::spectrum::{area_between, round_value_by_four_biggest, sum_squared_error, Spectrum};
use crate::core::config::{ObjectiveKind, OptimizationParams, RecoilShape};
use crate::core::domain::{round_to, OptimizationType, RecoilDistribution, RecoilPoint};
use crate::engine::evaluator::{Candidate, Evaluator, ObjectiveValues, SearchSpace};
use crate::engine::supervisor::{EspeOptions, SimulationSupervisor};

// Gene precision of recoil points.
const X_DECIMALS: i32 = 2;
const Y_DECIMALS: i32 = 4;
/// Concentration used for the fixed low points of the first solution.
const FLOOR_CONCENTRATION: f64 = 0.0001;

/// The measured spectrum candidates are scored against.
#[derive(Debug, Clone)]
pub struct SpectrumTarget {
    pub measured: Spectrum,
    pub channel_width: f64,
    pub objective: ObjectiveKind,
}

impl SpectrumTarget {
    /// Primary and secondary metric of a simulated spectrum. An empty
    /// spectrum scores worst on both.
    pub fn score(&self, simulated: &Spectrum) -> ObjectiveValues {
        if simulated.is_empty() || self.measured.is_empty() {
            return ObjectiveValues::worst();
        }
        let area = area_between(simulated, &self.measured, self.channel_width);
        let squared = sum_squared_error(simulated, &self.measured, self.channel_width);
        match self.objective {
            ObjectiveKind::Area => ObjectiveValues::new(area, squared),
            ObjectiveKind::SumSquared => ObjectiveValues::new(squared, area),
        }
    }
}

// --- Recoil Shapes ---

/// Search space of a box-shaped distribution. Genes alternate `x, y`;
/// the surface depth, the last depth and the low concentrations are fixed.
pub fn recoil_search_space(shape: RecoilShape, lower: (f64, f64), upper: (f64, f64)) -> SearchSpace {
    let n = shape.solution_size();
    let lo: Vec<f64> = (0..n).map(|i| if i % 2 == 0 { lower.0 } else { lower.1 }).collect();
    let hi: Vec<f64> = (0..n).map(|i| if i % 2 == 0 { upper.0 } else { upper.1 }).collect();

    let mut space = SearchSpace::new(lo, hi);
    for i in 0..n {
        space = space.precision(i, if i % 2 == 0 { X_DECIMALS } else { Y_DECIMALS });
    }
    space = space.fix(0, 0.0).fix(n - 1, upper.0);
    match shape {
        RecoilShape::SurfaceBox => space.fix(3, lower.1),
        RecoilShape::BuriedBox => space.fix(1, lower.1).fix(5, lower.1),
    }
}

/// Turns genes into recoil points. Free depths are sorted so the box is
/// always well formed.
pub fn recoil_points(shape: RecoilShape, genes: &[f64]) -> Vec<RecoilPoint> {
    if genes.len() < shape.solution_size() {
        return Vec::new();
    }
    let step = |x: f64| round_to(x + 0.01, X_DECIMALS);
    match shape {
        RecoilShape::SurfaceBox => {
            let (x1, x2) = if genes[2] < genes[4] {
                (genes[2], genes[4])
            } else {
                (genes[4], genes[2])
            };
            vec![
                RecoilPoint::new(genes[0], genes[1]),
                RecoilPoint::new(x1, genes[1]),
                RecoilPoint::new(step(x1), genes[3]),
                RecoilPoint::new(x2, genes[3]),
            ]
        }
        RecoilShape::BuriedBox => {
            let mut xs = [genes[2], genes[4], genes[6]];
            xs.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            vec![
                RecoilPoint::new(genes[0], genes[1]),
                RecoilPoint::new(xs[0], genes[1]),
                RecoilPoint::new(step(xs[0]), genes[3]),
                RecoilPoint::new(xs[1], genes[3]),
                RecoilPoint::new(step(xs[1]), genes[5]),
                RecoilPoint::new(xs[2], genes[5]),
            ]
        }
    }
}

/// The first solution covers the whole depth range, so the initial
/// simulation produces events everywhere a later candidate may look.
pub fn covering_solution(shape: RecoilShape, lower: (f64, f64), upper: (f64, f64)) -> Vec<f64> {
    let x_range = upper.0 - lower.0;
    let y_mid = round_to((upper.1 - lower.1) / 2.0, Y_DECIMALS);
    match shape {
        RecoilShape::SurfaceBox => vec![
            0.0,
            y_mid,
            round_to(x_range / 2.0, X_DECIMALS),
            FLOOR_CONCENTRATION,
            upper.0,
        ],
        RecoilShape::BuriedBox => vec![
            0.0,
            FLOOR_CONCENTRATION,
            round_to(x_range / 3.0, X_DECIMALS),
            y_mid,
            round_to(2.0 * x_range / 3.0, X_DECIMALS),
            FLOOR_CONCENTRATION,
            upper.0,
        ],
    }
}

/// Random solution on the gene grid with free depths in ascending order.
fn random_recoil_genes(space: &SearchSpace, rng: &mut dyn RngCore) -> Vec<f64> {
    let mut genes: Vec<f64> = (0..space.dim())
        .map(|i| {
            if let Some(v) = space.fixed_value(i) {
                return v;
            }
            let scale = if i % 2 == 0 { 100.0 } else { 10_000.0 };
            let lo = (space.lower[i] * scale).round() as i64;
            let hi = (space.upper[i] * scale).round() as i64;
            rng.gen_range(lo..=hi.max(lo)) as f64 / scale
        })
        .collect();

    let x_free: Vec<usize> = space.free_indices().into_iter().filter(|i| i % 2 == 0).collect();
    let mut xs: Vec<f64> = x_free.iter().map(|&i| genes[i]).collect();
    xs.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    for (i, x) in x_free.into_iter().zip(xs) {
        genes[i] = x;
    }
    space.repair(&mut genes);
    genes
}

// --- Evaluators ---

/// Scores a box-shaped recoil distribution by reconstructing its spectrum
/// from the `-opt` events of the initial simulation.
pub struct RecoilEvaluator {
    supervisor: SimulationSupervisor,
    template: RecoilDistribution,
    shape: RecoilShape,
    space: SearchSpace,
    lower: (f64, f64),
    upper: (f64, f64),
    target: SpectrumTarget,
    counter: AtomicUsize,
}

impl RecoilEvaluator {
    pub fn new(
        supervisor: SimulationSupervisor,
        params: &OptimizationParams,
        target: SpectrumTarget,
    ) -> Result<Self> {
        let Some(template) = supervisor.job().main_recoil().cloned() else {
            bail!("Simulation has no recoil element to optimize");
        };
        let shape = params.recoil_shape;
        Ok(Self {
            supervisor,
            template,
            shape,
            space: recoil_search_space(shape, params.lower_limits, params.upper_limits),
            lower: params.lower_limits,
            upper: params.upper_limits,
            target,
            counter: AtomicUsize::new(0),
        })
    }

    /// A recoil of the main element with the candidate's points.
    pub fn form_recoil(&self, genes: &[f64], name: &str) -> RecoilDistribution {
        RecoilDistribution::new(name, self.template.element.clone(), recoil_points(self.shape, genes))
    }

    pub fn covering_solution(&self) -> Vec<f64> {
        covering_solution(self.shape, self.lower, self.upper)
    }
}

impl Evaluator for RecoilEvaluator {
    fn evaluate(&self, candidate: &Candidate) -> Result<ObjectiveValues> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let recoil = self.form_recoil(&candidate.genes, &format!("opt{}", n));
        let options = EspeOptions {
            optimization: Some(OptimizationType::Recoil),
            channel_width: Some(self.target.channel_width),
            remove_recoil_file: true,
            ..Default::default()
        };
        let spectrum = self.supervisor.calculate_espe(&recoil, &options)?;
        debug!("Candidate {} produced {} spectrum bins", n, spectrum.len());
        Ok(self.target.score(&spectrum))
    }

    fn search_space(&self) -> &SearchSpace {
        &self.space
    }

    fn initial_population(&self, size: usize, rng: &mut dyn RngCore) -> Vec<Vec<f64>> {
        let mut population = Vec::with_capacity(size);
        if size > 0 {
            population.push(self.covering_solution());
        }
        while population.len() < size {
            population.push(random_recoil_genes(&self.space, rng));
        }
        population
    }

    fn name(&self) -> &str {
        "recoil/get_espe"
    }
}

/// Scores a fluence by reconstructing the main recoil's spectrum from the
/// `-optfl` events with that fluence.
pub struct FluenceEvaluator {
    supervisor: SimulationSupervisor,
    template: RecoilDistribution,
    space: SearchSpace,
    target: SpectrumTarget,
    counter: AtomicUsize,
}

impl FluenceEvaluator {
    pub fn new(
        supervisor: SimulationSupervisor,
        params: &OptimizationParams,
        target: SpectrumTarget,
    ) -> Result<Self> {
        let Some(template) = supervisor.job().main_recoil().cloned() else {
            bail!("Simulation has no recoil element to optimize");
        };
        let (lo, hi) = params.fluence_limits;
        if !(lo > 0.0 && hi >= lo) {
            bail!("Invalid fluence limits [{}, {}]", lo, hi);
        }
        Ok(Self {
            supervisor,
            template,
            space: SearchSpace::new(vec![lo], vec![hi]),
            target,
            counter: AtomicUsize::new(0),
        })
    }
}

impl Evaluator for FluenceEvaluator {
    fn evaluate(&self, candidate: &Candidate) -> Result<ObjectiveValues> {
        let Some(&fluence) = candidate.genes.first() else {
            bail!("Fluence candidate has no genes");
        };
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let mut recoil = self.template.clone();
        recoil.name = format!("optfl{}", n);

        let options = EspeOptions {
            optimization: Some(OptimizationType::Fluence),
            channel_width: Some(self.target.channel_width),
            fluence: Some(round_value_by_four_biggest(fluence)),
            remove_recoil_file: true,
            ..Default::default()
        };
        let spectrum = self.supervisor.calculate_espe(&recoil, &options)?;
        Ok(self.target.score(&spectrum))
    }

    fn search_space(&self) -> &SearchSpace {
        &self.space
    }

    fn name(&self) -> &str {
        "fluence/get_espe"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn surface_box_points() {
        let pts = recoil_points(RecoilShape::SurfaceBox, &[0.0, 0.5, 60.0, 0.0001, 20.0]);
        let xy: Vec<(f64, f64)> = pts.iter().map(|p| (p.x, p.y)).collect();
        assert_eq!(xy, vec![(0.0, 0.5), (20.0, 0.5), (20.01, 0.0001), (60.0, 0.0001)]);
    }

    #[test]
    fn buried_box_sorts_depths() {
        let genes = [0.0, 0.0001, 70.0, 0.4, 30.0, 0.0001, 100.0];
        let xs: Vec<f64> = recoil_points(RecoilShape::BuriedBox, &genes).iter().map(|p| p.x).collect();
        assert_eq!(xs, vec![0.0, 30.0, 30.01, 70.0, 70.01, 100.0]);
    }

    #[test]
    fn space_fixes_box_edges() {
        let space = recoil_search_space(RecoilShape::SurfaceBox, (0.0, 0.0001), (100.0, 1.0));
        assert_eq!(space.free_indices(), vec![1, 2]);
        let space = recoil_search_space(RecoilShape::BuriedBox, (0.0, 0.0001), (100.0, 1.0));
        assert_eq!(space.free_indices(), vec![2, 3, 4]);
        assert_eq!(space.fixed_value(6), Some(100.0));
    }

    #[test]
    fn random_genes_are_on_the_grid_and_sorted() {
        let space = recoil_search_space(RecoilShape::BuriedBox, (0.0, 0.0001), (100.0, 1.0));
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        for _ in 0..50 {
            let g = random_recoil_genes(&space, &mut rng);
            assert!(g[2] <= g[4]);
            assert_eq!(round_to(g[2], 2), g[2]);
            assert_eq!(round_to(g[3], 4), g[3]);
            assert_eq!((g[0], g[1], g[5], g[6]), (0.0, 0.0001, 0.0001, 100.0));
        }
    }

    #[test]
    fn covering_solution_spans_range() {
        let s = covering_solution(RecoilShape::SurfaceBox, (0.0, 0.0), (100.0, 1.0));
        assert_eq!(s, vec![0.0, 0.5, 50.0, 0.0001, 100.0]);
    }

    #[test]
    fn empty_spectrum_scores_worst() {
        let target = SpectrumTarget {
            measured: Spectrum::new(vec![(1.0, 2.0)]),
            channel_width: 0.1,
            objective: ObjectiveKind::Area,
        };
        assert_eq!(target.score(&Spectrum::default()), ObjectiveValues::worst());
    }

    #[test]
    fn objective_kind_orders_metrics() {
        let measured = Spectrum::new(vec![(0.0, 0.0), (1.0, 2.0), (2.0, 0.0)]);
        let simulated = Spectrum::new(vec![(0.0, 0.0), (1.0, 4.0), (2.0, 0.0)]);
        let mut target = SpectrumTarget { measured, channel_width: 1.0, objective: ObjectiveKind::Area };
        let by_area = target.score(&simulated);
        target.objective = ObjectiveKind::SumSquared;
        let by_sse = target.score(&simulated);
        assert_eq!(by_area.primary, by_sse.secondary);
        assert_eq!(by_area.secondary, by_sse.primary);
        assert!((by_area.primary - 2.0).abs() < 1e-12);
    }
}
