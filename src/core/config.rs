use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::domain::{
    IonDivision, OptimizationType, SimulationJob, DEFAULT_CHANNEL_WIDTH, DEFAULT_SEED,
};

// --- External Tools ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorPaths {
    pub mcerd: PathBuf,
    pub get_espe: PathBuf,
}

impl Default for SimulatorPaths {
    fn default() -> Self {
        Self {
            mcerd: PathBuf::from("mcerd"),
            get_espe: PathBuf::from("get_espe"),
        }
    }
}

// --- Supervisor ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub process_count: usize,
    pub seed: u64,
    pub start_interval_ms: u64,
    pub status_interval_ms: u64,
    pub ion_division: IonDivision,
    pub use_old_erd_files: bool,
    /// Per-worker wall clock limit.
    pub max_time_secs: Option<f64>,
}

impl SupervisorConfig {
    pub fn start_interval(&self) -> Duration {
        Duration::from_millis(self.start_interval_ms)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }

    pub fn max_time(&self) -> Option<Duration> {
        self.max_time_secs.map(Duration::from_secs_f64)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            process_count: 1,
            seed: DEFAULT_SEED,
            start_interval_ms: 5_000,
            status_interval_ms: 1_000,
            ion_division: IonDivision::Both,
            use_old_erd_files: true,
            max_time_secs: None,
        }
    }
}

// --- Optimization ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Genetic,
    Gradient,
}

/// Which metric is ranked first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectiveKind {
    Area,
    SumSquared,
}

/// Shape of the recoil distribution being fitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoilShape {
    /// A box starting at the surface: 4 points, 5 genes.
    SurfaceBox,
    /// A box below the surface: 6 points, 7 genes.
    BuriedBox,
}

impl RecoilShape {
    pub fn solution_size(&self) -> usize {
        match self {
            RecoilShape::SurfaceBox => 5,
            RecoilShape::BuriedBox => 7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GradientParams {
    pub max_iterations: usize,
    /// Relative finite-difference step, scaled by each gene's range.
    pub difference_step: f64,
    /// First line-search step as a fraction of the box diagonal.
    pub initial_step: f64,
    /// Stop when the objective improves by less than this.
    pub tolerance: f64,
}

impl Default for GradientParams {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            difference_step: 1e-3,
            initial_step: 0.1,
            tolerance: 1e-6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizationParams {
    pub optimization_type: OptimizationType,
    pub strategy: StrategyKind,
    /// Generations for the genetic search, iterations budget otherwise.
    pub evaluations: usize,
    pub population_size: usize,
    pub recoil_shape: RecoilShape,
    /// `(x, y)` bounds of recoil points: depth in nm, relative concentration.
    pub lower_limits: (f64, f64),
    pub upper_limits: (f64, f64),
    pub fluence_limits: (f64, f64),
    pub number_of_processes: usize,
    pub stop_percent: f64,
    pub check_interval_secs: f64,
    pub check_min_secs: f64,
    pub check_max_secs: f64,
    pub channel_width: f64,
    pub crossover_probability: f64,
    pub mutation_probability: f64,
    pub distribution_index_crossover: f64,
    pub distribution_index_mutation: f64,
    /// Reuse existing `-opt` events instead of running the initial simulation.
    pub skip_simulation: bool,
    pub objective: ObjectiveKind,
    pub seed: u64,
    pub measured_spectrum: Option<PathBuf>,
    pub gradient: GradientParams,
}

impl OptimizationParams {
    pub fn solution_size(&self) -> usize {
        match self.optimization_type {
            OptimizationType::Recoil => self.recoil_shape.solution_size(),
            OptimizationType::Fluence => 1,
        }
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs_f64(self.check_interval_secs.max(0.0))
    }

    pub fn check_min(&self) -> Duration {
        Duration::from_secs_f64(self.check_min_secs.max(0.0))
    }

    pub fn check_max(&self) -> Duration {
        Duration::from_secs_f64(self.check_max_secs.max(0.0))
    }
}

impl Default for OptimizationParams {
    fn default() -> Self {
        Self {
            optimization_type: OptimizationType::Recoil,
            strategy: StrategyKind::Genetic,
            evaluations: 100,
            population_size: 100,
            recoil_shape: RecoilShape::SurfaceBox,
            lower_limits: (0.0, 0.0001),
            upper_limits: (100.0, 1.0),
            fluence_limits: (1.0e10, 1.0e14),
            number_of_processes: 1,
            stop_percent: 0.3,
            check_interval_secs: 20.0,
            check_min_secs: 0.0,
            check_max_secs: 900.0,
            channel_width: DEFAULT_CHANNEL_WIDTH,
            crossover_probability: 0.9,
            mutation_probability: 1.0,
            distribution_index_crossover: 20.0,
            distribution_index_mutation: 20.0,
            skip_simulation: false,
            objective: ObjectiveKind::Area,
            seed: 42,
            measured_spectrum: None,
            gradient: GradientParams::default(),
        }
    }
}

// --- Root ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub simulator: SimulatorPaths,
    pub job: SimulationJob,
    pub supervisor: SupervisorConfig,
    pub optimization: OptimizationParams,
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_uses_defaults() {
        let cfg: EngineConfig = serde_json::from_str(
            r#"{ "supervisor": { "process_count": 3 }, "optimization": { "strategy": "gradient" } }"#,
        )
        .unwrap();
        assert_eq!(cfg.supervisor.process_count, 3);
        assert_eq!(cfg.supervisor.seed, DEFAULT_SEED);
        assert_eq!(cfg.optimization.strategy, StrategyKind::Gradient);
        assert_eq!(cfg.optimization.stop_percent, 0.3);
        assert_eq!(cfg.job.settings.number_of_ions, 1_000_000);
    }

    #[test]
    fn solution_sizes() {
        let mut p = OptimizationParams::default();
        assert_eq!(p.solution_size(), 5);
        p.recoil_shape = RecoilShape::BuriedBox;
        assert_eq!(p.solution_size(), 7);
        p.optimization_type = OptimizationType::Fluence;
        assert_eq!(p.solution_size(), 1);
    }

    #[test]
    fn config_survives_json() {
        let cfg = EngineConfig::default();
        let back: EngineConfig = serde_json::from_str(&cfg.to_json().unwrap()).unwrap();
        assert_eq!(back, cfg);
    }
}
