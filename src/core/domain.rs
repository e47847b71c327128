use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// --- Constants ---
pub const DEFAULT_SEED: u64 = 101;
/// Seed used for the initial simulation that precedes an optimization.
pub const OPTIMIZATION_SEED: u64 = 201;
pub const DEFAULT_CHANNEL_WIDTH: f64 = 0.025; // MeV
pub const DEFAULT_REFERENCE_DENSITY: f64 = 4.98e22; // at./cm^3
pub const DEFAULT_FLUENCE: f64 = 5.0e11;

// --- State Enums ---

/// Externally visible state of a simulation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SimulationState {
    NotRun,
    Running,
    Done,
}

impl fmt::Display for SimulationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SimulationState::NotRun => "Not run",
            SimulationState::Running => "Running",
            SimulationState::Done => "Done",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SimulationType {
    #[serde(rename = "ERD")]
    Erd,
    #[serde(rename = "RBS")]
    Rbs,
}

impl SimulationType {
    /// Suffix of the recoil distribution file handed to the simulator.
    pub fn recoil_suffix(&self) -> &'static str {
        match self {
            SimulationType::Erd => "recoil",
            SimulationType::Rbs => "scatter",
        }
    }

    pub fn as_mcerd_str(&self) -> &'static str {
        match self {
            SimulationType::Erd => "ERD",
            SimulationType::Rbs => "RBS",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimulationMode {
    Narrow,
    Wide,
}

impl SimulationMode {
    pub fn as_mcerd_str(&self) -> &'static str {
        match self {
            SimulationMode::Narrow => "narrow",
            SimulationMode::Wide => "wide",
        }
    }
}

/// What an optimization fits: the recoil depth distribution or the beam fluence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizationType {
    Recoil,
    Fluence,
}

/// How the configured ion counts are split between parallel processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IonDivision {
    /// Every process simulates the full number of ions.
    #[default]
    None,
    /// Simulation ions are divided, pre-simulation ions are not.
    Sim,
    /// Both counts are divided.
    Both,
}

impl IonDivision {
    /// Returns `(presimulation_ions, simulation_ions)` for one process.
    pub fn ion_counts(&self, presim: i64, sim: i64, processes: usize) -> (u64, u64) {
        let presim = presim.max(0) as u64;
        let sim = sim.max(0) as u64;
        let processes = processes.max(1) as u64;

        match self {
            IonDivision::None => (presim, sim),
            IonDivision::Sim => (presim, sim / processes),
            IonDivision::Both => (presim / processes, sim / processes),
        }
    }
}

// --- Physics Types ---

/// A chemical element, optionally a specific isotope with an amount.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub symbol: String,
    pub isotope: Option<u32>,
    pub mass: f64,           // u
    pub amount: Option<f64>, // fraction, or percent when > 1
}

impl Element {
    pub fn new(symbol: &str, isotope: Option<u32>, mass: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            isotope,
            mass,
            amount: None,
        }
    }

    pub fn with_amount(mut self, amount: f64) -> Self {
        self.amount = Some(amount);
        self
    }

    /// `[isotope][symbol]`, e.g. `4He`.
    pub fn prefix(&self) -> String {
        match self.isotope {
            Some(iso) => format!("{}{}", iso, self.symbol),
            None => self.symbol.clone(),
        }
    }

    pub fn mcerd_mass(&self) -> String {
        format!("{:.2} {}", self.mass, self.symbol)
    }

    pub fn mcerd_amount(&self) -> Option<String> {
        self.amount.map(|a| {
            let a = if a > 1.0 { a / 100.0 } else { a };
            format!("{:.3}", a)
        })
    }
}

impl Default for Element {
    fn default() -> Self {
        Self::new("H", Some(1), 1.008)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub name: String,
    pub elements: Vec<Element>,
    pub thickness: f64, // nm
    pub density: f64,   // g/cm^3
}

impl Layer {
    pub fn mcerd_params(&self) -> Vec<String> {
        vec![
            String::new(),
            format!("{} nm", self.thickness),
            "ZBL".to_string(),
            "ZBL".to_string(),
            format!("{} g/cm3", self.density),
        ]
    }

    /// Surface layer the simulator expects before the real layers.
    pub fn default_mcerd_params() -> Vec<String> {
        vec![
            String::new(),
            "10.0 nm".to_string(),
            "ZBL".to_string(),
            "ZBL".to_string(),
            "0.000 g/cm3".to_string(),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub layers: Vec<Layer>,
    pub target_theta: f64, // deg
}

impl Default for Target {
    fn default() -> Self {
        Self {
            layers: Vec::new(),
            target_theta: 20.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Beam {
    pub ion: Element,
    pub energy: f64,           // MeV
    pub spot_size: (f64, f64), // mm
}

impl Beam {
    pub fn mcerd_params(&self) -> Vec<String> {
        vec![
            format!("Beam ion: {}", self.ion.prefix()),
            format!("Beam energy: {} MeV", self.energy),
        ]
    }
}

impl Default for Beam {
    fn default() -> Self {
        Self {
            ion: Element::new("Cl", Some(35), 34.969),
            energy: 10.0,
            spot_size: (3.0, 5.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FoilShape {
    Circular { diameter: f64 },
    Rectangular { width: f64, height: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Foil {
    pub name: String,
    pub shape: FoilShape,
    pub distance: f64, // mm from the sample
    pub layers: Vec<Layer>,
    pub transmission: f64,
}

impl Foil {
    /// Solid angle seen through this foil, in millisteradians.
    pub fn solid_angle(&self) -> f64 {
        if self.distance == 0.0 {
            return 0.0;
        }
        let area = match self.shape {
            FoilShape::Circular { diameter } => {
                std::f64::consts::PI * (diameter / 2.0).powi(2)
            }
            FoilShape::Rectangular { width, height } => width * height,
        };
        area / self.distance.powi(2) * 1000.0
    }

    pub fn mcerd_params(&self) -> Vec<String> {
        match self.shape {
            FoilShape::Circular { diameter } => vec![
                "Foil type: circular".to_string(),
                format!("Foil diameter: {}", diameter),
                format!("Foil distance: {}", self.distance),
            ],
            FoilShape::Rectangular { width, height } => vec![
                "Foil type: rectangular".to_string(),
                format!("Foil size: {} {}", width, height),
                format!("Foil distance: {}", self.distance),
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectorType {
    #[serde(rename = "TOF")]
    Tof,
    Energy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detector {
    pub detector_type: DetectorType,
    pub detector_theta: f64,          // deg
    pub virtual_size: (f64, f64),     // mm
    pub tof_foils: (usize, usize),    // indices into `foils`
    pub foils: Vec<Foil>,
    pub timeres: f64,                 // ps
    pub energyres: f64,               // keV
}

impl Detector {
    /// Distance between the two timing foils, in meters.
    pub fn tof_length(&self) -> f64 {
        match (self.foils.get(self.tof_foils.0), self.foils.get(self.tof_foils.1)) {
            (Some(a), Some(b)) => (b.distance - a.distance) / 1000.0,
            _ => 0.0,
        }
    }

    /// Smallest foil solid angle scaled by the product of all transmissions (msr).
    pub fn solid_angle(&self) -> f64 {
        let smallest = self
            .foils
            .iter()
            .map(Foil::solid_angle)
            .fold(f64::INFINITY, f64::min);
        if !smallest.is_finite() {
            return 0.0;
        }
        let transmission: f64 = self.foils.iter().map(|f| f.transmission).product();
        smallest * transmission
    }

    pub fn mcerd_params(&self) -> Vec<String> {
        // The simulator only understands TOF geometry here.
        vec![
            "Detector type: TOF".to_string(),
            format!("Detector angle: {}", self.detector_theta),
            format!(
                "Virtual detector size: {:.1} {:.1}",
                self.virtual_size.0, self.virtual_size.1
            ),
            format!("Timing detector numbers: {} {}", self.tof_foils.0, self.tof_foils.1),
        ]
    }
}

impl Default for Detector {
    fn default() -> Self {
        Self {
            detector_type: DetectorType::Tof,
            detector_theta: 41.12,
            virtual_size: (2.0, 5.0),
            tof_foils: (1, 2),
            foils: Vec::new(),
            timeres: 250.0,
            energyres: 15.0,
        }
    }
}

/// One (depth, concentration) node of a recoil distribution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RecoilPoint {
    pub x: f64, // nm
    pub y: f64, // relative concentration
}

impl RecoilPoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Depth distribution of the recoiling element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoilDistribution {
    pub name: String,
    pub element: Element,
    pub points: Vec<RecoilPoint>,
}

impl RecoilDistribution {
    pub fn new(name: &str, element: Element, points: Vec<RecoilPoint>) -> Self {
        Self {
            name: name.to_string(),
            element,
            points,
        }
    }

    /// `<element prefix>-<name>`, the stem every file of this recoil shares.
    pub fn full_name(&self) -> String {
        format!("{}-{}", self.element.prefix(), self.name)
    }

    pub fn prefix(&self) -> String {
        self.element.prefix()
    }

    /// Lines of the distribution file. The simulator needs near-zero padding
    /// before the first point and two zero points after the last one.
    pub fn mcerd_lines(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(self.points.len() + 6);
        let (first, last) = match (self.points.first(), self.points.last()) {
            (Some(f), Some(l)) => (*f, *l),
            _ => return lines,
        };

        if first.x > 0.0 {
            let before = round_to(first.x - 0.01, 2);
            if first.x <= 10.0 {
                lines.push("0.00 0.000001".to_string());
                lines.push(format!("{:.2} 0.000001", before));
            } else {
                lines.push("0.00 0.000001".to_string());
                lines.push("10.00 0.000001".to_string());
                lines.push("10.01 0.0000".to_string());
                lines.push(format!("{:.2} 0.0000", before));
            }
        }

        for p in &self.points {
            lines.push(format!("{:.2} {:.4}", round_to(p.x, 2), round_to(p.y, 4)));
        }

        lines.push(format!("{:.2} 0.0", round_to(last.x + 0.01, 2)));
        lines.push(format!("{:.2} 0.0", round_to(last.x + 0.02, 2)));
        lines
    }

    pub fn file_contents(&self) -> String {
        let mut s = self.mcerd_lines().join("\n");
        s.push('\n');
        s
    }
}

pub fn round_to(value: f64, decimals: i32) -> f64 {
    let f = 10f64.powi(decimals);
    (value * f).round() / f
}

// --- Configuration Types ---

/// Per-job simulator parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationSettings {
    pub simulation_type: SimulationType,
    pub simulation_mode: SimulationMode,
    pub number_of_ions: i64,
    pub number_of_preions: i64,
    pub number_of_scaling_ions: u32,
    pub number_of_recoils: u32,
    pub minimum_scattering_angle: f64,      // deg
    pub minimum_main_scattering_angle: f64, // deg
    pub minimum_energy: f64,                // MeV
    pub seed_number: u64,
    pub channel_width: f64, // MeV
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            simulation_type: SimulationType::Erd,
            simulation_mode: SimulationMode::Narrow,
            number_of_ions: 1_000_000,
            number_of_preions: 100_000,
            number_of_scaling_ions: 5,
            number_of_recoils: 10,
            minimum_scattering_angle: 0.05,
            minimum_main_scattering_angle: 20.0,
            minimum_energy: 1.0,
            seed_number: DEFAULT_SEED,
            channel_width: DEFAULT_CHANNEL_WIDTH,
        }
    }
}

/// One logical simulation target: a recoil element and everything the
/// simulator needs to run it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationJob {
    pub directory: PathBuf,
    pub name_prefix: String,
    pub name: String,
    pub settings: SimulationSettings,
    pub beam: Beam,
    pub target: Target,
    pub detector: Detector,
    /// The first recoil is the main recoil.
    pub recoils: Vec<RecoilDistribution>,
    pub optimization_recoils: Vec<RecoilDistribution>,
    pub optimized_fluence: Option<f64>,
    pub reference_density: f64,
    pub fluence: f64,
}

impl SimulationJob {
    pub fn full_name(&self) -> String {
        if self.name_prefix.is_empty() {
            self.name.clone()
        } else {
            format!("{}-{}", self.name_prefix, self.name)
        }
    }

    pub fn main_recoil(&self) -> Option<&RecoilDistribution> {
        self.recoils.first()
    }
}

impl Default for SimulationJob {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
            name_prefix: String::new(),
            name: "Default".to_string(),
            settings: SimulationSettings::default(),
            beam: Beam::default(),
            target: Target::default(),
            detector: Detector::default(),
            recoils: Vec::new(),
            optimization_recoils: Vec::new(),
            optimized_fluence: None,
            reference_density: DEFAULT_REFERENCE_DENSITY,
            fluence: DEFAULT_FLUENCE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ion_division_splits_counts() {
        assert_eq!(IonDivision::None.ion_counts(100, 1000, 4), (100, 1000));
        assert_eq!(IonDivision::Sim.ion_counts(100, 1000, 4), (100, 250));
        assert_eq!(IonDivision::Both.ion_counts(100, 1000, 4), (25, 250));
        assert_eq!(IonDivision::Both.ion_counts(-5, 10, 0), (0, 10));
    }

    #[test]
    fn recoil_file_is_padded() {
        let recoil = RecoilDistribution::new(
            "default",
            Element::new("Li", Some(7), 7.016),
            vec![RecoilPoint::new(5.0, 0.5), RecoilPoint::new(20.0, 0.5)],
        );
        let lines = recoil.mcerd_lines();
        assert_eq!(lines[0], "0.00 0.000001");
        assert_eq!(lines[1], "4.99 0.000001");
        assert_eq!(lines[2], "5.00 0.5000");
        assert_eq!(lines[lines.len() - 2], "20.01 0.0");
        assert_eq!(lines[lines.len() - 1], "20.02 0.0");
        assert_eq!(recoil.full_name(), "7Li-default");
    }

    #[test]
    fn deep_first_point_gets_plateau() {
        let recoil = RecoilDistribution::new(
            "deep",
            Element::default(),
            vec![RecoilPoint::new(30.0, 1.0), RecoilPoint::new(40.0, 1.0)],
        );
        let lines = recoil.mcerd_lines();
        assert_eq!(&lines[..4], ["0.00 0.000001", "10.00 0.000001", "10.01 0.0000", "29.99 0.0000"]);
    }

    #[test]
    fn detector_geometry() {
        let foil = |d: f64| Foil {
            name: "f".into(),
            shape: FoilShape::Circular { diameter: 10.0 },
            distance: d,
            layers: vec![],
            transmission: 0.9,
        };
        let det = Detector {
            foils: vec![foil(100.0), foil(200.0), foil(800.0)],
            ..Default::default()
        };
        assert!((det.tof_length() - 0.6).abs() < 1e-12);
        let expected = std::f64::consts::PI * 25.0 / 640_000.0 * 1000.0 * 0.9f64.powi(3);
        assert!((det.solid_angle() - expected).abs() < 1e-9);
    }
}
