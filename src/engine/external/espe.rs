use std::fs::{self, File};
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;

use anyhow::{anyhow, bail, Context, Result};

use crate::analysis::spectrum::Spectrum;
use crate::core::domain::{DetectorType, SimulationJob};

/// Converts raw result-file events into a binned energy spectrum.
pub trait SpectrumReconstructor: Send + Sync {
    fn reconstruct(&self, request: &EspeRequest) -> Result<Spectrum>;

    fn name(&self) -> &str;
}

/// Inputs of one spectrum reconstruction.
#[derive(Debug, Clone, PartialEq)]
pub struct EspeRequest {
    pub beam_ion: String,
    pub energy: f64,      // MeV
    pub theta: f64,       // deg
    pub tangle: f64,      // deg
    pub toflen: f64,      // m
    pub solid: f64,       // msr
    pub timeres: f64,     // ps
    pub eres: f64,        // keV
    pub detector_type: DetectorType,
    pub reference_density: f64,
    pub channel_width: f64,
    pub fluence: f64,
    pub recoil_file: PathBuf,
    pub erd_files: Vec<PathBuf>,
    /// Also write the spectrum here when set.
    pub output_file: Option<PathBuf>,
}

impl EspeRequest {
    pub fn from_job(
        job: &SimulationJob,
        recoil_file: PathBuf,
        erd_files: Vec<PathBuf>,
        channel_width: f64,
        fluence: f64,
    ) -> Self {
        Self {
            beam_ion: job.beam.ion.prefix(),
            energy: job.beam.energy,
            theta: job.detector.detector_theta,
            tangle: job.target.target_theta,
            toflen: job.detector.tof_length(),
            solid: job.detector.solid_angle(),
            timeres: job.detector.timeres,
            eres: job.detector.energyres,
            detector_type: job.detector.detector_type,
            reference_density: job.reference_density,
            channel_width,
            fluence,
            recoil_file,
            erd_files,
            output_file: None,
        }
    }

    /// Command line arguments of `get_espe`.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "-beam".to_string(),
            self.beam_ion.clone(),
            "-energy".to_string(),
            self.energy.to_string(),
            "-theta".to_string(),
            self.theta.to_string(),
            "-tangle".to_string(),
            self.tangle.to_string(),
        ];
        match self.detector_type {
            DetectorType::Tof => args.extend([
                "-timeres".to_string(),
                self.timeres.to_string(),
                "-toflen".to_string(),
                self.toflen.to_string(),
            ]),
            DetectorType::Energy => {
                args.extend(["-eres".to_string(), self.eres.to_string()])
            }
        }
        args.extend([
            "-solid".to_string(),
            self.solid.to_string(),
            "-dose".to_string(),
            self.fluence.to_string(),
            "-avemass".to_string(),
            "-density".to_string(),
            self.reference_density.to_string(),
            "-ch".to_string(),
            self.channel_width.to_string(),
            "-dist".to_string(),
            self.recoil_file.display().to_string(),
        ]);
        args
    }
}

/// Pipes result files through the `get_espe` executable.
pub struct GetEspe {
    executable: PathBuf,
}

impl GetEspe {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }

    fn run_process(&self, request: &EspeRequest) -> Result<String> {
        let mut child = Command::new(&self.executable)
            .args(request.args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.executable.display()))?;

        // Feed stdin from a separate thread so a full stdout pipe cannot stall us.
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("get_espe stdin was not captured"))?;
        let files = request.erd_files.clone();
        let writer = thread::spawn(move || -> io::Result<()> {
            for path in files {
                // Files may vanish between listing and reading.
                if let Ok(mut f) = File::open(&path) {
                    io::copy(&mut f, &mut stdin)?;
                }
            }
            stdin.flush()
        });

        let output = child.wait_with_output().context("Failed to read get_espe output")?;
        match writer.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.kind() == io::ErrorKind::BrokenPipe => {}
            Ok(Err(e)) => return Err(e).context("Failed to write get_espe input"),
            Err(_) => bail!("get_espe input writer panicked"),
        }

        if !output.status.success() {
            bail!("get_espe exited with status {}", output.status);
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl SpectrumReconstructor for GetEspe {
    fn name(&self) -> &str {
        "get_espe"
    }

    fn reconstruct(&self, request: &EspeRequest) -> Result<Spectrum> {
        if request.erd_files.is_empty() {
            return Ok(Spectrum::default());
        }
        let stdout = self.run_process(request)?;
        let spectrum = Spectrum::parse(&stdout);

        if let Some(path) = &request.output_file {
            let text: String = spectrum
                .points
                .iter()
                .map(|(x, y)| format!("{} {}\n", x, y))
                .collect();
            fs::write(path, text)
                .with_context(|| format!("Failed to write spectrum {}", path.display()))?;
        }
        Ok(spectrum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::domain::{Foil, FoilShape};

    fn job() -> SimulationJob {
        let foil = |d: f64| Foil {
            name: "f".into(),
            shape: FoilShape::Rectangular { width: 10.0, height: 10.0 },
            distance: d,
            layers: vec![],
            transmission: 1.0,
        };
        let mut job = SimulationJob::default();
        job.detector.foils = vec![foil(100.0), foil(200.0), foil(700.0)];
        job
    }

    #[test]
    fn tof_arguments() {
        let req = EspeRequest::from_job(&job(), "a.recoil".into(), vec![], 0.025, 1e11);
        let args = req.args();
        assert_eq!(args[0], "-beam");
        assert_eq!(args[1], "35Cl");
        assert!(args.windows(2).any(|w| w[0] == "-toflen" && w[1] == "0.5"));
        assert!(args.windows(2).any(|w| w[0] == "-ch" && w[1] == "0.025"));
        assert!(!args.contains(&"-eres".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("a.recoil"));
    }

    #[test]
    fn energy_detector_uses_resolution() {
        let mut j = job();
        j.detector.detector_type = DetectorType::Energy;
        let args = EspeRequest::from_job(&j, "a.recoil".into(), vec![], 0.025, 1e11).args();
        assert!(args.contains(&"-eres".to_string()));
        assert!(!args.contains(&"-timeres".to_string()));
    }

    #[test]
    fn no_files_means_empty_spectrum() {
        let req = EspeRequest::from_job(&job(), "a.recoil".into(), vec![], 0.025, 1e11);
        let espe = GetEspe::new("/nonexistent/get_espe");
        assert!(espe.reconstruct(&req).unwrap().is_empty());
    }
}
