use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::domain::round_to;

/// A binned energy spectrum: `(energy, count)` pairs ordered by energy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Spectrum {
    pub points: Vec<(f64, f64)>,
}

impl Spectrum {
    pub fn new(points: Vec<(f64, f64)>) -> Self {
        Self { points }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Parses whitespace separated `x y` rows. Rows that do not hold two
    /// numbers are skipped.
    pub fn parse(text: &str) -> Self {
        let points = text
            .lines()
            .filter_map(|line| {
                let mut cols = line.split_whitespace();
                let x = cols.next()?.parse::<f64>().ok()?;
                let y = cols.next()?.parse::<f64>().ok()?;
                Some((x, y))
            })
            .collect();
        Self { points }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read spectrum {}", path.display()))?;
        Ok(Self::parse(&text))
    }

    /// Shifts a measured histogram onto bin centres so it lines up with the
    /// simulated spectra: a zero bin is added on both sides, then each pair of
    /// neighbours is replaced by its midpoint.
    pub fn to_bin_centres(&self, channel_width: f64) -> Self {
        let (Some(&(first_x, _)), Some(&(last_x, _))) = (self.points.first(), self.points.last())
        else {
            return Self::default();
        };

        let mut padded = Vec::with_capacity(self.points.len() + 2);
        padded.push((round_to(first_x - channel_width, 4), 0.0));
        padded.extend_from_slice(&self.points);
        padded.push((round_to(last_x + channel_width, 4), 0.0));

        let points = padded
            .windows(2)
            .map(|w| {
                (
                    round_to((w[0].0 + w[1].0) / 2.0, 4),
                    round_to((w[0].1 + w[1].1) / 2.0, 5),
                )
            })
            .collect();
        Self { points }
    }
}

/// Extends the shorter ends of both spectra with zero bins spaced
/// `channel_width` apart so that they cover the same energy range.
pub fn uniform_pair(a: &Spectrum, b: &Spectrum, channel_width: f64) -> (Spectrum, Spectrum) {
    let mut first = a.points.clone();
    let mut second = b.points.clone();
    if first.is_empty() || second.is_empty() || channel_width <= 0.0 {
        return (Spectrum::new(first), Spectrum::new(second));
    }

    pad_front(&mut first, &second, channel_width);
    pad_front(&mut second, &first, channel_width);
    pad_back(&mut first, &second, channel_width);
    pad_back(&mut second, &first, channel_width);

    (Spectrum::new(first), Spectrum::new(second))
}

fn pad_front(target: &mut Vec<(f64, f64)>, reference: &[(f64, f64)], ch: f64) {
    let lowest = reference[0].0;
    if lowest >= target[0].0 {
        return;
    }
    let mut prefix = Vec::new();
    let mut x = target[0].0 - ch;
    while round_to(x, 4) >= lowest {
        prefix.push((round_to(x, 4), 0.0));
        x -= ch;
    }
    prefix.reverse();
    target.splice(0..0, prefix);
}

fn pad_back(target: &mut Vec<(f64, f64)>, reference: &[(f64, f64)], ch: f64) {
    let highest = reference[reference.len() - 1].0;
    let mut x = target[target.len() - 1].0;
    if highest <= x {
        return;
    }
    x += ch;
    while round_to(x, 4) <= highest {
        target.push((round_to(x, 4), 0.0));
        x += ch;
    }
}

/// Mean absolute difference over bins where either spectrum is non-zero.
///
/// Infinite when either spectrum is empty or no bin qualifies, so a missing
/// sample never looks converged.
pub fn calculate_change(a: &Spectrum, b: &Spectrum, channel_width: f64) -> f64 {
    if a.is_empty() || b.is_empty() {
        return f64::INFINITY;
    }
    let (ua, ub) = uniform_pair(a, b, channel_width);

    let mut sum = 0.0;
    let mut count = 0usize;
    for (p, q) in ua.points.iter().zip(ub.points.iter()) {
        if p.1 != 0.0 || q.1 != 0.0 {
            sum += (p.1 - q.1).abs();
            count += 1;
        }
    }

    if count == 0 {
        f64::INFINITY
    } else {
        sum / count as f64
    }
}

/// Area between the two curves after putting them on a common grid.
pub fn area_between(a: &Spectrum, b: &Spectrum, channel_width: f64) -> f64 {
    if a.is_empty() || b.is_empty() {
        return f64::INFINITY;
    }
    let (ua, ub) = uniform_pair(a, b, channel_width);
    let diffs: Vec<(f64, f64)> = ua
        .points
        .iter()
        .zip(ub.points.iter())
        .map(|(p, q)| (p.0, (p.1 - q.1).abs()))
        .collect();

    diffs
        .windows(2)
        .map(|w| (w[1].0 - w[0].0) * (w[0].1 + w[1].1) / 2.0)
        .sum()
}

/// Mean of squared point-wise differences on a common grid.
pub fn sum_squared_error(a: &Spectrum, b: &Spectrum, channel_width: f64) -> f64 {
    if a.is_empty() || b.is_empty() {
        return f64::INFINITY;
    }
    let (ua, ub) = uniform_pair(a, b, channel_width);
    let n = ua.len().min(ub.len());
    if n == 0 {
        return f64::INFINITY;
    }
    let total: f64 = ua
        .points
        .iter()
        .zip(ub.points.iter())
        .map(|(p, q)| (p.1 - q.1).powi(2))
        .sum();
    total / n as f64
}

/// Keeps the four most significant digits of a positive value,
/// e.g. `123456.0 -> 123500.0`.
pub fn round_value_by_four_biggest(value: f64) -> f64 {
    if value <= 0.0 || !value.is_finite() {
        return value;
    }
    let digits = value.log10().floor() as i32 + 1;
    let factor = 10f64.powi(digits - 4);
    (value / factor).round() * factor
}
