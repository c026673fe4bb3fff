//! Harmonic balance transforms.
//!
//! Harmonic coefficient data is laid out in blocks of degrees of freedom per
//! harmonic component: `[h0 (if present), h1 cos, h1 sin, h2 cos, h2 sin, ...]`
//! following the order of the [`HarmonicSet`]. Time series are sampled at `Nt`
//! equally spaced points of the nondimensional period `tau = w t` in `[0, 2 pi)`,
//! so time derivatives of order `n` must be multiplied by `w^n` to obtain
//! physical rates.

pub mod conditioning;
pub mod stiffness;

pub use conditioning::{harmonic_wise_conditioning, ConditioningFloor};
pub use stiffness::harmonic_stiffness_operator;

use crate::error::{HbError, HbResult};
use nalgebra::DMatrix;
use num_complex::Complex;
use rustfft::FftPlanner;
use serde::{Deserialize, Serialize};

/// Ordered set of distinct non-negative harmonic indices.
/// The zeroth harmonic, when present, is first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<usize>", into = "Vec<usize>")]
pub struct HarmonicSet {
    harmonics: Vec<usize>,
}

/// Position of one harmonic inside a coefficient block layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HarmonicBlock {
    pub harmonic: usize,
    /// First harmonic component row for this harmonic.
    pub row: usize,
    /// 1 for the zeroth harmonic (cosine only), 2 otherwise.
    pub width: usize,
}

impl HarmonicSet {
    pub fn new(harmonics: Vec<usize>) -> HbResult<Self> {
        if harmonics.is_empty() {
            return Err(HbError::EmptyHarmonics);
        }
        harmonic_component_count(&harmonics)?;
        if harmonics.iter().skip(1).any(|&h| h == 0) {
            return Err(HbError::ZeroHarmonicNotFirst);
        }
        Ok(Self { harmonics })
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.harmonics
    }

    pub fn len(&self) -> usize {
        self.harmonics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.harmonics.is_empty()
    }

    pub fn max_harmonic(&self) -> usize {
        self.harmonics.iter().copied().max().unwrap_or(0)
    }

    /// Number of scalar harmonic components per degree of freedom (`Nhc`).
    pub fn component_count(&self) -> usize {
        self.harmonics
            .iter()
            .map(|&h| if h == 0 { 1 } else { 2 })
            .sum()
    }

    pub fn blocks(&self) -> Vec<HarmonicBlock> {
        let mut row = 0;
        self.harmonics
            .iter()
            .map(|&harmonic| {
                let width = if harmonic == 0 { 1 } else { 2 };
                let block = HarmonicBlock {
                    harmonic,
                    row,
                    width,
                };
                row += width;
                block
            })
            .collect()
    }
}

impl TryFrom<Vec<usize>> for HarmonicSet {
    type Error = HbError;

    fn try_from(value: Vec<usize>) -> HbResult<Self> {
        HarmonicSet::new(value)
    }
}

impl From<HarmonicSet> for Vec<usize> {
    fn from(value: HarmonicSet) -> Self {
        value.harmonics
    }
}

/// `2 * count(h != 0) + count(h == 0)`; repeated harmonics are rejected.
pub fn harmonic_component_count(harmonics: &[usize]) -> HbResult<usize> {
    let mut seen = harmonics.to_vec();
    seen.sort_unstable();
    if let Some(pair) = seen.windows(2).find(|pair| pair[0] == pair[1]) {
        return Err(HbError::DuplicateHarmonic { harmonic: pair[0] });
    }
    Ok(harmonics
        .iter()
        .map(|&h| if h == 0 { 1 } else { 2 })
        .sum())
}

pub(crate) fn check_sampling(nt: usize, harmonics: &HarmonicSet) -> HbResult<()> {
    let required = 2 * harmonics.max_harmonic() + 1;
    if nt <= required {
        return Err(HbError::Aliasing {
            nt,
            max_harmonic: harmonics.max_harmonic(),
            required,
        });
    }
    Ok(())
}

/// `(i k)^order`, the multiplier a time derivative applies to the complex
/// amplitude `a - i b` of harmonic `k`.
fn derivative_factor(harmonic: usize, order: u32) -> Complex<f64> {
    let step = Complex::new(0.0, harmonic as f64);
    (0..order).fold(Complex::new(1.0, 0.0), |acc, _| acc * step)
}

/// Samples `nt` equally spaced points of each column of harmonic
/// coefficients `coeffs` (`(Nhc, nd)`), or of its `order`-th derivative with
/// respect to `tau`. Returns an `(nt, nd)` matrix.
pub fn time_series_from_harmonics(
    nt: usize,
    harmonics: &HarmonicSet,
    coeffs: &DMatrix<f64>,
    order: u32,
) -> HbResult<DMatrix<f64>> {
    let nhc = harmonics.component_count();
    if coeffs.nrows() != nhc {
        return Err(HbError::DimensionMismatch {
            what: "harmonic coefficient rows",
            expected: nhc,
            actual: coeffs.nrows(),
        });
    }
    check_sampling(nt, harmonics)?;

    let nd = coeffs.ncols();
    let blocks = harmonics.blocks();
    let ifft = FftPlanner::<f64>::new().plan_fft_inverse(nt);
    let scale = nt as f64 / 2.0;

    let mut series = DMatrix::zeros(nt, nd);
    let mut buffer = vec![Complex::new(0.0, 0.0); nt];
    for dof in 0..nd {
        buffer.fill(Complex::new(0.0, 0.0));
        for block in &blocks {
            let k = block.harmonic;
            if k == 0 {
                if order == 0 {
                    buffer[0] = Complex::new(coeffs[(block.row, dof)] * nt as f64, 0.0);
                }
                continue;
            }
            let amplitude = Complex::new(coeffs[(block.row, dof)], -coeffs[(block.row + 1, dof)])
                * derivative_factor(k, order)
                * scale;
            buffer[k] = amplitude;
            buffer[nt - k] = amplitude.conj();
        }
        ifft.process(&mut buffer);
        for (t, value) in buffer.iter().enumerate() {
            series[(t, dof)] = value.re / nt as f64;
        }
    }
    Ok(series)
}

/// Harmonic coefficients (`(Nhc, nd)`) of the harmonics in `harmonics` for
/// each column of the `(Nt, nd)` time series `samples`.
pub fn fourier_coefficients_from_time_series(
    harmonics: &HarmonicSet,
    samples: &DMatrix<f64>,
) -> HbResult<DMatrix<f64>> {
    let nt = samples.nrows();
    check_sampling(nt, harmonics)?;

    let nd = samples.ncols();
    let blocks = harmonics.blocks();
    let fft = FftPlanner::<f64>::new().plan_fft_forward(nt);
    let half = nt as f64 / 2.0;

    let mut coeffs = DMatrix::zeros(harmonics.component_count(), nd);
    let mut buffer = vec![Complex::new(0.0, 0.0); nt];
    for dof in 0..nd {
        for (t, slot) in buffer.iter_mut().enumerate() {
            *slot = Complex::new(samples[(t, dof)], 0.0);
        }
        fft.process(&mut buffer);
        for block in &blocks {
            let bin = buffer[block.harmonic];
            if block.harmonic == 0 {
                coeffs[(block.row, dof)] = bin.re / nt as f64;
            } else {
                coeffs[(block.row, dof)] = bin.re / half;
                coeffs[(block.row + 1, dof)] = -bin.im / half;
            }
        }
    }
    Ok(coeffs)
}
