//! Helpers for inspecting converged harmonic balance solutions.

use crate::harmonic::{check_sampling, HarmonicSet};
use crate::system::VibrationSystem;
use crate::traits::LocalResponse;
use anyhow::Result;
use nalgebra::DVector;
use std::f64::consts::PI;

/// Local displacement and force, in harmonics and time, of every nonlinear
/// element at the harmonic solution `u` and frequency `w`. Uses the
/// system's committed history.
pub fn local_harmonic_forces(
    system: &VibrationSystem,
    u: &DVector<f64>,
    w: f64,
    harmonics: &HarmonicSet,
    nt: usize,
) -> Result<Vec<LocalResponse>> {
    check_sampling(nt, harmonics)?;
    system
        .nonlinear_forces()
        .iter()
        .zip(&system.history().elements)
        .map(|(force, history)| force.local_response(u, w, harmonics, nt, history))
        .collect()
}

/// Marks entries `i` where `x` changes sign between `i` and `i + 1`. The last
/// entry is never marked. With `zero_tol`, only crossings starting at
/// `|x[i]| < zero_tol` count.
pub fn zero_crossing(x: &[f64], zero_tol: Option<f64>) -> Vec<bool> {
    let tol = zero_tol.unwrap_or(f64::INFINITY);
    let mut marks: Vec<bool> = x
        .windows(2)
        .map(|pair| pair[0] * pair[1] < 0.0 && pair[0].abs() < tol)
        .collect();
    if !x.is_empty() {
        marks.push(false);
    }
    marks
}

/// Wraps phases into `(-pi, pi]`, assuming each is within one period of it.
pub fn shift_pm_pi(phase: &[f64]) -> Vec<f64> {
    phase
        .iter()
        .map(|&p| {
            if p > PI {
                p - 2.0 * PI
            } else if p <= -PI {
                p + 2.0 * PI
            } else {
                p
            }
        })
        .collect()
}
