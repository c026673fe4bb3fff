use anyhow::Result;
use nalgebra::{DMatrix, DVector};
use num_traits::{One, Zero};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::ops::{Add, Div, Mul, Neg, Sub};

use crate::harmonic::HarmonicSet;

/// A trait for types that can be used as scalars in force laws.
/// Implemented for `f64` and for `Dual` so one generic law yields both the
/// value and its derivative.
pub trait Scalar:
    Copy
    + Debug
    + PartialOrd
    + Zero
    + One
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + 'static
{
    /// Lifts a constant into the scalar type.
    fn from_f64(value: f64) -> Self;

    /// Real (value) part.
    fn value(self) -> f64;

    fn abs(self) -> Self;

    fn powi(self, n: i32) -> Self;
}

impl Scalar for f64 {
    fn from_f64(value: f64) -> Self {
        value
    }

    fn value(self) -> f64 {
        self
    }

    fn abs(self) -> Self {
        f64::abs(self)
    }

    fn powi(self, n: i32) -> Self {
        f64::powi(self, n)
    }
}

/// Tags whether a force element depends only on the current instant or on
/// the displacement history (and therefore on a committed history state).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForceKind {
    Instantaneous,
    Hysteretic,
}

impl ForceKind {
    pub fn requires_history(self) -> bool {
        matches!(self, ForceKind::Hysteretic)
    }
}

/// Committed history of one force element, in local coordinates.
///
/// History only changes through [`ForceElement::commit_history`]; every
/// force evaluation reads it and never writes it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementHistory {
    /// Local displacement at the last committed state.
    pub displacement: Vec<f64>,
    /// Local force at the last committed state.
    pub force: Vec<f64>,
}

impl ElementHistory {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn zeros(local_dofs: usize) -> Self {
        Self {
            displacement: vec![0.0; local_dofs],
            force: vec![0.0; local_dofs],
        }
    }
}

/// Single-point nonlinear force in global coordinates.
#[derive(Debug, Clone)]
pub struct StaticForce {
    pub force: DVector<f64>,
    pub jacobian: DMatrix<f64>,
}

/// Harmonic force from an AFT evaluation in global coordinates.
/// Gradients are `None` when the evaluation was requested without them.
#[derive(Debug, Clone)]
pub struct AftForce {
    pub force: DVector<f64>,
    pub dfdu: Option<DMatrix<f64>>,
    pub dfdw: Option<DVector<f64>>,
}

/// Local quantities of one AFT evaluation, for postprocessing.
#[derive(Debug, Clone)]
pub struct LocalResponse {
    /// Local displacement harmonics, `(Nhc, Nnl)`.
    pub displacement_harmonics: DMatrix<f64>,
    /// Local displacement time series, `(Nt, Nnl)`.
    pub displacement_series: DMatrix<f64>,
    /// Local force harmonics, `(Nhc, Nnl)`.
    pub force_harmonics: DMatrix<f64>,
    /// Local force time series, `(Nt, Nnl)`.
    pub force_series: DMatrix<f64>,
}

/// Contract every nonlinear joint element satisfies so the assembler can
/// treat them uniformly.
pub trait ForceElement {
    fn kind(&self) -> ForceKind;

    /// Number of global degrees of freedom the element maps from.
    fn global_dofs(&self) -> usize;

    /// History before anything has been committed.
    fn initial_history(&self) -> ElementHistory;

    /// Force and Jacobian at a single global displacement `x`.
    fn static_force(&self, x: &DVector<f64>, history: &ElementHistory) -> Result<StaticForce>;

    /// Alternating frequency-time evaluation for global harmonic
    /// displacements `u` (blocks of `global_dofs` per harmonic component)
    /// at frequency `w`.
    fn aft(
        &self,
        u: &DVector<f64>,
        w: f64,
        harmonics: &HarmonicSet,
        nt: usize,
        history: &ElementHistory,
        calc_grad: bool,
    ) -> Result<AftForce>;

    /// Same evaluation as [`ForceElement::aft`], reported in local
    /// coordinates with the intermediate time series.
    fn local_response(
        &self,
        u: &DVector<f64>,
        w: f64,
        harmonics: &HarmonicSet,
        nt: usize,
        history: &ElementHistory,
    ) -> Result<LocalResponse>;

    /// History after accepting the global displacement `x`.
    fn commit_history(&self, x: &DVector<f64>, history: &ElementHistory) -> Result<ElementHistory>;
}
