use anyhow::{anyhow, Result};
use nalgebra::{DMatrix, DVector};

/// Residual of an augmented point `[X, lam]` in physical units.
#[derive(Debug, Clone)]
pub struct ResidualEval {
    pub r: DVector<f64>,
    pub drdx: Option<DMatrix<f64>>,
    pub drdlam: Option<DVector<f64>>,
}

impl ResidualEval {
    pub fn with_gradients(r: DVector<f64>, drdx: DMatrix<f64>, drdlam: DVector<f64>) -> Self {
        Self {
            r,
            drdx: Some(drdx),
            drdlam: Some(drdlam),
        }
    }

    pub fn residual_only(r: DVector<f64>) -> Self {
        Self {
            r,
            drdx: None,
            drdlam: None,
        }
    }

    pub fn gradients(&self) -> Result<(&DMatrix<f64>, &DVector<f64>)> {
        match (&self.drdx, &self.drdlam) {
            (Some(drdx), Some(drdlam)) => Ok((drdx, drdlam)),
            _ => Err(anyhow!("residual function returned no gradients")),
        }
    }
}

/// Core interface implemented by any system that can be continued.
///
/// Evaluations must be free of side effects: the same point always gives the
/// same residual until the caller changes the system between runs.
pub trait ContinuationProblem {
    /// Number of unknowns `N`, excluding the continuation parameter.
    fn dimension(&self) -> usize;

    /// Residual `R` (length `N`) at `xlam` (length `N + 1`). Gradients must be
    /// returned whenever `calc_grad` is true.
    fn residual(&self, xlam: &DVector<f64>, calc_grad: bool) -> Result<ResidualEval>;
}

/// Adapts a closure to [`ContinuationProblem`].
pub struct FnProblem<F> {
    dimension: usize,
    fun: F,
}

impl<F> FnProblem<F>
where
    F: Fn(&DVector<f64>, bool) -> Result<ResidualEval>,
{
    pub fn new(dimension: usize, fun: F) -> Self {
        Self { dimension, fun }
    }
}

impl<F> ContinuationProblem for FnProblem<F>
where
    F: Fn(&DVector<f64>, bool) -> Result<ResidualEval>,
{
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn residual(&self, xlam: &DVector<f64>, calc_grad: bool) -> Result<ResidualEval> {
        (self.fun)(xlam, calc_grad)
    }
}
