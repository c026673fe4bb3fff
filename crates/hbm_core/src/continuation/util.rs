//! Arclength metric and corrector equations.
//!
//! All quantities here live in conditioned coordinates. The weighted inner
//! product on augmented vectors is `c <dX, dY> + b dlam_x dlam_y`.

use crate::error::{HbError, HbResult};
use nalgebra::{DMatrix, DVector, DVectorView};

/// Weights of the arclength inner product.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArcMetric {
    /// Weight on `lam` (`frac_lam`).
    pub b: f64,
    /// Weight on the unknowns, `(1 - b) / |X_C0|^2`.
    pub c: f64,
}

impl ArcMetric {
    /// Metric about the reference unknowns `x_c0` (without `lam`). A zero
    /// reference falls back to `c = 1 - b`.
    pub fn new(frac_lam: f64, x_c0: DVectorView<f64>) -> Self {
        let norm_sq = x_c0.norm_squared();
        let c = if norm_sq > 0.0 {
            (1.0 - frac_lam) / norm_sq
        } else {
            1.0 - frac_lam
        };
        Self { b: frac_lam, c }
    }

    pub fn inner(&self, a: &DVector<f64>, b: &DVector<f64>) -> f64 {
        let n = a.len() - 1;
        self.c * a.rows(0, n).dot(&b.rows(0, n)) + self.b * a[n] * b[n]
    }

    pub fn norm_sq(&self, a: &DVector<f64>) -> f64 {
        self.inner(a, a)
    }

    /// Gradient of `<a, y>` with respect to `y`.
    fn weighted(&self, a: &DVector<f64>) -> DVector<f64> {
        let n = a.len() - 1;
        let mut out = a * self.c;
        out[n] = self.b * a[n];
        out
    }
}

/// Pseudo-arclength residual `(|XlamC - XlamC0|^2 - ds^2) / ds^2` and its
/// gradient with respect to `xlam_c`.
pub fn pseudo_arc_res(
    xlam_c: &DVector<f64>,
    xlam_c0: &DVector<f64>,
    ds: f64,
    metric: &ArcMetric,
) -> (f64, DVector<f64>) {
    let delta = xlam_c - xlam_c0;
    let ds_sq = ds * ds;
    let rarc = (metric.norm_sq(&delta) - ds_sq) / ds_sq;
    let grad = metric.weighted(&delta) * (2.0 / ds_sq);
    (rarc, grad)
}

/// Orthogonal corrector residual: the deviation of `xlam_c` from the
/// predicted point `xlam_c0 + dir_c ds`, projected on `dir_c` and divided
/// by `ds`.
pub fn orthogonal_arc_res(
    xlam_c: &DVector<f64>,
    xlam_c0: &DVector<f64>,
    dir_c: &DVector<f64>,
    ds: f64,
    metric: &ArcMetric,
) -> (f64, DVector<f64>) {
    let deviation = xlam_c - (xlam_c0 + dir_c * ds);
    let rarc = metric.inner(&deviation, dir_c) / ds;
    let grad = metric.weighted(dir_c) / ds;
    (rarc, grad)
}

/// `[dR/dX diag(CtoP_X) | dR/dlam CtoP_lam]`, the `N x (N + 1)` Jacobian with
/// respect to conditioned unknowns.
pub fn conditioned_jacobian(
    drdx: &DMatrix<f64>,
    drdlam: &DVector<f64>,
    ctop: &DVector<f64>,
) -> HbResult<DMatrix<f64>> {
    let n = drdx.nrows();
    if drdx.ncols() != n {
        return Err(HbError::DimensionMismatch {
            what: "dR/dX columns",
            expected: n,
            actual: drdx.ncols(),
        });
    }
    if drdlam.len() != n {
        return Err(HbError::DimensionMismatch {
            what: "dR/dlam length",
            expected: n,
            actual: drdlam.len(),
        });
    }
    if ctop.len() != n + 1 {
        return Err(HbError::DimensionMismatch {
            what: "conditioning vector length",
            expected: n + 1,
            actual: ctop.len(),
        });
    }

    let mut jac = DMatrix::zeros(n, n + 1);
    for col in 0..n {
        jac.set_column(col, &(drdx.column(col) * ctop[col]));
    }
    jac.set_column(n, &(drdlam * ctop[n]));
    Ok(jac)
}

/// Appends `lam` to the unknowns.
pub fn augment(x: &DVector<f64>, lam: f64) -> DVector<f64> {
    let n = x.len();
    let mut xlam = x.clone().resize_vertically(n + 1, 0.0);
    xlam[n] = lam;
    xlam
}
