//! Nonlinear root finding and the dense linear algebra it is built on.
//!
//! [`NonlinearSolver::nsolve`] runs Newton-Raphson iterations, optionally
//! interleaved with quasi-Newton (BFGS) updates of the factored Jacobian
//! between full reforms. The residual `R`/`dRdX` it returns are those of the
//! last evaluation, i.e. at the iterate *before* the final accepted step.

use crate::error::{HbError, HbResult};
use anyhow::{anyhow, Result};
use log::{debug, log_enabled, warn, Level};
use nalgebra::linalg::LU;
use nalgebra::{DMatrix, DVector, Dyn, SymmetricEigen};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;

/// Named convergence criteria.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tolerance {
    /// Norm of the step `|dX|`.
    Xtol,
    /// Norm of the residual `|R|`.
    Rtol,
    /// Energy norm `|R . dX_prev|`.
    Etol,
    XtolRel,
    RtolRel,
    EtolRel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NonlinearSolverConfig {
    pub max_steps: usize,
    /// Iterations between full Jacobian evaluations; 1 is pure Newton.
    pub reform_freq: usize,
    /// When unset, `1e-6 * N` is used for an `N` unknown solve.
    pub xtol: Option<f64>,
    pub rtol: Option<f64>,
    pub etol: Option<f64>,
    pub xtol_rel: Option<f64>,
    pub rtol_rel: Option<f64>,
    pub etol_rel: Option<f64>,
    /// Any satisfied criterion ends the iteration successfully.
    pub stopping_tol: Vec<Tolerance>,
    /// Checked once against the final iterate when `max_steps` runs out.
    pub accepting_tol: Vec<Tolerance>,
}

impl Default for NonlinearSolverConfig {
    fn default() -> Self {
        Self {
            max_steps: 20,
            reform_freq: 1,
            xtol: None,
            rtol: None,
            etol: None,
            xtol_rel: None,
            rtol_rel: None,
            etol_rel: None,
            stopping_tol: vec![Tolerance::Xtol],
            accepting_tol: Vec::new(),
        }
    }
}

impl NonlinearSolverConfig {
    pub fn validate(&self) -> HbResult<()> {
        if self.max_steps == 0 {
            return Err(HbError::config("max_steps must be greater than zero"));
        }
        if self.reform_freq == 0 {
            return Err(HbError::config("reform_freq must be at least 1"));
        }
        if self.stopping_tol.is_empty() {
            return Err(HbError::config("stopping_tol must name at least one tolerance"));
        }
        for &tol in self.stopping_tol.iter().chain(self.accepting_tol.iter()) {
            if tol != Tolerance::Xtol && self.threshold(tol, 0.0).is_none() {
                return Err(HbError::config(format!(
                    "tolerance {tol:?} is listed but has no value"
                )));
            }
        }
        Ok(())
    }

    fn threshold(&self, tol: Tolerance, xtol: f64) -> Option<f64> {
        match tol {
            Tolerance::Xtol => Some(xtol),
            Tolerance::Rtol => self.rtol,
            Tolerance::Etol => self.etol,
            Tolerance::XtolRel => self.xtol_rel,
            Tolerance::RtolRel => self.rtol_rel,
            Tolerance::EtolRel => self.etol_rel,
        }
    }
}

/// One residual evaluation. `drdx` is `None` when the Jacobian was not
/// requested.
#[derive(Debug, Clone)]
pub struct SolverEval {
    pub r: DVector<f64>,
    pub drdx: Option<DMatrix<f64>>,
}

impl SolverEval {
    pub fn with_jacobian(r: DVector<f64>, drdx: DMatrix<f64>) -> Self {
        Self {
            r,
            drdx: Some(drdx),
        }
    }

    pub fn residual_only(r: DVector<f64>) -> Self {
        Self { r, drdx: None }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolveInfo {
    pub message: String,
    pub success: bool,
    pub nfev: usize,
    pub njev: usize,
}

#[derive(Debug, Clone)]
pub struct NonlinearSolution {
    pub x: DVector<f64>,
    /// Residual of the last evaluation (one step stale).
    pub r: DVector<f64>,
    /// Jacobian of the last full evaluation (one step stale).
    pub drdx: DMatrix<f64>,
    pub info: SolveInfo,
}

/// LU factorization handle produced by [`NonlinearSolver::lin_factor`].
pub struct LinearFactor {
    lu: LU<f64, Dyn, Dyn>,
}

impl LinearFactor {
    pub fn dimension(&self) -> usize {
        self.lu.l().nrows()
    }

    fn solve(&self, b: &DVector<f64>) -> Option<DVector<f64>> {
        if !self.lu.is_invertible() {
            return None;
        }
        self.lu.solve(b)
    }
}

#[derive(Debug, Clone, Copy)]
struct ConvergenceNorms {
    x: f64,
    r: f64,
    e: f64,
    x_rel: f64,
    r_rel: f64,
    e_rel: f64,
}

impl ConvergenceNorms {
    fn get(&self, tol: Tolerance) -> f64 {
        match tol {
            Tolerance::Xtol => self.x,
            Tolerance::Rtol => self.r,
            Tolerance::Etol => self.e,
            Tolerance::XtolRel => self.x_rel,
            Tolerance::RtolRel => self.r_rel,
            Tolerance::EtolRel => self.e_rel,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepKind {
    Newton,
    Bfgs,
}

fn has_nan<'a>(values: impl IntoIterator<Item = &'a f64>) -> bool {
    values.into_iter().any(|v| v.is_nan())
}

/// Convergence rate estimate `log(q[i-1]/q[i]) / log(q[i-2]/q[i-1])`.
fn rate(values: &[f64]) -> f64 {
    match values {
        [.., a, b, c] => (b / c).ln() / (a / b).ln(),
        _ => f64::NAN,
    }
}

#[derive(Debug, Clone, Default)]
pub struct NonlinearSolver {
    config: NonlinearSolverConfig,
}

impl NonlinearSolver {
    pub fn new(config: NonlinearSolverConfig) -> HbResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &NonlinearSolverConfig {
        &self.config
    }

    /// Solves `A x = b`.
    pub fn lin_solve(&self, a: &DMatrix<f64>, b: &DVector<f64>) -> HbResult<DVector<f64>> {
        self.lin_factored_solve(&self.lin_factor(a.clone()), b)
    }

    pub fn lin_factor(&self, a: DMatrix<f64>) -> LinearFactor {
        LinearFactor { lu: a.lu() }
    }

    pub fn lin_factored_solve(
        &self,
        factor: &LinearFactor,
        b: &DVector<f64>,
    ) -> HbResult<DVector<f64>> {
        if b.len() != factor.dimension() {
            return Err(HbError::DimensionMismatch {
                what: "linear system right hand side",
                expected: factor.dimension(),
                actual: b.len(),
            });
        }
        factor.solve(b).ok_or(HbError::SingularMatrix {
            what: "linear solve",
        })
    }

    /// Generalized symmetric eigenvalue problem `K phi = lambda M phi` with
    /// `M` positive definite. Eigenvalues ascend; eigenvectors are mass
    /// normalized. `subset` selects an inclusive range of indices into the
    /// sorted spectrum.
    pub fn eigs(
        &self,
        k: &DMatrix<f64>,
        m: &DMatrix<f64>,
        subset: Option<RangeInclusive<usize>>,
    ) -> HbResult<(DVector<f64>, DMatrix<f64>)> {
        let n = k.nrows();
        for (what, mat) in [("eigs stiffness matrix", k), ("eigs mass matrix", m)] {
            if mat.nrows() != n || mat.ncols() != n {
                return Err(HbError::DimensionMismatch {
                    what,
                    expected: n,
                    actual: if mat.nrows() != n { mat.nrows() } else { mat.ncols() },
                });
            }
        }

        let chol = m.clone().cholesky().ok_or(HbError::NotPositiveDefinite {
            what: "mass matrix in eigs",
        })?;
        let l_inv = chol
            .l()
            .solve_lower_triangular(&DMatrix::identity(n, n))
            .ok_or(HbError::SingularMatrix {
                what: "mass matrix Cholesky factor",
            })?;
        let reduced = &l_inv * k * l_inv.transpose();
        let symmetric = (&reduced + reduced.transpose()) * 0.5;
        let eig = SymmetricEigen::new(symmetric);

        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| eig.eigenvalues[a].total_cmp(&eig.eigenvalues[b]));
        let selected: Vec<usize> = match subset {
            Some(range) => order
                .into_iter()
                .enumerate()
                .filter(|(rank, _)| range.contains(rank))
                .map(|(_, idx)| idx)
                .collect(),
            None => order,
        };

        let values = DVector::from_iterator(
            selected.len(),
            selected.iter().map(|&idx| eig.eigenvalues[idx]),
        );
        let mut vectors = DMatrix::zeros(n, selected.len());
        for (col, &idx) in selected.iter().enumerate() {
            let phi = l_inv.transpose() * eig.eigenvectors.column(idx);
            vectors.set_column(col, &phi);
        }
        Ok((values, vectors))
    }

    /// Solves `fun(X) = 0` from `x0`.
    ///
    /// `fun(x, calc_grad)` must return the Jacobian whenever `calc_grad` is
    /// true. `xtol` overrides the configured step tolerance for this call.
    /// Non-convergence and NaN values are reported through
    /// [`SolveInfo::success`]; only errors raised by `fun` are returned as
    /// `Err`.
    pub fn nsolve<F>(
        &self,
        mut fun: F,
        x0: &DVector<f64>,
        xtol: Option<f64>,
    ) -> Result<NonlinearSolution>
    where
        F: FnMut(&DVector<f64>, bool) -> Result<SolverEval>,
    {
        let n = x0.len();
        let xtol = xtol.or(self.config.xtol).unwrap_or(1e-6 * n as f64);
        let reform_freq = self.config.reform_freq;
        if reform_freq > 1 {
            warn!("quasi-Newton updates between Jacobian reforms are experimental");
        }

        let mut info = SolveInfo {
            message: "failed".to_string(),
            success: false,
            nfev: 0,
            njev: 0,
        };

        let mut x = x0.clone();
        let mut r = DVector::zeros(n);
        let mut drdx = DMatrix::zeros(n, n);
        let mut r_prev = DVector::zeros(n);
        let mut delta_prev: Option<DVector<f64>> = None;
        let mut factor: Option<LinearFactor> = None;
        let mut bfgs_pairs: Vec<(DVector<f64>, DVector<f64>)> = Vec::new();
        let mut bfgs_ind = 0usize;

        let (mut r0, mut u0, mut e0) = (f64::NAN, f64::NAN, f64::INFINITY);
        let mut last_norms: Option<ConvergenceNorms> = None;
        let mut stopped = false;
        let (mut r_hist, mut u_hist, mut e_hist) = (Vec::new(), Vec::new(), Vec::new());

        for i in 0..self.config.max_steps {
            let mut kind = StepKind::Newton;
            let mut delta: Option<DVector<f64>> = None;

            if bfgs_ind > 0 {
                kind = StepKind::Bfgs;
                let eval = fun(&x, false)?;
                info.nfev += 1;
                r = eval.r;
                if has_nan(r.iter()) {
                    warn!("Stopping with NaN residual");
                    stopped = true;
                    break;
                }
                delta = match (&factor, &delta_prev) {
                    (Some(factor), Some(dp)) => {
                        bfgs_step(factor, &mut bfgs_pairs, &r, &r_prev, dp)
                    }
                    _ => None,
                };
                if delta.is_none() {
                    debug!("quasi-Newton update rejected, reforming the Jacobian");
                    bfgs_ind = 0;
                }
            }

            if bfgs_ind == 0 {
                kind = StepKind::Newton;
                let eval = fun(&x, true)?;
                info.nfev += 1;
                info.njev += 1;
                r = eval.r;
                drdx = eval
                    .drdx
                    .ok_or_else(|| anyhow!("residual function returned no Jacobian"))?;
                if has_nan(r.iter()) {
                    warn!("Stopping with NaN residual");
                    stopped = true;
                    break;
                }
                if has_nan(drdx.iter()) {
                    warn!("Stopping with NaN Jacobian");
                    stopped = true;
                    break;
                }
                let new_factor = self.lin_factor(-&drdx);
                match new_factor.solve(&r) {
                    Some(step) => delta = Some(step),
                    None => {
                        warn!("Stopping with singular Jacobian");
                        info.message = "singular Jacobian".to_string();
                        stopped = true;
                        break;
                    }
                }
                factor = Some(new_factor);
                bfgs_pairs.clear();
            }

            let Some(delta) = delta else {
                stopped = true;
                break;
            };
            if has_nan(delta.iter()) {
                warn!("Stopping with NaN step direction");
                stopped = true;
                break;
            }

            x += &delta;

            let u_curr = delta.norm();
            let r_curr = r.norm();
            let mut e_curr = delta_prev
                .as_ref()
                .map_or(f64::INFINITY, |dp| r.dot(dp));
            if i == 0 {
                r0 = r_curr;
                u0 = u_curr;
                e0 = f64::INFINITY;
                e_curr = f64::INFINITY;
            }
            if i == 1 {
                e0 = e_curr.abs();
            }
            let norms = ConvergenceNorms {
                x: u_curr,
                r: r_curr,
                e: e_curr,
                x_rel: u_curr / u0,
                r_rel: r_curr / r0,
                e_rel: e_curr / e0,
            };
            last_norms = Some(norms);

            if log_enabled!(Level::Debug) {
                r_hist.push(r_curr);
                u_hist.push(u_curr);
                e_hist.push(e_curr.abs().sqrt());
                debug!(
                    "iter {:4} |R|={:.4e} |e|={:.4e} |dU|={:.4e} |R|/|R0|={:.4e} |e|/|e0|={:.4e} |dU|/|dU0|={:.4e} rates R={:.4} E={:.4} U={:.4} {:?}",
                    i,
                    r_curr,
                    e_curr,
                    u_curr,
                    norms.r_rel,
                    norms.e_rel,
                    norms.x_rel,
                    rate(&r_hist),
                    rate(&e_hist),
                    rate(&u_hist),
                    kind,
                );
            }

            if self.satisfied(&self.config.stopping_tol, &norms, xtol) {
                info.message = "Converged".to_string();
                info.success = true;
                break;
            }

            bfgs_ind = (bfgs_ind + 1) % reform_freq;
            r_prev = r.clone();
            delta_prev = Some(delta);
        }

        if !stopped && !info.success {
            if let Some(norms) = last_norms {
                if self.satisfied(&self.config.accepting_tol, &norms, xtol) {
                    debug!("Converged on accepting tolerances at max_steps");
                    info.message = "Converged".to_string();
                    info.success = true;
                }
            }
        }

        debug!(
            "{} nfev={} njev={}",
            info.message, info.nfev, info.njev
        );

        Ok(NonlinearSolution { x, r, drdx, info })
    }

    fn satisfied(&self, set: &[Tolerance], norms: &ConvergenceNorms, xtol: f64) -> bool {
        set.iter().any(|&tol| {
            self.config
                .threshold(tol, xtol)
                .is_some_and(|limit| norms.get(tol).abs() < limit)
        })
    }
}

/// BFGS inverse update around the stored factorization of `-dRdX`.
///
/// Returns `None` when the curvature condition fails (the update would
/// need the square root of a non-positive number); the caller then reforms
/// the Jacobian.
fn bfgs_step(
    factor: &LinearFactor,
    pairs: &mut Vec<(DVector<f64>, DVector<f64>)>,
    r: &DVector<f64>,
    r_prev: &DVector<f64>,
    delta_prev: &DVector<f64>,
) -> Option<DVector<f64>> {
    let gamma = r - r_prev;
    let dg = delta_prev.dot(&gamma);
    let arg = -dg / delta_prev.dot(r_prev);
    if dg == 0.0 || !arg.is_finite() || arg <= 0.0 {
        return None;
    }
    let alpha = arg.sqrt();
    let v = delta_prev / dg;
    let w = -&gamma + r_prev * alpha;
    pairs.push((v, w));

    let mut rhs = r.clone();
    for (v, w) in pairs.iter().rev() {
        rhs += w * v.dot(&rhs);
    }
    let mut step = factor.solve(&rhs)?;
    for (v, w) in pairs.iter() {
        step += v * w.dot(&step);
    }
    Some(step)
}

/// Wraps a physical-space residual so a solver can iterate on conditioned
/// unknowns `x_c` with `x_p = ctop * x_c`. The residual is scaled by
/// `rptoc` entry-wise.
pub fn conditioning_wrapper<F>(
    mut fun: F,
    ctop: DVector<f64>,
    rptoc: DVector<f64>,
) -> impl FnMut(&DVector<f64>, bool) -> Result<SolverEval>
where
    F: FnMut(&DVector<f64>, bool) -> Result<SolverEval>,
{
    move |xc: &DVector<f64>, calc_grad: bool| {
        let xp = xc.component_mul(&ctop);
        let eval = fun(&xp, calc_grad)?;
        let r = eval.r.component_mul(&rptoc);
        let drdx = eval.drdx.map(|mut jac| {
            for (col, scale) in ctop.iter().enumerate() {
                jac.column_mut(col).scale_mut(*scale);
            }
            for (row, scale) in rptoc.iter().enumerate() {
                jac.row_mut(row).scale_mut(*scale);
            }
            jac
        });
        Ok(SolverEval { r, drdx })
    }
}
