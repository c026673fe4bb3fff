//! Predictor-corrector continuation of `R(X, lam) = 0` from `lam0` to `lam1`.
//!
//! Residuals are always evaluated in physical coordinates; prediction and
//! correction work on conditioned unknowns `XlamC` with
//! `XlamP = CtoP * XlamC`.

pub mod problem;
pub mod types;
pub mod util;

pub use problem::{ContinuationProblem, FnProblem, ResidualEval};
pub use types::{
    ContinuationBranch, ContinuationConfig, ContinuationPoint, ContinuationSettings, Corrector,
    Termination,
};
pub use util::{conditioned_jacobian, orthogonal_arc_res, pseudo_arc_res, ArcMetric};

use crate::error::{HbError, HbResult};
use crate::solvers::{conditioning_wrapper, NonlinearSolution, NonlinearSolver, SolverEval};
use anyhow::{bail, Result};
use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};
use util::augment;

/// Scaling applied to the physical residual, `R_C = RPtoC * R`.
#[derive(Debug, Clone, PartialEq)]
pub enum ResidualScale {
    Scalar(f64),
    /// One entry per unknown plus one for `lam` (the last is unused by the
    /// corrector).
    PerEntry(DVector<f64>),
}

impl ResidualScale {
    pub fn entry(&self, i: usize) -> f64 {
        match self {
            ResidualScale::Scalar(s) => *s,
            ResidualScale::PerEntry(v) => v[i],
        }
    }

    pub fn mean(&self) -> f64 {
        match self {
            ResidualScale::Scalar(s) => *s,
            ResidualScale::PerEntry(v) => v.mean(),
        }
    }

    fn leading(&self, n: usize) -> DVector<f64> {
        DVector::from_fn(n, |i, _| self.entry(i))
    }
}

/// Conditioning in force while taking one step.
#[derive(Debug, Clone)]
pub struct StepConditioning {
    pub ctop: DVector<f64>,
    pub rptoc: ResidualScale,
    pub frac_lam: f64,
}

/// Unit length (in the arclength metric) prediction direction.
#[derive(Debug, Clone)]
pub struct Prediction {
    pub dir_c: DVector<f64>,
    /// Residual scale to use for the corrector that follows.
    pub rptoc: ResidualScale,
}

/// Singular bordered systems fail a step rather than the run.
fn is_singular(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<HbError>(),
        Some(HbError::SingularMatrix { .. })
    )
}

type StepCallback<'a> = Box<dyn FnMut(&DVector<f64>, &DVector<f64>) + 'a>;

pub struct Continuation<'a> {
    solver: NonlinearSolver,
    settings: ContinuationSettings,
    ctop: Option<DVector<f64>>,
    rptoc: Option<ResidualScale>,
    callback: Option<StepCallback<'a>>,
}

impl<'a> Continuation<'a> {
    pub fn new(solver: NonlinearSolver, settings: ContinuationSettings) -> Self {
        Self {
            solver,
            settings,
            ctop: None,
            rptoc: None,
            callback: None,
        }
    }

    pub fn from_config(solver: NonlinearSolver, config: &ContinuationConfig) -> HbResult<Self> {
        Ok(Self::new(solver, config.validate()?))
    }

    /// Initial conditioning `CtoP` (length `N + 1`, absolute values are used)
    /// and optional residual scale. Without this, both are ones. With dynamic
    /// conditioning `ctop` is the floor the per-step vector never drops below.
    pub fn with_conditioning(mut self, ctop: DVector<f64>, rptoc: Option<ResidualScale>) -> Self {
        self.ctop = Some(ctop.abs());
        self.rptoc = rptoc;
        self
    }

    /// Called with `(XlamP, dirP)` after the initial point (NaN direction),
    /// after every accepted step, and once at the end with a NaN point and
    /// the end tangent.
    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&DVector<f64>, &DVector<f64>) + 'a,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    pub fn settings(&self) -> &ContinuationSettings {
        &self.settings
    }

    pub fn solver(&self) -> &NonlinearSolver {
        &self.solver
    }

    /// Direction of the next step from the converged point `xlam_p0`, unit
    /// length in the arclength metric and signed to continue the travel from
    /// `xlam_p_prev`.
    pub fn predict<P: ContinuationProblem + ?Sized>(
        &self,
        problem: &P,
        conditioning: &StepConditioning,
        xlam_p0: &DVector<f64>,
        xlam_p_prev: &DVector<f64>,
        dir_c_prev: &DVector<f64>,
    ) -> Result<Prediction> {
        let n = problem.dimension();
        let eval = problem.residual(xlam_p0, true)?;
        let (drdx, drdlam) = eval.gradients()?;
        let jac_c = conditioned_jacobian(drdx, drdlam, &conditioning.ctop)?;

        let mut bordered = DMatrix::zeros(n + 1, n + 1);
        bordered.view_mut((0, 0), (n, n + 1)).copy_from(&jac_c);
        bordered.set_row(n, &dir_c_prev.transpose());
        let mut rhs = DVector::zeros(n + 1);
        rhs[n] = 1.0;
        let dir = self.solver.lin_solve(&bordered, &rhs)?;

        let x_c0 = xlam_p0.component_div(&conditioning.ctop);
        let metric = ArcMetric::new(conditioning.frac_lam, x_c0.rows(0, n));
        let mut dir_c = &dir / metric.norm_sq(&dir).sqrt();

        let travelled = (xlam_p0 - xlam_p_prev).component_div(&conditioning.ctop);
        if metric.inner(&dir_c, &travelled) < 0.0 {
            dir_c = -dir_c;
        }

        let rptoc = if self.settings.dynamic_ctop {
            let diag_max = (0..n).map(|i| bordered[(i, i)].abs()).fold(0.0, f64::max);
            if diag_max > 0.0 {
                ResidualScale::Scalar(1.0 / diag_max)
            } else {
                ResidualScale::Scalar(conditioning.rptoc.mean())
            }
        } else {
            ResidualScale::Scalar(conditioning.rptoc.mean())
        };

        Ok(Prediction { dir_c, rptoc })
    }

    /// Augmented corrector residual `[RPtoC R(CtoP XlamC); Rarc]` in
    /// conditioned coordinates.
    #[allow(clippy::too_many_arguments)]
    pub fn correct_res<P: ContinuationProblem + ?Sized>(
        &self,
        problem: &P,
        conditioning: &StepConditioning,
        xlam_c: &DVector<f64>,
        xlam_c0: &DVector<f64>,
        ds: f64,
        dir_c: &DVector<f64>,
        calc_grad: bool,
    ) -> Result<SolverEval> {
        let n = problem.dimension();
        let xlam_p = xlam_c.component_mul(&conditioning.ctop);
        let eval = problem.residual(&xlam_p, calc_grad)?;
        if eval.r.len() != n {
            bail!(HbError::DimensionMismatch {
                what: "residual length",
                expected: n,
                actual: eval.r.len(),
            });
        }

        let metric = ArcMetric::new(conditioning.frac_lam, xlam_c0.rows(0, n));
        let (rarc, drarc) = match self.settings.corrector {
            Corrector::Pseudo => pseudo_arc_res(xlam_c, xlam_c0, ds, &metric),
            Corrector::Ortho => orthogonal_arc_res(xlam_c, xlam_c0, dir_c, ds, &metric),
        };

        let mut r = DVector::zeros(n + 1);
        for i in 0..n {
            r[i] = conditioning.rptoc.entry(i) * eval.r[i];
        }
        r[n] = rarc;

        if !calc_grad {
            return Ok(SolverEval::residual_only(r));
        }
        let (drdx, drdlam) = eval.gradients()?;
        let jac_c = conditioned_jacobian(drdx, drdlam, &conditioning.ctop)?;
        let mut jac = DMatrix::zeros(n + 1, n + 1);
        for i in 0..n {
            let scale = conditioning.rptoc.entry(i);
            jac.set_row(i, &(jac_c.row(i) * scale));
        }
        jac.set_row(n, &drarc.transpose());
        Ok(SolverEval::with_jacobian(r, jac))
    }

    fn correct<P: ContinuationProblem + ?Sized>(
        &self,
        problem: &P,
        conditioning: &StepConditioning,
        xlam_c0: &DVector<f64>,
        ds: f64,
        dir_c: &DVector<f64>,
    ) -> Result<NonlinearSolution> {
        let guess = xlam_c0 + dir_c * ds;
        self.solver.nsolve(
            |xlam_c, calc_grad| {
                self.correct_res(problem, conditioning, xlam_c, xlam_c0, ds, dir_c, calc_grad)
            },
            &guess,
            self.settings.xtol,
        )
    }

    fn notify(&mut self, xlam: &DVector<f64>, dir: &DVector<f64>) {
        if let Some(callback) = self.callback.as_mut() {
            callback(xlam, dir);
        }
    }

    /// Traces the branch from `lam0` toward `lam1`, starting from the guess
    /// `xlam_p0` (its last entry is ignored).
    ///
    /// Failing to converge the initial point is an error; a step that cannot
    /// be corrected ends the run with the points found so far.
    pub fn run<P: ContinuationProblem + ?Sized>(
        &mut self,
        problem: &P,
        xlam_p0: &DVector<f64>,
        lam0: f64,
        lam1: f64,
    ) -> Result<ContinuationBranch> {
        let settings = self.settings.clone();
        let n = problem.dimension();
        if xlam_p0.len() != n + 1 {
            bail!(HbError::DimensionMismatch {
                what: "initial augmented point",
                expected: n + 1,
                actual: xlam_p0.len(),
            });
        }

        if lam1 == lam0 || !lam0.is_finite() || !lam1.is_finite() {
            bail!(HbError::config(format!(
                "continuation needs distinct finite end points, got lam0={lam0}, lam1={lam1}"
            )));
        }

        let ctop_floor = match &self.ctop {
            Some(ctop) if ctop.len() != n + 1 => bail!(HbError::DimensionMismatch {
                what: "conditioning vector length",
                expected: n + 1,
                actual: ctop.len(),
            }),
            Some(ctop) => ctop.clone(),
            None => DVector::from_element(n + 1, 1.0),
        };
        let rptoc = match &self.rptoc {
            Some(ResidualScale::PerEntry(v)) if v.len() != n + 1 => {
                bail!(HbError::DimensionMismatch {
                    what: "residual scale length",
                    expected: n + 1,
                    actual: v.len(),
                })
            }
            Some(scale) => scale.clone(),
            None => ResidualScale::Scalar(1.0),
        };
        let mut conditioning = StepConditioning {
            ctop: ctop_floor.clone(),
            rptoc,
            frac_lam: settings.frac_lam(),
        };

        info!("Starting continuation from lam={lam0} to lam={lam1}");

        let x_ctop = conditioning.ctop.rows(0, n).into_owned();
        let fixed_lam = |x: &DVector<f64>, calc_grad: bool| -> Result<SolverEval> {
            let eval = problem.residual(&augment(x, lam0), calc_grad)?;
            if calc_grad {
                let (drdx, _) = eval.gradients()?;
                Ok(SolverEval::with_jacobian(eval.r.clone(), drdx.clone()))
            } else {
                Ok(SolverEval::residual_only(eval.r))
            }
        };
        let initial_guess = xlam_p0.rows(0, n).component_div(&x_ctop);
        let initial = self.solver.nsolve(
            conditioning_wrapper(fixed_lam, x_ctop.clone(), conditioning.rptoc.leading(n)),
            &initial_guess,
            settings.xtol,
        )?;
        if !initial.info.success {
            bail!(HbError::InitialPointFailed { lam0 });
        }
        let x0 = initial.x.component_mul(&x_ctop);
        info!("Converged to initial point, starting continuation");

        let direction = if lam1 > lam0 { 1.0 } else { -1.0 };
        let mut xlam_prev = augment(&x0, lam0 - direction);
        let mut xlam_curr = augment(&x0, lam0);
        self.notify(&xlam_curr, &DVector::from_element(n + 1, f64::NAN));

        let mut dir_c = &xlam_curr - &xlam_prev;
        let mut points = vec![ContinuationPoint {
            state: x0.iter().copied().collect(),
            lam: lam0,
            ds: 0.0,
            nfev: initial.info.nfev,
        }];
        let mut ds = settings.ds0;

        let termination = loop {
            let lam = xlam_curr[n];
            if points.len() >= settings.max_steps {
                info!("Continuation stopped at max_steps={}", settings.max_steps);
                break Termination::MaxSteps;
            }
            if direction * lam >= direction * lam1 {
                break Termination::ReachedEnd;
            }
            if direction * lam <= direction * lam0 - settings.backtrack_stop {
                info!("Continuation stopped after backtracking to lam={lam}");
                break Termination::Backtracked;
            }

            if settings.dynamic_ctop {
                conditioning.ctop = xlam_curr.abs().zip_map(&ctop_floor, f64::max);
            }

            let mut accepted = None;
            for (ladder_index, &frac_lam) in settings.frac_lam_ladder.iter().enumerate() {
                conditioning.frac_lam = frac_lam;
                let prediction =
                    match self.predict(problem, &conditioning, &xlam_curr, &xlam_prev, &dir_c) {
                        Ok(prediction) => prediction,
                        Err(err) if is_singular(&err) => {
                            debug!("Prediction failed with FracLam={frac_lam}: {err}");
                            continue;
                        }
                        Err(err) => return Err(err),
                    };
                dir_c = prediction.dir_c;
                conditioning.rptoc = prediction.rptoc;

                let xlam_c0 = xlam_curr.component_div(&conditioning.ctop);
                let mut solution = self.correct(problem, &conditioning, &xlam_c0, ds, &dir_c)?;
                while !solution.info.success && ds > settings.dsmin {
                    ds = (ds / 2.0).max(settings.dsmin);
                    debug!(
                        "Corrector failed ({}), retrying with ds={ds:.4e}",
                        solution.info.message
                    );
                    solution = self.correct(problem, &conditioning, &xlam_c0, ds, &dir_c)?;
                }
                if solution.info.success {
                    if ladder_index > 0 {
                        info!("Succeeded with FracLam index {ladder_index} (FracLam={frac_lam})");
                    }
                    accepted = Some(solution);
                    break;
                }
            }

            let Some(solution) = accepted else {
                warn!("Stopping since the corrector failed at lam={lam} with ds={ds:.4e}");
                break Termination::CorrectorFailed;
            };

            let xlam_new = solution.x.component_mul(&conditioning.ctop);
            let nfev = solution.info.nfev;
            points.push(ContinuationPoint {
                state: xlam_new.rows(0, n).iter().copied().collect(),
                lam: xlam_new[n],
                ds,
                nfev,
            });
            let step = points.len() - 1;
            if settings.log_every > 0 && step % settings.log_every == 0 {
                info!(
                    "Step={step} converged: lam={:.6e} ds={ds:.4e} nfev={nfev}",
                    xlam_new[n]
                );
            }

            let growth =
                (settings.target_nfev as f64 / nfev.max(1) as f64).min(settings.max_increase);
            ds = (ds * growth).clamp(settings.dsmin, settings.dsmax);

            let dir_p = dir_c.component_mul(&conditioning.ctop);
            self.notify(&xlam_new, &dir_p);

            xlam_prev = std::mem::replace(&mut xlam_curr, xlam_new);
        };

        if self.callback.is_some() {
            let end_dir = if termination == Termination::CorrectorFailed {
                dir_c.clone()
            } else {
                match self.predict(problem, &conditioning, &xlam_curr, &xlam_prev, &dir_c) {
                    Ok(prediction) => prediction.dir_c,
                    Err(err) if is_singular(&err) => dir_c.clone(),
                    Err(err) => return Err(err),
                }
            };
            let end_dir_p = end_dir.component_mul(&conditioning.ctop);
            self.notify(&DVector::from_element(n + 1, f64::NAN), &end_dir_p);
        }

        info!(
            "Continuation complete at lam={} after {} points ({:?})",
            xlam_curr[n],
            points.len(),
            termination
        );

        Ok(ContinuationBranch {
            points,
            termination,
            ctop: conditioning.ctop.iter().copied().collect(),
        })
    }
}
