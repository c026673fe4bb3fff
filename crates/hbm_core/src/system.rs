//! Assembly of linear structural matrices and nonlinear joint elements into
//! static and harmonic balance residuals.

use crate::continuation::{ContinuationProblem, ResidualEval};
use crate::error::HbError;
use crate::harmonic::{check_sampling, harmonic_stiffness_operator, HarmonicSet};
use crate::solvers::SolverEval;
use crate::traits::{AftForce, ElementHistory, ForceElement};
use anyhow::{anyhow, bail, Result};
use log::debug;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// Committed history of every nonlinear element, in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemHistory {
    pub elements: Vec<ElementHistory>,
}

/// `M x'' + C x' + K x + F_nl(x, history) = F`
pub struct VibrationSystem {
    m: DMatrix<f64>,
    k: DMatrix<f64>,
    c: DMatrix<f64>,
    forces: Vec<Box<dyn ForceElement>>,
    history: SystemHistory,
}

impl VibrationSystem {
    pub fn new(m: DMatrix<f64>, k: DMatrix<f64>, c: DMatrix<f64>) -> Result<Self> {
        let nd = m.nrows();
        let named = [
            ("mass matrix", &m),
            ("stiffness matrix", &k),
            ("damping matrix", &c),
        ];
        for (what, mat) in named {
            if mat.nrows() != nd || mat.ncols() != nd {
                bail!(HbError::DimensionMismatch {
                    what,
                    expected: nd,
                    actual: if mat.nrows() != nd { mat.nrows() } else { mat.ncols() },
                });
            }
        }
        Ok(Self {
            m,
            k,
            c,
            forces: Vec::new(),
            history: SystemHistory::default(),
        })
    }

    /// Proportional damping `C = alpha M + beta K`.
    pub fn with_rayleigh(m: DMatrix<f64>, k: DMatrix<f64>, alpha: f64, beta: f64) -> Result<Self> {
        if m.shape() != k.shape() {
            bail!(HbError::DimensionMismatch {
                what: "stiffness matrix",
                expected: m.nrows(),
                actual: k.nrows(),
            });
        }
        let c = &m * alpha + &k * beta;
        Self::new(m, k, c)
    }

    pub fn ndof(&self) -> usize {
        self.m.nrows()
    }

    pub fn mass(&self) -> &DMatrix<f64> {
        &self.m
    }

    pub fn stiffness(&self) -> &DMatrix<f64> {
        &self.k
    }

    pub fn damping(&self) -> &DMatrix<f64> {
        &self.c
    }

    pub fn nonlinear_forces(&self) -> &[Box<dyn ForceElement>] {
        &self.forces
    }

    /// Adds an element, starting it from its initial history.
    pub fn add_nl_force(&mut self, force: Box<dyn ForceElement>) -> Result<()> {
        if force.global_dofs() != self.ndof() {
            bail!(HbError::DimensionMismatch {
                what: "nonlinear force global dofs",
                expected: self.ndof(),
                actual: force.global_dofs(),
            });
        }
        self.history.elements.push(force.initial_history());
        self.forces.push(force);
        Ok(())
    }

    pub fn history(&self) -> &SystemHistory {
        &self.history
    }

    /// Restores a previously committed history, e.g. to restart a load path.
    pub fn set_history(&mut self, history: SystemHistory) -> Result<()> {
        if history.elements.len() != self.forces.len() {
            bail!(HbError::DimensionMismatch {
                what: "system history elements",
                expected: self.forces.len(),
                actual: history.elements.len(),
            });
        }
        self.history = history;
        Ok(())
    }

    pub fn reset_history(&mut self) {
        self.history.elements = self.forces.iter().map(|f| f.initial_history()).collect();
    }

    /// Commits the static state `x` to every element. Either all elements
    /// advance or none do.
    pub fn commit_history(&mut self, x: &DVector<f64>) -> Result<()> {
        self.check_len("static displacement", x.len(), self.ndof())?;
        let committed = self
            .forces
            .iter()
            .zip(&self.history.elements)
            .map(|(force, history)| force.commit_history(x, history))
            .collect::<Result<Vec<_>>>()?;
        debug!("Committed history of {} nonlinear elements", committed.len());
        self.history.elements = committed;
        Ok(())
    }

    /// Static residual `K x + F_nl(x) - f` and its Jacobian.
    pub fn static_res(&self, x: &DVector<f64>, f: &DVector<f64>) -> Result<SolverEval> {
        let nd = self.ndof();
        self.check_len("static displacement", x.len(), nd)?;
        self.check_len("static load", f.len(), nd)?;

        let mut r = &self.k * x - f;
        let mut drdx = self.k.clone();
        for (force, history) in self.forces.iter().zip(&self.history.elements) {
            let sf = force.static_force(x, history)?;
            r += sf.force;
            drdx += sf.jacobian;
        }
        Ok(SolverEval::with_jacobian(r, drdx))
    }

    /// Sum of every element's AFT force at harmonic displacements `u`.
    pub fn total_aft(
        &self,
        u: &DVector<f64>,
        w: f64,
        harmonics: &HarmonicSet,
        nt: usize,
        calc_grad: bool,
    ) -> Result<AftForce> {
        let n = self.ndof() * harmonics.component_count();
        self.check_len("harmonic displacement", u.len(), n)?;

        let mut total = AftForce {
            force: DVector::zeros(n),
            dfdu: calc_grad.then(|| DMatrix::zeros(n, n)),
            dfdw: calc_grad.then(|| DVector::zeros(n)),
        };
        for (force, history) in self.forces.iter().zip(&self.history.elements) {
            let aft = force.aft(u, w, harmonics, nt, history, calc_grad)?;
            total.force += aft.force;
            if let (Some(acc), Some(dfdu)) = (total.dfdu.as_mut(), aft.dfdu) {
                *acc += dfdu;
            }
            if let (Some(acc), Some(dfdw)) = (total.dfdw.as_mut(), aft.dfdw) {
                *acc += dfdw;
            }
        }
        Ok(total)
    }

    /// Harmonic balance residual `E(w) U + F_nl(U, w) - Fl` for the augmented
    /// unknowns `[U, w]`.
    pub fn hbm_res(
        &self,
        uw: &DVector<f64>,
        fl: &DVector<f64>,
        harmonics: &HarmonicSet,
        nt: usize,
        calc_grad: bool,
    ) -> Result<ResidualEval> {
        let n = self.ndof() * harmonics.component_count();
        self.check_len("augmented harmonic unknowns", uw.len(), n + 1)?;
        let u = uw.rows(0, n).into_owned();
        let w = uw[n];
        let (r, drdu, dfdw_total) = self.harmonic_terms(&u, w, fl, harmonics, nt, calc_grad)?;
        match (drdu, dfdw_total) {
            (Some(drdu), Some(drdw)) => Ok(ResidualEval::with_gradients(r, drdu, drdw)),
            _ => Ok(ResidualEval::residual_only(r)),
        }
    }

    /// Residual `E(w) U + F_nl(U, w) - lam Fl` at fixed frequency for the
    /// augmented unknowns `[U, lam]`.
    pub fn hbm_res_scaled_forcing(
        &self,
        ulam: &DVector<f64>,
        w: f64,
        fl: &DVector<f64>,
        harmonics: &HarmonicSet,
        nt: usize,
        calc_grad: bool,
    ) -> Result<ResidualEval> {
        let n = self.ndof() * harmonics.component_count();
        self.check_len("augmented harmonic unknowns", ulam.len(), n + 1)?;
        let u = ulam.rows(0, n).into_owned();
        let scaled = fl * ulam[n];
        let (r, drdu, _) = self.harmonic_terms(&u, w, &scaled, harmonics, nt, calc_grad)?;
        match drdu {
            Some(drdu) => Ok(ResidualEval::with_gradients(r, drdu, -fl)),
            None => Ok(ResidualEval::residual_only(r)),
        }
    }

    /// `R`, `dR/dU` and `dR/dw` at `(u, w)` against forcing `fl`.
    #[allow(clippy::type_complexity)]
    fn harmonic_terms(
        &self,
        u: &DVector<f64>,
        w: f64,
        fl: &DVector<f64>,
        harmonics: &HarmonicSet,
        nt: usize,
        calc_grad: bool,
    ) -> Result<(DVector<f64>, Option<DMatrix<f64>>, Option<DVector<f64>>)> {
        self.check_len("harmonic forcing", fl.len(), u.len())?;
        let (e, dedw) =
            harmonic_stiffness_operator(&self.m, &self.c, &self.k, w, harmonics, calc_grad, false)?;
        let fnl = self.total_aft(u, w, harmonics, nt, calc_grad)?;
        let r = &e * u + &fnl.force - fl;
        if !calc_grad {
            return Ok((r, None, None));
        }

        let missing = || anyhow!("nonlinear force gradients were not returned");
        let dedw = dedw.ok_or_else(|| anyhow!("dE/dw was not returned"))?;
        let drdu = e + fnl.dfdu.ok_or_else(missing)?;
        let drdw = dedw * u + fnl.dfdw.ok_or_else(missing)?;
        Ok((r, Some(drdu), Some(drdw)))
    }

    fn check_len(&self, what: &'static str, actual: usize, expected: usize) -> Result<()> {
        if actual != expected {
            bail!(HbError::DimensionMismatch {
                what,
                expected,
                actual,
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for VibrationSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VibrationSystem")
            .field("ndof", &self.ndof())
            .field("nonlinear_forces", &self.forces.len())
            .field("history", &self.history)
            .finish()
    }
}

/// Shared checks of the harmonic problems below.
fn check_harmonic_problem(
    system: &VibrationSystem,
    forcing: &DVector<f64>,
    harmonics: &HarmonicSet,
    nt: usize,
) -> Result<()> {
    check_sampling(nt, harmonics)?;
    system.check_len(
        "harmonic forcing",
        forcing.len(),
        system.ndof() * harmonics.component_count(),
    )
}

/// Frequency response: unknowns `[U, w]` under fixed forcing.
#[derive(Debug)]
pub struct FrequencyResponseProblem<'s> {
    system: &'s VibrationSystem,
    forcing: DVector<f64>,
    harmonics: HarmonicSet,
    nt: usize,
}

impl<'s> FrequencyResponseProblem<'s> {
    pub fn new(
        system: &'s VibrationSystem,
        forcing: DVector<f64>,
        harmonics: HarmonicSet,
        nt: usize,
    ) -> Result<Self> {
        check_harmonic_problem(system, &forcing, &harmonics, nt)?;
        Ok(Self {
            system,
            forcing,
            harmonics,
            nt,
        })
    }

    pub fn harmonics(&self) -> &HarmonicSet {
        &self.harmonics
    }
}

impl ContinuationProblem for FrequencyResponseProblem<'_> {
    fn dimension(&self) -> usize {
        self.forcing.len()
    }

    fn residual(&self, xlam: &DVector<f64>, calc_grad: bool) -> Result<ResidualEval> {
        self.system
            .hbm_res(xlam, &self.forcing, &self.harmonics, self.nt, calc_grad)
    }
}

/// Amplitude sweep: unknowns `[U, lam]` with forcing `lam Fl` at fixed `w`.
#[derive(Debug)]
pub struct ForcingAmplitudeProblem<'s> {
    system: &'s VibrationSystem,
    forcing: DVector<f64>,
    harmonics: HarmonicSet,
    nt: usize,
    w: f64,
}

impl<'s> ForcingAmplitudeProblem<'s> {
    pub fn new(
        system: &'s VibrationSystem,
        forcing: DVector<f64>,
        harmonics: HarmonicSet,
        nt: usize,
        w: f64,
    ) -> Result<Self> {
        check_harmonic_problem(system, &forcing, &harmonics, nt)?;
        Ok(Self {
            system,
            forcing,
            harmonics,
            nt,
            w,
        })
    }

    pub fn frequency(&self) -> f64 {
        self.w
    }
}

impl ContinuationProblem for ForcingAmplitudeProblem<'_> {
    fn dimension(&self) -> usize {
        self.forcing.len()
    }

    fn residual(&self, xlam: &DVector<f64>, calc_grad: bool) -> Result<ResidualEval> {
        self.system.hbm_res_scaled_forcing(
            xlam,
            self.w,
            &self.forcing,
            &self.harmonics,
            self.nt,
            calc_grad,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::continuation::util::augment;
    use crate::continuation::{Continuation, ContinuationConfig, Termination};
    use crate::forces::{CubicSpring, JenkinsSlider, LocalMap, PolynomialForce, QuadraticDamper};
    use crate::solvers::NonlinearSolver;

    fn oscillator(k3: f64) -> VibrationSystem {
        let mut system = VibrationSystem::new(
            DMatrix::from_element(1, 1, 1.0),
            DMatrix::from_element(1, 1, 1.0),
            DMatrix::from_element(1, 1, 0.1),
        )
        .unwrap();
        system
            .add_nl_force(Box::new(PolynomialForce::new(
                LocalMap::single_dof(1, 0).unwrap(),
                CubicSpring { k3 },
            )))
            .unwrap();
        system
    }

    fn two_dof() -> VibrationSystem {
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, 2.0]);
        let k = DMatrix::from_row_slice(2, 2, &[3.0, -1.0, -1.0, 2.0]);
        let mut system = VibrationSystem::with_rayleigh(m, k, 0.02, 0.01).unwrap();
        system
            .add_nl_force(Box::new(PolynomialForce::new(
                LocalMap::relative(2, 0, 1).unwrap(),
                CubicSpring { k3: 0.7 },
            )))
            .unwrap();
        system
            .add_nl_force(Box::new(PolynomialForce::new(
                LocalMap::single_dof(2, 1).unwrap(),
                QuadraticDamper { c2: 0.3 },
            )))
            .unwrap();
        system
    }

    #[test]
    fn rayleigh_damping_combines_mass_and_stiffness() {
        let system = two_dof();
        let expected = DMatrix::from_row_slice(2, 2, &[0.05, -0.01, -0.01, 0.06]);
        assert!((system.damping() - expected).amax() < 1e-15);
        assert_eq!(system.nonlinear_forces().len(), 2);
        assert_eq!(system.history().elements.len(), 2);
    }

    #[test]
    fn mismatched_elements_are_rejected() {
        let mut system = two_dof();
        let err = system
            .add_nl_force(Box::new(PolynomialForce::new(
                LocalMap::single_dof(3, 0).unwrap(),
                CubicSpring { k3: 1.0 },
            )))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HbError>(),
            Some(HbError::DimensionMismatch { expected: 2, actual: 3, .. })
        ));
        assert!(VibrationSystem::new(
            DMatrix::zeros(2, 2),
            DMatrix::zeros(2, 2),
            DMatrix::zeros(1, 1)
        )
        .is_err());
    }

    #[test]
    fn harmonic_residual_gradients_match_finite_difference() {
        let system = two_dof();
        let h = HarmonicSet::new(vec![0, 1, 3]).unwrap();
        let nt = 64;
        let n = 10;
        let fl = DVector::from_fn(n, |i, _| if i == 2 { 1.0 } else { 0.0 });
        let uw = DVector::from_fn(n + 1, |i, _| {
            if i == n {
                1.3
            } else {
                0.4 * ((i as f64) * 1.1).sin() + 0.05
            }
        });

        let eval = system.hbm_res(&uw, &fl, &h, nt, true).unwrap();
        let (drdu, drdw) = eval.gradients().unwrap();
        let step = 1e-6;
        for col in 0..=n {
            let mut up = uw.clone();
            up[col] += step;
            let mut um = uw.clone();
            um[col] -= step;
            let rp = system.hbm_res(&up, &fl, &h, nt, false).unwrap().r;
            let rm = system.hbm_res(&um, &fl, &h, nt, false).unwrap().r;
            let fd = (rp - rm) / (2.0 * step);
            let analytic = if col == n {
                drdw.clone()
            } else {
                drdu.column(col).into_owned()
            };
            assert!((fd - analytic).amax() < 1e-6, "column {col}");
        }
    }

    #[test]
    fn scaled_forcing_residual_is_linear_in_lam() {
        let system = two_dof();
        let h = HarmonicSet::new(vec![1, 2]).unwrap();
        let fl = DVector::from_fn(8, |i, _| i as f64 * 0.1);
        let u = DVector::from_fn(8, |i, _| 0.2 - 0.03 * i as f64);

        let at = |lam: f64| {
            let ulam = augment(&u, lam);
            system
                .hbm_res_scaled_forcing(&ulam, 0.8, &fl, &h, 32, true)
                .unwrap()
        };
        let r0 = at(0.0);
        let r2 = at(2.0);
        assert!((&r0.r - &r2.r - &fl * 2.0).amax() < 1e-12);
        let (_, drdlam) = r2.gradients().unwrap();
        assert_eq!(*drdlam, -&fl);
    }

    #[test]
    fn evaluations_leave_history_untouched() {
        let mut system = oscillator(0.0);
        let slider = JenkinsSlider::new(LocalMap::single_dof(1, 0).unwrap(), 2.0, 0.5).unwrap();
        system.add_nl_force(Box::new(slider)).unwrap();
        let before = system.history().clone();
        let h = HarmonicSet::new(vec![0, 1]).unwrap();
        let uw = DVector::from_vec(vec![0.1, 1.0, 0.2, 1.1]);
        let fl = DVector::from_vec(vec![0.0, 1.0, 0.0]);
        let first = system.hbm_res(&uw, &fl, &h, 64, true).unwrap();
        let second = system.hbm_res(&uw, &fl, &h, 64, true).unwrap();
        assert_eq!(first.r, second.r);
        assert_eq!(first.drdx, second.drdx);
        assert_eq!(system.history(), &before);
    }

    #[test]
    fn static_load_cycle_leaves_residual_slip() {
        // Unit spring in parallel with a Jenkins slider (kt = 2, fs = 0.5).
        let mut system = oscillator(0.0);
        let slider = JenkinsSlider::new(LocalMap::single_dof(1, 0).unwrap(), 2.0, 0.5).unwrap();
        system.add_nl_force(Box::new(slider)).unwrap();
        let solver = NonlinearSolver::default();

        let solve = |system: &VibrationSystem, load: f64, x0: f64| {
            let f = DVector::from_element(1, load);
            solver
                .nsolve(
                    |x: &DVector<f64>, _| system.static_res(x, &f),
                    &DVector::from_element(1, x0),
                    None,
                )
                .unwrap()
        };

        let loaded = solve(&system, 2.0, 0.0);
        assert!(loaded.info.success);
        assert!((loaded.x[0] - 1.5).abs() < 1e-10);
        system.commit_history(&loaded.x).unwrap();
        assert!((system.history().elements[1].force[0] - 0.5).abs() < 1e-10);

        let unloaded = solve(&system, 0.0, loaded.x[0]);
        assert!(unloaded.info.success);
        assert!((unloaded.x[0] - 0.5).abs() < 1e-10);

        system.reset_history();
        assert_eq!(system.history().elements[0], ElementHistory::empty());
        assert_eq!(system.history().elements[1], ElementHistory::zeros(1));
        assert!(system.set_history(SystemHistory::default()).is_err());
    }

    #[test]
    fn duffing_frequency_sweep_passes_resonance() {
        let system = oscillator(0.05);
        let h = HarmonicSet::new(vec![1, 3]).unwrap();
        let fl = DVector::from_vec(vec![0.1, 0.0, 0.0, 0.0]);
        let problem = FrequencyResponseProblem::new(&system, fl.clone(), h.clone(), 64).unwrap();

        let config = ContinuationConfig {
            ds0: 0.02,
            dsmax: Some(0.03),
            dsmin: Some(1e-4),
            max_steps: 1000,
            ..Default::default()
        };
        let mut continuation =
            Continuation::from_config(NonlinearSolver::default(), &config).unwrap();
        let branch = continuation
            .run(&problem, &DVector::zeros(5), 0.5, 1.5)
            .unwrap();
        assert_eq!(branch.termination, Termination::ReachedEnd);

        let mut peak = (0.0, 0.0);
        for point in &branch.points {
            let uw = augment(&DVector::from_column_slice(&point.state), point.lam);
            let r = system.hbm_res(&uw, &fl, &h, 64, false).unwrap().r;
            assert!(r.norm() < 1e-5, "residual {} at w={}", r.norm(), point.lam);
            let amp = point.state[0].hypot(point.state[1]);
            if amp > peak.0 {
                peak = (amp, point.lam);
            }
        }
        // Linear peak amplitude is F / (c w) = 1 near w = 1, stiffened slightly.
        assert!(peak.0 > 0.8 && peak.0 < 1.1, "peak amplitude {}", peak.0);
        assert!(peak.1 > 0.95 && peak.1 < 1.1, "peak frequency {}", peak.1);
    }

    #[test]
    fn forcing_amplitude_sweep_grows_response() {
        let system = oscillator(0.2);
        let h = HarmonicSet::new(vec![1, 3]).unwrap();
        let fl = DVector::from_vec(vec![1.0, 0.0, 0.0, 0.0]);
        let problem = ForcingAmplitudeProblem::new(&system, fl, h, 64, 0.7).unwrap();
        assert_eq!(problem.frequency(), 0.7);
        assert_eq!(problem.dimension(), 4);

        let config = ContinuationConfig {
            ds0: 0.05,
            dsmax: Some(0.3),
            dsmin: Some(1e-4),
            ..Default::default()
        };
        let mut continuation =
            Continuation::from_config(NonlinearSolver::default(), &config).unwrap();
        let branch = continuation
            .run(&problem, &DVector::zeros(5), 0.01, 0.5)
            .unwrap();
        assert_eq!(branch.termination, Termination::ReachedEnd);

        let amplitudes: Vec<f64> = branch
            .points
            .iter()
            .map(|p| p.state[0].hypot(p.state[1]))
            .collect();
        assert!(amplitudes.windows(2).all(|pair| pair[1] > pair[0]));
        assert!(branch.lams().windows(2).all(|pair| pair[1] > pair[0]));
    }

    #[test]
    fn harmonic_problems_check_sampling_and_forcing() {
        let system = oscillator(1.0);
        let h = HarmonicSet::new(vec![0, 1, 3]).unwrap();
        let err =
            FrequencyResponseProblem::new(&system, DVector::zeros(5), h.clone(), 7).unwrap_err();
        assert!(matches!(err.downcast_ref::<HbError>(), Some(HbError::Aliasing { .. })));
        assert!(FrequencyResponseProblem::new(&system, DVector::zeros(4), h.clone(), 16).is_err());
        assert!(ForcingAmplitudeProblem::new(&system, DVector::zeros(5), h, 16, 1.0).is_ok());
    }
}
