use super::LocalMap;
use crate::harmonic::{
    fourier_coefficients_from_time_series, time_series_from_harmonics, HarmonicSet,
};
use crate::traits::{AftForce, ElementHistory, ForceElement, ForceKind, LocalResponse, StaticForce};
use anyhow::{bail, Result};
use nalgebra::{DMatrix, DVector, RowDVector};

/// Passes of the hysteresis loop per AFT evaluation. The second pass starts
/// from the end state of the first, which settles an elastic-perfectly-plastic
/// slider.
const AFT_PASSES: usize = 2;

/// Elastic-perfectly-plastic (Jenkins) slider: a spring of stiffness `kt`
/// in series with a Coulomb slider that saturates at `fs`, applied
/// independently to every local coordinate.
#[derive(Debug, Clone)]
pub struct JenkinsSlider {
    map: LocalMap,
    kt: f64,
    fs: f64,
}

/// Local force series with its sensitivity to the local harmonics.
struct SliderLoop {
    force: DMatrix<f64>,
    /// One `(Nt, Nhc)` block per local coordinate.
    sensitivity: Option<Vec<DMatrix<f64>>>,
}

impl JenkinsSlider {
    pub fn new(map: LocalMap, kt: f64, fs: f64) -> Result<Self> {
        if !(kt > 0.0) {
            bail!("Jenkins stiffness must be positive, got {kt}");
        }
        if !(fs >= 0.0) {
            bail!("Jenkins slip force must be non-negative, got {fs}");
        }
        Ok(Self { map, kt, fs })
    }

    pub fn map(&self) -> &LocalMap {
        &self.map
    }

    fn clip(&self, force: f64) -> f64 {
        force.clamp(-self.fs, self.fs)
    }

    /// Displacement at which the spring would be unloaded given the
    /// committed state of local coordinate `j`.
    fn anchor(&self, history: &ElementHistory, j: usize) -> f64 {
        match (history.displacement.get(j), history.force.get(j)) {
            (Some(u), Some(f)) => u - f / self.kt,
            _ => 0.0,
        }
    }

    fn local_static(
        &self,
        x: &DVector<f64>,
        history: &ElementHistory,
    ) -> Result<(DVector<f64>, DVector<f64>)> {
        let local = self.map.to_local(x)?;
        let mut force = DVector::zeros(local.len());
        let mut stiffness = DVector::zeros(local.len());
        for j in 0..local.len() {
            let u_prev = history.displacement.get(j).copied().unwrap_or(0.0);
            let f_prev = history.force.get(j).copied().unwrap_or(0.0);
            let trial = self.kt * (local[j] - u_prev) + f_prev;
            force[j] = self.clip(trial);
            if trial.abs() < self.fs {
                stiffness[j] = self.kt;
            }
        }
        Ok((force, stiffness))
    }

    fn run_loop(
        &self,
        series: &DMatrix<f64>,
        basis: Option<&DMatrix<f64>>,
        history: &ElementHistory,
    ) -> SliderLoop {
        let (nt, nnl) = series.shape();
        let last = nt - 1;
        let mut force = DMatrix::zeros(nt, nnl);
        let mut sensitivity = basis.map(|b| vec![DMatrix::zeros(nt, b.ncols()); nnl]);

        for j in 0..nnl {
            force[(last, j)] = self.kt * (series[(last, j)] - self.anchor(history, j));
            if let (Some(basis), Some(sens)) = (basis, sensitivity.as_mut()) {
                sens[j].set_row(last, &(basis.row(last) * self.kt));
            }

            for _ in 0..AFT_PASSES {
                for t in 0..nt {
                    let prev = if t == 0 { last } else { t - 1 };
                    let trial = self.kt * (series[(t, j)] - series[(prev, j)]) + force[(prev, j)];
                    force[(t, j)] = self.clip(trial);
                    if let (Some(basis), Some(sens)) = (basis, sensitivity.as_mut()) {
                        let row = if trial.abs() < self.fs {
                            (basis.row(t) - basis.row(prev)) * self.kt + sens[j].row(prev)
                        } else {
                            RowDVector::zeros(basis.ncols())
                        };
                        sens[j].set_row(t, &row);
                    }
                }
            }
        }

        SliderLoop { force, sensitivity }
    }
}

impl ForceElement for JenkinsSlider {
    fn kind(&self) -> ForceKind {
        ForceKind::Hysteretic
    }

    fn global_dofs(&self) -> usize {
        self.map.global_dofs()
    }

    fn initial_history(&self) -> ElementHistory {
        ElementHistory::zeros(self.map.local_dofs())
    }

    fn static_force(&self, x: &DVector<f64>, history: &ElementHistory) -> Result<StaticForce> {
        let (local_force, local_stiffness) = self.local_static(x, history)?;
        let force = self.map.t() * local_force;
        let jacobian = self.map.t() * DMatrix::from_diagonal(&local_stiffness) * self.map.q();
        Ok(StaticForce { force, jacobian })
    }

    fn aft(
        &self,
        u: &DVector<f64>,
        _w: f64,
        harmonics: &HarmonicSet,
        nt: usize,
        history: &ElementHistory,
        calc_grad: bool,
    ) -> Result<AftForce> {
        let nhc = harmonics.component_count();
        let nnl = self.map.local_dofs();
        let local = self.map.to_local_harmonics(u, nhc)?;
        let series = time_series_from_harmonics(nt, harmonics, &local, 0)?;
        let basis = if calc_grad {
            Some(time_series_from_harmonics(
                nt,
                harmonics,
                &DMatrix::identity(nhc, nhc),
                0,
            )?)
        } else {
            None
        };

        let slider = self.run_loop(&series, basis.as_ref(), history);
        let local_force = fourier_coefficients_from_time_series(harmonics, &slider.force)?;
        let force = self.map.to_global_harmonics(&local_force);

        let (dfdu, dfdw) = match slider.sensitivity {
            Some(sensitivity) => {
                let mut local_jac = DMatrix::zeros(nhc * nnl, nhc * nnl);
                for (j, sens) in sensitivity.iter().enumerate() {
                    let block = fourier_coefficients_from_time_series(harmonics, sens)?;
                    for out in 0..nhc {
                        for comp in 0..nhc {
                            local_jac[(out * nnl + j, comp * nnl + j)] = block[(out, comp)];
                        }
                    }
                }
                (
                    Some(self.map.to_global_jacobian(&local_jac, nhc)),
                    Some(DVector::zeros(u.len())),
                )
            }
            None => (None, None),
        };

        Ok(AftForce { force, dfdu, dfdw })
    }

    fn local_response(
        &self,
        u: &DVector<f64>,
        _w: f64,
        harmonics: &HarmonicSet,
        nt: usize,
        history: &ElementHistory,
    ) -> Result<LocalResponse> {
        let local = self.map.to_local_harmonics(u, harmonics.component_count())?;
        let series = time_series_from_harmonics(nt, harmonics, &local, 0)?;
        let slider = self.run_loop(&series, None, history);
        let force_harmonics = fourier_coefficients_from_time_series(harmonics, &slider.force)?;
        Ok(LocalResponse {
            displacement_harmonics: local,
            displacement_series: series,
            force_harmonics,
            force_series: slider.force,
        })
    }

    fn commit_history(&self, x: &DVector<f64>, history: &ElementHistory) -> Result<ElementHistory> {
        let (force, _) = self.local_static(x, history)?;
        Ok(ElementHistory {
            displacement: self.map.to_local(x)?.iter().copied().collect(),
            force: force.iter().copied().collect(),
        })
    }
}
