use super::LocalMap;
use crate::autodiff::value_and_partials;
use crate::harmonic::{
    fourier_coefficients_from_time_series, time_series_from_harmonics, HarmonicSet,
};
use crate::traits::{
    AftForce, ElementHistory, ForceElement, ForceKind, LocalResponse, Scalar, StaticForce,
};
use anyhow::Result;
use nalgebra::{DMatrix, DVector};

/// Force as a function of the instantaneous local displacement and velocity.
///
/// Generic over [`Scalar`] so that evaluating with dual numbers yields the
/// exact partial derivatives.
pub trait InstantaneousLaw {
    fn force<S: Scalar>(&self, displacement: S, velocity: S) -> S;
}

/// `f = k3 u^3`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CubicSpring {
    pub k3: f64,
}

impl InstantaneousLaw for CubicSpring {
    fn force<S: Scalar>(&self, displacement: S, _velocity: S) -> S {
        S::from_f64(self.k3) * displacement.powi(3)
    }
}

/// `f = c2 v |v|`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuadraticDamper {
    pub c2: f64,
}

impl InstantaneousLaw for QuadraticDamper {
    fn force<S: Scalar>(&self, _displacement: S, velocity: S) -> S {
        S::from_f64(self.c2) * velocity * velocity.abs()
    }
}

/// Applies an [`InstantaneousLaw`] independently to every local coordinate.
#[derive(Debug, Clone)]
pub struct PolynomialForce<L> {
    map: LocalMap,
    law: L,
}

/// Time series of one evaluation in local coordinates.
struct LocalSeries {
    displacement: DMatrix<f64>,
    /// `d/dtau` of the displacement; the physical velocity is `w` times this.
    rate: DMatrix<f64>,
}

impl<L: InstantaneousLaw> PolynomialForce<L> {
    pub fn new(map: LocalMap, law: L) -> Self {
        Self { map, law }
    }

    pub fn law(&self) -> &L {
        &self.law
    }

    fn series(
        &self,
        local: &DMatrix<f64>,
        harmonics: &HarmonicSet,
        nt: usize,
    ) -> Result<LocalSeries> {
        Ok(LocalSeries {
            displacement: time_series_from_harmonics(nt, harmonics, local, 0)?,
            rate: time_series_from_harmonics(nt, harmonics, local, 1)?,
        })
    }

    fn force_series(&self, series: &LocalSeries, w: f64) -> DMatrix<f64> {
        series
            .displacement
            .zip_map(&series.rate, |u, rate| self.law.force(u, w * rate))
    }
}

impl<L: InstantaneousLaw> ForceElement for PolynomialForce<L> {
    fn kind(&self) -> ForceKind {
        ForceKind::Instantaneous
    }

    fn global_dofs(&self) -> usize {
        self.map.global_dofs()
    }

    fn initial_history(&self) -> ElementHistory {
        ElementHistory::empty()
    }

    fn static_force(&self, x: &DVector<f64>, _history: &ElementHistory) -> Result<StaticForce> {
        let local = self.map.to_local(x)?;
        let mut force = DVector::zeros(local.len());
        let mut stiffness = DVector::zeros(local.len());
        for (j, &u) in local.iter().enumerate() {
            let (f, dfdu, _) = value_and_partials(|a, b| self.law.force(a, b), u, 0.0);
            force[j] = f;
            stiffness[j] = dfdu;
        }
        Ok(StaticForce {
            force: self.map.t() * force,
            jacobian: self.map.t() * DMatrix::from_diagonal(&stiffness) * self.map.q(),
        })
    }

    fn aft(
        &self,
        u: &DVector<f64>,
        w: f64,
        harmonics: &HarmonicSet,
        nt: usize,
        _history: &ElementHistory,
        calc_grad: bool,
    ) -> Result<AftForce> {
        let nhc = harmonics.component_count();
        let nnl = self.map.local_dofs();
        let local = self.map.to_local_harmonics(u, nhc)?;
        let series = self.series(&local, harmonics, nt)?;

        if !calc_grad {
            let local_force =
                fourier_coefficients_from_time_series(harmonics, &self.force_series(&series, w))?;
            return Ok(AftForce {
                force: self.map.to_global_harmonics(&local_force),
                dfdu: None,
                dfdw: None,
            });
        }

        let identity = DMatrix::identity(nhc, nhc);
        let basis = time_series_from_harmonics(nt, harmonics, &identity, 0)?;
        let basis_rate = time_series_from_harmonics(nt, harmonics, &identity, 1)?;

        let mut force_t = DMatrix::zeros(nt, nnl);
        let mut dfdw_t = DMatrix::zeros(nt, nnl);
        let mut local_jac = DMatrix::zeros(nhc * nnl, nhc * nnl);
        for j in 0..nnl {
            let mut sensitivity = DMatrix::zeros(nt, nhc);
            for t in 0..nt {
                let rate = series.rate[(t, j)];
                let (f, dfdu, dfdv) = value_and_partials(
                    |a, b| self.law.force(a, b),
                    series.displacement[(t, j)],
                    w * rate,
                );
                force_t[(t, j)] = f;
                dfdw_t[(t, j)] = dfdv * rate;
                let row = basis.row(t) * dfdu + basis_rate.row(t) * (dfdv * w);
                sensitivity.set_row(t, &row);
            }
            let block = fourier_coefficients_from_time_series(harmonics, &sensitivity)?;
            for out in 0..nhc {
                for comp in 0..nhc {
                    local_jac[(out * nnl + j, comp * nnl + j)] = block[(out, comp)];
                }
            }
        }

        let local_force = fourier_coefficients_from_time_series(harmonics, &force_t)?;
        let local_dfdw = fourier_coefficients_from_time_series(harmonics, &dfdw_t)?;
        Ok(AftForce {
            force: self.map.to_global_harmonics(&local_force),
            dfdu: Some(self.map.to_global_jacobian(&local_jac, nhc)),
            dfdw: Some(self.map.to_global_harmonics(&local_dfdw)),
        })
    }

    fn local_response(
        &self,
        u: &DVector<f64>,
        w: f64,
        harmonics: &HarmonicSet,
        nt: usize,
        _history: &ElementHistory,
    ) -> Result<LocalResponse> {
        let local = self.map.to_local_harmonics(u, harmonics.component_count())?;
        let series = self.series(&local, harmonics, nt)?;
        let force_series = self.force_series(&series, w);
        let force_harmonics = fourier_coefficients_from_time_series(harmonics, &force_series)?;
        Ok(LocalResponse {
            displacement_harmonics: local,
            displacement_series: series.displacement,
            force_harmonics,
            force_series,
        })
    }

    fn commit_history(
        &self,
        _x: &DVector<f64>,
        history: &ElementHistory,
    ) -> Result<ElementHistory> {
        Ok(history.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finite_difference_check<L: InstantaneousLaw>(
        element: &PolynomialForce<L>,
        u: &DVector<f64>,
        w: f64,
    ) {
        let h = HarmonicSet::new(vec![0, 1, 2, 3]).unwrap();
        let nt = 64;
        let history = element.initial_history();
        let aft = element.aft(u, w, &h, nt, &history, true).unwrap();
        let jac = aft.dfdu.unwrap();
        let step = 1e-6;

        for col in 0..u.len() {
            let mut up = u.clone();
            up[col] += step;
            let mut um = u.clone();
            um[col] -= step;
            let fp = element.aft(&up, w, &h, nt, &history, false).unwrap().force;
            let fm = element.aft(&um, w, &h, nt, &history, false).unwrap().force;
            let fd = (fp - fm) / (2.0 * step);
            assert!((fd - jac.column(col)).amax() < 1e-6, "column {col}");
        }

        let fp = element.aft(u, w + step, &h, nt, &history, false).unwrap().force;
        let fm = element.aft(u, w - step, &h, nt, &history, false).unwrap().force;
        let fd = (fp - fm) / (2.0 * step);
        assert!((fd - aft.dfdw.unwrap()).amax() < 1e-6);
    }

    fn test_displacement() -> DVector<f64> {
        DVector::from_fn(14, |i, _| 0.3 * ((i as f64) * 0.7).cos() + 0.02 * i as f64)
    }

    #[test]
    fn cubic_spring_jacobians_match_finite_difference() {
        let element = PolynomialForce::new(
            LocalMap::relative(2, 0, 1).unwrap(),
            CubicSpring { k3: 1.7 },
        );
        finite_difference_check(&element, &test_displacement(), 1.3);
    }

    #[test]
    fn quadratic_damper_jacobians_match_finite_difference() {
        let element = PolynomialForce::new(
            LocalMap::single_dof(2, 1).unwrap(),
            QuadraticDamper { c2: 0.8 },
        );
        finite_difference_check(&element, &test_displacement(), 0.9);
    }

    #[test]
    fn cubic_spring_harmonic_balance_of_pure_cosine() {
        // (A cos)^3 = 3/4 A^3 cos + 1/4 A^3 cos 3
        let map = LocalMap::single_dof(1, 0).unwrap();
        let element = PolynomialForce::new(map, CubicSpring { k3: 2.0 });
        let h = HarmonicSet::new(vec![1, 3]).unwrap();
        let u = DVector::from_vec(vec![0.5, 0.0, 0.0, 0.0]);
        let aft = element
            .aft(&u, 1.0, &h, 32, &element.initial_history(), true)
            .unwrap();
        let a3 = 0.125;
        assert!((aft.force[0] - 2.0 * 0.75 * a3).abs() < 1e-14);
        assert!((aft.force[2] - 2.0 * 0.25 * a3).abs() < 1e-14);
        assert!(aft.force[1].abs() < 1e-14 && aft.force[3].abs() < 1e-14);
        assert!(aft.dfdw.unwrap().amax() < 1e-14);
    }

    #[test]
    fn static_force_uses_zero_velocity() {
        let map = LocalMap::single_dof(1, 0).unwrap();
        let spring = PolynomialForce::new(map.clone(), CubicSpring { k3: 2.0 });
        let damper = PolynomialForce::new(map, QuadraticDamper { c2: 5.0 });
        let x = DVector::from_element(1, 1.5);
        let history = ElementHistory::empty();

        let sf = spring.static_force(&x, &history).unwrap();
        assert!((sf.force[0] - 6.75).abs() < 1e-14);
        assert!((sf.jacobian[(0, 0)] - 13.5).abs() < 1e-14);

        let df = damper.static_force(&x, &history).unwrap();
        assert_eq!(df.force[0], 0.0);
        assert_eq!(df.jacobian[(0, 0)], 0.0);
    }

    #[test]
    fn instantaneous_elements_are_stateless() {
        let map = LocalMap::single_dof(1, 0).unwrap();
        let element = PolynomialForce::new(map, CubicSpring { k3: 1.0 });
        assert_eq!(element.kind(), ForceKind::Instantaneous);
        assert!(!element.kind().requires_history());
        let history = element.initial_history();
        let committed = element
            .commit_history(&DVector::from_element(1, 3.0), &history)
            .unwrap();
        assert_eq!(committed, history);

        let h = HarmonicSet::new(vec![0, 1]).unwrap();
        let u = DVector::from_vec(vec![0.2, 1.0, -0.4]);
        let first = element.aft(&u, 1.1, &h, 16, &history, true).unwrap();
        let second = element.aft(&u, 1.1, &h, 16, &committed, true).unwrap();
        assert_eq!(first.force, second.force);
        assert_eq!(first.dfdu, second.dfdu);
        assert_eq!(first.dfdw, second.dfdw);
    }
}
