//! Reference nonlinear joint elements.
//!
//! Every element acts on `Nnl` local coordinates obtained from the `Nd`
//! global ones through `Q` (`Nnl x Nd`); local forces return to global
//! coordinates through `T` (`Nd x Nnl`).

pub mod jenkins;
pub mod polynomial;

pub use jenkins::JenkinsSlider;
pub use polynomial::{CubicSpring, InstantaneousLaw, PolynomialForce, QuadraticDamper};

use crate::error::{HbError, HbResult};
use nalgebra::{DMatrix, DVector};

/// Pair of global-to-local (`Q`) and local-to-global (`T`) maps.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalMap {
    q: DMatrix<f64>,
    t: DMatrix<f64>,
}

impl LocalMap {
    pub fn new(q: DMatrix<f64>, t: DMatrix<f64>) -> HbResult<Self> {
        if t.nrows() != q.ncols() {
            return Err(HbError::DimensionMismatch {
                what: "T rows (global dofs of Q)",
                expected: q.ncols(),
                actual: t.nrows(),
            });
        }
        if t.ncols() != q.nrows() {
            return Err(HbError::DimensionMismatch {
                what: "T columns (local dofs of Q)",
                expected: q.nrows(),
                actual: t.ncols(),
            });
        }
        Ok(Self { q, t })
    }

    /// One local coordinate equal to global dof `index`, with the force
    /// returned to the same dof.
    pub fn single_dof(global_dofs: usize, index: usize) -> HbResult<Self> {
        if index >= global_dofs {
            return Err(HbError::DimensionMismatch {
                what: "single dof index",
                expected: global_dofs,
                actual: index,
            });
        }
        let mut q = DMatrix::zeros(1, global_dofs);
        q[(0, index)] = 1.0;
        let t = q.transpose();
        Self::new(q, t)
    }

    /// Relative coordinate `x[a] - x[b]`, reacting equal and opposite.
    pub fn relative(global_dofs: usize, a: usize, b: usize) -> HbResult<Self> {
        if a >= global_dofs || b >= global_dofs {
            return Err(HbError::DimensionMismatch {
                what: "relative dof index",
                expected: global_dofs,
                actual: a.max(b),
            });
        }
        let mut q = DMatrix::zeros(1, global_dofs);
        q[(0, a)] += 1.0;
        q[(0, b)] -= 1.0;
        let t = q.transpose();
        Self::new(q, t)
    }

    pub fn q(&self) -> &DMatrix<f64> {
        &self.q
    }

    pub fn t(&self) -> &DMatrix<f64> {
        &self.t
    }

    pub fn global_dofs(&self) -> usize {
        self.q.ncols()
    }

    pub fn local_dofs(&self) -> usize {
        self.q.nrows()
    }

    pub(crate) fn to_local(&self, x: &DVector<f64>) -> HbResult<DVector<f64>> {
        self.check_global(x.len(), 1)?;
        Ok(&self.q * x)
    }

    /// Local harmonics `(Nhc, Nnl)` of global harmonic displacements `u`.
    pub(crate) fn to_local_harmonics(
        &self,
        u: &DVector<f64>,
        nhc: usize,
    ) -> HbResult<DMatrix<f64>> {
        self.check_global(u.len(), nhc)?;
        let blocks = DMatrix::from_row_slice(nhc, self.global_dofs(), u.as_slice());
        Ok(blocks * self.q.transpose())
    }

    /// Global harmonic vector from local harmonics `(Nhc, Nnl)`.
    pub(crate) fn to_global_harmonics(&self, local: &DMatrix<f64>) -> DVector<f64> {
        let blocks = local * self.t.transpose();
        DVector::from_iterator(blocks.len(), blocks.transpose().iter().copied())
    }

    /// `kron(I, T) J kron(I, Q)` for a local Jacobian ordered
    /// `[hc * Nnl + j]`.
    pub(crate) fn to_global_jacobian(&self, local: &DMatrix<f64>, nhc: usize) -> DMatrix<f64> {
        let eye = DMatrix::<f64>::identity(nhc, nhc);
        eye.kronecker(&self.t) * local * eye.kronecker(&self.q)
    }

    fn check_global(&self, len: usize, nhc: usize) -> HbResult<()> {
        let expected = nhc * self.global_dofs();
        if len != expected {
            return Err(HbError::DimensionMismatch {
                what: "global displacement length",
                expected,
                actual: len,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn harmonic_maps_follow_block_layout() {
        // Two global dofs, local coordinate x0 - x1.
        let map = LocalMap::relative(2, 0, 1).unwrap();
        // Blocks: [h0: (3, 1), h1c: (2, -2), h1s: (0, 5)]
        let u = DVector::from_vec(vec![3.0, 1.0, 2.0, -2.0, 0.0, 5.0]);
        let local = map.to_local_harmonics(&u, 3).unwrap();
        assert_eq!(local.as_slice(), &[2.0, 4.0, -5.0]);

        let global = map.to_global_harmonics(&local);
        assert_eq!(global.as_slice(), &[2.0, -2.0, 4.0, -4.0, -5.0, 5.0]);
    }

    #[test]
    fn global_jacobian_applies_both_maps() {
        let map = LocalMap::relative(2, 0, 1).unwrap();
        let local = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 3.0, 4.0]);
        let global = map.to_global_jacobian(&local, 2);
        assert_eq!(global.shape(), (4, 4));
        // dF(h0, dof 0) / dU(h1, dof 1) = T[0] * J[0, 1] * Q[1] = 1 * 2 * -1
        assert_eq!(global[(0, 3)], -2.0);
        assert_eq!(global[(1, 2)], -2.0);
        assert_eq!(global[(3, 3)], 4.0);
    }

    #[test]
    fn maps_validate_shapes() {
        let q = DMatrix::zeros(1, 3);
        assert!(LocalMap::new(q.clone(), DMatrix::zeros(2, 1)).is_err());
        assert!(LocalMap::new(q, DMatrix::zeros(3, 1)).is_ok());
        assert!(LocalMap::single_dof(2, 2).is_err());
        let map = LocalMap::single_dof(2, 1).unwrap();
        assert!(map.to_local_harmonics(&DVector::zeros(5), 3).is_err());
    }
}
