use super::HarmonicSet;
use crate::error::{HbError, HbResult};
use nalgebra::DMatrix;

fn check_square(what: &'static str, matrix: &DMatrix<f64>, nd: usize) -> HbResult<()> {
    if matrix.nrows() != nd {
        return Err(HbError::DimensionMismatch {
            what,
            expected: nd,
            actual: matrix.nrows(),
        });
    }
    if matrix.ncols() != nd {
        return Err(HbError::DimensionMismatch {
            what,
            expected: nd,
            actual: matrix.ncols(),
        });
    }
    Ok(())
}

/// Harmonic stiffness `E(w)` of the linear operator `M d2/dt2 + C d/dt + K`
/// acting on harmonic coefficients, and optionally `dE/dw`.
///
/// For harmonic `k != 0` the `2 x 2` block pattern is
/// `[[K - (k w)^2 M, k w C], [-k w C, K - (k w)^2 M]]`; the zeroth harmonic
/// block is `K`. With `only_damping` the `M` and `K` terms are skipped and
/// those arguments are not inspected.
pub fn harmonic_stiffness_operator(
    m: &DMatrix<f64>,
    c: &DMatrix<f64>,
    k: &DMatrix<f64>,
    w: f64,
    harmonics: &HarmonicSet,
    want_gradient: bool,
    only_damping: bool,
) -> HbResult<(DMatrix<f64>, Option<DMatrix<f64>>)> {
    let nd = c.nrows();
    check_square("damping matrix", c, nd)?;
    let include_km = !only_damping;
    if include_km {
        check_square("mass matrix", m, nd)?;
        check_square("stiffness matrix", k, nd)?;
    }

    let size = nd * harmonics.component_count();
    let mut e = DMatrix::zeros(size, size);
    let mut dedw = if want_gradient {
        Some(DMatrix::zeros(size, size))
    } else {
        None
    };

    for block in harmonics.blocks() {
        let cos0 = nd * block.row;
        if block.harmonic == 0 {
            if include_km {
                e.view_mut((cos0, cos0), (nd, nd)).copy_from(k);
            }
            continue;
        }
        let sin0 = cos0 + nd;
        let kw = block.harmonic as f64 * w;

        e.view_mut((cos0, sin0), (nd, nd)).copy_from(&(c * kw));
        e.view_mut((sin0, cos0), (nd, nd)).copy_from(&(c * -kw));
        if include_km {
            let diagonal = k - m * (kw * kw);
            e.view_mut((cos0, cos0), (nd, nd)).copy_from(&diagonal);
            e.view_mut((sin0, sin0), (nd, nd)).copy_from(&diagonal);
        }

        if let Some(dedw) = dedw.as_mut() {
            let h = block.harmonic as f64;
            dedw.view_mut((cos0, sin0), (nd, nd)).copy_from(&(c * h));
            dedw.view_mut((sin0, cos0), (nd, nd)).copy_from(&(c * -h));
            if include_km {
                let diagonal = m * (-2.0 * w * h * h);
                dedw.view_mut((cos0, cos0), (nd, nd)).copy_from(&diagonal);
                dedw.view_mut((sin0, sin0), (nd, nd)).copy_from(&diagonal);
            }
        }
    }

    Ok((e, dedw))
}
