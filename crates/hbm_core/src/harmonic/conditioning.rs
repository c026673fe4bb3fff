use super::HarmonicSet;
use crate::error::{HbError, HbResult};
use nalgebra::DVector;

/// Minimum values a harmonic-wise conditioning vector may take.
#[derive(Debug, Clone, PartialEq)]
pub enum ConditioningFloor {
    /// One floor for every harmonic and every extra unknown.
    Uniform(f64),
    /// One floor per harmonic (in set order), followed by one floor shared by
    /// all trailing extra unknowns. The trailing entry may be omitted when
    /// there are no extras.
    PerHarmonic(Vec<f64>),
}

impl Default for ConditioningFloor {
    fn default() -> Self {
        ConditioningFloor::Uniform(1e-4)
    }
}

impl ConditioningFloor {
    fn resolve(&self, harmonics: usize, has_extras: bool) -> HbResult<(Vec<f64>, f64)> {
        match self {
            ConditioningFloor::Uniform(delta) => Ok((vec![*delta; harmonics], *delta)),
            ConditioningFloor::PerHarmonic(deltas) => {
                let expected = harmonics + usize::from(has_extras);
                if deltas.len() != expected && deltas.len() != harmonics + 1 {
                    return Err(HbError::DimensionMismatch {
                        what: "conditioning floor entries",
                        expected,
                        actual: deltas.len(),
                    });
                }
                let extra = deltas.get(harmonics).copied().unwrap_or(0.0);
                Ok((deltas[..harmonics].to_vec(), extra))
            }
        }
    }
}

/// Conditioning vector `CtoP` for harmonic unknowns `x`, such that
/// `x_physical = CtoP * x_conditioned`.
///
/// Every entry of a harmonic's block (all `ndof` degrees of freedom, cosine
/// and sine together) gets the larger of that harmonic's floor and the mean
/// absolute value of `x` over the block. Trailing extra unknowns are each
/// floored individually against their own magnitude.
pub fn harmonic_wise_conditioning(
    x: &DVector<f64>,
    ndof: usize,
    harmonics: &HarmonicSet,
    floor: &ConditioningFloor,
) -> HbResult<DVector<f64>> {
    let harmonic_len = ndof * harmonics.component_count();
    if x.len() < harmonic_len {
        return Err(HbError::DimensionMismatch {
            what: "harmonic unknowns",
            expected: harmonic_len,
            actual: x.len(),
        });
    }
    let extras = x.len() - harmonic_len;
    let (harmonic_floor, extra_floor) = floor.resolve(harmonics.len(), extras > 0)?;

    let mut ctop = DVector::zeros(x.len());
    for (block, delta) in harmonics.blocks().iter().zip(harmonic_floor) {
        let start = block.row * ndof;
        let len = block.width * ndof;
        let rows = x.rows(start, len);
        let mean = if len == 0 {
            0.0
        } else {
            rows.iter().map(|v| v.abs()).sum::<f64>() / len as f64
        };
        ctop.rows_mut(start, len).fill(delta.max(mean));
    }
    for i in harmonic_len..x.len() {
        ctop[i] = extra_floor.max(x[i].abs());
    }
    Ok(ctop)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_share_one_value_and_respect_floor() {
        let h = HarmonicSet::new(vec![0, 1, 2]).unwrap();
        // ndof = 2: [h0 (2), h1c (2), h1s (2), h2c (2), h2s (2), extra]
        let x = DVector::from_vec(vec![
            1.0, -3.0, 0.5, -0.5, 1.0, 2.0, 1e-7, -1e-7, 0.0, 0.0, -12.0,
        ]);
        let ctop =
            harmonic_wise_conditioning(&x, 2, &h, &ConditioningFloor::Uniform(1e-3)).unwrap();

        assert_eq!(ctop[0], 2.0);
        assert_eq!(ctop[1], 2.0);
        for i in 2..6 {
            assert_eq!(ctop[i], 1.0);
        }
        for i in 6..10 {
            assert_eq!(ctop[i], 1e-3);
        }
        assert_eq!(ctop[10], 12.0);
        assert!(ctop.iter().all(|&v| v >= 1e-3));
    }

    #[test]
    fn per_harmonic_floors_apply_to_each_block_and_extras() {
        let h = HarmonicSet::new(vec![1, 3]).unwrap();
        let x = DVector::from_vec(vec![0.0, 0.0, 4.0, 4.0, 0.01, 0.02]);
        let floor = ConditioningFloor::PerHarmonic(vec![0.5, 1.0, 0.1]);
        let ctop = harmonic_wise_conditioning(&x, 1, &h, &floor).unwrap();
        assert_eq!(ctop.as_slice(), &[0.5, 0.5, 4.0, 4.0, 0.1, 0.1]);
    }

    #[test]
    fn per_harmonic_floor_without_extra_entry_is_rejected_when_extras_exist() {
        let h = HarmonicSet::new(vec![1]).unwrap();
        let x = DVector::from_vec(vec![1.0, 1.0, 3.0]);
        let err = harmonic_wise_conditioning(&x, 1, &h, &ConditioningFloor::PerHarmonic(vec![0.1]))
            .unwrap_err();
        assert!(matches!(err, HbError::DimensionMismatch { expected: 2, actual: 1, .. }));
    }

    #[test]
    fn short_vector_is_rejected() {
        let h = HarmonicSet::new(vec![0, 1]).unwrap();
        let x = DVector::from_vec(vec![1.0, 2.0]);
        assert!(harmonic_wise_conditioning(&x, 1, &h, &ConditioningFloor::default()).is_err());
    }
}
