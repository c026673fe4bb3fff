use thiserror::Error;

pub type HbResult<T> = Result<T, HbError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum HbError {
    #[error("Harmonic set must contain at least one harmonic")]
    EmptyHarmonics,

    #[error("Repeated harmonics are not allowed (harmonic {harmonic} appears more than once)")]
    DuplicateHarmonic { harmonic: usize },

    #[error("Zeroth harmonic must be first in the harmonic set")]
    ZeroHarmonicNotFirst,

    #[error(
        "Aliasing: {nt} time samples cannot resolve harmonic {max_harmonic} (need more than {required})"
    )]
    Aliasing {
        nt: usize,
        max_harmonic: usize,
        required: usize,
    },

    #[error("Dimension mismatch for {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid configuration: {what}")]
    InvalidConfig { what: String },

    #[error("Failed to converge to the initial point at lam = {lam0}; give a better initial guess")]
    InitialPointFailed { lam0: f64 },

    #[error("Singular matrix in {what}")]
    SingularMatrix { what: &'static str },

    #[error("Matrix is not positive definite: {what}")]
    NotPositiveDefinite { what: &'static str },
}

impl HbError {
    pub(crate) fn config(what: impl Into<String>) -> Self {
        HbError::InvalidConfig { what: what.into() }
    }
}
