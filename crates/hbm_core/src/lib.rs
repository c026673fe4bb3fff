//! The `hbm_core` crate computes periodic steady-state responses of jointed
//! structures with the harmonic balance method and traces them with
//! arclength continuation.
//!
//! Key components:
//! - **Harmonic**: harmonic layout, the AFT transforms and the harmonic stiffness operator.
//! - **Solvers**: Newton-Raphson and BFGS nonlinear solver plus dense linear algebra helpers.
//! - **Continuation**: predictor/corrector continuation with dynamic conditioning.
//! - **Forces**: reference joint elements (`JenkinsSlider`, `PolynomialForce`).
//! - **System**: assembly of `M`, `C`, `K` and nonlinear forces into residuals.

pub mod autodiff;
pub mod continuation;
pub mod error;
pub mod forces;
pub mod harmonic;
pub mod postprocess;
pub mod solvers;
pub mod system;
pub mod traits;

pub use error::{HbError, HbResult};
