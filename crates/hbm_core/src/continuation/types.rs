//! Configuration and result types for continuation runs.

use crate::error::{HbError, HbResult};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Constraint equation closing the augmented corrector system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Corrector {
    /// The correction must be orthogonal to the prediction direction.
    #[default]
    Ortho,
    /// The step must have weighted length `ds` from the previous point.
    Pseudo,
}

impl FromStr for Corrector {
    type Err = HbError;

    fn from_str(s: &str) -> HbResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ortho" => Ok(Corrector::Ortho),
            "pseudo" => Ok(Corrector::Pseudo),
            _ => Err(HbError::config(format!("invalid corrector type: {s}"))),
        }
    }
}

/// User facing continuation options. Validate into [`ContinuationSettings`]
/// before use.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContinuationConfig {
    /// Weight of `lam` in the arclength metric; 1 is pure `lam` control.
    pub frac_lam: f64,
    pub ds0: f64,
    /// Defaults to `5 * ds0`.
    pub dsmax: Option<f64>,
    /// Defaults to `ds0 / 5`.
    pub dsmin: Option<f64>,
    /// Maximum number of points on the branch, initial point included.
    pub max_steps: usize,
    pub target_nfev: usize,
    pub dynamic_ctop: bool,
    /// Passed to every nonlinear solve.
    pub xtol: Option<f64>,
    pub corrector: Corrector,
    /// Fallback `frac_lam` values tried in order when a step fails at
    /// `dsmin`.
    pub frac_lam_list: Vec<f64>,
    /// Unlimited when unset.
    pub backtrack_stop: Option<f64>,
    pub max_increase: f64,
    /// Not implemented; must stay false.
    pub return_grad: bool,
    /// Emit a progress line every this many steps, 0 disables them.
    pub log_every: usize,
}

impl Default for ContinuationConfig {
    fn default() -> Self {
        Self {
            frac_lam: 0.5,
            ds0: 0.01,
            dsmax: None,
            dsmin: None,
            max_steps: 500,
            target_nfev: 20,
            dynamic_ctop: false,
            xtol: None,
            corrector: Corrector::Ortho,
            frac_lam_list: Vec::new(),
            backtrack_stop: None,
            max_increase: 1.2,
            return_grad: false,
            log_every: 100,
        }
    }
}

impl ContinuationConfig {
    pub fn validate(&self) -> HbResult<ContinuationSettings> {
        if self.return_grad {
            return Err(HbError::config("return_grad is not implemented"));
        }
        if !(self.ds0 > 0.0) {
            return Err(HbError::config(format!("ds0 must be positive, got {}", self.ds0)));
        }
        let dsmax = self.dsmax.unwrap_or(5.0 * self.ds0);
        let dsmin = self.dsmin.unwrap_or(self.ds0 / 5.0);
        if !(dsmin > 0.0) || dsmin > dsmax {
            return Err(HbError::config(format!(
                "step bounds must satisfy 0 < dsmin <= dsmax, got dsmin={dsmin}, dsmax={dsmax}"
            )));
        }
        if self.max_steps == 0 {
            return Err(HbError::config("max_steps must be greater than zero"));
        }
        if self.target_nfev == 0 {
            return Err(HbError::config("target_nfev must be greater than zero"));
        }
        if !(self.max_increase >= 1.0) {
            return Err(HbError::config("max_increase must be at least 1"));
        }
        if let Some(stop) = self.backtrack_stop {
            if !(stop >= 0.0) {
                return Err(HbError::config("backtrack_stop must be non-negative"));
            }
        }

        let mut ladder = vec![self.frac_lam];
        let skip_leading = usize::from(self.frac_lam_list.first() == Some(&self.frac_lam));
        ladder.extend(self.frac_lam_list.iter().skip(skip_leading).copied());
        if let Some(bad) = ladder.iter().find(|b| !(0.0..=1.0).contains(*b)) {
            return Err(HbError::config(format!("frac_lam must lie in [0, 1], got {bad}")));
        }

        Ok(ContinuationSettings {
            frac_lam_ladder: ladder,
            ds0: self.ds0,
            dsmin,
            dsmax,
            max_steps: self.max_steps,
            target_nfev: self.target_nfev,
            dynamic_ctop: self.dynamic_ctop,
            xtol: self.xtol,
            corrector: self.corrector,
            backtrack_stop: self.backtrack_stop.unwrap_or(f64::INFINITY),
            max_increase: self.max_increase,
            log_every: self.log_every,
        })
    }
}

/// Validated, immutable continuation settings. Only
/// [`ContinuationConfig::validate`] builds them.
#[derive(Debug, Clone, Serialize)]
pub struct ContinuationSettings {
    /// Primary `frac_lam` first, then the fallbacks. Never empty.
    pub(crate) frac_lam_ladder: Vec<f64>,
    pub(crate) ds0: f64,
    pub(crate) dsmin: f64,
    pub(crate) dsmax: f64,
    pub(crate) max_steps: usize,
    pub(crate) target_nfev: usize,
    pub(crate) dynamic_ctop: bool,
    pub(crate) xtol: Option<f64>,
    pub(crate) corrector: Corrector,
    pub(crate) backtrack_stop: f64,
    pub(crate) max_increase: f64,
    pub(crate) log_every: usize,
}

impl ContinuationSettings {
    pub fn frac_lam(&self) -> f64 {
        self.frac_lam_ladder.first().copied().unwrap_or(0.5)
    }

    pub fn frac_lam_ladder(&self) -> &[f64] {
        &self.frac_lam_ladder
    }

    pub fn ds0(&self) -> f64 {
        self.ds0
    }

    /// `(dsmin, dsmax)`
    pub fn step_bounds(&self) -> (f64, f64) {
        (self.dsmin, self.dsmax)
    }

    pub fn max_steps(&self) -> usize {
        self.max_steps
    }

    pub fn corrector(&self) -> Corrector {
        self.corrector
    }

    pub fn dynamic_ctop(&self) -> bool {
        self.dynamic_ctop
    }
}

/// A single converged point on a continuation branch, in physical units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinuationPoint {
    pub state: Vec<f64>,
    pub lam: f64,
    /// Step size that produced this point (0 for the initial point).
    pub ds: f64,
    /// Residual evaluations used by the solve that produced this point.
    pub nfev: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Termination {
    /// `lam` reached or passed `lam1`.
    ReachedEnd,
    MaxSteps,
    /// `lam` moved back past `lam0` by more than `backtrack_stop`.
    Backtracked,
    /// Every `frac_lam` value failed at `dsmin`.
    CorrectorFailed,
}

/// Result of a continuation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinuationBranch {
    pub points: Vec<ContinuationPoint>,
    pub termination: Termination,
    /// Conditioning vector in force at the end of the run.
    pub ctop: Vec<f64>,
}

impl ContinuationBranch {
    pub fn lams(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.lam).collect()
    }

    pub fn completed(&self) -> bool {
        self.termination != Termination::CorrectorFailed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrector_parses_case_insensitively() {
        assert_eq!("Ortho".parse::<Corrector>().unwrap(), Corrector::Ortho);
        assert_eq!("PSEUDO".parse::<Corrector>().unwrap(), Corrector::Pseudo);
        let err = "invalid".parse::<Corrector>().unwrap_err();
        assert!(matches!(err, HbError::InvalidConfig { .. }));
        assert!(err.to_string().contains("invalid corrector type"));
    }

    #[test]
    fn invalid_corrector_is_rejected_at_deserialization() {
        let result: Result<ContinuationConfig, _> =
            serde_json::from_str(r#"{"corrector": "invalid"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn defaults_resolve_step_bounds() {
        let config = ContinuationConfig {
            ds0: 0.2,
            ..Default::default()
        };
        let settings = config.validate().unwrap();
        assert!((settings.dsmax - 1.0).abs() < 1e-15);
        assert!((settings.dsmin - 0.04).abs() < 1e-15);
        assert_eq!(settings.frac_lam_ladder, vec![0.5]);
        assert_eq!(settings.backtrack_stop, f64::INFINITY);
        assert_eq!(settings.corrector, Corrector::Ortho);
    }

    #[test]
    fn validated_settings_expose_resolved_values() {
        let settings = ContinuationConfig {
            frac_lam: 0.8,
            frac_lam_list: vec![0.2],
            ds0: 0.1,
            dsmin: Some(0.05),
            corrector: Corrector::Pseudo,
            ..Default::default()
        }
        .validate()
        .unwrap();
        assert_eq!(settings.frac_lam(), 0.8);
        assert_eq!(settings.frac_lam_ladder(), &[0.8, 0.2]);
        assert_eq!(settings.ds0(), 0.1);
        assert_eq!(settings.step_bounds(), (0.05, 0.5));
        assert_eq!(settings.max_steps(), 500);
        assert_eq!(settings.corrector(), Corrector::Pseudo);
        assert!(!settings.dynamic_ctop());

        let json = serde_json::to_value(&settings).unwrap();
        assert_eq!(json["frac_lam_ladder"], serde_json::json!([0.8, 0.2]));
    }

    #[test]
    fn ladder_drops_leading_duplicate_of_primary() {
        let config = ContinuationConfig {
            frac_lam: 0.3,
            frac_lam_list: vec![0.3, 0.9, 0.1],
            ..Default::default()
        };
        assert_eq!(config.validate().unwrap().frac_lam_ladder, vec![0.3, 0.9, 0.1]);

        let config = ContinuationConfig {
            frac_lam: 0.3,
            frac_lam_list: vec![0.9, 0.3],
            ..Default::default()
        };
        assert_eq!(config.validate().unwrap().frac_lam_ladder, vec![0.3, 0.9, 0.3]);
    }

    #[test]
    fn validation_rejects_bad_values() {
        let cases = [
            ContinuationConfig {
                return_grad: true,
                ..Default::default()
            },
            ContinuationConfig {
                ds0: 0.0,
                ..Default::default()
            },
            ContinuationConfig {
                dsmin: Some(1.0),
                dsmax: Some(0.5),
                ..Default::default()
            },
            ContinuationConfig {
                frac_lam: 1.5,
                ..Default::default()
            },
            ContinuationConfig {
                max_increase: 0.5,
                ..Default::default()
            },
            ContinuationConfig {
                max_steps: 0,
                ..Default::default()
            },
        ];
        for config in cases {
            assert!(matches!(config.validate(), Err(HbError::InvalidConfig { .. })));
        }
    }

    #[test]
    fn branch_serializes_to_json() {
        let branch = ContinuationBranch {
            points: vec![ContinuationPoint {
                state: vec![1.0, 2.0],
                lam: 0.5,
                ds: 0.1,
                nfev: 3,
            }],
            termination: Termination::ReachedEnd,
            ctop: vec![1.0, 1.0, 1.0],
        };
        let json = serde_json::to_string(&branch).unwrap();
        let back: ContinuationBranch = serde_json::from_str(&json).unwrap();
        assert_eq!(back.lams(), vec![0.5]);
        assert!(back.completed());
    }
}
