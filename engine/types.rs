use crate::errors::EngineError;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The family of sandwich covariance estimators understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum VarianceType {
    /// Homoskedastic `s² (X'X)⁻¹`.
    #[serde(rename = "classical")]
    Classical,
    /// White's estimator, squared residuals unadjusted.
    HC0,
    /// HC0 scaled by `n / (n - k)`.
    HC1,
    /// Squared residuals divided by `1 - h_ii`.
    #[default]
    HC2,
    /// Squared residuals divided by `(1 - h_ii)²`.
    HC3,
    /// Liang-Zeger cluster-robust estimator without correction.
    CR0,
    /// Bell-McCaffrey bias-reduced cluster-robust estimator.
    CR2,
    /// CR0 with the small-sample factor `J (n - 1) / ((J - 1)(n - k))`.
    #[serde(rename = "stata")]
    Stata,
}

impl VarianceType {
    pub const ALL: [VarianceType; 8] = [
        VarianceType::Classical,
        VarianceType::HC0,
        VarianceType::HC1,
        VarianceType::HC2,
        VarianceType::HC3,
        VarianceType::CR0,
        VarianceType::CR2,
        VarianceType::Stata,
    ];

    pub fn is_clustered(self) -> bool {
        matches!(
            self,
            VarianceType::CR0 | VarianceType::CR2 | VarianceType::Stata
        )
    }

    /// Whether the estimator needs the leverage-ready padded inverse of the design.
    pub fn needs_padded_inverse(self) -> bool {
        matches!(
            self,
            VarianceType::HC2 | VarianceType::HC3 | VarianceType::CR2
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VarianceType::Classical => "classical",
            VarianceType::HC0 => "HC0",
            VarianceType::HC1 => "HC1",
            VarianceType::HC2 => "HC2",
            VarianceType::HC3 => "HC3",
            VarianceType::CR0 => "CR0",
            VarianceType::CR2 => "CR2",
            VarianceType::Stata => "stata",
        }
    }
}

impl fmt::Display for VarianceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VarianceType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VarianceType::ALL
            .into_iter()
            .find(|candidate| candidate.as_str() == s)
            .ok_or_else(|| EngineError::UnknownVarianceType(s.to_string()))
    }
}

/// Which factorization produced a least-squares fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolvePath {
    Cholesky,
    PivotedQr,
}

/// Output of the covariance estimator.
///
/// * `covariance`: `(r·ny) × (r·ny)`, Kronecker-expanded across outcomes.
/// * `dof`: one slot per coefficient; `None` where degrees of freedom were not
///   requested or the coefficient was masked out.
/// * `residual_variance`: `ny × ny` for the classical estimator, `ny × 1` otherwise.
#[derive(Debug, Clone)]
pub struct CovarianceEstimate {
    pub covariance: Array2<f64>,
    pub dof: Array1<Option<f64>>,
    pub residual_variance: Array2<f64>,
}

impl CovarianceEstimate {
    pub fn standard_errors(&self) -> Array1<f64> {
        self.covariance.diag().mapv(f64::sqrt)
    }
}
