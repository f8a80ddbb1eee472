//! Rank-aware least squares.
//!
//! A Cholesky factorization of `X'X` is tried first when requested. If it fails
//! (the cross-product is not numerically positive definite) the solver falls
//! back to a column-pivoted QR of `X`, which also reveals the numerical rank.
//! Columns beyond the rank are aliased: their coefficients are `None` and they
//! are excluded from the inverse cross-product.

use crate::errors::EngineError;
use crate::faer_ndarray::{FaerCholesky, FaerColPivQr};
use crate::linalg::{RankRestrictedInverse, cross_product, upper_triangular_inverse};
use crate::types::SolvePath;
use faer::Side;
use ndarray::{Array2, ArrayView2, Axis, s};

/// Smallest accepted ratio of squared Cholesky pivots, `min L_ii² / max L_ii²`.
/// Anything below is treated as a rank-deficient cross-product.
const CHOLESKY_PIVOT_RATIO: f64 = 1e-10;

/// Coefficients and bread matrix of a least-squares fit.
#[derive(Debug, Clone)]
pub struct LeastSquaresFit {
    /// `p × ny`; `None` marks a column dropped as linearly dependent.
    pub coefficients: Array2<Option<f64>>,
    /// `rank × rank` inverse of `X'X` over the retained columns, in their
    /// original relative order.
    pub inverse_cross_product: Array2<f64>,
    pub rank: usize,
    /// Original indices of the retained columns, ascending.
    pub retained: Vec<usize>,
    pub path: SolvePath,
}

impl LeastSquaresFit {
    pub fn aliased(&self) -> Vec<bool> {
        self.coefficients
            .axis_iter(Axis(0))
            .map(|row| row.iter().any(Option::is_none))
            .collect()
    }

    /// Coefficients with aliased entries set to zero, for forming `Xβ`.
    pub fn coefficient_values(&self) -> Array2<f64> {
        self.coefficients.mapv(|c| c.unwrap_or(0.0))
    }

    /// Coefficients of the retained columns only (`rank × ny`).
    pub fn retained_coefficients(&self) -> Array2<f64> {
        self.coefficient_values().select(Axis(0), &self.retained)
    }

    pub fn fitted_values(&self, design: ArrayView2<f64>) -> Array2<f64> {
        design.dot(&self.coefficient_values())
    }
}

/// Solves `min ‖Y − Xβ‖²` column by column for every outcome in `outcome`.
///
/// `rank_tolerance` overrides the relative diagonal threshold used by the
/// pivoted QR to decide the rank.
pub fn solve_least_squares(
    design: ArrayView2<f64>,
    outcome: ArrayView2<f64>,
    try_cholesky: bool,
    rank_tolerance: Option<f64>,
) -> Result<LeastSquaresFit, EngineError> {
    if design.nrows() != outcome.nrows() {
        return Err(EngineError::DimensionMismatch {
            what: "outcome rows",
            expected: design.nrows(),
            found: outcome.nrows(),
        });
    }

    if try_cholesky {
        if let Some(fit) = solve_by_cholesky(design, outcome) {
            return Ok(fit);
        }
    }
    Ok(solve_by_pivoted_qr(design, outcome, rank_tolerance))
}

fn solve_by_cholesky(design: ArrayView2<f64>, outcome: ArrayView2<f64>) -> Option<LeastSquaresFit> {
    let p = design.ncols();
    let xtx = cross_product(&design);
    let factor = match xtx.cholesky(Side::Lower) {
        Ok(factor) => factor,
        Err(err) => {
            log::debug!("Cholesky of X'X failed ({err}); falling back to pivoted QR");
            return None;
        }
    };

    let lower = factor.triangular_factor();
    let pivots = lower.diag().mapv(|d| d * d);
    let largest = pivots.iter().copied().fold(0.0_f64, f64::max);
    let smallest = pivots.iter().copied().fold(f64::INFINITY, f64::min);
    if p > 0 && smallest <= CHOLESKY_PIVOT_RATIO * largest {
        log::debug!(
            "Cholesky pivots of X'X span {:.3e}..{:.3e}; falling back to pivoted QR",
            smallest,
            largest
        );
        return None;
    }

    let xty = design.t().dot(&outcome);
    let beta = factor.solve_mat(&xty);
    if beta.iter().any(|v| !v.is_finite()) {
        log::debug!("Cholesky solve produced non-finite coefficients; falling back to pivoted QR");
        return None;
    }

    // (X'X)⁻¹ = L⁻ᵀ L⁻¹ with L⁻ᵀ the inverse of the upper factor L'.
    let upper_inv = upper_triangular_inverse(lower.t());
    let inverse_cross_product = upper_inv.dot(&upper_inv.t());

    log::debug!("Solved {}-column system by Cholesky", p);
    Some(LeastSquaresFit {
        coefficients: beta.mapv(Some),
        inverse_cross_product,
        rank: p,
        retained: (0..p).collect(),
        path: SolvePath::Cholesky,
    })
}

fn solve_by_pivoted_qr(
    design: ArrayView2<f64>,
    outcome: ArrayView2<f64>,
    rank_tolerance: Option<f64>,
) -> LeastSquaresFit {
    let p = design.ncols();
    let ny = outcome.ncols();

    let qr = design.pivoted_qr();
    let rank = qr.rank(rank_tolerance);
    let restricted = RankRestrictedInverse::from_qr(&qr, rank);

    let effects = qr.q.t().dot(&outcome);
    let beta_pivoted = restricted.r_inv.dot(&effects.slice(s![..rank, ..]));

    let mut coefficients = Array2::from_elem((p, ny), None);
    for (i, &col) in qr.pivot[..rank].iter().enumerate() {
        for m in 0..ny {
            coefficients[[col, m]] = Some(beta_pivoted[[i, m]]);
        }
    }

    if rank < p {
        log::info!(
            "Design is rank deficient ({}/{}); aliased columns: {:?}",
            rank,
            p,
            qr.dropped_columns(rank)
        );
    } else {
        log::debug!("Solved {}-column system by pivoted QR", p);
    }

    LeastSquaresFit {
        coefficients,
        inverse_cross_product: restricted.inverse,
        rank,
        retained: restricted.retained,
        path: SolvePath::PivotedQr,
    }
}
