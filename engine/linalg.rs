//! Dense kernels shared by the solver and the covariance estimator.
//!
//! Everything here is a pure function of its inputs. The padded pseudo-inverse
//! returns the compacted design explicitly instead of editing the caller's
//! matrix in place.

use crate::faer_ndarray::{FaerColPivQr, PivotedQr};
use ndarray::{Array2, ArrayBase, ArrayView2, Axis, Data, Ix2, s};

/// Returns `A'A`.
///
/// Only the upper triangle is computed; the lower triangle is mirrored from it.
pub fn cross_product<S: Data<Elem = f64>>(a: &ArrayBase<S, Ix2>) -> Array2<f64> {
    let p = a.ncols();
    let mut out = Array2::zeros((p, p));
    for i in 0..p {
        let col_i = a.column(i);
        for j in i..p {
            let value = col_i.dot(&a.column(j));
            out[[i, j]] = value;
            out[[j, i]] = value;
        }
    }
    out
}

/// Kronecker product: the block matrix whose `(i, j)` block is `a[i, j] · b`.
pub fn kronecker<S1, S2>(a: &ArrayBase<S1, Ix2>, b: &ArrayBase<S2, Ix2>) -> Array2<f64>
where
    S1: Data<Elem = f64>,
    S2: Data<Elem = f64>,
{
    let (ar, ac) = a.dim();
    let (br, bc) = b.dim();
    let mut out = Array2::zeros((ar * br, ac * bc));
    for i in 0..ar {
        for j in 0..ac {
            let scale = a[[i, j]];
            out.slice_mut(s![i * br..(i + 1) * br, j * bc..(j + 1) * bc])
                .assign(&b.mapv(|v| v * scale));
        }
    }
    out
}

/// Inverse of a nonsingular upper-triangular matrix by column-wise back substitution.
pub fn upper_triangular_inverse(r: ArrayView2<f64>) -> Array2<f64> {
    let k = r.nrows();
    let mut inv = Array2::zeros((k, k));
    for j in 0..k {
        for i in (0..=j).rev() {
            let mut acc = if i == j { 1.0 } else { 0.0 };
            for m in (i + 1)..=j {
                acc -= r[[i, m]] * inv[[m, j]];
            }
            inv[[i, j]] = acc / r[[i, i]];
        }
    }
    inv
}

/// `(X'X)⁻¹` restricted to the independent columns found by a pivoted QR.
#[derive(Debug, Clone)]
pub struct RankRestrictedInverse {
    /// Inverse of the leading `rank × rank` block of `R`, in pivot order.
    pub r_inv: Array2<f64>,
    /// `rank × rank` inverse cross-product with rows and columns in the original
    /// relative order of the retained columns.
    pub inverse: Array2<f64>,
    /// Original indices of the retained columns, ascending.
    pub retained: Vec<usize>,
}

impl RankRestrictedInverse {
    pub fn from_qr(qr: &PivotedQr, rank: usize) -> Self {
        let r_inv = upper_triangular_inverse(qr.r.slice(s![..rank, ..rank]));

        let mut retained: Vec<usize> = qr.pivot[..rank].to_vec();
        retained.sort_unstable();

        // Position of each pivoted column inside the compacted (retained) ordering.
        let compact_position: Vec<usize> = qr.pivot[..rank]
            .iter()
            .map(|col| retained.partition_point(|kept| kept < col))
            .collect();

        let pivoted_inverse = r_inv.dot(&r_inv.t());
        let mut inverse = Array2::zeros((rank, rank));
        for (i, &row) in compact_position.iter().enumerate() {
            for (j, &col) in compact_position.iter().enumerate() {
                inverse[[row, col]] = pivoted_inverse[[i, j]];
            }
        }

        Self {
            r_inv,
            inverse,
            retained,
        }
    }
}

/// Pseudo-inverse of the cross-product of a design padded with fixed-effect
/// indicator columns.
#[derive(Debug, Clone)]
pub struct PaddedInverse {
    /// `rank × rank` generalized inverse of `U'U` over the independent columns.
    pub inverse: Array2<f64>,
    /// Original indices of the independent columns, ascending.
    pub retained: Vec<usize>,
    /// The input with every redundant column removed (`n × rank`).
    pub compacted: Array2<f64>,
}

/// Rank-revealing pseudo-inverse of `U'U` for a padded design `U`.
///
/// Redundant columns are reported through `retained` and physically removed in
/// `compacted`; the input is left untouched.
pub fn padded_pseudo_inverse(
    padded: ArrayView2<f64>,
    rank_tolerance: Option<f64>,
) -> PaddedInverse {
    let qr = padded.pivoted_qr();
    let rank = qr.rank(rank_tolerance);
    let restricted = RankRestrictedInverse::from_qr(&qr, rank);

    if rank < padded.ncols() {
        log::debug!(
            "Padded design has rank {}/{}; dropping columns {:?}",
            rank,
            padded.ncols(),
            qr.dropped_columns(rank)
        );
    }

    let compacted = padded.select(Axis(1), &restricted.retained);
    PaddedInverse {
        inverse: restricted.inverse,
        retained: restricted.retained,
        compacted,
    }
}
