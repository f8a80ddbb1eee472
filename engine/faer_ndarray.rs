use faer::diag::DiagRef;
use faer::linalg::solvers::{self, ColPivQr, Solve};
use faer::{Mat, MatRef, Side};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix2};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FaerLinalgError {
    #[error("Self-adjoint eigendecomposition failed: {0:?}")]
    SelfAdjointEigen(solvers::EvdError),
    #[error("Cholesky factorization failed: {0:?}")]
    Cholesky(solvers::LltError),
}

fn owned_array(mat: MatRef<'_, f64>) -> Array2<f64> {
    Array2::from_shape_fn((mat.nrows(), mat.ncols()), |(i, j)| mat[(i, j)])
}

fn owned_diagonal(diag: DiagRef<'_, f64>) -> Array1<f64> {
    let mat = diag.column_vector().as_mat();
    Array1::from_shape_fn(mat.nrows(), |i| mat[(i, 0)])
}

enum FaerStorage<'a> {
    Borrowed(MatRef<'a, f64>),
    Owned(Mat<f64>),
}

impl<'a> FaerStorage<'a> {
    #[inline]
    fn as_ref(&self) -> MatRef<'_, f64> {
        match self {
            FaerStorage::Borrowed(view) => *view,
            FaerStorage::Owned(mat) => mat.as_ref(),
        }
    }
}

/// Presents an ndarray matrix to faer. Contiguous row- or column-major data is
/// borrowed in place; strided data is copied into a faer `Mat` first.
pub struct FaerArrayView<'a> {
    storage: FaerStorage<'a>,
}

impl<'a> FaerArrayView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix2>) -> Self {
        let storage = match array.as_slice_memory_order() {
            Some(slice) if array.is_standard_layout() => FaerStorage::Borrowed(
                MatRef::from_row_major_slice(slice, array.nrows(), array.ncols()),
            ),
            Some(slice) if array.t().is_standard_layout() => FaerStorage::Borrowed(
                MatRef::from_column_major_slice(slice, array.nrows(), array.ncols()),
            ),
            _ => {
                let (rows, cols) = array.dim();
                FaerStorage::Owned(Mat::from_fn(rows, cols, |i, j| array[(i, j)]))
            }
        };
        Self { storage }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        self.storage.as_ref()
    }
}

pub trait FaerEigh {
    /// Symmetric eigendecomposition reading only the `side` triangle.
    ///
    /// Returns `(values, vectors)` with values ascending and vector `j` in column `j`.
    fn eigh(&self, side: Side) -> Result<(Array1<f64>, Array2<f64>), FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerEigh for ArrayBase<S, Ix2> {
    fn eigh(&self, side: Side) -> Result<(Array1<f64>, Array2<f64>), FaerLinalgError> {
        let faer_view = FaerArrayView::new(self);
        let eigen = faer_view
            .as_ref()
            .self_adjoint_eigen(side)
            .map_err(FaerLinalgError::SelfAdjointEigen)?;
        let values = owned_diagonal(eigen.S());
        let vectors = owned_array(eigen.U());
        Ok((values, vectors))
    }
}

pub struct FaerCholeskyFactor {
    factor: solvers::Llt<f64>,
}

impl FaerCholeskyFactor {
    /// Solves against every column of `rhs` at once.
    pub fn solve_mat(&self, rhs: &Array2<f64>) -> Array2<f64> {
        let rhs_view = FaerArrayView::new(rhs);
        let sol = self.factor.solve(rhs_view.as_ref());
        owned_array(sol.as_ref())
    }

    /// Cholesky root `L`, zero above the diagonal, so that `L L'` rebuilds the
    /// factored matrix.
    pub fn triangular_factor(&self) -> Array2<f64> {
        owned_array(self.factor.L())
    }
}

pub trait FaerCholesky {
    fn cholesky(&self, side: Side) -> Result<FaerCholeskyFactor, FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerCholesky for ArrayBase<S, Ix2> {
    fn cholesky(&self, side: Side) -> Result<FaerCholeskyFactor, FaerLinalgError> {
        let faer_view = FaerArrayView::new(self);
        let factor = faer_view
            .as_ref()
            .llt(side)
            .map_err(FaerLinalgError::Cholesky)?;
        Ok(FaerCholeskyFactor { factor })
    }
}

/// Relative rank tolerance on the diagonal of `R`, matching mgcv and R's `lm`.
pub const DEFAULT_RANK_TOLERANCE: f64 = 1e-7;

/// Factors of `A P = Q R` from a column-pivoted Householder QR.
///
/// `pivot[j]` is the original index of the j-th pivoted column, `q` is the thin
/// `m × k` orthonormal factor and `r` the `k × n` upper-trapezoidal factor,
/// with `k = min(m, n)`.
#[derive(Debug, Clone)]
pub struct PivotedQr {
    pub q: Array2<f64>,
    pub r: Array2<f64>,
    pub pivot: Vec<usize>,
}

impl PivotedQr {
    /// Numerical rank: the number of leading diagonal entries of `R` whose
    /// magnitude exceeds `threshold · max|R_ii|`.
    ///
    /// Without an explicit threshold, [`DEFAULT_RANK_TOLERANCE`] is used.
    pub fn rank(&self, threshold: Option<f64>) -> usize {
        let k = self.r.nrows().min(self.r.ncols());
        if k == 0 {
            return 0;
        }
        let max_pivot = (0..k).fold(0.0_f64, |acc, i| acc.max(self.r[[i, i]].abs()));
        if max_pivot == 0.0 {
            return 0;
        }
        let relative = threshold.unwrap_or(DEFAULT_RANK_TOLERANCE);
        let cutoff = relative * max_pivot;
        (0..k)
            .take_while(|&i| self.r[[i, i]].abs() > cutoff)
            .count()
    }

    /// Original indices of the columns beyond `rank`, in ascending order.
    pub fn dropped_columns(&self, rank: usize) -> Vec<usize> {
        let mut dropped: Vec<usize> = self.pivot[rank..].to_vec();
        dropped.sort_unstable();
        dropped
    }
}

pub trait FaerColPivQr {
    fn pivoted_qr(&self) -> PivotedQr;
}

impl<S: Data<Elem = f64>> FaerColPivQr for ArrayBase<S, Ix2> {
    fn pivoted_qr(&self) -> PivotedQr {
        let faer_view = FaerArrayView::new(self);
        let qr = ColPivQr::new(faer_view.as_ref());

        let (m, n) = self.dim();
        let k = m.min(n);

        let q_faer = qr.compute_thin_Q();
        let q = Array2::from_shape_fn((m, k), |(i, j)| q_faer[(i, j)]);

        let r_faer = qr.R();
        let r = Array2::from_shape_fn((k, n), |(i, j)| if i <= j { r_faer[(i, j)] } else { 0.0 });

        let pivot: Vec<usize> = qr.P().arrays().0.to_vec();

        PivotedQr { q, r, pivot }
    }
}
