// engine/variance.rs

//! # Sandwich Covariance Estimation
//!
//! Every estimator is of the form `V = B · M · B'` where the bread `B` is the
//! inverse cross-product from the solver (Kronecker-expanded with `I_ny` for
//! several outcomes) and the meat `M` depends on the estimator:
//!
//! - `classical`: `s² ⊗ (X'X)⁻¹`, no sandwich at all.
//! - `HC0`–`HC3`: one score row per observation, `x_i · e_i`, with HC2/HC3
//!   dividing the squared residual by `1 − h_ii` or `(1 − h_ii)²`.
//! - `CR0`/`stata`: one score row per cluster, `X_c' e_c`.
//! - `CR2`: as CR0 but `X_c` is replaced by `A_c X_c`, where `A_c` is the
//!   pseudo-inverse square root of the cluster block of `I − H` (Bell and
//!   McCaffrey), and degrees of freedom come from a Satterthwaite approximation.
//!
//! Leverage for HC2/HC3/CR2 is taken against the design padded with the
//! fixed-effect indicators when the caller supplies more columns than the rank
//! of the bread. The padded design is reduced to its independent columns by
//! [`padded_pseudo_inverse`], which hands back the compacted copy explicitly.
//!
//! Clustered estimators require rows sorted so that every cluster occupies one
//! contiguous range; this is checked.

use crate::errors::EngineError;
use crate::faer_ndarray::{FaerCholesky, FaerEigh};
use crate::linalg::{cross_product, kronecker, padded_pseudo_inverse};
use crate::types::{CovarianceEstimate, VarianceType};
use ahash::AHashMap;
use faer::Side;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayViewMut1, Axis, s};
use std::hash::Hash;
use std::ops::Range;

/// Eigenvalues of the CR2 adjustment matrix at or below this absolute value are
/// treated as zero when forming its inverse square root.
///
/// The threshold is absolute, so it is sensitive to the scale of the design.
pub const CR2_EIGENVALUE_THRESHOLD: f64 = 1e-12;

/// Everything the covariance estimator needs from the fit.
///
/// * `design`: `n × p` weighted design. Its first `r` columns must be the
///   independent regressors matching `inverse_cross_product`; any extra columns
///   (fixed-effect indicators) only enter the leverage computation.
/// * `unweighted_design`: the same design before `√w` scaling, used by CR2.
/// * `inverse_cross_product`: `r × r` bread from the solver.
/// * `residuals`: `n × ny`, on the same (weighted) scale as `design`.
/// * `clusters`: one id per row, each cluster contiguous. Required for the
///   clustered estimators, ignored otherwise.
/// * `coefficient_mask`: which of the `r` coefficients get CR2 degrees of
///   freedom. `None` means all of them.
/// * `fixed_effect_rank`: parameters absorbed by demeaning, added to `r` for
///   finite-sample corrections.
#[derive(Debug, Clone)]
pub struct VarianceInputs<'a, C> {
    pub design: ArrayView2<'a, f64>,
    pub unweighted_design: Option<ArrayView2<'a, f64>>,
    pub inverse_cross_product: ArrayView2<'a, f64>,
    pub residuals: ArrayView2<'a, f64>,
    pub mean_weight: f64,
    pub clusters: Option<&'a [C]>,
    pub compute_dof: bool,
    pub variance_type: VarianceType,
    pub coefficient_mask: Option<&'a [bool]>,
    pub fixed_effect_rank: usize,
    pub rank_tolerance: Option<f64>,
}

/// Splits rows into contiguous cluster ranges.
///
/// Fails if a cluster id shows up again after a different id.
pub fn cluster_ranges<C: Hash + Eq>(clusters: &[C]) -> Result<Vec<Range<usize>>, EngineError> {
    let mut first_seen: AHashMap<&C, usize> = AHashMap::new();
    let mut ranges = Vec::new();
    let mut start = 0;
    for row in 0..clusters.len() {
        if row > start && clusters[row] != clusters[start] {
            ranges.push(start..row);
            start = row;
        }
        if row == start {
            if let Some(&seen) = first_seen.get(&clusters[row]) {
                return Err(EngineError::InvalidClusterLayout {
                    first_seen: seen,
                    row,
                });
            }
            first_seen.insert(&clusters[row], row);
        }
    }
    if start < clusters.len() {
        ranges.push(start..clusters.len());
    }
    Ok(ranges)
}

/// Computes the requested covariance matrix, degrees of freedom, and residual variance.
pub fn estimate_covariance<C: Hash + Eq>(
    inputs: &VarianceInputs<'_, C>,
) -> Result<CovarianceEstimate, EngineError> {
    let design = inputs.design.view();
    let bread_inv = inputs.inverse_cross_product;
    let residuals = inputs.residuals;
    let kind = inputs.variance_type;

    let n = design.nrows();
    let r = bread_inv.ncols();
    let ny = residuals.ncols();
    let npars = r * ny;

    check_dim("inverse cross-product rows", r, bread_inv.nrows())?;
    check_dim("residual rows", n, residuals.nrows())?;
    if design.ncols() < r {
        return Err(EngineError::DimensionMismatch {
            what: "design columns",
            expected: r,
            found: design.ncols(),
        });
    }
    if let Some(mask) = inputs.coefficient_mask {
        check_dim("coefficient mask", r, mask.len())?;
    }
    if let Some(unweighted) = inputs.unweighted_design {
        check_dim("unweighted design rows", n, unweighted.nrows())?;
    }

    let ranges = if kind.is_clustered() {
        let clusters = inputs.clusters.ok_or(EngineError::MissingClusters)?;
        check_dim("cluster ids", n, clusters.len())?;
        let ranges = cluster_ranges(clusters)?;
        if ranges.len() < 2 {
            return Err(EngineError::InsufficientClusters(ranges.len()));
        }
        ranges
    } else {
        Vec::new()
    };
    let num_clusters = ranges.len();

    let mut total_rank = r + inputs.fixed_effect_rank;
    if matches!(
        kind,
        VarianceType::Classical | VarianceType::HC1 | VarianceType::Stata
    ) && n <= total_rank
    {
        return Err(EngineError::InsufficientDegreesOfFreedom {
            observations: n,
            rank: total_rank,
        });
    }

    let mut dof = Array1::from_elem(npars, None);

    if kind == VarianceType::Classical {
        let residual_variance = cross_product(&residuals) / (n as f64 - total_rank as f64);
        let covariance = kronecker(&residual_variance, &bread_inv);
        if inputs.compute_dof {
            dof.fill(Some(n as f64 - total_rank as f64));
        }
        return Ok(CovarianceEstimate {
            covariance,
            dof,
            residual_variance,
        });
    }

    let residual_variance = residuals
        .mapv(|e| e * e)
        .sum_axis(Axis(0))
        .insert_axis(Axis(1))
        / (n as f64 - total_rank as f64);

    let bread = if ny == 1 {
        bread_inv.to_owned()
    } else {
        kronecker(&Array2::<f64>::eye(ny), &bread_inv)
    };

    // Leverage-ready inverse and the design it refers to.
    let compacted: Array2<f64>;
    let mut retained: Option<Vec<usize>> = None;
    let (meat_inverse, work) = if kind.needs_padded_inverse() {
        if design.ncols() > r {
            let padded = padded_pseudo_inverse(design, inputs.rank_tolerance);
            total_rank = padded.inverse.ncols();
            compacted = padded.compacted;
            retained = Some(padded.retained);
            (padded.inverse, compacted.view())
        } else {
            (bread_inv.to_owned(), design)
        }
    } else {
        (Array2::zeros((0, 0)), design)
    };

    let half_meat = if !kind.is_clustered() {
        heteroskedastic_half_meat(kind, work, &meat_inverse, residuals, r)
    } else if kind == VarianceType::CR2 {
        let unweighted = match (inputs.unweighted_design, &retained) {
            (Some(u), Some(keep)) if u.ncols() == design.ncols() => Some(u.select(Axis(1), keep)),
            (Some(u), _) => Some(u.to_owned()),
            (None, _) => None,
        };
        let original = unweighted.as_ref().map_or(work, |u| u.view());
        let cr2 = BellMcCaffrey::new(
            work,
            original,
            &meat_inverse,
            inputs.mean_weight,
            inputs.compute_dof,
        )?;
        let (half_meat, bookkeeping) = cr2.half_meat(&ranges, residuals, r)?;
        if let Some(books) = bookkeeping {
            let mask = inputs.coefficient_mask;
            for j in 0..r {
                if mask.is_some_and(|m| !m[j]) {
                    continue;
                }
                let estimate = books.satterthwaite(j);
                for m in 0..ny {
                    dof[m * r + j] = Some(estimate);
                }
            }
        }
        half_meat
    } else {
        cluster_half_meat(&ranges, work, residuals, r)
    };

    let meat = half_meat.t().dot(&half_meat);
    let mut covariance = bread.dot(&meat).dot(&bread);

    let nf = n as f64;
    let rank_f = total_rank as f64;
    match kind {
        VarianceType::HC1 => covariance *= nf / (nf - rank_f),
        VarianceType::Stata => {
            let j = num_clusters as f64;
            covariance *= (j * (nf - 1.0)) / ((j - 1.0) * (nf - rank_f));
        }
        _ => {}
    }

    if inputs.compute_dof {
        match kind {
            VarianceType::CR2 => {}
            VarianceType::CR0 | VarianceType::Stata => {
                dof.fill(Some(num_clusters as f64 - 1.0));
            }
            _ => dof.fill(Some(nf - rank_f)),
        }
    }

    log::debug!(
        "{} covariance over {} coefficient(s), {} outcome(s), total rank {}",
        kind,
        r,
        ny,
        total_rank
    );

    Ok(CovarianceEstimate {
        covariance,
        dof,
        residual_variance,
    })
}

/// Score rows `x_i · e_im / √adj_i` stacked per outcome, `n × (r·ny)`.
fn heteroskedastic_half_meat(
    kind: VarianceType,
    work: ArrayView2<f64>,
    meat_inverse: &Array2<f64>,
    residuals: ArrayView2<f64>,
    r: usize,
) -> Array2<f64> {
    let n = work.nrows();
    let ny = residuals.ncols();

    let adjustment: Array1<f64> = match kind {
        VarianceType::HC2 | VarianceType::HC3 => {
            let k = meat_inverse.ncols();
            let leverage_cols = work.slice(s![.., ..k]);
            Array1::from_shape_fn(n, |i| {
                let xi = leverage_cols.row(i);
                let h = xi.dot(&meat_inverse.dot(&xi));
                if kind == VarianceType::HC2 {
                    1.0 - h
                } else {
                    (1.0 - h) * (1.0 - h)
                }
            })
        }
        _ => Array1::ones(n),
    };

    let mut zeroed = 0usize;
    let mut scaled = residuals.to_owned();
    for (mut row, &adj) in scaled.axis_iter_mut(Axis(0)).zip(adjustment.iter()) {
        for e in row.iter_mut() {
            let omega = *e * *e / adj;
            // Perfect fits (leverage 1) contribute nothing rather than NaN.
            *e = if omega.is_finite() && omega >= 0.0 {
                e.signum() * omega.sqrt()
            } else {
                zeroed += 1;
                0.0
            };
        }
    }
    if zeroed > 0 {
        log::warn!(
            "{} leverage-adjusted residual(s) were not finite and were set to zero",
            zeroed
        );
    }

    let regressors = work.slice(s![.., ..r]);
    let mut half_meat = Array2::zeros((n, r * ny));
    for m in 0..ny {
        let weights = scaled.column(m).insert_axis(Axis(1));
        half_meat
            .slice_mut(s![.., m * r..(m + 1) * r])
            .assign(&(&regressors * &weights));
    }
    half_meat
}

/// One score row per cluster, `X_c' e_c` for each outcome, `J × (r·ny)`.
fn cluster_half_meat(
    ranges: &[Range<usize>],
    work: ArrayView2<f64>,
    residuals: ArrayView2<f64>,
    r: usize,
) -> Array2<f64> {
    let ny = residuals.ncols();
    let mut half_meat = Array2::zeros((ranges.len(), r * ny));
    for (c, rows) in ranges.iter().enumerate() {
        let xc = work.slice(s![rows.clone(), ..r]);
        let ec = residuals.slice(s![rows.clone(), ..]);
        write_cluster_scores(half_meat.row_mut(c), ec, xc, r);
    }
    half_meat
}

/// Stacks `e_c,m' · T_c` across outcomes, equivalent to `vec(E_c)' (I_ny ⊗ T_c)`.
fn write_cluster_scores(
    mut row: ArrayViewMut1<f64>,
    ec: ArrayView2<f64>,
    transform: ArrayView2<f64>,
    r: usize,
) {
    for (m, e) in ec.axis_iter(Axis(1)).enumerate() {
        row.slice_mut(s![m * r..(m + 1) * r]).assign(&e.dot(&transform));
    }
}

/// Per-cluster bookkeeping for CR2 Satterthwaite degrees of freedom.
struct SatterthwaiteBooks {
    h1: Vec<Array2<f64>>,
    h2: Vec<Array2<f64>>,
    h3: Vec<Array2<f64>>,
    p_diags: Array2<f64>,
}

impl SatterthwaiteBooks {
    /// `tr(P)² / Σ P²` for coefficient `j`.
    fn satterthwaite(&self, j: usize) -> f64 {
        let gather = |blocks: &[Array2<f64>]| -> Array2<f64> {
            let k = blocks.first().map_or(0, |b| b.ncols());
            let mut out = Array2::zeros((k, blocks.len()));
            for (c, block) in blocks.iter().enumerate() {
                out.column_mut(c).assign(&block.row(j));
            }
            out
        };
        let h1t = gather(&self.h1);
        let h2t = gather(&self.h2);
        let h3t = gather(&self.h3);

        let uf = h1t.t().dot(&h2t);
        let mut p = h3t.t().dot(&h3t) - &uf - &uf.t();
        let diag: ArrayView1<f64> = self.p_diags.row(j);
        for (c, &d) in diag.iter().enumerate() {
            p[[c, c]] += d;
        }

        let trace = p.diag().sum();
        let squares = p.mapv(|v| v * v).sum();
        trace * trace / squares
    }
}

/// Bias-reduced linearization (CR2) for one design.
struct BellMcCaffrey<'a> {
    work: ArrayView2<'a, f64>,
    original: ArrayView2<'a, f64>,
    meat_inverse: &'a Array2<f64>,
    muwtwum: Array2<f64>,
    m_u_lower: Array2<f64>,
    omega_lower: Array2<f64>,
    mean_weight: f64,
    compute_dof: bool,
}

impl<'a> BellMcCaffrey<'a> {
    fn new(
        work: ArrayView2<'a, f64>,
        original: ArrayView2<'a, f64>,
        meat_inverse: &'a Array2<f64>,
        mean_weight: f64,
        compute_dof: bool,
    ) -> Result<Self, EngineError> {
        let k = meat_inverse.ncols();
        if original.ncols() < k {
            return Err(EngineError::DimensionMismatch {
                what: "unweighted design columns",
                expected: k,
                found: original.ncols(),
            });
        }
        let xk = work.slice_move(s![.., ..k]);
        let muwtwum = meat_inverse.dot(&cross_product(&xk)).dot(meat_inverse);
        let m_u_lower = meat_inverse.cholesky(Side::Lower)?.triangular_factor();
        let omega_lower = muwtwum.cholesky(Side::Lower)?.triangular_factor();
        Ok(Self {
            work: xk,
            original: original.slice_move(s![.., ..k]),
            meat_inverse,
            muwtwum,
            m_u_lower,
            omega_lower,
            mean_weight,
            compute_dof,
        })
    }

    /// `A_c X_c` where `A_c` is the pseudo-inverse square root of the cluster's
    /// `(I − H) − H' + U_c · MUWTWUM · U_c'` block.
    fn adjusted_transform(&self, rows: &Range<usize>) -> Result<Array2<f64>, EngineError> {
        let xc = self.work.slice(s![rows.clone(), ..]);
        let uc = self.original.slice(s![rows.clone(), ..]);
        let len = rows.len();

        // Not symmetric under weighting.
        let h = uc.dot(self.meat_inverse).dot(&xc.t());
        let adjustment =
            Array2::<f64>::eye(len) - &h - &h.t() + uc.dot(&self.muwtwum).dot(&uc.t());

        let (values, vectors) = adjustment.eigh(Side::Lower)?;
        let mut truncated = 0usize;
        let inv_sqrt = values.mapv(|v| {
            if v > CR2_EIGENVALUE_THRESHOLD {
                1.0 / v.sqrt()
            } else {
                truncated += 1;
                0.0
            }
        });
        if truncated > 0 {
            log::trace!(
                "CR2 cluster at rows {:?}: {} eigenvalue(s) truncated",
                rows,
                truncated
            );
        }

        let scaled_vectors = &vectors * &inv_sqrt.insert_axis(Axis(0));
        Ok(scaled_vectors.dot(&vectors.t()).dot(&xc))
    }

    fn half_meat(
        &self,
        ranges: &[Range<usize>],
        residuals: ArrayView2<f64>,
        r: usize,
    ) -> Result<(Array2<f64>, Option<SatterthwaiteBooks>), EngineError> {
        let ny = residuals.ncols();
        let k = self.meat_inverse.ncols();
        let num_clusters = ranges.len();
        let mut half_meat = Array2::zeros((num_clusters, r * ny));

        let mut books = self.compute_dof.then(|| SatterthwaiteBooks {
            h1: Vec::with_capacity(num_clusters),
            h2: Vec::with_capacity(num_clusters),
            h3: Vec::with_capacity(num_clusters),
            p_diags: Array2::zeros((k, num_clusters)),
        });

        let scaled_inverse = if self.mean_weight != 1.0 {
            self.meat_inverse / self.mean_weight
        } else {
            self.meat_inverse.clone()
        };

        for (c, rows) in ranges.iter().enumerate() {
            let at_wx_inv = self.adjusted_transform(rows)?;

            if let Some(books) = books.as_mut() {
                let xc = self.work.slice(s![rows.clone(), ..]);
                let uc = self.original.slice(s![rows.clone(), ..]);
                let me = scaled_inverse.dot(&at_wx_inv.t());
                books
                    .p_diags
                    .column_mut(c)
                    .assign(&me.mapv(|v| v * v).sum_axis(Axis(1)));
                let meu = me.dot(&uc);
                books.h1.push(meu.dot(&self.m_u_lower));
                books.h2.push(me.dot(&xc).dot(&self.m_u_lower));
                books.h3.push(meu.dot(&self.omega_lower));
            }

            let ec = residuals.slice(s![rows.clone(), ..]);
            write_cluster_scores(
                half_meat.row_mut(c),
                ec,
                at_wx_inv.slice(s![.., ..r]),
                r,
            );
        }

        Ok((half_meat, books))
    }
}

fn check_dim(what: &'static str, expected: usize, found: usize) -> Result<(), EngineError> {
    if expected == found {
        Ok(())
    } else {
        Err(EngineError::DimensionMismatch {
            what,
            expected,
            found,
        })
    }
}
