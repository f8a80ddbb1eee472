//! # Fixed-Effect Absorption
//!
//! Removes the (weighted) means of one or more categorical groupings from
//! numeric columns. With a single grouping this is one projection. With several,
//! the single-dimension projection is applied to each grouping in turn and full
//! passes are repeated until the Euclidean norm of the change over one pass drops
//! below the tolerance (alternating projections).
//!
//! Group labels are opaque: only `Hash + Eq` is required. Each dimension is
//! indexed once into dense level codes so repeated passes only touch flat
//! accumulator arrays.
//!
//! Convergence is not bounded by default. Weighted, non-nested groupings can in
//! principle stall; `DemeanOptions::max_iterations` turns that into an error
//! instead of a hang.

use crate::errors::EngineError;
use crate::faer_ndarray::FaerColPivQr;
use ahash::AHashMap;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use std::hash::Hash;

/// Convergence controls for multi-dimension demeaning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DemeanOptions {
    pub tolerance: f64,
    pub max_iterations: Option<usize>,
}

impl Default for DemeanOptions {
    fn default() -> Self {
        Self {
            tolerance: 1e-8,
            max_iterations: None,
        }
    }
}

/// Dense level codes for a single grouping column.
#[derive(Debug, Clone)]
pub struct GroupIndex {
    codes: Vec<usize>,
    first_rows: Vec<usize>,
}

impl GroupIndex {
    pub fn from_labels<L: Hash + Eq>(labels: ArrayView1<L>) -> Self {
        let mut lookup: AHashMap<&L, usize> = AHashMap::with_capacity(labels.len() / 4 + 1);
        let mut codes = Vec::with_capacity(labels.len());
        let mut first_rows = Vec::new();
        for (row, label) in labels.iter().enumerate() {
            let next = first_rows.len();
            let code = *lookup.entry(label).or_insert(next);
            if code == next {
                first_rows.push(row);
            }
            codes.push(code);
        }
        Self { codes, first_rows }
    }

    pub fn num_levels(&self) -> usize {
        self.first_rows.len()
    }

    pub fn codes(&self) -> &[usize] {
        &self.codes
    }

    /// Sum of weights per level.
    fn level_weights(&self, weights: ArrayView1<f64>) -> Vec<f64> {
        let mut totals = vec![0.0; self.num_levels()];
        for (&code, &w) in self.codes.iter().zip(weights.iter()) {
            totals[code] += w;
        }
        totals
    }

    /// Subtracts the weighted level mean from every value.
    ///
    /// One pass accumulates `(Σ w·x, Σ w)` per level, a second pass subtracts the
    /// ratio. A level with zero total weight yields non-finite output; callers
    /// that go through [`FixedEffectIndex`] have already rejected that case.
    pub fn demean(&self, values: ArrayView1<f64>, weights: ArrayView1<f64>) -> Array1<f64> {
        let mut sums = vec![[0.0_f64; 2]; self.num_levels()];
        for ((&code, &x), &w) in self.codes.iter().zip(values.iter()).zip(weights.iter()) {
            let acc = &mut sums[code];
            acc[0] += w * x;
            acc[1] += w;
        }
        self.codes
            .iter()
            .zip(values.iter())
            .map(|(&code, &x)| {
                let [weighted_sum, weight] = sums[code];
                x - weighted_sum / weight
            })
            .collect()
    }
}

/// Subtracts the weighted group mean of `labels` from `values`.
pub fn demean_by_group<L: Hash + Eq>(
    values: ArrayView1<f64>,
    labels: ArrayView1<L>,
    weights: ArrayView1<f64>,
) -> Result<Array1<f64>, EngineError> {
    let n = values.len();
    check_len("group labels", n, labels.len())?;
    check_len("weights", n, weights.len())?;
    check_weights(weights)?;
    check_finite(values, 0)?;
    let index = GroupIndex::from_labels(labels);
    reject_empty_levels(&index, weights, 0)?;
    Ok(index.demean(values, weights))
}

/// Indexed fixed-effect groupings, one [`GroupIndex`] per dimension.
#[derive(Debug, Clone)]
pub struct FixedEffectIndex {
    dimensions: Vec<GroupIndex>,
    nobs: usize,
}

impl FixedEffectIndex {
    /// Indexes an `n × k` matrix of group labels, one column per dimension.
    pub fn new<L: Hash + Eq>(groups: ArrayView2<L>) -> Self {
        let dimensions = groups
            .axis_iter(Axis(1))
            .map(GroupIndex::from_labels)
            .collect();
        Self {
            dimensions,
            nobs: groups.nrows(),
        }
    }

    pub fn nobs(&self) -> usize {
        self.nobs
    }

    pub fn dimensions(&self) -> &[GroupIndex] {
        &self.dimensions
    }

    pub fn total_levels(&self) -> usize {
        self.dimensions.iter().map(GroupIndex::num_levels).sum()
    }

    /// Fails on a negative or non-finite weight, or if any level of any
    /// dimension carries zero total weight.
    pub fn validate_weights(&self, weights: ArrayView1<f64>) -> Result<(), EngineError> {
        check_len("weights", self.nobs, weights.len())?;
        check_weights(weights)?;
        for (dimension, index) in self.dimensions.iter().enumerate() {
            reject_empty_levels(index, weights, dimension)?;
        }
        Ok(())
    }

    /// Demeans one column against every dimension until a full pass changes it
    /// by less than `options.tolerance` in Euclidean norm.
    ///
    /// `column_id` labels the column in a non-convergence or non-finite value
    /// error. Weights are taken as already validated.
    pub fn demean_column(
        &self,
        values: ArrayView1<f64>,
        weights: ArrayView1<f64>,
        options: &DemeanOptions,
        column_id: usize,
    ) -> Result<Array1<f64>, EngineError> {
        check_finite(values, column_id)?;
        let mut current = values.to_owned();
        if self.dimensions.is_empty() {
            return Ok(current);
        }
        let mut passes = 0usize;
        loop {
            let previous = current.clone();
            for index in &self.dimensions {
                current = index.demean(current.view(), weights);
            }
            passes += 1;

            let change = (&previous - &current).mapv(|d| d * d).sum().sqrt();
            // A NaN change also stops here.
            if !(change >= options.tolerance) {
                log::trace!("Column {} converged after {} passes", column_id, passes);
                return Ok(current);
            }
            if let Some(max) = options.max_iterations {
                if passes >= max {
                    return Err(EngineError::DemeanDidNotConverge {
                        column: column_id,
                        iterations: passes,
                        last_change: change,
                    });
                }
            }
        }
    }

    /// `n × Σ levels` indicator matrix, dimensions in order, levels in first-seen order.
    pub fn dummies(&self) -> Array2<f64> {
        let mut out = Array2::zeros((self.nobs, self.total_levels()));
        let mut offset = 0;
        for index in &self.dimensions {
            for (row, &code) in index.codes.iter().enumerate() {
                out[[row, offset + code]] = 1.0;
            }
            offset += index.num_levels();
        }
        out
    }

    /// Numerical rank of the indicator matrix: the number of parameters the
    /// fixed effects absorb.
    pub fn rank(&self, rank_tolerance: Option<f64>) -> usize {
        if self.dimensions.is_empty() {
            return 0;
        }
        self.dummies().pivoted_qr().rank(rank_tolerance)
    }
}

/// Numeric blocks after fixed-effect absorption.
///
/// When the design carried an intercept in column 0, that column is dropped
/// from `design` (and from `instruments`): the fixed effects absorb it.
#[derive(Debug, Clone)]
pub struct DemeanedData {
    pub outcome: Array2<f64>,
    pub design: Array2<f64>,
    pub instruments: Option<Array2<f64>>,
}

/// Absorbs the fixed effects in `groups` from every non-intercept design column,
/// every outcome column, and every non-intercept instrument column.
///
/// Columns are independent and processed in parallel. In a non-convergence
/// error, columns are numbered design first, then outcomes, then instruments.
#[allow(clippy::too_many_arguments)]
pub fn demean_fixed_effects<L: Hash + Eq>(
    outcome: ArrayView2<f64>,
    design: ArrayView2<f64>,
    instruments: Option<ArrayView2<f64>>,
    groups: ArrayView2<L>,
    weights: ArrayView1<f64>,
    has_intercept: bool,
    options: &DemeanOptions,
) -> Result<DemeanedData, EngineError> {
    let index = FixedEffectIndex::new(groups);
    demean_with_index(
        &index,
        outcome,
        design,
        instruments,
        weights,
        has_intercept,
        options,
    )
}

/// As [`demean_fixed_effects`], reusing an already built index.
pub fn demean_with_index(
    index: &FixedEffectIndex,
    outcome: ArrayView2<f64>,
    design: ArrayView2<f64>,
    instruments: Option<ArrayView2<f64>>,
    weights: ArrayView1<f64>,
    has_intercept: bool,
    options: &DemeanOptions,
) -> Result<DemeanedData, EngineError> {
    let n = design.nrows();
    check_len("outcome rows", n, outcome.nrows())?;
    check_len("fixed-effect rows", n, index.nobs())?;
    if let Some(z) = &instruments {
        check_len("instrument rows", n, z.nrows())?;
    }
    index.validate_weights(weights)?;

    let start_col = usize::from(has_intercept);
    let design_cols = design.ncols().saturating_sub(start_col);
    let instrument_cols = instruments
        .as_ref()
        .map_or(0, |z| z.ncols().saturating_sub(start_col));

    let mut columns: Vec<ArrayView1<f64>> = Vec::with_capacity(design_cols + outcome.ncols());
    columns.extend(design.axis_iter(Axis(1)).skip(start_col));
    columns.extend(outcome.axis_iter(Axis(1)));
    if let Some(z) = &instruments {
        columns.extend(z.axis_iter(Axis(1)).skip(start_col));
    }

    log::debug!(
        "Absorbing {} fixed-effect dimension(s) ({} levels) from {} columns",
        index.dimensions().len(),
        index.total_levels(),
        columns.len()
    );

    let demeaned: Vec<Array1<f64>> = columns
        .into_par_iter()
        .enumerate()
        .map(|(column_id, column)| index.demean_column(column, weights, options, column_id))
        .collect::<Result<_, _>>()?;

    let mut blocks = demeaned.into_iter();
    let design_out = stack_columns(n, design_cols, &mut blocks);
    let outcome_out = stack_columns(n, outcome.ncols(), &mut blocks);
    let instruments_out = instruments.map(|_| stack_columns(n, instrument_cols, &mut blocks));

    Ok(DemeanedData {
        outcome: outcome_out,
        design: design_out,
        instruments: instruments_out,
    })
}

fn stack_columns(
    nrows: usize,
    ncols: usize,
    columns: &mut impl Iterator<Item = Array1<f64>>,
) -> Array2<f64> {
    let mut out = Array2::zeros((nrows, ncols));
    for (mut target, column) in out.axis_iter_mut(Axis(1)).zip(columns.take(ncols)) {
        target.assign(&column);
    }
    out
}

/// Rejects negative and non-finite observation weights.
pub(crate) fn check_weights(weights: ArrayView1<f64>) -> Result<(), EngineError> {
    match weights
        .iter()
        .position(|&w| !(w.is_finite() && w >= 0.0))
    {
        Some(row) => Err(EngineError::InvalidWeight {
            row,
            value: weights[row],
        }),
        None => Ok(()),
    }
}

fn check_finite(values: ArrayView1<f64>, column: usize) -> Result<(), EngineError> {
    match values.iter().position(|v| !v.is_finite()) {
        Some(row) => Err(EngineError::NonFiniteValue { column, row }),
        None => Ok(()),
    }
}

fn reject_empty_levels(
    index: &GroupIndex,
    weights: ArrayView1<f64>,
    dimension: usize,
) -> Result<(), EngineError> {
    let totals = index.level_weights(weights);
    match totals.iter().position(|&total| total == 0.0) {
        Some(level) => Err(EngineError::EmptyGroupWeight {
            dimension,
            row: index.first_rows[level],
        }),
        None => Ok(()),
    }
}

fn check_len(what: &'static str, expected: usize, found: usize) -> Result<(), EngineError> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, Array2, array};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn weighted_group_means(
        values: &Array1<f64>,
        index: &GroupIndex,
        weights: &Array1<f64>,
    ) -> Vec<f64> {
        let mut sums = vec![(0.0, 0.0); index.num_levels()];
        for (i, &code) in index.codes().iter().enumerate() {
            sums[code].0 += weights[i] * values[i];
            sums[code].1 += weights[i];
        }
        sums.into_iter().map(|(s, w)| s / w).collect()
    }

    #[test]
    fn single_dimension_group_means_are_zero() {
        let values = array![1.0, 2.0, 3.0, 10.0, 20.0, 5.0];
        let labels = array!["a", "a", "b", "b", "c", "c"];
        let weights = array![1.0, 3.0, 0.5, 0.5, 2.0, 1.0];
        let out = demean_by_group(values.view(), labels.view(), weights.view()).unwrap();

        let index = GroupIndex::from_labels(labels.view());
        for mean in weighted_group_means(&out, &index, &weights) {
            assert_abs_diff_eq!(mean, 0.0, epsilon = 1e-12);
        }
        // Group "a": weighted mean (1 + 6) / 4 = 1.75.
        assert_abs_diff_eq!(out[0], 1.0 - 1.75, epsilon = 1e-12);
        assert_abs_diff_eq!(out[1], 2.0 - 1.75, epsilon = 1e-12);
    }

    #[test]
    fn labels_need_not_be_sorted_or_ordered() {
        let values = array![4.0, 1.0, 6.0, 3.0];
        let labels = array![7_u64, 2, 7, 2];
        let weights = Array1::ones(4);
        let out = demean_by_group(values.view(), labels.view(), weights.view()).unwrap();
        assert_eq!(out, array![-1.0, -1.0, 1.0, 1.0]);
    }

    #[test]
    fn zero_weight_group_is_rejected() {
        let values = array![1.0, 2.0, 3.0];
        let labels = array![0, 1, 1];
        let weights = array![0.0, 1.0, 1.0];
        let err = demean_by_group(values.view(), labels.view(), weights.view()).unwrap_err();
        assert!(matches!(
            err,
            EngineError::EmptyGroupWeight {
                dimension: 0,
                row: 0
            }
        ));
    }

    #[test]
    fn demeaning_is_idempotent() {
        let mut rng = StdRng::seed_from_u64(3);
        let n = 60;
        let groups = Array2::from_shape_fn((n, 2), |(i, j)| if j == 0 { i % 5 } else { (i * 7) % 4 });
        let weights = Array1::from_shape_fn(n, |_| rng.gen_range(0.5..2.0));
        let values = Array1::from_shape_fn(n, |_| rng.gen_range(-3.0..3.0));
        let options = DemeanOptions {
            tolerance: 1e-10,
            max_iterations: Some(10_000),
        };

        let index = FixedEffectIndex::new(groups.view());
        let once = index
            .demean_column(values.view(), weights.view(), &options, 0)
            .unwrap();
        let twice = index
            .demean_column(once.view(), weights.view(), &options, 0)
            .unwrap();
        let change = (&once - &twice).mapv(|d| d * d).sum().sqrt();
        assert!(change < 1e-8, "re-demeaning moved values by {change}");
    }

    #[test]
    fn intercept_column_is_dropped_from_design_and_instruments() {
        let n = 6;
        let design = Array2::from_shape_fn((n, 3), |(i, j)| if j == 0 { 1.0 } else { (i * (j + 1)) as f64 });
        let instruments = Array2::from_shape_fn((n, 2), |(i, j)| if j == 0 { 1.0 } else { (i * i) as f64 });
        let outcome = Array2::from_shape_fn((n, 2), |(i, j)| (i + j) as f64);
        let groups = Array2::from_shape_fn((n, 1), |(i, _)| i / 3);
        let weights = Array1::ones(n);

        let out = demean_fixed_effects(
            outcome.view(),
            design.view(),
            Some(instruments.view()),
            groups.view(),
            weights.view(),
            true,
            &DemeanOptions::default(),
        )
        .unwrap();

        assert_eq!(out.design.dim(), (n, 2));
        assert_eq!(out.outcome.dim(), (n, 2));
        assert_eq!(out.instruments.as_ref().map(|z| z.dim()), Some((n, 1)));
        // Column 1 of the design is i * 2; group {0,1,2} has mean 2.
        assert_abs_diff_eq!(out.design[[0, 0]], -2.0, epsilon = 1e-12);
        // Instrument i²: group {3,4,5} has mean 50/3.
        assert_abs_diff_eq!(out.instruments.unwrap()[[5, 0]], 25.0 - 50.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn mismatched_group_rows_are_rejected() {
        let design = Array2::<f64>::zeros((4, 1));
        let outcome = Array2::<f64>::zeros((4, 1));
        let groups = Array2::from_elem((3, 1), 0_i32);
        let weights = Array1::ones(4);
        let err = demean_fixed_effects(
            outcome.view(),
            design.view(),
            None,
            groups.view(),
            weights.view(),
            false,
            &DemeanOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            EngineError::DimensionMismatch {
                expected: 4,
                found: 3,
                ..
            }
        ));
    }

    #[test]
    fn iteration_cap_reports_non_convergence() {
        let mut rng = StdRng::seed_from_u64(19);
        let n = 40;
        let groups = Array2::from_shape_fn((n, 2), |(i, j)| if j == 0 { i % 4 } else { (i / 3) % 5 });
        let weights = Array1::from_shape_fn(n, |_| rng.gen_range(0.1..3.0));
        let values = Array1::from_shape_fn(n, |_| rng.gen_range(-1.0..1.0));
        let options = DemeanOptions {
            tolerance: 0.0,
            max_iterations: Some(3),
        };
        let index = FixedEffectIndex::new(groups.view());
        let err = index
            .demean_column(values.view(), weights.view(), &options, 5)
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::DemeanDidNotConverge {
                column: 5,
                iterations: 3,
                ..
            }
        ));
    }

    #[test]
    fn missing_value_stops_demeaning_without_a_cap() {
        let groups = array![[0, 0], [0, 1], [1, 0], [1, 1], [2, 0], [2, 1]];
        let index = FixedEffectIndex::new(groups.view());
        let values = array![1.0, f64::NAN, 3.0, 4.0, 5.0, 6.0];
        let weights = Array1::ones(6);
        let err = index
            .demean_column(values.view(), weights.view(), &DemeanOptions::default(), 2)
            .unwrap_err();
        assert!(matches!(err, EngineError::NonFiniteValue { column: 2, row: 1 }));

        let labels = array![0, 0, 1, 1, 2, 2];
        let err = demean_by_group(values.view(), labels.view(), weights.view()).unwrap_err();
        assert!(matches!(err, EngineError::NonFiniteValue { column: 0, row: 1 }));
    }

    #[test]
    fn nan_weight_is_rejected_before_any_pass() {
        let groups = array![[0, 0], [0, 1], [1, 0], [1, 1]];
        let index = FixedEffectIndex::new(groups.view());
        let weights = array![1.0, 1.0, f64::NAN, 1.0];
        let err = index.validate_weights(weights.view()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidWeight { row: 2, .. }));

        let design = Array2::from_shape_fn((4, 1), |(i, _)| i as f64);
        let outcome = Array2::from_shape_fn((4, 1), |(i, _)| (i * i) as f64);
        let err = demean_with_index(
            &index,
            outcome.view(),
            design.view(),
            None,
            weights.view(),
            false,
            &DemeanOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidWeight { row: 2, .. }));

        let negative = array![1.0, -0.5, 1.0, 1.0];
        let labels = array![0, 0, 1, 1];
        let err = demean_by_group(design.column(0), labels.view(), negative.view()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidWeight { row: 1, .. }));
    }

    #[test]
    fn nan_weight_passed_straight_to_a_column_still_returns() {
        let groups = array![[0, 0], [0, 1], [1, 0], [1, 1]];
        let index = FixedEffectIndex::new(groups.view());
        let values = array![1.0, 2.0, 3.0, 5.0];
        let weights = array![1.0, f64::NAN, 1.0, 1.0];
        let out = index
            .demean_column(values.view(), weights.view(), &DemeanOptions::default(), 0)
            .unwrap();
        assert!(out.iter().any(|v| v.is_nan()));
    }

    #[test]
    fn dummies_and_rank_for_two_dimensions() {
        let groups = array![[0, 0], [0, 1], [1, 0], [1, 1], [2, 1]];
        let index = FixedEffectIndex::new(groups.view());
        let dummies = index.dummies();
        assert_eq!(dummies.dim(), (5, 5));
        for row in dummies.axis_iter(Axis(0)) {
            assert_abs_diff_eq!(row.sum(), 2.0);
        }
        // Both dimensions span the constant: one redundant indicator.
        assert_eq!(index.rank(None), 4);
    }
}
