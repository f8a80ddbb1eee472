// engine/pipeline.rs

//! # End-to-End Linear Model Fitting
//!
//! Chains the three stages for callers that hold raw model matrices:
//!
//! 1.  **Absorb fixed effects.** Every non-intercept design column and every
//!     outcome column is demeaned within the fixed-effect groups (weighted when
//!     weights are supplied). The intercept column, if flagged, is dropped.
//! 2.  **Weight and solve.** Rows are scaled by `√w`, then the rank-aware solver
//!     fits all outcomes at once.
//! 3.  **Estimate the covariance.** Residuals `Y − Xβ` on the weighted scale and
//!     the design restricted to its independent columns go to the covariance
//!     estimator. For the leverage-based estimators (HC2, HC3, CR2) the design is
//!     padded with the weighted fixed-effect indicators so leverage accounts for
//!     the absorbed groups; the other estimators add the rank of the indicators to
//!     the regression rank instead.
//!
//! Fits share nothing, so [`fit_many`] runs a batch on the rayon pool.

use crate::config::EngineConfig;
use crate::demean::{FixedEffectIndex, check_weights, demean_with_index};
use crate::errors::EngineError;
use crate::solver::solve_least_squares;
use crate::types::{CovarianceEstimate, SolvePath};
use crate::variance::{VarianceInputs, estimate_covariance};
use ndarray::{Array1, Array2, Axis, concatenate};
use rayon::prelude::*;
use std::hash::Hash;

/// Raw inputs for one linear model.
///
/// `L` labels fixed-effect groups, `C` labels clusters.
#[derive(Debug, Clone)]
pub struct LinearModel<L = usize, C = usize> {
    /// `n × p` design. Column 0 is the intercept when `has_intercept` is set.
    pub design: Array2<f64>,
    /// `n × ny` outcomes fit jointly.
    pub outcome: Array2<f64>,
    pub has_intercept: bool,
    pub weights: Option<Array1<f64>>,
    /// `n × k`, one column per fixed-effect dimension.
    pub fixed_effects: Option<Array2<L>>,
    /// One id per row, each cluster contiguous.
    pub clusters: Option<Vec<C>>,
    /// Which design columns get degrees of freedom under CR2. Length `p`.
    pub coefficient_mask: Option<Vec<bool>>,
}

impl<L, C> LinearModel<L, C> {
    pub fn new(design: Array2<f64>, outcome: Array2<f64>) -> Self {
        Self {
            design,
            outcome,
            has_intercept: false,
            weights: None,
            fixed_effects: None,
            clusters: None,
            coefficient_mask: None,
        }
    }

    pub fn with_intercept(mut self) -> Self {
        self.has_intercept = true;
        self
    }

    pub fn with_weights(mut self, weights: Array1<f64>) -> Self {
        self.weights = Some(weights);
        self
    }

    pub fn with_fixed_effects(mut self, groups: Array2<L>) -> Self {
        self.fixed_effects = Some(groups);
        self
    }

    pub fn with_clusters(mut self, clusters: Vec<C>) -> Self {
        self.clusters = Some(clusters);
        self
    }

    pub fn with_coefficient_mask(mut self, mask: Vec<bool>) -> Self {
        self.coefficient_mask = Some(mask);
        self
    }
}

/// Result of [`fit_linear_model`].
#[derive(Debug, Clone)]
pub struct LinearFit {
    /// Original design indices of the fitted columns. Excludes the intercept
    /// when fixed effects absorbed it.
    pub design_columns: Vec<usize>,
    /// `design_columns.len() × ny`; `None` for aliased columns.
    pub coefficients: Array2<Option<f64>>,
    /// Positions (into `design_columns`) of the non-aliased coefficients, which
    /// index the blocks of `covariance.covariance`.
    pub retained: Vec<usize>,
    /// Fitted values and residuals on the demeaned, unweighted scale.
    pub fitted_values: Array2<f64>,
    pub residuals: Array2<f64>,
    pub covariance: CovarianceEstimate,
    pub rank: usize,
    pub fixed_effect_rank: usize,
    pub path: SolvePath,
}

impl LinearFit {
    /// Standard errors laid out like `coefficients`; `None` for aliased columns.
    pub fn standard_errors(&self) -> Array2<Option<f64>> {
        let (p, ny) = self.coefficients.dim();
        let r = self.retained.len();
        let se = self.covariance.standard_errors();
        let mut out = Array2::from_elem((p, ny), None);
        for (k, &col) in self.retained.iter().enumerate() {
            for m in 0..ny {
                out[[col, m]] = Some(se[m * r + k]);
            }
        }
        out
    }

    /// Degrees of freedom laid out like `coefficients`.
    pub fn degrees_of_freedom(&self) -> Array2<Option<f64>> {
        let (p, ny) = self.coefficients.dim();
        let r = self.retained.len();
        let mut out = Array2::from_elem((p, ny), None);
        for (k, &col) in self.retained.iter().enumerate() {
            for m in 0..ny {
                out[[col, m]] = self.covariance.dof[m * r + k];
            }
        }
        out
    }
}

/// Demeans, solves, and estimates the covariance of one model.
pub fn fit_linear_model<L, C>(
    model: &LinearModel<L, C>,
    config: &EngineConfig,
) -> Result<LinearFit, EngineError>
where
    L: Hash + Eq,
    C: Hash + Eq,
{
    let n = model.design.nrows();
    check_rows("outcome rows", n, model.outcome.nrows())?;
    if let Some(clusters) = &model.clusters {
        check_rows("cluster ids", n, clusters.len())?;
    }
    if let Some(mask) = &model.coefficient_mask {
        check_rows("coefficient mask", model.design.ncols(), mask.len())?;
    }

    let weights = match &model.weights {
        Some(w) => {
            check_rows("weights", n, w.len())?;
            check_weights(w.view())?;
            w.clone()
        }
        None => Array1::ones(n),
    };
    let weighted = model.weights.is_some();

    log::info!(
        "Fitting {} observations, {} design columns, {} outcome(s) with {} covariance",
        n,
        model.design.ncols(),
        model.outcome.ncols(),
        config.variance_type
    );

    let index = model
        .fixed_effects
        .as_ref()
        .map(|groups| FixedEffectIndex::new(groups.view()));

    let (design, outcome, design_columns) = match &index {
        Some(index) => {
            let demeaned = demean_with_index(
                index,
                model.outcome.view(),
                model.design.view(),
                None,
                weights.view(),
                model.has_intercept,
                &config.demean_options(),
            )?;
            let first = usize::from(model.has_intercept);
            let columns: Vec<usize> = (first..model.design.ncols()).collect();
            (demeaned.design, demeaned.outcome, columns)
        }
        None => (
            model.design.clone(),
            model.outcome.clone(),
            (0..model.design.ncols()).collect(),
        ),
    };
    let fixed_effect_rank = index
        .as_ref()
        .map_or(0, |index| index.rank(config.rank_tolerance));

    let sqrt_w = weights.mapv(f64::sqrt).insert_axis(Axis(1));
    let (design_w, outcome_w) = if weighted {
        (&design * &sqrt_w, &outcome * &sqrt_w)
    } else {
        (design.clone(), outcome.clone())
    };

    let fit = solve_least_squares(
        design_w.view(),
        outcome_w.view(),
        config.try_cholesky,
        config.rank_tolerance,
    )?;
    let residuals_w = &outcome_w - &fit.fitted_values(design_w.view());

    let mut restricted_w = design_w.select(Axis(1), &fit.retained);
    let mut restricted = design.select(Axis(1), &fit.retained);
    if let Some(index) = index
        .as_ref()
        .filter(|_| config.variance_type.needs_padded_inverse())
    {
        let dummies = index.dummies();
        let dummies_w = &dummies * &sqrt_w;
        restricted_w = concatenate![Axis(1), restricted_w, dummies_w];
        restricted = concatenate![Axis(1), restricted, dummies];
    }

    // Mask is over the raw design; the estimator wants it over retained columns.
    let mask: Option<Vec<bool>> = model.coefficient_mask.as_ref().map(|mask| {
        fit.retained
            .iter()
            .map(|&k| mask[design_columns[k]])
            .collect()
    });

    let covariance = estimate_covariance(&VarianceInputs {
        design: restricted_w.view(),
        unweighted_design: weighted.then(|| restricted.view()),
        inverse_cross_product: fit.inverse_cross_product.view(),
        residuals: residuals_w.view(),
        mean_weight: weights.mean().unwrap_or(1.0),
        clusters: model.clusters.as_deref(),
        compute_dof: config.compute_dof,
        variance_type: config.variance_type,
        coefficient_mask: mask.as_deref(),
        fixed_effect_rank,
        rank_tolerance: config.rank_tolerance,
    })?;

    let fitted_values = fit.fitted_values(design.view());
    let residuals = &outcome - &fitted_values;

    log::info!(
        "Fit complete: rank {} of {} ({:?}), fixed-effect rank {}",
        fit.rank,
        design.ncols(),
        fit.path,
        fixed_effect_rank
    );

    Ok(LinearFit {
        design_columns,
        coefficients: fit.coefficients,
        retained: fit.retained,
        fitted_values,
        residuals,
        covariance,
        rank: fit.rank,
        fixed_effect_rank,
        path: fit.path,
    })
}

/// Fits independent models concurrently. Results keep the input order.
pub fn fit_many<L, C>(
    models: &[LinearModel<L, C>],
    config: &EngineConfig,
) -> Vec<Result<LinearFit, EngineError>>
where
    L: Hash + Eq + Sync,
    C: Hash + Eq + Sync,
{
    models
        .par_iter()
        .map(|model| fit_linear_model(model, config))
        .collect()
}

fn check_rows(what: &'static str, expected: usize, found: usize) -> Result<(), EngineError> {
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
    use crate::types::VarianceType;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, Array2};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn panel(groups: usize, per_group: usize, seed: u64) -> LinearModel<usize, usize> {
        let mut rng = StdRng::seed_from_u64(seed);
        let n = groups * per_group;
        let effects: Vec<f64> = (0..groups).map(|_| rng.gen_range(-5.0..5.0)).collect();
        let mut design = Array2::ones((n, 2));
        let mut outcome = Array2::zeros((n, 1));
        let mut fe = Array2::zeros((n, 1));
        for i in 0..n {
            let g = i / per_group;
            let x = rng.gen_range(-1.0..1.0) + 0.3 * effects[g];
            design[[i, 1]] = x;
            outcome[[i, 0]] = 2.0 * x + effects[g] + 0.2 * rng.gen_range(-1.0..1.0);
            fe[[i, 0]] = g;
        }
        LinearModel::new(design, outcome)
            .with_intercept()
            .with_fixed_effects(fe)
    }

    fn dummy_regression(model: &LinearModel<usize, usize>) -> LinearModel<usize, usize> {
        let fe = model.fixed_effects.as_ref().unwrap();
        let index = FixedEffectIndex::new(fe.view());
        let x = model.design.column(1).to_owned().insert_axis(Axis(1));
        let design = concatenate![Axis(1), x, index.dummies()];
        LinearModel::new(design, model.outcome.clone())
    }

    #[test]
    fn absorbed_fixed_effects_match_dummy_regression() {
        let model = panel(6, 10, 1);
        let config = EngineConfig {
            variance_type: VarianceType::HC1,
            ..EngineConfig::default()
        };
        let absorbed = fit_linear_model(&model, &config).unwrap();
        assert_eq!(absorbed.design_columns, vec![1]);
        assert_eq!(absorbed.fixed_effect_rank, 6);

        let explicit = fit_linear_model(&dummy_regression(&model), &config).unwrap();
        assert_abs_diff_eq!(
            absorbed.coefficients[[0, 0]].unwrap(),
            explicit.coefficients[[0, 0]].unwrap(),
            epsilon = 1e-7
        );
        let se_absorbed = absorbed.standard_errors()[[0, 0]].unwrap();
        let se_explicit = explicit.standard_errors()[[0, 0]].unwrap();
        assert_abs_diff_eq!(se_absorbed, se_explicit, epsilon = 1e-7);
        assert_eq!(
            absorbed.degrees_of_freedom()[[0, 0]],
            explicit.degrees_of_freedom()[[0, 0]]
        );
    }

    #[test]
    fn hc2_padding_matches_dummy_regression_leverage() {
        let model = panel(5, 8, 2);
        let config = EngineConfig {
            variance_type: VarianceType::HC2,
            ..EngineConfig::default()
        };
        let absorbed = fit_linear_model(&model, &config).unwrap();
        let explicit = fit_linear_model(&dummy_regression(&model), &config).unwrap();
        assert_abs_diff_eq!(
            absorbed.standard_errors()[[0, 0]].unwrap(),
            explicit.standard_errors()[[0, 0]].unwrap(),
            epsilon = 1e-7
        );
    }

    #[test]
    fn unit_weights_match_unweighted_fit() {
        let model = panel(4, 6, 3);
        let n = model.design.nrows();
        let weighted = model.clone().with_weights(Array1::ones(n));
        let config = EngineConfig::default();
        let a = fit_linear_model(&model, &config).unwrap();
        let b = fit_linear_model(&weighted, &config).unwrap();
        for (x, y) in a
            .covariance
            .covariance
            .iter()
            .zip(b.covariance.covariance.iter())
        {
            assert_abs_diff_eq!(*x, *y, epsilon = 1e-10);
        }
    }

    #[test]
    fn negative_weight_is_rejected() {
        let model = panel(3, 4, 4);
        let mut w = Array1::ones(12);
        w[5] = -1.0;
        let err = fit_linear_model(&model.with_weights(w), &EngineConfig::default()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidWeight { row: 5, .. }));
    }

    #[test]
    fn fit_many_preserves_order() {
        let models: Vec<_> = (0..4).map(|seed| panel(3, 10, seed)).collect();
        let config = EngineConfig::default();
        let batch = fit_many(&models, &config);
        for (model, result) in models.iter().zip(batch) {
            let alone = fit_linear_model(model, &config).unwrap();
            let fit = result.unwrap();
            assert_eq!(fit.coefficients, alone.coefficients);
        }
    }
}
