use approx::{assert_abs_diff_eq, assert_relative_eq};
use lmsandwich::{
    EngineConfig, EngineError, LinearModel, SolvePath, VarianceInputs, VarianceType,
    cross_product, estimate_covariance, fit_linear_model, kronecker, solve_least_squares,
};
use ndarray::{Array1, Array2, Axis, concatenate, s};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Intercept plus `k` standard-normal regressors, and `y = Xβ + σ·ε`.
fn regression(n: usize, k: usize, sigma: f64, seed: u64) -> (Array2<f64>, Array2<f64>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0).unwrap();
    let x = Array2::from_shape_fn((n, k + 1), |(_, j)| {
        if j == 0 { 1.0 } else { normal.sample(&mut rng) }
    });
    let beta = Array1::from_shape_fn(k + 1, |j| 0.5 + j as f64);
    let noise = Array1::from_shape_fn(n, |_| sigma * normal.sample(&mut rng));
    let y = (x.dot(&beta) + noise).insert_axis(Axis(1));
    (x, y)
}

fn covariance_for(
    x: &Array2<f64>,
    y: &Array2<f64>,
    kind: VarianceType,
    clusters: Option<&[usize]>,
) -> lmsandwich::CovarianceEstimate {
    let fit = solve_least_squares(x.view(), y.view(), true, None).unwrap();
    let residuals = y - &fit.fitted_values(x.view());
    estimate_covariance(&VarianceInputs {
        design: x.view(),
        unweighted_design: None,
        inverse_cross_product: fit.inverse_cross_product.view(),
        residuals: residuals.view(),
        mean_weight: 1.0,
        clusters,
        compute_dof: true,
        variance_type: kind,
        coefficient_mask: None,
        fixed_effect_rank: 0,
        rank_tolerance: None,
    })
    .unwrap()
}

#[test]
fn solver_paths_agree_on_random_full_rank_designs() {
    init_logging();
    for seed in 0..5 {
        let (x, y) = regression(80, 4, 0.7, seed);
        let chol = solve_least_squares(x.view(), y.view(), true, None).unwrap();
        let qr = solve_least_squares(x.view(), y.view(), false, None).unwrap();
        assert_eq!(chol.path, SolvePath::Cholesky);
        assert_eq!(qr.path, SolvePath::PivotedQr);
        for (a, b) in chol.coefficients.iter().zip(qr.coefficients.iter()) {
            assert_relative_eq!(a.unwrap(), b.unwrap(), max_relative = 1e-8);
        }
    }
}

#[test]
fn exact_duplicate_column_is_flagged_once() {
    init_logging();
    let (x, y) = regression(50, 3, 1.0, 9);
    let twin = x.column(1).to_owned().insert_axis(Axis(1));
    let x_dup = concatenate![Axis(1), x, twin];
    for try_cholesky in [true, false] {
        let fit = solve_least_squares(x_dup.view(), y.view(), try_cholesky, None).unwrap();
        assert_eq!(fit.rank, 4);
        let missing: Vec<usize> = fit
            .aliased()
            .iter()
            .enumerate()
            .filter_map(|(j, &a)| a.then_some(j))
            .collect();
        assert_eq!(missing.len(), 1);
        assert!(missing[0] == 1 || missing[0] == 4);
    }
}

#[test]
fn cr0_with_one_observation_per_cluster_is_hc0() {
    let (x, y) = regression(60, 2, 1.0, 10);
    let ids: Vec<usize> = (0..60).collect();
    let hc0 = covariance_for(&x, &y, VarianceType::HC0, None);
    let cr0 = covariance_for(&x, &y, VarianceType::CR0, Some(&ids));
    for (a, b) in hc0.covariance.iter().zip(cr0.covariance.iter()) {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
    }
}

#[test]
fn hc1_scales_hc0_by_observations_over_residual_dof() {
    let (x, y) = regression(45, 3, 1.0, 11);
    let hc0 = covariance_for(&x, &y, VarianceType::HC0, None);
    let hc1 = covariance_for(&x, &y, VarianceType::HC1, None);
    let scale = 45.0 / (45.0 - 4.0);
    for (a, b) in hc0.covariance.iter().zip(hc1.covariance.iter()) {
        assert_relative_eq!(a * scale, *b, max_relative = 1e-12);
    }
}

#[test]
fn cross_product_and_kronecker_kernels() {
    let mut rng = StdRng::seed_from_u64(12);
    let a = Array2::from_shape_fn((17, 6), |_| rng.gen_range(-3.0..3.0));
    let fast = cross_product(&a);
    let direct = a.t().dot(&a);
    for (p, q) in fast.iter().zip(direct.iter()) {
        assert_abs_diff_eq!(*p, *q, epsilon = 1e-10);
    }

    let m = Array2::from_shape_fn((2, 3), |(i, j)| (i * 3 + j) as f64 + 0.5);
    let kron = kronecker(&Array2::<f64>::eye(4), &m);
    assert_eq!(kron.dim(), (8, 12));
    for bi in 0..4 {
        for bj in 0..4 {
            let block = kron.slice(s![bi * 2..(bi + 1) * 2, bj * 3..(bj + 1) * 3]);
            if bi == bj {
                assert_eq!(block, m);
            } else {
                assert!(block.iter().all(|&v| v == 0.0));
            }
        }
    }
}

#[test]
fn homoskedastic_data_gives_similar_classical_and_hc0() {
    init_logging();
    let (x, y) = regression(100, 1, 1.0, 13);
    let config = |kind| EngineConfig {
        variance_type: kind,
        ..EngineConfig::default()
    };
    let model: LinearModel = LinearModel::new(x, y);
    let classical = fit_linear_model(&model, &config(VarianceType::Classical)).unwrap();
    let hc0 = fit_linear_model(&model, &config(VarianceType::HC0)).unwrap();

    let a = classical.covariance.covariance.diag().to_owned();
    let b = hc0.covariance.covariance.diag().to_owned();
    for (c, h) in a.iter().zip(b.iter()) {
        let ratio = h / c;
        assert!(ratio > 0.5 && ratio < 2.0, "HC0/classical ratio {ratio}");
    }
    assert!(classical.covariance.dof.iter().all(|d| *d == Some(98.0)));
}

#[test]
fn clustered_pipeline_with_fixed_effects_reports_satterthwaite_dof() {
    init_logging();
    let mut rng = StdRng::seed_from_u64(14);
    let normal = Normal::new(0.0, 1.0).unwrap();
    let clusters_n = 8;
    let per_cluster = 12;
    let n = clusters_n * per_cluster;

    let mut design = Array2::ones((n, 3));
    let mut outcome = Array2::zeros((n, 2));
    let mut fe = Array2::zeros((n, 1));
    let mut ids = Vec::with_capacity(n);
    for c in 0..clusters_n {
        let shock = normal.sample(&mut rng);
        for k in 0..per_cluster {
            let i = c * per_cluster + k;
            design[[i, 1]] = normal.sample(&mut rng);
            design[[i, 2]] = normal.sample(&mut rng) + 0.5 * shock;
            outcome[[i, 0]] = design[[i, 1]] - design[[i, 2]] + shock + normal.sample(&mut rng);
            outcome[[i, 1]] = 0.3 * design[[i, 1]] + normal.sample(&mut rng);
            fe[[i, 0]] = k % 3;
            ids.push(c);
        }
    }
    let weights = Array1::from_shape_fn(n, |_| rng.gen_range(0.5..2.0));
    let model = LinearModel::new(design, outcome)
        .with_intercept()
        .with_weights(weights)
        .with_fixed_effects(fe)
        .with_clusters(ids);
    let config = EngineConfig {
        variance_type: VarianceType::CR2,
        max_demean_iterations: Some(10_000),
        ..EngineConfig::default()
    };

    let fit = fit_linear_model(&model, &config).unwrap();
    assert_eq!(fit.design_columns, vec![1, 2]);
    assert_eq!(fit.rank, 2);
    assert_eq!(fit.fixed_effect_rank, 3);
    assert_eq!(fit.covariance.covariance.dim(), (4, 4));

    let dof = fit.degrees_of_freedom();
    let se = fit.standard_errors();
    for j in 0..2 {
        let first = dof[[j, 0]].unwrap();
        assert!(first > 0.0 && first <= clusters_n as f64 + 1e-8);
        assert_abs_diff_eq!(dof[[j, 1]].unwrap(), first, epsilon = 1e-10);
        for m in 0..2 {
            assert!(se[[j, m]].unwrap().is_finite());
        }
    }
}

#[test]
fn interleaved_clusters_are_rejected_by_the_pipeline() {
    let (x, y) = regression(12, 1, 1.0, 15);
    let ids: Vec<usize> = (0..12).map(|i| i % 3).collect();
    let model: LinearModel = LinearModel::new(x, y).with_clusters(ids);
    let config = EngineConfig {
        variance_type: VarianceType::Stata,
        ..EngineConfig::default()
    };
    let err = fit_linear_model(&model, &config).unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidClusterLayout {
            first_seen: 0,
            row: 3
        }
    ));
}
