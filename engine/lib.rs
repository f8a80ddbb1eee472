#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod config;
pub mod demean;
pub mod errors;
pub mod faer_ndarray;
pub mod linalg;
pub mod pipeline;
pub mod solver;
pub mod types;
pub mod variance;

pub use config::{ConfigError, EngineConfig};
pub use demean::{
    DemeanOptions, DemeanedData, FixedEffectIndex, GroupIndex, demean_by_group,
    demean_fixed_effects, demean_with_index,
};
pub use errors::EngineError;
pub use linalg::{PaddedInverse, cross_product, kronecker, padded_pseudo_inverse};
pub use pipeline::{LinearFit, LinearModel, fit_linear_model, fit_many};
pub use solver::{LeastSquaresFit, solve_least_squares};
pub use types::{CovarianceEstimate, SolvePath, VarianceType};
pub use variance::{VarianceInputs, cluster_ranges, estimate_covariance};
