use crate::faer_ndarray::FaerLinalgError;
use thiserror::Error;

/// A comprehensive error type for demeaning, solving, and variance estimation.
///
/// Rank deficiency is not an error: aliased columns are reported through
/// `None` coefficients.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Dimension mismatch for {what}: expected {expected}, found {found}.")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error(
        "Unknown variance type '{0}'. Expected one of: classical, HC0, HC1, HC2, HC3, CR0, CR2, stata."
    )]
    UnknownVarianceType(String),

    #[error(
        "The cluster first seen at row {first_seen} reappears at row {row} after a different cluster. Rows must be sorted so that each cluster is contiguous."
    )]
    InvalidClusterLayout { first_seen: usize, row: usize },

    #[error(
        "Fixed-effect dimension {dimension} has a group with zero total weight (first seen at row {row})."
    )]
    EmptyGroupWeight { dimension: usize, row: usize },

    #[error(
        "Demeaning of column {column} did not converge within {iterations} passes. Last change was {last_change:.6e}."
    )]
    DemeanDidNotConverge {
        column: usize,
        iterations: usize,
        last_change: f64,
    },

    #[error("Column {column} holds a missing or non-finite value at row {row}.")]
    NonFiniteValue { column: usize, row: usize },

    #[error("Observation weights must be finite and non-negative, found {value} at row {row}.")]
    InvalidWeight { row: usize, value: f64 },

    #[error("Clustered variance estimators need cluster assignments for every observation.")]
    MissingClusters,

    #[error("Clustered variance estimators need at least two clusters, found {0}.")]
    InsufficientClusters(usize),

    #[error(
        "Not enough residual degrees of freedom: {observations} observations for a total rank of {rank}."
    )]
    InsufficientDegreesOfFreedom { observations: usize, rank: usize },

    #[error("Linear algebra failure: {0}")]
    Linalg(#[from] FaerLinalgError),
}
