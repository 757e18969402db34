use thiserror::Error;

/// Error type for invalid operations.
///
/// Configuration and dimension problems are reported at construction
/// time; the sampling loop itself never produces errors for ordinary
/// data degeneracy (sentinel values are used instead, see
/// [`crate::numeric`]).
#[derive(Error, Debug)]
pub enum SumcError {
    #[error("{0}")]
    Error(String),
    #[error("Dimension mismatch in {context}: expected {expected}, got {actual}")]
    DimensionMismatch {
        context: String,
        expected: usize,
        actual: usize,
    },
    #[error("Invalid value: {0}")]
    InvalidValue(String),
    #[error("Sampling error: {0}")]
    SamplingError(String),
}

/// Convenience type for `Result<T, SumcError>`.
pub type SumcResult<T> = Result<T, SumcError>;
