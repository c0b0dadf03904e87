use rayon::ThreadPoolBuildError;
use thiserror::Error;

/// An Error enum capturing the errors produced by this crate.
#[derive(Error, Debug)]
pub enum IndexError {
    /// A vector does not have the dimension the index was configured with
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    /// Rejected at construction time, never raised during operation
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    /// An operation requiring exclusive access found other users of the graph
    #[error("Concurrent state violation: {0}")]
    ConcurrentStateViolation(String),
    /// Error loading layered configuration sources
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    ThreadPoolBuildError(#[from] ThreadPoolBuildError),
}

pub type Result<T, E = IndexError> = std::result::Result<T, E>;

impl IndexError {
    pub(crate) fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Fail with `DimensionMismatch` unless `actual == expected`.
    pub fn check_dimension(expected: usize, actual: usize) -> Result<()> {
        if expected == actual {
            Ok(())
        } else {
            Err(Self::DimensionMismatch { expected, actual })
        }
    }
}
