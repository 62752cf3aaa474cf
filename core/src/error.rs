use thiserror::Error;

/// Failures of the dense matrix routines in [`crate::linalg`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatrixError {
    #[error("{op}: dimension mismatch {left:?} vs {right:?}")]
    DimensionMismatch {
        op: &'static str,
        left: (usize, usize),
        right: (usize, usize),
    },

    #[error("{op}: matrix must be square, got {shape:?}")]
    NotSquare {
        op: &'static str,
        shape: (usize, usize),
    },

    #[error("{op}: matrix is singular or numerically degenerate")]
    Singular { op: &'static str },

    #[error("{op}: matrix contains non-finite entries")]
    NonFinite { op: &'static str },
}

/// Crate-level error type.
#[derive(Error, Debug)]
pub enum NavError {
    #[error("Matrix error: {0}")]
    Matrix(#[from] MatrixError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, NavError>;
