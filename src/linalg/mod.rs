//! Linear algebra for the bundle adjustment normal equations.
//!
//! - [`BlockSystem`]: block-sparse Gauss-Newton system (6×6 camera blocks,
//!   3×3 point blocks, 6×3 camera-point couplings)
//! - [`SchurComplementSolver`]: eliminates the point blocks and solves the
//!   reduced camera system with a sparse Cholesky factorization (faer)

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub mod schur;

pub use schur::{BlockSystem, BlockUpdate, ObservationTerm, SchurComplementSolver};

/// Linear algebra specific result type
pub type LinAlgResult<T> = Result<T, LinAlgError>;

/// Which family of parameter block a diagnostic refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Camera,
    Point,
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockKind::Camera => write!(f, "camera"),
            BlockKind::Point => write!(f, "point"),
        }
    }
}

/// Linear algebra specific error types
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LinAlgError {
    /// Matrix is singular or not positive definite
    #[error("Matrix is singular: {0}")]
    SingularMatrix(String),

    /// A specific parameter block is (numerically) unconstrained
    #[error("Singular {kind} block {index} (min eigenvalue {min_eigenvalue:.3e})")]
    SingularBlock {
        kind: BlockKind,
        index: usize,
        min_eigenvalue: f64,
    },

    #[error("Factorization failed: {0}")]
    FactorizationFailed(String),

    #[error("Failed to create sparse matrix: {0}")]
    SparseMatrixCreation(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Damping applied to the normal equations diagonal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Damping {
    /// `λ · diag(JᵀJ)` (scale invariant)
    #[default]
    Marquardt,
    /// `λ · I`
    Identity,
}
