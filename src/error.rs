//! Error types for the apex-photogrammetry library
//!
//! This module provides the main error and result types used throughout the library.
//! All errors use the `thiserror` crate for automatic trait implementations.
//!
//! Errors fall into three groups:
//! - **Input errors** (`MalformedInput`): fatal to the requested operation.
//! - **Local geometric errors** (`DegenerateConfiguration`, `DegenerateProjection`):
//!   recovered by the engines, which mark the affected point or observation invalid.
//! - **Solver errors** (`RankDeficient`, `MaxIterationsExceeded`, `Stalled`,
//!   `NumericalOverflow`): reported to the caller with enough context to tell
//!   success-with-caveats from hard failure.

use crate::geometry::CameraModelError;
use crate::linalg::LinAlgError;
use thiserror::Error;

/// Main result type used throughout the apex-photogrammetry library
pub type PhotogrammetryResult<T> = Result<T, PhotogrammetryError>;

/// Main error type for the apex-photogrammetry library
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PhotogrammetryError {
    /// Referential or structural violation in the supplied scene or configuration
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    /// Rays of a point are (near-)parallel, the intersection is ill-conditioned
    #[error("Degenerate configuration: {0}")]
    DegenerateConfiguration(String),

    /// A point lies at or behind the camera center
    #[error("Degenerate projection: {0}")]
    DegenerateProjection(String),

    /// Normal equations singular even with saturated damping
    #[error("Rank deficient system: {0}")]
    RankDeficient(String),

    /// Iteration budget exhausted before convergence
    #[error("Maximum iterations exceeded after {iterations} iterations")]
    MaxIterationsExceeded { iterations: usize },

    /// Damping reached its ceiling without finding a descent step
    #[error("Solver stalled: {0}")]
    Stalled(String),

    /// Residuals or parameter updates became non-finite
    #[error("Numerical overflow: {0}")]
    NumericalOverflow(String),

    /// Linear algebra related errors
    #[error("Linear algebra error: {0}")]
    LinearAlgebra(String),
}

impl PhotogrammetryError {
    /// Local geometric failures are recovered by marking a point or observation invalid.
    pub fn is_geometric(&self) -> bool {
        matches!(
            self,
            PhotogrammetryError::DegenerateConfiguration(_)
                | PhotogrammetryError::DegenerateProjection(_)
        )
    }
}

// Convert module-specific errors to PhotogrammetryError

impl From<CameraModelError> for PhotogrammetryError {
    fn from(err: CameraModelError) -> Self {
        match err {
            CameraModelError::PointBehindCamera { .. } => {
                PhotogrammetryError::DegenerateProjection(err.to_string())
            }
            _ => PhotogrammetryError::MalformedInput(err.to_string()),
        }
    }
}

impl From<LinAlgError> for PhotogrammetryError {
    fn from(err: LinAlgError) -> Self {
        match err {
            LinAlgError::SingularMatrix(msg) => PhotogrammetryError::RankDeficient(msg),
            LinAlgError::SingularBlock { .. } => PhotogrammetryError::RankDeficient(err.to_string()),
            other => PhotogrammetryError::LinearAlgebra(other.to_string()),
        }
    }
}
