//! Bundle adjustment by sparse Levenberg-Marquardt.
//!
//! The solver jointly refines free camera poses and valid point positions by
//! minimizing `½ Σ wᵢ ‖rᵢ‖²` over all usable observations, using the Schur
//! complement to eliminate the point blocks at every iteration.

use crate::error::{PhotogrammetryError, PhotogrammetryResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub mod levenberg_marquardt;

pub use levenberg_marquardt::{BundleAdjuster, BundleAdjustmentConfig};

/// Why the solver stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationReason {
    /// Relative cost decrease fell below `cost_tolerance`
    CostTolerance,
    /// An accepted step was shorter than `step_tolerance`
    StepTolerance,
    /// Iteration budget exhausted
    MaxIterations,
    /// Damping saturated or too many consecutive rejected steps
    Stalled,
    /// Wall-clock budget exhausted
    Timeout,
    /// Reduced system not factorizable even with saturated damping
    RankDeficient,
    /// Non-finite normal equations, cost or step
    NumericalOverflow,
}

impl TerminationReason {
    pub fn is_converged(&self) -> bool {
        matches!(
            self,
            TerminationReason::CostTolerance | TerminationReason::StepTolerance
        )
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::CostTolerance => write!(f, "Converged (cost tolerance reached)"),
            TerminationReason::StepTolerance => write!(f, "Converged (step tolerance reached)"),
            TerminationReason::MaxIterations => write!(f, "Maximum iterations reached"),
            TerminationReason::Stalled => write!(f, "Stalled"),
            TerminationReason::Timeout => write!(f, "Timeout"),
            TerminationReason::RankDeficient => write!(f, "Rank deficient"),
            TerminationReason::NumericalOverflow => write!(f, "Numerical overflow"),
        }
    }
}

/// One trial step of the solver.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    /// Outer iteration (linearization) index
    pub iteration: usize,
    /// Cost after the trial: the new cost if accepted, the trial cost otherwise
    pub cost: f64,
    /// Damping used for the trial
    pub lambda: f64,
    /// Norm of the proposed step, NaN when the system could not be solved
    pub step_norm: f64,
    pub accepted: bool,
}

/// Diagnostics of a bundle adjustment run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleAdjustmentSummary {
    pub initial_cost: f64,
    pub final_cost: f64,
    /// `sqrt(Σ wᵢ‖rᵢ‖² / n)` before optimization, pixels
    pub initial_rms: f64,
    /// `sqrt(Σ wᵢ‖rᵢ‖² / n)` after optimization, pixels
    pub final_rms: f64,
    pub iterations: usize,
    pub successful_steps: usize,
    pub unsuccessful_steps: usize,
    pub final_lambda: f64,
    pub termination: TerminationReason,
    /// Human readable context for non-converged terminations
    pub message: Option<String>,
    pub num_free_cameras: usize,
    pub num_fixed_cameras: usize,
    pub num_points: usize,
    pub num_observations: usize,
    /// Observations left out because their point projects behind the camera
    pub excluded_observations: usize,
    pub trace: Vec<IterationRecord>,
    pub total_time: Duration,
}

impl BundleAdjustmentSummary {
    pub fn is_converged(&self) -> bool {
        self.termination.is_converged()
    }

    /// Map non-converged terminations onto the crate error taxonomy.
    ///
    /// The scene already holds the best accepted state in every case.
    pub fn into_result(self) -> PhotogrammetryResult<Self> {
        let context = self.message.clone().unwrap_or_default();
        match self.termination {
            TerminationReason::CostTolerance | TerminationReason::StepTolerance => Ok(self),
            TerminationReason::MaxIterations => Err(PhotogrammetryError::MaxIterationsExceeded {
                iterations: self.iterations,
            }),
            TerminationReason::Stalled => Err(PhotogrammetryError::Stalled(context)),
            TerminationReason::Timeout => Err(PhotogrammetryError::Stalled(format!(
                "wall-clock budget exhausted after {} iterations",
                self.iterations
            ))),
            TerminationReason::RankDeficient => Err(PhotogrammetryError::RankDeficient(context)),
            TerminationReason::NumericalOverflow => {
                Err(PhotogrammetryError::NumericalOverflow(context))
            }
        }
    }

    /// Costs of the accepted steps, starting with the initial cost.
    pub fn accepted_costs(&self) -> Vec<f64> {
        std::iter::once(self.initial_cost)
            .chain(self.trace.iter().filter(|r| r.accepted).map(|r| r.cost))
            .collect()
    }
}

impl fmt::Display for BundleAdjustmentSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Bundle Adjustment Summary ===")?;
        writeln!(
            f,
            "Problem:                   {} free cameras, {} fixed, {} points, {} observations",
            self.num_free_cameras, self.num_fixed_cameras, self.num_points, self.num_observations
        )?;
        if self.excluded_observations > 0 {
            writeln!(f, "Excluded observations:     {}", self.excluded_observations)?;
        }
        writeln!(f, "Initial cost:              {:.6e}", self.initial_cost)?;
        writeln!(f, "Final cost:                {:.6e}", self.final_cost)?;
        writeln!(
            f,
            "Cost reduction:            {:.6e} ({:.2}%)",
            self.initial_cost - self.final_cost,
            100.0 * (self.initial_cost - self.final_cost) / self.initial_cost.max(1e-12)
        )?;
        writeln!(f, "Initial RMS:               {:.4} px", self.initial_rms)?;
        writeln!(f, "Final RMS:                 {:.4} px", self.final_rms)?;
        writeln!(f, "Total iterations:          {}", self.iterations)?;
        writeln!(
            f,
            "Successful steps:          {} / unsuccessful {}",
            self.successful_steps, self.unsuccessful_steps
        )?;
        writeln!(f, "Final damping parameter:   {:.6e}", self.final_lambda)?;
        writeln!(f, "Termination:               {}", self.termination)?;
        if let Some(message) = &self.message {
            writeln!(f, "Details:                   {message}")?;
        }
        writeln!(f, "Total time:                {:?}", self.total_time)
    }
}
