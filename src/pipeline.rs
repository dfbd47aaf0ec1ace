//! Two-stage reconstruction pipeline.
//!
//! Spatial intersection seeds the point positions, bundle adjustment refines
//! them together with the free camera poses, and the evaluator reports the
//! reprojection error before and after refinement.

use crate::error::PhotogrammetryResult;
use crate::evaluation::{Evaluation, evaluate};
use crate::intersection::{
    IntersectionConfig, IntersectionReport, QualitySummary, assess_scene, intersect_scene,
};
use crate::optimizer::{BundleAdjuster, BundleAdjustmentConfig, BundleAdjustmentSummary};
use crate::scene::Scene;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

/// Configuration of both stages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub intersection: IntersectionConfig,
    pub adjustment: BundleAdjustmentConfig,
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_intersection(mut self, intersection: IntersectionConfig) -> Self {
        self.intersection = intersection;
        self
    }

    pub fn with_adjustment(mut self, adjustment: BundleAdjustmentConfig) -> Self {
        self.adjustment = adjustment;
        self
    }
}

/// Everything the pipeline learned about the scene.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub intersection: IntersectionReport,
    pub quality: QualitySummary,
    /// Evaluation of the triangulated scene, before adjustment
    pub initial_evaluation: Evaluation,
    pub adjustment: BundleAdjustmentSummary,
    pub final_evaluation: Evaluation,
}

impl PipelineReport {
    /// Mean reprojection error after intersection, pixels
    pub fn initial_mean_error(&self) -> f64 {
        self.initial_evaluation.overall.mean
    }

    /// Mean reprojection error after adjustment, pixels
    pub fn final_mean_error(&self) -> f64 {
        self.final_evaluation.overall.mean
    }

    /// Relative reduction of the mean reprojection error, in percent.
    pub fn improvement_percent(&self) -> f64 {
        let initial = self.initial_mean_error();
        if initial > 0.0 {
            100.0 * (initial - self.final_mean_error()) / initial
        } else {
            0.0
        }
    }
}

/// Run intersection, evaluation, bundle adjustment and a final evaluation.
///
/// The scene is updated in place. Points that cannot be triangulated are left
/// invalid and excluded from adjustment; non-converged adjustments are reported
/// in the summary rather than as errors.
pub fn run_pipeline(
    scene: &mut Scene,
    config: &PipelineConfig,
) -> PhotogrammetryResult<PipelineReport> {
    config.intersection.validate()?;
    config.adjustment.validate()?;
    config.adjustment.check_fixed_cameras(scene)?;

    info!(
        "Pipeline: {} cameras, {} points, {} observations",
        scene.num_cameras(),
        scene.num_points(),
        scene.observations().len()
    );

    let intersection = intersect_scene(scene, &config.intersection)?;
    let quality = assess_scene(scene);
    let initial_evaluation = evaluate(scene);
    info!(
        "After intersection: mean reprojection error {:.4} px",
        initial_evaluation.overall.mean
    );

    let adjustment = BundleAdjuster::new(config.adjustment.clone()).optimize(scene)?;
    let final_evaluation = evaluate(scene);
    info!(
        "After bundle adjustment: mean reprojection error {:.4} px ({})",
        final_evaluation.overall.mean, adjustment.termination
    );

    Ok(PipelineReport {
        intersection,
        quality,
        initial_evaluation,
        adjustment,
        final_evaluation,
    })
}

impl fmt::Display for PipelineReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.intersection)?;
        write!(f, "{}", self.quality)?;
        write!(f, "{}", self.adjustment)?;
        writeln!(f, "=== Pipeline Summary ===")?;
        writeln!(
            f,
            "Initial mean reprojection error: {:.4} px",
            self.initial_mean_error()
        )?;
        writeln!(
            f,
            "Final mean reprojection error:   {:.4} px",
            self.final_mean_error()
        )?;
        writeln!(
            f,
            "Improvement:                     {:.2}%",
            self.improvement_percent()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PhotogrammetryError;
    use crate::scene::{CameraId, SyntheticSceneBuilder};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn test_pipeline_reduces_reprojection_error() -> TestResult {
        let synthetic = SyntheticSceneBuilder::new()
            .with_pose_noise(0.05, 0.5)
            .generate()?;
        let mut scene = synthetic.scene.clone();
        let config = PipelineConfig::new().with_adjustment(
            BundleAdjustmentConfig::new()
                .with_fixed_camera(CameraId(0))
                .with_max_iterations(100),
        );

        let report = run_pipeline(&mut scene, &config)?;

        assert_eq!(report.intersection.num_triangulated(), 50);
        assert_eq!(report.quality.points.len(), 50);
        assert!(report.final_mean_error() < report.initial_mean_error());
        assert!(report.improvement_percent() > 0.0);
        assert!(report.adjustment.final_cost <= report.adjustment.initial_cost);
        assert!(report.to_string().contains("Pipeline Summary"));
        Ok(())
    }

    #[test]
    fn test_pipeline_rejects_missing_gauge() -> TestResult {
        let mut scene = SyntheticSceneBuilder::new().generate()?.scene;
        let before = scene.clone();
        let result = run_pipeline(&mut scene, &PipelineConfig::default());
        assert!(matches!(result, Err(PhotogrammetryError::MalformedInput(_))));
        assert_eq!(scene, before);
        Ok(())
    }
}
