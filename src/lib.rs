//! Multi-view photogrammetry: spatial intersection and bundle adjustment.
//!
//! A [`Scene`] of calibrated cameras, 3D points and pixel observations is built
//! once through a [`SceneBuilder`]. Spatial intersection triangulates initial
//! point positions from the viewing rays, and the Levenberg-Marquardt
//! [`BundleAdjuster`] jointly refines the free camera poses and the points,
//! eliminating the point blocks through the Schur complement.
//!
//! ```no_run
//! use apex_photogrammetry::{
//!     BundleAdjustmentConfig, CameraId, PipelineConfig, SyntheticSceneBuilder, run_pipeline,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut scene = SyntheticSceneBuilder::new().generate()?.scene;
//! let config = PipelineConfig::new()
//!     .with_adjustment(BundleAdjustmentConfig::new().with_fixed_camera(CameraId(0)));
//! let report = run_pipeline(&mut scene, &config)?;
//! println!("{report}");
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod evaluation;
pub mod geometry;
pub mod intersection;
pub mod linalg;
pub mod logger;
pub mod optimizer;
pub mod pipeline;
pub mod scene;

pub use error::{PhotogrammetryError, PhotogrammetryResult};
pub use evaluation::{ErrorStatistics, Evaluation, Residual, evaluate, mean_reprojection_error};
pub use geometry::{Camera, Distortion, Intrinsics, Pose, Ray, backproject, project};
pub use intersection::{IntersectionConfig, IntersectionReport, intersect_scene, triangulate_point};
pub use linalg::Damping;
pub use logger::{init_logger, init_logger_with_level};
pub use optimizer::{
    BundleAdjuster, BundleAdjustmentConfig, BundleAdjustmentSummary, TerminationReason,
};
pub use pipeline::{PipelineConfig, PipelineReport, run_pipeline};
pub use scene::{
    CameraId, InMemorySceneBuilder, Observation, Point3D, PointId, Scene, SceneBuilder,
    SyntheticScene, SyntheticSceneBuilder,
};
