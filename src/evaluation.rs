//! Reprojection error evaluation.
//!
//! [`evaluate`] is a pure function of the scene: it never aborts on a single
//! bad observation. Observations of invalid points or points at/behind the
//! camera produce an [`Residual::Unobservable`] sentinel, counted separately
//! from the statistics.

use crate::scene::{CameraId, Observation, PointId, Scene};
use nalgebra::Vector2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Why an observation has no residual.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnobservableReason {
    /// The point is unestimated or invalid
    InvalidPoint,
    /// The point projects at or behind the camera
    BehindCamera,
}

/// Residual of one observation, in scene observation order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Residual {
    /// `observed - projected`, in pixels
    Valid {
        camera_id: CameraId,
        point_id: PointId,
        residual: Vector2<f64>,
    },
    Unobservable {
        camera_id: CameraId,
        point_id: PointId,
        reason: UnobservableReason,
    },
}

impl Residual {
    pub fn camera_id(&self) -> CameraId {
        match *self {
            Residual::Valid { camera_id, .. } | Residual::Unobservable { camera_id, .. } => {
                camera_id
            }
        }
    }

    pub fn point_id(&self) -> PointId {
        match *self {
            Residual::Valid { point_id, .. } | Residual::Unobservable { point_id, .. } => point_id,
        }
    }

    /// Residual norm in pixels, `None` for the unobservable sentinel.
    pub fn norm(&self) -> Option<f64> {
        match self {
            Residual::Valid { residual, .. } => Some(residual.norm()),
            Residual::Unobservable { .. } => None,
        }
    }
}

/// Residual of a single observation.
pub fn observation_residual(scene: &Scene, obs: &Observation) -> Residual {
    let unobservable = |reason| Residual::Unobservable {
        camera_id: obs.camera_id,
        point_id: obs.point_id,
        reason,
    };
    let (Some(camera), Some(point)) = (scene.camera(obs.camera_id), scene.point(obs.point_id))
    else {
        return unobservable(UnobservableReason::InvalidPoint);
    };
    if !point.is_valid() {
        return unobservable(UnobservableReason::InvalidPoint);
    }
    match camera.project(&point.position) {
        Ok(projected) => Residual::Valid {
            camera_id: obs.camera_id,
            point_id: obs.point_id,
            residual: obs.pixel - projected,
        },
        Err(_) => unobservable(UnobservableReason::BehindCamera),
    }
}

/// Aggregate statistics over residual norms (pixels).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ErrorStatistics {
    /// Observations with a valid residual
    pub count: usize,
    /// Observations reported as unobservable
    pub unobservable: usize,
    pub mean: f64,
    pub rms: f64,
    pub max: f64,
    pub median: f64,
}

impl ErrorStatistics {
    pub fn from_norms(norms: &[f64], unobservable: usize) -> Self {
        if norms.is_empty() {
            return Self {
                unobservable,
                ..Self::default()
            };
        }
        let n = norms.len() as f64;
        let mut sorted = norms.to_vec();
        sorted.sort_by(f64::total_cmp);
        let mid = sorted.len() / 2;
        let median = if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        };
        Self {
            count: norms.len(),
            unobservable,
            mean: norms.iter().sum::<f64>() / n,
            rms: (norms.iter().map(|e| e * e).sum::<f64>() / n).sqrt(),
            max: sorted[sorted.len() - 1],
            median,
        }
    }
}

impl fmt::Display for ErrorStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "n={} (unobservable {}), mean={:.4} px, rms={:.4} px, median={:.4} px, max={:.4} px",
            self.count, self.unobservable, self.mean, self.rms, self.median, self.max
        )
    }
}

#[derive(Default)]
struct Bucket {
    norms: Vec<f64>,
    unobservable: usize,
}

impl Bucket {
    fn push(&mut self, residual: &Residual) {
        match residual.norm() {
            Some(norm) => self.norms.push(norm),
            None => self.unobservable += 1,
        }
    }

    fn statistics(&self) -> ErrorStatistics {
        ErrorStatistics::from_norms(&self.norms, self.unobservable)
    }
}

/// Full evaluation report of a scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    /// One entry per observation, in scene order
    pub residuals: Vec<Residual>,
    pub overall: ErrorStatistics,
    pub per_camera: BTreeMap<CameraId, ErrorStatistics>,
    pub per_point: BTreeMap<PointId, ErrorStatistics>,
}

/// Evaluate every observation of the scene.
pub fn evaluate(scene: &Scene) -> Evaluation {
    let residuals: Vec<Residual> = scene
        .observations()
        .par_iter()
        .map(|obs| observation_residual(scene, obs))
        .collect();

    let mut overall = Bucket::default();
    let mut per_camera: BTreeMap<CameraId, Bucket> = BTreeMap::new();
    let mut per_point: BTreeMap<PointId, Bucket> = BTreeMap::new();
    for residual in &residuals {
        overall.push(residual);
        per_camera.entry(residual.camera_id()).or_default().push(residual);
        per_point.entry(residual.point_id()).or_default().push(residual);
    }

    Evaluation {
        overall: overall.statistics(),
        per_camera: per_camera
            .into_iter()
            .map(|(id, bucket)| (id, bucket.statistics()))
            .collect(),
        per_point: per_point
            .into_iter()
            .map(|(id, bucket)| (id, bucket.statistics()))
            .collect(),
        residuals,
    }
}

/// Mean reprojection error over all observable residuals.
pub fn mean_reprojection_error(scene: &Scene) -> f64 {
    evaluate(scene).overall.mean
}

impl fmt::Display for Evaluation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Reprojection Error")?;
        writeln!(f, "  Overall: {}", self.overall)?;
        for (id, stats) in &self.per_camera {
            writeln!(f, "  {id}: {stats}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Intrinsics, Pose};
    use crate::scene::InMemorySceneBuilder;
    use nalgebra::Vector3;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn test_statistics() {
        let stats = ErrorStatistics::from_norms(&[3.0, 1.0, 4.0, 2.0], 1);
        assert_eq!(stats.count, 4);
        assert_eq!(stats.unobservable, 1);
        assert!((stats.mean - 2.5).abs() < 1e-12);
        assert!((stats.median - 2.5).abs() < 1e-12);
        assert!((stats.rms - 7.5f64.sqrt()).abs() < 1e-12);
        assert_eq!(stats.max, 4.0);

        let empty = ErrorStatistics::from_norms(&[], 2);
        assert_eq!(empty.count, 0);
        assert_eq!(empty.unobservable, 2);
        assert_eq!(empty.mean, 0.0);
    }

    #[test]
    fn test_evaluate_with_sentinels() -> TestResult {
        let intrinsics = Intrinsics::new(500.0, 500.0, 320.0, 240.0)?;
        let mut builder = InMemorySceneBuilder::new();
        builder
            .add_camera(CameraId(0), Pose::identity(), intrinsics)
            .add_point(PointId(0), Vector3::new(0.0, 0.0, 5.0))
            .add_point(PointId(1), Vector3::new(0.0, 0.0, -5.0))
            .add_unestimated_point(PointId(2))
            .add_observation(CameraId(0), PointId(0), Vector2::new(323.0, 244.0))
            .add_observation(CameraId(0), PointId(1), Vector2::new(320.0, 240.0))
            .add_observation(CameraId(0), PointId(2), Vector2::new(320.0, 240.0));
        let scene = builder.build()?;

        let evaluation = evaluate(&scene);
        assert_eq!(evaluation.residuals.len(), 3);
        assert_eq!(evaluation.residuals[0].norm(), Some(5.0));
        assert!(matches!(
            evaluation.residuals[1],
            Residual::Unobservable {
                reason: UnobservableReason::BehindCamera,
                ..
            }
        ));
        assert!(matches!(
            evaluation.residuals[2],
            Residual::Unobservable {
                reason: UnobservableReason::InvalidPoint,
                ..
            }
        ));
        assert_eq!(evaluation.overall.count, 1);
        assert_eq!(evaluation.overall.unobservable, 2);
        assert_eq!(evaluation.per_camera[&CameraId(0)].count, 1);
        assert_eq!(evaluation.per_point[&PointId(1)].unobservable, 1);
        assert!((mean_reprojection_error(&scene) - 5.0).abs() < 1e-12);
        Ok(())
    }
}
