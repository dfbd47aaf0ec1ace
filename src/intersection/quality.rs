//! Triangulation quality metrics.
//!
//! Small triangulation angles make the depth of a point poorly constrained even
//! when its reprojection error is tiny, so both are reported.

use crate::scene::{PointId, Scene};
use std::fmt;

/// Points whose widest ray pair is narrower than this are flagged as weak.
pub const WEAK_ANGLE_DEG: f64 = 2.0;

/// Quality of one triangulated point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriangulationQuality {
    pub point_id: PointId,
    pub num_views: usize,
    /// Widest angle between any two viewing rays, in degrees
    pub max_angle_deg: f64,
    /// Mean perpendicular distance from the point to its viewing rays
    pub mean_ray_distance: f64,
    /// Mean reprojection error over the views in front of the camera
    pub mean_reprojection_error: f64,
}

impl TriangulationQuality {
    pub fn is_weak(&self) -> bool {
        self.max_angle_deg < WEAK_ANGLE_DEG
    }
}

/// Quality of a valid point, `None` for unknown or invalid points.
pub fn assess_point(scene: &Scene, point_id: PointId) -> Option<TriangulationQuality> {
    let point = scene.point(point_id).filter(|p| p.is_valid())?;

    let mut rays = Vec::new();
    let mut reprojection_errors = Vec::new();
    for obs in scene.observations_of(point_id) {
        let camera = scene.camera(obs.camera_id)?;
        rays.push(camera.backproject(&obs.pixel));
        if let Ok(projected) = camera.project(&point.position) {
            reprojection_errors.push((projected - obs.pixel).norm());
        }
    }
    if rays.is_empty() {
        return None;
    }

    let mut max_angle: f64 = 0.0;
    for (i, a) in rays.iter().enumerate() {
        for b in &rays[i + 1..] {
            max_angle = max_angle.max(a.angle_to(b));
        }
    }

    let mean_ray_distance =
        rays.iter().map(|r| r.distance_to(&point.position)).sum::<f64>() / rays.len() as f64;
    let mean_reprojection_error = if reprojection_errors.is_empty() {
        f64::INFINITY
    } else {
        reprojection_errors.iter().sum::<f64>() / reprojection_errors.len() as f64
    };

    Some(TriangulationQuality {
        point_id,
        num_views: rays.len(),
        max_angle_deg: max_angle.to_degrees(),
        mean_ray_distance,
        mean_reprojection_error,
    })
}

/// Scene-wide triangulation quality.
#[derive(Debug, Clone, Default)]
pub struct QualitySummary {
    pub points: Vec<TriangulationQuality>,
    pub mean_angle_deg: f64,
    pub median_angle_deg: f64,
    pub num_weak: usize,
}

pub fn assess_scene(scene: &Scene) -> QualitySummary {
    let points: Vec<TriangulationQuality> = scene
        .points()
        .keys()
        .filter_map(|&id| assess_point(scene, id))
        .collect();
    if points.is_empty() {
        return QualitySummary::default();
    }

    let mut angles: Vec<f64> = points.iter().map(|q| q.max_angle_deg).collect();
    angles.sort_by(f64::total_cmp);
    let mid = angles.len() / 2;
    let median_angle_deg = if angles.len() % 2 == 0 {
        (angles[mid - 1] + angles[mid]) / 2.0
    } else {
        angles[mid]
    };

    QualitySummary {
        mean_angle_deg: angles.iter().sum::<f64>() / angles.len() as f64,
        median_angle_deg,
        num_weak: points.iter().filter(|q| q.is_weak()).count(),
        points,
    }
}

impl fmt::Display for QualitySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Triangulation Quality")?;
        writeln!(f, "  Assessed points:     {}", self.points.len())?;
        writeln!(f, "  Mean max angle:      {:.2} deg", self.mean_angle_deg)?;
        writeln!(f, "  Median max angle:    {:.2} deg", self.median_angle_deg)?;
        writeln!(
            f,
            "  Weak points (< {WEAK_ANGLE_DEG} deg): {}",
            self.num_weak
        )
    }
}
