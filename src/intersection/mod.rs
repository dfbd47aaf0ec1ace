//! Spatial intersection (multi-view triangulation).
//!
//! Every observation of a point defines a viewing ray with origin `c` (camera
//! center) and unit direction `d`. The point `X` closest to all rays in the
//! least-squares sense satisfies the 3×3 normal equations
//!
//! ```text
//! Σ (I - d dᵀ) X = Σ (I - d dᵀ) c
//! ```
//!
//! `I - d dᵀ` projects onto the plane orthogonal to the ray, so the solution
//! minimizes the sum of squared perpendicular ray distances.
//!
//! When the rays are (near-)parallel the system is ill-conditioned; if its
//! condition number exceeds [`IntersectionConfig::max_condition_number`] the
//! point is reported as [`PhotogrammetryError::DegenerateConfiguration`].
//!
//! In robust mode the worst observation is discarded while its reprojection
//! error exceeds the outlier threshold. This is a minimal rejection loop, not
//! RANSAC.
//!
//! Points that arrive with a seeded position are left alone unless
//! [`IntersectionConfig::retriangulate_seeded`] is set, and a seed is never
//! demoted to invalid.

use crate::error::{PhotogrammetryError, PhotogrammetryResult};
use crate::geometry::{Camera, Ray};
use crate::scene::{CameraId, PointId, Scene};
use nalgebra::{Matrix3, Vector3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info, warn};

pub mod quality;

pub use quality::{QualitySummary, TriangulationQuality, assess_point, assess_scene};

/// Configuration for spatial intersection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntersectionConfig {
    /// Largest accepted condition number of the stacked 3×3 system
    pub max_condition_number: f64,
    /// Enable the iterative outlier rejection loop
    pub robust_intersection: bool,
    /// Reprojection error (pixels) above which an observation is an outlier
    pub outlier_threshold_px: f64,
    /// Maximum number of observations discarded per point
    pub max_outlier_rounds: usize,
    /// Re-solve points that already hold a valid position
    pub retriangulate_seeded: bool,
}

impl Default for IntersectionConfig {
    fn default() -> Self {
        Self {
            max_condition_number: 1e4,
            robust_intersection: false,
            outlier_threshold_px: 2.0,
            max_outlier_rounds: 5,
            retriangulate_seeded: false,
        }
    }
}

impl IntersectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_condition_number(mut self, max_condition_number: f64) -> Self {
        self.max_condition_number = max_condition_number;
        self
    }

    pub fn with_robust_intersection(mut self, robust: bool) -> Self {
        self.robust_intersection = robust;
        self
    }

    pub fn with_outlier_threshold(mut self, threshold_px: f64) -> Self {
        self.outlier_threshold_px = threshold_px;
        self
    }

    pub fn with_max_outlier_rounds(mut self, rounds: usize) -> Self {
        self.max_outlier_rounds = rounds;
        self
    }

    pub fn with_retriangulate_seeded(mut self, retriangulate: bool) -> Self {
        self.retriangulate_seeded = retriangulate;
        self
    }

    pub fn validate(&self) -> PhotogrammetryResult<()> {
        if !(self.max_condition_number.is_finite() && self.max_condition_number > 1.0) {
            return Err(PhotogrammetryError::MalformedInput(format!(
                "max_condition_number must be finite and > 1, got {}",
                self.max_condition_number
            )));
        }
        if !(self.outlier_threshold_px.is_finite() && self.outlier_threshold_px > 0.0) {
            return Err(PhotogrammetryError::MalformedInput(format!(
                "outlier_threshold_px must be finite and positive, got {}",
                self.outlier_threshold_px
            )));
        }
        Ok(())
    }
}

/// Least-squares intersection of a ray bundle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayIntersection {
    pub position: Vector3<f64>,
    pub condition_number: f64,
}

/// Intersect rays in the least-squares sense.
///
/// Fails with `DegenerateConfiguration` for fewer than 2 rays or when the
/// stacked system's condition number exceeds `max_condition_number`.
pub fn intersect_rays(
    rays: &[Ray],
    max_condition_number: f64,
) -> PhotogrammetryResult<RayIntersection> {
    if rays.len() < 2 {
        return Err(PhotogrammetryError::DegenerateConfiguration(format!(
            "{} ray(s), at least 2 required",
            rays.len()
        )));
    }

    let mut a = Matrix3::zeros();
    let mut b = Vector3::zeros();
    for ray in rays {
        let projector = Matrix3::identity() - ray.direction * ray.direction.transpose();
        a += projector;
        b += projector * ray.origin;
    }

    let eigenvalues = a.symmetric_eigenvalues();
    let min_ev = eigenvalues.min();
    let max_ev = eigenvalues.max();
    let condition_number = if min_ev > 0.0 {
        max_ev / min_ev
    } else {
        f64::INFINITY
    };
    if !(condition_number <= max_condition_number) {
        return Err(PhotogrammetryError::DegenerateConfiguration(format!(
            "ray bundle condition number {condition_number:.3e} exceeds {max_condition_number:.3e}"
        )));
    }

    let position = a.try_inverse().map(|inv| inv * b).ok_or_else(|| {
        PhotogrammetryError::DegenerateConfiguration("ray bundle system is singular".to_string())
    })?;
    if !position.iter().all(|v| v.is_finite()) {
        return Err(PhotogrammetryError::NumericalOverflow(
            "intersection produced a non-finite point".to_string(),
        ));
    }

    Ok(RayIntersection {
        position,
        condition_number,
    })
}

/// Successful triangulation of a single point.
#[derive(Debug, Clone, PartialEq)]
pub struct Triangulation {
    pub position: Vector3<f64>,
    pub condition_number: f64,
    /// Cameras whose observations were used in the final solve
    pub inliers: Vec<CameraId>,
    /// Cameras whose observations were rejected as outliers
    pub outliers: Vec<CameraId>,
}

struct PointView<'a> {
    camera: &'a Camera,
    ray: Ray,
    pixel: nalgebra::Vector2<f64>,
}

/// Reprojection error of a candidate position in one view, infinite behind the camera.
fn view_error(view: &PointView<'_>, position: &Vector3<f64>) -> f64 {
    view.camera
        .project(position)
        .map(|projected| (projected - view.pixel).norm())
        .unwrap_or(f64::INFINITY)
}

/// Triangulate one point from all of its observations in the scene.
pub fn triangulate_point(
    scene: &Scene,
    point_id: PointId,
    config: &IntersectionConfig,
) -> PhotogrammetryResult<Triangulation> {
    if scene.point(point_id).is_none() {
        return Err(PhotogrammetryError::MalformedInput(format!(
            "unknown {point_id}"
        )));
    }

    let mut views = Vec::new();
    for obs in scene.observations_of(point_id) {
        let camera = scene.camera(obs.camera_id).ok_or_else(|| {
            PhotogrammetryError::MalformedInput(format!("unknown {}", obs.camera_id))
        })?;
        views.push(PointView {
            camera,
            ray: camera.backproject(&obs.pixel),
            pixel: obs.pixel,
        });
    }

    let mut outliers = Vec::new();
    loop {
        let rays: Vec<Ray> = views.iter().map(|v| v.ray).collect();
        let solution = intersect_rays(&rays, config.max_condition_number)?;

        let errors: Vec<f64> = views
            .iter()
            .map(|v| view_error(v, &solution.position))
            .collect();

        let worst = errors
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, e)| (i, *e));

        let can_reject = config.robust_intersection
            && views.len() > 2
            && outliers.len() < config.max_outlier_rounds;
        match worst {
            Some((index, error)) if can_reject && error > config.outlier_threshold_px => {
                let removed = views.remove(index);
                debug!(
                    "{point_id}: rejecting observation from {} ({error:.3} px)",
                    removed.camera.id
                );
                outliers.push(removed.camera.id);
            }
            _ => {
                if let Some(behind) = views.iter().find(|v| v.camera.depth_of(&solution.position) <= 0.0) {
                    return Err(PhotogrammetryError::DegenerateProjection(format!(
                        "{point_id} triangulated behind {}",
                        behind.camera.id
                    )));
                }
                return Ok(Triangulation {
                    position: solution.position,
                    condition_number: solution.condition_number,
                    inliers: views.iter().map(|v| v.camera.id).collect(),
                    outliers,
                });
            }
        }
    }
}

/// Result of intersecting one point of a scene.
#[derive(Debug, Clone, PartialEq)]
pub enum PointOutcome {
    Triangulated(Triangulation),
    /// Point left invalid; carries the reason
    Invalid(PhotogrammetryError),
    /// Seeded position kept; carries the reason if re-triangulation failed
    SeedKept(Option<PhotogrammetryError>),
}

impl PointOutcome {
    pub fn is_triangulated(&self) -> bool {
        matches!(self, PointOutcome::Triangulated(_))
    }
}

/// Per-point outcomes of [`intersect_scene`].
#[derive(Debug, Clone, Default)]
pub struct IntersectionReport {
    pub outcomes: BTreeMap<PointId, PointOutcome>,
}

impl IntersectionReport {
    pub fn num_triangulated(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_triangulated()).count()
    }

    pub fn num_invalid(&self) -> usize {
        self.outcomes
            .values()
            .filter(|o| matches!(o, PointOutcome::Invalid(_)))
            .count()
    }

    pub fn num_seeds_kept(&self) -> usize {
        self.outcomes
            .values()
            .filter(|o| matches!(o, PointOutcome::SeedKept(_)))
            .count()
    }

    pub fn num_outliers(&self) -> usize {
        self.outcomes
            .values()
            .map(|o| match o {
                PointOutcome::Triangulated(t) => t.outliers.len(),
                PointOutcome::Invalid(_) | PointOutcome::SeedKept(_) => 0,
            })
            .sum()
    }

    /// Invalid points and their reasons.
    pub fn failures(&self) -> impl Iterator<Item = (&PointId, &PhotogrammetryError)> {
        self.outcomes.iter().filter_map(|(id, o)| match o {
            PointOutcome::Invalid(err) => Some((id, err)),
            PointOutcome::Triangulated(_) | PointOutcome::SeedKept(_) => None,
        })
    }
}

impl fmt::Display for IntersectionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Spatial Intersection Summary")?;
        writeln!(f, "  Points:            {}", self.outcomes.len())?;
        writeln!(f, "  Triangulated:      {}", self.num_triangulated())?;
        writeln!(f, "  Invalid:           {}", self.num_invalid())?;
        writeln!(f, "  Seeds kept:        {}", self.num_seeds_kept())?;
        writeln!(f, "  Rejected outliers: {}", self.num_outliers())
    }
}

/// Triangulate the points of the scene and write the results back.
///
/// All points are solved before the scene is touched, so a fatal error leaves
/// the scene unchanged. Geometric failures are recovered by marking the point
/// invalid and recording the reason in the report. Seeded points are skipped
/// unless `retriangulate_seeded` is set; a failed re-solve keeps the seed.
pub fn intersect_scene(
    scene: &mut Scene,
    config: &IntersectionConfig,
) -> PhotogrammetryResult<IntersectionReport> {
    config.validate()?;

    let shared: &Scene = scene;
    let mut report = IntersectionReport::default();
    let mut ids = Vec::with_capacity(shared.num_points());
    for (id, point) in shared.points() {
        if point.is_valid() && !config.retriangulate_seeded {
            report.outcomes.insert(*id, PointOutcome::SeedKept(None));
        } else {
            ids.push((*id, point.is_valid()));
        }
    }

    let results: Vec<(PointId, bool, PhotogrammetryResult<Triangulation>)> = ids
        .par_iter()
        .map(|&(id, seeded)| (id, seeded, triangulate_point(shared, id, config)))
        .collect();

    for (id, seeded, result) in results {
        let outcome = match result {
            Ok(triangulation) => PointOutcome::Triangulated(triangulation),
            Err(err) if err.is_geometric() && seeded => {
                debug!("{id} keeps its seeded position: {err}");
                PointOutcome::SeedKept(Some(err))
            }
            Err(err) if err.is_geometric() => {
                debug!("{id} left invalid: {err}");
                PointOutcome::Invalid(err)
            }
            Err(err) => return Err(err),
        };
        report.outcomes.insert(id, outcome);
    }

    for (id, outcome) in &report.outcomes {
        match outcome {
            PointOutcome::Triangulated(t) => scene.set_point_position(*id, t.position)?,
            PointOutcome::Invalid(_) => scene.invalidate_point(*id)?,
            PointOutcome::SeedKept(_) => {}
        }
    }

    if report.num_invalid() > 0 {
        warn!(
            "Spatial intersection: {} of {} points could not be triangulated",
            report.num_invalid(),
            report.outcomes.len()
        );
    }
    info!(
        "Spatial intersection: {} points triangulated, {} seeds kept, {} outliers rejected",
        report.num_triangulated(),
        report.num_seeds_kept(),
        report.num_outliers()
    );
    Ok(report)
}
