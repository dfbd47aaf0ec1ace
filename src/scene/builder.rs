//! Incremental, in-memory construction of a [`Scene`].

use super::{CameraId, Observation, Point3D, PointId, Scene, SceneBuilder};
use crate::error::{PhotogrammetryError, PhotogrammetryResult};
use crate::geometry::{Camera, Intrinsics, Pose};
use nalgebra::{Vector2, Vector3};
use std::collections::BTreeMap;

/// Collects cameras, points and observations and validates them on build.
///
/// Duplicate identifiers are reported at build time rather than silently
/// overwritten.
#[derive(Debug, Clone, Default)]
pub struct InMemorySceneBuilder {
    cameras: Vec<Camera>,
    points: Vec<Point3D>,
    observations: Vec<Observation>,
}

impl InMemorySceneBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_camera(&mut self, id: CameraId, pose: Pose, intrinsics: Intrinsics) -> &mut Self {
        self.cameras.push(Camera::new(id, pose, intrinsics));
        self
    }

    /// Add a point with a known initial position.
    pub fn add_point(&mut self, id: PointId, position: Vector3<f64>) -> &mut Self {
        self.points.push(Point3D::seeded(id, position));
        self
    }

    /// Add a point whose position will come from intersection.
    pub fn add_unestimated_point(&mut self, id: PointId) -> &mut Self {
        self.points.push(Point3D::unestimated(id));
        self
    }

    pub fn add_observation(
        &mut self,
        camera_id: CameraId,
        point_id: PointId,
        pixel: Vector2<f64>,
    ) -> &mut Self {
        self.observations
            .push(Observation::new(camera_id, point_id, pixel));
        self
    }

    pub fn add_weighted_observation(
        &mut self,
        camera_id: CameraId,
        point_id: PointId,
        pixel: Vector2<f64>,
        weight: f64,
    ) -> &mut Self {
        self.observations
            .push(Observation::new(camera_id, point_id, pixel).with_weight(weight));
        self
    }

    pub fn build(&self) -> PhotogrammetryResult<Scene> {
        let mut cameras = BTreeMap::new();
        for camera in &self.cameras {
            if cameras.insert(camera.id, *camera).is_some() {
                return Err(PhotogrammetryError::MalformedInput(format!(
                    "duplicate {}",
                    camera.id
                )));
            }
        }
        let mut points = BTreeMap::new();
        for point in &self.points {
            if points.insert(point.id, *point).is_some() {
                return Err(PhotogrammetryError::MalformedInput(format!(
                    "duplicate {}",
                    point.id
                )));
            }
        }
        Scene::new(cameras, points, self.observations.clone())
    }
}

impl SceneBuilder for InMemorySceneBuilder {
    fn build_scene(&self) -> PhotogrammetryResult<Scene> {
        self.build()
    }
}
