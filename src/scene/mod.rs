//! Scene data model: cameras, 3D points and the observations linking them.
//!
//! The [`Scene`] owns every entity. It is built once through a [`SceneBuilder`],
//! populated by spatial intersection, refined in place by bundle adjustment and
//! then handed out read-only for evaluation.
//!
//! Construction validates referential integrity: every observation must
//! reference an existing camera and point, rotations must be proper and all
//! numeric values finite. Violations fail with
//! [`PhotogrammetryError::MalformedInput`].

use crate::error::{PhotogrammetryError, PhotogrammetryResult};
use crate::geometry::{Camera, Pose};
use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::debug;

pub mod builder;
pub mod synthetic;

pub use builder::InMemorySceneBuilder;
pub use synthetic::{SyntheticScene, SyntheticSceneBuilder};

/// Camera identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CameraId(pub u32);

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "camera {}", self.0)
    }
}

/// 3D point identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PointId(pub u32);

impl fmt::Display for PointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "point {}", self.0)
    }
}

/// Estimation state of a 3D point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PointStatus {
    /// No position estimate yet
    #[default]
    Unestimated,
    /// Position seeded or triangulated
    Valid,
    /// Triangulation failed or the point was pruned
    Invalid,
}

/// A 3D point in world coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point3D {
    pub id: PointId,
    pub position: Vector3<f64>,
    pub status: PointStatus,
}

impl Point3D {
    /// Point with a known (seeded) position.
    pub fn seeded(id: PointId, position: Vector3<f64>) -> Self {
        Self {
            id,
            position,
            status: PointStatus::Valid,
        }
    }

    /// Point awaiting triangulation.
    pub fn unestimated(id: PointId) -> Self {
        Self {
            id,
            position: Vector3::zeros(),
            status: PointStatus::Unestimated,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.status == PointStatus::Valid
    }
}

/// A 2D pixel measurement of one point in one camera.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub camera_id: CameraId,
    pub point_id: PointId,
    pub pixel: Vector2<f64>,
    /// Confidence weight on the squared residual
    pub weight: f64,
}

impl Observation {
    pub fn new(camera_id: CameraId, point_id: PointId, pixel: Vector2<f64>) -> Self {
        Self {
            camera_id,
            point_id,
            pixel,
            weight: 1.0,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }
}

/// Capability interface for anything that can produce a validated [`Scene`].
///
/// One implementation exists per supported source.
pub trait SceneBuilder {
    fn build_scene(&self) -> PhotogrammetryResult<Scene>;
}

/// Owning aggregate of cameras, points and observations.
///
/// Deserialization goes through [`Scene::new`], so a decoded scene is
/// validated and indexed exactly like a built one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SceneData", into = "SceneData")]
pub struct Scene {
    cameras: BTreeMap<CameraId, Camera>,
    points: BTreeMap<PointId, Point3D>,
    observations: Vec<Observation>,
    tracks: BTreeMap<PointId, Vec<usize>>,
}

/// Serialized form of a [`Scene`], without the derived track index.
#[derive(Serialize, Deserialize)]
struct SceneData {
    cameras: BTreeMap<CameraId, Camera>,
    points: BTreeMap<PointId, Point3D>,
    observations: Vec<Observation>,
}

impl TryFrom<SceneData> for Scene {
    type Error = PhotogrammetryError;

    fn try_from(data: SceneData) -> Result<Self, Self::Error> {
        Scene::new(data.cameras, data.points, data.observations)
    }
}

impl From<Scene> for SceneData {
    fn from(scene: Scene) -> Self {
        Self {
            cameras: scene.cameras,
            points: scene.points,
            observations: scene.observations,
        }
    }
}

impl Scene {
    /// Build and validate a scene.
    pub fn new(
        cameras: BTreeMap<CameraId, Camera>,
        points: BTreeMap<PointId, Point3D>,
        observations: Vec<Observation>,
    ) -> PhotogrammetryResult<Self> {
        let mut scene = Self {
            cameras,
            points,
            observations,
            tracks: BTreeMap::new(),
        };
        scene.validate()?;
        scene.rebuild_tracks();
        debug!(
            "Scene built: {} cameras, {} points, {} observations",
            scene.cameras.len(),
            scene.points.len(),
            scene.observations.len()
        );
        Ok(scene)
    }

    /// Check referential integrity and numeric sanity of the whole scene.
    pub fn validate(&self) -> PhotogrammetryResult<()> {
        for (id, camera) in &self.cameras {
            if *id != camera.id {
                return Err(PhotogrammetryError::MalformedInput(format!(
                    "{id} stored under mismatching key (camera says {})",
                    camera.id
                )));
            }
            if !camera.pose.is_valid(crate::geometry::ROTATION_TOLERANCE) {
                return Err(PhotogrammetryError::MalformedInput(format!(
                    "{id} has an invalid pose"
                )));
            }
            camera.intrinsics.validate().map_err(|e| {
                PhotogrammetryError::MalformedInput(format!("{id} intrinsics: {e}"))
            })?;
        }

        for (id, point) in &self.points {
            if *id != point.id {
                return Err(PhotogrammetryError::MalformedInput(format!(
                    "{id} stored under mismatching key (point says {})",
                    point.id
                )));
            }
            if !point.position.iter().all(|v| v.is_finite()) {
                return Err(PhotogrammetryError::MalformedInput(format!(
                    "{id} has a non-finite position"
                )));
            }
        }

        let mut seen = BTreeSet::new();
        for (index, obs) in self.observations.iter().enumerate() {
            if !self.cameras.contains_key(&obs.camera_id) {
                return Err(PhotogrammetryError::MalformedInput(format!(
                    "observation {index} references unknown {}",
                    obs.camera_id
                )));
            }
            if !self.points.contains_key(&obs.point_id) {
                return Err(PhotogrammetryError::MalformedInput(format!(
                    "observation {index} references unknown {}",
                    obs.point_id
                )));
            }
            if !obs.pixel.iter().all(|v| v.is_finite()) {
                return Err(PhotogrammetryError::MalformedInput(format!(
                    "observation {index} has a non-finite pixel"
                )));
            }
            if !(obs.weight.is_finite() && obs.weight > 0.0) {
                return Err(PhotogrammetryError::MalformedInput(format!(
                    "observation {index} has non-positive weight {}",
                    obs.weight
                )));
            }
            if !seen.insert((obs.camera_id, obs.point_id)) {
                return Err(PhotogrammetryError::MalformedInput(format!(
                    "{} observed twice by {}",
                    obs.point_id, obs.camera_id
                )));
            }
        }
        Ok(())
    }

    fn rebuild_tracks(&mut self) {
        let mut tracks: BTreeMap<PointId, Vec<usize>> = BTreeMap::new();
        for (index, obs) in self.observations.iter().enumerate() {
            tracks.entry(obs.point_id).or_default().push(index);
        }
        self.tracks = tracks;
    }

    pub fn cameras(&self) -> &BTreeMap<CameraId, Camera> {
        &self.cameras
    }

    pub fn camera(&self, id: CameraId) -> Option<&Camera> {
        self.cameras.get(&id)
    }

    pub fn points(&self) -> &BTreeMap<PointId, Point3D> {
        &self.points
    }

    pub fn point(&self, id: PointId) -> Option<&Point3D> {
        self.points.get(&id)
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn num_cameras(&self) -> usize {
        self.cameras.len()
    }

    pub fn num_points(&self) -> usize {
        self.points.len()
    }

    pub fn num_valid_points(&self) -> usize {
        self.points.values().filter(|p| p.is_valid()).count()
    }

    /// Observation indices belonging to a point, in scene order.
    pub fn track(&self, id: PointId) -> &[usize] {
        self.tracks.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Observations of a point, in scene order.
    pub fn observations_of(&self, id: PointId) -> impl Iterator<Item = &Observation> {
        self.track(id).iter().map(move |&i| &self.observations[i])
    }

    /// Validate and rebuild the point-to-observation index.
    pub fn reindex(&mut self) -> PhotogrammetryResult<()> {
        self.validate()?;
        self.rebuild_tracks();
        Ok(())
    }

    /// Set a point position and mark it valid.
    pub fn set_point_position(
        &mut self,
        id: PointId,
        position: Vector3<f64>,
    ) -> PhotogrammetryResult<()> {
        if !position.iter().all(|v| v.is_finite()) {
            return Err(PhotogrammetryError::NumericalOverflow(format!(
                "refusing non-finite position for {id}"
            )));
        }
        let point = self
            .points
            .get_mut(&id)
            .ok_or_else(|| PhotogrammetryError::MalformedInput(format!("unknown {id}")))?;
        point.position = position;
        point.status = PointStatus::Valid;
        Ok(())
    }

    /// Mark a point invalid; its last position is kept for diagnostics.
    pub fn invalidate_point(&mut self, id: PointId) -> PhotogrammetryResult<()> {
        let point = self
            .points
            .get_mut(&id)
            .ok_or_else(|| PhotogrammetryError::MalformedInput(format!("unknown {id}")))?;
        point.status = PointStatus::Invalid;
        Ok(())
    }

    /// Replace a camera pose. The rotation must be proper.
    pub fn set_camera_pose(&mut self, id: CameraId, pose: Pose) -> PhotogrammetryResult<()> {
        if !pose.is_valid(crate::geometry::ROTATION_TOLERANCE) {
            return Err(PhotogrammetryError::MalformedInput(format!(
                "refusing invalid pose for {id}"
            )));
        }
        let camera = self
            .cameras
            .get_mut(&id)
            .ok_or_else(|| PhotogrammetryError::MalformedInput(format!("unknown {id}")))?;
        camera.pose = pose;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Intrinsics;

    fn camera(id: u32) -> Camera {
        Camera::new(
            CameraId(id),
            Pose::identity(),
            Intrinsics {
                fx: 500.0,
                fy: 500.0,
                cx: 320.0,
                cy: 240.0,
                distortion: Default::default(),
            },
        )
    }

    fn two_camera_scene(observations: Vec<Observation>) -> PhotogrammetryResult<Scene> {
        let cameras = [camera(0), camera(1)]
            .into_iter()
            .map(|c| (c.id, c))
            .collect();
        let points = [Point3D::unestimated(PointId(0))]
            .into_iter()
            .map(|p| (p.id, p))
            .collect();
        Scene::new(cameras, points, observations)
    }

    #[test]
    fn test_valid_scene_builds_tracks() -> PhotogrammetryResult<()> {
        let scene = two_camera_scene(vec![
            Observation::new(CameraId(0), PointId(0), Vector2::new(300.0, 200.0)),
            Observation::new(CameraId(1), PointId(0), Vector2::new(310.0, 205.0)),
        ])?;
        assert_eq!(scene.track(PointId(0)), &[0, 1]);
        assert_eq!(scene.observations_of(PointId(0)).count(), 2);
        assert_eq!(scene.num_valid_points(), 0);
        Ok(())
    }

    #[test]
    fn test_dangling_camera_is_malformed() {
        let result = two_camera_scene(vec![Observation::new(
            CameraId(9),
            PointId(0),
            Vector2::new(1.0, 2.0),
        )]);
        assert!(matches!(result, Err(PhotogrammetryError::MalformedInput(_))));
    }

    #[test]
    fn test_dangling_point_is_malformed() {
        let result = two_camera_scene(vec![Observation::new(
            CameraId(0),
            PointId(4),
            Vector2::new(1.0, 2.0),
        )]);
        assert!(matches!(result, Err(PhotogrammetryError::MalformedInput(_))));
    }

    #[test]
    fn test_duplicate_and_bad_weight_rejected() {
        let obs = Observation::new(CameraId(0), PointId(0), Vector2::new(1.0, 2.0));
        assert!(two_camera_scene(vec![obs, obs]).is_err());
        assert!(two_camera_scene(vec![obs.with_weight(0.0)]).is_err());
    }

    #[test]
    fn test_set_point_position_marks_valid() -> PhotogrammetryResult<()> {
        let mut scene = two_camera_scene(Vec::new())?;
        scene.set_point_position(PointId(0), Vector3::new(1.0, 2.0, 3.0))?;
        assert!(scene.point(PointId(0)).is_some_and(|p| p.is_valid()));
        assert!(
            scene
                .set_point_position(PointId(0), Vector3::new(f64::NAN, 0.0, 0.0))
                .is_err()
        );
        scene.invalidate_point(PointId(0))?;
        assert_eq!(scene.num_valid_points(), 0);
        Ok(())
    }

    #[test]
    fn test_json_round_trip_rebuilds_tracks() -> Result<(), Box<dyn std::error::Error>> {
        let scene = two_camera_scene(vec![
            Observation::new(CameraId(0), PointId(0), Vector2::new(300.0, 200.0)),
            Observation::new(CameraId(1), PointId(0), Vector2::new(310.0, 205.0)),
        ])?;

        let json = serde_json::to_string(&scene)?;
        assert!(!json.contains("tracks"));
        let decoded: Scene = serde_json::from_str(&json)?;

        assert_eq!(decoded, scene);
        assert_eq!(decoded.track(PointId(0)), &[0, 1]);
        Ok(())
    }

    #[test]
    fn test_deserializing_dangling_camera_fails() -> Result<(), Box<dyn std::error::Error>> {
        let scene = two_camera_scene(vec![Observation::new(
            CameraId(0),
            PointId(0),
            Vector2::new(300.0, 200.0),
        )])?;
        let mut value = serde_json::to_value(&scene)?;
        value["observations"][0]["camera_id"] = serde_json::json!(77);

        let decoded = serde_json::from_value::<Scene>(value);
        let message = decoded.err().map(|e| e.to_string()).unwrap_or_default();
        assert!(message.contains("unknown camera"), "got: {message}");
        Ok(())
    }
}
