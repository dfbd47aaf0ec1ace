//! Deterministic synthetic scenes with ground truth.
//!
//! Cameras sit on a horizontal ring around the origin, all looking at it.
//! Points are drawn uniformly from a cube centered on the origin and projected
//! into every camera that sees them, with Gaussian pixel noise generated by a
//! seeded `StdRng` through the Box-Muller transform.

use super::{CameraId, Observation, Point3D, PointId, Scene, SceneBuilder};
use crate::error::{PhotogrammetryError, PhotogrammetryResult};
use crate::geometry::{Camera, Intrinsics, Pose};
use nalgebra::{Vector2, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::f64::consts::PI;
use tracing::debug;

/// Synthetic scene together with the values it was generated from.
#[derive(Debug, Clone)]
pub struct SyntheticScene {
    pub scene: Scene,
    pub ground_truth_points: BTreeMap<PointId, Vector3<f64>>,
    pub ground_truth_poses: BTreeMap<CameraId, Pose>,
}

impl SyntheticScene {
    /// Euclidean distance from an estimated point to its ground truth.
    pub fn point_error(&self, id: PointId, estimate: &Vector3<f64>) -> Option<f64> {
        self.ground_truth_points
            .get(&id)
            .map(|truth| (truth - estimate).norm())
    }

    /// Mean distance of all valid scene points to ground truth.
    pub fn mean_point_error(&self, scene: &Scene) -> f64 {
        let errors: Vec<f64> = scene
            .points()
            .values()
            .filter(|p| p.is_valid())
            .filter_map(|p| self.point_error(p.id, &p.position))
            .collect();
        if errors.is_empty() {
            return 0.0;
        }
        errors.iter().sum::<f64>() / errors.len() as f64
    }
}

/// Builder for [`SyntheticScene`].
#[derive(Debug, Clone)]
pub struct SyntheticSceneBuilder {
    pub num_cameras: usize,
    pub num_points: usize,
    /// Standard deviation of the pixel noise
    pub noise_std_px: f64,
    pub seed: u64,
    /// Radius of the camera ring
    pub ring_radius: f64,
    /// Height of the camera ring above the origin
    pub ring_height: f64,
    /// Half side length of the point cube
    pub point_extent: f64,
    pub intrinsics: Intrinsics,
    pub image_width: f64,
    pub image_height: f64,
    /// Translation noise std (world units) applied to every camera but the first
    pub pose_translation_noise: f64,
    /// Rotation noise std (degrees) applied to every camera but the first
    pub pose_rotation_noise_deg: f64,
    /// Store noisy ground-truth positions instead of leaving points unestimated
    pub seed_points_noise: Option<f64>,
}

impl Default for SyntheticSceneBuilder {
    fn default() -> Self {
        Self {
            num_cameras: 5,
            num_points: 50,
            noise_std_px: 1.0,
            seed: 42,
            ring_radius: 10.0,
            ring_height: 2.0,
            point_extent: 1.5,
            intrinsics: Intrinsics {
                fx: 800.0,
                fy: 800.0,
                cx: 320.0,
                cy: 240.0,
                distortion: Default::default(),
            },
            image_width: 640.0,
            image_height: 480.0,
            pose_translation_noise: 0.0,
            pose_rotation_noise_deg: 0.0,
            seed_points_noise: None,
        }
    }
}

/// Sample a standard normal value with the Box-Muller transform.
fn sample_standard_normal(rng: &mut StdRng) -> f64 {
    // u1 in (0, 1] keeps ln finite
    let u1: f64 = 1.0 - rng.random::<f64>();
    let u2: f64 = rng.random();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}

fn sample_normal_vector3(rng: &mut StdRng, std_dev: f64) -> Vector3<f64> {
    Vector3::new(
        sample_standard_normal(rng),
        sample_standard_normal(rng),
        sample_standard_normal(rng),
    ) * std_dev
}

impl SyntheticSceneBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cameras(mut self, num_cameras: usize) -> Self {
        self.num_cameras = num_cameras;
        self
    }

    pub fn with_points(mut self, num_points: usize) -> Self {
        self.num_points = num_points;
        self
    }

    pub fn with_noise(mut self, noise_std_px: f64) -> Self {
        self.noise_std_px = noise_std_px;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_ring(mut self, radius: f64, height: f64) -> Self {
        self.ring_radius = radius;
        self.ring_height = height;
        self
    }

    pub fn with_intrinsics(mut self, intrinsics: Intrinsics) -> Self {
        self.intrinsics = intrinsics;
        self
    }

    pub fn with_pose_noise(mut self, translation_std: f64, rotation_std_deg: f64) -> Self {
        self.pose_translation_noise = translation_std;
        self.pose_rotation_noise_deg = rotation_std_deg;
        self
    }

    pub fn with_seeded_points(mut self, position_noise_std: f64) -> Self {
        self.seed_points_noise = Some(position_noise_std);
        self
    }

    fn validate(&self) -> PhotogrammetryResult<()> {
        if self.num_cameras < 2 {
            return Err(PhotogrammetryError::MalformedInput(
                "synthetic scene needs at least 2 cameras".to_string(),
            ));
        }
        let non_negative = [
            self.noise_std_px,
            self.pose_translation_noise,
            self.pose_rotation_noise_deg,
            self.seed_points_noise.unwrap_or(0.0),
        ];
        if non_negative.iter().any(|v| !(v.is_finite() && *v >= 0.0)) {
            return Err(PhotogrammetryError::MalformedInput(
                "noise levels must be finite and non-negative".to_string(),
            ));
        }
        if !(self.ring_radius > self.point_extent * 3f64.sqrt()) {
            return Err(PhotogrammetryError::MalformedInput(
                "camera ring must enclose the point cube".to_string(),
            ));
        }
        self.intrinsics.validate()?;
        Ok(())
    }

    fn in_image(&self, pixel: &Vector2<f64>) -> bool {
        pixel.x >= 0.0 && pixel.x < self.image_width && pixel.y >= 0.0 && pixel.y < self.image_height
    }

    /// Generate the scene and its ground truth.
    pub fn generate(&self) -> PhotogrammetryResult<SyntheticScene> {
        self.validate()?;
        let mut rng = StdRng::seed_from_u64(self.seed);

        let mut true_cameras = Vec::with_capacity(self.num_cameras);
        let mut cameras = BTreeMap::new();
        let mut ground_truth_poses = BTreeMap::new();
        for i in 0..self.num_cameras {
            let angle = 2.0 * PI * i as f64 / self.num_cameras as f64;
            let eye = Vector3::new(
                self.ring_radius * angle.cos(),
                self.ring_radius * angle.sin(),
                self.ring_height,
            );
            let pose = Pose::look_at(&eye, &Vector3::zeros(), &Vector3::z())?;
            let id = CameraId(i as u32);
            ground_truth_poses.insert(id, pose);
            true_cameras.push(Camera::new(id, pose, self.intrinsics));

            let initial_pose = if i == 0 {
                pose
            } else {
                let dt = sample_normal_vector3(&mut rng, self.pose_translation_noise);
                let dw = sample_normal_vector3(&mut rng, self.pose_rotation_noise_deg.to_radians());
                pose.retract(&dt, &dw)
            };
            cameras.insert(id, Camera::new(id, initial_pose, self.intrinsics));
        }

        let mut points = BTreeMap::new();
        let mut ground_truth_points = BTreeMap::new();
        let mut observations = Vec::new();
        for j in 0..self.num_points {
            let id = PointId(j as u32);
            let truth = Vector3::new(
                rng.random_range(-self.point_extent..=self.point_extent),
                rng.random_range(-self.point_extent..=self.point_extent),
                rng.random_range(-self.point_extent..=self.point_extent),
            );
            ground_truth_points.insert(id, truth);

            let point = match self.seed_points_noise {
                Some(std_dev) => Point3D::seeded(id, truth + sample_normal_vector3(&mut rng, std_dev)),
                None => Point3D::unestimated(id),
            };
            points.insert(id, point);

            for camera in &true_cameras {
                let Ok(pixel) = camera.project(&truth) else {
                    continue;
                };
                if !self.in_image(&pixel) {
                    continue;
                }
                let noise = Vector2::new(
                    sample_standard_normal(&mut rng),
                    sample_standard_normal(&mut rng),
                ) * self.noise_std_px;
                observations.push(Observation::new(camera.id, id, pixel + noise));
            }
        }

        debug!(
            "Synthetic scene: {} cameras, {} points, {} observations (seed {})",
            cameras.len(),
            points.len(),
            observations.len(),
            self.seed
        );

        Ok(SyntheticScene {
            scene: Scene::new(cameras, points, observations)?,
            ground_truth_points,
            ground_truth_poses,
        })
    }
}

impl SceneBuilder for SyntheticSceneBuilder {
    fn build_scene(&self) -> PhotogrammetryResult<Scene> {
        self.generate().map(|synthetic| synthetic.scene)
    }
}
