//! Pinhole camera model with optional forward Brown-Conrady distortion.
//!
//! # Mathematical Model
//!
//! ## Projection (3D → 2D)
//!
//! For a world point `p_w` and a camera with pose `(R, t)`:
//!
//! ```text
//! p_c = R · p_w + t                 (camera frame, z > 0 required)
//! x'  = X / Z,  y' = Y / Z          (normalized image plane)
//! r²  = x'² + y'²
//! d   = 1 + k1·r² + k2·r⁴ + k3·r⁶
//! xd  = x'·d + 2·p1·x'y' + p2·(r² + 2x'²)
//! yd  = y'·d + p1·(r² + 2y'²) + 2·p2·x'y'
//! u   = fx · xd + cx
//! v   = fy · yd + cy
//! ```
//!
//! Distortion is only applied forward; [`backproject`] returns the undistorted
//! pinhole ray.
//!
//! ## Jacobians
//!
//! With `∂π/∂p_c` the 2×3 projection Jacobian in the camera frame:
//!
//! ```text
//! ∂π/∂[δt; δω] = ∂π/∂p_c · [ I | -[p_c]× ]      (2×6)
//! ∂π/∂p_w      = ∂π/∂p_c · R                    (2×3)
//! ```
//!
//! # References
//!
//! - Hartley & Zisserman, "Multiple View Geometry in Computer Vision", Chapter 6

use super::{CameraModelError, MIN_DEPTH, Pose, skew_symmetric};
use crate::scene::CameraId;
use nalgebra::{Matrix2, Matrix2x3, SMatrix, Vector2, Vector3};
use serde::{Deserialize, Serialize};

/// Lens distortion applied in the normalized image plane.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum Distortion {
    /// Perfect pinhole
    #[default]
    None,
    /// Brown-Conrady / OpenCV radial-tangential model
    BrownConrady {
        k1: f64,
        k2: f64,
        p1: f64,
        p2: f64,
        k3: f64,
    },
}

impl Distortion {
    fn is_finite(&self) -> bool {
        match *self {
            Distortion::None => true,
            Distortion::BrownConrady { k1, k2, p1, p2, k3 } => {
                [k1, k2, p1, p2, k3].iter().all(|v| v.is_finite())
            }
        }
    }

    /// Distort a normalized point and return the 2×2 Jacobian `∂(xd, yd)/∂(x', y')`.
    fn apply(&self, x: f64, y: f64) -> (Vector2<f64>, Matrix2<f64>) {
        match *self {
            Distortion::None => (Vector2::new(x, y), Matrix2::identity()),
            Distortion::BrownConrady { k1, k2, p1, p2, k3 } => {
                let r2 = x * x + y * y;
                let r4 = r2 * r2;
                let r6 = r4 * r2;
                let radial = 1.0 + k1 * r2 + k2 * r4 + k3 * r6;

                let xd = x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
                let yd = y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;

                // ∂radial/∂r² = k1 + 2·k2·r² + 3·k3·r⁴, and ∂r²/∂x = 2x
                let d_radial_d_r2 = k1 + 2.0 * k2 * r2 + 3.0 * k3 * r4;
                let d_radial_dx = 2.0 * x * d_radial_d_r2;
                let d_radial_dy = 2.0 * y * d_radial_d_r2;

                let dxd_dx = radial + x * d_radial_dx + 2.0 * p1 * y + 6.0 * p2 * x;
                let dxd_dy = x * d_radial_dy + 2.0 * p1 * x + 2.0 * p2 * y;
                let dyd_dx = y * d_radial_dx + 2.0 * p1 * x + 2.0 * p2 * y;
                let dyd_dy = radial + y * d_radial_dy + 6.0 * p1 * y + 2.0 * p2 * x;

                (
                    Vector2::new(xd, yd),
                    Matrix2::new(dxd_dx, dxd_dy, dyd_dx, dyd_dy),
                )
            }
        }
    }
}

/// Intrinsic parameters. Fixed during adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    /// Focal length in x direction (pixels)
    pub fx: f64,
    /// Focal length in y direction (pixels)
    pub fy: f64,
    /// Principal point x-coordinate (pixels)
    pub cx: f64,
    /// Principal point y-coordinate (pixels)
    pub cy: f64,
    #[serde(default)]
    pub distortion: Distortion,
}

impl Intrinsics {
    /// Create pinhole intrinsics with validation.
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Result<Self, CameraModelError> {
        let intrinsics = Self {
            fx,
            fy,
            cx,
            cy,
            distortion: Distortion::None,
        };
        intrinsics.validate()?;
        Ok(intrinsics)
    }

    pub fn with_distortion(mut self, distortion: Distortion) -> Self {
        self.distortion = distortion;
        self
    }

    pub fn validate(&self) -> Result<(), CameraModelError> {
        if !(self.fx > 0.0 && self.fy > 0.0) || !self.fx.is_finite() || !self.fy.is_finite() {
            return Err(CameraModelError::FocalLengthMustBePositive);
        }
        if !self.cx.is_finite() || !self.cy.is_finite() {
            return Err(CameraModelError::PrincipalPointMustBeFinite);
        }
        if !self.distortion.is_finite() {
            return Err(CameraModelError::InvalidParams(
                "distortion coefficients must be finite".to_string(),
            ));
        }
        Ok(())
    }

    /// Project a camera-frame point, returning the pixel and `∂(u, v)/∂p_c`.
    pub fn project_with_jacobian(
        &self,
        p_cam: &Vector3<f64>,
    ) -> Result<(Vector2<f64>, Matrix2x3<f64>), CameraModelError> {
        if p_cam.z < MIN_DEPTH {
            return Err(CameraModelError::PointBehindCamera { depth: p_cam.z });
        }
        let inv_z = 1.0 / p_cam.z;
        let x = p_cam.x * inv_z;
        let y = p_cam.y * inv_z;

        let (distorted, d_dist) = self.distortion.apply(x, y);
        let pixel = Vector2::new(
            self.fx * distorted.x + self.cx,
            self.fy * distorted.y + self.cy,
        );

        // ∂(x', y')/∂p_c
        let d_norm = Matrix2x3::new(inv_z, 0.0, -x * inv_z, 0.0, inv_z, -y * inv_z);
        let focal = Matrix2::new(self.fx, 0.0, 0.0, self.fy);

        Ok((pixel, focal * d_dist * d_norm))
    }

    /// Project a camera-frame point to pixel coordinates.
    pub fn project(&self, p_cam: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError> {
        self.project_with_jacobian(p_cam).map(|(pixel, _)| pixel)
    }

    /// Undistorted viewing direction in the camera frame (not normalized, z = 1).
    pub fn unproject(&self, pixel: &Vector2<f64>) -> Vector3<f64> {
        Vector3::new(
            (pixel.x - self.cx) / self.fx,
            (pixel.y - self.cy) / self.fy,
            1.0,
        )
    }
}

/// Half-line in world coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ray {
    /// Camera center
    pub origin: Vector3<f64>,
    /// Unit viewing direction
    pub direction: Vector3<f64>,
}

impl Ray {
    /// Point at the given distance along the ray.
    pub fn point_at(&self, distance: f64) -> Vector3<f64> {
        self.origin + self.direction * distance
    }

    /// Perpendicular distance from a point to the ray's supporting line.
    pub fn distance_to(&self, point: &Vector3<f64>) -> f64 {
        let v = point - self.origin;
        (v - self.direction * self.direction.dot(&v)).norm()
    }

    /// Angle between two ray directions in radians.
    pub fn angle_to(&self, other: &Ray) -> f64 {
        self.direction.dot(&other.direction).clamp(-1.0, 1.0).acos()
    }
}

/// Calibrated camera: identifier, world-to-camera pose and fixed intrinsics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Camera {
    pub id: CameraId,
    pub pose: Pose,
    pub intrinsics: Intrinsics,
}

impl Camera {
    pub fn new(id: CameraId, pose: Pose, intrinsics: Intrinsics) -> Self {
        Self {
            id,
            pose,
            intrinsics,
        }
    }

    pub fn center(&self) -> Vector3<f64> {
        self.pose.center()
    }

    /// Project a world point to pixel coordinates.
    ///
    /// Fails with [`CameraModelError::PointBehindCamera`] if the transformed point
    /// has depth below [`MIN_DEPTH`].
    pub fn project(&self, p_world: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError> {
        self.intrinsics.project(&self.pose.transform_point(p_world))
    }

    /// Project a world point and return the Jacobians with respect to the pose
    /// increment `[δt; δω]` (2×6) and the world point (2×3).
    pub fn project_with_jacobians(
        &self,
        p_world: &Vector3<f64>,
    ) -> Result<(Vector2<f64>, SMatrix<f64, 2, 6>, Matrix2x3<f64>), CameraModelError> {
        let p_cam = self.pose.transform_point(p_world);
        let (pixel, d_pix_d_pcam) = self.intrinsics.project_with_jacobian(&p_cam)?;

        let neg_skew = -skew_symmetric(&p_cam);
        let d_pcam_d_pose = SMatrix::<f64, 3, 6>::from_fn(|r, c| {
            if c < 3 {
                if r == c { 1.0 } else { 0.0 }
            } else {
                neg_skew[(r, c - 3)]
            }
        });

        let jac_pose = d_pix_d_pcam * d_pcam_d_pose;
        let jac_point = d_pix_d_pcam * self.pose.rotation_matrix();
        Ok((pixel, jac_pose, jac_point))
    }

    /// World-frame viewing ray through a pixel.
    pub fn backproject(&self, pixel: &Vector2<f64>) -> Ray {
        let direction_cam = self.intrinsics.unproject(pixel);
        let direction = (self.pose.rotation().inverse() * direction_cam).normalize();
        Ray {
            origin: self.pose.center(),
            direction,
        }
    }

    /// Depth of a world point along the camera's optical axis.
    pub fn depth_of(&self, p_world: &Vector3<f64>) -> f64 {
        self.pose.transform_point(p_world).z
    }
}

/// Project a world point through a camera. See [`Camera::project`].
pub fn project(camera: &Camera, point: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError> {
    camera.project(point)
}

/// Backproject a pixel into a world-frame ray. See [`Camera::backproject`].
pub fn backproject(camera: &Camera, pixel: &Vector2<f64>) -> Ray {
    camera.backproject(pixel)
}
