//! Geometry primitives: rigid poses, the pinhole camera model and viewing rays.
//!
//! # Conventions
//!
//! - Poses are **world-to-camera**: a world point `p_w` maps to camera space as
//!   `p_c = R · p_w + t`.
//! - Camera axes: +z forward (viewing direction), +x right, +y down.
//! - Rotations are stored as unit quaternions and exposed as rotation matrices,
//!   so every rotation handed out is orthonormal with determinant +1.
//! - Pose increments use a left perturbation with a decoupled translation:
//!
//! ```text
//! R ← Exp(δω) · R
//! t ← Exp(δω) · t + δt
//! ```
//!
//! which gives the simple camera-frame derivative `∂p_c/∂[δt; δω] = [ I | -[p_c]× ]`.

use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

pub mod camera;

pub use camera::{Camera, Distortion, Intrinsics, Ray, backproject, project};

/// Minimum depth for valid 3D points in camera space.
///
/// Points closer than this to the image plane (or behind it) cannot be projected.
pub const MIN_DEPTH: f64 = 1e-6;

/// Tolerance used when validating user supplied rotation matrices.
pub const ROTATION_TOLERANCE: f64 = 1e-6;

/// Below this squared angle the exponential map uses its first-order expansion.
const SMALL_ANGLE_THRESHOLD: f64 = 1e-10;

/// Camera model and pose errors.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CameraModelError {
    #[error("Point is at or behind the camera (depth = {depth:.3e})")]
    PointBehindCamera { depth: f64 },
    #[error("Focal length must be positive")]
    FocalLengthMustBePositive,
    #[error("Principal point must be finite")]
    PrincipalPointMustBeFinite,
    #[error("Invalid rotation: {0}")]
    InvalidRotation(String),
    #[error("Invalid camera parameters: {0}")]
    InvalidParams(String),
}

/// Skew-symmetric cross-product matrix `[v]×` such that `[v]× · w = v × w`.
pub fn skew_symmetric(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Exponential map from an axis-angle vector to a unit quaternion.
pub fn exp_so3(axis_angle: &Vector3<f64>) -> UnitQuaternion<f64> {
    if axis_angle.norm_squared() > SMALL_ANGLE_THRESHOLD {
        UnitQuaternion::from_scaled_axis(*axis_angle)
    } else {
        UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(
            1.0,
            axis_angle.x / 2.0,
            axis_angle.y / 2.0,
            axis_angle.z / 2.0,
        ))
    }
}

/// Rigid world-to-camera transform.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    rotation: UnitQuaternion<f64>,
    translation: Vector3<f64>,
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

impl Pose {
    /// Degrees of freedom of a pose increment `[δt; δω]`.
    pub const DOF: usize = 6;

    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Build a pose from a world-to-camera rotation matrix.
    ///
    /// The matrix must be orthonormal with determinant +1 (within [`ROTATION_TOLERANCE`]).
    pub fn from_rotation_matrix(
        rotation: &Matrix3<f64>,
        translation: Vector3<f64>,
    ) -> Result<Self, CameraModelError> {
        validate_rotation_matrix(rotation)?;
        if !translation.iter().all(|v| v.is_finite()) {
            return Err(CameraModelError::InvalidParams(
                "translation must be finite".to_string(),
            ));
        }
        let rot = Rotation3::from_matrix_unchecked(*rotation);
        Ok(Self {
            rotation: UnitQuaternion::from_rotation_matrix(&rot),
            translation,
        })
    }

    /// Build a pose from the camera center in world coordinates and the
    /// world-to-camera rotation (`t = -R · c`).
    pub fn from_center(rotation: UnitQuaternion<f64>, center: &Vector3<f64>) -> Self {
        let translation = -(rotation * center);
        Self {
            rotation,
            translation,
        }
    }

    /// Camera at `eye` looking at `target`, with image +y pointing away from `up`.
    pub fn look_at(
        eye: &Vector3<f64>,
        target: &Vector3<f64>,
        up: &Vector3<f64>,
    ) -> Result<Self, CameraModelError> {
        let forward = target - eye;
        if forward.norm() < MIN_DEPTH {
            return Err(CameraModelError::InvalidParams(
                "look_at target coincides with eye".to_string(),
            ));
        }
        let z_c = forward.normalize();
        let right = z_c.cross(up);
        if right.norm() < 1e-9 {
            return Err(CameraModelError::InvalidParams(
                "look_at up vector is parallel to the viewing direction".to_string(),
            ));
        }
        let x_c = right.normalize();
        let y_c = z_c.cross(&x_c);

        // Rows are the camera axes expressed in world coordinates.
        let r = Matrix3::from_rows(&[x_c.transpose(), y_c.transpose(), z_c.transpose()]);
        let rot = Rotation3::from_matrix_unchecked(r);
        Ok(Self::from_center(
            UnitQuaternion::from_rotation_matrix(&rot),
            eye,
        ))
    }

    pub fn rotation(&self) -> &UnitQuaternion<f64> {
        &self.rotation
    }

    /// World-to-camera rotation matrix.
    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    pub fn translation(&self) -> &Vector3<f64> {
        &self.translation
    }

    /// Camera center in world coordinates: `c = -Rᵀ · t`.
    pub fn center(&self) -> Vector3<f64> {
        -(self.rotation.inverse() * self.translation)
    }

    /// Map a world point into camera space.
    pub fn transform_point(&self, p_world: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p_world + self.translation
    }

    /// Map a camera-space point back into world coordinates.
    pub fn inverse_transform_point(&self, p_cam: &Vector3<f64>) -> Vector3<f64> {
        self.rotation.inverse() * (p_cam - self.translation)
    }

    /// Apply a local increment `[δt; δω]` and re-orthonormalize the rotation.
    pub fn retract(&self, delta_translation: &Vector3<f64>, delta_rotation: &Vector3<f64>) -> Self {
        let dq = exp_so3(delta_rotation);
        let mut rotation = dq * self.rotation;
        rotation.renormalize();
        Self {
            rotation,
            translation: dq * self.translation + delta_translation,
        }
    }

    /// Geodesic rotation distance (radians) and translation distance to another pose.
    pub fn distance(&self, other: &Pose) -> (f64, f64) {
        (
            self.rotation.angle_to(&other.rotation),
            (self.translation - other.translation).norm(),
        )
    }

    pub fn is_finite(&self) -> bool {
        self.translation.iter().all(|v| v.is_finite())
            && self.rotation.coords.iter().all(|v| v.is_finite())
    }

    /// Check that the stored rotation is a proper rotation.
    pub fn is_valid(&self, tolerance: f64) -> bool {
        self.is_finite()
            && (self.rotation.coords.norm() - 1.0).abs() < tolerance
            && validate_rotation_matrix(&self.rotation_matrix()).is_ok()
    }
}

/// Verify `RᵀR = I` and `det(R) = +1`.
pub fn validate_rotation_matrix(rotation: &Matrix3<f64>) -> Result<(), CameraModelError> {
    if !rotation.iter().all(|v| v.is_finite()) {
        return Err(CameraModelError::InvalidRotation(
            "rotation contains non-finite values".to_string(),
        ));
    }
    let orthogonality = (rotation.transpose() * rotation - Matrix3::identity()).norm();
    if orthogonality > ROTATION_TOLERANCE {
        return Err(CameraModelError::InvalidRotation(format!(
            "rotation is not orthonormal (|RᵀR - I| = {orthogonality:.3e})"
        )));
    }
    let det = rotation.determinant();
    if (det - 1.0).abs() > ROTATION_TOLERANCE {
        return Err(CameraModelError::InvalidRotation(format!(
            "rotation determinant is {det:.6}, expected +1"
        )));
    }
    Ok(())
}
