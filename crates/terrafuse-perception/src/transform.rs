//! Rigid-body transforms.
//!
//! A [`RigidPose`] is a translation plus a unit-quaternion rotation that maps
//! points expressed in a child frame into its parent frame.  Each pose has a
//! 4×4 homogeneous matrix form ([`HomogeneousTransform`]); chaining two poses
//! is a matrix product.
//!
//! The mapping pipeline only ever needs one chain: sensor → robot → world.
//! [`compose_sensor_to_world`] builds `T = M(robot→world) · M(sensor→robot)`.
//!
//! # Example
//!
//! ```rust
//! use terrafuse_perception::transform::{compose_sensor_to_world, Quaternion, RigidPose, Vec3};
//!
//! // Lidar mounted 0.5 m ahead of the body centre, 1 m up.
//! let sensor_to_robot = RigidPose::new(Vec3::new(0.5, 0.0, 1.0), Quaternion::identity());
//! // Rover parked at (10, 20) in the terrain frame.
//! let robot_to_world = RigidPose::new(Vec3::new(10.0, 20.0, 0.0), Quaternion::identity());
//!
//! let t = compose_sensor_to_world(&sensor_to_robot, &robot_to_world).unwrap();
//! let (x, y, z) = t.apply(0.0, 0.0, 0.0);
//! assert!((x - 10.5).abs() < 1e-9);
//! assert!((y - 20.0).abs() < 1e-9);
//! assert!((z - 1.0).abs() < 1e-9);
//! ```

use serde::{Deserialize, Serialize};
use terrafuse_types::DemError;

/// Quaternions shorter than this are treated as degenerate.
const MIN_QUATERNION_NORM: f64 = 1e-12;

// ────────────────────────────────────────────────────────────────────────────
// Primitive types
// ────────────────────────────────────────────────────────────────────────────

/// A 3-D translation vector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    /// Create a new vector.
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// The zero vector.
    pub fn zero() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    pub fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }

    fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

/// A rotation quaternion (w, x, y, z convention).
///
/// Values arriving from upstream are not trusted to be unit length;
/// [`Quaternion::normalized`] is applied before any conversion to a matrix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quaternion {
    pub w: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Quaternion {
    /// Create a quaternion.  No normalisation is performed here.
    pub fn new(w: f64, x: f64, y: f64, z: f64) -> Self {
        Self { w, x, y, z }
    }

    /// The identity rotation (no rotation).
    pub fn identity() -> Self {
        Self::new(1.0, 0.0, 0.0, 0.0)
    }

    /// Rotation of `angle_rad` around the vertical axis.
    pub fn from_yaw(angle_rad: f64) -> Self {
        let half = angle_rad * 0.5;
        Self::new(half.cos(), 0.0, 0.0, half.sin())
    }

    /// Hamilton product: compose two rotations.
    pub fn mul(self, rhs: Self) -> Self {
        Self::new(
            self.w * rhs.w - self.x * rhs.x - self.y * rhs.y - self.z * rhs.z,
            self.w * rhs.x + self.x * rhs.w + self.y * rhs.z - self.z * rhs.y,
            self.w * rhs.y - self.x * rhs.z + self.y * rhs.w + self.z * rhs.x,
            self.w * rhs.z + self.x * rhs.y - self.y * rhs.x + self.z * rhs.w,
        )
    }

    /// Conjugate (== inverse for a unit quaternion).
    pub fn conjugate(self) -> Self {
        Self::new(self.w, -self.x, -self.y, -self.z)
    }

    /// Rotate a vector by this quaternion: p' = q * p * q*.
    pub fn rotate(self, v: Vec3) -> Vec3 {
        let p = Self::new(0.0, v.x, v.y, v.z);
        let rotated = self.mul(p).mul(self.conjugate());
        Vec3::new(rotated.x, rotated.y, rotated.z)
    }

    pub fn norm(&self) -> f64 {
        (self.w * self.w + self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    /// Scale to unit length.
    ///
    /// Returns [`DemError::InvalidPose`] for a zero-norm or non-finite
    /// quaternion, which has no meaningful rotation.
    pub fn normalized(self) -> Result<Self, DemError> {
        let n = self.norm();
        if !n.is_finite() || n < MIN_QUATERNION_NORM {
            return Err(DemError::InvalidPose(format!(
                "quaternion ({}, {}, {}, {}) cannot be normalised",
                self.w, self.x, self.y, self.z
            )));
        }
        Ok(Self::new(self.w / n, self.x / n, self.y / n, self.z / n))
    }

    /// Row-major 3×3 rotation matrix of a unit quaternion.
    fn to_rotation_matrix(self) -> [[f64; 3]; 3] {
        let Self { w, x, y, z } = self;
        [
            [
                1.0 - 2.0 * (y * y + z * z),
                2.0 * (x * y - w * z),
                2.0 * (x * z + w * y),
            ],
            [
                2.0 * (x * y + w * z),
                1.0 - 2.0 * (x * x + z * z),
                2.0 * (y * z - w * x),
            ],
            [
                2.0 * (x * z - w * y),
                2.0 * (y * z + w * x),
                1.0 - 2.0 * (x * x + y * y),
            ],
        ]
    }
}

// ────────────────────────────────────────────────────────────────────────────
// RigidPose
// ────────────────────────────────────────────────────────────────────────────

/// Pose of a child frame in its parent frame: rotate, then translate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RigidPose {
    pub translation: Vec3,
    pub rotation: Quaternion,
}

impl RigidPose {
    /// Create a pose from a translation and rotation.
    pub fn new(translation: Vec3, rotation: Quaternion) -> Self {
        Self {
            translation,
            rotation,
        }
    }

    /// The identity pose (no translation, no rotation).
    pub fn identity() -> Self {
        Self::new(Vec3::zero(), Quaternion::identity())
    }

    /// Build `M(P)`: rotation in the top-left 3×3 block, translation in the
    /// last column, `(0, 0, 0, 1)` as the bottom row.
    pub fn to_matrix(&self) -> Result<HomogeneousTransform, DemError> {
        if !self.translation.is_finite() {
            return Err(DemError::InvalidPose(format!(
                "non-finite translation {:?}",
                self.translation
            )));
        }
        let r = self.rotation.normalized()?.to_rotation_matrix();
        let t = self.translation;
        Ok(HomogeneousTransform::from_row_major([
            r[0][0], r[0][1], r[0][2], t.x, //
            r[1][0], r[1][1], r[1][2], t.y, //
            r[2][0], r[2][1], r[2][2], t.z, //
            0.0, 0.0, 0.0, 1.0,
        ]))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// HomogeneousTransform
// ────────────────────────────────────────────────────────────────────────────

/// A row-major 4×4 homogeneous transform.
///
/// Element `i * 4 + j` is row `i`, column `j`; the 3×3 rotation block sits
/// in indices 0–2, 4–6, 8–10 and the translation in 3, 7, 11.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HomogeneousTransform {
    m: [f64; 16],
}

impl HomogeneousTransform {
    pub fn identity() -> Self {
        Self::from_row_major([
            1.0, 0.0, 0.0, 0.0, //
            0.0, 1.0, 0.0, 0.0, //
            0.0, 0.0, 1.0, 0.0, //
            0.0, 0.0, 0.0, 1.0,
        ])
    }

    pub fn from_row_major(m: [f64; 16]) -> Self {
        Self { m }
    }

    pub fn as_row_major(&self) -> &[f64; 16] {
        &self.m
    }

    /// Matrix product `self · rhs`: apply `rhs` first, then `self`.
    pub fn compose(&self, rhs: &Self) -> Self {
        let a = &self.m;
        let b = &rhs.m;
        let mut out = [0.0; 16];
        for i in 0..4 {
            for j in 0..4 {
                out[i * 4 + j] = (0..4).map(|k| a[i * 4 + k] * b[k * 4 + j]).sum();
            }
        }
        Self { m: out }
    }

    /// Map one point: `R · p + t`.
    pub fn apply(&self, x: f64, y: f64, z: f64) -> (f64, f64, f64) {
        let m = &self.m;
        (
            m[0] * x + m[1] * y + m[2] * z + m[3],
            m[4] * x + m[5] * y + m[6] * z + m[7],
            m[8] * x + m[9] * y + m[10] * z + m[11],
        )
    }

    /// The translation column.
    pub fn translation(&self) -> Vec3 {
        Vec3::new(self.m[3], self.m[7], self.m[11])
    }

    /// Recover the unit quaternion of the rotation block, sign-normalised so
    /// that `w >= 0`.
    pub fn rotation(&self) -> Quaternion {
        let m = &self.m;
        let (r00, r01, r02) = (m[0], m[1], m[2]);
        let (r10, r11, r12) = (m[4], m[5], m[6]);
        let (r20, r21, r22) = (m[8], m[9], m[10]);
        let trace = r00 + r11 + r22;

        let q = if trace > 0.0 {
            let s = (trace + 1.0).sqrt() * 2.0;
            Quaternion::new(0.25 * s, (r21 - r12) / s, (r02 - r20) / s, (r10 - r01) / s)
        } else if r00 > r11 && r00 > r22 {
            let s = (1.0 + r00 - r11 - r22).sqrt() * 2.0;
            Quaternion::new((r21 - r12) / s, 0.25 * s, (r01 + r10) / s, (r02 + r20) / s)
        } else if r11 > r22 {
            let s = (1.0 + r11 - r00 - r22).sqrt() * 2.0;
            Quaternion::new((r02 - r20) / s, (r01 + r10) / s, 0.25 * s, (r12 + r21) / s)
        } else {
            let s = (1.0 + r22 - r00 - r11).sqrt() * 2.0;
            Quaternion::new((r10 - r01) / s, (r02 + r20) / s, (r12 + r21) / s, 0.25 * s)
        };

        if q.w < 0.0 {
            Quaternion::new(-q.w, -q.x, -q.y, -q.z)
        } else {
            q
        }
    }
}

impl Default for HomogeneousTransform {
    fn default() -> Self {
        Self::identity()
    }
}

/// Compose `T = M(robot_to_world) · M(sensor_to_robot)`.
///
/// Fails with [`DemError::InvalidPose`] when either pose cannot be turned
/// into a matrix; no partially-built transform is ever returned.
pub fn compose_sensor_to_world(
    sensor_to_robot: &RigidPose,
    robot_to_world: &RigidPose,
) -> Result<HomogeneousTransform, DemError> {
    let inner = sensor_to_robot.to_matrix()?;
    let outer = robot_to_world.to_matrix()?;
    Ok(outer.compose(&inner))
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
