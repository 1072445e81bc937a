//! Point-cloud transformer.
//!
//! [`PointCloudTransformer`] is the single pipeline object that holds the
//! current sensor→world transform and the working point buffer.  Poses may
//! arrive independently (the sensor mount rarely changes, the rover pose
//! changes every cycle); the transform is recomputed whenever either pose is
//! replaced and both are known.
//!
//! # Example
//!
//! ```rust
//! use terrafuse_perception::cloud::{CloudPoint, PointCloudTransformer};
//! use terrafuse_perception::transform::{Quaternion, RigidPose, Vec3};
//!
//! let mut tf = PointCloudTransformer::new("base_link", "terrain");
//! tf.set_sensor_pose(RigidPose::identity()).unwrap();
//! tf.set_robot_pose(RigidPose::new(Vec3::new(5.0, 0.0, 0.0), Quaternion::identity())).unwrap();
//!
//! let points = vec![CloudPoint::new(1.0, 2.0, 3.0, 0.8)];
//! tf.set_point_cloud(points, 1).unwrap();
//! tf.transform();
//!
//! assert_eq!(tf.points()[0], CloudPoint::new(6.0, 2.0, 3.0, 0.8));
//! ```

use serde::{Deserialize, Serialize};
use terrafuse_types::DemError;
use tracing::debug;

use crate::transform::{HomogeneousTransform, RigidPose, compose_sensor_to_world};

/// A single range return: position plus a fourth channel (intensity).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CloudPoint {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    /// Carried through transformation unchanged.
    #[serde(default)]
    pub intensity: f32,
}

impl CloudPoint {
    pub fn new(x: f32, y: f32, z: f32, intensity: f32) -> Self {
        Self { x, y, z, intensity }
    }
}

impl From<[f32; 3]> for CloudPoint {
    fn from(p: [f32; 3]) -> Self {
        Self::new(p[0], p[1], p[2], 0.0)
    }
}

impl From<[f32; 4]> for CloudPoint {
    fn from(p: [f32; 4]) -> Self {
        Self::new(p[0], p[1], p[2], p[3])
    }
}

/// Holds the sensor→world transform and rewrites a point buffer into the
/// world frame in place.
#[derive(Debug)]
pub struct PointCloudTransformer {
    robot_frame: String,
    fixed_frame: String,
    sensor_to_robot: Option<RigidPose>,
    robot_to_world: Option<RigidPose>,
    sensor_to_world: HomogeneousTransform,
    points: Vec<CloudPoint>,
}

impl PointCloudTransformer {
    /// Create a transformer with an identity transform and an empty cloud.
    ///
    /// The frame names are only used to label log output.
    pub fn new(robot_frame: impl Into<String>, fixed_frame: impl Into<String>) -> Self {
        Self {
            robot_frame: robot_frame.into(),
            fixed_frame: fixed_frame.into(),
            sensor_to_robot: None,
            robot_to_world: None,
            sensor_to_world: HomogeneousTransform::identity(),
            points: Vec::new(),
        }
    }

    pub fn robot_frame(&self) -> &str {
        &self.robot_frame
    }

    pub fn fixed_frame(&self) -> &str {
        &self.fixed_frame
    }

    /// Replace the active sensor→world transform.  Nothing else changes.
    pub fn set_transform(&mut self, transform: HomogeneousTransform) {
        self.sensor_to_world = transform;
    }

    pub fn transform_matrix(&self) -> &HomogeneousTransform {
        &self.sensor_to_world
    }

    /// Store a new sensor→robot pose.
    ///
    /// On [`DemError::InvalidPose`] neither the stored pose nor the active
    /// transform is modified.
    pub fn set_sensor_pose(&mut self, pose: RigidPose) -> Result<(), DemError> {
        pose.to_matrix()?;
        self.sensor_to_robot = Some(pose);
        self.recompute()
    }

    /// Store a new robot→world pose.  Same failure semantics as
    /// [`set_sensor_pose`][Self::set_sensor_pose].
    pub fn set_robot_pose(&mut self, pose: RigidPose) -> Result<(), DemError> {
        pose.to_matrix()?;
        self.robot_to_world = Some(pose);
        self.recompute()
    }

    pub fn robot_pose(&self) -> Option<&RigidPose> {
        self.robot_to_world.as_ref()
    }

    fn recompute(&mut self) -> Result<(), DemError> {
        if let (Some(s2r), Some(r2w)) = (&self.sensor_to_robot, &self.robot_to_world) {
            self.sensor_to_world = compose_sensor_to_world(s2r, r2w)?;
        }
        Ok(())
    }

    /// Replace the working buffer.
    ///
    /// `count` is the logical length announced by the producer; it must
    /// match `points.len()` or [`DemError::SizeMismatch`] is returned and
    /// the previous buffer is kept.
    pub fn set_point_cloud(&mut self, points: Vec<CloudPoint>, count: usize) -> Result<(), DemError> {
        if points.len() != count {
            return Err(DemError::SizeMismatch {
                expected: count,
                actual: points.len(),
            });
        }
        self.points = points;
        Ok(())
    }

    pub fn points(&self) -> &[CloudPoint] {
        &self.points
    }

    pub fn cloud_size(&self) -> usize {
        self.points.len()
    }

    /// Hand the buffer downstream, leaving the transformer empty.
    pub fn take_points(&mut self) -> Vec<CloudPoint> {
        std::mem::take(&mut self.points)
    }

    /// Apply the active transform to every stored point, in place.
    ///
    /// The intensity channel is left untouched.  An empty cloud is a no-op.
    pub fn transform(&mut self) {
        let m = self.sensor_to_world.as_row_major();
        for p in &mut self.points {
            let (x, y, z) = (p.x as f64, p.y as f64, p.z as f64);
            p.x = (m[0] * x + m[1] * y + m[2] * z + m[3]) as f32;
            p.y = (m[4] * x + m[5] * y + m[6] * z + m[7]) as f32;
            p.z = (m[8] * x + m[9] * y + m[10] * z + m[11]) as f32;
        }
        debug!(
            points = self.points.len(),
            from = %self.robot_frame,
            to = %self.fixed_frame,
            "point cloud transformed"
        );
    }
}
