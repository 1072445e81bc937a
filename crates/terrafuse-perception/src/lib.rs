//! `terrafuse-perception` – sensor-to-world geometry.
//!
//! Takes the raw point cloud a range sensor hands over, together with the
//! two rigid poses that locate the sensor on the rover and the rover in the
//! terrain frame, and produces world-frame points ready for rasterisation.
//!
//! # Modules
//!
//! - [`transform`] – [`RigidPose`][transform::RigidPose] and
//!   [`HomogeneousTransform`][transform::HomogeneousTransform]: quaternion
//!   poses, their 4×4 matrix form, and the sensor→robot→world composition.
//! - [`cloud`] – [`PointCloudTransformer`][cloud::PointCloudTransformer]:
//!   owns a point buffer and rewrites it in place into the world frame.

pub mod cloud;
pub mod transform;

pub use cloud::{CloudPoint, PointCloudTransformer};
pub use transform::{HomogeneousTransform, Quaternion, RigidPose, Vec3, compose_sensor_to_world};
