//! Sensor frame files.
//!
//! One JSON document per fusion cycle:
//!
//! ```json
//! {
//!   "sensor_to_robot": { "translation": {"x": 0.2, "y": 0.0, "z": 1.1},
//!                        "rotation": {"w": 1.0, "x": 0.0, "y": 0.0, "z": 0.0} },
//!   "robot_to_world":  { "translation": {"x": 12.0, "y": -3.5, "z": 0.0},
//!                        "rotation": {"w": 0.707, "x": 0.0, "y": 0.0, "z": 0.707} },
//!   "points": [[1.0, 0.5, -1.1, 37.0], [1.2, 0.4, -1.0]]
//! }
//! ```
//!
//! Points are `[x, y, z]`, `[x, y, z, intensity]` or `{x, y, z, intensity}`.

use std::fs;
use std::path::Path;

use serde::Deserialize;
use terrafuse_perception::{CloudPoint, RigidPose};

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
enum FramePoint {
    Xyzi([f32; 4]),
    Xyz([f32; 3]),
    Object(CloudPoint),
}

impl From<FramePoint> for CloudPoint {
    fn from(p: FramePoint) -> Self {
        match p {
            FramePoint::Xyzi(a) => a.into(),
            FramePoint::Xyz(a) => a.into(),
            FramePoint::Object(p) => p,
        }
    }
}

/// One decoded sensor frame.
#[derive(Debug, Clone, Deserialize)]
pub struct Frame {
    pub sensor_to_robot: RigidPose,
    pub robot_to_world: RigidPose,
    points: Vec<FramePoint>,
}

impl Frame {
    pub fn parse(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn load(path: &Path) -> Result<Self, String> {
        let raw = fs::read_to_string(path).map_err(|e| format!("Failed to read frame {}: {}", path.display(), e))?;
        Self::parse(&raw).map_err(|e| format!("Failed to parse frame {}: {}", path.display(), e))
    }

    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    /// Points in the sensor frame.
    pub fn cloud(&self) -> Vec<CloudPoint> {
        self.points.iter().copied().map(CloudPoint::from).collect()
    }
}
