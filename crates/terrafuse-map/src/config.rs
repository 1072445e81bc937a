//! Map and storage settings.
//!
//! Both sections deserialize from TOML with per-field defaults, so a config
//! file only needs to mention what it changes.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use terrafuse_types::DemError;

/// Elevation and variance used to seed cells of a freshly created tile.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GroundPrior {
    pub elevation: f32,
    pub variance: f32,
}

/// Geometry and fusion settings of the DEM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapConfig {
    /// Tile width in cells.
    #[serde(default = "default_tile_cells")]
    pub width: usize,

    /// Tile height in cells.
    #[serde(default = "default_tile_cells")]
    pub height: usize,

    /// Horizontal scale: world units (metres) per cell.
    #[serde(default = "default_scale")]
    pub scale: f64,

    /// Vertical scale of stored elevation bands (metres per band unit).
    #[serde(default = "default_z_scale")]
    pub z_scale: f64,

    #[serde(default)]
    pub origin_x: f64,
    #[serde(default)]
    pub origin_y: f64,
    #[serde(default)]
    pub origin_z: f64,

    /// Above this variance an existing estimate is replaced outright by a
    /// new observation instead of being averaged with it.
    #[serde(default = "default_variance_threshold")]
    pub variance_threshold: f32,

    /// Lower bound on the variance the rasterizer reports for a cell.
    #[serde(default = "default_min_variance")]
    pub min_variance: f32,

    /// Number of clean tiles kept resident next to the active one.
    /// `0` disables prefetching.
    #[serde(default = "default_swap_window")]
    pub swap_window: usize,

    /// Optional flat-ground prior for new tiles; `None` leaves them unknown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ground_prior: Option<GroundPrior>,
}

fn default_tile_cells() -> usize {
    256
}
fn default_scale() -> f64 {
    0.1
}
fn default_z_scale() -> f64 {
    1.0
}
fn default_variance_threshold() -> f32 {
    0.25
}
fn default_min_variance() -> f32 {
    0.0004
}
fn default_swap_window() -> usize {
    2
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            width: default_tile_cells(),
            height: default_tile_cells(),
            scale: default_scale(),
            z_scale: default_z_scale(),
            origin_x: 0.0,
            origin_y: 0.0,
            origin_z: 0.0,
            variance_threshold: default_variance_threshold(),
            min_variance: default_min_variance(),
            swap_window: default_swap_window(),
            ground_prior: None,
        }
    }
}

impl MapConfig {
    /// Reject settings the engine cannot work with.
    pub fn validate(&self) -> Result<(), DemError> {
        if self.width == 0 || self.height == 0 {
            return Err(DemError::InvalidConfig(format!(
                "tile size must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        if !(self.scale.is_finite() && self.scale > 0.0) {
            return Err(DemError::InvalidConfig(format!("scale must be > 0, got {}", self.scale)));
        }
        if !(self.z_scale.is_finite() && self.z_scale > 0.0) {
            return Err(DemError::InvalidConfig(format!(
                "z_scale must be > 0, got {}",
                self.z_scale
            )));
        }
        if ![self.origin_x, self.origin_y, self.origin_z].iter().all(|v| v.is_finite()) {
            return Err(DemError::InvalidConfig("map origin must be finite".to_string()));
        }
        if self.variance_threshold.is_nan() || self.variance_threshold < 0.0 {
            return Err(DemError::InvalidConfig(format!(
                "variance_threshold must be >= 0, got {}",
                self.variance_threshold
            )));
        }
        if !(self.min_variance.is_finite() && self.min_variance >= 0.0) {
            return Err(DemError::InvalidConfig(format!(
                "min_variance must be >= 0, got {}",
                self.min_variance
            )));
        }
        if let Some(prior) = &self.ground_prior
            && !(prior.elevation.is_finite() && prior.variance.is_finite() && prior.variance >= 0.0)
        {
            return Err(DemError::InvalidConfig(format!("invalid ground prior {prior:?}")));
        }
        Ok(())
    }
}

/// Which [`TileStore`][crate::store::TileStore] implementation backs the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// One file per tile under `root`.
    #[default]
    Files,
    /// A single SQLite database at `root/tiles.sqlite`.
    Sqlite,
}

impl std::fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageBackend::Files => write!(f, "files"),
            StorageBackend::Sqlite => write!(f, "sqlite"),
        }
    }
}

/// Where fused tiles are persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// Map storage root directory.
    #[serde(default = "default_root")]
    pub root: PathBuf,
}

fn default_root() -> PathBuf {
    PathBuf::from("./dem")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            root: default_root(),
        }
    }
}
