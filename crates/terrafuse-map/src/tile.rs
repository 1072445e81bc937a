//! A single DEM tile: a cell grid plus its geo-referencing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use terrafuse_types::{Cell, CellGrid, CellState, TileId};

use crate::config::MapConfig;
use crate::grid::TileGrid;

/// Geo-referencing metadata persisted alongside the cell bands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileMeta {
    pub id: TileId,
    /// World position of the tile's minimum corner.
    pub origin_x: f64,
    pub origin_y: f64,
    /// Elevation offset of the stored band.
    pub origin_z: f64,
    /// Horizontal scale (metres per cell).
    pub scale: f64,
    /// Vertical scale of the stored elevation band.
    pub z_scale: f64,
    pub updated_at: DateTime<Utc>,
}

/// A fixed-size grid of cells owned by exactly one tile.
#[derive(Debug, Clone, PartialEq)]
pub struct Tile {
    meta: TileMeta,
    cells: CellGrid,
    dirty: bool,
}

impl Tile {
    /// Wrap loaded or constructed data.  The tile starts clean.
    pub fn new(meta: TileMeta, cells: CellGrid) -> Self {
        Self {
            meta,
            cells,
            dirty: false,
        }
    }

    /// Build a never-seen tile, seeded from the configured ground prior.
    pub fn fresh(id: TileId, grid: &TileGrid, config: &MapConfig) -> Self {
        let (origin_x, origin_y) = grid.tile_origin(id);
        let seed = match config.ground_prior {
            Some(prior) => Cell::ground_prior(prior.elevation, prior.variance),
            None => Cell::UNKNOWN,
        };
        let meta = TileMeta {
            id,
            origin_x,
            origin_y,
            origin_z: config.origin_z,
            scale: grid.scale(),
            z_scale: config.z_scale,
            updated_at: Utc::now(),
        };
        Self::new(meta, CellGrid::filled(grid.tile_width(), grid.tile_height(), seed))
    }

    pub fn id(&self) -> TileId {
        self.meta.id
    }

    pub fn meta(&self) -> &TileMeta {
        &self.meta
    }

    pub fn cells(&self) -> &CellGrid {
        &self.cells
    }

    /// Mutable access to the cells.  Callers that change anything must call
    /// [`mark_dirty`][Self::mark_dirty].
    pub fn cells_mut(&mut self) -> &mut CellGrid {
        &mut self.cells
    }

    /// True when the in-memory cells differ from what was last persisted.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
        self.meta.updated_at = Utc::now();
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn summary(&self) -> TileSummary {
        let mut summary = TileSummary {
            id: self.meta.id,
            width: self.cells.width(),
            height: self.cells.height(),
            unknown: 0,
            ground_prior: 0,
            observed: 0,
            min_elevation: None,
            max_elevation: None,
            updated_at: self.meta.updated_at,
        };
        for cell in self.cells.cells() {
            match cell.state {
                CellState::Unknown => summary.unknown += 1,
                CellState::GroundPrior => summary.ground_prior += 1,
                CellState::Observed => {
                    summary.observed += 1;
                    let e = cell.elevation;
                    summary.min_elevation = Some(summary.min_elevation.map_or(e, |m| m.min(e)));
                    summary.max_elevation = Some(summary.max_elevation.map_or(e, |m| m.max(e)));
                }
            }
        }
        summary
    }
}

/// Per-state cell counts and the observed elevation range of a tile.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TileSummary {
    pub id: TileId,
    pub width: usize,
    pub height: usize,
    pub unknown: usize,
    pub ground_prior: usize,
    pub observed: usize,
    pub min_elevation: Option<f32>,
    pub max_elevation: Option<f32>,
    pub updated_at: DateTime<Utc>,
}
