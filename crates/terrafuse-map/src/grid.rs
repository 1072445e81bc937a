//! World ↔ tile coordinate mapping.
//!
//! The map is an unbounded lattice of equally sized tiles anchored at the
//! map origin.  A world position first becomes a *global* cell index by
//! flooring `(x - x0) / scale`; Euclidean division then splits that index
//! into a tile index and an in-tile cell index.  Flooring (not truncation)
//! keeps negative coordinates on the same lattice, so tiles never overlap
//! and never leave a gap around the origin.

use terrafuse_types::{DemError, TileId};

use crate::config::MapConfig;

/// Snap tolerance, in units of the scaled coordinate's last place.  Absorbs
/// the rounding of `x / scale` for positions that lie exactly on a cell
/// boundary without pulling in positions that are merely close to one.
const BOUNDARY_SNAP_ULPS: f64 = 4.0;

/// Where a world position lands in the tile lattice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellLocation {
    pub tile: TileId,
    /// Column inside the tile, `0..tile_width`.
    pub col: usize,
    /// Row inside the tile, `0..tile_height`.
    pub row: usize,
}

/// Geo-referenced tile lattice.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileGrid {
    origin_x: f64,
    origin_y: f64,
    scale: f64,
    tile_width: usize,
    tile_height: usize,
}

impl TileGrid {
    pub fn new(
        origin_x: f64,
        origin_y: f64,
        scale: f64,
        tile_width: usize,
        tile_height: usize,
    ) -> Result<Self, DemError> {
        if !(scale.is_finite() && scale > 0.0) {
            return Err(DemError::InvalidConfig(format!("scale must be > 0, got {scale}")));
        }
        if tile_width == 0 || tile_height == 0 {
            return Err(DemError::InvalidConfig(format!(
                "tile size must be non-zero, got {tile_width}x{tile_height}"
            )));
        }
        if !(origin_x.is_finite() && origin_y.is_finite()) {
            return Err(DemError::InvalidConfig("grid origin must be finite".to_string()));
        }
        Ok(Self {
            origin_x,
            origin_y,
            scale,
            tile_width,
            tile_height,
        })
    }

    pub fn from_config(config: &MapConfig) -> Result<Self, DemError> {
        Self::new(
            config.origin_x,
            config.origin_y,
            config.scale,
            config.width,
            config.height,
        )
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn tile_width(&self) -> usize {
        self.tile_width
    }

    pub fn tile_height(&self) -> usize {
        self.tile_height
    }

    /// Map a world position to its tile and in-tile cell.
    ///
    /// Callers are expected to pass finite coordinates; non-finite input
    /// saturates to the lattice edge.
    pub fn locate(&self, x: f64, y: f64) -> CellLocation {
        let col = self.global_index(x - self.origin_x);
        let row = self.global_index(y - self.origin_y);
        let (tw, th) = (self.tile_width as i64, self.tile_height as i64);
        CellLocation {
            tile: TileId::new(col.div_euclid(tw), row.div_euclid(th)),
            col: col.rem_euclid(tw) as usize,
            row: row.rem_euclid(th) as usize,
        }
    }

    pub fn tile_of(&self, x: f64, y: f64) -> TileId {
        self.locate(x, y).tile
    }

    /// World position of the tile's minimum corner.
    pub fn tile_origin(&self, id: TileId) -> (f64, f64) {
        (
            self.origin_x + (id.sx * self.tile_width as i64) as f64 * self.scale,
            self.origin_y + (id.sy * self.tile_height as i64) as f64 * self.scale,
        )
    }

    /// World position of the centre of cell `(col, row)` of tile `id`.
    pub fn cell_center(&self, id: TileId, col: usize, row: usize) -> (f64, f64) {
        let (x0, y0) = self.tile_origin(id);
        (
            x0 + (col as f64 + 0.5) * self.scale,
            y0 + (row as f64 + 0.5) * self.scale,
        )
    }

    fn global_index(&self, offset: f64) -> i64 {
        let q = offset / self.scale;
        let nearest = q.round();
        if (q - nearest).abs() <= BOUNDARY_SNAP_ULPS * f64::EPSILON * q.abs().max(1.0) {
            nearest as i64
        } else {
            q.floor() as i64
        }
    }
}
