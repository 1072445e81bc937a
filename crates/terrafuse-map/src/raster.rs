//! Point-cloud rasterization.
//!
//! Bins world-frame points into the cells of one tile and produces the
//! rover-observed grid the fusion engine merges.  Each cell keeps a running
//! mean and variance of the elevations that fell into it (Welford's
//! algorithm); the reported variance is floored at a configured minimum so a
//! single return never claims perfect certainty.
//!
//! # Example
//!
//! ```rust
//! use terrafuse_map::grid::TileGrid;
//! use terrafuse_map::raster::Rasterizer;
//! use terrafuse_perception::CloudPoint;
//! use terrafuse_types::{CellGrid, CellState, TileId};
//!
//! let grid = TileGrid::new(0.0, 0.0, 1.0, 4, 4).unwrap();
//! let raster = Rasterizer::new(grid, 0.01);
//! let mut observed = CellGrid::new(4, 4);
//!
//! let points = [CloudPoint::new(1.5, 2.5, 0.4, 0.0), CloudPoint::new(1.2, 2.1, 0.6, 0.0)];
//! let stats = raster.rasterize_into(TileId::new(0, 0), &points, &mut observed).unwrap();
//!
//! assert_eq!(stats.cells, 1);
//! let cell = observed.get(1, 2).unwrap();
//! assert_eq!(cell.state, CellState::Observed);
//! assert!((cell.elevation - 0.5).abs() < 1e-6);
//! ```

use terrafuse_perception::CloudPoint;
use terrafuse_types::{Cell, CellGrid, DemError, TileId};
use tracing::debug;

use crate::grid::TileGrid;

/// Counters reported by one rasterization pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RasterStats {
    /// Points handed in.
    pub points: usize,
    /// Points that landed in the target tile.
    pub binned: usize,
    /// Points that belong to another tile.
    pub outside: usize,
    /// Points with a non-finite coordinate.
    pub invalid: usize,
    /// Cells written.
    pub cells: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct Accumulator {
    n: u32,
    mean: f64,
    m2: f64,
}

impl Accumulator {
    fn push(&mut self, z: f64) {
        self.n += 1;
        let delta = z - self.mean;
        self.mean += delta / self.n as f64;
        self.m2 += delta * (z - self.mean);
    }

    fn variance(&self) -> f64 {
        if self.n == 0 { 0.0 } else { self.m2 / self.n as f64 }
    }
}

/// Bins points into tile-aligned cell grids.
#[derive(Debug, Clone, Copy)]
pub struct Rasterizer {
    grid: TileGrid,
    min_variance: f32,
}

impl Rasterizer {
    pub fn new(grid: TileGrid, min_variance: f32) -> Self {
        Self { grid, min_variance }
    }

    pub fn grid(&self) -> &TileGrid {
        &self.grid
    }

    /// Bin `points` into `out`, which must have the tile's shape.
    ///
    /// Only cells that received at least one point are written; they become
    /// `Observed` with the mean elevation of their points.  Every other cell
    /// of `out` is left untouched.  Statistics are not carried between
    /// calls, so a cell written by an earlier call is replaced, not updated.
    pub fn rasterize_into(
        &self,
        tile: TileId,
        points: &[CloudPoint],
        out: &mut CellGrid,
    ) -> Result<RasterStats, DemError> {
        let (w, h) = (self.grid.tile_width(), self.grid.tile_height());
        if out.width() != w || out.height() != h {
            return Err(DemError::SizeMismatch {
                expected: w * h,
                actual: out.len(),
            });
        }

        let mut stats = RasterStats {
            points: points.len(),
            ..RasterStats::default()
        };
        let mut acc = vec![Accumulator::default(); w * h];
        for p in points {
            if !(p.x.is_finite() && p.y.is_finite() && p.z.is_finite()) {
                stats.invalid += 1;
                continue;
            }
            let loc = self.grid.locate(p.x as f64, p.y as f64);
            if loc.tile != tile {
                stats.outside += 1;
                continue;
            }
            acc[loc.row * w + loc.col].push(p.z as f64);
            stats.binned += 1;
        }

        for (cell, a) in out.cells_mut().iter_mut().zip(&acc) {
            if a.n == 0 {
                continue;
            }
            let variance = (a.variance() as f32).max(self.min_variance);
            *cell = Cell::observed(a.mean as f32, variance);
            stats.cells += 1;
        }

        debug!(
            tile = %tile,
            points = stats.points,
            binned = stats.binned,
            outside = stats.outside,
            invalid = stats.invalid,
            cells = stats.cells,
            "point cloud rasterized"
        );
        Ok(stats)
    }
}
