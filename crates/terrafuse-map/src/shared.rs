//! Thread-safe handle on a fusion engine.
//!
//! One thread ingests sensor frames while others query the map.  The engine
//! sits behind a single `Mutex`; a fusion cycle holds it across the position
//! update, rasterization and merge, so readers see either the map before the
//! cycle or after it, never a half-merged tile.

use std::sync::{Arc, Mutex, MutexGuard};

use terrafuse_perception::CloudPoint;
use terrafuse_types::{Cell, DemError};

use crate::fusion::{DemFusionEngine, FuseStats, MapError, SwapOutcome};
use crate::raster::RasterStats;
use crate::store::TileStore;
use crate::tile::Tile;

/// What one [`SharedDem::fuse_cycle`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub swap: SwapOutcome,
    pub raster: RasterStats,
    pub fuse: FuseStats,
}

/// Cloneable, lock-protected [`DemFusionEngine`].
pub struct SharedDem<S: TileStore> {
    inner: Arc<Mutex<DemFusionEngine<S>>>,
}

impl<S: TileStore> Clone for SharedDem<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: TileStore> SharedDem<S> {
    pub fn new(engine: DemFusionEngine<S>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(engine)),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, DemFusionEngine<S>>, DemError> {
        self.inner.lock().map_err(|_| DemError::LockPoisoned)
    }

    /// Run one complete cycle under the lock: page to the rover's position,
    /// rasterize the world-frame points and fuse them.
    pub fn fuse_cycle(&self, x: f64, y: f64, points: &[CloudPoint]) -> Result<CycleReport, MapError> {
        let mut engine = self.lock()?;
        let swap = engine.update_position(x, y)?;
        let raster = engine.rasterize(points)?;
        let fuse = engine.fuse()?;
        Ok(CycleReport { swap, raster, fuse })
    }

    pub fn cell_at(&self, x: f64, y: f64) -> Result<Option<Cell>, MapError> {
        Ok(self.lock()?.cell_at(x, y))
    }

    /// Copy of the current tile.
    pub fn snapshot_current(&self) -> Result<Option<Tile>, MapError> {
        Ok(self.lock()?.current_tile().cloned())
    }

    pub fn flush(&self) -> Result<bool, MapError> {
        self.lock()?.flush()
    }

    /// Run `f` with exclusive access to the engine.
    pub fn with_engine<R>(&self, f: impl FnOnce(&mut DemFusionEngine<S>) -> R) -> Result<R, MapError> {
        let mut engine = self.lock()?;
        Ok(f(&mut engine))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapConfig;
    use crate::store::SqliteTileStore;
    use std::thread;
    use terrafuse_types::{CellState, TileId};

    fn shared() -> SharedDem<SqliteTileStore> {
        let config = MapConfig {
            scale: 1.0,
            ..MapConfig::default()
        };
        let mut engine = DemFusionEngine::new(config, SqliteTileStore::open_in_memory().unwrap());
        engine.init(8, 8).unwrap();
        SharedDem::new(engine)
    }

    #[test]
    fn fuse_cycle_runs_whole_pipeline() {
        let dem = shared();
        let report = dem
            .fuse_cycle(1.0, 1.0, &[CloudPoint::new(2.5, 3.5, 0.7, 0.0)])
            .unwrap();
        assert_eq!(report.swap, SwapOutcome::Activated(TileId::new(0, 0)));
        assert_eq!(report.raster.cells, 1);
        assert_eq!(report.fuse.adopted, 1);

        let cell = dem.cell_at(2.5, 3.5).unwrap().unwrap();
        assert_eq!(cell.state, CellState::Observed);
        assert!((cell.elevation - 0.7).abs() < 1e-6);
    }

    #[test]
    fn readers_never_see_partial_merge() {
        let dem = shared();
        dem.fuse_cycle(0.5, 0.5, &[]).unwrap();

        // Cycle k lifts all 64 cells to elevation k; a snapshot taken
        // mid-merge would mix two elevations.
        let scan = |z: f32| -> Vec<CloudPoint> {
            (0..8)
                .flat_map(|r| (0..8).map(move |c| CloudPoint::new(c as f32 + 0.5, r as f32 + 0.5, z, 0.0)))
                .collect()
        };

        let writer = {
            let dem = dem.clone();
            thread::spawn(move || {
                for k in 1..=20 {
                    dem.fuse_cycle(0.5, 0.5, &scan(k as f32)).unwrap();
                }
            })
        };
        for _ in 0..50 {
            let tile = dem.snapshot_current().unwrap().unwrap();
            let observed: Vec<f32> = tile
                .cells()
                .cells()
                .iter()
                .filter(|c| c.state == CellState::Observed)
                .map(|c| c.elevation)
                .collect();
            assert!(observed.is_empty() || observed.len() == 64, "saw {} observed cells", observed.len());
            assert!(
                observed.windows(2).all(|w| w[0] == w[1]),
                "snapshot mixes elevations: {observed:?}"
            );
        }
        writer.join().unwrap();

        let tile = dem.snapshot_current().unwrap().unwrap();
        assert_eq!(tile.cells().count_state(CellState::Observed), 64);
        assert!(tile.cells().cells().iter().all(|c| c.elevation == tile.cells().cells()[0].elevation));
    }

    #[test]
    fn poisoned_lock_is_reported() {
        let dem = shared();
        let poisoner = dem.clone();
        let _ = thread::spawn(move || {
            let _guard = poisoner.inner.lock().unwrap();
            panic!("writer died");
        })
        .join();

        assert!(matches!(
            dem.cell_at(0.0, 0.0),
            Err(MapError::Dem(DemError::LockPoisoned))
        ));
    }

    #[test]
    fn with_engine_exposes_engine() {
        let dem = shared();
        dem.fuse_cycle(9.0, 1.0, &[]).unwrap();
        let id = dem.with_engine(|e| e.current_id()).unwrap();
        assert_eq!(id, Some(TileId::new(1, 0)));
        assert!(!dem.flush().unwrap());
    }
}
