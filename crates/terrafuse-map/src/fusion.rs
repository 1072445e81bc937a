//! DEM Fusion Engine.
//!
//! Owns the active window of the map (the tile under the rover plus a few
//! warm neighbours) and merges rover observations into it.  Paging is an
//! explicit transition driven by [`DemFusionEngine::update_position`]:
//! when the rover crosses into another tile the outgoing tile is written
//! back through the [`TileStore`] before the incoming one becomes current.
//!
//! # Cell merge policy
//!
//! | fused cell                      | observed cell          | result                 |
//! |---------------------------------|------------------------|------------------------|
//! | any                             | not `Observed`         | unchanged              |
//! | `Unknown`                       | `Observed`             | adopt observation      |
//! | `GroundPrior`                   | variance < threshold   | adopt observation      |
//! | `GroundPrior`                   | variance ≥ threshold   | unchanged              |
//! | `Observed`, variance > threshold| `Observed`             | adopt observation      |
//! | `Observed`                      | `Observed`             | inverse-variance blend |
//!
//! The blend is
//! ```text
//! e' = (e_f / v_f + e_o / v_o) / (1 / v_f + 1 / v_o)
//! v' = 1 / (1 / v_f + 1 / v_o)          clamped to min(v_f, v_o)
//! ```
//! A side with zero variance is exact and wins outright.
//!
//! # Example
//!
//! ```rust
//! use terrafuse_map::config::MapConfig;
//! use terrafuse_map::fusion::{DemFusionEngine, SwapOutcome};
//! use terrafuse_map::store::SqliteTileStore;
//! use terrafuse_types::{Cell, CellState, TileId};
//!
//! let config = MapConfig { scale: 1.0, ..MapConfig::default() };
//! let store = SqliteTileStore::open_in_memory().unwrap();
//! let mut engine = DemFusionEngine::new(config, store);
//! engine.init(16, 16).unwrap();
//!
//! let outcome = engine.update_position(3.5, 4.5).unwrap();
//! assert_eq!(outcome, SwapOutcome::Activated(TileId::new(0, 0)));
//!
//! *engine.observed_mut().unwrap().get_mut(3, 4).unwrap() = Cell::observed(5.0, 1.0);
//! let stats = engine.fuse().unwrap();
//! assert_eq!(stats.adopted, 1);
//!
//! let cell = engine.cell_at(3.5, 4.5).unwrap();
//! assert_eq!(cell.state, CellState::Observed);
//! assert_eq!(cell.elevation, 5.0);
//! assert!(engine.flush().unwrap());
//! ```

use std::collections::VecDeque;

use terrafuse_perception::CloudPoint;
use terrafuse_types::{Cell, CellGrid, CellState, DemError, TileId};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::config::MapConfig;
use crate::grid::TileGrid;
use crate::raster::{RasterStats, Rasterizer};
use crate::store::{StoreError, TileStore};
use crate::tile::Tile;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors returned by the engine's public operations.
#[derive(Error, Debug)]
pub enum MapError {
    #[error(transparent)]
    Dem(#[from] DemError),
    #[error("Tile store error: {0}")]
    Store(#[from] StoreError),
    #[error("No active tile; call update_position() first")]
    NoActiveTile,
}

// ─────────────────────────────────────────────────────────────────────────────
// Cell merge
// ─────────────────────────────────────────────────────────────────────────────

/// What [`merge`] did to the fused cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The observation carried no measurement.
    Unchanged,
    /// The observation was a measurement but the fused cell was kept.
    Rejected,
    /// The fused cell was replaced by the observation.
    Adopted,
    /// Both estimates were blended.
    Combined,
}

/// Merge one observed cell into one fused cell.
pub fn merge(dst: &mut Cell, src: &Cell, variance_threshold: f32) -> MergeOutcome {
    if src.state != CellState::Observed {
        return MergeOutcome::Unchanged;
    }
    if !src.elevation.is_finite() || src.variance.is_nan() || src.variance < 0.0 {
        return MergeOutcome::Rejected;
    }

    let adopt = match dst.state {
        CellState::Unknown => true,
        CellState::GroundPrior => src.variance < variance_threshold,
        CellState::Observed => dst.variance > variance_threshold,
    };
    if dst.state == CellState::GroundPrior && !adopt {
        return MergeOutcome::Rejected;
    }
    if adopt {
        *dst = Cell::observed(src.elevation, src.variance);
        return MergeOutcome::Adopted;
    }

    let (vf, vo) = (dst.variance as f64, src.variance as f64);
    if vf == 0.0 {
        return MergeOutcome::Rejected;
    }
    if vo == 0.0 {
        *dst = Cell::observed(src.elevation, 0.0);
        return MergeOutcome::Adopted;
    }
    let (ef, eo) = (dst.elevation as f64, src.elevation as f64);
    let wf = 1.0 / vf;
    let wo = 1.0 / vo;
    let elevation = (ef * wf + eo * wo) / (wf + wo);
    let variance = (1.0 / (wf + wo)).min(vf.min(vo));
    *dst = Cell::observed(elevation as f32, variance as f32);
    MergeOutcome::Combined
}

/// Per-cycle counters returned by [`DemFusionEngine::fuse`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FuseStats {
    /// Observed cells offered to the merge.
    pub observed: usize,
    pub adopted: usize,
    pub combined: usize,
    /// Observed cells the merge declined.
    pub skipped: usize,
}

impl FuseStats {
    /// Number of fused cells that changed.
    pub fn changed(&self) -> usize {
        self.adopted + self.combined
    }
}

/// Result of [`DemFusionEngine::update_position`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapOutcome {
    /// The rover is still on the current tile.
    Unchanged(TileId),
    /// First position after `init`: the tile became current without a swap.
    Activated(TileId),
    /// The outgoing tile was written back and another one became current.
    Swapped { from: TileId, to: TileId },
}

impl SwapOutcome {
    pub fn current(&self) -> TileId {
        match *self {
            SwapOutcome::Unchanged(id) | SwapOutcome::Activated(id) => id,
            SwapOutcome::Swapped { to, .. } => to,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Active window
// ─────────────────────────────────────────────────────────────────────────────

struct ActiveWindow {
    grid: TileGrid,
    rasterizer: Rasterizer,
    current: Option<Tile>,
    /// Clean tiles kept resident, most recent first.
    warm: VecDeque<Tile>,
    observed: CellGrid,
    last_position: Option<(f64, f64)>,
}

impl ActiveWindow {
    fn holds(&self, id: TileId) -> bool {
        self.current.as_ref().is_some_and(|t| t.id() == id) || self.warm.iter().any(|t| t.id() == id)
    }

    fn take_warm(&mut self, id: TileId) -> Option<Tile> {
        let pos = self.warm.iter().position(|t| t.id() == id)?;
        self.warm.remove(pos)
    }

    fn push_warm(&mut self, tile: Tile, limit: usize) {
        debug_assert!(!tile.is_dirty());
        self.warm.retain(|t| t.id() != tile.id());
        self.warm.push_front(tile);
        self.warm.truncate(limit);
    }

    fn fits(&self, tile: &Tile) -> bool {
        tile.cells().width() == self.grid.tile_width() && tile.cells().height() == self.grid.tile_height()
    }
}

/// Load `id` from the store, or build a fresh tile when it was never saved.
fn load_or_create<S: TileStore>(
    store: &S,
    window: &ActiveWindow,
    config: &MapConfig,
    id: TileId,
) -> Result<Tile, StoreError> {
    match store.load(id) {
        Ok(tile) if window.fits(&tile) => Ok(tile),
        Ok(tile) => Err(StoreError::Corrupt(format!(
            "tile {id} is {}x{}, map expects {}x{}",
            tile.cells().width(),
            tile.cells().height(),
            window.grid.tile_width(),
            window.grid.tile_height()
        ))),
        Err(StoreError::NotFound(_)) => {
            debug!(tile = %id, "tile not in store; creating fresh");
            Ok(Tile::fresh(id, &window.grid, config))
        }
        Err(e) => Err(e),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// DemFusionEngine
// ─────────────────────────────────────────────────────────────────────────────

/// Tiled DEM fusion engine over a [`TileStore`].
pub struct DemFusionEngine<S: TileStore> {
    config: MapConfig,
    store: S,
    window: Option<ActiveWindow>,
}

impl<S: TileStore> DemFusionEngine<S> {
    /// Create an uninitialized engine.  Call [`init`][Self::init] before use.
    pub fn new(config: MapConfig, store: S) -> Self {
        Self {
            config,
            store,
            window: None,
        }
    }

    pub fn config(&self) -> &MapConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn is_initialized(&self) -> bool {
        self.window.is_some()
    }

    /// The tile lattice, once initialized.
    pub fn grid(&self) -> Option<&TileGrid> {
        self.window.as_ref().map(|w| &w.grid)
    }

    /// Set the tile size and enter the ready state.
    ///
    /// Re-initializing writes back the current tile first and then drops the
    /// whole active window.
    pub fn init(&mut self, width: usize, height: usize) -> Result<(), MapError> {
        let mut config = self.config.clone();
        config.width = width;
        config.height = height;
        config.validate()?;
        let grid = TileGrid::from_config(&config)?;

        if self.window.is_some() {
            self.flush()?;
        }
        self.config = config;
        self.window = Some(ActiveWindow {
            grid,
            rasterizer: Rasterizer::new(grid, self.config.min_variance),
            current: None,
            warm: VecDeque::new(),
            observed: CellGrid::new(width, height),
            last_position: None,
        });
        info!(
            width,
            height,
            scale = self.config.scale,
            swap_window = self.config.swap_window,
            "DEM engine initialized"
        );
        Ok(())
    }

    /// Report the rover's world position, paging tiles when it crosses into
    /// another one.
    ///
    /// On a store error the cycle is aborted: if the outgoing tile could not
    /// be saved it stays current (and dirty); if the incoming tile could not
    /// be loaded the outgoing tile, already written back, stays current.
    pub fn update_position(&mut self, x: f64, y: f64) -> Result<SwapOutcome, MapError> {
        if !(x.is_finite() && y.is_finite()) {
            return Err(DemError::InvalidPose(format!("rover position ({x}, {y}) is not finite")).into());
        }
        let window = self.window.as_ref().ok_or(DemError::NotInitialized)?;
        let target = window.grid.tile_of(x, y);

        let outcome = match window.current.as_ref().map(Tile::id) {
            Some(current) if current == target => SwapOutcome::Unchanged(current),
            Some(current) => {
                self.swap_to(target)?;
                SwapOutcome::Swapped {
                    from: current,
                    to: target,
                }
            }
            None => {
                self.swap_to(target)?;
                SwapOutcome::Activated(target)
            }
        };

        self.prefetch_ahead(x, y);
        Ok(outcome)
    }

    #[instrument(level = "info", skip_all, fields(to = %to))]
    fn swap_to(&mut self, to: TileId) -> Result<(), MapError> {
        let Self { config, store, window } = self;
        let window = window.as_mut().ok_or(DemError::NotInitialized)?;

        if let Some(outgoing) = window.current.as_mut()
            && outgoing.is_dirty()
        {
            store.save(outgoing)?;
            outgoing.mark_clean();
            info!(tile = %outgoing.id(), "outgoing tile saved");
        }

        let incoming = match window.take_warm(to) {
            Some(tile) => {
                debug!(tile = %to, "tile taken from warm set");
                tile
            }
            None => load_or_create(store, window, config, to)?,
        };

        let discarded = window.observed.len() - window.observed.count_state(CellState::Unknown);
        if discarded > 0 {
            debug!(cells = discarded, "discarding observations aligned to the outgoing tile");
            window.observed.fill(Cell::UNKNOWN);
        }

        if let Some(outgoing) = window.current.replace(incoming)
            && config.swap_window > 0
        {
            window.push_warm(outgoing, config.swap_window);
        }
        info!(tile = %to, warm = window.warm.len(), "tile activated");
        Ok(())
    }

    /// Warm the neighbour of the current tile in the dominant direction of
    /// travel.  Failures only cost latency on the next swap.
    fn prefetch_ahead(&mut self, x: f64, y: f64) {
        let Self { config, store, window } = self;
        let Some(window) = window.as_mut() else {
            return;
        };
        let previous = window.last_position.replace((x, y));
        if config.swap_window == 0 {
            return;
        }
        let (Some((px, py)), Some(current)) = (previous, window.current.as_ref().map(Tile::id)) else {
            return;
        };
        let (dx, dy) = (x - px, y - py);
        if dx == 0.0 && dy == 0.0 {
            return;
        }
        let step = if dx.abs() >= dy.abs() {
            (dx.signum() as i64, 0)
        } else {
            (0, dy.signum() as i64)
        };
        let ahead = current.offset(step.0, step.1);
        if window.holds(ahead) {
            return;
        }
        match load_or_create(store, window, config, ahead) {
            Ok(tile) => {
                debug!(tile = %ahead, "tile prefetched");
                window.push_warm(tile, config.swap_window);
            }
            Err(e) => warn!(tile = %ahead, error = %e, "tile prefetch failed"),
        }
    }

    /// Replace the rover-observed grid.  Its shape must match the tile.
    pub fn set_observed(&mut self, observed: CellGrid) -> Result<(), MapError> {
        let window = self.window.as_mut().ok_or(DemError::NotInitialized)?;
        if !window.observed.same_shape(&observed) {
            return Err(DemError::SizeMismatch {
                expected: window.observed.len(),
                actual: observed.len(),
            }
            .into());
        }
        window.observed = observed;
        Ok(())
    }

    /// Direct access to the rover-observed grid of the current tile.
    pub fn observed_mut(&mut self) -> Result<&mut CellGrid, MapError> {
        let window = self.window.as_mut().ok_or(DemError::NotInitialized)?;
        Ok(&mut window.observed)
    }

    /// Bin world-frame points into the observed grid of the current tile.
    ///
    /// Each call bins its own points from scratch: a cell hit again by a
    /// later call before [`fuse`][Self::fuse] is overwritten, not averaged
    /// with the earlier pass.  Pass a whole scan in one call.
    pub fn rasterize(&mut self, points: &[CloudPoint]) -> Result<RasterStats, MapError> {
        let window = self.window.as_mut().ok_or(DemError::NotInitialized)?;
        let tile = window.current.as_ref().ok_or(MapError::NoActiveTile)?.id();
        Ok(window.rasterizer.rasterize_into(tile, points, &mut window.observed)?)
    }

    /// Merge the observed grid into the current tile and reset it.
    pub fn fuse(&mut self) -> Result<FuseStats, MapError> {
        let threshold = self.config.variance_threshold;
        let window = self.window.as_mut().ok_or(DemError::NotInitialized)?;
        let tile = window.current.as_mut().ok_or(MapError::NoActiveTile)?;

        let mut stats = FuseStats::default();
        for (dst, src) in tile.cells_mut().cells_mut().iter_mut().zip(window.observed.cells()) {
            match merge(dst, src, threshold) {
                MergeOutcome::Unchanged => continue,
                MergeOutcome::Rejected => stats.skipped += 1,
                MergeOutcome::Adopted => stats.adopted += 1,
                MergeOutcome::Combined => stats.combined += 1,
            }
            stats.observed += 1;
        }
        if stats.changed() > 0 {
            tile.mark_dirty();
        }
        window.observed.fill(Cell::UNKNOWN);

        debug!(
            tile = %tile.id(),
            observed = stats.observed,
            adopted = stats.adopted,
            combined = stats.combined,
            skipped = stats.skipped,
            "observations fused"
        );
        Ok(stats)
    }

    /// Write the current tile back if it has unsaved changes.
    ///
    /// Returns `true` when a save happened.
    #[instrument(level = "info", skip(self))]
    pub fn flush(&mut self) -> Result<bool, MapError> {
        let window = self.window.as_mut().ok_or(DemError::NotInitialized)?;
        match window.current.as_mut() {
            Some(tile) if tile.is_dirty() => {
                self.store.save(tile)?;
                tile.mark_clean();
                info!(tile = %tile.id(), "tile flushed");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn current_tile(&self) -> Option<&Tile> {
        self.window.as_ref()?.current.as_ref()
    }

    pub fn current_id(&self) -> Option<TileId> {
        self.current_tile().map(Tile::id)
    }

    /// Ids of the warm tiles, most recent first.
    pub fn warm_ids(&self) -> Vec<TileId> {
        self.window
            .as_ref()
            .map(|w| w.warm.iter().map(Tile::id).collect())
            .unwrap_or_default()
    }

    /// Fused cell under a world position, if its tile is resident.
    pub fn cell_at(&self, x: f64, y: f64) -> Option<Cell> {
        let window = self.window.as_ref()?;
        let loc = window.grid.locate(x, y);
        window
            .current
            .iter()
            .chain(window.warm.iter())
            .find(|t| t.id() == loc.tile)
            .and_then(|t| t.cells().get(loc.col, loc.row))
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GroundPrior;
    use std::collections::{HashMap, HashSet};

    // ── merge ───────────────────────────────────────────────────────────────

    #[test]
    fn merge_unknown_adopts_observation() {
        let mut dst = Cell::UNKNOWN;
        let out = merge(&mut dst, &Cell::observed(5.0, 1.0), 0.25);
        assert_eq!(out, MergeOutcome::Adopted);
        assert_eq!(dst, Cell::observed(5.0, 1.0));
    }

    #[test]
    fn merge_equal_variances_averages() {
        let mut dst = Cell::observed(3.0, 1.0);
        let out = merge(&mut dst, &Cell::observed(7.0, 1.0), 2.0);
        assert_eq!(out, MergeOutcome::Combined);
        assert!((dst.elevation - 5.0).abs() < 1e-6);
        assert!((dst.variance - 0.5).abs() < 1e-6);
        assert_eq!(dst.state, CellState::Observed);
    }

    #[test]
    fn merge_unknown_observation_leaves_cell() {
        let mut dst = Cell::observed(3.0, 0.1);
        let out = merge(&mut dst, &Cell::UNKNOWN, 0.25);
        assert_eq!(out, MergeOutcome::Unchanged);
        assert_eq!(dst, Cell::observed(3.0, 0.1));
    }

    #[test]
    fn merge_replaces_uncertain_estimate() {
        let mut dst = Cell::observed(3.0, 1.0);
        let out = merge(&mut dst, &Cell::observed(7.0, 1.0), 0.25);
        assert_eq!(out, MergeOutcome::Adopted);
        assert_eq!(dst, Cell::observed(7.0, 1.0));
    }

    #[test]
    fn merge_weights_by_inverse_variance() {
        let mut dst = Cell::observed(0.0, 0.1);
        merge(&mut dst, &Cell::observed(4.0, 0.3), 0.25);
        // weights 10 and 10/3 → (0·10 + 4·10/3) / (40/3) = 1.0
        assert!((dst.elevation - 1.0).abs() < 1e-5);
        assert!((dst.variance - 0.075).abs() < 1e-6);
        assert!(dst.variance <= 0.1);
    }

    #[test]
    fn ground_prior_only_yields_to_confident_observation() {
        let mut dst = Cell::ground_prior(0.0, 4.0);
        assert_eq!(merge(&mut dst, &Cell::observed(2.0, 0.5), 0.25), MergeOutcome::Rejected);
        assert_eq!(dst.state, CellState::GroundPrior);

        assert_eq!(merge(&mut dst, &Cell::observed(2.0, 0.1), 0.25), MergeOutcome::Adopted);
        assert_eq!(dst, Cell::observed(2.0, 0.1));
    }

    #[test]
    fn zero_variance_side_wins() {
        let mut exact = Cell::observed(1.0, 0.0);
        assert_eq!(merge(&mut exact, &Cell::observed(9.0, 0.1), 0.25), MergeOutcome::Rejected);
        assert_eq!(exact.elevation, 1.0);

        let mut dst = Cell::observed(1.0, 0.1);
        assert_eq!(merge(&mut dst, &Cell::observed(9.0, 0.0), 0.25), MergeOutcome::Adopted);
        assert_eq!(dst, Cell::observed(9.0, 0.0));
    }

    #[test]
    fn non_finite_observation_is_rejected() {
        let mut dst = Cell::observed(1.0, 0.1);
        assert_eq!(merge(&mut dst, &Cell::observed(f32::NAN, 0.1), 0.25), MergeOutcome::Rejected);
        assert_eq!(merge(&mut dst, &Cell::observed(2.0, -1.0), 0.25), MergeOutcome::Rejected);
        assert_eq!(dst, Cell::observed(1.0, 0.1));
    }

    #[test]
    fn observed_never_reverts_to_unknown() {
        let mut dst = Cell::observed(1.0, 0.1);
        for src in [Cell::UNKNOWN, Cell::ground_prior(0.0, 0.01), Cell::observed(2.0, 0.2)] {
            merge(&mut dst, &src, 0.25);
            assert_eq!(dst.state, CellState::Observed);
        }
    }

    // ── engine ──────────────────────────────────────────────────────────────

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Load(TileId),
        Save(Tile),
    }

    /// In-memory store that records every call.
    #[derive(Default)]
    struct RecordingStore {
        tiles: HashMap<TileId, Tile>,
        events: Vec<Event>,
        fail_save: bool,
        fail_load: HashSet<TileId>,
    }

    impl RecordingStore {
        fn loads(&self) -> Vec<TileId> {
            self.events
                .iter()
                .filter_map(|e| match e {
                    Event::Load(id) => Some(*id),
                    Event::Save(_) => None,
                })
                .collect()
        }

        fn saves(&self) -> Vec<&Tile> {
            self.events
                .iter()
                .filter_map(|e| match e {
                    Event::Save(t) => Some(t),
                    Event::Load(_) => None,
                })
                .collect()
        }
    }

    impl TileStore for RecordingStore {
        fn load(&self, id: TileId) -> Result<Tile, StoreError> {
            if self.fail_load.contains(&id) {
                return Err(StoreError::Io(std::io::Error::other("disk unavailable")));
            }
            self.tiles.get(&id).cloned().ok_or(StoreError::NotFound(id))
        }

        fn save(&mut self, tile: &Tile) -> Result<(), StoreError> {
            if self.fail_save {
                return Err(StoreError::Io(std::io::Error::other("disk full")));
            }
            self.events.push(Event::Save(tile.clone()));
            self.tiles.insert(tile.id(), tile.clone());
            Ok(())
        }

        fn exists(&self, id: TileId) -> Result<bool, StoreError> {
            Ok(self.tiles.contains_key(&id))
        }
    }

    /// Wraps a store so loads are recorded too (`load` takes `&self`).
    struct Logged(std::cell::RefCell<RecordingStore>);

    impl TileStore for Logged {
        fn load(&self, id: TileId) -> Result<Tile, StoreError> {
            let mut inner = self.0.borrow_mut();
            inner.events.push(Event::Load(id));
            inner.load(id)
        }

        fn save(&mut self, tile: &Tile) -> Result<(), StoreError> {
            self.0.get_mut().save(tile)
        }

        fn exists(&self, id: TileId) -> Result<bool, StoreError> {
            self.0.borrow().exists(id)
        }
    }

    fn config(swap_window: usize) -> MapConfig {
        MapConfig {
            scale: 1.0,
            variance_threshold: 0.25,
            swap_window,
            ..MapConfig::default()
        }
    }

    fn engine(swap_window: usize) -> DemFusionEngine<Logged> {
        let mut engine = DemFusionEngine::new(
            config(swap_window),
            Logged(std::cell::RefCell::new(RecordingStore::default())),
        );
        engine.init(10, 10).unwrap();
        engine
    }

    fn recorded(engine: &DemFusionEngine<Logged>) -> std::cell::Ref<'_, RecordingStore> {
        engine.store().0.borrow()
    }

    #[test]
    fn operations_before_init_fail() {
        let mut engine = DemFusionEngine::new(config(0), RecordingStore::default());
        assert!(matches!(
            engine.update_position(0.0, 0.0),
            Err(MapError::Dem(DemError::NotInitialized))
        ));
        assert!(matches!(engine.fuse(), Err(MapError::Dem(DemError::NotInitialized))));
        assert!(matches!(engine.flush(), Err(MapError::Dem(DemError::NotInitialized))));
        assert!(engine.cell_at(0.0, 0.0).is_none());
    }

    #[test]
    fn init_rejects_zero_size() {
        let mut engine = DemFusionEngine::new(config(0), RecordingStore::default());
        assert!(matches!(
            engine.init(0, 10),
            Err(MapError::Dem(DemError::InvalidConfig(_)))
        ));
        assert!(!engine.is_initialized());
    }

    #[test]
    fn fuse_without_active_tile_fails() {
        let mut engine = engine(0);
        assert!(matches!(engine.fuse(), Err(MapError::NoActiveTile)));
        assert!(matches!(engine.rasterize(&[]), Err(MapError::NoActiveTile)));
    }

    #[test]
    fn non_finite_position_is_rejected() {
        let mut engine = engine(0);
        assert!(matches!(
            engine.update_position(f64::NAN, 0.0),
            Err(MapError::Dem(DemError::InvalidPose(_)))
        ));
        assert!(engine.current_id().is_none());
    }

    #[test]
    fn crossing_tile_boundary_swaps_exactly_once() {
        let mut engine = engine(0);

        assert_eq!(
            engine.update_position(25.0, 35.0).unwrap(),
            SwapOutcome::Activated(TileId::new(2, 3))
        );
        *engine.observed_mut().unwrap().get_mut(5, 5).unwrap() = Cell::observed(3.0, 0.2);
        engine.fuse().unwrap();
        *engine.observed_mut().unwrap().get_mut(5, 5).unwrap() = Cell::observed(7.0, 0.2);
        engine.fuse().unwrap();

        assert_eq!(
            engine.update_position(25.5, 39.9).unwrap(),
            SwapOutcome::Unchanged(TileId::new(2, 3))
        );
        assert_eq!(
            engine.update_position(25.0, 40.0).unwrap(),
            SwapOutcome::Swapped {
                from: TileId::new(2, 3),
                to: TileId::new(2, 4)
            }
        );
        assert_eq!(engine.current_id(), Some(TileId::new(2, 4)));

        let store = recorded(&engine);
        let trace: Vec<String> = store
            .events
            .iter()
            .map(|e| match e {
                Event::Load(id) => format!("load {id}"),
                Event::Save(t) => format!("save {}", t.id()),
            })
            .collect();
        assert_eq!(trace, ["load 2x3", "save 2x3", "load 2x4"]);
        let saved = store.saves()[0];
        let cell = saved.cells().get(5, 5).unwrap();
        assert!((cell.elevation - 5.0).abs() < 1e-6);
        assert!((cell.variance - 0.1).abs() < 1e-6);
    }

    #[test]
    fn clean_tile_is_not_saved_on_swap() {
        let mut engine = engine(0);
        engine.update_position(1.0, 1.0).unwrap();
        engine.update_position(11.0, 1.0).unwrap();
        assert!(recorded(&engine).saves().is_empty());
    }

    #[test]
    fn unseen_tile_starts_from_ground_prior() {
        let cfg = MapConfig {
            ground_prior: Some(GroundPrior {
                elevation: 2.0,
                variance: 1.0,
            }),
            ..config(0)
        };
        let mut engine = DemFusionEngine::new(cfg, RecordingStore::default());
        engine.init(4, 4).unwrap();
        engine.update_position(-1.0, -1.0).unwrap();

        let tile = engine.current_tile().unwrap();
        assert_eq!(tile.id(), TileId::new(-1, -1));
        assert_eq!(tile.cells().count_state(CellState::GroundPrior), 16);
        assert_eq!(tile.meta().origin_x, -4.0);

        // A noisy observation does not displace the prior; a confident one does.
        *engine.observed_mut().unwrap().get_mut(0, 0).unwrap() = Cell::observed(9.0, 0.5);
        *engine.observed_mut().unwrap().get_mut(1, 0).unwrap() = Cell::observed(3.0, 0.1);
        let stats = engine.fuse().unwrap();
        assert_eq!(stats.observed, 2);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.adopted, 1);
        assert_eq!(engine.cell_at(-3.5, -3.5).unwrap().state, CellState::GroundPrior);
        assert_eq!(engine.cell_at(-2.5, -3.5).unwrap(), Cell::observed(3.0, 0.1));
    }

    #[test]
    fn stored_tile_is_loaded_not_recreated() {
        let mut store = RecordingStore::default();
        let grid = TileGrid::new(0.0, 0.0, 1.0, 10, 10).unwrap();
        let mut tile = Tile::fresh(TileId::new(0, 0), &grid, &config(0));
        *tile.cells_mut().get_mut(2, 2).unwrap() = Cell::observed(4.0, 0.05);
        store.tiles.insert(tile.id(), tile);

        let mut engine = DemFusionEngine::new(config(0), store);
        engine.init(10, 10).unwrap();
        engine.update_position(2.5, 2.5).unwrap();
        assert_eq!(engine.cell_at(2.5, 2.5).unwrap(), Cell::observed(4.0, 0.05));
    }

    #[test]
    fn stored_tile_with_wrong_shape_is_an_error() {
        let mut store = RecordingStore::default();
        let grid = TileGrid::new(0.0, 0.0, 1.0, 5, 5).unwrap();
        store
            .tiles
            .insert(TileId::new(0, 0), Tile::fresh(TileId::new(0, 0), &grid, &config(0)));

        let mut engine = DemFusionEngine::new(config(0), store);
        engine.init(10, 10).unwrap();
        assert!(matches!(
            engine.update_position(1.0, 1.0),
            Err(MapError::Store(StoreError::Corrupt(_)))
        ));
        assert!(engine.current_id().is_none());
    }

    #[test]
    fn save_failure_keeps_dirty_tile_current() {
        let mut engine = DemFusionEngine::new(config(0), RecordingStore::default());
        engine.init(10, 10).unwrap();
        engine.update_position(1.0, 1.0).unwrap();
        *engine.observed_mut().unwrap().get_mut(1, 1).unwrap() = Cell::observed(1.0, 0.1);
        engine.fuse().unwrap();

        engine.store_mut().fail_save = true;
        let err = engine.update_position(11.0, 1.0).unwrap_err();
        assert!(matches!(err, MapError::Store(StoreError::Io(_))));
        assert_eq!(engine.current_id(), Some(TileId::new(0, 0)));
        assert!(engine.current_tile().unwrap().is_dirty());

        engine.store_mut().fail_save = false;
        assert!(matches!(
            engine.update_position(11.0, 1.0).unwrap(),
            SwapOutcome::Swapped { .. }
        ));
        assert_eq!(engine.store().saves().len(), 1);
    }

    #[test]
    fn load_failure_keeps_saved_outgoing_tile() {
        let mut engine = DemFusionEngine::new(config(0), RecordingStore::default());
        engine.init(10, 10).unwrap();
        engine.update_position(1.0, 1.0).unwrap();
        *engine.observed_mut().unwrap().get_mut(1, 1).unwrap() = Cell::observed(1.0, 0.1);
        engine.fuse().unwrap();

        engine.store_mut().fail_load.insert(TileId::new(1, 0));
        assert!(engine.update_position(11.0, 1.0).is_err());
        assert_eq!(engine.current_id(), Some(TileId::new(0, 0)));
        assert!(!engine.current_tile().unwrap().is_dirty());
        assert!(engine.store().exists(TileId::new(0, 0)).unwrap());
    }

    #[test]
    fn prefetch_warms_tile_ahead() {
        let mut engine = engine(2);
        engine.update_position(1.0, 5.0).unwrap();
        assert!(engine.warm_ids().is_empty());

        engine.update_position(4.0, 5.2).unwrap();
        assert_eq!(engine.warm_ids(), vec![TileId::new(1, 0)]);

        let loads_before = recorded(&engine).loads().len();
        assert_eq!(
            engine.update_position(12.0, 5.0).unwrap(),
            SwapOutcome::Swapped {
                from: TileId::new(0, 0),
                to: TileId::new(1, 0)
            }
        );
        // (1,0) came from the warm set; only (2,0) was fetched as the next look-ahead.
        assert_eq!(recorded(&engine).loads()[loads_before..], [TileId::new(2, 0)]);
        assert_eq!(engine.warm_ids(), vec![TileId::new(2, 0), TileId::new(0, 0)]);
    }

    #[test]
    fn warm_set_is_bounded() {
        let mut engine = engine(1);
        for x in [1.0, 11.0, 21.0, 31.0] {
            engine.update_position(x, 1.0).unwrap();
        }
        assert_eq!(engine.current_id(), Some(TileId::new(3, 0)));
        assert_eq!(engine.warm_ids().len(), 1);
    }

    #[test]
    fn prefetch_failure_is_not_fatal() {
        let mut store = RecordingStore::default();
        store.fail_load.insert(TileId::new(1, 0));
        let mut engine = DemFusionEngine::new(config(2), store);
        engine.init(10, 10).unwrap();
        engine.update_position(1.0, 1.0).unwrap();
        engine.update_position(2.0, 1.0).unwrap();
        assert!(engine.warm_ids().is_empty());
    }

    #[test]
    fn fuse_resets_observed_grid() {
        let mut engine = engine(0);
        engine.update_position(0.5, 0.5).unwrap();
        *engine.observed_mut().unwrap().get_mut(0, 0).unwrap() = Cell::observed(1.0, 0.1);
        assert_eq!(engine.fuse().unwrap().adopted, 1);
        assert_eq!(engine.fuse().unwrap(), FuseStats::default());
    }

    #[test]
    fn set_observed_checks_shape() {
        let mut engine = engine(0);
        let err = engine.set_observed(CellGrid::new(5, 10)).unwrap_err();
        assert!(matches!(
            err,
            MapError::Dem(DemError::SizeMismatch {
                expected: 100,
                actual: 50
            })
        ));
        assert!(engine.set_observed(CellGrid::new(10, 10)).is_ok());
    }

    #[test]
    fn rasterized_points_are_fused() {
        let mut engine = engine(0);
        engine.update_position(0.5, 0.5).unwrap();
        let points = [
            CloudPoint::new(3.2, 4.1, 1.0, 0.0),
            CloudPoint::new(3.8, 4.9, 1.0, 0.0),
            CloudPoint::new(15.0, 4.0, 9.0, 0.0),
        ];
        let raster = engine.rasterize(&points).unwrap();
        assert_eq!(raster.binned, 2);
        assert_eq!(raster.outside, 1);

        let stats = engine.fuse().unwrap();
        assert_eq!(stats.adopted, 1);
        let cell = engine.cell_at(3.5, 4.5).unwrap();
        assert_eq!(cell.elevation, 1.0);
        assert_eq!(cell.variance, MapConfig::default().min_variance);
    }

    #[test]
    fn second_rasterize_overwrites_hit_cells() {
        let mut engine = engine(0);
        engine.update_position(0.5, 0.5).unwrap();
        engine.rasterize(&[CloudPoint::new(1.5, 1.5, 2.0, 0.0)]).unwrap();
        engine
            .rasterize(&[CloudPoint::new(1.5, 1.5, 6.0, 0.0), CloudPoint::new(2.5, 1.5, 3.0, 0.0)])
            .unwrap();

        let stats = engine.fuse().unwrap();
        assert_eq!(stats.adopted, 2);
        assert_eq!(engine.cell_at(1.5, 1.5).unwrap().elevation, 6.0);
        assert_eq!(engine.cell_at(2.5, 1.5).unwrap().elevation, 3.0);
    }

    #[test]
    fn swap_discards_stale_observations() {
        let mut engine = engine(0);
        engine.update_position(0.5, 0.5).unwrap();
        *engine.observed_mut().unwrap().get_mut(0, 0).unwrap() = Cell::observed(1.0, 0.1);
        engine.update_position(10.5, 0.5).unwrap();
        assert_eq!(engine.fuse().unwrap().observed, 0);
    }

    #[test]
    fn flush_saves_only_dirty_tile() {
        let mut engine = engine(0);
        engine.update_position(0.5, 0.5).unwrap();
        assert!(!engine.flush().unwrap());

        *engine.observed_mut().unwrap().get_mut(0, 0).unwrap() = Cell::observed(1.0, 0.1);
        engine.fuse().unwrap();
        assert!(engine.flush().unwrap());
        assert!(!engine.flush().unwrap());
        assert_eq!(recorded(&engine).saves().len(), 1);
    }

    #[test]
    fn flush_failure_keeps_tile_dirty() {
        let mut engine = DemFusionEngine::new(config(0), RecordingStore::default());
        engine.init(10, 10).unwrap();
        engine.update_position(0.5, 0.5).unwrap();
        *engine.observed_mut().unwrap().get_mut(0, 0).unwrap() = Cell::observed(1.0, 0.1);
        engine.fuse().unwrap();

        engine.store_mut().fail_save = true;
        let err = engine.flush().unwrap_err();
        assert!(matches!(err, MapError::Store(StoreError::Io(_))));
        assert!(engine.current_tile().unwrap().is_dirty());
        assert!(!engine.store().exists(TileId::new(0, 0)).unwrap());

        engine.store_mut().fail_save = false;
        assert!(engine.flush().unwrap());
        assert!(!engine.current_tile().unwrap().is_dirty());
    }

    #[test]
    fn reinit_flushes_current_tile() {
        let mut engine = engine(0);
        engine.update_position(0.5, 0.5).unwrap();
        *engine.observed_mut().unwrap().get_mut(0, 0).unwrap() = Cell::observed(1.0, 0.1);
        engine.fuse().unwrap();

        engine.init(20, 20).unwrap();
        assert_eq!(recorded(&engine).saves().len(), 1);
        assert!(engine.current_id().is_none());
        assert_eq!(engine.config().width, 20);
    }

    #[test]
    fn cell_at_reads_warm_tiles() {
        let mut engine = engine(2);
        engine.update_position(0.5, 0.5).unwrap();
        *engine.observed_mut().unwrap().get_mut(0, 0).unwrap() = Cell::observed(1.0, 0.1);
        engine.fuse().unwrap();
        engine.update_position(10.5, 0.5).unwrap();

        assert_eq!(engine.cell_at(0.5, 0.5).unwrap(), Cell::observed(1.0, 0.1));
        assert!(engine.cell_at(-50.0, -50.0).is_none());
    }
}
