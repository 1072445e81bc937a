//! `terrafuse-map` – tiled digital elevation map.
//!
//! Turns world-frame points into a persistent, paged elevation map with a
//! variance estimate per cell.
//!
//! # Modules
//!
//! - [`config`] – [`MapConfig`][config::MapConfig] and
//!   [`StorageConfig`][config::StorageConfig], the TOML-facing settings.
//! - [`grid`] – [`TileGrid`][grid::TileGrid]: world position → tile + cell.
//! - [`tile`] – [`Tile`][tile::Tile]: one cell grid with geo-referencing.
//! - [`raster`] – [`Rasterizer`][raster::Rasterizer]: points → observed grid.
//! - [`store`] – [`TileStore`][store::TileStore] with file and SQLite
//!   backends.
//! - [`fusion`] – [`DemFusionEngine`][fusion::DemFusionEngine]: merge policy,
//!   paging and write-back.
//! - [`shared`] – [`SharedDem`][shared::SharedDem]: lock-protected engine for
//!   concurrent readers.
//!
//! # Example
//!
//! ```rust
//! use terrafuse_map::config::MapConfig;
//! use terrafuse_map::fusion::DemFusionEngine;
//! use terrafuse_map::store::FileTileStore;
//! use terrafuse_perception::CloudPoint;
//!
//! let dir = tempfile::tempdir().unwrap();
//! let config = MapConfig { scale: 0.5, ..MapConfig::default() };
//! let mut engine = DemFusionEngine::new(config, FileTileStore::new(dir.path()));
//! engine.init(32, 32).unwrap();
//!
//! engine.update_position(1.0, 1.0).unwrap();
//! engine.rasterize(&[CloudPoint::new(2.2, 3.1, 0.4, 12.0)]).unwrap();
//! engine.fuse().unwrap();
//! engine.flush().unwrap();
//!
//! assert!(dir.path().join("dem.0x0.tile").exists());
//! ```

pub mod config;
pub mod fusion;
pub mod grid;
pub mod raster;
pub mod shared;
pub mod store;
pub mod tile;

pub use config::{GroundPrior, MapConfig, StorageBackend, StorageConfig};
pub use fusion::{DemFusionEngine, FuseStats, MapError, MergeOutcome, SwapOutcome, merge};
pub use grid::{CellLocation, TileGrid};
pub use raster::{RasterStats, Rasterizer};
pub use shared::{CycleReport, SharedDem};
pub use store::{FileTileStore, SqliteTileStore, StoreError, TileStore, open_store};
pub use tile::{Tile, TileMeta, TileSummary};
