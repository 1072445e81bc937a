//! SQLite-backed tile store.
//!
//! # Storage layout
//!
//! A single table `dem_tiles` is created (if it does not already exist):
//!
//! | column    | type    | description                                  |
//! |-----------|---------|----------------------------------------------|
//! | sx, sy    | INTEGER | tile indices, composite primary key          |
//! | width     | INTEGER | cells per row                                |
//! | height    | INTEGER | rows                                         |
//! | meta      | TEXT    | JSON geo-referencing metadata                |
//! | elevation | BLOB    | little-endian f32 band (4 × N bytes)         |
//! | variance  | BLOB    | little-endian f32 band (4 × N bytes)         |
//! | state     | BLOB    | one cell-state tag per cell                  |
//!
//! Bands use the same vertical scaling as the file container.
//!
//! # Example
//!
//! ```rust
//! use terrafuse_map::config::MapConfig;
//! use terrafuse_map::grid::TileGrid;
//! use terrafuse_map::store::{SqliteTileStore, TileStore};
//! use terrafuse_map::tile::Tile;
//! use terrafuse_types::TileId;
//!
//! let mut store = SqliteTileStore::open_in_memory().unwrap();
//! let grid = TileGrid::new(0.0, 0.0, 1.0, 8, 8).unwrap();
//! let tile = Tile::fresh(TileId::new(0, 1), &grid, &MapConfig::default());
//!
//! store.save(&tile).unwrap();
//! assert!(store.exists(TileId::new(0, 1)).unwrap());
//! assert_eq!(store.load(TileId::new(0, 1)).unwrap().cells(), tile.cells());
//! ```

use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};
use terrafuse_types::TileId;
use tracing::debug;

use super::codec::{join_bands, split_bands};
use super::{StoreError, TileStore};
use crate::tile::{Tile, TileMeta};

pub struct SqliteTileStore {
    conn: Connection,
}

impl SqliteTileStore {
    /// Open (or create) a persistent SQLite database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// Open a temporary in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS dem_tiles (
                sx        INTEGER NOT NULL,
                sy        INTEGER NOT NULL,
                width     INTEGER NOT NULL,
                height    INTEGER NOT NULL,
                meta      TEXT    NOT NULL,
                elevation BLOB    NOT NULL,
                variance  BLOB    NOT NULL,
                state     BLOB    NOT NULL,
                PRIMARY KEY (sx, sy)
            );",
        )?;
        Ok(())
    }

    /// Ids of every stored tile, ordered by `(sx, sy)`.
    pub fn tile_ids(&self) -> Result<Vec<TileId>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT sx, sy FROM dem_tiles ORDER BY sx ASC, sy ASC")?;
        let ids = stmt
            .query_map([], |row| Ok(TileId::new(row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }
}

type TileRow = (i64, i64, String, Vec<u8>, Vec<u8>, Vec<u8>);

impl TileStore for SqliteTileStore {
    fn load(&self, id: TileId) -> Result<Tile, StoreError> {
        let row: Option<TileRow> = self
            .conn
            .query_row(
                "SELECT width, height, meta, elevation, variance, state
                 FROM dem_tiles WHERE sx = ?1 AND sy = ?2",
                params![id.sx, id.sy],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                },
            )
            .optional()?;
        let Some((width, height, meta_json, elevation, variance, state)) = row else {
            return Err(StoreError::NotFound(id));
        };

        let meta: TileMeta = serde_json::from_str(&meta_json)?;
        if meta.id != id {
            return Err(StoreError::Corrupt(format!("row {id} holds tile {}", meta.id)));
        }
        let (width, height) = match (usize::try_from(width), usize::try_from(height)) {
            (Ok(w), Ok(h)) => (w, h),
            _ => return Err(StoreError::Corrupt(format!("tile {id}: bad size {width}x{height}"))),
        };
        let tile = join_bands(meta, width, height, &elevation, &variance, &state)?;
        debug!(tile = %id, "tile loaded from sqlite");
        Ok(tile)
    }

    fn save(&mut self, tile: &Tile) -> Result<(), StoreError> {
        let id = tile.id();
        let meta_json = serde_json::to_string(tile.meta())?;
        let bands = split_bands(tile);
        self.conn.execute(
            "INSERT OR REPLACE INTO dem_tiles
                 (sx, sy, width, height, meta, elevation, variance, state)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id.sx,
                id.sy,
                tile.cells().width() as i64,
                tile.cells().height() as i64,
                meta_json,
                bands.elevation,
                bands.variance,
                bands.state,
            ],
        )?;
        debug!(tile = %id, "tile saved to sqlite");
        Ok(())
    }

    fn exists(&self, id: TileId) -> Result<bool, StoreError> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM dem_tiles WHERE sx = ?1 AND sy = ?2",
                params![id.sx, id.sy],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }
}
