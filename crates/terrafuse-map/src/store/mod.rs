//! Tile persistence.
//!
//! [`TileStore`] is the seam between the fusion engine and whatever keeps
//! tiles between runs.  A store only moves whole tiles keyed by their
//! [`TileId`]; it never invents data.  A tile that was never saved is
//! reported as [`StoreError::NotFound`] and the engine decides what a fresh
//! tile looks like.
//!
//! Two implementations are provided:
//!
//! - [`FileTileStore`] – one container file per tile under a root directory.
//! - [`SqliteTileStore`] – all tiles in a single SQLite database.

pub mod codec;
mod file;
mod sqlite;

pub use file::FileTileStore;
pub use sqlite::SqliteTileStore;

use terrafuse_types::TileId;
use thiserror::Error;

use crate::config::{StorageBackend, StorageConfig};
use crate::tile::Tile;

/// Errors that can arise while loading or saving tiles.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Tile {0} not found")]
    NotFound(TileId),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Tile header error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Corrupt tile data: {0}")]
    Corrupt(String),
}

/// Load/save service for whole tiles.
pub trait TileStore: Send {
    /// Load the tile `id`, or [`StoreError::NotFound`] when it was never saved.
    fn load(&self, id: TileId) -> Result<Tile, StoreError>;

    /// Persist `tile` under its own id, replacing any previous version.
    fn save(&mut self, tile: &Tile) -> Result<(), StoreError>;

    /// True when a tile with this id has been saved.
    fn exists(&self, id: TileId) -> Result<bool, StoreError>;
}

impl<T: TileStore + ?Sized> TileStore for Box<T> {
    fn load(&self, id: TileId) -> Result<Tile, StoreError> {
        (**self).load(id)
    }

    fn save(&mut self, tile: &Tile) -> Result<(), StoreError> {
        (**self).save(tile)
    }

    fn exists(&self, id: TileId) -> Result<bool, StoreError> {
        (**self).exists(id)
    }
}

/// Open the store described by `config`.
pub fn open_store(config: &StorageConfig) -> Result<Box<dyn TileStore>, StoreError> {
    match config.backend {
        StorageBackend::Files => Ok(Box::new(FileTileStore::new(&config.root))),
        StorageBackend::Sqlite => {
            std::fs::create_dir_all(&config.root)?;
            let path = config.root.join("tiles.sqlite");
            Ok(Box::new(SqliteTileStore::open(&path)?))
        }
    }
}
