//! One-file-per-tile storage.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use terrafuse_types::TileId;
use tracing::debug;

use super::codec::{decode_tile, encode_tile};
use super::{StoreError, TileStore};
use crate::tile::Tile;

/// Stores each tile at `<root>/dem.<sx>x<sy>.tile`.
///
/// Saves go through a temporary file and a rename, so a crash mid-write
/// leaves the previous version of the tile intact.
#[derive(Debug, Clone)]
pub struct FileTileStore {
    root: PathBuf,
}

impl FileTileStore {
    /// The root directory is created lazily on the first save.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tile_path(&self, id: TileId) -> PathBuf {
        self.root.join(format!("dem.{}x{}.tile", id.sx, id.sy))
    }
}

impl TileStore for FileTileStore {
    fn load(&self, id: TileId) -> Result<Tile, StoreError> {
        let path = self.tile_path(id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(StoreError::NotFound(id)),
            Err(e) => return Err(e.into()),
        };
        let tile = decode_tile(&bytes)?;
        if tile.id() != id {
            return Err(StoreError::Corrupt(format!(
                "{} holds tile {} instead of {id}",
                path.display(),
                tile.id()
            )));
        }
        debug!(tile = %id, path = %path.display(), "tile loaded");
        Ok(tile)
    }

    fn save(&mut self, tile: &Tile) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root)?;
        let path = self.tile_path(tile.id());
        let tmp = path.with_extension("tile.tmp");
        fs::write(&tmp, encode_tile(tile)?)?;
        fs::rename(&tmp, &path)?;
        debug!(tile = %tile.id(), path = %path.display(), "tile saved");
        Ok(())
    }

    fn exists(&self, id: TileId) -> Result<bool, StoreError> {
        Ok(self.tile_path(id).is_file())
    }
}
