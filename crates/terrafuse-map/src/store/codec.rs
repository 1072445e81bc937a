//! Binary tile container.
//!
//! Layout:
//! - Magic: `"TFDEM"` (5 bytes)
//! - Version: u8
//! - Header length: u32, little-endian
//! - Header: JSON-encoded [`TileHeader`] (geo-referencing + dimensions)
//! - Elevation band: `width * height` little-endian f32, row-major
//! - Variance band: `width * height` little-endian f32
//! - State band: `width * height` u8 ([`CellState`] tags)
//!
//! Band values are stored relative to the tile's vertical origin and scale:
//! `band = (elevation - origin_z) / z_scale` and
//! `variance_band = variance / z_scale²`.  Unknown cells carry NaN in the
//! elevation band.

use serde::{Deserialize, Serialize};
use terrafuse_types::{Cell, CellGrid, CellState};

use super::StoreError;
use crate::tile::{Tile, TileMeta};

const MAGIC: &[u8; 5] = b"TFDEM";
const VERSION: u8 = 1;
const PREAMBLE_SIZE: usize = 10;

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct TileHeader {
    pub meta: TileMeta,
    pub width: u32,
    pub height: u32,
}

/// Raw band bytes of one tile.
pub(crate) struct Bands {
    pub elevation: Vec<u8>,
    pub variance: Vec<u8>,
    pub state: Vec<u8>,
}

fn f32s_to_bytes(values: impl Iterator<Item = f32>) -> Vec<u8> {
    values.flat_map(|f| f.to_le_bytes()).collect()
}

fn bytes_to_f32s(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Cell count of a `width x height` tile, provided its bands of
/// `bytes_per_cell` bytes are addressable.
fn band_cells(width: usize, height: usize, bytes_per_cell: usize) -> Option<usize> {
    let n = width.checked_mul(height)?;
    n.checked_mul(bytes_per_cell)?;
    Some(n)
}

pub(crate) fn split_bands(tile: &Tile) -> Bands {
    let meta = tile.meta();
    let z_scale = meta.z_scale;
    let cells = tile.cells().cells();
    Bands {
        elevation: f32s_to_bytes(cells.iter().map(|c| match c.state {
            CellState::Unknown => f32::NAN,
            _ => ((c.elevation as f64 - meta.origin_z) / z_scale) as f32,
        })),
        variance: f32s_to_bytes(cells.iter().map(|c| (c.variance as f64 / (z_scale * z_scale)) as f32)),
        state: cells.iter().map(|c| c.state.as_u8()).collect(),
    }
}

pub(crate) fn join_bands(
    meta: TileMeta,
    width: usize,
    height: usize,
    elevation: &[u8],
    variance: &[u8],
    state: &[u8],
) -> Result<Tile, StoreError> {
    let n = band_cells(width, height, 4)
        .ok_or_else(|| StoreError::Corrupt(format!("tile {}: {width}x{height} is too large", meta.id)))?;
    if elevation.len() != n * 4 || variance.len() != n * 4 || state.len() != n {
        return Err(StoreError::Corrupt(format!(
            "tile {}: band sizes {}/{}/{} do not match {width}x{height}",
            meta.id,
            elevation.len(),
            variance.len(),
            state.len()
        )));
    }
    if !(meta.z_scale.is_finite() && meta.z_scale > 0.0) {
        return Err(StoreError::Corrupt(format!("tile {}: bad z_scale {}", meta.id, meta.z_scale)));
    }

    let elevations = bytes_to_f32s(elevation);
    let variances = bytes_to_f32s(variance);
    let mut cells = Vec::with_capacity(n);
    for i in 0..n {
        let tag = state[i];
        let state = CellState::from_u8(tag)
            .ok_or_else(|| StoreError::Corrupt(format!("tile {}: unknown cell state {tag}", meta.id)))?;
        let cell = match state {
            CellState::Unknown => Cell::UNKNOWN,
            _ => Cell {
                elevation: (meta.origin_z + elevations[i] as f64 * meta.z_scale) as f32,
                variance: (variances[i] as f64 * meta.z_scale * meta.z_scale) as f32,
                state,
            },
        };
        cells.push(cell);
    }
    let grid = CellGrid::from_cells(width, height, cells).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    Ok(Tile::new(meta, grid))
}

/// Serialize a tile into the container format.
pub fn encode_tile(tile: &Tile) -> Result<Vec<u8>, StoreError> {
    let header = TileHeader {
        meta: tile.meta().clone(),
        width: tile.cells().width() as u32,
        height: tile.cells().height() as u32,
    };
    let header_json = serde_json::to_vec(&header)?;
    let bands = split_bands(tile);

    let mut out = Vec::with_capacity(
        PREAMBLE_SIZE + header_json.len() + bands.elevation.len() * 2 + bands.state.len(),
    );
    out.extend_from_slice(MAGIC);
    out.push(VERSION);
    out.extend_from_slice(&(header_json.len() as u32).to_le_bytes());
    out.extend_from_slice(&header_json);
    out.extend_from_slice(&bands.elevation);
    out.extend_from_slice(&bands.variance);
    out.extend_from_slice(&bands.state);
    Ok(out)
}

/// Parse a tile written by [`encode_tile`].
pub fn decode_tile(bytes: &[u8]) -> Result<Tile, StoreError> {
    if bytes.len() < PREAMBLE_SIZE || &bytes[0..5] != MAGIC {
        return Err(StoreError::Corrupt("missing tile magic".to_string()));
    }
    if bytes[5] != VERSION {
        return Err(StoreError::Corrupt(format!(
            "unsupported tile version {} (expected {VERSION})",
            bytes[5]
        )));
    }
    let header_len = u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]) as usize;
    let header_end = PREAMBLE_SIZE
        .checked_add(header_len)
        .filter(|end| *end <= bytes.len())
        .ok_or_else(|| StoreError::Corrupt("truncated tile header".to_string()))?;
    let header: TileHeader = serde_json::from_slice(&bytes[PREAMBLE_SIZE..header_end])?;

    let (width, height) = (header.width as usize, header.height as usize);
    let n = band_cells(width, height, 9).ok_or_else(|| {
        StoreError::Corrupt(format!("tile {}: header claims {width}x{height} cells", header.meta.id))
    })?;
    let body = &bytes[header_end..];
    if body.len() != n * 9 {
        return Err(StoreError::Corrupt(format!(
            "tile {}: expected {} band bytes, found {}",
            header.meta.id,
            n * 9,
            body.len()
        )));
    }
    let (elevation, rest) = body.split_at(n * 4);
    let (variance, state) = rest.split_at(n * 4);
    join_bands(header.meta, width, height, elevation, variance, state)
}
