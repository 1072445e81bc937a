use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Integer identity of a map tile: column `sx` and row `sy` in the tile lattice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileId {
    pub sx: i64,
    pub sy: i64,
}

impl TileId {
    pub fn new(sx: i64, sy: i64) -> Self {
        Self { sx, sy }
    }

    /// The tile `dx` columns and `dy` rows away from this one.
    pub fn offset(self, dx: i64, dy: i64) -> Self {
        Self::new(self.sx + dx, self.sy + dy)
    }
}

impl std::fmt::Display for TileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.sx, self.sy)
    }
}

/// Knowledge state of a single DEM cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CellState {
    /// Nothing is known about this cell.
    #[default]
    Unknown = 0,
    /// Filled from the flat-ground prior when the tile was created.
    GroundPrior = 1,
    /// Holds at least one real elevation observation.
    Observed = 2,
}

impl CellState {
    /// Byte tag used by on-disk tile bands.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decode a band byte; `None` for tags this version does not know.
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Unknown),
            1 => Some(Self::GroundPrior),
            2 => Some(Self::Observed),
            _ => None,
        }
    }
}

/// The atomic map unit: an elevation estimate with its variance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cell {
    /// Elevation in world units (metres).
    pub elevation: f32,
    /// Variance of `elevation` (m²). Infinite while the cell is unknown.
    pub variance: f32,
    pub state: CellState,
}

impl Cell {
    pub const UNKNOWN: Cell = Cell {
        elevation: 0.0,
        variance: f32::INFINITY,
        state: CellState::Unknown,
    };

    pub fn observed(elevation: f32, variance: f32) -> Self {
        Self {
            elevation,
            variance,
            state: CellState::Observed,
        }
    }

    pub fn ground_prior(elevation: f32, variance: f32) -> Self {
        Self {
            elevation,
            variance,
            state: CellState::GroundPrior,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.state == CellState::Unknown
    }
}

impl Default for Cell {
    fn default() -> Self {
        Self::UNKNOWN
    }
}

/// A dense, row-major `width × height` grid of [`Cell`]s.
///
/// Column index grows with world X and row index with world Y, so
/// `(col, row) = (0, 0)` is the cell nearest the grid's origin corner.
#[derive(Debug, Clone, PartialEq)]
pub struct CellGrid {
    width: usize,
    height: usize,
    cells: Vec<Cell>,
}

impl CellGrid {
    /// A grid with every cell [`Cell::UNKNOWN`].
    pub fn new(width: usize, height: usize) -> Self {
        Self::filled(width, height, Cell::UNKNOWN)
    }

    pub fn filled(width: usize, height: usize, cell: Cell) -> Self {
        Self {
            width,
            height,
            cells: vec![cell; width * height],
        }
    }

    /// Wrap an existing row-major cell buffer.
    ///
    /// Returns [`DemError::SizeMismatch`] when `cells.len() != width * height`.
    pub fn from_cells(width: usize, height: usize, cells: Vec<Cell>) -> Result<Self, DemError> {
        if cells.len() != width * height {
            return Err(DemError::SizeMismatch {
                expected: width * height,
                actual: cells.len(),
            });
        }
        Ok(Self {
            width,
            height,
            cells,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// True when `other` has the same width and height.
    pub fn same_shape(&self, other: &CellGrid) -> bool {
        self.width == other.width && self.height == other.height
    }

    /// Flat index of `(col, row)`, or `None` when out of bounds.
    pub fn index(&self, col: usize, row: usize) -> Option<usize> {
        (col < self.width && row < self.height).then(|| row * self.width + col)
    }

    pub fn get(&self, col: usize, row: usize) -> Option<&Cell> {
        self.index(col, row).map(|i| &self.cells[i])
    }

    pub fn get_mut(&mut self, col: usize, row: usize) -> Option<&mut Cell> {
        self.index(col, row).map(move |i| &mut self.cells[i])
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn cells_mut(&mut self) -> &mut [Cell] {
        &mut self.cells
    }

    /// Reset every cell to `cell`, keeping the allocation.
    pub fn fill(&mut self, cell: Cell) {
        self.cells.fill(cell);
    }

    /// Number of cells currently in `state`.
    pub fn count_state(&self, state: CellState) -> usize {
        self.cells.iter().filter(|c| c.state == state).count()
    }
}

/// Error type shared by the transform pipeline and the DEM engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DemError {
    #[error("Invalid pose: {0}")]
    InvalidPose(String),

    #[error("Size mismatch: expected {expected}, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("DEM engine used before init()")]
    NotInitialized,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Map lock poisoned by a panicked writer")]
    LockPoisoned,
}
