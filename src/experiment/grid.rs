//! Tile grid construction.
//!
//! A rectangular region is covered by camera fields of view stepped by the frame
//! footprint minus the requested overlap. Axis coordinates follow `numpy.arange`
//! semantics over `[start, end + delta)`, so an axis spanning `span` gets
//! `ceil(span / delta) + 1` tiles: the far edge is always covered, and the last tile
//! starts exactly on it when the span is a whole number of steps. For a
//! (0, 0)-(100, 100) region with 50 unit steps this gives `[0, 50, 100]` on both axes.
//!
//! Tiles are visited in snake order: even rows left to right, odd rows right to left.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum GridError {
    #[error("Overlap must be within [0, 1), got {0}")]
    InvalidOverlap(f64),

    #[error("Tile step must be positive, got ({0}, {1})")]
    NonPositiveStep(f64, f64),

    #[error("Boundary yields no tiles along {axis}: {start} to {end}")]
    EmptyAxis {
        axis: &'static str,
        start: f64,
        end: f64,
    },

    #[error("Overlap can only be used with a top-left/bottom-right boundary")]
    OverlapWithPositions,

    #[error("Position list is empty")]
    NoPositions,

    #[error("Position {0} is not finite")]
    NonFinitePosition(usize),

    #[error("Boundary needs {0} tiles, more than the limit of {MAX_TILES}")]
    TooManyTiles(f64),
}

/// Upper bound on the number of tiles a boundary may expand to.
pub const MAX_TILES: usize = 1_000_000;

/// Evenly spaced values over `[start, stop)`, like `numpy.arange`.
///
/// Callers bound the length with [`arange_len`] first; the result is allocated in full.
pub fn arange(start: f64, stop: f64, step: f64) -> Vec<f64> {
    let n = arange_len(start, stop, step);
    (0..n as usize).map(|i| start + i as f64 * step).collect()
}

/// Number of values [`arange`] yields, as a float so huge spans do not wrap.
pub fn arange_len(start: f64, stop: f64, step: f64) -> f64 {
    if step <= 0.0 || !step.is_finite() {
        return 0.0;
    }
    let n = ((stop - start) / step).ceil();
    if !n.is_finite() || n <= 0.0 {
        return 0.0;
    }
    n
}

/// Non-overlapping step sizes `(dx, dy)` for a frame of `width` by `height` pixels.
pub fn step_sizes(width: u32, height: u32, px_len: f64, overlap: f64) -> (f64, f64) {
    let w = width as f64;
    let h = height as f64;
    ((w - overlap * w) * px_len, (h - overlap * h) * px_len)
}

/// A top-left/bottom-right pair in stage units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Boundary {
    /// Top-left corner `(x, y)`
    pub top_left: (f64, f64),
    /// Bottom-right corner `(x, y)`
    pub bottom_right: (f64, f64),
}

/// Where to acquire: a boundary to tile or an explicit list of positions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Region {
    /// Rectangle to tile
    Boundary(Boundary),
    /// Operator-chosen positions, visited in the given order
    Positions {
        /// `(x, y)` pairs
        positions: Vec<(f64, f64)>,
    },
}

/// Index of a tile within its grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TileIndex {
    /// Row and column of a rectangular grid
    Grid {
        /// Row (y) index
        row: usize,
        /// Column (x) index
        col: usize,
    },
    /// Index into a position list
    Position(usize),
}

impl TileIndex {
    /// The spatial part of a stored index tuple.
    pub fn to_indices(self) -> Vec<u64> {
        match self {
            TileIndex::Grid { row, col } => vec![row as u64, col as u64],
            TileIndex::Position(i) => vec![i as u64],
        }
    }
}

/// One stage position to acquire at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tile {
    /// Grid index
    pub index: TileIndex,
    /// Stage x
    pub x: f64,
    /// Stage y
    pub y: f64,
}

/// The spatial layout of an acquisition. Immutable once computed.
#[derive(Debug, Clone, PartialEq)]
pub enum TileGrid {
    /// Rectangular tiling
    Rect {
        /// Column coordinates
        xs: Vec<f64>,
        /// Row coordinates
        ys: Vec<f64>,
    },
    /// Explicit positions
    Positions(Vec<(f64, f64)>),
}

impl TileGrid {
    /// A single tile at `(x, y)`.
    pub fn single(x: f64, y: f64) -> Self {
        TileGrid::Rect {
            xs: vec![x],
            ys: vec![y],
        }
    }

    /// Tile a boundary with frames of `frame_size` (width, height) pixels.
    ///
    /// Without an overlap the acquisition is a single tile at `current`; a degenerate
    /// boundary is a single tile at its corner.
    pub fn tile(
        boundary: &Boundary,
        overlap: Option<f64>,
        frame_size: (u32, u32),
        px_len: f64,
        current: (f64, f64),
    ) -> Result<Self, GridError> {
        let Some(overlap) = overlap else {
            return Ok(Self::single(current.0, current.1));
        };
        if !(0.0..1.0).contains(&overlap) {
            return Err(GridError::InvalidOverlap(overlap));
        }

        let (tl, br) = (boundary.top_left, boundary.bottom_right);
        if tl == br {
            return Ok(Self::single(tl.0, tl.1));
        }

        let (dx, dy) = step_sizes(frame_size.0, frame_size.1, px_len, overlap);
        if !(dx > 0.0 && dy > 0.0) {
            return Err(GridError::NonPositiveStep(dx, dy));
        }

        let tiles = arange_len(tl.0, br.0 + dx, dx) * arange_len(tl.1, br.1 + dy, dy);
        if tiles.is_nan() || tiles > MAX_TILES as f64 {
            return Err(GridError::TooManyTiles(tiles));
        }

        let xs = arange(tl.0, br.0 + dx, dx);
        if xs.is_empty() {
            return Err(GridError::EmptyAxis {
                axis: "x",
                start: tl.0,
                end: br.0,
            });
        }
        let ys = arange(tl.1, br.1 + dy, dy);
        if ys.is_empty() {
            return Err(GridError::EmptyAxis {
                axis: "y",
                start: tl.1,
                end: br.1,
            });
        }
        Ok(TileGrid::Rect { xs, ys })
    }

    /// Use an operator-supplied position list verbatim.
    pub fn positions(positions: Vec<(f64, f64)>) -> Result<Self, GridError> {
        if positions.is_empty() {
            return Err(GridError::NoPositions);
        }
        if let Some(i) = positions
            .iter()
            .position(|(x, y)| !x.is_finite() || !y.is_finite())
        {
            return Err(GridError::NonFinitePosition(i));
        }
        Ok(TileGrid::Positions(positions))
    }

    /// Resolve a region into a grid.
    pub fn resolve(
        region: &Region,
        overlap: Option<f64>,
        frame_size: (u32, u32),
        px_len: f64,
        current: (f64, f64),
    ) -> Result<Self, GridError> {
        match region {
            Region::Boundary(boundary) => {
                Self::tile(boundary, overlap, frame_size, px_len, current)
            }
            Region::Positions { .. } if overlap.is_some() => Err(GridError::OverlapWithPositions),
            Region::Positions { positions } => Self::positions(positions.clone()),
        }
    }

    /// Number of tiles.
    pub fn len(&self) -> usize {
        match self {
            TileGrid::Rect { xs, ys } => xs.len().saturating_mul(ys.len()),
            TileGrid::Positions(positions) => positions.len(),
        }
    }

    /// Whether the grid has no tiles.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tiles in acquisition (snake) order.
    pub fn tiles(&self) -> Vec<Tile> {
        match self {
            TileGrid::Rect { xs, ys } => {
                let mut tiles = Vec::with_capacity(xs.len() * ys.len());
                for (row, &y) in ys.iter().enumerate() {
                    let cols: Box<dyn Iterator<Item = usize>> = if row % 2 == 0 {
                        Box::new(0..xs.len())
                    } else {
                        Box::new((0..xs.len()).rev())
                    };
                    tiles.extend(cols.map(|col| Tile {
                        index: TileIndex::Grid { row, col },
                        x: xs[col],
                        y,
                    }));
                }
                tiles
            }
            TileGrid::Positions(positions) => positions
                .iter()
                .enumerate()
                .map(|(i, &(x, y))| Tile {
                    index: TileIndex::Position(i),
                    x,
                    y,
                })
                .collect(),
        }
    }

    /// Spatial storage axes: `row` and `col` with their stage coordinates, or a single
    /// `position` axis labelled with `[x, y]` pairs.
    pub fn storage_axes(&self) -> Vec<(String, Vec<Value>)> {
        match self {
            TileGrid::Rect { xs, ys } => vec![
                ("row".to_string(), ys.iter().map(|&y| json!(y)).collect()),
                ("col".to_string(), xs.iter().map(|&x| json!(x)).collect()),
            ],
            TileGrid::Positions(positions) => vec![(
                "position".to_string(),
                positions.iter().map(|&(x, y)| json!([x, y])).collect(),
            )],
        }
    }
}
