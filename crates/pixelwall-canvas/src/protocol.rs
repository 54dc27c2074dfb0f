//! Cell types shared with the wire protocol.

use serde::{Deserialize, Serialize};

/// Marker clients use for a cell with no color.
pub const EMPTY: &str = "empty";

/// A canvas coordinate as sent by clients. Signed so that negative input
/// surfaces as an out-of-bounds error instead of a parse failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub x: i64,
    pub y: i64,
}

impl Point {
    pub fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }
}

/// One non-empty cell of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelEntry {
    pub layer: usize,
    pub x: u32,
    pub y: u32,
    pub color: String,
}
