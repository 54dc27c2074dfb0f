//! A single `width × height` plane of cells.

use crate::error::CanvasError;

/// Row-major cell buffer. `None` is an empty cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    width: u32,
    height: u32,
    cells: Vec<Option<String>>,
}

impl Layer {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            cells: vec![None; width as usize * height as usize],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Map a signed coordinate to a buffer index.
    pub fn index(&self, x: i64, y: i64) -> Result<usize, CanvasError> {
        if x < 0 || y < 0 || x >= i64::from(self.width) || y >= i64::from(self.height) {
            return Err(CanvasError::OutOfBounds {
                x,
                y,
                width: self.width,
                height: self.height,
            });
        }
        Ok(y as usize * self.width as usize + x as usize)
    }

    pub fn get(&self, x: i64, y: i64) -> Result<Option<&str>, CanvasError> {
        let idx = self.index(x, y)?;
        Ok(self.cells[idx].as_deref())
    }

    /// Write a cell. Returns `false` without touching the buffer when the cell
    /// already holds `color`.
    pub fn set(&mut self, x: i64, y: i64, color: Option<&str>) -> Result<bool, CanvasError> {
        let idx = self.index(x, y)?;
        let cell = &mut self.cells[idx];
        if cell.as_deref() == color {
            return Ok(false);
        }
        *cell = color.map(str::to_string);
        Ok(true)
    }

    pub fn clear(&mut self) {
        self.cells.iter_mut().for_each(|c| *c = None);
    }

    /// Non-empty cells in row-major order as `(x, y, color)`.
    pub fn filled(&self) -> impl Iterator<Item = (u32, u32, &str)> + '_ {
        let width = self.width as usize;
        self.cells.iter().enumerate().filter_map(move |(idx, cell)| {
            cell.as_deref()
                .map(|color| ((idx % width) as u32, (idx / width) as u32, color))
        })
    }

    /// Every cell in row-major order.
    pub fn cells(&self) -> &[Option<String>] {
        &self.cells
    }
}
