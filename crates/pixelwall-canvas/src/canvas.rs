//! Single-layer and layered canvases behind one tagged type.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::codec;
use crate::error::CanvasError;
use crate::layer::Layer;
use crate::protocol::{EMPTY, PixelEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanvasKind {
    Grid,
    Layered,
}

/// A shared drawing surface.
#[derive(Debug, Clone)]
pub enum Canvas {
    /// One plane, used by the well-known shared grid.
    Grid {
        layer: Layer,
        background_color: String,
    },
    /// An ordered stack of equally sized planes; index 0 is the bottom.
    Layered {
        layers: Vec<Layer>,
        background_color: String,
    },
}

fn check_dimensions(width: u32, height: u32) -> Result<(), CanvasError> {
    if width == 0 || height == 0 {
        return Err(CanvasError::InvalidDimensions(format!(
            "{width}x{height} has no cells"
        )));
    }
    Ok(())
}

fn check_color(color: &str) -> Result<(), CanvasError> {
    if color.trim().is_empty() {
        return Err(CanvasError::InvalidColor(color.to_string()));
    }
    Ok(())
}

/// Map the client-side "empty" marker to an erased cell.
fn cell_value(color: &str) -> Option<&str> {
    if color == EMPTY { None } else { Some(color) }
}

impl Canvas {
    pub fn grid(
        width: u32,
        height: u32,
        background_color: impl Into<String>,
    ) -> Result<Self, CanvasError> {
        check_dimensions(width, height)?;
        Ok(Canvas::Grid {
            layer: Layer::new(width, height),
            background_color: background_color.into(),
        })
    }

    pub fn layered(
        width: u32,
        height: u32,
        layers: usize,
        background_color: impl Into<String>,
    ) -> Result<Self, CanvasError> {
        check_dimensions(width, height)?;
        if layers == 0 {
            return Err(CanvasError::InvalidDimensions(
                "a layered canvas needs at least one layer".into(),
            ));
        }
        Ok(Canvas::Layered {
            layers: (0..layers).map(|_| Layer::new(width, height)).collect(),
            background_color: background_color.into(),
        })
    }

    /// Build a layered canvas from an uploaded drawing indexed `[layer][x][y]`,
    /// where each entry is a color or `"empty"`.
    pub fn layered_from_cells(
        width: u32,
        height: u32,
        cells: &[Vec<Vec<String>>],
        background_color: impl Into<String>,
    ) -> Result<Self, CanvasError> {
        let mut canvas = Self::layered(width, height, cells.len(), background_color)?;
        if let Canvas::Layered { layers, .. } = &mut canvas {
            for (layer, columns) in layers.iter_mut().zip(cells) {
                if columns.len() != width as usize
                    || columns.iter().any(|col| col.len() != height as usize)
                {
                    return Err(CanvasError::InvalidDimensions(format!(
                        "uploaded layer does not match {width}x{height}"
                    )));
                }
                for (x, column) in columns.iter().enumerate() {
                    for (y, color) in column.iter().enumerate() {
                        layer.set(x as i64, y as i64, cell_value(color))?;
                    }
                }
            }
        }
        Ok(canvas)
    }

    pub fn kind(&self) -> CanvasKind {
        match self {
            Canvas::Grid { .. } => CanvasKind::Grid,
            Canvas::Layered { .. } => CanvasKind::Layered,
        }
    }

    fn layers(&self) -> &[Layer] {
        match self {
            Canvas::Grid { layer, .. } => std::slice::from_ref(layer),
            Canvas::Layered { layers, .. } => layers,
        }
    }

    fn layers_mut(&mut self) -> &mut [Layer] {
        match self {
            Canvas::Grid { layer, .. } => std::slice::from_mut(layer),
            Canvas::Layered { layers, .. } => layers,
        }
    }

    fn layer(&self, index: usize) -> Result<&Layer, CanvasError> {
        let layers = self.layers();
        layers.get(index).ok_or(CanvasError::LayerOutOfBounds {
            layer: index,
            layers: layers.len(),
        })
    }

    fn layer_mut(&mut self, index: usize) -> Result<&mut Layer, CanvasError> {
        let layers = self.layers_mut();
        let count = layers.len();
        layers.get_mut(index).ok_or(CanvasError::LayerOutOfBounds {
            layer: index,
            layers: count,
        })
    }

    pub fn width(&self) -> u32 {
        self.layers()[0].width()
    }

    pub fn height(&self) -> u32 {
        self.layers()[0].height()
    }

    pub fn layer_count(&self) -> usize {
        self.layers().len()
    }

    pub fn background_color(&self) -> &str {
        match self {
            Canvas::Grid {
                background_color, ..
            }
            | Canvas::Layered {
                background_color, ..
            } => background_color,
        }
    }

    pub fn set_background(&mut self, color: impl Into<String>) -> Result<(), CanvasError> {
        let color = color.into();
        check_color(&color)?;
        match self {
            Canvas::Grid {
                background_color, ..
            }
            | Canvas::Layered {
                background_color, ..
            } => *background_color = color,
        }
        Ok(())
    }

    pub fn get(&self, layer: usize, x: i64, y: i64) -> Result<Option<&str>, CanvasError> {
        self.layer(layer)?.get(x, y)
    }

    /// Bounds-checked peek: would `set` with these arguments change anything?
    pub fn would_change(
        &self,
        layer: usize,
        x: i64,
        y: i64,
        color: &str,
    ) -> Result<bool, CanvasError> {
        check_color(color)?;
        Ok(self.get(layer, x, y)? != cell_value(color))
    }

    /// Paint one cell. `"empty"` erases. Repainting a cell with its current
    /// color is a no-op and returns `false`.
    pub fn set(&mut self, layer: usize, x: i64, y: i64, color: &str) -> Result<bool, CanvasError> {
        check_color(color)?;
        self.layer_mut(layer)?.set(x, y, cell_value(color))
    }

    /// Every non-empty cell, layer by layer, each layer in row-major order.
    pub fn snapshot(&self) -> Vec<PixelEntry> {
        self.layers()
            .iter()
            .enumerate()
            .flat_map(|(index, layer)| {
                layer.filled().map(move |(x, y, color)| PixelEntry {
                    layer: index,
                    x,
                    y,
                    color: color.to_string(),
                })
            })
            .collect()
    }

    pub fn clear(&mut self) {
        for layer in self.layers_mut() {
            layer.clear();
        }
        debug!(kind = ?self.kind(), "Canvas cleared");
    }

    /// Topmost non-empty color of every cell in row-major order.
    fn composite(&self) -> Vec<Option<&str>> {
        let layers = self.layers();
        let len = layers[0].cells().len();
        (0..len)
            .map(|idx| {
                layers
                    .iter()
                    .rev()
                    .find_map(|layer| layer.cells()[idx].as_deref())
            })
            .collect()
    }

    /// Fixed-width export encoding of the (composited) canvas.
    pub fn encode_compact(&self) -> Result<String, CanvasError> {
        codec::encode_cells(self.composite(), self.background_color())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_canvas_is_empty() {
        let canvas = Canvas::grid(4, 4, "#FFFFFF").unwrap();
        assert_eq!(canvas.kind(), CanvasKind::Grid);
        assert_eq!((canvas.width(), canvas.height(), canvas.layer_count()), (4, 4, 1));
        assert!(canvas.snapshot().is_empty());
        assert_eq!(canvas.get(0, 3, 3).unwrap(), None);
    }

    #[test]
    fn test_zero_sized_canvas_rejected() {
        assert!(matches!(
            Canvas::grid(0, 4, "#FFFFFF"),
            Err(CanvasError::InvalidDimensions(_))
        ));
        assert!(matches!(
            Canvas::layered(4, 4, 0, "#FFFFFF"),
            Err(CanvasError::InvalidDimensions(_))
        ));
    }

    #[test]
    fn test_out_of_bounds_leaves_canvas_unchanged() {
        let mut canvas = Canvas::grid(4, 4, "#FFFFFF").unwrap();
        canvas.set(0, 1, 1, "blue").unwrap();
        let before = canvas.snapshot();

        for (x, y) in [(-1, 0), (0, -1), (4, 0), (0, 4), (4, 4), (-5, 100)] {
            let err = canvas.set(0, x, y, "red").unwrap_err();
            assert!(matches!(err, CanvasError::OutOfBounds { width: 4, height: 4, .. }));
        }
        assert_eq!(canvas.snapshot(), before);
    }

    #[test]
    fn test_grid_rejects_other_layers() {
        let mut canvas = Canvas::grid(2, 2, "#FFFFFF").unwrap();
        assert_eq!(
            canvas.set(1, 0, 0, "red").unwrap_err(),
            CanvasError::LayerOutOfBounds { layer: 1, layers: 1 }
        );
    }

    #[test]
    fn test_same_color_is_noop() {
        let mut canvas = Canvas::grid(4, 4, "#FFFFFF").unwrap();
        assert!(canvas.set(0, 2, 3, "red").unwrap());
        let snapshot = canvas.snapshot();
        assert!(!canvas.set(0, 2, 3, "red").unwrap());
        assert_eq!(canvas.snapshot(), snapshot);
        assert!(!canvas.would_change(0, 2, 3, "red").unwrap());
        assert!(canvas.would_change(0, 2, 3, "blue").unwrap());
    }

    #[test]
    fn test_empty_marker_erases() {
        let mut canvas = Canvas::grid(2, 2, "#FFFFFF").unwrap();
        canvas.set(0, 0, 0, "red").unwrap();
        assert!(canvas.set(0, 0, 0, EMPTY).unwrap());
        assert!(canvas.snapshot().is_empty());
    }

    #[test]
    fn test_blank_color_rejected() {
        let mut canvas = Canvas::grid(2, 2, "#FFFFFF").unwrap();
        assert!(matches!(
            canvas.set(0, 0, 0, " "),
            Err(CanvasError::InvalidColor(_))
        ));
    }

    #[test]
    fn test_snapshot_row_major() {
        let mut canvas = Canvas::grid(4, 4, "#FFFFFF").unwrap();
        canvas.set(0, 1, 1, "blue").unwrap();
        canvas.set(0, 0, 0, "red").unwrap();
        canvas.set(0, 3, 0, "green").unwrap();
        let cells: Vec<_> = canvas
            .snapshot()
            .into_iter()
            .map(|p| (p.x, p.y, p.color))
            .collect();
        assert_eq!(
            cells,
            vec![
                (0, 0, "red".to_string()),
                (3, 0, "green".to_string()),
                (1, 1, "blue".to_string()),
            ]
        );
    }

    #[test]
    fn test_clear_empties_every_layer() {
        let mut canvas = Canvas::layered(3, 3, 2, "#000000").unwrap();
        canvas.set(0, 0, 0, "#111111").unwrap();
        canvas.set(1, 2, 2, "#222222").unwrap();
        assert_eq!(canvas.snapshot().len(), 2);
        canvas.clear();
        assert!(canvas.snapshot().is_empty());
        assert_eq!(canvas.layer_count(), 2);
    }

    #[test]
    fn test_layered_snapshot_tags_layers() {
        let mut canvas = Canvas::layered(2, 2, 2, "#FFFFFF").unwrap();
        canvas.set(1, 0, 0, "#00FF00").unwrap();
        canvas.set(0, 1, 1, "#FF0000").unwrap();
        let snapshot = canvas.snapshot();
        assert_eq!(snapshot[0].layer, 0);
        assert_eq!((snapshot[0].x, snapshot[0].y), (1, 1));
        assert_eq!(snapshot[1].layer, 1);
    }

    #[test]
    fn test_encode_compact_grid() {
        let mut canvas = Canvas::grid(2, 2, "#ffffff").unwrap();
        canvas.set(0, 0, 0, "#ff0000").unwrap();
        canvas.set(0, 1, 1, "0000FF").unwrap();
        assert_eq!(
            canvas.encode_compact().unwrap(),
            "FF0000FFFFFFFFFFFF0000FF"
        );
    }

    #[test]
    fn test_encode_compact_composites_top_layer() {
        let mut canvas = Canvas::layered(2, 1, 2, "#000000").unwrap();
        canvas.set(0, 0, 0, "#111111").unwrap();
        canvas.set(1, 0, 0, "#222222").unwrap();
        canvas.set(0, 1, 0, "#333333").unwrap();
        assert_eq!(canvas.encode_compact().unwrap(), "222222333333");
    }

    #[test]
    fn test_encode_compact_named_color_fails() {
        let mut canvas = Canvas::grid(1, 1, "#FFFFFF").unwrap();
        canvas.set(0, 0, 0, "red").unwrap();
        assert!(matches!(
            canvas.encode_compact(),
            Err(CanvasError::UnencodableColor(_))
        ));
    }

    #[test]
    fn test_layered_from_cells() {
        let cells = vec![vec![
            vec!["#FF0000".to_string(), EMPTY.to_string()],
            vec![EMPTY.to_string(), "#00FF00".to_string()],
        ]];
        let canvas = Canvas::layered_from_cells(2, 2, &cells, "#FFFFFF").unwrap();
        assert_eq!(canvas.get(0, 0, 0).unwrap(), Some("#FF0000"));
        assert_eq!(canvas.get(0, 1, 1).unwrap(), Some("#00FF00"));
        assert_eq!(canvas.get(0, 1, 0).unwrap(), None);

        let ragged = vec![vec![vec![EMPTY.to_string()]]];
        assert!(matches!(
            Canvas::layered_from_cells(2, 2, &ragged, "#FFFFFF"),
            Err(CanvasError::InvalidDimensions(_))
        ));
    }

    #[test]
    fn test_set_background() {
        let mut canvas = Canvas::grid(1, 1, "#FFFFFF").unwrap();
        canvas.set_background("#000000").unwrap();
        assert_eq!(canvas.background_color(), "#000000");
        assert_eq!(canvas.encode_compact().unwrap(), "000000");
    }
}
