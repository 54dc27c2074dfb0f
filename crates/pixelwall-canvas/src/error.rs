use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CanvasError {
    #[error("({x}, {y}) is outside the {width}x{height} canvas")]
    OutOfBounds {
        x: i64,
        y: i64,
        width: u32,
        height: u32,
    },

    #[error("layer {layer} does not exist (canvas has {layers})")]
    LayerOutOfBounds { layer: usize, layers: usize },

    #[error("invalid canvas dimensions: {0}")]
    InvalidDimensions(String),

    #[error("color '{0}' cannot be encoded as six hex digits")]
    UnencodableColor(String),

    #[error("invalid color: {0:?}")]
    InvalidColor(String),
}
