//! Shared pixel canvases.
//!
//! A [`Canvas`] is either a single-layer grid or a stack of layers of the same
//! size. Every mutation is bounds-checked; cells hold a color string or are
//! empty.

pub mod canvas;
pub mod codec;
pub mod error;
pub mod layer;
pub mod protocol;

pub use canvas::{Canvas, CanvasKind};
pub use error::CanvasError;
pub use layer::Layer;
pub use protocol::{PixelEntry, Point};
