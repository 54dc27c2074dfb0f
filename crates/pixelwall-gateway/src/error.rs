use pixelwall_canvas::CanvasError;
use thiserror::Error;

/// Structural failures of coordinator operations.
///
/// A rate-limited paint is not an error; see [`PaintOutcome`](crate::PaintOutcome).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordinatorError {
    #[error("Group not found: {0}")]
    NotFound(String),

    #[error("Group already exists: {0}")]
    AlreadyExists(String),

    #[error("Connection {conn_id} is not a member of group {group}")]
    NotConnected { conn_id: String, group: String },

    #[error("Group {0} is disabled")]
    Disabled(String),

    #[error("Group {0} cannot be removed")]
    Protected(String),

    #[error("Invalid group name: {0:?}")]
    InvalidName(String),

    #[error("Group limit of {0} reached")]
    TooManyGroups(usize),

    #[error("Permission denied: {0}")]
    Forbidden(String),

    #[error(transparent)]
    Canvas(#[from] CanvasError),
}

impl CoordinatorError {
    /// Stable wire code for protocol error responses.
    pub fn code(&self) -> &'static str {
        match self {
            CoordinatorError::NotFound(_) => "not_found",
            CoordinatorError::AlreadyExists(_) => "already_exists",
            CoordinatorError::NotConnected { .. } => "not_connected",
            CoordinatorError::Disabled(_) => "disabled",
            CoordinatorError::Protected(_) => "protected",
            CoordinatorError::InvalidName(_) => "invalid_params",
            CoordinatorError::TooManyGroups(_) => "too_many_groups",
            CoordinatorError::Forbidden(_) => "forbidden",
            CoordinatorError::Canvas(e) => match e {
                CanvasError::OutOfBounds { .. } | CanvasError::LayerOutOfBounds { .. } => {
                    "out_of_bounds"
                }
                CanvasError::InvalidDimensions(_) => "invalid_canvas",
                CanvasError::UnencodableColor(_) => "unencodable_color",
                CanvasError::InvalidColor(_) => "invalid_params",
            },
        }
    }
}
