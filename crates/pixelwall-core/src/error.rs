use thiserror::Error;

#[derive(Debug, Error)]
pub enum PixelWallError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("Auth error: {0}")]
    Auth(String),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Failure reported by an artwork persistence backend.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Artwork store IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Artwork encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Artwork rejected: {0}")]
    Rejected(String),
}

pub type Result<T> = std::result::Result<T, PixelWallError>;
