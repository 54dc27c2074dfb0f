//! Artwork export: the hand-off from a live canvas to durable storage.
//!
//! The coordinator builds an [`ArtworkRequest`]; an [`ArtworkStore`] performs
//! the write and returns the new artwork's identifier.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::PersistenceError;
use crate::types::Participant;

pub type ArtworkId = String;

/// Everything needed to persist a finished canvas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtworkRequest {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub background_color: String,
    /// Compact row-major encoding, one 6-hex-digit token per cell.
    pub encoded_grid: String,
    pub creators: Vec<Participant>,
    pub is_public: bool,
    pub created_at: DateTime<Utc>,
}

/// A stored artwork as returned by [`JsonArtworkStore::list`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtworkRecord {
    pub id: ArtworkId,
    #[serde(flatten)]
    pub artwork: ArtworkRequest,
}

/// Durable destination for exported canvases.
#[async_trait]
pub trait ArtworkStore: Send + Sync {
    async fn save(&self, request: &ArtworkRequest) -> Result<ArtworkId, PersistenceError>;
}

/// File-based artwork store.
///
/// Layout: `<base>/<id>.json`, one pretty-printed [`ArtworkRecord`] per file.
pub struct JsonArtworkStore {
    base: PathBuf,
}

impl JsonArtworkStore {
    pub fn new(base: PathBuf) -> Self {
        Self { base }
    }

    /// Default store location: `~/.pixelwall/artworks/`
    pub fn default_path() -> PathBuf {
        crate::config::data_dir().join("artworks")
    }

    fn artwork_path(&self, id: &str) -> PathBuf {
        self.base.join(format!("{id}.json"))
    }

    /// Load every stored artwork, oldest first.
    pub async fn list(&self) -> Result<Vec<ArtworkRecord>, PersistenceError> {
        if !self.base.exists() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.base).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = tokio::fs::read_to_string(&path).await?;
            records.push(serde_json::from_str::<ArtworkRecord>(&data)?);
        }
        records.sort_by_key(|r| r.artwork.created_at);
        Ok(records)
    }
}

#[async_trait]
impl ArtworkStore for JsonArtworkStore {
    async fn save(&self, request: &ArtworkRequest) -> Result<ArtworkId, PersistenceError> {
        if request.title.trim().is_empty() {
            return Err(PersistenceError::Rejected("title must not be empty".into()));
        }
        tokio::fs::create_dir_all(&self.base).await?;

        let id = uuid::Uuid::new_v4().to_string();
        let record = ArtworkRecord {
            id: id.clone(),
            artwork: request.clone(),
        };
        let data = serde_json::to_string_pretty(&record)?;

        // Atomic write: write to temp then rename
        let path = self.artwork_path(&id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data.as_bytes()).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(id = %id, title = %request.title, "Saved artwork");
        Ok(id)
    }
}
