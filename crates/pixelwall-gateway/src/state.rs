//! Gateway shared state.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, RwLock};

use pixelwall_core::artwork::{ArtworkStore, JsonArtworkStore};
use pixelwall_core::auth::{ParticipantResolver, StaticParticipantResolver};
use pixelwall_core::config::Config;
use pixelwall_core::types::Participant;

use crate::registry::CoordinatorRegistry;

/// Shared gateway state accessible from all connections and handlers.
pub struct GatewayState {
    pub config: Arc<Config>,
    pub registry: Arc<CoordinatorRegistry>,
    pub participants: Arc<dyn ParticipantResolver>,
    pub artworks: Arc<dyn ArtworkStore>,
    pub connections: RwLock<HashMap<String, ConnectionState>>,
    #[cfg(feature = "metrics")]
    pub metrics: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

/// Per-connection state.
pub struct ConnectionState {
    pub conn_id: String,
    pub event_tx: mpsc::Sender<String>,
    pub participant: Participant,
    pub connected_at: DateTime<Utc>,
}

impl GatewayState {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<CoordinatorRegistry>,
        participants: Arc<dyn ParticipantResolver>,
        artworks: Arc<dyn ArtworkStore>,
    ) -> Self {
        Self {
            config,
            registry,
            participants,
            artworks,
            connections: RwLock::new(HashMap::new()),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Wire up the reference collaborators described by `config`.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let registry = CoordinatorRegistry::from_config(&config)?;
        let participants = StaticParticipantResolver::from_config(&config.participants);
        let artworks = JsonArtworkStore::new(config.artwork_dir());
        Ok(Self::new(
            Arc::new(config),
            Arc::new(registry),
            Arc::new(participants),
            Arc::new(artworks),
        ))
    }

    /// Attach the Prometheus handle rendered at `/metrics`.
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, handle: metrics_exporter_prometheus::PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}
