//! Participant resolution. Maps a client credential to a [`Participant`].
//!
//! The gateway never interprets tokens itself; it asks a resolver.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::warn;

use crate::config::ParticipantConfig;
use crate::types::Participant;

/// Resolves a session token to the participant it belongs to.
#[async_trait]
pub trait ParticipantResolver: Send + Sync {
    async fn resolve(&self, token: &str) -> Option<Participant>;
}

/// Resolver backed by a fixed token table, usually built from config.
#[derive(Debug, Default)]
pub struct StaticParticipantResolver {
    by_token: HashMap<String, Participant>,
}

impl StaticParticipantResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(entries: &[ParticipantConfig]) -> Self {
        let mut resolver = Self::new();
        for entry in entries {
            match entry.resolve_token() {
                Some(token) => resolver.insert(
                    token,
                    Participant {
                        id: entry.id,
                        display_name: entry.display_name.clone(),
                        is_admin: entry.is_admin,
                    },
                ),
                None => warn!(id = entry.id, "Participant has no token; skipping"),
            }
        }
        resolver
    }

    pub fn insert(&mut self, token: impl Into<String>, participant: Participant) {
        self.by_token.insert(token.into(), participant);
    }

    pub fn len(&self) -> usize {
        self.by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_token.is_empty()
    }
}

#[async_trait]
impl ParticipantResolver for StaticParticipantResolver {
    async fn resolve(&self, token: &str) -> Option<Participant> {
        self.by_token.get(token).cloned()
    }
}
