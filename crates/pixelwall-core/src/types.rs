use serde::{Deserialize, Serialize};

/// Stable numeric identity of a participant.
pub type ParticipantId = i64;

/// Transport-level connection identifier (one per live WebSocket).
pub type ConnectionId = String;

/// Identity used for rate limiting and attribution.
///
/// Produced by a [`ParticipantResolver`](crate::auth::ParticipantResolver);
/// the coordinator only ever holds copies of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub display_name: String,
    #[serde(default)]
    pub is_admin: bool,
}

impl Participant {
    pub fn new(id: ParticipantId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            is_admin: false,
        }
    }

    pub fn admin(id: ParticipantId, display_name: impl Into<String>) -> Self {
        Self {
            is_admin: true,
            ..Self::new(id, display_name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_participant_deser_defaults_admin_false() {
        let p: Participant =
            serde_json::from_str(r#"{"id": 7, "display_name": "Ada"}"#).unwrap();
        assert_eq!(p, Participant::new(7, "Ada"));
        assert!(!p.is_admin);
    }
}
