//! PixelWall gateway wire protocol.
//!
//! All gateway communication uses JSON-over-WebSocket with three frame types:
//! Request, Response, and Event.

use serde::{Deserialize, Serialize};

use crate::types::Participant;

/// Protocol version implemented by this gateway.
pub const PROTOCOL_VERSION: u32 = 1;

/// A gateway wire frame, the top-level message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GatewayFrame {
    /// Client -> Server request.
    #[serde(rename = "req")]
    Request {
        id: String,
        method: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        params: Option<serde_json::Value>,
    },

    /// Server -> Client response.
    #[serde(rename = "res")]
    Response {
        id: String,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ErrorShape>,
    },

    /// Server -> Client event.
    ///
    /// Group events carry the group name and that group's sequence number.
    #[serde(rename = "event")]
    Event {
        event: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        group: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },
}

impl GatewayFrame {
    pub fn ok(id: &str, payload: serde_json::Value) -> Self {
        GatewayFrame::Response {
            id: id.to_string(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn error(id: &str, code: &str, message: &str) -> Self {
        GatewayFrame::Response {
            id: id.to_string(),
            ok: false,
            payload: None,
            error: Some(ErrorShape {
                code: code.to_string(),
                message: message.to_string(),
                details: None,
            }),
        }
    }

    /// A connection-level event not tied to any group.
    pub fn event(event: &str, payload: Option<serde_json::Value>) -> Self {
        GatewayFrame::Event {
            event: event.to_string(),
            payload,
            group: None,
            seq: None,
        }
    }
}

/// Error shape returned in response frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Client handshake parameters, sent as the params of the first `connect` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectParams {
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub client: ClientInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthParams>,
    /// Self-declared identity, honoured only when the gateway runs with auth mode "none".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub participant: Option<Participant>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub id: String,
    pub version: Option<String>,
    pub platform: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AuthParams {
    #[serde(rename = "token")]
    Token { token: String },
}

/// Server hello sent as soon as the socket opens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloOk {
    pub protocol: u32,
    pub server: ServerInfo,
    pub features: Features,
    pub snapshot: Snapshot,
    pub policy: Policy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub version: String,
    pub conn_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Features {
    pub methods: Vec<String>,
    pub events: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Name of the always-present shared grid.
    pub grid: String,
    pub auth_mode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub max_payload: usize,
    pub auth_timeout_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_frame_roundtrip_shape() {
        let raw = r#"{"type":"req","id":"1","method":"group.join","params":{"name":"grid"}}"#;
        let frame: GatewayFrame = serde_json::from_str(raw).unwrap();
        match frame {
            GatewayFrame::Request { id, method, params } => {
                assert_eq!(id, "1");
                assert_eq!(method, "group.join");
                assert_eq!(params.unwrap()["name"], "grid");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_error_response_serialization() {
        let frame = GatewayFrame::error("9", "not_found", "Group not found: x");
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "res");
        assert_eq!(json["ok"], false);
        assert_eq!(json["error"]["code"], "not_found");
        assert!(json.get("payload").is_none());
    }

    #[test]
    fn test_event_omits_empty_group_fields() {
        let json = serde_json::to_value(GatewayFrame::event("hello", None)).unwrap();
        assert_eq!(json["type"], "event");
        assert!(json.get("group").is_none());
        assert!(json.get("seq").is_none());
    }

    #[test]
    fn test_connect_params_with_token() {
        let raw = r#"{
            "min_protocol": 1, "max_protocol": 1,
            "client": {"id": "web", "version": null, "platform": null},
            "auth": {"type": "token", "token": "abc"}
        }"#;
        let params: ConnectParams = serde_json::from_str(raw).unwrap();
        assert!(matches!(params.auth, Some(AuthParams::Token { ref token }) if token == "abc"));
        assert!(params.participant.is_none());
    }
}
