//! WebSocket connection lifecycle: handshake, then read and write loops.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use pixelwall_core::protocol::{
    AuthParams, ConnectParams, Features, GatewayFrame, HelloOk, Policy, ServerInfo, Snapshot,
    PROTOCOL_VERSION,
};
use pixelwall_core::types::Participant;

use crate::events::EVENTS;
use crate::methods::{dispatch_method, METHODS};
use crate::state::{ConnectionState, GatewayState};

const AUTH_TIMEOUT_MS: u64 = 10_000;
const MAX_PAYLOAD: usize = 1_048_576;

/// Frames queued for a connection's socket before its forwarders block.
pub const OUTBOUND_BUFFER: usize = 256;

/// An authenticated connection and the group forwarders it owns.
pub struct Session {
    pub conn_id: String,
    pub participant: Participant,
    pub event_tx: mpsc::Sender<String>,
    forwarders: HashMap<String, CancellationToken>,
}

impl Session {
    pub fn new(
        conn_id: impl Into<String>,
        participant: Participant,
        event_tx: mpsc::Sender<String>,
    ) -> Self {
        Self {
            conn_id: conn_id.into(),
            participant,
            event_tx,
            forwarders: HashMap::new(),
        }
    }

    pub fn is_tracking(&self, group: &str) -> bool {
        self.forwarders.contains_key(group)
    }

    /// Remember the forwarder for `group`, stopping any previous one.
    pub fn track(&mut self, group: &str, cancel: CancellationToken) {
        if let Some(previous) = self.forwarders.insert(group.to_string(), cancel) {
            previous.cancel();
        }
    }

    pub fn untrack(&mut self, group: &str) {
        if let Some(cancel) = self.forwarders.remove(group) {
            cancel.cancel();
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, cancel) in self.forwarders.drain() {
            cancel.cancel();
        }
    }
}

/// Resolve the participant for a connect request.
async fn authenticate(
    state: &GatewayState,
    params: &ConnectParams,
) -> Result<Participant, String> {
    if params.min_protocol > PROTOCOL_VERSION || params.max_protocol < PROTOCOL_VERSION {
        return Err(format!(
            "Unsupported protocol range {}..={} (server speaks {PROTOCOL_VERSION})",
            params.min_protocol, params.max_protocol
        ));
    }

    match state.config.auth_mode() {
        // Admin rights come only from a resolved token.
        "none" => params
            .participant
            .clone()
            .map(|participant| Participant {
                is_admin: false,
                ..participant
            })
            .ok_or_else(|| "Participant identity required".to_string()),
        "token" => match &params.auth {
            Some(AuthParams::Token { token }) => state
                .participants
                .resolve(token)
                .await
                .ok_or_else(|| "Invalid token".to_string()),
            None => Err("Token authentication required".to_string()),
        },
        other => Err(format!("Unknown auth mode: {other}")),
    }
}

/// Handle a new WebSocket connection.
pub async fn handle_ws_connection(state: Arc<GatewayState>, ws: WebSocket) {
    let conn_id = Uuid::new_v4().to_string();
    info!(conn_id = %conn_id, "New WebSocket connection");

    let (mut ws_tx, mut ws_rx) = ws.split();
    let mode = state.config.auth_mode().to_string();

    let hello = HelloOk {
        protocol: PROTOCOL_VERSION,
        server: ServerInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            conn_id: conn_id.clone(),
        },
        features: Features {
            methods: METHODS.iter().map(|m| m.to_string()).collect(),
            events: EVENTS.iter().map(|e| e.to_string()).collect(),
        },
        snapshot: Snapshot {
            grid: state.registry.grid_name().to_string(),
            auth_mode: mode,
        },
        policy: Policy {
            max_payload: MAX_PAYLOAD,
            auth_timeout_ms: AUTH_TIMEOUT_MS,
        },
    };

    let hello_frame = GatewayFrame::event("hello", serde_json::to_value(&hello).ok());
    if let Ok(msg) = serde_json::to_string(&hello_frame) {
        if ws_tx.send(Message::Text(msg.into())).await.is_err() {
            return;
        }
    }

    // The first frame must be a connect request.
    let auth_result = tokio::time::timeout(
        std::time::Duration::from_millis(AUTH_TIMEOUT_MS),
        wait_for_connect(&state, &mut ws_rx, &conn_id),
    )
    .await;

    let participant = match auth_result {
        Ok(Ok((request_id, participant))) => {
            let ok = GatewayFrame::ok(
                &request_id,
                serde_json::json!({
                    "conn_id": conn_id,
                    "participant": participant,
                }),
            );
            if let Ok(msg) = serde_json::to_string(&ok) {
                if ws_tx.send(Message::Text(msg.into())).await.is_err() {
                    return;
                }
            }
            info!(conn_id = %conn_id, participant = participant.id, "Client authenticated");
            participant
        }
        Ok(Err(reason)) => {
            warn!(conn_id = %conn_id, %reason, "Authentication failed");
            let err_frame =
                GatewayFrame::event("auth.error", Some(serde_json::json!({"message": reason})));
            if let Ok(msg) = serde_json::to_string(&err_frame) {
                let _ = ws_tx.send(Message::Text(msg.into())).await;
            }
            let _ = ws_tx.send(Message::Close(None)).await;
            return;
        }
        Err(_) => {
            warn!(conn_id = %conn_id, "Authentication timeout");
            let err_frame = GatewayFrame::event(
                "auth.error",
                Some(serde_json::json!({"message": "Authentication timeout"})),
            );
            if let Ok(msg) = serde_json::to_string(&err_frame) {
                let _ = ws_tx.send(Message::Text(msg.into())).await;
            }
            let _ = ws_tx.send(Message::Close(None)).await;
            return;
        }
    };

    let (event_tx, mut event_rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);
    {
        let mut connections = state.connections.write().await;
        connections.insert(
            conn_id.clone(),
            ConnectionState {
                conn_id: conn_id.clone(),
                event_tx: event_tx.clone(),
                participant: participant.clone(),
                connected_at: chrono::Utc::now(),
            },
        );
    }
    #[cfg(feature = "metrics")]
    crate::metrics::record_ws_connect();

    let mut session = Session::new(conn_id.clone(), participant, event_tx.clone());

    // Spawn event sender task
    let send_task = tokio::spawn(async move {
        while let Some(msg) = event_rx.recv().await {
            if ws_tx.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    // Main read loop
    while let Some(msg_result) = ws_rx.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                let text = text.to_string();
                if text.len() > MAX_PAYLOAD {
                    warn!(conn_id = %conn_id, len = text.len(), "Oversized frame dropped");
                    let frame = GatewayFrame::error("unknown", "payload_too_large", "Frame too large");
                    crate::events::send_to(&event_tx, &frame).await;
                    continue;
                }
                match serde_json::from_str::<GatewayFrame>(&text) {
                    Ok(GatewayFrame::Request { id, method, params }) => {
                        let response =
                            dispatch_method(&state, &mut session, &id, &method, params).await;
                        crate::events::send_to(&event_tx, &response).await;
                    }
                    Ok(_) => {
                        debug!(conn_id = %conn_id, "Received non-request frame, ignoring");
                    }
                    Err(e) => {
                        warn!(conn_id = %conn_id, %e, "Invalid frame received");
                        let frame = GatewayFrame::error(
                            "unknown",
                            "parse_error",
                            &format!("Invalid frame: {e}"),
                        );
                        crate::events::send_to(&event_tx, &frame).await;
                    }
                }
            }
            Ok(Message::Close(_)) => {
                debug!(conn_id = %conn_id, "Client requested close");
                break;
            }
            Err(e) => {
                error!(conn_id = %conn_id, %e, "WebSocket error");
                break;
            }
            _ => {}
        }
    }

    // Cleanup
    cleanup_connection(&state, &mut session).await;
    send_task.abort();
    info!(conn_id = %conn_id, "WebSocket connection closed");
}

/// Wait for the client's connect request and authenticate it.
/// Returns the request id to answer and the resolved participant.
async fn wait_for_connect(
    state: &GatewayState,
    ws_rx: &mut futures::stream::SplitStream<WebSocket>,
    conn_id: &str,
) -> Result<(String, Participant), String> {
    while let Some(msg_result) = ws_rx.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                let text = text.to_string();
                return match serde_json::from_str::<GatewayFrame>(&text) {
                    Ok(GatewayFrame::Request {
                        id,
                        method,
                        params: Some(params),
                    }) if method == "connect" => {
                        let connect = serde_json::from_value::<ConnectParams>(params)
                            .map_err(|e| format!("Invalid connect params: {e}"))?;
                        let participant = authenticate(state, &connect).await?;
                        Ok((id, participant))
                    }
                    _ => {
                        debug!(conn_id, "Received non-connect message during handshake");
                        Err("Expected a connect request".to_string())
                    }
                };
            }
            Ok(Message::Close(_)) => return Err("Connection closed during auth".to_string()),
            Err(e) => return Err(format!("WebSocket error during auth: {e}")),
            _ => continue,
        }
    }
    Err("Connection dropped during auth".to_string())
}

/// Tear down everything a connection owns. Never fails; problems are logged.
pub async fn cleanup_connection(state: &GatewayState, session: &mut Session) {
    session.cancel_all();

    let removed = state
        .registry
        .remove_connection_from_all_groups(&session.conn_id)
        .await;
    for (group, participant) in &removed {
        debug!(conn_id = %session.conn_id, group = %group, participant = participant.id, "Removed from group on disconnect");
    }
    if state.registry.has_connection(&session.conn_id).await {
        warn!(conn_id = %session.conn_id, "Connection still recorded after cleanup");
    }

    let removed_state = state.connections.write().await.remove(&session.conn_id);
    if removed_state.is_some() {
        #[cfg(feature = "metrics")]
        crate::metrics::record_ws_disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pixelwall_core::artwork::JsonArtworkStore;
    use pixelwall_core::auth::StaticParticipantResolver;
    use pixelwall_core::config::{Config, GatewayAuthConfig, GatewayConfig};
    use pixelwall_core::protocol::ClientInfo;

    use crate::registry::CoordinatorRegistry;

    fn make_state(mode: &str) -> GatewayState {
        let config = Config {
            gateway: Some(GatewayConfig {
                port: 7154,
                bind: None,
                auth: Some(GatewayAuthConfig {
                    mode: Some(mode.to_string()),
                }),
            }),
            ..Default::default()
        };
        let mut resolver = StaticParticipantResolver::new();
        resolver.insert("secret-token", Participant::new(42, "ada"));
        let registry = CoordinatorRegistry::from_config(&config).unwrap();
        GatewayState::new(
            Arc::new(config),
            Arc::new(registry),
            Arc::new(resolver),
            Arc::new(JsonArtworkStore::new(std::env::temp_dir().join("pixelwall-unused"))),
        )
    }

    fn make_connect_params(
        auth: Option<AuthParams>,
        participant: Option<Participant>,
    ) -> ConnectParams {
        ConnectParams {
            min_protocol: 1,
            max_protocol: 1,
            client: ClientInfo {
                id: "test".into(),
                version: None,
                platform: None,
            },
            auth,
            participant,
        }
    }

    #[tokio::test]
    async fn test_auth_mode_none_uses_declared_participant() {
        let state = make_state("none");
        let params = make_connect_params(None, Some(Participant::new(5, "bob")));
        assert_eq!(
            authenticate(&state, &params).await.unwrap(),
            Participant::new(5, "bob")
        );
        let params = make_connect_params(None, None);
        assert!(authenticate(&state, &params).await.is_err());
    }

    #[tokio::test]
    async fn test_auth_mode_none_never_grants_admin() {
        let state = make_state("none");
        let params = make_connect_params(None, Some(Participant::admin(666, "anon")));
        let participant = authenticate(&state, &params).await.unwrap();
        assert_eq!(participant.id, 666);
        assert!(!participant.is_admin);
    }

    #[tokio::test]
    async fn test_default_config_declared_admin_is_not_admin() {
        let config = Config::default();
        assert_eq!(config.auth_mode(), "none");
        let registry = CoordinatorRegistry::from_config(&config).unwrap();
        let state = GatewayState::new(
            Arc::new(config),
            Arc::new(registry),
            Arc::new(StaticParticipantResolver::new()),
            Arc::new(JsonArtworkStore::new(std::env::temp_dir().join("pixelwall-unused"))),
        );
        let params = make_connect_params(None, Some(Participant::admin(1, "root")));
        assert!(!authenticate(&state, &params).await.unwrap().is_admin);
    }

    #[tokio::test]
    async fn test_auth_token_valid() {
        let state = make_state("token");
        let params = make_connect_params(
            Some(AuthParams::Token {
                token: "secret-token".into(),
            }),
            None,
        );
        assert_eq!(authenticate(&state, &params).await.unwrap().id, 42);
    }

    #[tokio::test]
    async fn test_auth_token_ignores_declared_participant() {
        let state = make_state("token");
        let params = make_connect_params(
            Some(AuthParams::Token {
                token: "wrong-token".into(),
            }),
            Some(Participant::admin(1, "mallory")),
        );
        assert!(authenticate(&state, &params).await.is_err());
        let params = make_connect_params(None, Some(Participant::admin(1, "mallory")));
        assert!(authenticate(&state, &params).await.is_err());
    }

    #[tokio::test]
    async fn test_protocol_mismatch_rejected() {
        let state = make_state("none");
        let mut params = make_connect_params(None, Some(Participant::new(5, "bob")));
        params.min_protocol = 2;
        params.max_protocol = 3;
        let err = authenticate(&state, &params).await.unwrap_err();
        assert!(err.contains("Unsupported protocol"));
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let state = make_state("none");
        let (tx, _rx) = mpsc::channel(OUTBOUND_BUFFER);
        let mut session = Session::new("c1", Participant::new(1, "a"), tx);
        state
            .registry
            .add_connection("c1", &session.participant, "grid")
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        session.track("grid", cancel.clone());

        cleanup_connection(&state, &mut session).await;
        assert!(cancel.is_cancelled());
        assert!(!state.registry.has_connection("c1").await);
        assert!(state.registry.members("grid").await.unwrap().is_empty());

        cleanup_connection(&state, &mut session).await;
        assert!(!session.is_tracking("grid"));
    }

    #[test]
    fn test_track_replaces_previous_forwarder() {
        let (tx, _rx) = mpsc::channel(OUTBOUND_BUFFER);
        let mut session = Session::new("c1", Participant::new(1, "a"), tx);
        let first = CancellationToken::new();
        let second = CancellationToken::new();
        session.track("grid", first.clone());
        session.track("grid", second.clone());
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        session.untrack("grid");
        assert!(second.is_cancelled());
    }
}
