//! Group event stream and per-connection fan-out.
//!
//! Every group publishes [`GroupEnvelope`]s on its own broadcast channel while
//! holding its lock, which fixes the order. A forwarder task per
//! (connection, group) pair copies envelopes onto the connection's bounded
//! outbound queue without touching any lock. A forwarder stuck behind a slow
//! socket falls behind on the broadcast channel and is resynced from a fresh
//! snapshot.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use pixelwall_canvas::{CanvasKind, PixelEntry, Point};
use pixelwall_core::protocol::GatewayFrame;
use pixelwall_core::types::Participant;

use crate::group::GroupKind;
use crate::registry::CoordinatorRegistry;

/// Event names advertised in the hello frame.
pub const EVENTS: &[&str] = &[
    "group.sync",
    "group.pixels",
    "group.member_joined",
    "group.member_left",
    "group.enabled",
    "group.disabled",
    "group.background",
    "group.message",
    "group.closed",
];

/// Full state of a group, sent on join, after a clear, and to lagging
/// subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupSync {
    pub name: String,
    pub kind: GroupKind,
    pub canvas: CanvasKind,
    pub width: u32,
    pub height: u32,
    pub layers: usize,
    pub background_color: String,
    pub enabled: bool,
    pub cells: Vec<PixelEntry>,
}

/// Something that happened in a group. Serialized as the event payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum GroupEvent {
    Sync(GroupSync),
    Pixels {
        layer: usize,
        color: String,
        points: Vec<Point>,
        participant_id: i64,
    },
    MemberJoined {
        participant: Participant,
        members: usize,
    },
    MemberLeft {
        participant: Participant,
        members: usize,
    },
    Enabled,
    Disabled,
    Background {
        color: String,
    },
    Message {
        from: Participant,
        text: String,
    },
    Closed,
}

impl GroupEvent {
    pub fn name(&self) -> &'static str {
        match self {
            GroupEvent::Sync(_) => "group.sync",
            GroupEvent::Pixels { .. } => "group.pixels",
            GroupEvent::MemberJoined { .. } => "group.member_joined",
            GroupEvent::MemberLeft { .. } => "group.member_left",
            GroupEvent::Enabled => "group.enabled",
            GroupEvent::Disabled => "group.disabled",
            GroupEvent::Background { .. } => "group.background",
            GroupEvent::Message { .. } => "group.message",
            GroupEvent::Closed => "group.closed",
        }
    }
}

/// A group event stamped with its group's sequence number.
#[derive(Debug, Clone)]
pub struct GroupEnvelope {
    pub group: String,
    pub seq: u64,
    pub event: GroupEvent,
}

impl GroupEnvelope {
    pub fn to_frame(&self) -> GatewayFrame {
        let payload = match serde_json::to_value(&self.event) {
            Ok(serde_json::Value::Null) => None,
            Ok(value) => Some(value),
            Err(e) => {
                error!(%e, group = %self.group, "Failed to serialize group event");
                None
            }
        };
        GatewayFrame::Event {
            event: self.event.name().to_string(),
            payload,
            group: Some(self.group.clone()),
            seq: Some(self.seq),
        }
    }
}

/// Serialize `frame` onto a connection's outbound queue, waiting for room.
/// Returns `false` once the connection's writer has gone away.
pub async fn send_to(event_tx: &mpsc::Sender<String>, frame: &GatewayFrame) -> bool {
    match serde_json::to_string(frame) {
        Ok(msg) => event_tx.send(msg).await.is_ok(),
        Err(e) => {
            error!(%e, "Failed to serialize frame");
            true
        }
    }
}

/// Forward one group's events to one connection until cancelled, the group
/// closes, or the connection's writer drops.
///
/// `after_seq` is the sequence number of the sync the connection already
/// holds; envelopes at or below it are skipped.
pub fn spawn_forwarder(
    registry: Arc<CoordinatorRegistry>,
    group: String,
    mut events: broadcast::Receiver<Arc<GroupEnvelope>>,
    event_tx: mpsc::Sender<String>,
    cancel: CancellationToken,
    after_seq: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut floor = after_seq;
        loop {
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                received = events.recv() => received,
            };

            match received {
                Ok(envelope) => {
                    if envelope.seq <= floor {
                        continue;
                    }
                    floor = envelope.seq;
                    if !deliver(&event_tx, &cancel, &envelope.to_frame()).await {
                        break;
                    }
                    if envelope.event == GroupEvent::Closed {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(group = %group, skipped, "Subscriber lagged, resyncing");
                    match registry.snapshot(&group).await {
                        Ok(envelope) => {
                            floor = envelope.seq;
                            if !deliver(&event_tx, &cancel, &envelope.to_frame()).await {
                                break;
                            }
                        }
                        Err(e) => {
                            debug!(group = %group, %e, "Group gone during resync");
                            break;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!(group = %group, "Forwarder stopped");
    })
}

/// Like [`send_to`], but gives up as soon as `cancel` fires.
async fn deliver(
    event_tx: &mpsc::Sender<String>,
    cancel: &CancellationToken,
    frame: &GatewayFrame,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        delivered = send_to(event_tx, frame) => delivered,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use pixelwall_canvas::Canvas;
    use pixelwall_core::config::RateLimitConfig;

    use crate::group::{GroupSpec, EVENT_BUFFER};

    #[test]
    fn test_pixels_frame_shape() {
        let envelope = GroupEnvelope {
            group: "grid".into(),
            seq: 7,
            event: GroupEvent::Pixels {
                layer: 0,
                color: "#FF0000".into(),
                points: vec![Point::new(1, 2)],
                participant_id: 3,
            },
        };
        let json = serde_json::to_value(envelope.to_frame()).unwrap();
        assert_eq!(json["type"], "event");
        assert_eq!(json["event"], "group.pixels");
        assert_eq!(json["group"], "grid");
        assert_eq!(json["seq"], 7);
        assert_eq!(json["payload"]["points"][0]["x"], 1);
        assert_eq!(json["payload"]["participant_id"], 3);
    }

    #[test]
    fn test_unit_events_have_no_payload() {
        let envelope = GroupEnvelope {
            group: "g".into(),
            seq: 1,
            event: GroupEvent::Disabled,
        };
        let json = serde_json::to_value(envelope.to_frame()).unwrap();
        assert_eq!(json["event"], "group.disabled");
        assert!(json.get("payload").is_none());
    }

    #[test]
    fn test_every_event_name_is_advertised() {
        let sample = [
            GroupEvent::Enabled,
            GroupEvent::Disabled,
            GroupEvent::Closed,
            GroupEvent::Background { color: "#000000".into() },
        ];
        for event in sample {
            assert!(EVENTS.contains(&event.name()));
        }
    }

    #[tokio::test]
    async fn test_send_to_reports_dropped_writer() {
        let (tx, rx) = mpsc::channel(4);
        let frame = GatewayFrame::event("ping", None);
        assert!(send_to(&tx, &frame).await);
        drop(rx);
        assert!(!send_to(&tx, &frame).await);
    }

    fn grid_registry() -> Arc<CoordinatorRegistry> {
        let spec = GroupSpec {
            canvas: Canvas::grid(4, 4, "#FFFFFF").unwrap(),
            kind: GroupKind::Grid,
            rate_limit: RateLimitConfig {
                capacity: 1,
                window_secs: 60,
            },
            contributors: Vec::new(),
        };
        Arc::new(CoordinatorRegistry::with_grid("grid", spec, 4))
    }

    async fn next_frame(rx: &mut mpsc::Receiver<String>) -> serde_json::Value {
        let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("forwarder hung up");
        serde_json::from_str(&msg).unwrap()
    }

    #[tokio::test]
    async fn test_lagging_subscriber_is_resynced() {
        let registry = grid_registry();
        let alice = Participant::new(1, "alice");
        let joined = registry.add_connection("c1", &alice, "grid").await.unwrap();

        // Overrun the broadcast buffer before the forwarder gets to read.
        let latest = {
            let grid = registry.get_group("grid").await.unwrap();
            let mut grid = grid.lock().await;
            let mut seq = 0;
            for i in 0..EVENT_BUFFER + 10 {
                seq = grid.relay_message(&alice, &format!("line {i}"));
            }
            seq
        };

        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        spawn_forwarder(registry.clone(), "grid".into(), joined.events, tx, cancel.clone(), joined.seq);

        let frame = next_frame(&mut rx).await;
        assert_eq!(frame["event"], "group.sync");
        assert_eq!(frame["seq"], latest);

        // Stale buffered envelopes are skipped; the next frame is new.
        let seq = registry
            .get_group("grid")
            .await
            .unwrap()
            .lock()
            .await
            .relay_message(&alice, "after");
        let frame = next_frame(&mut rx).await;
        assert_eq!(frame["event"], "group.message");
        assert_eq!(frame["seq"], seq);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_full_outbound_queue_applies_backpressure() {
        let registry = grid_registry();
        let alice = Participant::new(1, "alice");
        let joined = registry.add_connection("c1", &alice, "grid").await.unwrap();

        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        spawn_forwarder(registry.clone(), "grid".into(), joined.events, tx, cancel.clone(), joined.seq);

        // Nobody drains the queue while far more than the broadcast buffer is
        // published, yielding so the forwarder can fill the queue and block.
        let grid = registry.get_group("grid").await.unwrap();
        for i in 0..EVENT_BUFFER * 2 {
            grid.lock().await.relay_message(&alice, &format!("line {i}"));
            if i % 64 == 0 {
                tokio::task::yield_now().await;
            }
        }

        let mut saw_sync = false;
        while let Ok(Some(msg)) = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await {
            let frame: serde_json::Value = serde_json::from_str(&msg).unwrap();
            if frame["event"] == "group.sync" {
                saw_sync = true;
                break;
            }
        }
        assert!(saw_sync, "a blocked forwarder should resync once it lags");
        cancel.cancel();
    }
}
