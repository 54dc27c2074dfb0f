//! A group: one shared canvas, its rate limiter, its members, and its ordered
//! event stream.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

use pixelwall_canvas::{Canvas, CanvasError, Point};
use pixelwall_core::artwork::ArtworkRequest;
use pixelwall_core::config::RateLimitConfig;
use pixelwall_core::types::{ConnectionId, Participant, ParticipantId};

use crate::error::CoordinatorError;
use crate::events::{GroupEnvelope, GroupEvent, GroupSync};
use crate::rate_limit::RateLimiter;

/// Buffered events per group before slow subscribers start lagging.
pub(crate) const EVENT_BUFFER: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKind {
    /// The well-known shared grid. Reset, never destroyed.
    Grid,
    /// Created on demand, destroyed when its last member leaves.
    AdHoc,
}

/// Everything needed to create a group.
#[derive(Debug, Clone)]
pub struct GroupSpec {
    pub canvas: Canvas,
    pub kind: GroupKind,
    pub rate_limit: RateLimitConfig,
    /// Contributors carried over from an uploaded drawing.
    pub contributors: Vec<Participant>,
}

/// Result of a paint attempt that passed the structural checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaintOutcome {
    /// The canvas changed and the change was published.
    Applied { window: Vec<DateTime<Utc>> },
    /// Nothing would change; no rate-limit slot was consumed.
    Unchanged,
    /// Every slot is still inside the window.
    RateLimited { window: Vec<DateTime<Utc>> },
}

impl PaintOutcome {
    pub fn applied(&self) -> bool {
        matches!(self, PaintOutcome::Applied { .. })
    }

    pub fn window(&self) -> &[DateTime<Utc>] {
        match self {
            PaintOutcome::Applied { window } | PaintOutcome::RateLimited { window } => window,
            PaintOutcome::Unchanged => &[],
        }
    }

    /// Wire reason for a paint that did not apply.
    pub fn reason(&self) -> Option<&'static str> {
        match self {
            PaintOutcome::Applied { .. } => None,
            PaintOutcome::Unchanged => Some("unchanged"),
            PaintOutcome::RateLimited { .. } => Some("rate_limited"),
        }
    }
}

/// Discovery advertisement. Never contains pixels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSummary {
    pub name: String,
    pub kind: GroupKind,
    pub width: u32,
    pub height: u32,
    pub layers: usize,
    pub member_count: usize,
    pub enabled: bool,
}

pub struct Group {
    name: String,
    kind: GroupKind,
    canvas: Canvas,
    limiter: RateLimiter,
    members: BTreeMap<ConnectionId, Participant>,
    contributors: Vec<Participant>,
    enabled: bool,
    closed: bool,
    seq: u64,
    /// Bumped on every canvas mutation.
    revision: u64,
    events: broadcast::Sender<Arc<GroupEnvelope>>,
}

impl Group {
    pub fn new(name: impl Into<String>, spec: GroupSpec) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let mut contributors: Vec<Participant> = Vec::with_capacity(spec.contributors.len());
        for participant in spec.contributors {
            if !contributors.iter().any(|c| c.id == participant.id) {
                contributors.push(participant);
            }
        }
        Self {
            name: name.into(),
            kind: spec.kind,
            canvas: spec.canvas,
            limiter: RateLimiter::from_config(&spec.rate_limit),
            members: BTreeMap::new(),
            contributors,
            enabled: true,
            closed: false,
            seq: 0,
            revision: 0,
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> GroupKind {
        self.kind
    }

    pub fn canvas(&self) -> &Canvas {
        &self.canvas
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Sequence number of the most recently published event.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Changes whenever the canvas does. Lets callers detect edits made while
    /// they were not holding the lock.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_member(&self, conn_id: &str) -> bool {
        self.members.contains_key(conn_id)
    }

    /// Participants of the current member connections, one entry per
    /// participant even when they are connected more than once.
    pub fn members(&self) -> Vec<Participant> {
        let mut seen = HashSet::new();
        self.members
            .values()
            .filter(|p| seen.insert(p.id))
            .cloned()
            .collect()
    }

    /// Everyone who has ever joined, in first-join order.
    pub fn contributors(&self) -> &[Participant] {
        &self.contributors
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<GroupEnvelope>> {
        self.events.subscribe()
    }

    fn publish(&mut self, event: GroupEvent) -> u64 {
        self.seq += 1;
        let envelope = GroupEnvelope {
            group: self.name.clone(),
            seq: self.seq,
            event,
        };
        // No receivers is fine; nobody is listening yet.
        let _ = self.events.send(Arc::new(envelope));
        self.seq
    }

    /// Add a connection. Returns `false` if it was already a member.
    pub fn join(&mut self, conn_id: &str, participant: Participant) -> bool {
        if self.members.contains_key(conn_id) {
            return false;
        }
        if !self.contributors.iter().any(|c| c.id == participant.id) {
            self.contributors.push(participant.clone());
        }
        self.members.insert(conn_id.to_string(), participant.clone());
        info!(group = %self.name, conn_id, participant = participant.id, "Member joined");
        let members = self.members.len();
        self.publish(GroupEvent::MemberJoined {
            participant,
            members,
        });
        true
    }

    /// Remove a connection. The contributor record keeps the participant.
    pub fn leave(&mut self, conn_id: &str) -> Option<Participant> {
        let participant = self.members.remove(conn_id)?;
        info!(group = %self.name, conn_id, participant = participant.id, "Member left");
        let members = self.members.len();
        self.publish(GroupEvent::MemberLeft {
            participant: participant.clone(),
            members,
        });
        Some(participant)
    }

    fn ensure_enabled(&self) -> Result<(), CoordinatorError> {
        if self.enabled {
            Ok(())
        } else {
            Err(CoordinatorError::Disabled(self.name.clone()))
        }
    }

    /// Paint one cell on behalf of `participant`.
    pub fn paint(
        &mut self,
        participant: &Participant,
        layer: usize,
        x: i64,
        y: i64,
        color: &str,
        now: DateTime<Utc>,
    ) -> Result<PaintOutcome, CoordinatorError> {
        self.ensure_enabled()?;
        if !self.canvas.would_change(layer, x, y, color)? {
            return Ok(PaintOutcome::Unchanged);
        }
        if !self.limiter.admit(participant.id, now) {
            return Ok(PaintOutcome::RateLimited {
                window: self.limiter.time_remaining(participant.id, now),
            });
        }

        self.canvas.set(layer, x, y, color)?;
        self.revision += 1;
        self.publish(GroupEvent::Pixels {
            layer,
            color: color.to_string(),
            points: vec![Point::new(x, y)],
            participant_id: participant.id,
        });
        Ok(PaintOutcome::Applied {
            window: self.limiter.time_remaining(participant.id, now),
        })
    }

    /// Paint a stroke of cells in one color as a single rate-limited action.
    ///
    /// Points outside the canvas and duplicates are dropped. The stroke is
    /// published as one event containing only the cells that changed.
    pub fn paint_stroke(
        &mut self,
        participant: &Participant,
        layer: usize,
        color: &str,
        points: &[Point],
        now: DateTime<Utc>,
    ) -> Result<PaintOutcome, CoordinatorError> {
        self.ensure_enabled()?;
        let layers = self.canvas.layer_count();
        if layer >= layers {
            return Err(CanvasError::LayerOutOfBounds { layer, layers }.into());
        }

        let mut seen = HashSet::with_capacity(points.len());
        let mut changed = Vec::new();
        for point in points {
            if !seen.insert(*point) {
                continue;
            }
            match self.canvas.would_change(layer, point.x, point.y, color) {
                Ok(true) => changed.push(*point),
                Ok(false) | Err(CanvasError::OutOfBounds { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        if changed.is_empty() {
            return Ok(PaintOutcome::Unchanged);
        }
        if !self.limiter.admit(participant.id, now) {
            return Ok(PaintOutcome::RateLimited {
                window: self.limiter.time_remaining(participant.id, now),
            });
        }

        for point in &changed {
            self.canvas.set(layer, point.x, point.y, color)?;
        }
        self.revision += 1;
        debug!(group = %self.name, cells = changed.len(), "Stroke applied");
        self.publish(GroupEvent::Pixels {
            layer,
            color: color.to_string(),
            points: changed,
            participant_id: participant.id,
        });
        Ok(PaintOutcome::Applied {
            window: self.limiter.time_remaining(participant.id, now),
        })
    }

    pub fn time_remaining(&self, participant: ParticipantId, now: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        self.limiter.time_remaining(participant, now)
    }

    /// Empty the canvas, forget all rate-limit history, and resync members.
    pub fn clear(&mut self) {
        self.canvas.clear();
        self.limiter.reset();
        self.revision += 1;
        info!(group = %self.name, "Group cleared");
        let sync = self.sync();
        self.publish(GroupEvent::Sync(sync));
    }

    /// Returns `false` if the group was already enabled.
    pub fn enable(&mut self) -> bool {
        if self.enabled {
            return false;
        }
        self.enabled = true;
        self.publish(GroupEvent::Enabled);
        true
    }

    /// Returns `false` if the group was already disabled.
    pub fn disable(&mut self) -> bool {
        if !self.enabled {
            return false;
        }
        self.enabled = false;
        self.publish(GroupEvent::Disabled);
        true
    }

    pub fn set_background(&mut self, color: &str) -> Result<(), CoordinatorError> {
        self.canvas.set_background(color)?;
        self.revision += 1;
        self.publish(GroupEvent::Background {
            color: color.to_string(),
        });
        Ok(())
    }

    /// Relay a chat line to every member.
    pub fn relay_message(&mut self, from: &Participant, text: &str) -> u64 {
        self.publish(GroupEvent::Message {
            from: from.clone(),
            text: text.to_string(),
        })
    }

    pub fn sync(&self) -> GroupSync {
        GroupSync {
            name: self.name.clone(),
            kind: self.kind,
            canvas: self.canvas.kind(),
            width: self.canvas.width(),
            height: self.canvas.height(),
            layers: self.canvas.layer_count(),
            background_color: self.canvas.background_color().to_string(),
            enabled: self.enabled,
            cells: self.canvas.snapshot(),
        }
    }

    /// Full state stamped with the current sequence number.
    pub fn sync_envelope(&self) -> GroupEnvelope {
        GroupEnvelope {
            group: self.name.clone(),
            seq: self.seq,
            event: GroupEvent::Sync(self.sync()),
        }
    }

    pub fn summary(&self) -> GroupSummary {
        GroupSummary {
            name: self.name.clone(),
            kind: self.kind,
            width: self.canvas.width(),
            height: self.canvas.height(),
            layers: self.canvas.layer_count(),
            member_count: self.members.len(),
            enabled: self.enabled,
        }
    }

    /// Build the persistence request for the current canvas. The exporter is
    /// recorded as the sole creator.
    pub fn export_as_artwork(
        &self,
        title: &str,
        exporter: &Participant,
        is_public: bool,
        now: DateTime<Utc>,
    ) -> Result<ArtworkRequest, CoordinatorError> {
        Ok(ArtworkRequest {
            title: title.to_string(),
            width: self.canvas.width(),
            height: self.canvas.height(),
            background_color: self.canvas.background_color().to_string(),
            encoded_grid: self.canvas.encode_compact()?,
            creators: vec![exporter.clone()],
            is_public,
            created_at: now,
        })
    }

    /// Mark the group closed and tell subscribers. Returns the connections
    /// that were still members.
    pub fn close(&mut self) -> Vec<ConnectionId> {
        if self.closed {
            return Vec::new();
        }
        self.closed = true;
        self.publish(GroupEvent::Closed);
        std::mem::take(&mut self.members).into_keys().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};
    use pixelwall_canvas::PixelEntry;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn grid_group(size: u32, capacity: usize, window_secs: u64) -> Group {
        Group::new(
            "grid",
            GroupSpec {
                canvas: Canvas::grid(size, size, "#FFFFFF").unwrap(),
                kind: GroupKind::Grid,
                rate_limit: RateLimitConfig {
                    capacity,
                    window_secs,
                },
                contributors: Vec::new(),
            },
        )
    }

    #[test]
    fn test_four_by_four_scenario() {
        let mut group = grid_group(4, 2, 300);
        let a = Participant::new(1, "a");
        let b = Participant::new(2, "b");
        group.join("c1", a.clone());
        group.join("c2", b.clone());
        let mut rx = group.subscribe();

        let first = group.paint(&a, 0, 0, 0, "#FF0000", t0()).unwrap();
        assert!(first.applied());
        let second = group
            .paint(&a, 0, 1, 0, "#FF0000", t0() + TimeDelta::seconds(1))
            .unwrap();
        assert!(second.applied());

        let third = group
            .paint(&a, 0, 2, 0, "#FF0000", t0() + TimeDelta::seconds(2))
            .unwrap();
        assert_eq!(third.reason(), Some("rate_limited"));
        assert_eq!(third.window().len(), 2);
        assert_eq!(group.canvas().get(0, 2, 0).unwrap(), None);

        // Another participant is unaffected.
        let other = group
            .paint(&b, 0, 2, 0, "#00FF00", t0() + TimeDelta::seconds(3))
            .unwrap();
        assert!(other.applied());

        // Once the first slot ages out, a can paint again.
        let later = group
            .paint(&a, 0, 3, 3, "#0000FF", t0() + TimeDelta::minutes(5))
            .unwrap();
        assert!(later.applied());

        let mut painted = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            if let GroupEvent::Pixels { points, .. } = &envelope.event {
                painted.push((envelope.seq, points[0]));
            }
        }
        let points: Vec<_> = painted.iter().map(|(_, p)| *p).collect();
        assert_eq!(
            points,
            vec![
                Point::new(0, 0),
                Point::new(1, 0),
                Point::new(2, 0),
                Point::new(3, 3)
            ]
        );
        assert!(painted.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn test_third_paint_in_window_leaves_snapshot_unchanged() {
        let mut group = grid_group(4, 2, 300);
        let p1 = Participant::new(1, "p1");
        group.join("c1", p1.clone());

        assert!(group.paint(&p1, 0, 0, 0, "red", t0()).unwrap().applied());
        assert!(group.paint(&p1, 0, 1, 1, "blue", t0()).unwrap().applied());
        let expected = vec![
            PixelEntry { layer: 0, x: 0, y: 0, color: "red".into() },
            PixelEntry { layer: 0, x: 1, y: 1, color: "blue".into() },
        ];
        assert_eq!(group.canvas().snapshot(), expected);

        let third = group.paint(&p1, 0, 2, 2, "green", t0()).unwrap();
        assert!(matches!(third, PaintOutcome::RateLimited { .. }));
        assert_eq!(group.canvas().snapshot(), expected);
    }

    #[test]
    fn test_same_color_repaint_consumes_no_slot() {
        let mut group = grid_group(4, 1, 300);
        let a = Participant::new(1, "a");
        assert!(group.paint(&a, 0, 1, 1, "#FF0000", t0()).unwrap().applied());
        let seq = group.seq();
        let again = group.paint(&a, 0, 1, 1, "#FF0000", t0()).unwrap();
        assert_eq!(again, PaintOutcome::Unchanged);
        assert_eq!(group.seq(), seq);
        assert_eq!(group.time_remaining(1, t0()).len(), 1);
    }

    #[test]
    fn test_out_of_bounds_paint_is_rejected() {
        let mut group = grid_group(4, 5, 300);
        let a = Participant::new(1, "a");
        let err = group.paint(&a, 0, 4, 0, "#FF0000", t0()).unwrap_err();
        assert_eq!(err.code(), "out_of_bounds");
        assert!(group.canvas().snapshot().is_empty());
        assert!(group.time_remaining(1, t0()).is_empty());
    }

    #[test]
    fn test_join_leave_round_trip_keeps_contributor() {
        let mut group = grid_group(4, 5, 300);
        let a = Participant::new(1, "a");
        assert!(group.join("c1", a.clone()));
        assert!(!group.join("c1", a.clone()));
        assert_eq!(group.member_count(), 1);

        assert_eq!(group.leave("c1"), Some(a.clone()));
        assert_eq!(group.leave("c1"), None);
        assert!(group.is_empty());
        assert_eq!(group.contributors(), &[a]);
    }

    #[test]
    fn test_members_deduplicates_participants() {
        let mut group = grid_group(4, 5, 300);
        let a = Participant::new(1, "a");
        group.join("c1", a.clone());
        group.join("c2", a.clone());
        assert_eq!(group.member_count(), 2);
        assert_eq!(group.members(), vec![a]);
    }

    #[test]
    fn test_disable_blocks_all_paints() {
        let mut group = grid_group(4, 5, 300);
        let a = Participant::new(1, "a");
        group.paint(&a, 0, 0, 0, "#FF0000", t0()).unwrap();
        assert!(group.disable());
        assert!(!group.disable());

        let err = group.paint(&a, 0, 1, 1, "#00FF00", t0()).unwrap_err();
        assert_eq!(err, CoordinatorError::Disabled("grid".into()));
        let err = group
            .paint_stroke(&a, 0, "#00FF00", &[Point::new(2, 2)], t0())
            .unwrap_err();
        assert_eq!(err.code(), "disabled");

        // Disabling keeps the canvas.
        assert_eq!(group.canvas().get(0, 0, 0).unwrap(), Some("#FF0000"));
        assert!(group.enable());
        assert!(group.paint(&a, 0, 1, 1, "#00FF00", t0()).unwrap().applied());
    }

    #[test]
    fn test_stroke_skips_out_of_bounds_and_duplicates() {
        let mut group = grid_group(4, 1, 300);
        let a = Participant::new(1, "a");
        let mut rx = group.subscribe();
        let points = [
            Point::new(0, 0),
            Point::new(0, 0),
            Point::new(-1, 2),
            Point::new(3, 3),
            Point::new(9, 9),
        ];
        let outcome = group.paint_stroke(&a, 0, "#123456", &points, t0()).unwrap();
        assert!(outcome.applied());
        assert_eq!(outcome.window().len(), 1);

        let envelope = rx.try_recv().unwrap();
        match &envelope.event {
            GroupEvent::Pixels { points, .. } => {
                assert_eq!(points, &vec![Point::new(0, 0), Point::new(3, 3)]);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        // Second stroke is limited; a stroke with nothing to change is not.
        let limited = group
            .paint_stroke(&a, 0, "#000000", &[Point::new(1, 1)], t0())
            .unwrap();
        assert_eq!(limited.reason(), Some("rate_limited"));
        let unchanged = group
            .paint_stroke(&a, 0, "#123456", &[Point::new(0, 0), Point::new(7, 7)], t0())
            .unwrap();
        assert_eq!(unchanged, PaintOutcome::Unchanged);
    }

    #[test]
    fn test_stroke_rejects_bad_layer() {
        let mut group = grid_group(4, 1, 300);
        let a = Participant::new(1, "a");
        let err = group
            .paint_stroke(&a, 2, "#000000", &[Point::new(0, 0)], t0())
            .unwrap_err();
        assert_eq!(err.code(), "out_of_bounds");
    }

    #[test]
    fn test_clear_resets_canvas_and_limits() {
        let mut group = grid_group(4, 1, 300);
        let a = Participant::new(1, "a");
        group.paint(&a, 0, 0, 0, "#FF0000", t0()).unwrap();
        let mut rx = group.subscribe();
        group.clear();
        assert!(group.canvas().snapshot().is_empty());
        assert!(group.paint(&a, 0, 0, 0, "#FF0000", t0()).unwrap().applied());

        let envelope = rx.try_recv().unwrap();
        assert!(matches!(&envelope.event, GroupEvent::Sync(sync) if sync.cells.is_empty()));
    }

    #[test]
    fn test_export_records_exporter_as_creator() {
        let mut group = grid_group(2, 5, 300);
        let a = Participant::new(1, "a");
        let admin = Participant::admin(9, "root");
        group.join("c1", a.clone());
        group.paint(&a, 0, 1, 0, "#ff0000", t0()).unwrap();

        let request = group.export_as_artwork("Sunset", &admin, true, t0()).unwrap();
        assert_eq!(request.title, "Sunset");
        assert_eq!(request.creators, vec![admin]);
        assert_eq!(request.encoded_grid, "FFFFFFFF0000FFFFFFFFFFFF");
        assert_eq!(request.created_at, t0());
    }

    #[test]
    fn test_revision_tracks_canvas_changes_only() {
        let mut group = grid_group(4, 5, 300);
        let a = Participant::new(1, "a");
        group.join("c1", a.clone());
        let start = group.revision();

        group.relay_message(&a, "hi");
        group.disable();
        group.enable();
        assert_eq!(group.revision(), start);

        group.paint(&a, 0, 0, 0, "#FF0000", t0()).unwrap();
        assert_eq!(group.revision(), start + 1);
        group.paint(&a, 0, 0, 0, "#FF0000", t0()).unwrap();
        assert_eq!(group.revision(), start + 1);
        group.clear();
        assert_eq!(group.revision(), start + 2);
    }

    #[test]
    fn test_close_returns_members_once() {
        let mut group = grid_group(4, 5, 300);
        group.join("c1", Participant::new(1, "a"));
        let mut rx = group.subscribe();
        assert_eq!(group.close(), vec!["c1".to_string()]);
        assert!(group.close().is_empty());
        assert!(group.is_closed());
        assert_eq!(rx.try_recv().unwrap().event, GroupEvent::Closed);
    }

    #[test]
    fn test_summary_has_no_pixels() {
        let group = grid_group(4, 5, 300);
        let json = serde_json::to_value(group.summary()).unwrap();
        assert_eq!(json["kind"], "grid");
        assert_eq!(json["member_count"], 0);
        assert!(json.get("cells").is_none());
    }
}
