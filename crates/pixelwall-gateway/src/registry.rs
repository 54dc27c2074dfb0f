//! Process-wide table of groups and of which connection is in which group.
//!
//! Lock order is group map, then group. The connection table is never held
//! while a group lock is taken.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

use pixelwall_canvas::{Canvas, Point};
use pixelwall_core::config::Config;
use pixelwall_core::types::{ConnectionId, Participant, ParticipantId};

use crate::error::CoordinatorError;
use crate::events::{GroupEnvelope, GroupSync};
use crate::group::{Group, GroupKind, GroupSpec, GroupSummary, PaintOutcome};

const MAX_NAME_LEN: usize = 64;

pub type SharedGroup = Arc<Mutex<Group>>;

/// What a connection tracks about itself.
#[derive(Debug, Clone)]
struct ConnectionRecord {
    participant: Participant,
    groups: BTreeSet<String>,
}

/// Result of adding a connection to a group.
pub struct Joined {
    /// Full group state at the moment of joining.
    pub sync: GroupSync,
    /// Sequence number the sync corresponds to.
    pub seq: u64,
    /// Subscription that starts right after `seq`.
    pub events: broadcast::Receiver<Arc<GroupEnvelope>>,
    /// `false` when the connection was already a member.
    pub newly_joined: bool,
    /// Ad-hoc group the connection was moved out of, if any.
    pub left: Option<String>,
}

pub struct CoordinatorRegistry {
    grid_name: String,
    max_groups: usize,
    groups: RwLock<HashMap<String, SharedGroup>>,
    connections: RwLock<HashMap<ConnectionId, ConnectionRecord>>,
}

fn validate_name(name: &str) -> Result<(), CoordinatorError> {
    if name.trim().is_empty()
        || name.len() > MAX_NAME_LEN
        || name.trim() != name
        || name.chars().any(char::is_control)
    {
        return Err(CoordinatorError::InvalidName(name.to_string()));
    }
    Ok(())
}

impl CoordinatorRegistry {
    /// Registry with no groups. `max_groups` bounds ad-hoc groups; 0 means no limit.
    pub fn new(grid_name: impl Into<String>, max_groups: usize) -> Self {
        Self {
            grid_name: grid_name.into(),
            max_groups,
            groups: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Registry pre-populated with the shared grid.
    pub fn with_grid(grid_name: impl Into<String>, grid: GroupSpec, max_groups: usize) -> Self {
        let grid_name = grid_name.into();
        let mut groups = HashMap::new();
        groups.insert(
            grid_name.clone(),
            Arc::new(Mutex::new(Group::new(grid_name.clone(), grid))),
        );
        Self {
            grid_name,
            max_groups,
            groups: RwLock::new(groups),
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, CoordinatorError> {
        let grid = config.grid();
        let groups = config.groups();
        let canvas = Canvas::grid(grid.width, grid.height, grid.background_color.clone())?;
        Ok(Self::with_grid(
            grid.name,
            GroupSpec {
                canvas,
                kind: GroupKind::Grid,
                rate_limit: grid.rate_limit,
                contributors: Vec::new(),
            },
            groups.max_groups,
        ))
    }

    pub fn grid_name(&self) -> &str {
        &self.grid_name
    }

    /// Install the shared grid if it is missing. Returns `true` if created.
    pub async fn ensure_grid(&self, spec: GroupSpec) -> bool {
        let mut groups = self.groups.write().await;
        if groups.contains_key(&self.grid_name) {
            return false;
        }
        let group = Group::new(self.grid_name.clone(), GroupSpec {
            kind: GroupKind::Grid,
            ..spec
        });
        groups.insert(self.grid_name.clone(), Arc::new(Mutex::new(group)));
        info!(group = %self.grid_name, "Grid created");
        true
    }

    pub async fn create_group(&self, name: &str, spec: GroupSpec) -> Result<(), CoordinatorError> {
        validate_name(name)?;
        let mut groups = self.groups.write().await;
        if groups.contains_key(name) || name == self.grid_name {
            return Err(CoordinatorError::AlreadyExists(name.to_string()));
        }
        let ad_hoc = groups.keys().filter(|n| **n != self.grid_name).count();
        if self.max_groups > 0 && ad_hoc >= self.max_groups {
            return Err(CoordinatorError::TooManyGroups(self.max_groups));
        }
        groups.insert(
            name.to_string(),
            Arc::new(Mutex::new(Group::new(name, spec))),
        );
        info!(group = %name, "Group created");
        Ok(())
    }

    pub async fn get_group(&self, name: &str) -> Result<SharedGroup, CoordinatorError> {
        self.groups
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| CoordinatorError::NotFound(name.to_string()))
    }

    pub async fn group_exists(&self, name: &str) -> bool {
        self.groups.read().await.contains_key(name)
    }

    pub async fn group_count(&self) -> usize {
        self.groups.read().await.len()
    }

    /// Destroy an ad-hoc group. Returns the connections that were members.
    pub async fn remove_group(&self, name: &str) -> Result<Vec<ConnectionId>, CoordinatorError> {
        if name == self.grid_name {
            return Err(CoordinatorError::Protected(name.to_string()));
        }
        let evicted = {
            let mut groups = self.groups.write().await;
            let group = groups
                .remove(name)
                .ok_or_else(|| CoordinatorError::NotFound(name.to_string()))?;
            let mut group = group.lock().await;
            group.close()
        };

        let mut connections = self.connections.write().await;
        for conn_id in &evicted {
            forget_membership(&mut connections, conn_id, name);
        }
        info!(group = %name, evicted = evicted.len(), "Group removed");
        Ok(evicted)
    }

    /// Drop an ad-hoc group once nobody is left in it.
    async fn remove_if_empty(&self, name: &str) {
        let mut groups = self.groups.write().await;
        let Some(group) = groups.get(name).cloned() else {
            return;
        };
        let mut group = group.lock().await;
        if group.kind() == GroupKind::AdHoc && group.is_empty() {
            group.close();
            groups.remove(name);
            info!(group = %name, "Empty group destroyed");
        }
    }

    /// Make `conn_id` a member of `group`, subscribed from the returned sync on.
    ///
    /// A connection is in at most one ad-hoc group besides the grid. Joining
    /// another ad-hoc group leaves the previous one first.
    pub async fn add_connection(
        &self,
        conn_id: &str,
        participant: &Participant,
        group: &str,
    ) -> Result<Joined, CoordinatorError> {
        let shared = self.get_group(group).await?;

        let left = if group == self.grid_name {
            None
        } else {
            self.leave_other_ad_hoc(conn_id, group).await
        };

        {
            let mut connections = self.connections.write().await;
            let record = connections
                .entry(conn_id.to_string())
                .or_insert_with(|| ConnectionRecord {
                    participant: participant.clone(),
                    groups: BTreeSet::new(),
                });
            record.groups.insert(group.to_string());
        }

        let joined = {
            let mut locked = shared.lock().await;
            if locked.is_closed() {
                None
            } else {
                let events = locked.subscribe();
                let seq = locked.seq();
                let sync = locked.sync();
                let newly_joined = locked.join(conn_id, participant.clone());
                Some(Joined {
                    sync,
                    seq,
                    events,
                    newly_joined,
                    left,
                })
            }
        };

        match joined {
            Some(joined) => Ok(joined),
            None => {
                // Lost a race with removal.
                let mut connections = self.connections.write().await;
                forget_membership(&mut connections, conn_id, group);
                Err(CoordinatorError::NotFound(group.to_string()))
            }
        }
    }

    /// Leave whatever ad-hoc group other than `keep` the connection is in.
    async fn leave_other_ad_hoc(&self, conn_id: &str, keep: &str) -> Option<String> {
        let previous = self
            .connections
            .read()
            .await
            .get(conn_id)?
            .groups
            .iter()
            .find(|g| **g != self.grid_name && g.as_str() != keep)
            .cloned()?;
        match self.remove_connection(conn_id, &previous).await {
            Ok(_) => {
                debug!(conn_id, from = %previous, to = %keep, "Moved between ad-hoc groups");
                Some(previous)
            }
            Err(e) => {
                debug!(conn_id, group = %previous, %e, "Previous group already left");
                None
            }
        }
    }

    /// Take `conn_id` out of one group. Returns the participant it belonged to.
    pub async fn remove_connection(
        &self,
        conn_id: &str,
        group: &str,
    ) -> Result<Participant, CoordinatorError> {
        let participant = {
            let mut connections = self.connections.write().await;
            let recorded = connections
                .get(conn_id)
                .map(|r| (r.participant.clone(), r.groups.contains(group)));
            match recorded {
                Some((participant, true)) => {
                    forget_membership(&mut connections, conn_id, group);
                    participant
                }
                _ => {
                    return Err(CoordinatorError::NotConnected {
                        conn_id: conn_id.to_string(),
                        group: group.to_string(),
                    });
                }
            }
        };

        if let Ok(shared) = self.get_group(group).await {
            let empty = {
                let mut locked = shared.lock().await;
                locked.leave(conn_id);
                locked.is_empty() && locked.kind() == GroupKind::AdHoc
            };
            if empty {
                self.remove_if_empty(group).await;
            }
        }
        Ok(participant)
    }

    /// Take `conn_id` out of every group it is in. Never fails; a second call
    /// for the same connection returns nothing.
    pub async fn remove_connection_from_all_groups(
        &self,
        conn_id: &str,
    ) -> Vec<(String, Participant)> {
        let Some(record) = self.connections.write().await.remove(conn_id) else {
            return Vec::new();
        };

        let mut removed = Vec::with_capacity(record.groups.len());
        for name in record.groups {
            let shared = match self.get_group(&name).await {
                Ok(shared) => shared,
                Err(e) => {
                    debug!(conn_id, group = %name, %e, "Group already gone");
                    continue;
                }
            };
            let (left, empty) = {
                let mut locked = shared.lock().await;
                let left = locked.leave(conn_id);
                (left, locked.is_empty() && locked.kind() == GroupKind::AdHoc)
            };
            match left {
                Some(participant) => removed.push((name.clone(), participant)),
                None => warn!(conn_id, group = %name, "Connection recorded but not a member"),
            }
            if empty {
                self.remove_if_empty(&name).await;
            }
        }
        removed
    }

    /// Is `conn_id` currently in at least one group?
    pub async fn has_connection(&self, conn_id: &str) -> bool {
        self.connections.read().await.contains_key(conn_id)
    }

    pub async fn connection_groups(&self, conn_id: &str) -> Vec<String> {
        self.connections
            .read()
            .await
            .get(conn_id)
            .map(|r| r.groups.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The group `conn_id` is a member of, with the participant it joined as.
    pub async fn member_group(
        &self,
        conn_id: &str,
        group: &str,
    ) -> Result<(Participant, SharedGroup), CoordinatorError> {
        let participant = self
            .connections
            .read()
            .await
            .get(conn_id)
            .filter(|r| r.groups.contains(group))
            .map(|r| r.participant.clone())
            .ok_or_else(|| CoordinatorError::NotConnected {
                conn_id: conn_id.to_string(),
                group: group.to_string(),
            })?;
        Ok((participant, self.get_group(group).await?))
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn paint(
        &self,
        conn_id: &str,
        group: &str,
        layer: usize,
        x: i64,
        y: i64,
        color: &str,
        now: DateTime<Utc>,
    ) -> Result<PaintOutcome, CoordinatorError> {
        let (participant, shared) = self.member_group(conn_id, group).await?;
        let mut locked = shared.lock().await;
        if !locked.is_member(conn_id) {
            return Err(CoordinatorError::NotConnected {
                conn_id: conn_id.to_string(),
                group: group.to_string(),
            });
        }
        locked.paint(&participant, layer, x, y, color, now)
    }

    pub async fn paint_stroke(
        &self,
        conn_id: &str,
        group: &str,
        layer: usize,
        color: &str,
        points: &[Point],
        now: DateTime<Utc>,
    ) -> Result<PaintOutcome, CoordinatorError> {
        let (participant, shared) = self.member_group(conn_id, group).await?;
        let mut locked = shared.lock().await;
        if !locked.is_member(conn_id) {
            return Err(CoordinatorError::NotConnected {
                conn_id: conn_id.to_string(),
                group: group.to_string(),
            });
        }
        locked.paint_stroke(&participant, layer, color, points, now)
    }

    /// Current sync stamped with the group's sequence number.
    pub async fn snapshot(&self, group: &str) -> Result<GroupEnvelope, CoordinatorError> {
        let shared = self.get_group(group).await?;
        let locked = shared.lock().await;
        Ok(locked.sync_envelope())
    }

    /// Summaries of every group, sorted by name.
    pub async fn list_group_summaries(&self) -> Vec<GroupSummary> {
        let groups: Vec<SharedGroup> = self.groups.read().await.values().cloned().collect();
        let mut summaries = Vec::with_capacity(groups.len());
        for group in groups {
            let locked = group.lock().await;
            if !locked.is_closed() {
                summaries.push(locked.summary());
            }
        }
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    pub async fn members(&self, group: &str) -> Result<Vec<Participant>, CoordinatorError> {
        let shared = self.get_group(group).await?;
        let locked = shared.lock().await;
        Ok(locked.members())
    }

    pub async fn contributors(&self, group: &str) -> Result<Vec<Participant>, CoordinatorError> {
        let shared = self.get_group(group).await?;
        let locked = shared.lock().await;
        Ok(locked.contributors().to_vec())
    }

    pub async fn time_remaining(
        &self,
        group: &str,
        participant: ParticipantId,
        now: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, CoordinatorError> {
        let shared = self.get_group(group).await?;
        let locked = shared.lock().await;
        Ok(locked.time_remaining(participant, now))
    }
}

fn forget_membership(
    connections: &mut HashMap<ConnectionId, ConnectionRecord>,
    conn_id: &str,
    group: &str,
) {
    if let Some(record) = connections.get_mut(conn_id) {
        record.groups.remove(group);
        if record.groups.is_empty() {
            connections.remove(conn_id);
        }
    }
}
