//! Per-participant sliding-window paint admission.
//!
//! Each participant owns up to `capacity` timestamp slots. A paint is admitted
//! while a slot is free, or when the earliest-indexed slot older than the
//! window can be reused. Bursts up to `capacity` are allowed, after which the
//! participant cools down until a slot ages out.

use std::collections::HashMap;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::debug;

use pixelwall_core::config::RateLimitConfig;
use pixelwall_core::types::ParticipantId;

/// Slot-based rate limiter. Not internally synchronised; the owning group's
/// lock serialises access.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    capacity: usize,
    window: TimeDelta,
    slots: HashMap<ParticipantId, Vec<DateTime<Utc>>>,
}

impl RateLimiter {
    /// Create a limiter. A capacity of 0 is treated as 1.
    pub fn new(capacity: usize, window: std::time::Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            window: TimeDelta::from_std(window).unwrap_or(TimeDelta::MAX),
            slots: HashMap::new(),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.capacity, config.window())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn window(&self) -> TimeDelta {
        self.window
    }

    /// Oldest instant that still counts as inside the window.
    fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        now.checked_sub_signed(self.window)
    }

    /// Try to consume a slot for `participant` at `now`.
    pub fn admit(&mut self, participant: ParticipantId, now: DateTime<Utc>) -> bool {
        let cutoff = self.cutoff(now);
        let capacity = self.capacity;
        let slots = self.slots.entry(participant).or_default();

        if slots.len() < capacity {
            slots.push(now);
            return true;
        }

        // First expired slot in insertion order gets reused.
        match cutoff.and_then(|c| slots.iter().position(|t| *t <= c)) {
            Some(idx) => {
                slots[idx] = now;
                true
            }
            None => {
                debug!(participant, capacity, "Paint rate limited");
                false
            }
        }
    }

    /// Slots still inside the window, oldest first. A client can derive when
    /// its next slot frees up from the first entry.
    pub fn time_remaining(
        &self,
        participant: ParticipantId,
        now: DateTime<Utc>,
    ) -> Vec<DateTime<Utc>> {
        let Some(slots) = self.slots.get(&participant) else {
            return Vec::new();
        };
        let mut active: Vec<_> = match self.cutoff(now) {
            Some(cutoff) => slots.iter().copied().filter(|t| *t > cutoff).collect(),
            None => slots.clone(),
        };
        active.sort();
        active
    }

    /// Forget every participant's history.
    pub fn reset(&mut self) {
        self.slots.clear();
    }

    /// Number of participants with recorded paints.
    pub fn tracked(&self) -> usize {
        self.slots.len()
    }
}
