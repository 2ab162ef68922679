// SPDX-License-Identifier: MPL-2.0

//! Connected monitors and the change events derived from output notifications.
//!
//! [`Topology`] is fed by the Wayland output handler with one observation per
//! output object. It normalizes those observations into [`TopologyEvent`]s:
//! an `Added` is only produced for a monitor that is not already known, and a
//! connector name reused by a new output object is always reported as
//! `Removed` before the new `Added`.

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};

/// Stable monitor identity, the connector name (`HDMI-A-1`, `eDP-1`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MonitorId(String);

impl MonitorId {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MonitorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MonitorId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Logical position and size of a monitor in the global compositor space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Geometry {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Monitor {
    pub id: MonitorId,
    pub geometry: Geometry,
    pub scale: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TopologyEvent {
    Added(Monitor),
    Removed(MonitorId),
    Resized(Monitor),
}

#[derive(Debug)]
struct Entry<K> {
    key: K,
    monitor: Monitor,
}

/// The last known set of attached monitors, keyed by the output object `K`
/// that announced them.
#[derive(Debug)]
pub struct Topology<K> {
    entries: Vec<Entry<K>>,
}

impl<K: PartialEq + Clone + fmt::Debug> Topology<K> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Attached monitors in discovery order.
    pub fn current_monitors(&self) -> impl Iterator<Item = &Monitor> {
        self.entries.iter().map(|entry| &entry.monitor)
    }

    /// The output object currently announcing `id`.
    #[must_use]
    pub fn key_of(&self, id: &MonitorId) -> Option<&K> {
        self.entries
            .iter()
            .find(|entry| &entry.monitor.id == id)
            .map(|entry| &entry.key)
    }

    /// Every attached monitor with the output object that announced it.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &Monitor)> {
        self.entries.iter().map(|entry| (&entry.key, &entry.monitor))
    }

    /// Record the complete description of an output object.
    pub fn observe(&mut self, key: K, monitor: Monitor) -> Vec<TopologyEvent> {
        let mut events = Vec::new();

        // The output object was renamed: the old identity is gone.
        if let Some(pos) = self
            .entries
            .iter()
            .position(|entry| entry.key == key && entry.monitor.id != monitor.id)
        {
            let old = self.entries.remove(pos);
            events.push(TopologyEvent::Removed(old.monitor.id));
        }

        match self
            .entries
            .iter()
            .position(|entry| entry.monitor.id == monitor.id)
        {
            Some(pos) if self.entries[pos].key == key => {
                let entry = &mut self.entries[pos];
                if entry.monitor != monitor {
                    entry.monitor = monitor.clone();
                    events.push(TopologyEvent::Resized(monitor));
                }
            }
            Some(pos) => {
                // Same connector announced by a new output object before the
                // old one was destroyed.
                let old = self.entries.remove(pos);
                events.push(TopologyEvent::Removed(old.monitor.id));
                self.entries.push(Entry {
                    key,
                    monitor: monitor.clone(),
                });
                events.push(TopologyEvent::Added(monitor));
            }
            None => {
                self.entries.push(Entry {
                    key,
                    monitor: monitor.clone(),
                });
                events.push(TopologyEvent::Added(monitor));
            }
        }

        events
    }

    /// Forget the monitor announced by `key`.
    ///
    /// A destroy for an output object that no longer owns its connector name
    /// produces nothing.
    pub fn remove(&mut self, key: &K) -> Option<TopologyEvent> {
        let pos = self.entries.iter().position(|entry| &entry.key == key)?;
        let entry = self.entries.remove(pos);
        Some(TopologyEvent::Removed(entry.monitor.id))
    }
}

impl<K: PartialEq + Clone + fmt::Debug> Default for Topology<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Exponential retry schedule for output queries that came back incomplete.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl Backoff {
    #[must_use]
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max,
            max_attempts,
            attempt: 0,
        }
    }

    /// Delay before the next attempt, or `None` once the attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let delay = self
            .base
            .saturating_mul(1 << self.attempt.min(16))
            .min(self.max);
        self.attempt += 1;
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_millis(3200), 6)
    }
}
