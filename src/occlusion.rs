// SPDX-License-Identifier: MPL-2.0

//! Maximized/fullscreen window detection per monitor.
//!
//! Toplevel state comes from `zwlr_foreign_toplevel_manager_v1`. A window
//! occludes every output it has entered while it is maximized or fullscreen
//! and not minimized. Raw per-monitor results pass through a [`Debouncer`]
//! so that window animations do not toggle playback.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use sctk::reexports::client::{
    Connection, Dispatch, QueueHandle, event_created_child,
    globals::GlobalList,
    protocol::wl_output::WlOutput,
};
use wayland_protocols_wlr::foreign_toplevel::v1::client::{
    zwlr_foreign_toplevel_handle_v1::{self, ZwlrForeignToplevelHandleV1},
    zwlr_foreign_toplevel_manager_v1::{self, ZwlrForeignToplevelManagerV1},
};

use crate::{engine::LiveBg, topology::MonitorId};

// zwlr_foreign_toplevel_handle_v1.state values
const STATE_MAXIMIZED: u32 = 0;
const STATE_MINIMIZED: u32 = 1;
const STATE_FULLSCREEN: u32 = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct WindowState<O> {
    pub outputs: Vec<O>,
    pub maximized: bool,
    pub minimized: bool,
    pub fullscreen: bool,
}

impl<O> Default for WindowState<O> {
    fn default() -> Self {
        Self {
            outputs: Vec::new(),
            maximized: false,
            minimized: false,
            fullscreen: false,
        }
    }
}

impl<O> WindowState<O> {
    #[must_use]
    pub fn covers_outputs(&self) -> bool {
        (self.maximized || self.fullscreen) && !self.minimized
    }
}

/// Decode the `state` array of a toplevel handle into (maximized, minimized, fullscreen).
#[must_use]
pub fn parse_state(raw: &[u8]) -> (bool, bool, bool) {
    let mut flags = (false, false, false);
    for chunk in raw.chunks_exact(4) {
        let value = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        match value {
            STATE_MAXIMIZED => flags.0 = true,
            STATE_MINIMIZED => flags.1 = true,
            STATE_FULLSCREEN => flags.2 = true,
            _ => {}
        }
    }
    flags
}

#[derive(Debug)]
struct Toplevel<O> {
    current: WindowState<O>,
    pending: WindowState<O>,
}

/// Double-buffered window state, applied on each handle's `done`.
#[derive(Debug)]
pub struct ToplevelTracker<T, O> {
    toplevels: Vec<(T, Toplevel<O>)>,
}

impl<T: PartialEq + Clone, O: PartialEq + Clone> ToplevelTracker<T, O> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            toplevels: Vec::new(),
        }
    }

    fn entry(&mut self, handle: &T) -> &mut Toplevel<O> {
        let pos = match self.toplevels.iter().position(|(h, _)| h == handle) {
            Some(pos) => pos,
            None => {
                self.toplevels.push((
                    handle.clone(),
                    Toplevel {
                        current: WindowState::default(),
                        pending: WindowState::default(),
                    },
                ));
                self.toplevels.len() - 1
            }
        };
        &mut self.toplevels[pos].1
    }

    pub fn output_enter(&mut self, handle: &T, output: O) {
        let pending = &mut self.entry(handle).pending;
        if !pending.outputs.contains(&output) {
            pending.outputs.push(output);
        }
    }

    pub fn output_leave(&mut self, handle: &T, output: &O) {
        self.entry(handle).pending.outputs.retain(|o| o != output);
    }

    pub fn set_state(&mut self, handle: &T, maximized: bool, minimized: bool, fullscreen: bool) {
        let pending = &mut self.entry(handle).pending;
        pending.maximized = maximized;
        pending.minimized = minimized;
        pending.fullscreen = fullscreen;
    }

    /// Apply the pending state of `handle`. Returns whether anything changed.
    pub fn commit(&mut self, handle: &T) -> bool {
        let toplevel = self.entry(handle);
        if toplevel.current == toplevel.pending {
            return false;
        }
        toplevel.current = toplevel.pending.clone();
        true
    }

    pub fn close(&mut self, handle: &T) {
        self.toplevels.retain(|(h, _)| h != handle);
    }

    /// Drop references to an output that went away.
    pub fn forget_output(&mut self, output: &O) {
        for (_, toplevel) in &mut self.toplevels {
            toplevel.current.outputs.retain(|o| o != output);
            toplevel.pending.outputs.retain(|o| o != output);
        }
    }

    #[must_use]
    pub fn is_occluded(&self, output: &O) -> bool {
        self.toplevels.iter().any(|(_, toplevel)| {
            toplevel.current.covers_outputs() && toplevel.current.outputs.contains(output)
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.toplevels.len()
    }
}

impl<T: PartialEq + Clone, O: PartialEq + Clone> Default for ToplevelTracker<T, O> {
    fn default() -> Self {
        Self::new()
    }
}

/// Forwards a per-monitor boolean only after it held for `threshold`.
#[derive(Debug)]
pub struct Debouncer {
    threshold: Duration,
    reported: HashMap<MonitorId, bool>,
    pending: HashMap<MonitorId, (bool, Instant)>,
}

impl Debouncer {
    #[must_use]
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            reported: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    pub fn set_threshold(&mut self, threshold: Duration) {
        self.threshold = threshold;
    }

    /// Record the raw value seen at `now`.
    pub fn observe(&mut self, id: &MonitorId, occluded: bool, now: Instant) {
        let reported = self.reported.get(id).copied().unwrap_or(false);
        if occluded == reported {
            // Flicker back to the reported value cancels the pending change.
            self.pending.remove(id);
            return;
        }

        match self.pending.get(id) {
            Some((value, _)) if *value == occluded => {}
            _ => {
                self.pending.insert(id.clone(), (occluded, now));
            }
        }
    }

    /// Changes that stayed stable until `now`.
    pub fn flush(&mut self, now: Instant) -> Vec<(MonitorId, bool)> {
        let threshold = self.threshold;
        let ready: Vec<MonitorId> = self
            .pending
            .iter()
            .filter(|(_, (_, since))| now.saturating_duration_since(*since) >= threshold)
            .map(|(id, _)| id.clone())
            .collect();

        let mut changes = Vec::with_capacity(ready.len());
        for id in ready {
            if let Some((value, _)) = self.pending.remove(&id) {
                self.reported.insert(id.clone(), value);
                changes.push((id, value));
            }
        }
        changes.sort();
        changes
    }

    /// When the earliest pending change becomes stable.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .values()
            .map(|(_, since)| *since + self.threshold)
            .min()
    }

    /// Take `occluded` as the reported value of `id` without waiting, e.g.
    /// for a monitor that was just attached.
    pub fn seed(&mut self, id: &MonitorId, occluded: bool) {
        self.pending.remove(id);
        self.reported.insert(id.clone(), occluded);
    }

    /// Forget a monitor entirely, e.g. when it is detached.
    pub fn forget(&mut self, id: &MonitorId) {
        self.reported.remove(id);
        self.pending.remove(id);
    }
}

/// Occlusion source backed by the wlr foreign toplevel protocol.
#[derive(Debug)]
pub struct WindowStateMonitor {
    _manager: ZwlrForeignToplevelManagerV1,
    pub tracker: ToplevelTracker<ZwlrForeignToplevelHandleV1, WlOutput>,
    pub debouncer: Debouncer,
    /// A flush timer is registered in the event loop.
    pub timer_armed: bool,
}

impl WindowStateMonitor {
    /// Bind the toplevel manager, if the compositor offers it.
    pub fn try_new(globals: &GlobalList, qh: &QueueHandle<LiveBg>, debounce: Duration) -> Option<Self> {
        let manager = globals
            .bind::<ZwlrForeignToplevelManagerV1, _, _>(qh, 1..=3, ())
            .ok()?;

        Some(Self {
            _manager: manager,
            tracker: ToplevelTracker::new(),
            debouncer: Debouncer::new(debounce),
            timer_armed: false,
        })
    }

    /// Feed the current raw occlusion of every attached output into the debouncer.
    pub fn observe_outputs<'a>(
        &mut self,
        outputs: impl Iterator<Item = (&'a WlOutput, &'a MonitorId)>,
        now: Instant,
    ) {
        for (output, id) in outputs {
            let occluded = self.tracker.is_occluded(output);
            self.debouncer.observe(id, occluded, now);
        }
    }
}

impl Dispatch<ZwlrForeignToplevelManagerV1, ()> for LiveBg {
    fn event(
        app: &mut LiveBg,
        _proxy: &ZwlrForeignToplevelManagerV1,
        event: zwlr_foreign_toplevel_manager_v1::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<LiveBg>,
    ) {
        match event {
            zwlr_foreign_toplevel_manager_v1::Event::Toplevel { toplevel } => {
                tracing::trace!(?toplevel, "new toplevel announced");
            }
            zwlr_foreign_toplevel_manager_v1::Event::Finished => {
                tracing::info!("foreign toplevel manager finished, occlusion detection disabled");
                app.windows = None;
                app.on_window_state_changed();
            }
            _ => {}
        }
    }

    event_created_child!(LiveBg, ZwlrForeignToplevelManagerV1, [
        zwlr_foreign_toplevel_manager_v1::EVT_TOPLEVEL_OPCODE => (ZwlrForeignToplevelHandleV1, ())
    ]);
}

impl Dispatch<ZwlrForeignToplevelHandleV1, ()> for LiveBg {
    fn event(
        app: &mut LiveBg,
        handle: &ZwlrForeignToplevelHandleV1,
        event: zwlr_foreign_toplevel_handle_v1::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<LiveBg>,
    ) {
        let Some(windows) = app.windows.as_mut() else {
            return;
        };

        match event {
            zwlr_foreign_toplevel_handle_v1::Event::OutputEnter { output } => {
                windows.tracker.output_enter(handle, output);
            }
            zwlr_foreign_toplevel_handle_v1::Event::OutputLeave { output } => {
                windows.tracker.output_leave(handle, &output);
            }
            zwlr_foreign_toplevel_handle_v1::Event::State { state } => {
                let (maximized, minimized, fullscreen) = parse_state(&state);
                windows
                    .tracker
                    .set_state(handle, maximized, minimized, fullscreen);
            }
            zwlr_foreign_toplevel_handle_v1::Event::Done => {
                if windows.tracker.commit(handle) {
                    app.on_window_state_changed();
                }
            }
            zwlr_foreign_toplevel_handle_v1::Event::Closed => {
                windows.tracker.close(handle);
                handle.destroy();
                app.on_window_state_changed();
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(values: &[u32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_ne_bytes()).collect()
    }

    #[test]
    fn test_parse_state() {
        assert_eq!(parse_state(&raw(&[])), (false, false, false));
        assert_eq!(parse_state(&raw(&[2, 0])), (true, false, false));
        assert_eq!(parse_state(&raw(&[3, 1])), (false, true, true));
    }

    #[test]
    fn test_maximized_window_occludes_its_outputs_only() {
        let mut tracker: ToplevelTracker<u32, &str> = ToplevelTracker::new();
        tracker.output_enter(&1, "A");
        tracker.set_state(&1, true, false, false);
        assert!(!tracker.is_occluded(&"A"), "pending until done");

        assert!(tracker.commit(&1));
        assert!(tracker.is_occluded(&"A"));
        assert!(!tracker.is_occluded(&"B"));
    }

    #[test]
    fn test_minimized_or_closed_window_does_not_occlude() {
        let mut tracker: ToplevelTracker<u32, &str> = ToplevelTracker::new();
        tracker.output_enter(&1, "A");
        tracker.set_state(&1, false, true, true);
        tracker.commit(&1);
        assert!(!tracker.is_occluded(&"A"));

        tracker.set_state(&1, false, false, true);
        tracker.commit(&1);
        assert!(tracker.is_occluded(&"A"));

        tracker.close(&1);
        assert!(!tracker.is_occluded(&"A"));
        assert_eq!(tracker.len(), 0);
    }

    #[test]
    fn test_window_moving_between_outputs() {
        let mut tracker: ToplevelTracker<u32, &str> = ToplevelTracker::new();
        tracker.output_enter(&1, "A");
        tracker.set_state(&1, true, false, false);
        tracker.commit(&1);

        tracker.output_leave(&1, &"A");
        tracker.output_enter(&1, "B");
        assert!(tracker.commit(&1));
        assert!(!tracker.is_occluded(&"A"));
        assert!(tracker.is_occluded(&"B"));

        tracker.forget_output(&"B");
        assert!(!tracker.is_occluded(&"B"));
    }

    #[test]
    fn test_debouncer_reports_stable_changes_only() {
        let a = MonitorId::new("A");
        let start = Instant::now();
        let mut debouncer = Debouncer::new(Duration::from_millis(400));

        debouncer.observe(&a, true, start);
        assert!(debouncer.flush(start + Duration::from_millis(100)).is_empty());
        assert_eq!(
            debouncer.next_deadline(),
            Some(start + Duration::from_millis(400))
        );
        assert_eq!(
            debouncer.flush(start + Duration::from_millis(400)),
            vec![(a.clone(), true)]
        );
        assert!(debouncer.next_deadline().is_none());
    }

    #[test]
    fn test_debouncer_swallows_flicker() {
        let a = MonitorId::new("A");
        let start = Instant::now();
        let mut debouncer = Debouncer::new(Duration::from_millis(400));

        debouncer.observe(&a, true, start);
        debouncer.observe(&a, false, start + Duration::from_millis(50));
        assert!(debouncer.flush(start + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn test_debouncer_keeps_first_timestamp() {
        let a = MonitorId::new("A");
        let start = Instant::now();
        let mut debouncer = Debouncer::new(Duration::from_millis(400));

        debouncer.observe(&a, true, start);
        debouncer.observe(&a, true, start + Duration::from_millis(300));
        assert_eq!(
            debouncer.flush(start + Duration::from_millis(400)),
            vec![(a, true)]
        );
    }

    #[test]
    fn test_debouncer_seeded_monitor_reports_uncovering() {
        let a = MonitorId::new("A");
        let start = Instant::now();
        let mut debouncer = Debouncer::new(Duration::from_millis(400));

        debouncer.seed(&a, true);
        debouncer.observe(&a, true, start);
        assert!(debouncer.flush(start + Duration::from_secs(1)).is_empty());

        debouncer.observe(&a, false, start + Duration::from_secs(1));
        assert_eq!(
            debouncer.flush(start + Duration::from_millis(1400)),
            vec![(a, false)]
        );
    }

    #[test]
    fn test_debouncer_monitors_are_independent() {
        let (a, b) = (MonitorId::new("A"), MonitorId::new("B"));
        let start = Instant::now();
        let mut debouncer = Debouncer::new(Duration::from_millis(100));

        debouncer.observe(&a, true, start);
        debouncer.observe(&b, true, start + Duration::from_millis(80));
        assert_eq!(
            debouncer.flush(start + Duration::from_millis(120)),
            vec![(a.clone(), true)]
        );
        debouncer.forget(&a);
        assert_eq!(
            debouncer.flush(start + Duration::from_millis(200)),
            vec![(b, true)]
        );
    }
}
