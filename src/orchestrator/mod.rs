// SPDX-License-Identifier: MPL-2.0

//! The per-monitor policy engine.
//!
//! The orchestrator is the single owner of every monitor's runtime record. It
//! receives normalized events (topology, occlusion, power, control calls),
//! recomputes the affected monitors' pause reasons and drives their sessions
//! through a [`SessionDispatch`]. After every event a session exists for a
//! monitor exactly when the monitor is attached and has a working assignment,
//! and it plays exactly when no pause reason is active.

mod reasons;

use std::{
    collections::BTreeMap,
    mem,
    path::PathBuf,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

pub use self::reasons::PauseReasons;
use crate::{
    error::{ControlError, SessionError},
    media,
    session::{
        SessionParams, SurfaceBinding,
        worker::{SessionCommand, SessionDispatch, SessionOutcome, SessionReport},
    },
    topology::{Geometry, Monitor, MonitorId},
};

/// Automatic recreations after a lost backend before the monitor is marked errored.
pub const MAX_AUTO_RESTARTS: u32 = 1;
/// Time a session gets to answer a liveness probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(3);
/// Extra slack for the answer to travel back through the event loop.
const PROBE_GRACE: Duration = Duration::from_secs(2);

/// Background surfaces, one per attached monitor.
pub trait SurfaceHost {
    /// Create the monitor's background surface, or return the existing one.
    fn bind(&mut self, monitor: &Monitor) -> Result<SurfaceBinding, SessionError>;
    /// Follow a geometry change. Returns a new binding when the pixel size changed.
    fn resize(&mut self, monitor: &Monitor) -> Option<SurfaceBinding>;
    /// Start or stop presenting frames.
    fn set_rendering(&mut self, id: &MonitorId, active: bool);
    fn release(&mut self, id: &MonitorId);
}

/// The durable intent "monitor M shows video V".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorAssignment {
    pub monitor: MonitorId,
    pub source: PathBuf,
    pub volume: u8,
    pub muted: bool,
    /// Playback rate, already clamped.
    #[serde(default = "default_speed")]
    pub speed: f64,
    /// Set after repeated backend failures; cleared by a new apply or by
    /// reattaching the monitor.
    #[serde(default)]
    pub errored: bool,
}

impl MonitorAssignment {
    #[must_use]
    pub fn new(monitor: MonitorId, source: PathBuf) -> Self {
        Self {
            monitor,
            source,
            volume: live_bg_config::DEFAULT_VOLUME,
            muted: false,
            speed: live_bg_config::DEFAULT_SPEED,
            errored: false,
        }
    }
}

fn default_speed() -> f64 {
    live_bg_config::DEFAULT_SPEED
}

/// Notifications for the control layer, drained with [`Orchestrator::take_events`].
#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    MonitorsChanged(Vec<MonitorId>),
    AssignmentApplied(MonitorAssignment),
    AssignmentRemoved(MonitorId),
    ApplyFailed {
        monitor: MonitorId,
        error: SessionError,
    },
    SessionErrored {
        monitor: MonitorId,
        error: SessionError,
    },
    PlaybackChanged {
        monitor: MonitorId,
        playing: bool,
        reasons: PauseReasons,
    },
    TopologyUnavailable,
}

/// Snapshot of one monitor for status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorStatus {
    pub monitor: MonitorId,
    pub attached: bool,
    pub geometry: Option<Geometry>,
    pub assignment: Option<MonitorAssignment>,
    pub playing: bool,
    pub reasons: Vec<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
struct SessionSlot {
    generation: u64,
    /// The worker confirmed creation.
    live: bool,
    /// Last pause state commanded.
    paused: bool,
    probe_sent: Option<Instant>,
}

/// A source switch or creation started by `apply`, with what to restore on failure.
#[derive(Debug, Clone)]
struct PendingApply {
    generation: u64,
    source: PathBuf,
    previous: Option<MonitorAssignment>,
}

#[derive(Debug, Default)]
struct SurfaceState {
    monitor: Option<Monitor>,
    session: Option<SessionSlot>,
    reasons: PauseReasons,
    playing: bool,
    bound: bool,
    user_paused: bool,
    occluded: bool,
    restarts: u32,
    pending: Vec<PendingApply>,
    last_error: Option<SessionError>,
}

pub struct Orchestrator<H, D> {
    host: H,
    dispatch: D,
    surfaces: BTreeMap<MonitorId, SurfaceState>,
    assignments: BTreeMap<MonitorId, MonitorAssignment>,
    on_battery: bool,
    power_save: bool,
    pause_on_occlusion: bool,
    all_paused: bool,
    next_generation: u64,
    events: Vec<StatusEvent>,
}

impl<H: SurfaceHost, D: SessionDispatch> Orchestrator<H, D> {
    pub fn new(host: H, dispatch: D) -> Self {
        Self {
            host,
            dispatch,
            surfaces: BTreeMap::new(),
            assignments: BTreeMap::new(),
            on_battery: false,
            power_save: true,
            pause_on_occlusion: true,
            all_paused: false,
            next_generation: 0,
            events: Vec::new(),
        }
    }

    /// Load persisted assignments. Attached monitors start playing them.
    pub fn seed(&mut self, assignments: impl IntoIterator<Item = MonitorAssignment>) {
        let mut seeded = Vec::new();
        for assignment in assignments {
            debug!(output = %assignment.monitor, source = %assignment.source.display(), "seeding assignment");
            seeded.push(assignment.monitor.clone());
            self.assignments.insert(assignment.monitor.clone(), assignment);
        }
        for id in seeded {
            if self.surfaces.contains_key(&id) {
                self.reconcile(&id);
            }
        }
    }

    // Topology

    /// A monitor appeared. `occluded` is its window state at attach time, so
    /// a monitor covered by a maximized window starts paused.
    pub fn monitor_added(&mut self, monitor: Monitor, occluded: bool) {
        let id = monitor.id.clone();
        info!(output = %id, geometry = ?monitor.geometry, scale = monitor.scale, occluded, "monitor attached");

        let state = self.surfaces.entry(id.clone()).or_default();
        state.monitor = Some(monitor);
        state.restarts = 0;
        state.occluded = occluded;
        state.last_error = None;
        if let Some(assignment) = self.assignments.get_mut(&id) {
            // Reattaching gives an errored assignment a new chance.
            assignment.errored = false;
        }

        self.reconcile(&id);
        self.monitors_changed();
    }

    pub fn monitor_removed(&mut self, id: &MonitorId) {
        let Some(state) = self.surfaces.get_mut(id) else {
            return;
        };
        info!(output = %id, "monitor detached");
        state.monitor = None;
        state.occluded = false;

        // An apply that had not been confirmed yet stays as the pending assignment.
        for pending in mem::take(&mut state.pending) {
            if let Some(assignment) = self.assignments.get(id) {
                if assignment.source == pending.source {
                    self.events
                        .push(StatusEvent::AssignmentApplied(assignment.clone()));
                }
            }
        }

        self.reconcile(id);
        self.dispatch.release(id);
        self.monitors_changed();
    }

    pub fn monitor_resized(&mut self, monitor: Monitor) {
        let id = monitor.id.clone();
        let Some(state) = self.surfaces.get_mut(&id) else {
            self.monitor_added(monitor, false);
            return;
        };
        debug!(output = %id, geometry = ?monitor.geometry, scale = monitor.scale, "monitor resized");

        if state.bound {
            if let Some(binding) = self.host.resize(&monitor) {
                if let Some(slot) = state.session.as_ref() {
                    self.dispatch
                        .dispatch(&id, slot.generation, SessionCommand::Rebind(binding));
                }
            }
        }
        state.monitor = Some(monitor);
    }

    /// Monitor queries keep failing. The last known snapshot stays in effect.
    pub fn topology_unavailable(&mut self) {
        warn!(
            monitors = self.attached_monitors().len(),
            "monitor list unavailable, keeping last known monitors"
        );
        self.events.push(StatusEvent::TopologyUnavailable);
    }

    // Window and power state

    pub fn occlusion_changed(&mut self, id: &MonitorId, occluded: bool) {
        let Some(state) = self.surfaces.get_mut(id) else {
            return;
        };
        if state.occluded == occluded {
            return;
        }
        debug!(output = %id, occluded, "occlusion changed");
        state.occluded = occluded;
        self.reconcile(id);
    }

    pub fn power_changed(&mut self, on_battery: bool) {
        if self.on_battery == on_battery {
            return;
        }
        info!(on_battery, "power source changed");
        self.on_battery = on_battery;
        self.reconcile_all();
    }

    pub fn set_power_save(&mut self, enabled: bool) {
        if self.power_save == enabled {
            return;
        }
        info!(enabled, "power saving toggled");
        self.power_save = enabled;
        self.reconcile_all();
    }

    pub fn set_pause_on_occlusion(&mut self, enabled: bool) {
        if self.pause_on_occlusion == enabled {
            return;
        }
        info!(enabled, "pause on maximized toggled");
        self.pause_on_occlusion = enabled;
        self.reconcile_all();
    }

    // Control calls

    /// Assign `source` to `id`.
    ///
    /// The source is checked before anything changes. Failures found later by
    /// the backend restore the previous assignment and are reported as
    /// [`StatusEvent::ApplyFailed`].
    ///
    /// # Errors
    ///
    /// [`SessionError::SourceLoad`] for unusable paths, [`SessionError::SurfaceBind`]
    /// when the monitor's surface cannot be created.
    pub fn apply(&mut self, id: &MonitorId, source: PathBuf) -> Result<(), ControlError> {
        media::validate_source(&source)?;

        let previous = self.assignments.get(id).cloned();
        let mut assignment = previous
            .clone()
            .unwrap_or_else(|| MonitorAssignment::new(id.clone(), source.clone()));
        assignment.source = source.clone();
        assignment.errored = false;
        info!(output = %id, source = %source.display(), "applying wallpaper");
        self.assignments.insert(id.clone(), assignment.clone());

        let state = self.surfaces.entry(id.clone()).or_default();
        state.restarts = 0;
        state.last_error = None;

        if let Some(slot) = state.session.as_ref() {
            let generation = slot.generation;
            state.pending.push(PendingApply {
                generation,
                source: source.clone(),
                previous,
            });
            self.dispatch
                .dispatch(id, generation, SessionCommand::SetSource(source));
            return Ok(());
        }

        if state.monitor.is_none() {
            debug!(output = %id, "monitor not attached, assignment kept pending");
            self.events.push(StatusEvent::AssignmentApplied(assignment));
            self.reconcile(id);
            return Ok(());
        }

        self.reconcile(id);
        let Some(state) = self.surfaces.get_mut(id) else {
            return Ok(());
        };
        match state.session.as_ref() {
            Some(slot) => {
                state.pending.push(PendingApply {
                    generation: slot.generation,
                    source,
                    previous,
                });
                Ok(())
            }
            None => {
                let error = state
                    .last_error
                    .take()
                    .unwrap_or_else(|| SessionError::SurfaceBind("no surface".into()));
                self.restore(id, previous);
                Err(error.into())
            }
        }
    }

    /// Forget the assignment of `id`. Removing nothing is not an error.
    pub fn remove(&mut self, id: &MonitorId) -> Result<(), ControlError> {
        if self.assignments.remove(id).is_none() {
            return Ok(());
        }
        info!(output = %id, "removing wallpaper");
        if let Some(state) = self.surfaces.get_mut(id) {
            state.pending.clear();
            state.last_error = None;
        }
        self.events.push(StatusEvent::AssignmentRemoved(id.clone()));
        self.reconcile(id);
        Ok(())
    }

    pub fn set_volume(&mut self, id: &MonitorId, volume: i64) -> Result<(), ControlError> {
        let volume = live_bg_config::clamp_volume(volume);
        let assignment = self
            .assignments
            .get_mut(id)
            .ok_or_else(|| ControlError::NoAssignment(id.clone()))?;
        assignment.volume = volume;
        let assignment = assignment.clone();

        if let Some(slot) = self.surfaces.get(id).and_then(|s| s.session.as_ref()) {
            self.dispatch
                .dispatch(id, slot.generation, SessionCommand::SetVolume(volume));
        }
        self.events.push(StatusEvent::AssignmentApplied(assignment));
        Ok(())
    }

    pub fn set_mute(&mut self, id: &MonitorId, muted: bool) -> Result<(), ControlError> {
        let assignment = self
            .assignments
            .get_mut(id)
            .ok_or_else(|| ControlError::NoAssignment(id.clone()))?;
        assignment.muted = muted;
        let assignment = assignment.clone();

        if let Some(slot) = self.surfaces.get(id).and_then(|s| s.session.as_ref()) {
            self.dispatch
                .dispatch(id, slot.generation, SessionCommand::SetMute(muted));
        }
        self.events.push(StatusEvent::AssignmentApplied(assignment));
        Ok(())
    }

    /// Change the playback rate, clamped to `MIN_SPEED..=MAX_SPEED`.
    pub fn set_speed(&mut self, id: &MonitorId, speed: f64) -> Result<(), ControlError> {
        let speed = live_bg_config::clamp_speed(speed);
        let assignment = self
            .assignments
            .get_mut(id)
            .ok_or_else(|| ControlError::NoAssignment(id.clone()))?;
        assignment.speed = speed;
        let assignment = assignment.clone();

        if let Some(slot) = self.surfaces.get(id).and_then(|s| s.session.as_ref()) {
            self.dispatch
                .dispatch(id, slot.generation, SessionCommand::SetSpeed(speed));
        }
        self.events.push(StatusEvent::AssignmentApplied(assignment));
        Ok(())
    }

    /// Follow an assignment edited outside the daemon. `None` removes it.
    ///
    /// Only the fields that differ are applied, so writing back our own
    /// changes is a no-op.
    ///
    /// # Errors
    ///
    /// As [`Self::apply`] when the source changed.
    pub fn sync_assignment(
        &mut self,
        id: &MonitorId,
        stored: Option<&MonitorAssignment>,
    ) -> Result<(), ControlError> {
        let Some(stored) = stored else {
            return self.remove(id);
        };

        if self.assignments.get(id).map(|a| &a.source) != Some(&stored.source) {
            self.apply(id, stored.source.clone())?;
        }
        let Some(current) = self.assignments.get(id) else {
            return Ok(());
        };
        let (volume, muted, speed) = (current.volume, current.muted, current.speed);
        if volume != stored.volume {
            self.set_volume(id, i64::from(stored.volume))?;
        }
        if muted != stored.muted {
            self.set_mute(id, stored.muted)?;
        }
        if (speed - stored.speed).abs() > f64::EPSILON {
            self.set_speed(id, stored.speed)?;
        }
        Ok(())
    }

    /// Pause one monitor until [`Self::resume`] or [`Self::resume_all`].
    pub fn pause(&mut self, id: &MonitorId) -> Result<(), ControlError> {
        self.set_user_paused(id, true)
    }

    pub fn resume(&mut self, id: &MonitorId) -> Result<(), ControlError> {
        self.set_user_paused(id, false)
    }

    fn set_user_paused(&mut self, id: &MonitorId, paused: bool) -> Result<(), ControlError> {
        let state = self
            .surfaces
            .get_mut(id)
            .ok_or_else(|| ControlError::NoAssignment(id.clone()))?;
        state.user_paused = paused;
        self.reconcile(id);
        Ok(())
    }

    pub fn pause_all(&mut self) {
        info!("pausing all monitors");
        self.all_paused = true;
        self.reconcile_all();
    }

    /// Lift every user pause, global and per monitor.
    pub fn resume_all(&mut self) {
        info!("resuming all monitors");
        self.all_paused = false;
        for state in self.surfaces.values_mut() {
            state.user_paused = false;
        }
        self.reconcile_all();
    }

    // Session feedback

    pub fn handle_report(&mut self, report: SessionReport) {
        let SessionReport {
            monitor: id,
            generation,
            outcome,
        } = report;

        let Some(state) = self.surfaces.get_mut(&id) else {
            return;
        };
        let Some(slot) = state
            .session
            .as_mut()
            .filter(|slot| slot.generation == generation)
        else {
            if outcome != SessionOutcome::Destroyed {
                debug!(output = %id, generation, ?outcome, "ignoring report for stale session");
            }
            return;
        };

        match outcome {
            SessionOutcome::Created => {
                slot.live = true;
                debug!(output = %id, generation, "session live");
                if let Some(pos) = state
                    .pending
                    .iter()
                    .position(|p| p.generation == generation)
                {
                    state.pending.remove(pos);
                    if let Some(assignment) = self.assignments.get(&id) {
                        self.events
                            .push(StatusEvent::AssignmentApplied(assignment.clone()));
                    }
                }
            }

            SessionOutcome::CreateFailed(error) => {
                state.session = None;
                let pending = state
                    .pending
                    .iter()
                    .position(|p| p.generation == generation)
                    .map(|pos| state.pending.remove(pos));
                match pending {
                    Some(pending) => {
                        warn!(output = %id, %error, "wallpaper could not be applied");
                        self.events.push(StatusEvent::ApplyFailed {
                            monitor: id.clone(),
                            error,
                        });
                        self.restore(&id, pending.previous);
                    }
                    None => self.mark_errored(&id, error),
                }
            }

            SessionOutcome::SourceChanged(path) => {
                state
                    .pending
                    .retain(|p| !(p.generation == generation && p.source == path));
                if let Some(assignment) = self.assignments.get(&id) {
                    if assignment.source == path {
                        info!(output = %id, source = %path.display(), "wallpaper applied");
                        self.events
                            .push(StatusEvent::AssignmentApplied(assignment.clone()));
                    }
                }
            }

            SessionOutcome::SourceFailed { path, error } => {
                let Some(pos) = state
                    .pending
                    .iter()
                    .position(|p| p.generation == generation && p.source == path)
                else {
                    return;
                };
                let pending = state.pending.remove(pos);
                warn!(output = %id, %error, "wallpaper could not be applied, keeping previous");
                self.events.push(StatusEvent::ApplyFailed {
                    monitor: id.clone(),
                    error,
                });
                let current = self.assignments.get(&id).map(|a| a.source.clone());
                if current.as_ref() == Some(&path) {
                    if let Some(previous) = pending.previous {
                        self.assignments.insert(id.clone(), previous);
                    }
                }
            }

            SessionOutcome::Healthy => {
                slot.probe_sent = None;
                if state.restarts > 0 {
                    debug!(output = %id, "session healthy again, restart budget refilled");
                    state.restarts = 0;
                }
            }

            SessionOutcome::Lost(error) => self.session_lost(&id, error),

            SessionOutcome::Destroyed => {}
        }
    }

    /// Probe every live session, and treat sessions that never answered the
    /// previous probe as lost.
    pub fn probe_sessions(&mut self, now: Instant) {
        let mut unresponsive = Vec::new();
        for (id, state) in &mut self.surfaces {
            let Some(slot) = state.session.as_mut().filter(|slot| slot.live) else {
                continue;
            };
            match slot.probe_sent {
                Some(sent) if now.saturating_duration_since(sent) > PROBE_TIMEOUT + PROBE_GRACE => {
                    unresponsive.push(id.clone());
                }
                Some(_) => {}
                None => {
                    slot.probe_sent = Some(now);
                    self.dispatch
                        .dispatch(id, slot.generation, SessionCommand::Probe(PROBE_TIMEOUT));
                }
            }
        }

        for id in unresponsive {
            self.dispatch.abandon(&id);
            self.session_lost(
                &id,
                SessionError::BackendLost("no answer to liveness probe".into()),
            );
        }
    }

    /// The compositor destroyed the monitor's surface behind our back.
    ///
    /// The host already dropped it. The session is recreated on a new surface
    /// within the restart budget, otherwise the monitor is marked errored.
    pub fn surface_closed(&mut self, id: &MonitorId) {
        let Some(state) = self.surfaces.get_mut(id) else {
            return;
        };
        state.bound = false;
        if state.session.is_none() {
            return;
        }
        self.recover(
            id,
            SessionError::SurfaceBind("surface closed by the compositor".into()),
        );
    }

    /// Destroy every session and release every surface. Assignments are kept.
    pub fn shutdown(&mut self) {
        for (id, state) in &mut self.surfaces {
            if let Some(slot) = state.session.take() {
                self.dispatch.dispatch(id, slot.generation, SessionCommand::Destroy);
            }
            if mem::take(&mut state.bound) {
                self.host.release(id);
            }
            state.playing = false;
        }
    }

    // Queries

    pub fn take_events(&mut self) -> Vec<StatusEvent> {
        mem::take(&mut self.events)
    }

    #[must_use]
    pub fn assignment(&self, id: &MonitorId) -> Option<&MonitorAssignment> {
        self.assignments.get(id)
    }

    pub fn assignments(&self) -> impl Iterator<Item = &MonitorAssignment> {
        self.assignments.values()
    }

    #[must_use]
    pub fn attached_monitors(&self) -> Vec<MonitorId> {
        self.surfaces
            .iter()
            .filter(|(_, state)| state.monitor.is_some())
            .map(|(id, _)| id.clone())
            .collect()
    }

    #[must_use]
    pub fn has_session(&self, id: &MonitorId) -> bool {
        self.surfaces.get(id).is_some_and(|s| s.session.is_some())
    }

    #[must_use]
    pub fn is_playing(&self, id: &MonitorId) -> bool {
        self.surfaces.get(id).is_some_and(|s| s.playing)
    }

    #[must_use]
    pub fn reasons(&self, id: &MonitorId) -> PauseReasons {
        self.surfaces
            .get(id)
            .map(|s| s.reasons)
            .unwrap_or_default()
    }

    #[must_use]
    pub fn on_battery(&self) -> bool {
        self.on_battery
    }

    #[must_use]
    pub fn power_save(&self) -> bool {
        self.power_save
    }

    #[must_use]
    pub fn all_paused(&self) -> bool {
        self.all_paused
    }

    #[must_use]
    pub fn status(&self) -> Vec<MonitorStatus> {
        let mut ids: Vec<&MonitorId> = self.surfaces.keys().collect();
        ids.extend(self.assignments.keys());
        ids.sort();
        ids.dedup();

        ids.into_iter()
            .map(|id| {
                let state = self.surfaces.get(id);
                MonitorStatus {
                    monitor: id.clone(),
                    attached: state.is_some_and(|s| s.monitor.is_some()),
                    geometry: state.and_then(|s| s.monitor.as_ref()).map(|m| m.geometry),
                    assignment: self.assignments.get(id).cloned(),
                    playing: state.is_some_and(|s| s.playing),
                    reasons: state.map(|s| s.reasons.names()).unwrap_or_default(),
                    error: state
                        .and_then(|s| s.last_error.as_ref())
                        .map(ToString::to_string),
                }
            })
            .collect()
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatch
    }

    pub fn dispatcher_mut(&mut self) -> &mut D {
        &mut self.dispatch
    }

    // Internals

    fn monitors_changed(&mut self) {
        let monitors = self.attached_monitors();
        self.events.push(StatusEvent::MonitorsChanged(monitors));
    }

    fn reconcile_all(&mut self) {
        let ids: Vec<MonitorId> = self.surfaces.keys().cloned().collect();
        for id in ids {
            self.reconcile(&id);
        }
    }

    /// Bring one monitor's session in line with its attachment, assignment
    /// and pause reasons.
    fn reconcile(&mut self, id: &MonitorId) {
        let Some(state) = self.surfaces.get_mut(id) else {
            return;
        };
        let assignment = self.assignments.get(id).filter(|a| !a.errored);

        let mut reasons = PauseReasons::empty();
        reasons.set(
            PauseReasons::USER_PAUSED,
            self.all_paused || state.user_paused,
        );
        reasons.set(
            PauseReasons::WINDOW_MAXIMIZED,
            self.pause_on_occlusion && state.occluded,
        );
        reasons.set(
            PauseReasons::BATTERY_SAVING,
            self.power_save && self.on_battery,
        );
        reasons.set(PauseReasons::MONITOR_DETACHED, state.monitor.is_none());
        if reasons != state.reasons {
            debug!(output = %id, from = %state.reasons, to = %reasons, "pause reasons changed");
            state.reasons = reasons;
        }
        let paused = !reasons.is_empty();

        let mut bind_failure = None;
        match (state.monitor.as_ref(), assignment) {
            (Some(monitor), Some(assignment)) => {
                if let Some(slot) = state.session.as_mut() {
                    if slot.paused != paused {
                        slot.paused = paused;
                        let command = if paused {
                            SessionCommand::Pause
                        } else {
                            SessionCommand::Resume
                        };
                        self.dispatch.dispatch(id, slot.generation, command);
                        self.host.set_rendering(id, !paused);
                    }
                } else {
                    match self.host.bind(monitor) {
                        Ok(binding) => {
                            state.bound = true;
                            self.next_generation += 1;
                            let generation = self.next_generation;
                            debug!(output = %id, generation, paused, source = %assignment.source.display(), "creating session");
                            self.dispatch.dispatch(
                                id,
                                generation,
                                SessionCommand::Create {
                                    binding,
                                    params: SessionParams {
                                        source: assignment.source.clone(),
                                        volume: assignment.volume,
                                        muted: assignment.muted,
                                        speed: assignment.speed,
                                    },
                                    paused,
                                },
                            );
                            self.host.set_rendering(id, !paused);
                            state.session = Some(SessionSlot {
                                generation,
                                live: false,
                                paused,
                                probe_sent: None,
                            });
                        }
                        Err(error) => bind_failure = Some(error),
                    }
                }
            }
            _ => {
                if let Some(slot) = state.session.take() {
                    debug!(output = %id, generation = slot.generation, "destroying session");
                    self.dispatch
                        .dispatch(id, slot.generation, SessionCommand::Destroy);
                }
                if mem::take(&mut state.bound) {
                    self.host.release(id);
                }
                state.pending.clear();
            }
        }

        let playing = state.session.is_some() && !paused;
        if playing != state.playing {
            state.playing = playing;
            info!(output = %id, playing, reasons = %reasons, "playback changed");
            self.events.push(StatusEvent::PlaybackChanged {
                monitor: id.clone(),
                playing,
                reasons,
            });
        }

        let orphaned = state.monitor.is_none() && !self.assignments.contains_key(id);

        if let Some(error) = bind_failure {
            self.mark_errored(id, error);
        } else if orphaned {
            self.surfaces.remove(id);
        }
    }

    fn session_lost(&mut self, id: &MonitorId, error: SessionError) {
        if matches!(error, SessionError::SurfaceBind(_)) {
            self.mark_errored(id, error);
            return;
        }
        self.recover(id, error);
    }

    /// Recreate the session of `id` once per restart budget.
    fn recover(&mut self, id: &MonitorId, error: SessionError) {
        let Some(state) = self.surfaces.get_mut(id) else {
            return;
        };
        if state.restarts >= MAX_AUTO_RESTARTS {
            self.mark_errored(id, error);
            return;
        }

        state.restarts += 1;
        warn!(output = %id, %error, attempt = state.restarts, "wallpaper session lost, recreating");
        if let Some(slot) = state.session.take() {
            self.dispatch
                .dispatch(id, slot.generation, SessionCommand::Destroy);
        }
        state.pending.clear();
        self.reconcile(id);
    }

    fn mark_errored(&mut self, id: &MonitorId, error: SessionError) {
        error!(output = %id, %error, "wallpaper session failed, giving up");
        if let Some(assignment) = self.assignments.get_mut(id) {
            assignment.errored = true;
        }
        if let Some(state) = self.surfaces.get_mut(id) {
            state.last_error = Some(error.clone());
            state.pending.clear();
        }
        self.events.push(StatusEvent::SessionErrored {
            monitor: id.clone(),
            error,
        });
        self.reconcile(id);
    }

    /// Put back the assignment an apply replaced.
    fn restore(&mut self, id: &MonitorId, previous: Option<MonitorAssignment>) {
        match previous {
            Some(previous) => {
                self.assignments.insert(id.clone(), previous);
            }
            None => {
                self.assignments.remove(id);
            }
        }
        self.reconcile(id);
    }
}
