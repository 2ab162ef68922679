// SPDX-License-Identifier: MPL-2.0

//! The daemon: Wayland connection, event loop and the glue between every
//! event source and the [`Orchestrator`].
//!
//! Everything that mutates monitor state runs on the calloop thread. Power
//! polling, session workers and the control socket live on their own threads
//! and only send messages into the loop.

use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use calloop::{
    EventLoop, LoopHandle,
    channel::Event,
    signals::{Signal, Signals},
    timer::{TimeoutAction, Timer},
};
use cosmic_config::{Config as CosmicConfig, calloop::ConfigWatchSource};
use eyre::{Context, eyre};
use live_bg_config::{Assignment, Config, Settings};
use sctk::{
    compositor::CompositorHandler,
    delegate_compositor, delegate_layer, delegate_output, delegate_registry, delegate_shm,
    output::{OutputHandler, OutputState},
    reexports::{
        calloop_wayland_source::WaylandSource,
        client::{
            Connection, Dispatch, QueueHandle, Weak, delegate_noop,
            globals::registry_queue_init,
            protocol::{wl_output, wl_surface},
        },
    },
    registry::{ProvidesRegistryState, RegistryState},
    registry_handlers,
    shell::wlr_layer::{LayerShellHandler, LayerSurface, LayerSurfaceConfigure},
    shm::{Shm, ShmHandler},
};
use tracing::{debug, error, info, warn};
use wayland_protocols::wp::{
    fractional_scale::v1::client::{wp_fractional_scale_manager_v1, wp_fractional_scale_v1},
    viewporter::client::{wp_viewport, wp_viewporter},
};

use crate::{
    error::ControlError,
    ipc::{IpcCall, IpcServer, Request, Response, StatusReport},
    media,
    occlusion::WindowStateMonitor,
    orchestrator::{MonitorAssignment, Orchestrator, StatusEvent},
    power::{self, PowerBackend, PowerMonitorHandle, PowerStateChanged},
    session::worker::{ReportSink, SessionReport, WorkerPool},
    surface::BackgroundSurfaces,
    topology::{Backoff, Geometry, Monitor, MonitorId, Topology, TopologyEvent},
};

/// How often live sessions are probed.
pub const WATCHDOG_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Control socket location.
    pub socket: PathBuf,
    /// `power_supply` class directory polled when UPower is unavailable.
    pub power_supply: PathBuf,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            socket: crate::ipc::socket_path(),
            power_supply: PathBuf::from(power::SYSFS_POWER_SUPPLY),
        }
    }
}

fn to_monitor_assignment(entry: &Assignment) -> MonitorAssignment {
    MonitorAssignment {
        monitor: MonitorId::new(entry.output.as_str()),
        source: entry.source.clone(),
        volume: entry.volume,
        muted: entry.muted,
        speed: entry.speed,
        errored: false,
    }
}

fn to_stored(assignment: &MonitorAssignment) -> Assignment {
    Assignment::new(assignment.monitor.as_str(), assignment.source.clone())
        .volume(assignment.volume)
        .muted(assignment.muted)
        .speed(assignment.speed)
}

fn control_response(result: Result<(), ControlError>) -> Response {
    match result {
        Ok(()) => Response::Ok,
        Err(why) => Response::error(why.kind(), why),
    }
}

pub type LiveOrchestrator = Orchestrator<BackgroundSurfaces, WorkerPool>;

pub struct LiveBg {
    registry_state: RegistryState,
    output_state: OutputState,
    loop_handle: LoopHandle<'static, LiveBg>,
    pub(crate) orchestrator: LiveOrchestrator,
    topology: Topology<wl_output::WlOutput>,
    /// Outputs whose description is still incomplete.
    incomplete: Vec<wl_output::WlOutput>,
    backoff: Backoff,
    retry_armed: bool,
    pub(crate) windows: Option<WindowStateMonitor>,
    power_supply: PathBuf,
    power_tx: calloop::channel::Sender<PowerStateChanged>,
    power_monitor: Option<PowerMonitorHandle>,
    config_context: Option<CosmicConfig>,
    config: Config,
    ipc: Option<IpcServer>,
    exit: bool,
}

impl std::fmt::Debug for LiveBg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveBg")
            .field("topology", &self.topology)
            .field("incomplete", &self.incomplete.len())
            .field("windows", &self.windows.is_some())
            .field("power_monitor", &self.power_monitor.is_some())
            .field("config", &self.config)
            .field("exit", &self.exit)
            .finish_non_exhaustive()
    }
}

/// Connect to the compositor and run the daemon until a signal or a `Quit` request.
///
/// # Errors
///
/// Fails when the compositor cannot be reached, lacks a required global,
/// or another daemon already owns the control socket.
pub fn run(options: EngineOptions) -> eyre::Result<()> {
    let mut event_loop: EventLoop<'static, LiveBg> =
        EventLoop::try_new().wrap_err("failed to create event loop")?;
    let handle = event_loop.handle();

    // Installed before any thread is spawned so that every thread inherits the signal mask.
    let signals = Signals::new(&[Signal::SIGINT, Signal::SIGTERM])
        .wrap_err("failed to install signal handlers")?;
    handle
        .insert_source(signals, |event, _, state| {
            info!(signal = ?event.signal(), "shutting down");
            state.exit = true;
        })
        .map_err(|err| eyre!("failed to insert signal source into event loop: {err}"))?;

    let conn = Connection::connect_to_env().wrap_err("wayland client connection failed")?;
    let (globals, event_queue) =
        registry_queue_init(&conn).wrap_err("failed to initialize registry queue")?;
    let qh = event_queue.handle();

    WaylandSource::new(conn, event_queue)
        .insert(handle.clone())
        .map_err(|err| err.error)
        .wrap_err("failed to insert main EventLoop into WaylandSource")?;

    let config_context = match Config::helper() {
        Ok(context) => Some(context),
        Err(why) => {
            error!(?why, "config unavailable, running with defaults and without persistence");
            None
        }
    };
    let config = config_context
        .as_ref()
        .map(Config::load)
        .unwrap_or_default();
    let settings = config.settings;
    info!(?settings, assignments = config.assignments.len(), "configuration loaded");

    if let Some(context) = config_context.as_ref() {
        match ConfigWatchSource::new(context) {
            Ok(source) => {
                handle
                    .insert_source(source, |(_config, keys), (), state| {
                        state.config_changed(&keys);
                    })
                    .map_err(|err| eyre!("failed to insert config watcher into event loop: {err}"))?;
            }
            Err(why) => warn!(?why, "cannot watch configuration, external edits need a restart"),
        }
    }

    // Session workers report back through the loop.
    let (report_tx, report_rx) = calloop::channel::channel::<SessionReport>();
    let report_tx = Mutex::new(report_tx);
    let sink: ReportSink = Arc::new(move |report| {
        if let Ok(tx) = report_tx.lock() {
            let _ = tx.send(report);
        }
    });
    handle
        .insert_source(report_rx, |event, _, state| {
            if let Event::Msg(report) = event {
                state.orchestrator.handle_report(report);
            }
        })
        .map_err(|err| eyre!("failed to insert session report channel into event loop: {err}"))?;

    let surfaces = BackgroundSurfaces::new(&globals, &qh, settings.frame_rate_cap)?;
    let workers = WorkerPool::new(media::default_backend(), sink);
    let mut orchestrator = Orchestrator::new(surfaces, workers);
    orchestrator.set_power_save(settings.power_save);
    orchestrator.set_pause_on_occlusion(settings.pause_on_maximized);

    let (power_tx, power_rx) = calloop::channel::channel();
    handle
        .insert_source(power_rx, |event, _, state| {
            if let Event::Msg(PowerStateChanged { on_battery }) = event {
                state.orchestrator.power_changed(on_battery);
            }
        })
        .map_err(|err| eyre!("failed to insert power channel into event loop: {err}"))?;
    let power_monitor = spawn_power_monitor(
        options.power_supply.clone(),
        settings.power_poll_interval(),
        &power_tx,
    );

    // Known before any monitor shows up, so nothing starts playing on battery.
    if let Some(monitor) = power_monitor.as_ref() {
        orchestrator.power_changed(monitor.on_battery());
    }
    orchestrator.seed(config.assignments.iter().map(to_monitor_assignment));

    let windows = WindowStateMonitor::try_new(&globals, &qh, settings.occlusion_debounce());
    if windows.is_some() {
        info!("maximized window detection enabled via zwlr_foreign_toplevel_manager_v1");
    } else {
        warn!("maximized window detection unavailable, zwlr_foreign_toplevel_manager_v1 not supported");
    }

    let (ipc_tx, ipc_rx) = calloop::channel::channel::<IpcCall>();
    let ipc_tx = Mutex::new(ipc_tx);
    let ipc = IpcServer::start(options.socket.clone(), move |call| {
        ipc_tx.lock().is_ok_and(|tx| tx.send(call).is_ok())
    })
    .wrap_err_with(|| format!("failed to listen on {}", options.socket.display()))?;
    handle
        .insert_source(ipc_rx, |event, _, state| {
            if let Event::Msg(call) = event {
                let response = state.handle_request(call.request.clone());
                call.reply(response);
            }
        })
        .map_err(|err| eyre!("failed to insert control channel into event loop: {err}"))?;

    handle
        .insert_source(Timer::from_duration(WATCHDOG_INTERVAL), |_, _, state| {
            state.orchestrator.probe_sessions(Instant::now());
            TimeoutAction::ToDuration(WATCHDOG_INTERVAL)
        })
        .map_err(|err| eyre!("failed to insert watchdog timer into event loop: {err}"))?;

    let mut state = LiveBg {
        registry_state: RegistryState::new(&globals),
        output_state: OutputState::new(&globals, &qh),
        loop_handle: handle,
        orchestrator,
        topology: Topology::new(),
        incomplete: Vec::new(),
        backoff: Backoff::default(),
        retry_armed: false,
        windows,
        power_supply: options.power_supply,
        power_tx,
        power_monitor,
        config_context,
        config,
        ipc: Some(ipc),
        exit: false,
    };
    state.process_events();

    info!(socket = %options.socket.display(), "live-bg running");

    loop {
        event_loop
            .dispatch(None, &mut state)
            .wrap_err("event loop dispatch failed")?;
        state.process_events();

        if state.exit {
            break;
        }
    }

    state.shutdown();
    Ok(())
}

fn spawn_power_monitor(
    root: PathBuf,
    interval: Duration,
    tx: &calloop::channel::Sender<PowerStateChanged>,
) -> Option<PowerMonitorHandle> {
    let tx = tx.clone();
    match power::start_power_monitor(root, interval, move |change| tx.send(change).is_ok()) {
        Ok(monitor) => {
            debug!(backend = ?monitor.backend(), ?interval, "power monitor started");
            Some(monitor)
        }
        Err(why) => {
            warn!(?why, "failed to start power monitor, battery saving disabled");
            None
        }
    }
}

impl LiveBg {
    fn restart_power_monitor(&mut self, interval: Duration) {
        if let Some(mut monitor) = self.power_monitor.take() {
            monitor.stop();
        }
        self.power_monitor = spawn_power_monitor(self.power_supply.clone(), interval, &self.power_tx);
    }

    // Topology

    fn monitor_of(&self, output: &wl_output::WlOutput) -> Option<Monitor> {
        let info = self.output_state.info(output)?;
        let name = info.name.clone()?;
        let (x, y) = info.logical_position?;
        let (width, height) = info.logical_size?;
        let (Ok(width), Ok(height)) = (u32::try_from(width), u32::try_from(height)) else {
            return None;
        };
        if width == 0 || height == 0 {
            return None;
        }

        let id = MonitorId::new(name);
        let scale = self
            .orchestrator
            .host()
            .preferred_scale(&id)
            .unwrap_or(f64::from(info.scale_factor));
        Some(Monitor {
            id,
            geometry: Geometry {
                x,
                y,
                width,
                height,
            },
            scale,
        })
    }

    fn observe_output(&mut self, output: wl_output::WlOutput) {
        let Some(monitor) = self.monitor_of(&output) else {
            debug!(?output, "output description incomplete, retrying");
            if !self.incomplete.contains(&output) {
                self.incomplete.push(output);
            }
            self.schedule_retry();
            return;
        };

        self.incomplete.retain(|pending| pending != &output);
        if self.incomplete.is_empty() {
            self.backoff.reset();
        }

        for event in self.topology.observe(output.clone(), monitor) {
            self.apply_topology(&output, event);
        }
    }

    fn apply_topology(&mut self, output: &wl_output::WlOutput, event: TopologyEvent) {
        match event {
            TopologyEvent::Added(monitor) => {
                self.orchestrator
                    .host_mut()
                    .track_output(monitor.id.clone(), output.clone());
                // Windows already covering the output count from the start.
                let occluded = self.windows.as_mut().is_some_and(|windows| {
                    let occluded = windows.tracker.is_occluded(output);
                    windows.debouncer.seed(&monitor.id, occluded);
                    occluded
                });
                self.orchestrator.monitor_added(monitor, occluded);
            }
            TopologyEvent::Resized(monitor) => {
                self.orchestrator
                    .host_mut()
                    .track_output(monitor.id.clone(), output.clone());
                self.orchestrator.monitor_resized(monitor);
            }
            TopologyEvent::Removed(id) => {
                self.orchestrator.host_mut().forget_output(&id);
                if let Some(windows) = self.windows.as_mut() {
                    windows.debouncer.forget(&id);
                }
                self.orchestrator.monitor_removed(&id);
            }
        }
        debug!(
            monitors = self.topology.current_monitors().count(),
            "display topology updated"
        );
        self.on_window_state_changed();
    }

    fn schedule_retry(&mut self) {
        if self.retry_armed {
            return;
        }
        let Some(delay) = self.backoff.next_delay() else {
            self.orchestrator.topology_unavailable();
            return;
        };

        let inserted = self
            .loop_handle
            .insert_source(Timer::from_duration(delay), |_, _, state| {
                state.retry_armed = false;
                for output in std::mem::take(&mut state.incomplete) {
                    state.observe_output(output);
                }
                TimeoutAction::Drop
            });
        match inserted {
            Ok(_) => self.retry_armed = true,
            Err(why) => error!(?why, "failed to schedule output retry"),
        }
    }

    /// Rebuild one monitor's description, e.g. after its preferred scale changed.
    fn refresh_monitor(&mut self, id: &MonitorId) {
        if let Some(output) = self.topology.key_of(id).cloned() {
            self.observe_output(output);
        }
    }

    // Window state

    /// Re-evaluate occlusion of every attached monitor.
    pub(crate) fn on_window_state_changed(&mut self) {
        let now = Instant::now();
        let Some(windows) = self.windows.as_mut() else {
            for id in self.orchestrator.attached_monitors() {
                self.orchestrator.occlusion_changed(&id, false);
            }
            return;
        };

        windows.observe_outputs(
            self.topology
                .iter()
                .map(|(output, monitor)| (output, &monitor.id)),
            now,
        );
        self.flush_occlusion(now);
    }

    fn flush_occlusion(&mut self, now: Instant) {
        let Some(windows) = self.windows.as_mut() else {
            return;
        };
        let changes = windows.debouncer.flush(now);
        let deadline = windows.debouncer.next_deadline();
        let arm = deadline.is_some() && !windows.timer_armed;
        if arm {
            windows.timer_armed = true;
        }

        for (id, occluded) in changes {
            self.orchestrator.occlusion_changed(&id, occluded);
        }

        let (true, Some(deadline)) = (arm, deadline) else {
            return;
        };
        let inserted = self
            .loop_handle
            .insert_source(Timer::from_deadline(deadline), |_, _, state| {
                if let Some(windows) = state.windows.as_mut() {
                    windows.timer_armed = false;
                }
                state.flush_occlusion(Instant::now());
                TimeoutAction::Drop
            });
        if let Err(why) = inserted {
            error!(?why, "failed to schedule occlusion check");
            if let Some(windows) = self.windows.as_mut() {
                windows.timer_armed = false;
            }
        }
    }

    // Configuration

    fn config_changed(&mut self, keys: &[String]) {
        let Some(context) = self.config_context.clone() else {
            return;
        };
        let settings = Settings::load(&context);
        let previous = std::mem::replace(&mut self.config.settings, settings);

        for key in keys {
            match key.as_str() {
                live_bg_config::POWER_SAVE => {
                    self.orchestrator.set_power_save(settings.power_save);
                }
                live_bg_config::PAUSE_ON_MAXIMIZED => {
                    self.orchestrator
                        .set_pause_on_occlusion(settings.pause_on_maximized);
                }
                live_bg_config::FRAME_RATE_CAP => {
                    debug!(cap = ?settings.frame_rate_cap, "frame rate cap changed");
                    self.orchestrator
                        .host_mut()
                        .set_frame_cap(settings.frame_rate_cap);
                }
                live_bg_config::OCCLUSION_DEBOUNCE_MS => {
                    if let Some(windows) = self.windows.as_mut() {
                        windows
                            .debouncer
                            .set_threshold(settings.occlusion_debounce());
                    }
                }
                live_bg_config::POWER_POLL_MS => {
                    let polling = self
                        .power_monitor
                        .as_ref()
                        .is_none_or(|monitor| monitor.backend() == PowerBackend::Sysfs);
                    if polling && previous.power_poll_interval() != settings.power_poll_interval() {
                        self.restart_power_monitor(settings.power_poll_interval());
                    }
                }
                live_bg_config::ASSIGNMENTS => self.reload_assignments(&context),
                _ => {
                    if let Some(output) = key.strip_prefix(live_bg_config::OUTPUT_PREFIX) {
                        self.reload_assignment(&context, output);
                    } else {
                        debug!(key, "ignoring unknown config key");
                    }
                }
            }
        }
    }

    fn reload_assignments(&mut self, context: &CosmicConfig) {
        let stored = Config::load(context).assignments;
        let removed: Vec<MonitorId> = self
            .orchestrator
            .assignments()
            .filter(|a| !stored.iter().any(|entry| entry.output == a.monitor.as_str()))
            .map(|a| a.monitor.clone())
            .collect();

        for id in removed {
            self.sync_assignment(&id, None);
        }
        for entry in &stored {
            self.sync_assignment(&MonitorId::new(entry.output.as_str()), Some(entry));
        }
        self.config.assignments = stored;
    }

    fn reload_assignment(&mut self, context: &CosmicConfig, output: &str) {
        let id = MonitorId::new(output);
        match Config::load_entry(context, output) {
            Ok(entry) if entry.enabled => self.sync_assignment(&id, Some(&entry)),
            Ok(_) => self.sync_assignment(&id, None),
            Err(why) => debug!(output, ?why, "unreadable assignment entry"),
        }
    }

    fn sync_assignment(&mut self, id: &MonitorId, entry: Option<&Assignment>) {
        let stored = entry.map(to_monitor_assignment);
        if let Err(why) = self.orchestrator.sync_assignment(id, stored.as_ref()) {
            warn!(output = %id, %why, "cannot follow edited assignment");
        }
    }

    // Control requests

    fn handle_request(&mut self, request: Request) -> Response {
        match request {
            Request::Apply { output, source } => {
                control_response(self.orchestrator.apply(&output, source))
            }
            Request::Remove { output } => control_response(self.orchestrator.remove(&output)),
            Request::SetPowerSave(enabled) => {
                self.orchestrator.set_power_save(enabled);
                if let Some(context) = self.config_context.as_ref() {
                    if let Err(why) = self.config.settings.set_power_save(context, enabled) {
                        error!(?why, "failed to persist power saving switch");
                    }
                }
                Response::Ok
            }
            Request::SetVolume { output, volume } => {
                control_response(self.orchestrator.set_volume(&output, volume))
            }
            Request::SetMute { output, muted } => {
                control_response(self.orchestrator.set_mute(&output, muted))
            }
            Request::SetSpeed { output, speed } => {
                control_response(self.orchestrator.set_speed(&output, speed))
            }
            Request::Pause { output } => control_response(self.orchestrator.pause(&output)),
            Request::Resume { output } => control_response(self.orchestrator.resume(&output)),
            Request::PauseAll => {
                self.orchestrator.pause_all();
                Response::Ok
            }
            Request::ResumeAll => {
                self.orchestrator.resume_all();
                Response::Ok
            }
            Request::Status => Response::Status(StatusReport {
                monitors: self.orchestrator.status(),
                on_battery: self.orchestrator.on_battery(),
                power_save: self.orchestrator.power_save(),
                all_paused: self.orchestrator.all_paused(),
            }),
            Request::Ping => Response::Pong,
            Request::Quit => {
                info!("quit requested over the control socket");
                self.exit = true;
                Response::Ok
            }
        }
    }

    // Status events

    /// Log status events and write assignment changes through to the config.
    fn process_events(&mut self) {
        for event in self.orchestrator.take_events() {
            match event {
                StatusEvent::MonitorsChanged(monitors) => {
                    info!(?monitors, "monitor list changed");
                }
                StatusEvent::AssignmentApplied(assignment) => {
                    info!(
                        output = %assignment.monitor,
                        source = %assignment.source.display(),
                        volume = assignment.volume,
                        muted = assignment.muted,
                        speed = assignment.speed,
                        "assignment applied"
                    );
                    self.persist(&assignment);
                }
                StatusEvent::AssignmentRemoved(id) => {
                    info!(output = %id, "assignment removed");
                    self.forget(&id);
                }
                StatusEvent::ApplyFailed { monitor, error } => {
                    warn!(output = %monitor, %error, "apply failed, previous wallpaper kept");
                }
                StatusEvent::SessionErrored { monitor, error } => {
                    error!(output = %monitor, %error, "wallpaper errored");
                }
                StatusEvent::PlaybackChanged {
                    monitor,
                    playing,
                    reasons,
                } => {
                    debug!(output = %monitor, playing, %reasons, "playback state");
                }
                StatusEvent::TopologyUnavailable => {
                    warn!("monitor list unavailable");
                }
            }
        }
    }

    fn persist(&mut self, assignment: &MonitorAssignment) {
        let Some(context) = self.config_context.as_ref() else {
            return;
        };
        let entry = to_stored(assignment);
        if self.config.assignment(&entry.output) == Some(&entry) {
            return;
        }
        match self.config.set_assignment(context, entry) {
            Ok(()) => debug!(output = %assignment.monitor, "assignment saved"),
            Err(why) => error!(output = %assignment.monitor, ?why, "failed to save assignment"),
        }
    }

    fn forget(&mut self, id: &MonitorId) {
        let Some(context) = self.config_context.as_ref() else {
            return;
        };
        if self.config.assignment(id.as_str()).is_none() {
            return;
        }
        match self.config.disable_assignment(context, id.as_str()) {
            Ok(()) => debug!(output = %id, "assignment disabled in config"),
            Err(why) => error!(output = %id, ?why, "failed to save removed assignment"),
        }
    }

    fn shutdown(&mut self) {
        info!("stopping every session");
        self.orchestrator.shutdown();
        self.orchestrator.dispatcher_mut().shutdown();
        self.process_events();
        if let Some(mut ipc) = self.ipc.take() {
            ipc.stop();
        }
        if let Some(mut monitor) = self.power_monitor.take() {
            monitor.stop();
        }
    }
}

impl CompositorHandler for LiveBg {
    fn scale_factor_changed(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &wl_surface::WlSurface,
        _new_factor: i32,
    ) {
        // Integer scale changes arrive through `update_output`.
    }

    fn transform_changed(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &wl_surface::WlSurface,
        _new_transform: wl_output::Transform,
    ) {
    }

    fn frame(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        surface: &wl_surface::WlSurface,
        _time: u32,
    ) {
        self.orchestrator.host_mut().frame_done(surface);
    }

    fn surface_enter(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &wl_surface::WlSurface,
        _output: &wl_output::WlOutput,
    ) {
    }

    fn surface_leave(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &wl_surface::WlSurface,
        _output: &wl_output::WlOutput,
    ) {
    }
}

impl OutputHandler for LiveBg {
    fn output_state(&mut self) -> &mut OutputState {
        &mut self.output_state
    }

    fn new_output(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        output: wl_output::WlOutput,
    ) {
        self.observe_output(output);
    }

    fn update_output(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        output: wl_output::WlOutput,
    ) {
        self.observe_output(output);
    }

    fn output_destroyed(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        output: wl_output::WlOutput,
    ) {
        self.incomplete.retain(|pending| pending != &output);
        if let Some(windows) = self.windows.as_mut() {
            windows.tracker.forget_output(&output);
        }
        if let Some(event) = self.topology.remove(&output) {
            self.apply_topology(&output, event);
        }
    }
}

impl LayerShellHandler for LiveBg {
    fn closed(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, layer: &LayerSurface) {
        if let Some(id) = self.orchestrator.host_mut().closed(layer) {
            self.orchestrator.surface_closed(&id);
        }
    }

    fn configure(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        layer: &LayerSurface,
        configure: LayerSurfaceConfigure,
        _serial: u32,
    ) {
        self.orchestrator.host_mut().configure(layer, configure);
    }
}

impl ShmHandler for LiveBg {
    fn shm_state(&mut self) -> &mut Shm {
        self.orchestrator.host_mut().shm_mut()
    }
}

delegate_compositor!(LiveBg);
delegate_output!(LiveBg);
delegate_shm!(LiveBg);
delegate_layer!(LiveBg);
delegate_registry!(LiveBg);
delegate_noop!(LiveBg: wp_viewporter::WpViewporter);
delegate_noop!(LiveBg: wp_viewport::WpViewport);
delegate_noop!(LiveBg: wp_fractional_scale_manager_v1::WpFractionalScaleManagerV1);

impl Dispatch<wp_fractional_scale_v1::WpFractionalScaleV1, Weak<wl_surface::WlSurface>>
    for LiveBg
{
    fn event(
        state: &mut LiveBg,
        _: &wp_fractional_scale_v1::WpFractionalScaleV1,
        event: wp_fractional_scale_v1::Event,
        surface: &Weak<wl_surface::WlSurface>,
        _: &Connection,
        _: &QueueHandle<LiveBg>,
    ) {
        if let wp_fractional_scale_v1::Event::PreferredScale { scale } = event {
            let Ok(surface) = surface.upgrade() else {
                return;
            };
            if let Some(id) = state
                .orchestrator
                .host_mut()
                .set_preferred_scale(&surface, scale)
            {
                state.refresh_monitor(&id);
            }
        }
    }
}

impl ProvidesRegistryState for LiveBg {
    fn registry(&mut self) -> &mut RegistryState {
        &mut self.registry_state
    }
    registry_handlers![OutputState];
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, SessionError};

    #[test]
    fn test_stored_assignment_conversion() {
        let entry = Assignment::new("DP-1", "/videos/rain.webm")
            .volume(35)
            .muted(true)
            .speed(0.5);
        let assignment = to_monitor_assignment(&entry);
        assert_eq!(assignment.monitor.as_str(), "DP-1");
        assert_eq!(assignment.volume, 35);
        assert_eq!(assignment.speed, 0.5);
        assert!(assignment.muted);
        assert!(!assignment.errored);
        assert_eq!(to_stored(&assignment), entry);
    }

    #[test]
    fn test_control_response() {
        assert_eq!(control_response(Ok(())), Response::Ok);
        match control_response(Err(SessionError::source_load("/bad/path.mp4", "missing").into())) {
            Response::Error { kind, message } => {
                assert_eq!(kind, ErrorKind::SourceLoad);
                assert!(message.contains("/bad/path.mp4"));
            }
            other => panic!("unexpected response {other:?}"),
        }
        match control_response(Err(ControlError::NoAssignment("DP-2".into()))) {
            Response::Error { kind, .. } => assert_eq!(kind, ErrorKind::NoAssignment),
            other => panic!("unexpected response {other:?}"),
        }
    }
}
