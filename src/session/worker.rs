// SPDX-License-Identifier: MPL-2.0

//! Per-monitor worker threads executing session commands.
//!
//! Media backends may block while opening or tearing down a source, so every
//! monitor gets its own thread and commands for one monitor run in the order
//! they were dispatched. Results come back as [`SessionReport`]s through the
//! report sink, tagged with the generation of the session they concern.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
        mpsc,
    },
    thread,
    time::Duration,
};

use super::{MediaBackend, PlaybackSession, SessionParams, SurfaceBinding};
use crate::{error::SessionError, topology::MonitorId};

#[derive(Debug)]
pub enum SessionCommand {
    Create {
        binding: SurfaceBinding,
        params: SessionParams,
        paused: bool,
    },
    Pause,
    Resume,
    SetSource(PathBuf),
    SetVolume(u8),
    SetMute(bool),
    SetSpeed(f64),
    Rebind(SurfaceBinding),
    Probe(Duration),
    Destroy,
}

impl SessionCommand {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::SetSource(_) => "set-source",
            Self::SetVolume(_) => "set-volume",
            Self::SetMute(_) => "set-mute",
            Self::SetSpeed(_) => "set-speed",
            Self::Rebind(_) => "rebind",
            Self::Probe(_) => "probe",
            Self::Destroy => "destroy",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Created,
    CreateFailed(SessionError),
    SourceChanged(PathBuf),
    SourceFailed { path: PathBuf, error: SessionError },
    Healthy,
    Lost(SessionError),
    Destroyed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub monitor: MonitorId,
    pub generation: u64,
    pub outcome: SessionOutcome,
}

/// Receiver of session results, called from worker threads.
pub type ReportSink = Arc<dyn Fn(SessionReport) + Send + Sync>;

/// Where the orchestrator sends its session commands.
pub trait SessionDispatch {
    fn dispatch(&mut self, monitor: &MonitorId, generation: u64, command: SessionCommand);

    /// Give up on a worker that stopped answering. Later commands for
    /// `monitor` must not queue behind it.
    fn abandon(&mut self, monitor: &MonitorId);

    /// `monitor` went away. Commands already dispatched still run, then its
    /// worker ends.
    fn release(&mut self, monitor: &MonitorId);
}

/// Owns at most one session for a monitor and applies commands to it.
pub struct SessionRunner {
    monitor: MonitorId,
    backend: Arc<dyn MediaBackend>,
    current: Option<(u64, PlaybackSession)>,
}

impl SessionRunner {
    #[must_use]
    pub fn new(monitor: MonitorId, backend: Arc<dyn MediaBackend>) -> Self {
        Self {
            monitor,
            backend,
            current: None,
        }
    }

    /// Apply `command` for session `generation`.
    ///
    /// A `Create` at or below `retired` was destroyed before it ran and is
    /// skipped. Commands addressed to any other generation than the current
    /// session are stale and ignored.
    pub fn execute(
        &mut self,
        generation: u64,
        command: SessionCommand,
        retired: u64,
    ) -> Option<SessionOutcome> {
        match command {
            SessionCommand::Create {
                binding,
                params,
                paused,
            } => {
                if generation <= retired {
                    tracing::debug!(output = %self.monitor, generation, "skipping cancelled session");
                    return None;
                }
                if let Some((_, mut old)) = self.current.take() {
                    old.destroy();
                }
                match PlaybackSession::create(self.backend.as_ref(), binding, params, paused) {
                    Ok(session) => {
                        self.current = Some((generation, session));
                        Some(SessionOutcome::Created)
                    }
                    Err(error) => Some(SessionOutcome::CreateFailed(error)),
                }
            }

            SessionCommand::Destroy => {
                let (current, _) = self.current.as_ref()?;
                if *current > generation {
                    return None;
                }
                let (_, mut session) = self.current.take()?;
                session.destroy();
                Some(SessionOutcome::Destroyed)
            }

            command => {
                let (current, session) = self.current.as_mut()?;
                if *current != generation {
                    tracing::trace!(output = %self.monitor, generation, command = command.name(), "stale command");
                    return None;
                }
                match command {
                    SessionCommand::Pause => session.pause().err().map(SessionOutcome::Lost),
                    SessionCommand::Resume => session.resume().err().map(SessionOutcome::Lost),
                    SessionCommand::SetVolume(volume) => {
                        session.set_volume(volume);
                        None
                    }
                    SessionCommand::SetMute(muted) => {
                        session.set_mute(muted);
                        None
                    }
                    SessionCommand::SetSpeed(speed) => {
                        session.set_speed(speed);
                        None
                    }
                    SessionCommand::Rebind(binding) => {
                        session.rebind(binding).err().map(SessionOutcome::Lost)
                    }
                    SessionCommand::SetSource(path) => {
                        Some(match session.set_source(self.backend.as_ref(), &path) {
                            Ok(()) => SessionOutcome::SourceChanged(path),
                            Err(error) => SessionOutcome::SourceFailed { path, error },
                        })
                    }
                    SessionCommand::Probe(timeout) => Some(match session.check_liveness(timeout) {
                        Ok(()) => SessionOutcome::Healthy,
                        Err(error) => SessionOutcome::Lost(error),
                    }),
                    SessionCommand::Create { .. } | SessionCommand::Destroy => None,
                }
            }
        }
    }

    #[must_use]
    pub fn session(&self) -> Option<&PlaybackSession> {
        self.current.as_ref().map(|(_, session)| session)
    }
}

struct Job {
    generation: u64,
    command: SessionCommand,
}

struct Worker {
    tx: mpsc::Sender<Job>,
    retired: Arc<AtomicU64>,
    join: Option<thread::JoinHandle<()>>,
}

/// One worker thread per attached monitor.
pub struct WorkerPool {
    backend: Arc<dyn MediaBackend>,
    sink: ReportSink,
    workers: HashMap<MonitorId, Worker>,
    /// Released workers still draining their queue.
    retiring: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(backend: Arc<dyn MediaBackend>, sink: ReportSink) -> Self {
        Self {
            backend,
            sink,
            workers: HashMap::new(),
            retiring: Vec::new(),
        }
    }

    /// Number of live worker threads, released ones included.
    #[must_use]
    pub fn threads(&self) -> usize {
        self.workers.len() + self.retiring.len()
    }

    fn reap(&mut self) {
        self.retiring.retain(|join| !join.is_finished());
    }

    fn spawn(&self, monitor: &MonitorId) -> std::io::Result<Worker> {
        let (tx, rx) = mpsc::channel::<Job>();
        let retired = Arc::new(AtomicU64::new(0));

        let thread_retired = Arc::clone(&retired);
        let sink = Arc::clone(&self.sink);
        let mut runner = SessionRunner::new(monitor.clone(), Arc::clone(&self.backend));
        let name = monitor.clone();

        let join = thread::Builder::new()
            .name(format!("session-{monitor}"))
            .spawn(move || {
                while let Ok(Job {
                    generation,
                    command,
                }) = rx.recv()
                {
                    let retired = thread_retired.load(Ordering::Acquire);
                    if let Some(outcome) = runner.execute(generation, command, retired) {
                        sink(SessionReport {
                            monitor: name.clone(),
                            generation,
                            outcome,
                        });
                    }
                }
                // Dropping the runner destroys whatever session is left.
                tracing::debug!(output = %name, "session worker stopped");
            })?;

        Ok(Worker {
            tx,
            retired,
            join: Some(join),
        })
    }

    fn fail(&self, monitor: &MonitorId, generation: u64, command: &SessionCommand, why: String) {
        let error = SessionError::BackendLost(why);
        let outcome = match command {
            SessionCommand::Create { .. } => SessionOutcome::CreateFailed(error),
            SessionCommand::Destroy => SessionOutcome::Destroyed,
            _ => SessionOutcome::Lost(error),
        };
        (self.sink)(SessionReport {
            monitor: monitor.clone(),
            generation,
            outcome,
        });
    }

    /// Stop every worker, destroying their sessions, and wait for them.
    pub fn shutdown(&mut self) {
        let workers: Vec<_> = self.workers.drain().collect();
        for (_, mut worker) in workers {
            drop(worker.tx);
            if let Some(join) = worker.join.take() {
                let _ = join.join();
            }
        }
        for join in self.retiring.drain(..) {
            let _ = join.join();
        }
    }
}

impl SessionDispatch for WorkerPool {
    fn dispatch(&mut self, monitor: &MonitorId, generation: u64, command: SessionCommand) {
        self.reap();
        if !self.workers.contains_key(monitor) {
            match self.spawn(monitor) {
                Ok(worker) => {
                    self.workers.insert(monitor.clone(), worker);
                }
                Err(why) => {
                    tracing::error!(?why, output = %monitor, "failed to spawn session worker");
                    self.fail(monitor, generation, &command, why.to_string());
                    return;
                }
            }
        }

        let Some(worker) = self.workers.get(monitor) else {
            return;
        };
        if matches!(command, SessionCommand::Destroy) {
            worker.retired.fetch_max(generation, Ordering::AcqRel);
        }

        if let Err(mpsc::SendError(job)) = worker.tx.send(Job {
            generation,
            command,
        }) {
            tracing::error!(output = %monitor, "session worker exited unexpectedly");
            self.workers.remove(monitor);
            self.fail(monitor, generation, &job.command, "session worker exited".into());
        }
    }

    fn abandon(&mut self, monitor: &MonitorId) {
        if let Some(worker) = self.workers.remove(monitor) {
            // The detached thread exits once its blocked call returns.
            tracing::warn!(output = %monitor, "abandoning unresponsive session worker");
            drop(worker);
        }
    }

    fn release(&mut self, monitor: &MonitorId) {
        self.reap();
        if let Some(mut worker) = self.workers.remove(monitor) {
            tracing::debug!(output = %monitor, "releasing session worker");
            drop(worker.tx);
            if let Some(join) = worker.join.take() {
                self.retiring.push(join);
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::{path::Path, sync::Mutex};

    use super::*;
    use crate::{frame_queue::new_shared_queue, session::fake::FakeBackend};

    fn create(name: &str, source: &str) -> SessionCommand {
        SessionCommand::Create {
            binding: SurfaceBinding {
                monitor: MonitorId::new(name),
                width: 640,
                height: 480,
                frames: new_shared_queue(2),
            },
            params: SessionParams {
                source: PathBuf::from(source),
                volume: 0,
                muted: false,
                speed: live_bg_config::DEFAULT_SPEED,
            },
            paused: false,
        }
    }

    #[test]
    fn test_runner_ignores_stale_generations() {
        let backend = FakeBackend::default();
        let mut runner = SessionRunner::new("DP-1".into(), Arc::new(backend.clone()));

        assert_eq!(
            runner.execute(1, create("DP-1", "/a.mp4"), 0),
            Some(SessionOutcome::Created)
        );
        assert_eq!(runner.execute(0, SessionCommand::Pause, 0), None);
        assert_eq!(backend.count("pause a.mp4"), 0);

        assert_eq!(runner.execute(1, SessionCommand::Pause, 0), None);
        assert_eq!(backend.count("pause a.mp4"), 1);
    }

    #[test]
    fn test_runner_skips_retired_create() {
        let backend = FakeBackend::default();
        let mut runner = SessionRunner::new("DP-1".into(), Arc::new(backend.clone()));

        assert_eq!(runner.execute(3, create("DP-1", "/a.mp4"), 3), None);
        assert!(runner.session().is_none());
        assert_eq!(backend.open_handles(), 0);
    }

    #[test]
    fn test_runner_replaces_session_on_create() {
        let backend = FakeBackend::default();
        let mut runner = SessionRunner::new("DP-1".into(), Arc::new(backend.clone()));
        runner.execute(1, create("DP-1", "/a.mp4"), 0);
        runner.execute(2, create("DP-1", "/b.mp4"), 0);

        assert_eq!(backend.open_handles(), 1);
        assert_eq!(runner.session().unwrap().source(), Path::new("/b.mp4"));
    }

    #[test]
    fn test_runner_reports_source_failure() {
        let backend = FakeBackend::default();
        backend.break_source(Path::new("/bad.mp4"));
        let mut runner = SessionRunner::new("DP-1".into(), Arc::new(backend.clone()));
        runner.execute(1, create("DP-1", "/a.mp4"), 0);

        let outcome = runner.execute(1, SessionCommand::SetSource("/bad.mp4".into()), 0);
        assert!(matches!(
            outcome,
            Some(SessionOutcome::SourceFailed { ref path, .. }) if path == Path::new("/bad.mp4")
        ));
        assert_eq!(runner.session().unwrap().source(), Path::new("/a.mp4"));
    }

    #[test]
    fn test_pool_runs_commands_in_order() {
        let backend = FakeBackend::default();
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink_reports = Arc::clone(&reports);
        let (done_tx, done_rx) = mpsc::channel();

        let sink: ReportSink = Arc::new(move |report: SessionReport| {
            let destroyed = report.outcome == SessionOutcome::Destroyed;
            sink_reports.lock().unwrap().push(report);
            if destroyed {
                let _ = done_tx.send(());
            }
        });

        let mut pool = WorkerPool::new(Arc::new(backend.clone()), sink);
        let monitor = MonitorId::new("DP-1");
        pool.dispatch(&monitor, 1, create("DP-1", "/a.mp4"));
        pool.dispatch(&monitor, 1, SessionCommand::Pause);
        pool.dispatch(&monitor, 1, SessionCommand::Probe(Duration::from_millis(10)));
        pool.dispatch(&monitor, 1, SessionCommand::Destroy);

        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let outcomes: Vec<_> = reports
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.outcome.clone())
            .collect();
        assert_eq!(
            outcomes,
            vec![
                SessionOutcome::Created,
                SessionOutcome::Healthy,
                SessionOutcome::Destroyed
            ]
        );
        assert_eq!(backend.open_handles(), 0);
        pool.shutdown();
    }

    #[test]
    fn test_pool_cancels_pending_create() {
        let backend = FakeBackend::default();
        let sink: ReportSink = Arc::new(|_| {});
        let mut pool = WorkerPool::new(Arc::new(backend.clone()), sink);
        let monitor = MonitorId::new("DP-1");

        // Retire generation 1 before its create is dispatched.
        pool.dispatch(&monitor, 1, SessionCommand::Destroy);
        pool.dispatch(&monitor, 1, create("DP-1", "/a.mp4"));
        pool.shutdown();

        assert_eq!(backend.count("open a.mp4"), 0);
    }

    #[test]
    fn test_pool_reaps_released_workers() {
        let backend = FakeBackend::default();
        let (done_tx, done_rx) = mpsc::channel();
        let done_tx = Mutex::new(done_tx);
        let sink: ReportSink = Arc::new(move |report: SessionReport| {
            if report.outcome == SessionOutcome::Destroyed {
                let _ = done_tx.lock().unwrap().send(());
            }
        });
        let mut pool = WorkerPool::new(Arc::new(backend.clone()), sink);
        let monitor = MonitorId::new("DP-1");

        pool.dispatch(&monitor, 1, create("DP-1", "/a.mp4"));
        pool.dispatch(&monitor, 1, SessionCommand::Destroy);
        pool.release(&monitor);
        assert!(pool.workers.is_empty());

        // The queued destroy still runs before the thread ends.
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while pool.threads() > 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
            pool.reap();
        }
        assert_eq!(pool.threads(), 0);
        assert_eq!(backend.open_handles(), 0);

        // A monitor coming back gets a fresh worker.
        pool.dispatch(&monitor, 2, create("DP-1", "/a.mp4"));
        assert_eq!(pool.threads(), 1);
        pool.shutdown();
        assert_eq!(backend.open_handles(), 0);
    }
}
