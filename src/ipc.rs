// SPDX-License-Identifier: MPL-2.0

//! Control socket: line-delimited JSON requests, one response line each.
//!
//! The listener runs on its own thread and never touches engine state. Each
//! parsed request is forwarded with a reply channel and answered once the
//! event loop has processed it.

use std::{
    io::{self, BufRead, BufReader, Write},
    os::unix::{
        fs::PermissionsExt,
        net::{UnixListener, UnixStream},
    },
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    thread,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{error::ErrorKind, orchestrator::MonitorStatus, topology::MonitorId};

const SOCKET_NAME: &str = "live-bg.sock";

/// How long a client waits for the event loop to answer.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// `$XDG_RUNTIME_DIR/live-bg.sock`, or `/tmp/live-bg.sock` without a runtime dir.
#[must_use]
pub fn socket_path() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(SOCKET_NAME)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "value")]
pub enum Request {
    Apply { output: MonitorId, source: PathBuf },
    Remove { output: MonitorId },
    SetPowerSave(bool),
    SetVolume { output: MonitorId, volume: i64 },
    SetMute { output: MonitorId, muted: bool },
    SetSpeed { output: MonitorId, speed: f64 },
    Pause { output: MonitorId },
    Resume { output: MonitorId },
    PauseAll,
    ResumeAll,
    Status,
    Ping,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub monitors: Vec<MonitorStatus>,
    pub on_battery: bool,
    pub power_save: bool,
    pub all_paused: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", content = "value")]
pub enum Response {
    Ok,
    Pong,
    Status(StatusReport),
    Error { kind: ErrorKind, message: String },
}

impl Response {
    pub fn error(kind: ErrorKind, message: impl ToString) -> Self {
        Self::Error {
            kind,
            message: message.to_string(),
        }
    }
}

/// A request waiting for its answer.
#[derive(Debug)]
pub struct IpcCall {
    pub request: Request,
    reply: mpsc::Sender<Response>,
}

impl IpcCall {
    pub fn reply(self, response: Response) {
        // The client may have hung up already.
        let _ = self.reply.send(response);
    }
}

/// Running listener. Dropping it stops the thread and removes the socket file.
#[derive(Debug)]
pub struct IpcServer {
    path: PathBuf,
    stop: Arc<AtomicBool>,
    join: Option<thread::JoinHandle<()>>,
}

impl IpcServer {
    /// Listen on `path` and hand every request to `forward`.
    ///
    /// `forward` returns `false` when the receiving side is gone; the request
    /// is then answered with an `unavailable` error.
    ///
    /// # Errors
    ///
    /// Fails when another daemon already listens on `path` or the socket
    /// cannot be created.
    pub fn start<F>(path: PathBuf, forward: F) -> io::Result<Self>
    where
        F: Fn(IpcCall) -> bool + Send + Sync + 'static,
    {
        if UnixStream::connect(&path).is_ok() {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("another instance is listening on {}", path.display()),
            ));
        }
        // Leftover from a daemon that did not shut down cleanly.
        let _ = std::fs::remove_file(&path);

        let listener = UnixListener::bind(&path)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;

        let stop = Arc::new(AtomicBool::new(false));
        let forward = Arc::new(forward);
        let join = {
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("ipc-listener".into())
                .spawn(move || {
                    for stream in listener.incoming() {
                        if stop.load(Ordering::Acquire) {
                            break;
                        }
                        match stream {
                            Ok(stream) => {
                                let forward = Arc::clone(&forward);
                                let spawned = thread::Builder::new()
                                    .name("ipc-client".into())
                                    .spawn(move || handle_client(stream, forward.as_ref()));
                                if let Err(why) = spawned {
                                    warn!(%why, "failed to spawn control client thread");
                                }
                            }
                            Err(why) => debug!(%why, "control socket accept failed"),
                        }
                    }
                })?
        };

        debug!(path = %path.display(), "control socket listening");
        Ok(Self {
            path,
            stop,
            join: Some(join),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stop(&mut self) {
        let Some(join) = self.join.take() else {
            return;
        };
        self.stop.store(true, Ordering::Release);
        // Wake the blocking accept.
        let _ = UnixStream::connect(&self.path);
        let _ = join.join();
        if let Err(why) = std::fs::remove_file(&self.path) {
            debug!(%why, path = %self.path.display(), "failed to remove control socket");
        }
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn answer(request: Request, forward: &dyn Fn(IpcCall) -> bool) -> Response {
    let (reply, response) = mpsc::channel();
    if !forward(IpcCall { request, reply }) {
        return Response::error(ErrorKind::Unavailable, "engine is shutting down");
    }
    response
        .recv_timeout(REPLY_TIMEOUT)
        .unwrap_or_else(|_| Response::error(ErrorKind::Unavailable, "engine did not answer"))
}

fn handle_client<F>(stream: UnixStream, forward: &F)
where
    F: Fn(IpcCall) -> bool,
{
    let mut writer = match stream.try_clone() {
        Ok(writer) => writer,
        Err(why) => {
            warn!(%why, "failed to clone control connection");
            return;
        }
    };

    for line in BufReader::new(stream).lines() {
        let Ok(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => {
                debug!(?request, "control request");
                answer(request, forward)
            }
            Err(why) => Response::error(ErrorKind::BadRequest, why),
        };

        let written = serde_json::to_string(&response)
            .map_err(io::Error::from)
            .and_then(|json| writeln!(writer, "{json}"));
        if written.is_err() {
            break;
        }
    }
}

/// Send one request to the daemon listening on `path` and wait for its answer.
///
/// # Errors
///
/// Fails when no daemon listens on `path` or the connection breaks.
pub fn send(path: &Path, request: &Request) -> io::Result<Response> {
    let mut stream = UnixStream::connect(path)?;
    stream.set_read_timeout(Some(REPLY_TIMEOUT + Duration::from_secs(1)))?;

    let json = serde_json::to_string(request)?;
    writeln!(stream, "{json}")?;

    let mut line = String::new();
    BufReader::new(stream).read_line(&mut line)?;
    if line.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "daemon closed the connection",
        ));
    }
    Ok(serde_json::from_str(&line)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo(call: IpcCall) -> bool {
        let response = match &call.request {
            Request::Ping => Response::Pong,
            Request::Remove { output } => {
                Response::error(ErrorKind::NoAssignment, format!("no wallpaper on {output}"))
            }
            _ => Response::Ok,
        };
        call.reply(response);
        true
    }

    #[test]
    fn test_request_wire_format() {
        let apply = Request::Apply {
            output: MonitorId::new("DP-1"),
            source: "/videos/loop.mp4".into(),
        };
        assert_eq!(
            serde_json::to_string(&apply).unwrap(),
            r#"{"cmd":"Apply","value":{"output":"DP-1","source":"/videos/loop.mp4"}}"#
        );
        assert_eq!(serde_json::to_string(&Request::Ping).unwrap(), r#"{"cmd":"Ping"}"#);
        assert_eq!(
            serde_json::from_str::<Request>(r#"{"cmd":"SetPowerSave","value":false}"#).unwrap(),
            Request::SetPowerSave(false)
        );
    }

    #[test]
    fn test_error_response_wire_format() {
        let response = Response::error(ErrorKind::SourceLoad, "missing file");
        assert_eq!(
            serde_json::to_string(&response).unwrap(),
            r#"{"reply":"Error","value":{"kind":"source-load","message":"missing file"}}"#
        );
    }

    #[test]
    fn test_round_trip_through_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live-bg.sock");
        let mut server = IpcServer::start(path.clone(), echo).unwrap();

        assert_eq!(send(&path, &Request::Ping).unwrap(), Response::Pong);
        assert_eq!(send(&path, &Request::PauseAll).unwrap(), Response::Ok);
        match send(&path, &Request::Remove { output: "HDMI-A-1".into() }).unwrap() {
            Response::Error { kind, .. } => assert_eq!(kind, ErrorKind::NoAssignment),
            other => panic!("unexpected response {other:?}"),
        }

        server.stop();
        assert!(!path.exists());
        assert!(send(&path, &Request::Ping).is_err());
    }

    #[test]
    fn test_malformed_request_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live-bg.sock");
        let _server = IpcServer::start(path.clone(), echo).unwrap();

        let mut stream = UnixStream::connect(&path).unwrap();
        writeln!(stream, r#"{{"cmd":"Explode"}}"#).unwrap();
        let mut line = String::new();
        BufReader::new(stream).read_line(&mut line).unwrap();
        match serde_json::from_str::<Response>(&line).unwrap() {
            Response::Error { kind, .. } => assert_eq!(kind, ErrorKind::BadRequest),
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[test]
    fn test_closed_engine_answers_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live-bg.sock");
        let _server = IpcServer::start(path.clone(), |_call| false).unwrap();

        match send(&path, &Request::Status).unwrap() {
            Response::Error { kind, .. } => assert_eq!(kind, ErrorKind::Unavailable),
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[test]
    fn test_second_instance_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live-bg.sock");
        let _server = IpcServer::start(path.clone(), echo).unwrap();

        let err = IpcServer::start(path, echo).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
    }
}
