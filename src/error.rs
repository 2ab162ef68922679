// SPDX-License-Identifier: MPL-2.0

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::topology::MonitorId;

/// Failures of one playback session. They never affect other monitors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("cannot open video source {}: {reason}", path.display())]
    SourceLoad { path: PathBuf, reason: String },
    #[error("playback backend lost: {0}")]
    BackendLost(String),
    #[error("cannot bind playback to the monitor surface: {0}")]
    SurfaceBind(String),
    #[error("session already destroyed")]
    Destroyed,
}

impl SessionError {
    pub fn source_load(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::SourceLoad {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SourceLoad { .. } => ErrorKind::SourceLoad,
            Self::BackendLost(_) | Self::Destroyed => ErrorKind::BackendLost,
            Self::SurfaceBind(_) => ErrorKind::SurfaceBind,
        }
    }
}

/// Typed failure of a control call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("no wallpaper assigned to {0}")]
    NoAssignment(MonitorId),
    #[error("engine unavailable: {0}")]
    Unavailable(String),
}

impl ControlError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Session(err) => err.kind(),
            Self::NoAssignment(_) => ErrorKind::NoAssignment,
            Self::Unavailable(_) => ErrorKind::Unavailable,
        }
    }
}

/// Stable error categories reported over the control socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    SourceLoad,
    NoAssignment,
    SurfaceBind,
    BackendLost,
    Unavailable,
    BadRequest,
}
