// SPDX-License-Identifier: MPL-2.0

//! Video sources and the playback backend.

#[cfg(feature = "video")]
pub mod gst;

use std::{fs, path::Path, sync::Arc};

use crate::{
    error::SessionError,
    session::{MediaBackend, MediaHandle},
};

/// Container extensions accepted as video wallpapers, compared case-insensitively.
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "webm", "mkv", "avi", "mov", "m4v", "ogv"];

#[must_use]
pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| VIDEO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

/// Cheap synchronous checks run before a source is handed to a session.
///
/// Decoding problems are only found once the backend opens the file.
///
/// # Errors
///
/// [`SessionError::SourceLoad`] when the path is not an existing regular file
/// with a known video extension.
pub fn validate_source(path: &Path) -> Result<(), SessionError> {
    if path.as_os_str().is_empty() {
        return Err(SessionError::source_load(path, "empty path"));
    }
    let metadata = fs::metadata(path).map_err(|why| SessionError::source_load(path, why))?;
    if !metadata.is_file() {
        return Err(SessionError::source_load(path, "not a regular file"));
    }
    if !is_video_file(path) {
        return Err(SessionError::source_load(path, "unsupported file type"));
    }
    Ok(())
}

/// Backend used when the crate is built without the `video` feature.
#[derive(Debug, Default)]
pub struct UnsupportedBackend;

impl MediaBackend for UnsupportedBackend {
    fn open(&self, source: &Path) -> Result<Box<dyn MediaHandle>, SessionError> {
        Err(SessionError::source_load(
            source,
            "no media backend compiled in",
        ))
    }
}

/// The playback backend compiled into this binary.
#[must_use]
pub fn default_backend() -> Arc<dyn MediaBackend> {
    #[cfg(feature = "video")]
    {
        match gst::GstBackend::new() {
            Ok(backend) => return Arc::new(backend),
            Err(why) => tracing::error!(%why, "GStreamer unavailable, video playback disabled"),
        }
    }
    Arc::new(UnsupportedBackend)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_video_file() {
        assert!(is_video_file(Path::new("/a/b.mp4")));
        assert!(is_video_file(Path::new("clip.WebM")));
        assert!(!is_video_file(Path::new("image.png")));
        assert!(!is_video_file(Path::new("noext")));
    }

    #[test]
    fn test_validate_source() {
        let dir = tempfile::tempdir().unwrap();
        let video = dir.path().join("loop.mkv");
        std::fs::write(&video, b"\x1a\x45\xdf\xa3").unwrap();
        assert!(validate_source(&video).is_ok());

        let missing = dir.path().join("missing.mp4");
        assert!(matches!(
            validate_source(&missing),
            Err(SessionError::SourceLoad { .. })
        ));

        let text = dir.path().join("notes.txt");
        std::fs::write(&text, b"hi").unwrap();
        assert!(validate_source(&text).is_err());

        assert!(validate_source(dir.path()).is_err());
        assert!(validate_source(Path::new("")).is_err());
    }

    #[test]
    fn test_unsupported_backend_fails_to_open() {
        let err = UnsupportedBackend.open(Path::new("/a.mp4")).err().unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::SourceLoad);
    }
}
