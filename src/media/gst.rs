// SPDX-License-Identifier: MPL-2.0

//! GStreamer playback backend.
//!
//! Each handle owns a `playbin` whose video sink is a small bin cropping the
//! decoded stream to the monitor's aspect ratio and scaling it to fill the
//! monitor in BGRx, so no black bars are drawn:
//!
//! ```text
//! playbin ─▶ videoconvert ! aspectratiocrop ! videoscale ! capsfilter(BGRx, WxH) ! appsink ─▶ FrameQueue
//!         └▶ autoaudiosink (volume and mute on playbin)
//! ```
//!
//! A bus thread per handle loops the video on end-of-stream, keeping the
//! playback rate, and records pipeline errors for the liveness check.

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};

use gstreamer::prelude::*;
use tracing::{debug, error, info, warn};

use crate::{
    error::SessionError,
    frame_queue::{Frame, SharedFrameQueue},
    session::{MediaBackend, MediaHandle, SurfaceBinding},
};

const PREROLL_TIMEOUT: gstreamer::ClockTime = gstreamer::ClockTime::from_seconds(5);
const BUS_POLL: gstreamer::ClockTime = gstreamer::ClockTime::from_mseconds(200);

const VIDEO_SINK: &str = concat!(
    "videoconvert ! aspectratiocrop name=crop ! videoscale add-borders=false ! ",
    "capsfilter name=size caps=video/x-raw,format=BGRx ! ",
    "appsink name=sink sync=true max-buffers=4 drop=true"
);

#[derive(Debug)]
pub struct GstBackend;

impl GstBackend {
    /// Initialize GStreamer once for the process.
    ///
    /// # Errors
    ///
    /// Fails when the GStreamer libraries cannot be initialized.
    pub fn new() -> Result<Self, gstreamer::glib::Error> {
        gstreamer::init()?;
        demote_broken_nvidia_decoders();
        Ok(Self)
    }
}

/// Hide NVIDIA decoders that are registered but cannot run (no CUDA), so
/// `decodebin` falls back to working decoders.
fn demote_broken_nvidia_decoders() {
    static DEMOTED: std::sync::Once = std::sync::Once::new();

    DEMOTED.call_once(|| {
        for name in ["nvh264dec", "nvh265dec", "nvvp9dec", "nvav1dec"] {
            let Some(factory) = gstreamer::ElementFactory::find(name) else {
                continue;
            };
            if factory.create().build().is_err() {
                warn!(decoder = name, "decoder failed to instantiate, demoting");
                factory.set_rank(gstreamer::Rank::NONE);
            }
        }
    });
}

/// First error message waiting on the bus, if any.
fn bus_error(pipeline: &gstreamer::Element) -> Option<String> {
    let bus = pipeline.bus()?;
    while let Some(msg) = bus.pop() {
        if let gstreamer::MessageView::Error(err) = msg.view() {
            return Some(err.error().to_string());
        }
    }
    None
}

/// `width:height` in lowest terms.
fn reduced_aspect(width: i32, height: i32) -> (i32, i32) {
    let (mut a, mut b) = (width, height);
    while b != 0 {
        (a, b) = (b, a % b);
    }
    if a == 0 {
        return (width, height);
    }
    (width / a, height / a)
}

/// Flushing seek to `position` that also sets the playback rate.
fn seek_at_rate(
    pipeline: &gstreamer::Element,
    rate: f64,
    position: gstreamer::ClockTime,
) -> Result<(), gstreamer::glib::BoolError> {
    pipeline.seek(
        rate,
        gstreamer::SeekFlags::FLUSH | gstreamer::SeekFlags::KEY_UNIT,
        gstreamer::SeekType::Set,
        position,
        gstreamer::SeekType::None,
        gstreamer::ClockTime::NONE,
    )
}

fn source_error(path: &Path, why: impl ToString) -> SessionError {
    SessionError::source_load(path, why)
}

impl MediaBackend for GstBackend {
    fn open(&self, source: &Path) -> Result<Box<dyn MediaHandle>, SessionError> {
        let path = source
            .canonicalize()
            .map_err(|why| source_error(source, why))?;
        let uri = gstreamer::glib::filename_to_uri(&path, None)
            .map_err(|why| source_error(source, why))?;

        let playbin = gstreamer::ElementFactory::make("playbin")
            .property("uri", uri.as_str())
            .build()
            .map_err(|why| source_error(source, why))?;

        let video_sink = gstreamer::parse::bin_from_description(VIDEO_SINK, true)
            .map_err(|why| source_error(source, why))?;
        let appsink = video_sink
            .by_name("sink")
            .and_then(|sink| sink.downcast::<gstreamer_app::AppSink>().ok())
            .ok_or_else(|| source_error(source, "video sink has no appsink"))?;
        let capsfilter = video_sink
            .by_name("size")
            .ok_or_else(|| source_error(source, "video sink has no capsfilter"))?;
        let crop = video_sink
            .by_name("crop")
            .ok_or_else(|| source_error(source, "video sink has no aspectratiocrop"))?;
        playbin.set_property("video-sink", &video_sink);

        let target = Arc::new(Mutex::new(None::<SharedFrameQueue>));
        install_sample_callback(&appsink, Arc::clone(&target));

        // Preroll to find out whether the file decodes at all.
        let prerolled = playbin.set_state(gstreamer::State::Paused).is_ok() && {
            let (result, state, _) = playbin.state(PREROLL_TIMEOUT);
            result.is_ok() && state == gstreamer::State::Paused
        };
        if !prerolled {
            let reason = bus_error(&playbin).unwrap_or_else(|| "cannot be decoded".into());
            let _ = playbin.set_state(gstreamer::State::Null);
            return Err(source_error(source, reason));
        }

        debug!(path = %path.display(), "video prerolled");

        let failure = Arc::new(Mutex::new(None::<String>));
        let stop = Arc::new(AtomicBool::new(false));
        let rate = Arc::new(AtomicU64::new(1.0_f64.to_bits()));
        let bus_thread = spawn_bus_watch(&playbin, path.clone(), &failure, &stop, &rate)
            .map_err(|why| source_error(source, why))?;

        Ok(Box::new(GstHandle {
            path,
            playbin,
            capsfilter,
            crop,
            target,
            rate,
            failure,
            stop,
            bus_thread: Some(bus_thread),
        }))
    }
}

fn install_sample_callback(
    appsink: &gstreamer_app::AppSink,
    target: Arc<Mutex<Option<SharedFrameQueue>>>,
) {
    appsink.set_callbacks(
        gstreamer_app::AppSinkCallbacks::builder()
            .new_sample(move |appsink| {
                let Ok(sample) = appsink.pull_sample() else {
                    return Ok(gstreamer::FlowSuccess::Ok);
                };
                let (Some(buffer), Some(caps)) = (sample.buffer(), sample.caps()) else {
                    return Ok(gstreamer::FlowSuccess::Ok);
                };
                let Ok(info) = gstreamer_video::VideoInfo::from_caps(caps) else {
                    return Ok(gstreamer::FlowSuccess::Ok);
                };
                let Ok(map) = buffer.map_readable() else {
                    tracing::trace!("skipped frame: buffer map failed");
                    return Ok(gstreamer::FlowSuccess::Ok);
                };

                let frame = Frame {
                    data: map.as_slice().to_vec(),
                    width: info.width(),
                    height: info.height(),
                    stride: info.stride()[0].unsigned_abs(),
                    pts_ns: buffer.pts().map(|pts| pts.nseconds()),
                };

                // The renderer never blocks the streaming thread.
                if let Ok(target) = target.try_lock() {
                    if let Some(queue) = target.as_ref() {
                        queue.push(frame);
                    }
                }
                Ok(gstreamer::FlowSuccess::Ok)
            })
            .build(),
    );
}

fn spawn_bus_watch(
    pipeline: &gstreamer::Element,
    path: PathBuf,
    failure: &Arc<Mutex<Option<String>>>,
    stop: &Arc<AtomicBool>,
    rate: &Arc<AtomicU64>,
) -> std::io::Result<thread::JoinHandle<()>> {
    let bus = pipeline
        .bus()
        .ok_or_else(|| std::io::Error::other("pipeline has no bus"))?;
    let pipeline = pipeline.clone();
    let failure = Arc::clone(failure);
    let stop = Arc::clone(stop);
    let rate = Arc::clone(rate);
    let loops = AtomicU32::new(0);

    thread::Builder::new()
        .name("video-bus".into())
        .spawn(move || {
            while !stop.load(Ordering::Acquire) {
                let Some(msg) = bus.timed_pop(BUS_POLL) else {
                    continue;
                };
                match msg.view() {
                    gstreamer::MessageView::Eos(_) => {
                        let loop_num = loops.fetch_add(1, Ordering::Relaxed) + 1;
                        let rate = f64::from_bits(rate.load(Ordering::Acquire));
                        debug!(loop_num, rate, path = %path.display(), "end of stream, seeking to start");
                        if let Err(why) = seek_at_rate(&pipeline, rate, gstreamer::ClockTime::ZERO) {
                            error!(?why, path = %path.display(), "failed to loop video");
                            if let Ok(mut failure) = failure.lock() {
                                failure.get_or_insert_with(|| "seek to start failed".into());
                            }
                        }
                    }
                    gstreamer::MessageView::Error(err) => {
                        error!(
                            src = ?err.src().map(|s| s.path_string()),
                            error = %err.error(),
                            "GStreamer pipeline error"
                        );
                        if let Ok(mut failure) = failure.lock() {
                            failure.get_or_insert_with(|| err.error().to_string());
                        }
                    }
                    gstreamer::MessageView::Warning(warning) => {
                        warn!(
                            src = ?warning.src().map(|s| s.path_string()),
                            error = %warning.error(),
                            "GStreamer pipeline warning"
                        );
                    }
                    _ => {}
                }
            }
        })
}

pub struct GstHandle {
    path: PathBuf,
    playbin: gstreamer::Element,
    capsfilter: gstreamer::Element,
    crop: gstreamer::Element,
    target: Arc<Mutex<Option<SharedFrameQueue>>>,
    /// Current playback rate as `f64` bits, shared with the bus thread.
    rate: Arc<AtomicU64>,
    failure: Arc<Mutex<Option<String>>>,
    stop: Arc<AtomicBool>,
    bus_thread: Option<thread::JoinHandle<()>>,
}

impl GstHandle {
    fn set_state(&self, state: gstreamer::State) -> Result<(), SessionError> {
        self.playbin
            .set_state(state)
            .map(|_| ())
            .map_err(|why| SessionError::BackendLost(format!("{state:?}: {why}")))
    }
}

impl MediaHandle for GstHandle {
    fn bind_to_surface(&mut self, surface: &SurfaceBinding) -> Result<(), SessionError> {
        let (Ok(width), Ok(height)) = (i32::try_from(surface.width), i32::try_from(surface.height))
        else {
            return Err(SessionError::SurfaceBind(format!(
                "invalid surface size {}x{}",
                surface.width, surface.height
            )));
        };
        if width == 0 || height == 0 {
            return Err(SessionError::SurfaceBind("surface has no size".into()));
        }

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "BGRx")
            .field("width", width)
            .field("height", height)
            .field("pixel-aspect-ratio", gstreamer::Fraction::new(1, 1))
            .build();
        let (num, den) = reduced_aspect(width, height);
        self.crop
            .set_property("aspect-ratio", gstreamer::Fraction::new(num, den));
        self.capsfilter.set_property("caps", &caps);

        let mut target = self
            .target
            .lock()
            .map_err(|_| SessionError::SurfaceBind("frame target poisoned".into()))?;
        *target = Some(Arc::clone(&surface.frames));

        info!(
            output = %surface.monitor,
            path = %self.path.display(),
            width, height,
            "video bound to surface"
        );
        Ok(())
    }

    fn play(&mut self) -> Result<(), SessionError> {
        self.set_state(gstreamer::State::Playing)
    }

    fn pause(&mut self) -> Result<(), SessionError> {
        self.set_state(gstreamer::State::Paused)
    }

    fn set_volume(&mut self, volume: f64) {
        self.playbin.set_property("volume", volume.clamp(0.0, 1.0));
    }

    fn set_mute(&mut self, muted: bool) {
        self.playbin.set_property("mute", muted);
    }

    fn set_rate(&mut self, rate: f64) -> Result<(), SessionError> {
        let position = self
            .playbin
            .query_position::<gstreamer::ClockTime>()
            .unwrap_or(gstreamer::ClockTime::ZERO);
        seek_at_rate(&self.playbin, rate, position)
            .map_err(|why| SessionError::BackendLost(format!("rate {rate}: {why}")))?;
        self.rate.store(rate.to_bits(), Ordering::Release);
        debug!(path = %self.path.display(), rate, "playback rate set");
        Ok(())
    }

    fn check_alive(&mut self, timeout: Duration) -> Result<(), SessionError> {
        if let Some(why) = self.failure.lock().ok().and_then(|failure| failure.clone()) {
            return Err(SessionError::BackendLost(why));
        }

        let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let (result, state, _) = self
            .playbin
            .state(gstreamer::ClockTime::from_mseconds(millis));
        match result {
            Err(why) => Err(SessionError::BackendLost(why.to_string())),
            Ok(_) if state == gstreamer::State::Null => {
                Err(SessionError::BackendLost("pipeline stopped".into()))
            }
            Ok(_) => Ok(()),
        }
    }

    fn close(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Err(why) = self.playbin.set_state(gstreamer::State::Null) {
            error!(?why, path = %self.path.display(), "failed to stop video pipeline");
        }
        if let Ok(mut target) = self.target.lock() {
            target.take();
        }
        if let Some(join) = self.bus_thread.take() {
            let _ = join.join();
        }
    }
}

impl Drop for GstHandle {
    fn drop(&mut self) {
        if self.bus_thread.is_some() {
            self.close();
        }
    }
}
