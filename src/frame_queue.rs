// SPDX-License-Identifier: MPL-2.0

//! Bounded hand-off of decoded frames from a playback session to its surface.
//!
//! The decoder thread pushes, the Wayland thread pulls on frame callbacks.
//! Neither side waits on the other: a full queue drops its oldest frame and an
//! empty queue yields nothing, leaving the last attached buffer on screen.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Frames buffered between decoder and renderer.
pub const DEFAULT_QUEUE_CAPACITY: usize = 3;

/// One decoded frame in BGRx layout.
#[derive(Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Bytes per row of `data`.
    pub stride: u32,
    /// Presentation timestamp in nanoseconds, when the decoder provides one.
    pub pts_ns: Option<u64>,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("bytes", &self.data.len())
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .field("pts_ns", &self.pts_ns)
            .finish()
    }
}

impl Frame {
    #[must_use]
    pub fn new(data: Vec<u8>, width: u32, height: u32, pts_ns: Option<u64>) -> Self {
        Self {
            data,
            width,
            height,
            stride: width * 4,
            pts_ns,
        }
    }

    /// Copy the frame into a `width * 4` strided destination, row by row.
    ///
    /// Rows and columns that do not fit are cropped. Returns the number of rows copied.
    pub fn copy_into(&self, dest: &mut [u8], dest_width: u32, dest_height: u32) -> usize {
        let dest_stride = dest_width as usize * 4;
        let src_stride = self.stride as usize;
        let row_bytes = dest_stride.min(self.width as usize * 4);
        let rows = dest_height.min(self.height) as usize;

        let mut copied = 0;
        for row in 0..rows {
            let src_start = row * src_stride;
            let dst_start = row * dest_stride;
            let (Some(src), Some(dst)) = (
                self.data.get(src_start..src_start + row_bytes),
                dest.get_mut(dst_start..dst_start + row_bytes),
            ) else {
                break;
            };
            dst.copy_from_slice(src);
            copied += 1;
        }
        copied
    }
}

/// Counters for debugging playback smoothness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pushed: u64,
    /// Dropped by the producer because the queue was full.
    pub dropped: u64,
    /// Skipped by the consumer because a newer frame was already queued.
    pub skipped: u64,
    pub taken: u64,
}

#[derive(Debug)]
pub struct FrameQueue {
    frames: Mutex<VecDeque<Frame>>,
    capacity: usize,
    closed: AtomicBool,
    pushed: AtomicU64,
    dropped: AtomicU64,
    skipped: AtomicU64,
    taken: AtomicU64,
}

impl FrameQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            closed: AtomicBool::new(false),
            pushed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            taken: AtomicU64::new(0),
        }
    }

    /// Queue a frame, dropping the oldest one if full.
    ///
    /// Returns `false` once the queue is closed or when the lock is contended;
    /// the decoder never waits for the renderer.
    pub fn push(&self, frame: Frame) -> bool {
        if self.is_closed() {
            return false;
        }

        let Ok(mut frames) = self.frames.try_lock() else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        };

        if frames.len() >= self.capacity {
            frames.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        frames.push_back(frame);
        self.pushed.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Take the newest queued frame, discarding any older ones.
    pub fn take_latest(&self) -> Option<Frame> {
        let mut frames = self.frames.lock().ok()?;
        let latest = frames.pop_back()?;
        self.skipped
            .fetch_add(frames.len() as u64, Ordering::Relaxed);
        frames.clear();
        self.taken.fetch_add(1, Ordering::Relaxed);
        Some(latest)
    }

    /// Stop accepting frames and drop the queued ones.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Ok(mut frames) = self.frames.lock() {
            frames.clear();
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pushed: self.pushed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            taken: self.taken.load(Ordering::Relaxed),
        }
    }
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

/// Shared handle to a frame queue.
pub type SharedFrameQueue = Arc<FrameQueue>;

#[must_use]
pub fn new_shared_queue(capacity: usize) -> SharedFrameQueue {
    Arc::new(FrameQueue::new(capacity))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(pts: u64) -> Frame {
        Frame::new(vec![pts as u8; 4], 1, 1, Some(pts))
    }

    #[test]
    fn test_push_take() {
        let queue = FrameQueue::new(3);
        assert!(queue.push(frame(1)));
        assert_eq!(queue.stats().pushed, 1);

        let taken = queue.take_latest().unwrap();
        assert_eq!(taken.pts_ns, Some(1));
        assert!(queue.take_latest().is_none());
    }

    #[test]
    fn test_full_queue_drops_oldest() {
        let queue = FrameQueue::new(2);
        queue.push(frame(1));
        queue.push(frame(2));
        queue.push(frame(3));
        assert_eq!(queue.stats().dropped, 1);

        assert_eq!(queue.take_latest().unwrap().pts_ns, Some(3));
        assert_eq!(queue.stats().skipped, 1);
    }

    #[test]
    fn test_take_latest_skips_stale_frames() {
        let queue = FrameQueue::new(3);
        queue.push(frame(1));
        queue.push(frame(2));
        queue.push(frame(3));

        assert_eq!(queue.take_latest().unwrap().pts_ns, Some(3));
        let stats = queue.stats();
        assert_eq!(stats.skipped, 2);
        assert_eq!(stats.taken, 1);
        assert_eq!(stats.pushed, 3);
    }

    #[test]
    fn test_close_rejects_push() {
        let queue = FrameQueue::new(2);
        queue.push(frame(1));
        queue.close();

        assert!(queue.is_closed());
        assert!(queue.take_latest().is_none());
        assert!(!queue.push(frame(2)));
    }

    #[test]
    fn test_copy_into_crops_to_destination() {
        // 2x2 source with a padded stride of 12 bytes.
        let mut data = vec![0u8; 24];
        data[..8].copy_from_slice(&[1, 1, 1, 1, 2, 2, 2, 2]);
        data[12..20].copy_from_slice(&[3, 3, 3, 3, 4, 4, 4, 4]);
        let frame = Frame {
            data,
            width: 2,
            height: 2,
            stride: 12,
            pts_ns: None,
        };

        let mut dest = [0u8; 4];
        assert_eq!(frame.copy_into(&mut dest, 1, 1), 1);
        assert_eq!(dest, [1, 1, 1, 1]);

        let mut dest = [0u8; 16];
        assert_eq!(frame.copy_into(&mut dest, 2, 2), 2);
        assert_eq!(&dest[8..], &[3, 3, 3, 3, 4, 4, 4, 4]);
    }
}
