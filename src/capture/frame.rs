use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Captured frame with zero-copy semantics
///
/// Plane payloads are immutable after capture, so a frame can be read from
/// the worker thread without copying or locking.
pub struct Frame {
    /// Monotonically increasing capture sequence number
    pub seq: u64,

    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,

    /// One or more image planes (depth frames carry a single f32 plane)
    pub planes: Vec<FramePlane>,

    /// Capture timestamp for latency tracking
    pub timestamp: Instant,

    /// Hardware timestamp if available
    pub device_timestamp: Option<Duration>,
}

/// One image plane: immutable payload plus row stride in bytes
#[derive(Clone)]
pub struct FramePlane {
    pub data: Bytes,
    pub stride: u32,
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 32-bit float depth, meters
    Depth32f,
    Gray8,
    Nv21,
}

impl PixelFormat {
    /// Bytes per sample of the first plane
    pub fn sample_size(&self) -> usize {
        match self {
            PixelFormat::Depth32f => 4,
            PixelFormat::Gray8 | PixelFormat::Nv21 => 1,
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("seq", &self.seq)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("planes", &self.planes.len())
            .finish()
    }
}

/// Told when a [`FrameHandle`] goes out of scope.
///
/// Implemented by whatever allocated the frame (a capture pool, a video IPC
/// client). Called exactly once per accepted frame.
pub trait FrameReleaser: Send + Sync {
    fn release(&self, frame: &Frame);
}

/// Move-only owning handle for a captured frame.
///
/// Holding the handle is holding the obligation to release the frame; the
/// release happens exactly once, on drop. There is deliberately no `Clone`:
/// ownership moves with the handle, through `submit` and into the worker.
pub struct FrameHandle {
    frame: Arc<Frame>,
    releaser: Arc<dyn FrameReleaser>,
}

impl FrameHandle {
    pub fn new(frame: Arc<Frame>, releaser: Arc<dyn FrameReleaser>) -> Self {
        Self { frame, releaser }
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }
}

impl Drop for FrameHandle {
    fn drop(&mut self) {
        self.releaser.release(&self.frame);
    }
}

impl fmt::Debug for FrameHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FrameHandle").field(&self.frame).finish()
    }
}

/// Live-count releaser backing the synthetic source.
///
/// Tracks how many handed-out frames are still unreleased; a non-zero count
/// after shutdown means a leaked handle somewhere. Clones share the count.
#[derive(Default, Clone)]
pub struct FramePool {
    shared: Arc<PoolShared>,
}

#[derive(Default)]
struct PoolShared {
    live: AtomicUsize,
}

impl FramePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a freshly captured frame into an owning handle
    pub fn checkout(&self, frame: Frame) -> FrameHandle {
        self.shared.live.fetch_add(1, Ordering::Relaxed);
        FrameHandle::new(
            Arc::new(frame),
            Arc::clone(&self.shared) as Arc<dyn FrameReleaser>,
        )
    }

    /// Frames handed out and not yet released
    pub fn live(&self) -> usize {
        self.shared.live.load(Ordering::Relaxed)
    }
}

impl FrameReleaser for PoolShared {
    fn release(&self, frame: &Frame) {
        let prev = self.live.fetch_sub(1, Ordering::Relaxed);
        if prev == 0 {
            warn!(seq = frame.seq, "frame released with zero live count");
        }
    }
}
