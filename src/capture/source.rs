//! Synthetic depth capture for sim flights and tests
//!
//! Stands in for the on-board video IPC client: produces deterministic
//! depth frames whose scene distance sweeps toward and away from the
//! vehicle, with a sensor-style band of invalid samples.

use std::time::Instant;

use bytes::Bytes;
use color_eyre::Result;
use tracing::info;

use crate::capture::frame::{Frame, FrameHandle, FramePlane, FramePool, PixelFormat};
use crate::CaptureConfig;

/// Yields owned frames; the handle's release obligation comes with it
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<FrameHandle>;
}

pub struct SyntheticDepthSource {
    config: CaptureConfig,
    pool: FramePool,
    seq: u64,
    started: Instant,
}

impl SyntheticDepthSource {
    pub fn new(config: CaptureConfig) -> Self {
        info!(
            width = config.width,
            height = config.height,
            fps = config.fps,
            "initializing synthetic depth source"
        );
        Self {
            config,
            pool: FramePool::new(),
            seq: 0,
            started: Instant::now(),
        }
    }

    /// The pool backing this source; its live count exposes leaked frames
    pub fn pool(&self) -> FramePool {
        self.pool.clone()
    }

    /// Scene distance for the current phase of the near-far sweep
    fn scene_depth(&self, elapsed_s: f32) -> f32 {
        let period = self.config.sweep_period_s.max(f32::EPSILON);
        let phase = (elapsed_s % period) / period;
        // Triangle wave: far at phase 0, nearest at phase 0.5, far again at 1
        let triangle = if phase < 0.5 {
            1.0 - 2.0 * phase
        } else {
            2.0 * phase - 1.0
        };
        let span = (self.config.depth_max_m - self.config.depth_min_m).max(0.0);
        self.config.depth_min_m + span * triangle
    }
}

impl FrameSource for SyntheticDepthSource {
    fn next_frame(&mut self) -> Result<FrameHandle> {
        let timestamp = Instant::now();
        let width = self.config.width as usize;
        let height = self.config.height as usize;
        let depth = self.scene_depth(self.started.elapsed().as_secs_f32());

        let mut data = Vec::with_capacity(width * height * 4);
        for row in 0..height {
            for col in 0..width {
                let sample = if row == 0 {
                    // Invalid band: unknown regions come out negative or
                    // infinite and must be masked downstream
                    if col % 2 == 0 {
                        -1.0
                    } else {
                        f32::INFINITY
                    }
                } else {
                    // Slight gradient, farther toward the horizon
                    depth + row as f32 * 0.01
                };
                data.extend_from_slice(&sample.to_ne_bytes());
            }
        }

        self.seq += 1;
        let frame = Frame {
            seq: self.seq,
            width: self.config.width,
            height: self.config.height,
            format: PixelFormat::Depth32f,
            planes: vec![FramePlane {
                data: Bytes::from(data),
                stride: self.config.width * 4,
            }],
            timestamp,
            device_timestamp: None,
        };
        Ok(self.pool.checkout(frame))
    }
}
