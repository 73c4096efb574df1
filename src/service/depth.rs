//! Depth statistics computation and proximity eventing
//!
//! The injected per-frame computation of this service: a masked mean over
//! the f32 depth plane, plus the close/far threshold crossing logic the
//! event loop turns into mission events.

use std::time::Instant;

use tracing::warn;

use crate::capture::frame::{Frame, PixelFormat};
use crate::stage::processing::{AuxContext, FrameProcessor};

/// Output of one depth compute pass
#[derive(Debug, Clone, Copy)]
pub struct DepthStats {
    /// Vehicle position at capture time
    pub x: f32,
    pub y: f32,
    pub z: f32,
    /// Mean distance over valid samples, meters
    pub depth_mean: f32,
    /// Share of samples that were valid
    pub valid_ratio: f32,
    pub confidence: f32,
    /// Capture timestamp of the frame that produced these stats
    pub timestamp: Instant,
}

/// Masked mean over the f32 depth plane.
///
/// Negative and non-finite samples are excluded; the depth sensor emits
/// those for unknown regions.
pub struct DepthAnalyzer;

impl FrameProcessor for DepthAnalyzer {
    type Output = DepthStats;

    fn process(&mut self, frame: &Frame, ctx: &AuxContext) -> DepthStats {
        let mut sum = 0.0f64;
        let mut valid = 0usize;
        let mut total = 0usize;

        if frame.format != PixelFormat::Depth32f {
            warn!(format = ?frame.format, "unexpected pixel format for depth analysis");
        } else if let Some(plane) = frame.planes.first() {
            let stride = plane.stride as usize;
            let row_bytes = frame.width as usize * frame.format.sample_size();
            for row in 0..frame.height as usize {
                let Some(line) = plane.data.get(row * stride..row * stride + row_bytes) else {
                    warn!(row, "depth plane shorter than advertised");
                    break;
                };
                for sample in line.chunks_exact(4) {
                    let depth = f32::from_ne_bytes([sample[0], sample[1], sample[2], sample[3]]);
                    total += 1;
                    if depth >= 0.0 && depth.is_finite() {
                        sum += f64::from(depth);
                        valid += 1;
                    }
                }
            }
        }

        DepthStats {
            x: ctx.position.x,
            y: ctx.position.y,
            z: ctx.position.z,
            depth_mean: if valid > 0 {
                (sum / valid as f64) as f32
            } else {
                0.0
            },
            valid_ratio: if total > 0 {
                valid as f32 / total as f32
            } else {
                0.0
            },
            confidence: if valid > 0 { 1.0 } else { 0.0 },
            timestamp: frame.timestamp,
        }
    }
}

/// Mission events derived from the depth mean
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProximityEvent {
    /// Scene came nearer than the close threshold
    Close,
    /// Scene receded past the far threshold
    Far,
}

/// Close/far threshold crossing with hysteresis.
///
/// `close_m` must be below `far_m`; the band between them suppresses event
/// chatter around a single threshold.
#[derive(Debug)]
pub struct ProximityMonitor {
    close_m: f32,
    far_m: f32,
    is_close: bool,
}

impl ProximityMonitor {
    pub fn new(close_m: f32, far_m: f32) -> Self {
        Self {
            close_m,
            far_m,
            is_close: false,
        }
    }

    /// Feed one compute result; emits at most one event per crossing
    pub fn update(&mut self, stats: &DepthStats) -> Option<ProximityEvent> {
        if stats.confidence <= 0.0 {
            return None;
        }
        if !self.is_close && stats.depth_mean <= self.close_m {
            self.is_close = true;
            return Some(ProximityEvent::Close);
        }
        if self.is_close && stats.depth_mean >= self.far_m {
            self.is_close = false;
            return Some(ProximityEvent::Far);
        }
        None
    }
}
