//! Vehicle position input for the per-frame computation

use serde::{Deserialize, Serialize};

/// Absolute vehicle position in meters
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// Source of the freshest vehicle position.
///
/// Sampled by the event loop right before each submit, so the worker sees
/// the position the vehicle had when the frame was handed over.
pub trait PositionSource: Send {
    fn latest(&mut self) -> PositionSample;
}

/// Scripted position for sim flights and tests
pub struct SimPositionSource {
    position: PositionSample,
    step: PositionSample,
}

impl SimPositionSource {
    pub fn new(start: PositionSample, step: PositionSample) -> Self {
        Self {
            position: start,
            step,
        }
    }
}

impl PositionSource for SimPositionSource {
    fn latest(&mut self) -> PositionSample {
        let current = self.position;
        self.position.x += self.step.x;
        self.position.y += self.step.y;
        self.position.z += self.step.z;
        current
    }
}
