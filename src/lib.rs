pub mod capture;
pub mod service;
pub mod stage;
pub mod telemetry;

use color_eyre::Result;
use serde::{Deserialize, Serialize};

use crate::capture::frame::PixelFormat;

/// System configuration
///
/// Constructed once in `main` and passed down by reference; there is no
/// process-wide config state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub capture: CaptureConfig,
    pub stage: StageConfig,
    pub service: ServiceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
    /// Nearest scene distance the simulated sweep reaches, meters
    pub depth_min_m: f32,
    pub depth_max_m: f32,
    /// Duration of one full near-far-near sweep, seconds
    pub sweep_period_s: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Capacity of the bounded frame channel into the service loop
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Crossing below this depth mean emits a Close event, meters
    pub close_threshold_m: f32,
    /// Recovering above this depth mean emits a Far event, meters
    pub far_threshold_m: f32,
    /// Capacity of the stats/event fan-out channels
    pub channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capture: CaptureConfig {
                width: 176,
                height: 90,
                fps: 30,
                format: PixelFormat::Depth32f,
                depth_min_m: 0.5,
                depth_max_m: 12.0,
                sweep_period_s: 20.0,
            },
            stage: StageConfig {
                channel_capacity: 4,
            },
            service: ServiceConfig {
                close_threshold_m: 1.5,
                far_threshold_m: 2.5,
                channel_capacity: 16,
            },
        }
    }
}

impl Config {
    /// Load from an optional TOML file layered over the built-in defaults
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        Ok(builder.build()?.try_deserialize()?)
    }
}
