//! Daedalus mission service daemon

use std::time::Duration;

use color_eyre::Result;
use flume::bounded;
use tracing::{debug, error, info};

use daedalus::capture::source::FrameSource;
use daedalus::capture::{FrameHandle, SyntheticDepthSource};
use daedalus::service::MissionService;
use daedalus::telemetry::{PositionSample, SimPositionSource};
use daedalus::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter("daedalus=debug")
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Daedalus launching...");

    // Optional TOML config path as the first argument
    let config = Config::load(std::env::args().nth(1).as_deref())?;

    let mut source = SyntheticDepthSource::new(config.capture.clone());
    let pool = source.pool();

    // Set up tx/rx
    let (tx, rx) = bounded::<FrameHandle>(config.stage.channel_capacity);

    // Spawn capture task
    let frame_interval = Duration::from_secs(1) / config.capture.fps.max(1);
    let _capture_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(frame_interval);
        loop {
            ticker.tick().await;
            match source.next_frame() {
                Ok(frame) => {
                    if tx.send_async(frame).await.is_err() {
                        error!("Failed to send frame: receiver gone");
                        break;
                    }
                }
                Err(e) => error!("Capture error: {}", e),
            }
        }
    });

    let position = Box::new(SimPositionSource::new(
        PositionSample::default(),
        PositionSample {
            x: 0.02,
            y: 0.0,
            z: 0.0,
        },
    ));
    let (mut service, outputs) = MissionService::new(&config.service, position);

    // Stand-in for the telemetry and message-hub publishers
    let stats_rx = outputs.stats;
    let events_rx = outputs.events;
    tokio::spawn(async move {
        while let Ok(stats) = stats_rx.recv_async().await {
            debug!(depth_mean = stats.depth_mean, "telemetry sample");
        }
    });
    tokio::spawn(async move {
        while let Ok(event) = events_rx.recv_async().await {
            info!(?event, "mission event published");
        }
    });

    tokio::select! {
        res = service.run(rx) => res?,
        _ = tokio::signal::ctrl_c() => info!("ctrl-c received"),
    }
    service.shutdown();

    let stats = service.stage_stats();
    info!(
        submitted = stats.submitted,
        dropped = stats.dropped,
        computed = stats.computed,
        collected = stats.collected,
        live_frames = pool.live(),
        "final stage stats"
    );

    info!("Daedalus shutting down");
    Ok(())
}
