//! Mission service: the event loop around the processing stage
//!
//! Owns the stage, the position input and the outbound channels. One
//! explicit object, constructed in `main` and passed down; no process-wide
//! state.

pub mod depth;

use std::sync::Arc;

use color_eyre::Result;
use flume::{Receiver, Sender};
use metrics::counter;
use tracing::{debug, info, warn};

use crate::capture::frame::FrameHandle;
use crate::service::depth::{DepthAnalyzer, DepthStats, ProximityEvent, ProximityMonitor};
use crate::stage::notify::{CompletionNotifier, CompletionSink};
use crate::stage::processing::{
    AuxContext, PendingInput, ProcessingStage, StageError, StageStats,
};
use crate::telemetry::PositionSource;
use crate::ServiceConfig;

/// Receiving ends of the service fan-out, consumed by telemetry glue
pub struct ServiceOutputs {
    pub stats: Receiver<DepthStats>,
    pub events: Receiver<ProximityEvent>,
}

pub struct MissionService {
    stage: ProcessingStage<DepthAnalyzer>,
    notifier: Arc<CompletionNotifier>,
    position: Box<dyn PositionSource>,
    monitor: ProximityMonitor,
    stats_tx: Sender<DepthStats>,
    events_tx: Sender<ProximityEvent>,
}

impl MissionService {
    pub fn new(config: &ServiceConfig, position: Box<dyn PositionSource>) -> (Self, ServiceOutputs) {
        let notifier = CompletionNotifier::new();
        let stage = ProcessingStage::new(
            DepthAnalyzer,
            Arc::clone(&notifier) as Arc<dyn CompletionSink>,
        );
        let (stats_tx, stats_rx) = flume::bounded(config.channel_capacity);
        let (events_tx, events_rx) = flume::bounded(config.channel_capacity);

        let service = Self {
            stage,
            notifier,
            position,
            monitor: ProximityMonitor::new(config.close_threshold_m, config.far_threshold_m),
            stats_tx,
            events_tx,
        };
        let outputs = ServiceOutputs {
            stats: stats_rx,
            events: events_rx,
        };
        (service, outputs)
    }

    /// Run until the frame channel closes.
    ///
    /// Each incoming frame is submitted with the freshest position sample;
    /// each completion wakeup collects the newest result and fans it out.
    pub async fn run(&mut self, frames: Receiver<FrameHandle>) -> Result<()> {
        self.stage.start()?;
        info!("mission service running");

        let notifier = Arc::clone(&self.notifier);
        loop {
            tokio::select! {
                frame = frames.recv_async() => {
                    match frame {
                        Ok(frame) => self.submit(frame),
                        Err(_) => break, // source gone
                    }
                }
                _ = notifier.notified() => self.collect(),
            }
        }

        self.stage.stop();
        info!("mission service stopped");
        Ok(())
    }

    /// Stop the stage worker; safe to call after `run` was cancelled
    pub fn shutdown(&mut self) {
        self.stage.stop();
    }

    pub fn stage_stats(&self) -> StageStats {
        self.stage.stats()
    }

    fn submit(&mut self, frame: FrameHandle) {
        let ctx = AuxContext {
            position: self.position.latest(),
        };
        if let Err(rejected) = self.stage.submit(PendingInput { frame, ctx }) {
            // Dropping the returned input releases the frame
            warn!(error = %rejected.reason, "frame not accepted");
            counter!("daedalus_frames_rejected").increment(1);
        }
    }

    fn collect(&mut self) {
        let stats = match self.stage.collect() {
            Ok(stats) => stats,
            // The wakeup can race a newer publish; nothing to do
            Err(StageError::NotAvailable) => return,
            Err(err) => {
                warn!(error = %err, "collect failed");
                return;
            }
        };

        debug!(
            depth_mean = stats.depth_mean,
            valid_ratio = stats.valid_ratio,
            "depth stats"
        );
        if let Some(event) = self.monitor.update(&stats) {
            info!(?event, depth_mean = stats.depth_mean, "proximity event");
            counter!("daedalus_proximity_events").increment(1);
            if self.events_tx.try_send(event).is_err() {
                debug!("event channel full, consumer lagging");
            }
        }
        let _ = self.stats_tx.try_send(stats);
    }
}
