//! End-to-end tests of the processing stage: handoff, drop policy,
//! delivery and ownership accounting.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;

use daedalus::capture::frame::{Frame, FrameHandle, FramePlane, FrameReleaser, PixelFormat};
use daedalus::service::depth::DepthAnalyzer;
use daedalus::stage::notify::{CompletionNotifier, CompletionSink};
use daedalus::stage::processing::{
    AuxContext, FrameProcessor, PendingInput, ProcessingStage, StageError,
};
use daedalus::telemetry::PositionSample;

/// Counts release calls; the live balance must hit zero after stop
#[derive(Default)]
struct TrackingAllocator {
    released: AtomicUsize,
}

impl TrackingAllocator {
    fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

impl FrameReleaser for TrackingAllocator {
    fn release(&self, _frame: &Frame) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

fn depth_frame(seq: u64, samples: &[f32], width: u32) -> Frame {
    let mut data = Vec::with_capacity(samples.len() * 4);
    for sample in samples {
        data.extend_from_slice(&sample.to_ne_bytes());
    }
    Frame {
        seq,
        width,
        height: samples.len() as u32 / width,
        format: PixelFormat::Depth32f,
        planes: vec![FramePlane {
            data: Bytes::from(data),
            stride: width * 4,
        }],
        timestamp: Instant::now(),
        device_timestamp: None,
    }
}

fn handle(allocator: &Arc<TrackingAllocator>, seq: u64) -> FrameHandle {
    FrameHandle::new(
        Arc::new(depth_frame(seq, &[2.0, 2.0, 2.0, 2.0], 2)),
        Arc::clone(allocator) as Arc<dyn FrameReleaser>,
    )
}

fn input(allocator: &Arc<TrackingAllocator>, seq: u64) -> PendingInput {
    PendingInput {
        frame: handle(allocator, seq),
        ctx: AuxContext::default(),
    }
}

/// Forwards publish signals into a channel the test can wait on
struct ChannelSink(flume::Sender<()>);

impl CompletionSink for ChannelSink {
    fn signal(&self) {
        let _ = self.0.send(());
    }
}

/// Blocks each compute pass on an external gate and records what it saw.
///
/// `started` fires when a pass begins; the pass finishes once the gate
/// receives a token or the test drops the sender.
struct GateProcessor {
    started: flume::Sender<u64>,
    gate: flume::Receiver<()>,
    processed: Arc<Mutex<Vec<u64>>>,
}

impl FrameProcessor for GateProcessor {
    type Output = u64;

    fn process(&mut self, frame: &Frame, _ctx: &AuxContext) -> u64 {
        let _ = self.started.send(frame.seq);
        let _ = self.gate.recv();
        self.processed.lock().unwrap().push(frame.seq);
        frame.seq
    }
}

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn latest_wins_releases_stale_input_before_submit_returns() {
    let allocator = Arc::new(TrackingAllocator::default());
    let (started_tx, started_rx) = flume::unbounded();
    let (gate_tx, gate_rx) = flume::unbounded();
    let (done_tx, done_rx) = flume::unbounded();
    let processed = Arc::new(Mutex::new(Vec::new()));

    let mut stage = ProcessingStage::new(
        GateProcessor {
            started: started_tx,
            gate: gate_rx,
            processed: Arc::clone(&processed),
        },
        Arc::new(ChannelSink(done_tx)),
    );
    stage.start().unwrap();

    // Occupy the worker so the next submits hit the mailbox
    stage.submit(input(&allocator, 1)).unwrap();
    assert_eq!(started_rx.recv_timeout(WAIT).unwrap(), 1);

    stage.submit(input(&allocator, 2)).unwrap();
    assert_eq!(allocator.released(), 0);

    // Overwrites the pending frame 2, which must be released by the time
    // this submit returns
    stage.submit(input(&allocator, 3)).unwrap();
    assert_eq!(allocator.released(), 1);

    gate_tx.send(()).unwrap();
    gate_tx.send(()).unwrap();
    done_rx.recv_timeout(WAIT).unwrap();
    done_rx.recv_timeout(WAIT).unwrap();

    // Frame 2 never reached the computation; the newest result wins
    assert_eq!(*processed.lock().unwrap(), vec![1, 3]);
    assert_eq!(stage.collect().unwrap(), 3);

    stage.stop();
    assert_eq!(allocator.released(), 3);
}

#[test]
fn stop_releases_the_queued_input() {
    let allocator = Arc::new(TrackingAllocator::default());
    let (started_tx, started_rx) = flume::unbounded();
    let (gate_tx, gate_rx) = flume::unbounded();
    let processed = Arc::new(Mutex::new(Vec::new()));

    let mut stage = ProcessingStage::new(
        GateProcessor {
            started: started_tx,
            gate: gate_rx,
            processed: Arc::clone(&processed),
        },
        CompletionNotifier::new(),
    );
    stage.start().unwrap();

    stage.submit(input(&allocator, 1)).unwrap();
    assert_eq!(started_rx.recv_timeout(WAIT).unwrap(), 1);
    stage.submit(input(&allocator, 2)).unwrap();

    // Open the gate by dropping it, then stop: the in-progress pass runs to
    // completion, the queued input is released without being required to run
    drop(gate_tx);
    stage.stop();

    assert_eq!(allocator.released(), 2, "every accepted frame was released");
}

#[test]
fn compute_passes_never_overlap() {
    struct ReentrancyProbe {
        in_flight: AtomicBool,
        violations: Arc<AtomicUsize>,
    }

    impl FrameProcessor for ReentrancyProbe {
        type Output = u64;

        fn process(&mut self, frame: &Frame, _ctx: &AuxContext) -> u64 {
            if self.in_flight.swap(true, Ordering::SeqCst) {
                self.violations.fetch_add(1, Ordering::SeqCst);
            }
            std::thread::sleep(Duration::from_millis(2));
            self.in_flight.store(false, Ordering::SeqCst);
            frame.seq
        }
    }

    let allocator = Arc::new(TrackingAllocator::default());
    let violations = Arc::new(AtomicUsize::new(0));
    let mut stage = ProcessingStage::new(
        ReentrancyProbe {
            in_flight: AtomicBool::new(false),
            violations: Arc::clone(&violations),
        },
        CompletionNotifier::new(),
    );
    stage.start().unwrap();

    for seq in 0..50 {
        stage.submit(input(&allocator, seq)).unwrap();
        std::thread::sleep(Duration::from_millis(1));
    }
    stage.stop();

    assert_eq!(violations.load(Ordering::SeqCst), 0);
    let stats = stage.stats();
    assert_eq!(stats.submitted, 50);
    assert_eq!(stats.computed + stats.dropped, 50);
}

#[test]
fn lifecycle_guards_hold_across_stop() {
    let allocator = Arc::new(TrackingAllocator::default());
    let notifier = CompletionNotifier::new();
    let mut stage: ProcessingStage<DepthAnalyzer> =
        ProcessingStage::new(DepthAnalyzer, Arc::clone(&notifier) as Arc<dyn CompletionSink>);

    let err = stage.submit(input(&allocator, 1)).unwrap_err();
    assert!(matches!(err.reason, StageError::NotRunning));
    drop(err);

    stage.start().unwrap();
    assert!(matches!(stage.start(), Err(StageError::AlreadyRunning)));
    stage.stop();

    let err = stage.submit(input(&allocator, 2)).unwrap_err();
    assert!(matches!(err.reason, StageError::NotRunning));
    drop(err);
    assert!(matches!(stage.collect(), Err(StageError::NotRunning)));

    // Rejected inputs were still released through their handles
    assert_eq!(allocator.released(), 2);
}

#[tokio::test]
async fn submitted_frame_yields_position_and_frame_timestamp() {
    let allocator = Arc::new(TrackingAllocator::default());
    let notifier = CompletionNotifier::new();
    let mut stage =
        ProcessingStage::new(DepthAnalyzer, Arc::clone(&notifier) as Arc<dyn CompletionSink>);
    stage.start().unwrap();

    let frame = Arc::new(depth_frame(1, &[4.0, 6.0, -1.0, f32::INFINITY], 2));
    let captured_at = frame.timestamp;
    let input = PendingInput {
        frame: FrameHandle::new(frame, Arc::clone(&allocator) as Arc<dyn FrameReleaser>),
        ctx: AuxContext {
            position: PositionSample {
                x: 1.0,
                y: 2.0,
                z: 3.0,
            },
        },
    };
    stage.submit(input).unwrap();

    tokio::time::timeout(WAIT, notifier.notified())
        .await
        .expect("worker publishes within the deadline");

    let stats = stage.collect().unwrap();
    assert_eq!((stats.x, stats.y, stats.z), (1.0, 2.0, 3.0));
    assert_eq!(stats.timestamp, captured_at);
    assert!((stats.depth_mean - 5.0).abs() < 1e-6);

    // Exactly-once delivery
    assert!(matches!(stage.collect(), Err(StageError::NotAvailable)));

    stage.stop();
    assert_eq!(allocator.released(), 1);
}

#[tokio::test]
async fn double_submit_delivers_only_the_newest_frame() {
    let allocator = Arc::new(TrackingAllocator::default());
    let (started_tx, started_rx) = flume::unbounded();
    let (gate_tx, gate_rx) = flume::unbounded();
    let notifier = CompletionNotifier::new();
    let processed = Arc::new(Mutex::new(Vec::new()));

    let mut stage = ProcessingStage::new(
        GateProcessor {
            started: started_tx,
            gate: gate_rx,
            processed: Arc::clone(&processed),
        },
        Arc::clone(&notifier) as Arc<dyn CompletionSink>,
    );
    stage.start().unwrap();

    // Park the worker on a warmup frame so F1/F2 queue behind it
    stage.submit(input(&allocator, 10)).unwrap();
    assert_eq!(started_rx.recv_timeout(WAIT).unwrap(), 10);

    stage.submit(input(&allocator, 11)).unwrap();
    stage.submit(input(&allocator, 12)).unwrap();
    assert_eq!(allocator.released(), 1, "frame 11 released on overwrite");

    gate_tx.send(()).unwrap();
    gate_tx.send(()).unwrap();

    // Wait until the newest result is observable
    let deadline = Instant::now() + WAIT;
    let result = loop {
        tokio::time::timeout(WAIT, notifier.notified())
            .await
            .expect("worker publishes within the deadline");
        match stage.collect() {
            Ok(12) => break 12,
            Ok(_) if Instant::now() < deadline => continue,
            other => panic!("unexpected collect outcome: {other:?}"),
        }
    };
    assert_eq!(result, 12);
    assert_eq!(*processed.lock().unwrap(), vec![10, 12]);

    stage.stop();
    assert_eq!(allocator.released(), 3);
}
