//! Latest-wins frame processing stage
//!
//! Bridges the event loop with one dedicated worker thread: `submit` hands a
//! frame over without blocking, the worker computes with no lock held and
//! publishes the freshest result, `collect` reads it after the completion
//! wakeup. At most one input and one result are ever retained; older
//! unconsumed items are released, never queued.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam::utils::CachePadded;
use metrics::counter;
use thiserror::Error;
use tracing::{debug, error};

use crate::capture::frame::{Frame, FrameHandle};
use crate::stage::notify::CompletionSink;
use crate::telemetry::PositionSample;

/// Scalar context captured alongside a frame at submit time
#[derive(Debug, Clone, Copy, Default)]
pub struct AuxContext {
    /// Vehicle position when the frame was captured
    pub position: PositionSample,
}

/// One unit of work: an owned frame plus its capture-time context
#[derive(Debug)]
pub struct PendingInput {
    pub frame: FrameHandle,
    pub ctx: AuxContext,
}

/// Per-frame computation run on the worker thread.
///
/// Runs with no stage lock held, so it may be arbitrarily slow without
/// affecting `submit` latency. The frame is read-only once accepted.
pub trait FrameProcessor: Send + 'static {
    type Output: Send + 'static;

    fn process(&mut self, frame: &Frame, ctx: &AuxContext) -> Self::Output;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Created,
    Running,
    Stopped,
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error("stage already running")]
    AlreadyRunning,
    #[error("stage not running")]
    NotRunning,
    /// Expected outcome when polling faster than the worker publishes
    #[error("no unread result available")]
    NotAvailable,
    #[error("failed to allocate worker thread")]
    AllocationFailure(#[source] std::io::Error),
    #[error("synchronization primitive failed: {0}")]
    SyncPrimitiveFailure(&'static str),
}

/// A `submit` that did not take ownership.
///
/// The input travels back to the caller, whose handle still releases the
/// frame on drop, so even an ignored rejection cannot leak.
#[derive(Debug, Error)]
#[error("input rejected: {reason}")]
pub struct SubmitError {
    #[source]
    pub reason: StageError,
    pub input: PendingInput,
}

impl SubmitError {
    pub fn into_input(self) -> PendingInput {
        self.input
    }
}

/// Worker mailbox: one slot, a newer submit displaces whatever is pending
enum Mailbox {
    Empty,
    Pending(PendingInput),
    StopRequested,
}

struct Inner<R> {
    state: StageState,
    mailbox: Mailbox,
    result: Option<R>,
}

struct Shared<P: FrameProcessor> {
    inner: Mutex<Inner<P::Output>>,
    cond: Condvar,
    /// Parked processor; the worker takes it while running and parks it back
    /// on exit so the stage can be restarted
    processor: Mutex<Option<P>>,
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    submitted: AtomicU64,
    dropped: AtomicU64,
    computed: AtomicU64,
    collected: AtomicU64,
}

/// Snapshot of the per-stage counters
#[derive(Debug, Clone, Copy)]
pub struct StageStats {
    pub submitted: u64,
    pub dropped: u64,
    pub computed: u64,
    pub collected: u64,
}

/// Single-slot asynchronous pipeline stage.
///
/// Owns one worker thread between `start` and `stop`. `submit` and `collect`
/// are bounded, lock-only critical sections and never run the computation;
/// multiple stages are fully independent.
pub struct ProcessingStage<P: FrameProcessor> {
    shared: Arc<Shared<P>>,
    notifier: Arc<dyn CompletionSink>,
    worker: Option<JoinHandle<()>>,
}

impl<P: FrameProcessor> ProcessingStage<P> {
    /// Create a stage in `Created`; no thread is spawned until [`start`](Self::start)
    pub fn new(processor: P, notifier: Arc<dyn CompletionSink>) -> Self {
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                state: StageState::Created,
                mailbox: Mailbox::Empty,
                result: None,
            }),
            cond: Condvar::new(),
            processor: Mutex::new(Some(processor)),
            stats: CachePadded::new(Stats::default()),
        });
        Self {
            shared,
            notifier,
            worker: None,
        }
    }

    /// Spawn the worker thread and transition to `Running`
    pub fn start(&mut self) -> Result<(), StageError> {
        if self.worker.is_some() {
            return Err(StageError::AlreadyRunning);
        }
        {
            let mut inner = self
                .shared
                .inner
                .lock()
                .map_err(|_| StageError::SyncPrimitiveFailure("stage mutex poisoned"))?;
            if inner.state == StageState::Running {
                return Err(StageError::AlreadyRunning);
            }
            inner.state = StageState::Running;
            inner.mailbox = Mailbox::Empty;
            inner.result = None;
        }

        let shared = Arc::clone(&self.shared);
        let notifier = Arc::clone(&self.notifier);
        let spawned = thread::Builder::new()
            .name("stage-worker".into())
            .spawn(move || worker_loop(shared, notifier));

        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
                Ok(())
            }
            Err(err) => {
                if let Ok(mut inner) = self.shared.inner.lock() {
                    inner.state = StageState::Stopped;
                }
                Err(StageError::AllocationFailure(err))
            }
        }
    }

    /// Stop the worker and join it.
    ///
    /// Releases any input still queued. Joins without timeout: worst case it
    /// waits for the in-progress compute pass to finish. No-op when never
    /// started or already stopped.
    pub fn stop(&mut self) {
        let Some(handle) = self.worker.take() else {
            return;
        };
        {
            let mut inner = self
                .shared
                .inner
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            inner.state = StageState::Stopped;
            // A still-queued input counts as dropped; its handle releases the frame
            if let Mailbox::Pending(stale) =
                std::mem::replace(&mut inner.mailbox, Mailbox::StopRequested)
            {
                self.shared.stats.dropped.fetch_add(1, Ordering::Relaxed);
                counter!("daedalus_frames_dropped").increment(1);
                debug!(seq = stale.frame.frame().seq, "releasing queued frame on stop");
                drop(stale);
            }
        }
        self.shared.cond.notify_one();
        if handle.join().is_err() {
            error!("stage worker panicked during shutdown");
        }
    }

    /// Hand a frame to the worker. Never blocks on the computation.
    ///
    /// Ownership of the frame transfers to the stage on success. If an input
    /// is already pending it is released before being overwritten: the stage
    /// processes at most one frame per compute pass and never backs up. On
    /// rejection the input is handed back and the caller keeps the release
    /// obligation.
    pub fn submit(&self, input: PendingInput) -> Result<(), SubmitError> {
        let mut inner = match self.shared.inner.lock() {
            Ok(inner) => inner,
            Err(_) => {
                return Err(SubmitError {
                    reason: StageError::SyncPrimitiveFailure("stage mutex poisoned"),
                    input,
                })
            }
        };
        if inner.state != StageState::Running {
            return Err(SubmitError {
                reason: StageError::NotRunning,
                input,
            });
        }

        // Latest wins: release the stale input before storing the new one
        if let Mailbox::Pending(stale) = std::mem::replace(&mut inner.mailbox, Mailbox::Empty) {
            self.shared.stats.dropped.fetch_add(1, Ordering::Relaxed);
            counter!("daedalus_frames_dropped").increment(1);
            debug!(seq = stale.frame.frame().seq, "dropping stale pending frame");
            drop(stale);
        }
        inner.mailbox = Mailbox::Pending(input);
        self.shared.stats.submitted.fetch_add(1, Ordering::Relaxed);
        counter!("daedalus_frames_submitted").increment(1);
        drop(inner);

        self.shared.cond.notify_one();
        Ok(())
    }

    /// Take the most recent unread result.
    ///
    /// Each published result is delivered at most once; a result superseded
    /// before collection is silently replaced by the newer one.
    pub fn collect(&self) -> Result<P::Output, StageError> {
        let mut inner = self
            .shared
            .inner
            .lock()
            .map_err(|_| StageError::SyncPrimitiveFailure("stage mutex poisoned"))?;
        if inner.state != StageState::Running {
            return Err(StageError::NotRunning);
        }
        let output = inner.result.take().ok_or(StageError::NotAvailable)?;
        self.shared.stats.collected.fetch_add(1, Ordering::Relaxed);
        Ok(output)
    }

    pub fn state(&self) -> StageState {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .state
    }

    pub fn stats(&self) -> StageStats {
        let stats = &self.shared.stats;
        StageStats {
            submitted: stats.submitted.load(Ordering::Relaxed),
            dropped: stats.dropped.load(Ordering::Relaxed),
            computed: stats.computed.load(Ordering::Relaxed),
            collected: stats.collected.load(Ordering::Relaxed),
        }
    }
}

impl<P: FrameProcessor> Drop for ProcessingStage<P> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Worker state machine: wait for work, compute outside the lock, publish,
/// signal, repeat until a stop request.
fn worker_loop<P: FrameProcessor>(shared: Arc<Shared<P>>, notifier: Arc<dyn CompletionSink>) {
    let mut processor = {
        let mut slot = shared
            .processor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match slot.take() {
            Some(processor) => processor,
            None => {
                error!("stage worker started without a processor");
                return;
            }
        }
    };

    let mut inner = shared
        .inner
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    loop {
        match std::mem::replace(&mut inner.mailbox, Mailbox::Empty) {
            Mailbox::StopRequested => break,
            Mailbox::Empty => {
                // Blocks until submit or stop signals; a spurious or failed
                // wakeup falls through to a re-check of the mailbox
                inner = match shared.cond.wait(inner) {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
            }
            Mailbox::Pending(input) => {
                // Heavy computation runs with the lock released so submit
                // stays non-blocking and latest-wins applies to the next slot
                drop(inner);
                let output = panic::catch_unwind(AssertUnwindSafe(|| {
                    processor.process(input.frame.frame(), &input.ctx)
                }));
                // Done with the input frame, whatever the pass did
                drop(input);

                inner = shared
                    .inner
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                match output {
                    Ok(result) => {
                        if inner.result.replace(result).is_some() {
                            debug!("unread result superseded");
                        }
                        shared.stats.computed.fetch_add(1, Ordering::Relaxed);
                        counter!("daedalus_frames_processed").increment(1);
                        notifier.signal();
                    }
                    Err(_) => error!("compute pass panicked, no result published"),
                }
            }
        }
    }
    drop(inner);

    // Park the processor for a later restart
    *shared
        .processor
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(processor);
}
