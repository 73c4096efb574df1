//! Completion wakeup between the worker thread and the event loop
//!
//! The wakeup carries no payload; results travel through the stage's result
//! slot. Signals may coalesce: a burst of `signal()` calls wakes the loop at
//! least once, not once per call.

use std::sync::Arc;

use tokio::sync::Notify;

/// Worker-side half of the completion wakeup.
///
/// Injected into the stage at construction; callable from the worker thread
/// any number of times.
pub trait CompletionSink: Send + Sync + 'static {
    fn signal(&self);
}

/// Edge-triggered wakeup into the owning event loop.
///
/// The worker calls [`CompletionSink::signal`] from sync context, the loop
/// awaits [`notified`](CompletionNotifier::notified). Dropping the loop-side
/// `Arc` detaches; the worker's clone keeps late signals harmless.
pub struct CompletionNotifier {
    inner: Notify,
}

impl CompletionNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Notify::new(),
        })
    }

    /// Resolves once a signal has fired since the last wakeup
    pub async fn notified(&self) {
        self.inner.notified().await;
    }
}

impl CompletionSink for CompletionNotifier {
    fn signal(&self) {
        self.inner.notify_one();
    }
}
