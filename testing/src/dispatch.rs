//! Capturing dispatcher: the test double for the in-process bus.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use ferrobus_core::consumer::InboundDispatcher;
use ferrobus_core::envelope::InboundEnvelope;
use ferrobus_core::error::PipelineError;

/// Dispatcher recording every invocation.
///
/// Failures can be scripted: [`CapturingDispatcher::fail_times`] makes the
/// next N dispatches fail, [`CapturingDispatcher::always_fail`] makes every
/// dispatch fail. Every attempt (including failing ones) is recorded in
/// [`CapturingDispatcher::attempts`]; only successful dispatches appear in
/// [`CapturingDispatcher::dispatched`].
#[derive(Default)]
pub struct CapturingDispatcher {
    attempts: Mutex<Vec<InboundEnvelope>>,
    dispatched: Mutex<Vec<InboundEnvelope>>,
    batch_sizes: Mutex<Vec<usize>>,
    failures_left: AtomicU32,
    always_fail: AtomicBool,
}

impl CapturingDispatcher {
    /// Create a dispatcher that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` dispatches with a processing error.
    pub fn fail_times(&self, count: u32) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Fail every dispatch with a processing error.
    pub fn always_fail(&self) {
        self.always_fail.store(true, Ordering::SeqCst);
    }

    /// Every dispatch attempt, failing ones included.
    ///
    /// # Panics
    ///
    /// Panics when a previous test assertion already poisoned the capture
    /// mutex.
    #[must_use]
    #[allow(clippy::unwrap_used)]
    pub fn attempts(&self) -> Vec<InboundEnvelope> {
        self.attempts.lock().unwrap().clone()
    }

    /// Successfully dispatched envelopes, in dispatch order.
    ///
    /// # Panics
    ///
    /// Panics when a previous test assertion already poisoned the capture
    /// mutex.
    #[must_use]
    #[allow(clippy::unwrap_used)]
    pub fn dispatched(&self) -> Vec<InboundEnvelope> {
        self.dispatched.lock().unwrap().clone()
    }

    /// Sizes of the batches dispatched through `dispatch_batch`.
    ///
    /// # Panics
    ///
    /// Panics when a previous test assertion already poisoned the capture
    /// mutex.
    #[must_use]
    #[allow(clippy::unwrap_used)]
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().unwrap().clone()
    }

    fn should_fail(&self) -> bool {
        if self.always_fail.load(Ordering::SeqCst) {
            return true;
        }
        let failures = self.failures_left.load(Ordering::SeqCst);
        if failures > 0 {
            self.failures_left.store(failures - 1, Ordering::SeqCst);
            return true;
        }
        false
    }
}

impl InboundDispatcher for CapturingDispatcher {
    #[allow(clippy::unwrap_used)] // Poisoned capture mutex means a test already failed
    fn dispatch<'a>(
        &'a self,
        envelope: &'a InboundEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>> {
        Box::pin(async move {
            self.attempts.lock().unwrap().push(envelope.clone());
            if self.should_fail() {
                return Err(PipelineError::Processing("scripted failure".into()));
            }
            self.dispatched.lock().unwrap().push(envelope.clone());
            Ok(())
        })
    }

    #[allow(clippy::unwrap_used)] // Poisoned capture mutex means a test already failed
    fn dispatch_batch<'a>(
        &'a self,
        envelopes: &'a [InboundEnvelope],
    ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>> {
        Box::pin(async move {
            self.attempts.lock().unwrap().extend(envelopes.iter().cloned());
            if self.should_fail() {
                return Err(PipelineError::Processing("scripted failure".into()));
            }
            self.batch_sizes.lock().unwrap().push(envelopes.len());
            self.dispatched
                .lock()
                .unwrap()
                .extend(envelopes.iter().cloned());
            Ok(())
        })
    }
}
