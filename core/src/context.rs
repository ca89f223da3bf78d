//! Pipeline context: the typed bag, trace context and shutdown signaling.
//!
//! Every pipeline stage receives an explicit [`PipelineContext`] instead of
//! reaching for ambient state. The context carries a [`ContextBag`] (a
//! `TypeId`-keyed typed map used e.g. for trace context and enlisted database
//! transactions) and a [`ShutdownToken`].

use std::any::{Any, TypeId};
use std::collections::HashMap;
use tokio::sync::watch;

use crate::headers::{Headers, names};

/// A typed map keyed by the stored value's type.
///
/// Holds at most one value per type. Storage crates use it to enlist their
/// transaction handles without the core depending on any driver.
#[derive(Default)]
pub struct ContextBag {
    entries: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl ContextBag {
    /// Create an empty bag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value, replacing any previous value of the same type.
    pub fn insert<T: Any + Send + Sync>(&mut self, value: T) {
        self.entries.insert(TypeId::of::<T>(), Box::new(value));
    }

    /// Borrow the stored value of type `T`, if any.
    #[must_use]
    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.entries
            .get(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_ref())
    }

    /// Remove and return the stored value of type `T`, if any.
    pub fn remove<T: Any + Send + Sync>(&mut self) -> Option<T> {
        self.entries
            .remove(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast().ok())
            .map(|boxed| *boxed)
    }

    /// Whether a value of type `T` is stored.
    #[must_use]
    pub fn contains<T: Any + Send + Sync>(&self) -> bool {
        self.entries.contains_key(&TypeId::of::<T>())
    }
}

impl std::fmt::Debug for ContextBag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextBag")
            .field("entries", &self.entries.len())
            .finish()
    }
}

/// W3C trace context carried across produce/consume boundaries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceContext {
    /// `traceparent` in the W3C format `00-<trace-id>-<span-id>-<flags>`.
    pub traceparent: String,
    /// Optional `tracestate`.
    pub tracestate: Option<String>,
    /// Optional baggage.
    pub baggage: Option<String>,
}

impl TraceContext {
    /// Generate a fresh trace context with random trace and span ids.
    #[must_use]
    pub fn generate() -> Self {
        let trace_id: u128 = rand::random();
        let span_id: u64 = rand::random();
        Self {
            traceparent: format!("00-{trace_id:032x}-{span_id:016x}-01"),
            tracestate: None,
            baggage: None,
        }
    }

    /// Read the trace context from message headers, if present.
    #[must_use]
    pub fn from_headers(headers: &Headers) -> Option<Self> {
        headers.get(names::TRACEPARENT).map(|traceparent| Self {
            traceparent: traceparent.to_string(),
            tracestate: headers.get(names::TRACESTATE).map(str::to_string),
            baggage: headers.get(names::TRACE_BAGGAGE).map(str::to_string),
        })
    }

    /// Write the trace context to message headers.
    pub fn apply(&self, headers: &mut Headers) {
        headers.set(names::TRACEPARENT, self.traceparent.clone());
        if let Some(tracestate) = &self.tracestate {
            headers.set(names::TRACESTATE, tracestate.clone());
        }
        if let Some(baggage) = &self.baggage {
            headers.set(names::TRACE_BAGGAGE, baggage.clone());
        }
    }
}

/// Cooperative shutdown signal shared by consumers and background workers.
///
/// Cloning the signal is not supported; hand out [`ShutdownToken`]s instead.
/// Dropping the signal counts as triggering it, so orphaned tasks never hang.
#[derive(Debug)]
pub struct ShutdownSignal {
    tx: watch::Sender<bool>,
}

impl ShutdownSignal {
    /// Create a new, untriggered signal.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Obtain a token observing this signal.
    #[must_use]
    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            rx: self.tx.subscribe(),
        }
    }

    /// Trigger the shutdown. Idempotent.
    pub fn trigger(&self) {
        // Receivers treat a dropped sender as triggered, so the send result
        // carries no information.
        let _ = self.tx.send(true);
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer half of a [`ShutdownSignal`].
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    rx: watch::Receiver<bool>,
}

impl ShutdownToken {
    /// A token that can never be triggered; for fire-and-forget pipeline
    /// invocations that are not tied to a long-running worker.
    #[must_use]
    pub fn detached() -> Self {
        static NEVER: std::sync::OnceLock<watch::Sender<bool>> = std::sync::OnceLock::new();
        let tx = NEVER.get_or_init(|| watch::channel(false).0);
        Self { rx: tx.subscribe() }
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until shutdown is requested (or the signal is dropped).
    pub async fn triggered(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// The explicit context handed to every pipeline stage.
#[derive(Debug)]
pub struct PipelineContext {
    /// Typed value bag (trace context, enlisted transactions, ...).
    pub bag: ContextBag,
    /// Cooperative cancellation for I/O-bound stages.
    pub shutdown: ShutdownToken,
}

impl PipelineContext {
    /// Create a context observing the given shutdown token.
    #[must_use]
    pub fn new(shutdown: ShutdownToken) -> Self {
        Self {
            bag: ContextBag::new(),
            shutdown,
        }
    }

    /// Create a context not tied to any long-running worker.
    #[must_use]
    pub fn detached() -> Self {
        Self::new(ShutdownToken::detached())
    }
}
