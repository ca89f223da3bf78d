//! # Ferrobus Testing
//!
//! In-memory doubles for testing Ferrobus applications without a broker or
//! a database:
//!
//! - [`InMemoryBroker`] — a partitioned in-process log implementing the
//!   broker client contract, with commit tracking per consumer group
//! - [`InMemoryOutbox`] — outbox writer/reader over a `Vec`
//! - [`InMemoryOffsetStore`] — monotonic offset store over a map
//! - [`CapturingDispatcher`] — records every dispatch, optionally failing a
//!   scripted number of times
//! - [`InMemoryLock`] — re-exported from `ferrobus-runtime`
//!
//! ## Example
//!
//! ```ignore
//! let broker = InMemoryBroker::new();
//! let client = Arc::new(broker.client("test-group", &["order-events"]));
//! let dispatcher = Arc::new(CapturingDispatcher::new());
//!
//! let consumer = Consumer::new(client, "test-group", dispatcher.clone())
//!     .endpoint("order-events", Arc::new(EndpointConfig::default()));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod broker;
mod dispatch;
mod stores;

pub use broker::{InMemoryBroker, InMemoryClient, StoredRecord};
pub use dispatch::CapturingDispatcher;
pub use ferrobus_runtime::InMemoryLock;
pub use stores::{InMemoryOffsetStore, InMemoryOutbox};

use std::future::Future;
use std::time::Duration;

/// Poll `condition` until it holds or `timeout` elapses; returns whether the
/// condition was met.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
