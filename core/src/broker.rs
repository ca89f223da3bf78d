//! The broker client contract.
//!
//! The core depends only on this abstract interface; concrete clients
//! (Kafka, in-memory) live in their own crates. Status transitions are
//! observable through a watch channel so supervisors can react to
//! disconnects without polling.
//!
//! # Dyn Compatibility
//!
//! The trait uses explicit `Pin<Box<dyn Future>>` returns instead of
//! `async fn` so clients can be held as `Arc<dyn BrokerClient>` by producers,
//! consumers and the outbox worker.

use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::watch;

use crate::context::ShutdownToken;
use crate::envelope::OutboundEnvelope;
use crate::error::PipelineError;
use crate::headers::Headers;
use crate::identifier::BrokerRecordId;

/// Connection lifecycle of a broker client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientStatus {
    /// Connection is being established.
    Initializing,
    /// Connected and ready.
    Initialized,
    /// Disconnect requested; draining.
    Disconnecting,
    /// Not connected.
    Disconnected,
}

impl ClientStatus {
    /// Stable lowercase name used in structured log fields.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Initialized => "initialized",
            Self::Disconnecting => "disconnecting",
            Self::Disconnected => "disconnected",
        }
    }
}

impl std::fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record as fetched from the broker, before any pipeline stage ran.
#[derive(Clone, Debug)]
pub struct RawRecord {
    /// Name of the endpoint (topic) the record was fetched from.
    pub endpoint_name: String,
    /// Raw body bytes; possibly empty.
    pub body: Vec<u8>,
    /// Wire headers.
    pub headers: Headers,
    /// Broker identifier of the record.
    pub record_id: BrokerRecordId,
}

/// Stream of raw records produced by [`BrokerClient::consume`].
pub type RecordStream = Pin<Box<dyn Stream<Item = Result<RawRecord, PipelineError>> + Send>>;

/// Contract implemented by every broker client.
///
/// All methods are asynchronous; `produce` may fail fast when the client is
/// not [`ClientStatus::Initialized`] unless the implementation is configured
/// to queue until connected.
pub trait BrokerClient: Send + Sync {
    /// Current connection status.
    fn status(&self) -> ClientStatus;

    /// Observe status transitions.
    fn status_watch(&self) -> watch::Receiver<ClientStatus>;

    /// Establish the connection.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::TransientBroker`] when the broker is
    /// unreachable.
    fn connect(&self) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + '_>>;

    /// Tear the connection down, flushing pending work.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::TransientBroker`] when flushing fails.
    fn disconnect(&self) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + '_>>;

    /// Disconnect and connect again.
    ///
    /// # Errors
    ///
    /// Propagates the first failure of either step.
    fn reconnect(&self) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + '_>> {
        Box::pin(async move {
            self.disconnect().await?;
            self.connect().await
        })
    }

    /// Produce one envelope and return the identifier assigned by the
    /// broker.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::TransientBroker`] on produce failure or when
    /// the client is not connected.
    fn produce<'a>(
        &'a self,
        envelope: &'a OutboundEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<BrokerRecordId, PipelineError>> + Send + 'a>>;

    /// Produce a set of envelopes atomically when the broker supports it
    /// (e.g. a transactional Kafka producer); otherwise produce them in
    /// order, allowing partial results on failure.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::TransientBroker`] on produce failure.
    fn produce_batch<'a>(
        &'a self,
        envelopes: &'a [OutboundEnvelope],
    ) -> Pin<Box<dyn Future<Output = Result<Vec<BrokerRecordId>, PipelineError>> + Send + 'a>>
    {
        Box::pin(async move {
            let mut ids = Vec::with_capacity(envelopes.len());
            for envelope in envelopes {
                ids.push(self.produce(envelope).await?);
            }
            Ok(ids)
        })
    }

    /// Start consuming; the stream ends when `shutdown` triggers or the
    /// connection is lost permanently.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::TransientBroker`] when the subscription
    /// cannot be established.
    fn consume(
        &self,
        shutdown: ShutdownToken,
    ) -> Pin<Box<dyn Future<Output = Result<RecordStream, PipelineError>> + Send + '_>>;

    /// Commit the given identifiers, aggregated per group key.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::TransientBroker`] when the commit fails.
    fn commit<'a>(
        &'a self,
        ids: &'a [BrokerRecordId],
    ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>>;
}
