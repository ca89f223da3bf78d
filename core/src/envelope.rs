//! Envelopes: messages in transit through the pipelines.

use crate::endpoint::Endpoint;
use crate::headers::Headers;
use crate::identifier::BrokerRecordId;
use crate::message::DecodedMessage;

/// A message travelling through the producer pipeline.
///
/// Created with the decoded message set and the raw body empty; the
/// serialization behavior fills the body, later behaviors rewrite it
/// (encryption, chunking).
#[derive(Clone, Debug)]
pub struct OutboundEnvelope {
    /// The decoded message; `None` once only the raw body matters (chunks,
    /// outbox replays).
    pub message: Option<DecodedMessage>,
    /// The wire body; possibly empty before serialization.
    pub raw_body: Vec<u8>,
    /// Message headers.
    pub headers: Headers,
    /// The resolved target endpoint.
    pub endpoint: Endpoint,
    /// Persisted endpoint form, set when the endpoint was resolved
    /// dynamically so the outbox can reconstruct it.
    pub serialized_endpoint: Option<String>,
}

impl OutboundEnvelope {
    /// Wrap a decoded message addressed to `endpoint`.
    #[must_use]
    pub fn new(message: DecodedMessage, headers: Headers, endpoint: Endpoint) -> Self {
        Self {
            message: Some(message),
            raw_body: Vec::new(),
            headers,
            endpoint,
            serialized_endpoint: None,
        }
    }

    /// Wrap an already-serialized body addressed to `endpoint`; used by the
    /// outbox worker which must preserve stored bytes and headers exactly.
    #[must_use]
    pub const fn from_raw(raw_body: Vec<u8>, headers: Headers, endpoint: Endpoint) -> Self {
        Self {
            message: None,
            raw_body,
            headers,
            endpoint,
            serialized_endpoint: None,
        }
    }

    /// The `x-message-id` header.
    #[must_use]
    pub fn message_id(&self) -> Option<&str> {
        self.headers.message_id()
    }
}

/// A message received from a broker, travelling through the consumer
/// pipeline.
#[derive(Clone, Debug)]
pub struct InboundEnvelope {
    /// The wire body as fetched (after decryption/reassembly stages rewrite
    /// it, the current stage's view).
    pub raw_body: Vec<u8>,
    /// The decoded message, set by the deserialization stage.
    pub message: Option<DecodedMessage>,
    /// Message headers.
    pub headers: Headers,
    /// The endpoint the record was consumed from.
    pub endpoint: Endpoint,
    /// Broker identifier of the underlying record.
    pub record_id: BrokerRecordId,
}

impl InboundEnvelope {
    /// Build an envelope from a raw consumed record.
    #[must_use]
    pub const fn new(
        raw_body: Vec<u8>,
        headers: Headers,
        endpoint: Endpoint,
        record_id: BrokerRecordId,
    ) -> Self {
        Self {
            raw_body,
            message: None,
            headers,
            endpoint,
            record_id,
        }
    }

    /// The `x-message-id` header; also the sequence id for chunks.
    #[must_use]
    pub fn message_id(&self) -> Option<&str> {
        self.headers.message_id()
    }

    /// Whether this envelope is a chunk of a larger message.
    #[must_use]
    pub fn is_chunk(&self) -> bool {
        self.headers.chunk_index().is_some()
    }
}
