//! # Ferrobus Core
//!
//! Core pipelines, sequences and storage contracts for the Ferrobus
//! broker-integration framework.
//!
//! Ferrobus mediates between application code and message brokers. This
//! crate is broker-agnostic: it defines the envelope and header model, the
//! producer and consumer pipelines, the chunk/batch sequence engine, the
//! error policies, and the contracts every collaborator implements —
//! [`broker::BrokerClient`], [`outbox::OutboxWriter`]/[`outbox::OutboxReader`],
//! [`offset::OffsetStore`] and [`lock::DistributedLock`]. Concrete
//! implementations live in the sibling crates (`ferrobus-kafka`,
//! `ferrobus-postgres`, `ferrobus-runtime`, `ferrobus-testing`).
//!
//! # Architecture
//!
//! ```text
//!           outbound                                inbound
//! ┌──────────────────────┐              ┌───────────────────────────┐
//! │ application message  │              │       broker client       │
//! └──────────┬───────────┘              └─────────────┬─────────────┘
//!            ▼                                        ▼
//! ┌──────────────────────┐              ┌───────────────────────────┐
//! │    OutboundRouter    │              │  demux: task / partition  │
//! └──────────┬───────────┘              └─────────────┬─────────────┘
//!            ▼                                        ▼
//! ┌──────────────────────┐              ┌───────────────────────────┐
//! │  producer behaviors  │              │  dedup → chunks → decrypt │
//! │  trace · id · check  │              │  → deserialize → batch    │
//! │  enrich · serialize  │              │  → dispatch               │
//! │  encrypt · chunk     │              └─────────────┬─────────────┘
//! └──────────┬───────────┘                            ▼
//!            ▼                          ┌───────────────────────────┐
//! ┌──────────────────────┐              │ error policy → commit +   │
//! │ direct  |   outbox   │              │ offset store advance      │
//! └──────────────────────┘              └───────────────────────────┘
//! ```
//!
//! # Delivery semantics
//!
//! The core provides exactly-once *processing* of inbound messages (via the
//! offset store and duplicate suppression) on top of the broker's
//! at-least-once delivery, and at-least-once *production* via the
//! transactional outbox. It does not provide end-to-end exactly-once
//! delivery.
//!
//! # Example
//!
//! ```ignore
//! use ferrobus_core::prelude::*;
//!
//! let producer = Producer::new(
//!     EndpointResolver::Static(Endpoint::new("order-events")),
//!     Arc::new(EndpointConfig::default()),
//!     Arc::new(DirectProduceStrategy::new(client)),
//! );
//!
//! let message = DecodedMessage::from_value("OrderPlaced.v1", &order)?;
//! let id = producer.produce(message, None).await?;
//! ```

pub mod broker;
pub mod consumer;
pub mod context;
pub mod encryption;
pub mod endpoint;
pub mod envelope;
pub mod error;
pub mod error_policy;
pub mod headers;
pub mod identifier;
pub mod lock;
pub mod message;
pub mod offset;
pub mod outbox;
pub mod producer;
pub mod sequence;

/// Commonly used items, re-exported for application code.
pub mod prelude {
    pub use crate::broker::{BrokerClient, ClientStatus, RawRecord, RecordStream};
    pub use crate::consumer::{
        Consumer, ConsumerConfig, ConsumerStatus, InboundDispatcher,
    };
    pub use crate::context::{ContextBag, PipelineContext, ShutdownSignal, ShutdownToken};
    pub use crate::encryption::EncryptionSettings;
    pub use crate::endpoint::{
        BatchSettings, ChunkSettings, Endpoint, EndpointConfig, EndpointResolver,
        ValidationMode,
    };
    pub use crate::envelope::{InboundEnvelope, OutboundEnvelope};
    pub use crate::error::{ErrorKind, PipelineError};
    pub use crate::error_policy::{ErrorPolicy, RetryBackoff};
    pub use crate::headers::{Headers, names};
    pub use crate::identifier::BrokerRecordId;
    pub use crate::lock::{DistributedLock, LockHandle};
    pub use crate::message::{DecodedMessage, JsonMessageSerializer, MessageSerializer};
    pub use crate::offset::{OffsetKey, OffsetStore};
    pub use crate::outbox::{NewOutboxMessage, OutboxMessage, OutboxReader, OutboxWriter};
    pub use crate::producer::{
        DelegatedProducer, DirectProduceStrategy, OutboundRouter, OutboxProduceStrategy,
        Producer,
    };
    pub use crate::sequence::{AbortReason, SequenceState};
}
