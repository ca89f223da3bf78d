//! The producer pipeline: route, enrich, serialize, encrypt, chunk, produce.
//!
//! A [`Producer`] applies an ordered chain of [`ProducerBehavior`]s to the
//! outbound envelope and hands the result to its [`ProduceStrategy`]
//! terminator: [`DirectProduceStrategy`] produces straight to the broker
//! client and returns the broker identifier, [`OutboxProduceStrategy`]
//! persists rows under the ambient database transaction and returns nothing.
//!
//! Behaviors are capabilities ordered by a stable sort index, so composition
//! is deterministic no matter how a chain was assembled:
//!
//! | Index | Behavior |
//! |---|---|
//! | 100 | trace-context injection |
//! | 150 | message-id enrichment |
//! | 200 | validation |
//! | 300 | header enrichers |
//! | 400 | serialization |
//! | 500 | encryption |
//! | 600 | chunking |

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::broker::BrokerClient;
use crate::context::{PipelineContext, TraceContext};
use crate::encryption::encrypt_body;
use crate::endpoint::{
    Endpoint, EndpointConfig, EndpointResolver, HeaderEnricher, MessageValidator, ValidationMode,
};
use crate::envelope::OutboundEnvelope;
use crate::error::PipelineError;
use crate::headers::{Headers, names};
use crate::identifier::BrokerRecordId;
use crate::message::{DecodedMessage, MessageSerializer};
use crate::outbox::{NewOutboxMessage, OutboxMessage, OutboxWriter};

/// A stage of the producer pipeline.
///
/// Behaviors transform the set of envelopes being produced; chunking is the
/// only built-in stage that changes its cardinality.
pub trait ProducerBehavior: Send + Sync {
    /// Stable sort index deciding this behavior's position in the chain.
    fn sort_index(&self) -> i32;

    /// Behavior name used in log fields.
    fn name(&self) -> &'static str;

    /// Transform the envelopes.
    ///
    /// # Errors
    ///
    /// Returns a [`PipelineError`] classified per the failing concern; the
    /// produce operation fails as a whole.
    fn apply(
        &self,
        envelopes: Vec<OutboundEnvelope>,
        config: &EndpointConfig,
        ctx: &mut PipelineContext,
    ) -> Result<Vec<OutboundEnvelope>, PipelineError>;
}

/// Injects the W3C trace context into the outgoing headers, generating a
/// fresh one when the pipeline context carries none.
pub struct TraceContextInjector;

impl ProducerBehavior for TraceContextInjector {
    fn sort_index(&self) -> i32 {
        100
    }

    fn name(&self) -> &'static str {
        "trace-context"
    }

    fn apply(
        &self,
        mut envelopes: Vec<OutboundEnvelope>,
        _config: &EndpointConfig,
        ctx: &mut PipelineContext,
    ) -> Result<Vec<OutboundEnvelope>, PipelineError> {
        if ctx.bag.get::<TraceContext>().is_none() {
            ctx.bag.insert(TraceContext::generate());
        }
        // Checked or inserted just above.
        if let Some(trace) = ctx.bag.get::<TraceContext>() {
            for envelope in &mut envelopes {
                trace.apply(&mut envelope.headers);
            }
        }
        Ok(envelopes)
    }
}

/// Assigns `x-message-id` when the caller did not provide one. The id doubles
/// as the chunk sequence id and as the consumer-side deduplication key.
pub struct MessageIdEnricher;

impl ProducerBehavior for MessageIdEnricher {
    fn sort_index(&self) -> i32 {
        150
    }

    fn name(&self) -> &'static str {
        "message-id"
    }

    fn apply(
        &self,
        mut envelopes: Vec<OutboundEnvelope>,
        _config: &EndpointConfig,
        _ctx: &mut PipelineContext,
    ) -> Result<Vec<OutboundEnvelope>, PipelineError> {
        for envelope in &mut envelopes {
            if envelope.headers.message_id().is_none() {
                envelope
                    .headers
                    .set(names::MESSAGE_ID, uuid::Uuid::new_v4().to_string());
            }
        }
        Ok(envelopes)
    }
}

/// Validates messages per the endpoint's validation mode.
pub struct ValidationBehavior;

impl ProducerBehavior for ValidationBehavior {
    fn sort_index(&self) -> i32 {
        200
    }

    fn name(&self) -> &'static str {
        "validation"
    }

    fn apply(
        &self,
        envelopes: Vec<OutboundEnvelope>,
        config: &EndpointConfig,
        _ctx: &mut PipelineContext,
    ) -> Result<Vec<OutboundEnvelope>, PipelineError> {
        if config.validation == ValidationMode::Ignore {
            return Ok(envelopes);
        }
        let Some(validator) = &config.validator else {
            return Ok(envelopes);
        };

        for envelope in &envelopes {
            let Some(message) = &envelope.message else {
                continue;
            };
            if let Err(violation) = validator.validate(message) {
                match config.validation {
                    ValidationMode::Fail => {
                        return Err(PipelineError::Processing(format!(
                            "message validation failed: {violation}"
                        )));
                    }
                    ValidationMode::LogWarning => {
                        tracing::warn!(
                            endpoint = %envelope.endpoint.display_name(),
                            message_type = %message.type_name,
                            violation = %violation,
                            "producing message that failed validation"
                        );
                    }
                    ValidationMode::Ignore => {}
                }
            }
        }
        Ok(envelopes)
    }
}

/// Applies the endpoint's configured header enrichers.
pub struct HeaderEnrichmentBehavior;

impl ProducerBehavior for HeaderEnrichmentBehavior {
    fn sort_index(&self) -> i32 {
        300
    }

    fn name(&self) -> &'static str {
        "header-enrichment"
    }

    fn apply(
        &self,
        mut envelopes: Vec<OutboundEnvelope>,
        config: &EndpointConfig,
        _ctx: &mut PipelineContext,
    ) -> Result<Vec<OutboundEnvelope>, PipelineError> {
        for envelope in &mut envelopes {
            let Some(message) = envelope.message.clone() else {
                continue;
            };
            for enricher in &config.enrichers {
                enricher.enrich(&message, &mut envelope.headers);
            }
        }
        Ok(envelopes)
    }
}

/// Serializes the decoded message into the raw body, letting the serializer
/// add the headers the consuming side needs (`x-message-type`).
pub struct SerializationBehavior;

impl ProducerBehavior for SerializationBehavior {
    fn sort_index(&self) -> i32 {
        400
    }

    fn name(&self) -> &'static str {
        "serialization"
    }

    fn apply(
        &self,
        mut envelopes: Vec<OutboundEnvelope>,
        config: &EndpointConfig,
        _ctx: &mut PipelineContext,
    ) -> Result<Vec<OutboundEnvelope>, PipelineError> {
        for envelope in &mut envelopes {
            let Some(message) = &envelope.message else {
                continue;
            };
            envelope.raw_body = config
                .serializer
                .serialize(message, &mut envelope.headers)?;
        }
        Ok(envelopes)
    }
}

/// Encrypts the raw body when the endpoint configures encryption; emits the
/// key id header so consumers can pick the matching key during rotation.
pub struct EncryptionBehavior;

impl ProducerBehavior for EncryptionBehavior {
    fn sort_index(&self) -> i32 {
        500
    }

    fn name(&self) -> &'static str {
        "encryption"
    }

    fn apply(
        &self,
        mut envelopes: Vec<OutboundEnvelope>,
        config: &EndpointConfig,
        _ctx: &mut PipelineContext,
    ) -> Result<Vec<OutboundEnvelope>, PipelineError> {
        let Some(settings) = &config.encryption else {
            return Ok(envelopes);
        };

        for envelope in &mut envelopes {
            envelope.raw_body = encrypt_body(&envelope.raw_body, settings)?;
            if let Some(key_id) = &settings.key_id {
                envelope.headers.set(names::ENCRYPTION_KEY_ID, key_id.clone());
            }
        }
        Ok(envelopes)
    }
}

/// Splits oversized bodies into chunk envelopes sharing the message id as
/// their sequence id. The final chunk carries `x-chunk-is-last=true`.
pub struct ChunkingBehavior;

impl ProducerBehavior for ChunkingBehavior {
    fn sort_index(&self) -> i32 {
        600
    }

    fn name(&self) -> &'static str {
        "chunking"
    }

    fn apply(
        &self,
        envelopes: Vec<OutboundEnvelope>,
        config: &EndpointConfig,
        _ctx: &mut PipelineContext,
    ) -> Result<Vec<OutboundEnvelope>, PipelineError> {
        let Some(chunk) = &config.chunk else {
            return Ok(envelopes);
        };

        let mut out = Vec::with_capacity(envelopes.len());
        for envelope in envelopes {
            if envelope.raw_body.len() <= chunk.size {
                out.push(envelope);
                continue;
            }

            let chunks_count = envelope.raw_body.len().div_ceil(chunk.size);
            // The sequence id is the message id; the enricher guarantees one
            // exists, but a raw replay may lack it.
            let sequence_id = envelope
                .headers
                .message_id()
                .map_or_else(|| uuid::Uuid::new_v4().to_string(), str::to_string);

            for (index, piece) in envelope.raw_body.chunks(chunk.size).enumerate() {
                let mut headers = envelope.headers.clone();
                headers.set(names::MESSAGE_ID, sequence_id.clone());
                headers.set(names::CHUNK_INDEX, index.to_string());
                headers.set(names::CHUNKS_COUNT, chunks_count.to_string());
                if index == chunks_count - 1 {
                    headers.set(names::CHUNK_IS_LAST, "true");
                }

                out.push(OutboundEnvelope {
                    message: None,
                    raw_body: piece.to_vec(),
                    headers,
                    endpoint: envelope.endpoint.clone(),
                    serialized_endpoint: envelope.serialized_endpoint.clone(),
                });
            }
        }
        Ok(out)
    }
}

/// The default behavior chain, already sorted.
#[must_use]
pub fn default_behaviors() -> Vec<Arc<dyn ProducerBehavior>> {
    vec![
        Arc::new(TraceContextInjector),
        Arc::new(MessageIdEnricher),
        Arc::new(ValidationBehavior),
        Arc::new(HeaderEnrichmentBehavior),
        Arc::new(SerializationBehavior),
        Arc::new(EncryptionBehavior),
        Arc::new(ChunkingBehavior),
    ]
}

/// Terminator of the producer pipeline.
pub trait ProduceStrategy: Send + Sync {
    /// Produce (or persist) the prepared envelopes.
    ///
    /// Returns the broker identifier of the last produced envelope for
    /// direct strategies, `None` for store-and-forward strategies.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::TransientBroker`] or
    /// [`PipelineError::Storage`] depending on the terminator.
    fn produce<'a>(
        &'a self,
        envelopes: Vec<OutboundEnvelope>,
        ctx: &'a mut PipelineContext,
    ) -> Pin<Box<dyn Future<Output = Result<Option<BrokerRecordId>, PipelineError>> + Send + 'a>>;
}

/// Produces straight to the broker client.
///
/// Multi-envelope sets (chunk sequences) go through the client's batch
/// produce, which is atomic when the client is configured transactionally;
/// otherwise a partial chunk sequence is permitted and the consumer side
/// aborts and retries it.
pub struct DirectProduceStrategy {
    client: Arc<dyn BrokerClient>,
}

impl DirectProduceStrategy {
    /// Create a strategy producing through `client`.
    #[must_use]
    pub fn new(client: Arc<dyn BrokerClient>) -> Self {
        Self { client }
    }
}

impl ProduceStrategy for DirectProduceStrategy {
    fn produce<'a>(
        &'a self,
        envelopes: Vec<OutboundEnvelope>,
        _ctx: &'a mut PipelineContext,
    ) -> Pin<Box<dyn Future<Output = Result<Option<BrokerRecordId>, PipelineError>> + Send + 'a>>
    {
        Box::pin(async move {
            let ids = self.client.produce_batch(&envelopes).await?;
            Ok(ids.into_iter().next_back())
        })
    }
}

/// Persists envelopes as outbox rows instead of producing them.
pub struct OutboxProduceStrategy {
    writer: Arc<dyn OutboxWriter>,
}

impl OutboxProduceStrategy {
    /// Create a strategy writing to the given outbox.
    #[must_use]
    pub fn new(writer: Arc<dyn OutboxWriter>) -> Self {
        Self { writer }
    }
}

impl ProduceStrategy for OutboxProduceStrategy {
    fn produce<'a>(
        &'a self,
        envelopes: Vec<OutboundEnvelope>,
        ctx: &'a mut PipelineContext,
    ) -> Pin<Box<dyn Future<Output = Result<Option<BrokerRecordId>, PipelineError>> + Send + 'a>>
    {
        Box::pin(async move {
            for envelope in envelopes {
                let message = NewOutboxMessage {
                    message_type: envelope.headers.message_type().map(str::to_string),
                    content: Some(envelope.raw_body),
                    headers: envelope.headers,
                    endpoint_name: envelope.endpoint.name,
                    serialized_endpoint: envelope.serialized_endpoint,
                };
                self.writer.add(message, ctx).await?;
            }
            Ok(None)
        })
    }
}

/// A producer bound to one endpoint resolver, configuration and strategy.
pub struct Producer {
    resolver: EndpointResolver,
    config: Arc<EndpointConfig>,
    behaviors: Vec<Arc<dyn ProducerBehavior>>,
    strategy: Arc<dyn ProduceStrategy>,
}

impl Producer {
    /// Create a producer with the default behavior chain.
    #[must_use]
    pub fn new(
        resolver: EndpointResolver,
        config: Arc<EndpointConfig>,
        strategy: Arc<dyn ProduceStrategy>,
    ) -> Self {
        Self::with_behaviors(resolver, config, strategy, default_behaviors())
    }

    /// Create a producer with a custom behavior chain; the chain is sorted
    /// by sort index so composition stays deterministic.
    #[must_use]
    pub fn with_behaviors(
        resolver: EndpointResolver,
        config: Arc<EndpointConfig>,
        strategy: Arc<dyn ProduceStrategy>,
        mut behaviors: Vec<Arc<dyn ProducerBehavior>>,
    ) -> Self {
        behaviors.sort_by_key(|behavior| behavior.sort_index());
        Self {
            resolver,
            config,
            behaviors,
            strategy,
        }
    }

    /// Produce a message.
    ///
    /// Returns the broker identifier for direct strategies, `None` for the
    /// outbox strategy.
    ///
    /// # Errors
    ///
    /// Returns a [`PipelineError`] when resolution, any behavior, or the
    /// strategy terminator fails.
    pub async fn produce(
        &self,
        message: DecodedMessage,
        headers: Option<Headers>,
    ) -> Result<Option<BrokerRecordId>, PipelineError> {
        let mut ctx = PipelineContext::detached();
        self.produce_with_context(message, headers, &mut ctx).await
    }

    /// Produce a message under an explicit pipeline context (enlisted
    /// transaction, shared trace context, shutdown token).
    ///
    /// # Errors
    ///
    /// Returns a [`PipelineError`] when resolution, any behavior, or the
    /// strategy terminator fails.
    pub async fn produce_with_context(
        &self,
        message: DecodedMessage,
        headers: Option<Headers>,
        ctx: &mut PipelineContext,
    ) -> Result<Option<BrokerRecordId>, PipelineError> {
        let endpoint = self.resolver.resolve(&message)?;
        let message_type = message.type_name.clone();

        let mut envelope =
            OutboundEnvelope::new(message, headers.unwrap_or_default(), endpoint.clone());
        if self.resolver.is_dynamic() {
            envelope.serialized_endpoint = Some(endpoint.to_persisted()?);
        }

        let mut envelopes = vec![envelope];
        for behavior in &self.behaviors {
            envelopes = behavior.apply(envelopes, &self.config, ctx)?;
        }

        tracing::debug!(
            endpoint = %endpoint.display_name(),
            message_type = %message_type,
            envelopes = envelopes.len(),
            "producing message"
        );
        self.strategy.produce(envelopes, ctx).await
    }
}

/// Routes application messages to producers by message type name.
#[derive(Default)]
pub struct OutboundRouter {
    routes: Vec<(String, Arc<Producer>)>,
}

impl OutboundRouter {
    /// Create an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Route messages of `type_name` to `producer`. A type may be routed to
    /// several producers; each receives every message of that type.
    pub fn add_route(&mut self, type_name: impl Into<String>, producer: Arc<Producer>) {
        self.routes.push((type_name.into(), producer));
    }

    /// Produce `message` through every matching route.
    ///
    /// Messages without a matching route are logged and dropped, mirroring
    /// the behavior of publishing to a topic nobody configured.
    ///
    /// # Errors
    ///
    /// Returns the first [`PipelineError`] raised by a routed producer.
    pub async fn publish(
        &self,
        message: DecodedMessage,
        headers: Option<Headers>,
    ) -> Result<Vec<BrokerRecordId>, PipelineError> {
        let mut ids = Vec::new();
        let mut routed = false;

        for (type_name, producer) in &self.routes {
            if type_name != &message.type_name {
                continue;
            }
            routed = true;
            if let Some(id) = producer.produce(message.clone(), headers.clone()).await? {
                ids.push(id);
            }
        }

        if !routed {
            tracing::warn!(
                message_type = %message.type_name,
                "no endpoint configured for message type, message dropped"
            );
        }
        Ok(ids)
    }
}

/// Producer used by the outbox worker: bypasses routing and every behavior,
/// replaying the stored body and headers bit-exactly.
pub struct DelegatedProducer {
    client: Arc<dyn BrokerClient>,
}

impl DelegatedProducer {
    /// Create a delegated producer over `client`.
    #[must_use]
    pub fn new(client: Arc<dyn BrokerClient>) -> Self {
        Self { client }
    }

    /// Reconstruct the endpoint of a stored message: the persisted endpoint
    /// form when present, the raw endpoint name otherwise. When raw names
    /// collide across configurations the first matching one wins.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Serialization`] when the persisted endpoint
    /// form is malformed.
    pub fn resolve_endpoint(message: &OutboxMessage) -> Result<Endpoint, PipelineError> {
        match &message.serialized_endpoint {
            Some(raw) => Endpoint::from_persisted(raw),
            None => Ok(Endpoint::new(message.endpoint_name.clone())),
        }
    }

    /// Produce a stored outbox message.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::TransientBroker`] when the produce fails;
    /// the caller leaves the row in place and retries on its next tick.
    pub async fn produce_stored(
        &self,
        message: &OutboxMessage,
    ) -> Result<BrokerRecordId, PipelineError> {
        let endpoint = Self::resolve_endpoint(message)?;
        let envelope = OutboundEnvelope::from_raw(
            message.content.clone().unwrap_or_default(),
            message.headers.clone(),
            endpoint,
        );
        self.client.produce(&envelope).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use crate::broker::{ClientStatus, RawRecord, RecordStream};
    use crate::context::ShutdownToken;
    use crate::encryption::{EncryptionSettings, decrypt_body};
    use crate::endpoint::ChunkSettings;
    use std::sync::Mutex;
    use tokio::sync::watch;

    /// Test double recording produced envelopes and assigning offsets.
    struct RecordingClient {
        produced: Mutex<Vec<OutboundEnvelope>>,
        status_tx: watch::Sender<ClientStatus>,
    }

    impl RecordingClient {
        fn new() -> Self {
            Self {
                produced: Mutex::new(Vec::new()),
                status_tx: watch::channel(ClientStatus::Initialized).0,
            }
        }
    }

    impl BrokerClient for RecordingClient {
        fn status(&self) -> ClientStatus {
            ClientStatus::Initialized
        }

        fn status_watch(&self) -> watch::Receiver<ClientStatus> {
            self.status_tx.subscribe()
        }

        fn connect(
            &self,
        ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + '_>> {
            Box::pin(async { Ok(()) })
        }

        fn disconnect(
            &self,
        ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + '_>> {
            Box::pin(async { Ok(()) })
        }

        fn produce<'a>(
            &'a self,
            envelope: &'a OutboundEnvelope,
        ) -> Pin<Box<dyn Future<Output = Result<BrokerRecordId, PipelineError>> + Send + 'a>>
        {
            Box::pin(async move {
                let mut produced = self.produced.lock().unwrap();
                produced.push(envelope.clone());
                #[allow(clippy::cast_possible_wrap)]
                Ok(BrokerRecordId::TopicPartitionOffset {
                    topic: envelope.endpoint.name.clone(),
                    partition: envelope.endpoint.partition.unwrap_or(0),
                    offset: produced.len() as i64 - 1,
                })
            })
        }

        fn consume(
            &self,
            _shutdown: ShutdownToken,
        ) -> Pin<Box<dyn Future<Output = Result<RecordStream, PipelineError>> + Send + '_>>
        {
            Box::pin(async {
                Ok(Box::pin(futures::stream::empty()) as RecordStream)
            })
        }

        fn commit<'a>(
            &'a self,
            _ids: &'a [BrokerRecordId],
        ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn direct_producer(
        client: Arc<RecordingClient>,
        config: EndpointConfig,
    ) -> Producer {
        Producer::new(
            EndpointResolver::Static(Endpoint::new("topic-a")),
            Arc::new(config),
            Arc::new(DirectProduceStrategy::new(client)),
        )
    }

    fn order(n: i64) -> DecodedMessage {
        DecodedMessage::new("Order.v1".into(), serde_json::json!({ "n": n }))
    }

    #[tokio::test]
    async fn produce_serializes_and_enriches_headers() {
        let client = Arc::new(RecordingClient::new());
        let producer = direct_producer(Arc::clone(&client), EndpointConfig::default());

        let id = producer.produce(order(1), None).await.unwrap();
        assert!(id.is_some());

        let produced = client.produced.lock().unwrap();
        assert_eq!(produced.len(), 1);
        assert_eq!(produced[0].raw_body, br#"{"n":1}"#);
        assert_eq!(produced[0].headers.message_type(), Some("Order.v1"));
        assert!(produced[0].headers.message_id().is_some());
        assert!(produced[0].headers.contains(names::TRACEPARENT));
    }

    #[tokio::test]
    async fn chunking_splits_and_marks_last() {
        let client = Arc::new(RecordingClient::new());
        let config = EndpointConfig::builder()
            .chunk(ChunkSettings::new(4).unwrap())
            .build();
        let producer = direct_producer(Arc::clone(&client), config);

        // {"n":12345} is 11 bytes: 3 chunks of <= 4 bytes.
        producer.produce(order(12345), None).await.unwrap();

        let produced = client.produced.lock().unwrap();
        assert_eq!(produced.len(), 3);

        let sequence_id = produced[0].headers.message_id().unwrap().to_string();
        let mut reassembled = Vec::new();
        for (i, chunk) in produced.iter().enumerate() {
            assert_eq!(chunk.headers.message_id(), Some(sequence_id.as_str()));
            assert_eq!(chunk.headers.chunk_index(), Some(u32::try_from(i).unwrap()));
            assert_eq!(chunk.headers.chunks_count(), Some(3));
            reassembled.extend_from_slice(&chunk.raw_body);
        }
        assert!(produced[2].headers.is_last_chunk());
        assert!(!produced[0].headers.is_last_chunk());
        assert_eq!(reassembled, br#"{"n":12345}"#);
    }

    #[tokio::test]
    async fn encryption_wraps_body_and_emits_key_id() {
        let client = Arc::new(RecordingClient::new());
        let settings = EncryptionSettings::new([1; 32]).with_key_id("key-1");
        let config = EndpointConfig::builder()
            .encryption(settings.clone())
            .build();
        let producer = direct_producer(Arc::clone(&client), config);

        producer.produce(order(1), None).await.unwrap();

        let produced = client.produced.lock().unwrap();
        assert_eq!(
            produced[0].headers.get(names::ENCRYPTION_KEY_ID),
            Some("key-1")
        );
        assert_ne!(produced[0].raw_body, br#"{"n":1}"#);
        assert_eq!(
            decrypt_body(&produced[0].raw_body, &settings).unwrap(),
            br#"{"n":1}"#
        );
    }

    #[tokio::test]
    async fn validation_fail_mode_rejects_invalid_messages() {
        struct RequirePositive;
        impl crate::endpoint::MessageValidator for RequirePositive {
            fn validate(&self, message: &DecodedMessage) -> Result<(), String> {
                if message.payload["n"].as_i64().unwrap_or(-1) >= 0 {
                    Ok(())
                } else {
                    Err("n must be non-negative".into())
                }
            }
        }

        let client = Arc::new(RecordingClient::new());
        let config = EndpointConfig::builder()
            .validation(ValidationMode::Fail)
            .validator(Arc::new(RequirePositive))
            .build();
        let producer = direct_producer(Arc::clone(&client), config);

        assert!(producer.produce(order(-1), None).await.is_err());
        assert!(producer.produce(order(1), None).await.is_ok());
        assert_eq!(client.produced.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn outbox_strategy_persists_instead_of_producing() {
        struct CollectingWriter {
            rows: Mutex<Vec<NewOutboxMessage>>,
        }
        impl OutboxWriter for CollectingWriter {
            fn add<'a>(
                &'a self,
                message: NewOutboxMessage,
                _ctx: &'a mut PipelineContext,
            ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>>
            {
                Box::pin(async move {
                    self.rows.lock().unwrap().push(message);
                    Ok(())
                })
            }
        }

        let writer = Arc::new(CollectingWriter {
            rows: Mutex::new(Vec::new()),
        });
        let producer = Producer::new(
            EndpointResolver::Static(Endpoint::new("topic-a")),
            Arc::new(EndpointConfig::default()),
            Arc::new(OutboxProduceStrategy::new(Arc::clone(&writer) as _)),
        );

        let id = producer.produce(order(7), None).await.unwrap();
        assert!(id.is_none());

        let rows = writer.rows.lock().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].endpoint_name, "topic-a");
        assert_eq!(rows[0].message_type.as_deref(), Some("Order.v1"));
        assert_eq!(rows[0].content.as_deref(), Some(br#"{"n":7}"#.as_slice()));
    }

    #[tokio::test]
    async fn router_routes_by_type_name() {
        let client = Arc::new(RecordingClient::new());
        let producer = Arc::new(direct_producer(
            Arc::clone(&client),
            EndpointConfig::default(),
        ));

        let mut router = OutboundRouter::new();
        router.add_route("Order.v1", producer);

        let ids = router.publish(order(1), None).await.unwrap();
        assert_eq!(ids.len(), 1);

        let ids = router
            .publish(
                DecodedMessage::new("Unrouted.v1".into(), serde_json::json!({})),
                None,
            )
            .await
            .unwrap();
        assert!(ids.is_empty());
        assert_eq!(client.produced.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delegated_producer_replays_stored_bytes() {
        let client = Arc::new(RecordingClient::new());
        let delegated = DelegatedProducer::new(Arc::clone(&client) as _);

        let mut headers = Headers::new();
        headers.insert(names::MESSAGE_ID, "m-1");
        headers.insert(names::MESSAGE_TYPE, "Order.v1");

        let stored = OutboxMessage {
            id: 1,
            message_type: Some("Order.v1".into()),
            content: Some(br#"{"n":9}"#.to_vec()),
            headers: headers.clone(),
            endpoint_name: "topic-a".into(),
            serialized_endpoint: None,
            created: chrono::Utc::now(),
        };

        delegated.produce_stored(&stored).await.unwrap();

        let produced = client.produced.lock().unwrap();
        assert_eq!(produced[0].raw_body, br#"{"n":9}"#);
        assert_eq!(produced[0].headers, headers);
        assert_eq!(produced[0].endpoint, Endpoint::new("topic-a"));
    }

    #[tokio::test]
    async fn delegated_producer_prefers_persisted_endpoint() {
        let stored = OutboxMessage {
            id: 1,
            message_type: None,
            content: None,
            headers: Headers::new(),
            endpoint_name: "orders".into(),
            serialized_endpoint: Some(
                Endpoint::new("orders-acme").with_partition(2).to_persisted().unwrap(),
            ),
            created: chrono::Utc::now(),
        };

        let endpoint = DelegatedProducer::resolve_endpoint(&stored).unwrap();
        assert_eq!(endpoint, Endpoint::new("orders-acme").with_partition(2));
    }

    #[test]
    fn behavior_chain_sorts_by_index() {
        struct Tagger(i32);
        impl ProducerBehavior for Tagger {
            fn sort_index(&self) -> i32 {
                self.0
            }
            fn name(&self) -> &'static str {
                "tagger"
            }
            fn apply(
                &self,
                mut envelopes: Vec<OutboundEnvelope>,
                _config: &EndpointConfig,
                _ctx: &mut PipelineContext,
            ) -> Result<Vec<OutboundEnvelope>, PipelineError> {
                for envelope in &mut envelopes {
                    envelope.headers.insert("x-order", self.0.to_string());
                }
                Ok(envelopes)
            }
        }

        let producer = Producer::with_behaviors(
            EndpointResolver::Static(Endpoint::new("t")),
            Arc::new(EndpointConfig::default()),
            Arc::new(DirectProduceStrategy::new(Arc::new(RecordingClient::new()))),
            vec![Arc::new(Tagger(300)), Arc::new(Tagger(100))],
        );

        let mut ctx = PipelineContext::detached();
        let envelope = OutboundEnvelope::new(order(1), Headers::new(), Endpoint::new("t"));
        let mut envelopes = vec![envelope];
        for behavior in &producer.behaviors {
            envelopes = behavior
                .apply(envelopes, &producer.config, &mut ctx)
                .unwrap();
        }

        let values: Vec<_> = envelopes[0].headers.get_all("x-order").collect();
        assert_eq!(values, vec!["100", "300"]);
    }
}
