//! Endpoints: the concrete targets of produce and consume operations.
//!
//! An [`Endpoint`] is a resolved broker destination (topic plus optional
//! partition). Its behavior is described by an [`EndpointConfig`]: serializer,
//! encryption, chunking, batching, validation, enrichers and error policy.
//! Resolution happens through an [`EndpointResolver`], either static or
//! computed per message; dynamic resolvers round-trip their endpoints through
//! a stable string so the outbox can persist them.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::encryption::EncryptionSettings;
use crate::error::PipelineError;
use crate::error_policy::ErrorPolicy;
use crate::headers::Headers;
use crate::message::{DecodedMessage, JsonMessageSerializer, MessageSerializer};

/// A resolved broker destination.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Topic (or equivalent) name.
    pub name: String,
    /// Explicit partition, when the producer pins one.
    pub partition: Option<i32>,
}

impl Endpoint {
    /// An endpoint without a pinned partition.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            partition: None,
        }
    }

    /// Pin the endpoint to a partition.
    #[must_use]
    pub const fn with_partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    /// Display name used in log records (`topic` or `topic[3]`).
    #[must_use]
    pub fn display_name(&self) -> String {
        match self.partition {
            Some(partition) => format!("{}[{partition}]", self.name),
            None => self.name.clone(),
        }
    }

    /// Stable string form used for outbox persistence.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Serialization`] when encoding fails, which
    /// does not happen for well-formed endpoints.
    pub fn to_persisted(&self) -> Result<String, PipelineError> {
        serde_json::to_string(self).map_err(|e| PipelineError::Serialization(e.to_string()))
    }

    /// Parse the stable string form written by [`Endpoint::to_persisted`].
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Serialization`] when the string is not a
    /// persisted endpoint.
    pub fn from_persisted(raw: &str) -> Result<Self, PipelineError> {
        serde_json::from_str(raw).map_err(|e| PipelineError::Serialization(e.to_string()))
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// How message validation failures are treated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ValidationMode {
    /// Do not validate.
    #[default]
    Ignore,
    /// Validate and log a warning on failure, but produce anyway.
    LogWarning,
    /// Validate and fail the produce operation on failure.
    Fail,
}

/// Chunking settings of an endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkSettings {
    /// Maximum body size per chunk, in bytes.
    pub size: usize,
}

impl ChunkSettings {
    /// Chunk bodies larger than `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Configuration`] when `size` is zero.
    pub fn new(size: usize) -> Result<Self, PipelineError> {
        if size == 0 {
            return Err(PipelineError::Configuration(
                "chunk size must be greater than zero".into(),
            ));
        }
        Ok(Self { size })
    }
}

/// Batch settings of a consuming endpoint: a window of `size` envelopes or
/// `window` elapsed time, whichever fills first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchSettings {
    /// Maximum number of envelopes per batch.
    pub size: usize,
    /// Maximum time a batch stays open.
    pub window: Duration,
}

impl BatchSettings {
    /// Create batch settings.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Configuration`] when `size` is zero.
    pub fn new(size: usize, window: Duration) -> Result<Self, PipelineError> {
        if size == 0 {
            return Err(PipelineError::Configuration(
                "batch size must be greater than zero".into(),
            ));
        }
        Ok(Self { size, window })
    }
}

/// A configured header enricher applied on the outbound path.
pub trait HeaderEnricher: Send + Sync {
    /// Add or replace headers for the message being produced.
    fn enrich(&self, message: &DecodedMessage, headers: &mut Headers);
}

/// A configured message validator.
pub trait MessageValidator: Send + Sync {
    /// Validate the message; return a description of the violation on
    /// failure.
    ///
    /// # Errors
    ///
    /// Returns the human-readable violation when the message is invalid.
    fn validate(&self, message: &DecodedMessage) -> Result<(), String>;
}

/// The full configuration of one endpoint.
#[derive(Clone)]
pub struct EndpointConfig {
    /// Serializer used for bodies on this endpoint.
    pub serializer: Arc<dyn MessageSerializer>,
    /// Payload encryption, when configured.
    pub encryption: Option<EncryptionSettings>,
    /// Chunking of oversized bodies, when configured.
    pub chunk: Option<ChunkSettings>,
    /// Batched consumption, when configured.
    pub batch: Option<BatchSettings>,
    /// Policy applied when inbound processing fails.
    pub error_policy: ErrorPolicy,
    /// Outbound validation mode.
    pub validation: ValidationMode,
    /// Validator consulted per the validation mode.
    pub validator: Option<Arc<dyn MessageValidator>>,
    /// Outbound header enrichers, applied in order.
    pub enrichers: Vec<Arc<dyn HeaderEnricher>>,
    /// Declared message type, the deserialization fallback when the wire
    /// carries no type header.
    pub message_type: Option<String>,
    /// Number of envelopes dispatched concurrently within one partition.
    /// `1` (the default) preserves strict ordering; higher values trade
    /// ordering of dispatch for throughput while commits stay in consume
    /// order.
    pub parallel_degree: usize,
}

impl EndpointConfig {
    /// Start building a configuration; defaults to the JSON serializer, no
    /// encryption, no chunking, no batching, stop-on-error.
    #[must_use]
    pub fn builder() -> EndpointConfigBuilder {
        EndpointConfigBuilder::default()
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl std::fmt::Debug for EndpointConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointConfig")
            .field("encryption", &self.encryption)
            .field("chunk", &self.chunk)
            .field("batch", &self.batch)
            .field("error_policy", &self.error_policy)
            .field("validation", &self.validation)
            .field("enrichers", &self.enrichers.len())
            .field("message_type", &self.message_type)
            .field("parallel_degree", &self.parallel_degree)
            .finish()
    }
}

/// Builder for [`EndpointConfig`].
#[derive(Default)]
pub struct EndpointConfigBuilder {
    serializer: Option<Arc<dyn MessageSerializer>>,
    encryption: Option<EncryptionSettings>,
    chunk: Option<ChunkSettings>,
    batch: Option<BatchSettings>,
    error_policy: Option<ErrorPolicy>,
    validation: ValidationMode,
    validator: Option<Arc<dyn MessageValidator>>,
    enrichers: Vec<Arc<dyn HeaderEnricher>>,
    message_type: Option<String>,
    parallel_degree: Option<usize>,
}

impl EndpointConfigBuilder {
    /// Use a custom serializer.
    #[must_use]
    pub fn serializer(mut self, serializer: Arc<dyn MessageSerializer>) -> Self {
        self.serializer = Some(serializer);
        self
    }

    /// Encrypt payloads with the given settings.
    #[must_use]
    pub fn encryption(mut self, settings: EncryptionSettings) -> Self {
        self.encryption = Some(settings);
        self
    }

    /// Chunk bodies larger than the configured size.
    #[must_use]
    pub const fn chunk(mut self, settings: ChunkSettings) -> Self {
        self.chunk = Some(settings);
        self
    }

    /// Consume in batches.
    #[must_use]
    pub const fn batch(mut self, settings: BatchSettings) -> Self {
        self.batch = Some(settings);
        self
    }

    /// Apply the given error policy to inbound failures.
    #[must_use]
    pub fn error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = Some(policy);
        self
    }

    /// Set the validation mode.
    #[must_use]
    pub const fn validation(mut self, mode: ValidationMode) -> Self {
        self.validation = mode;
        self
    }

    /// Set the validator consulted per the validation mode.
    #[must_use]
    pub fn validator(mut self, validator: Arc<dyn MessageValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Add an outbound header enricher.
    #[must_use]
    pub fn enricher(mut self, enricher: Arc<dyn HeaderEnricher>) -> Self {
        self.enrichers.push(enricher);
        self
    }

    /// Declare the endpoint's message type, used as the deserialization
    /// fallback when the wire carries no type header.
    #[must_use]
    pub fn message_type(mut self, type_name: impl Into<String>) -> Self {
        self.message_type = Some(type_name.into());
        self
    }

    /// Dispatch up to `degree` envelopes of one partition concurrently.
    ///
    /// # Panics
    ///
    /// Panics when `degree` is zero.
    #[must_use]
    pub fn parallel_degree(mut self, degree: usize) -> Self {
        assert!(degree > 0, "parallel_degree must be greater than 0");
        self.parallel_degree = Some(degree);
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> EndpointConfig {
        EndpointConfig {
            serializer: self
                .serializer
                .unwrap_or_else(|| Arc::new(JsonMessageSerializer::new())),
            encryption: self.encryption,
            chunk: self.chunk,
            batch: self.batch,
            error_policy: self.error_policy.unwrap_or_default(),
            validation: self.validation,
            validator: self.validator,
            enrichers: self.enrichers,
            message_type: self.message_type,
            parallel_degree: self.parallel_degree.unwrap_or(1),
        }
    }
}

/// Computes the endpoint for a message on the outbound path.
pub trait DynamicEndpointResolver: Send + Sync {
    /// Resolve the endpoint for the given message.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Configuration`] when no endpoint can be
    /// derived from the message.
    fn resolve(&self, message: &DecodedMessage) -> Result<Endpoint, PipelineError>;
}

/// Static or dynamic endpoint resolution.
#[derive(Clone)]
pub enum EndpointResolver {
    /// Every message goes to the same endpoint.
    Static(Endpoint),
    /// The endpoint is computed from message content.
    Dynamic(Arc<dyn DynamicEndpointResolver>),
}

impl EndpointResolver {
    /// Resolve the endpoint for a message.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Configuration`] when a dynamic resolver
    /// cannot derive an endpoint.
    pub fn resolve(&self, message: &DecodedMessage) -> Result<Endpoint, PipelineError> {
        match self {
            Self::Static(endpoint) => Ok(endpoint.clone()),
            Self::Dynamic(resolver) => resolver.resolve(message),
        }
    }

    /// Whether this resolver computes endpoints per message. Dynamic
    /// endpoints are persisted alongside outbox rows so the worker can
    /// reconstruct them without re-running the resolver.
    #[must_use]
    pub const fn is_dynamic(&self) -> bool {
        matches!(self, Self::Dynamic(_))
    }
}

impl std::fmt::Debug for EndpointResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Static(endpoint) => f.debug_tuple("Static").field(endpoint).finish(),
            Self::Dynamic(_) => f.write_str("Dynamic"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;

    #[test]
    fn display_name_includes_partition() {
        assert_eq!(Endpoint::new("orders").display_name(), "orders");
        assert_eq!(
            Endpoint::new("orders").with_partition(3).display_name(),
            "orders[3]"
        );
    }

    #[test]
    fn persisted_endpoint_roundtrip() {
        let endpoint = Endpoint::new("orders").with_partition(1);
        let raw = endpoint.to_persisted().unwrap();
        assert_eq!(Endpoint::from_persisted(&raw).unwrap(), endpoint);
    }

    #[test]
    fn chunk_settings_reject_zero() {
        assert!(ChunkSettings::new(0).is_err());
        assert!(ChunkSettings::new(4096).is_ok());
    }

    #[test]
    fn batch_settings_reject_zero() {
        assert!(BatchSettings::new(0, Duration::from_secs(1)).is_err());
    }

    #[test]
    fn builder_defaults() {
        let config = EndpointConfig::default();
        assert!(config.encryption.is_none());
        assert!(config.chunk.is_none());
        assert!(config.batch.is_none());
        assert_eq!(config.parallel_degree, 1);
        assert!(matches!(config.error_policy, ErrorPolicy::Stop));
    }

    #[test]
    fn dynamic_resolver_resolves_per_message() {
        struct ByTenant;
        impl DynamicEndpointResolver for ByTenant {
            fn resolve(&self, message: &DecodedMessage) -> Result<Endpoint, PipelineError> {
                let tenant = message.payload["tenant"].as_str().ok_or_else(|| {
                    PipelineError::Configuration("message has no tenant".into())
                })?;
                Ok(Endpoint::new(format!("orders-{tenant}")))
            }
        }

        let resolver = EndpointResolver::Dynamic(Arc::new(ByTenant));
        let message =
            DecodedMessage::new("Order.v1".into(), serde_json::json!({ "tenant": "acme" }));

        assert_eq!(
            resolver.resolve(&message).unwrap(),
            Endpoint::new("orders-acme")
        );
        assert!(resolver.is_dynamic());
    }
}
