//! The error taxonomy shared by every pipeline, store and client.
//!
//! All failures surfaced by the framework are classified into one of six
//! kinds. The kind decides how a failure is handled: configuration errors are
//! fatal at startup, transient broker errors are retriable, serialization and
//! processing errors are routed through the endpoint's error policy, sequence
//! errors abort the affected sequence, and storage errors make background
//! workers back off while consumers surface them fatally.

use thiserror::Error;

/// The abstract failure kinds of the integration core.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Endpoint, serializer or settings invalid; fatal at startup.
    Configuration,
    /// Connection lost, produce timeout; retriable.
    TransientBroker,
    /// Payload or header malformed; routed through error policies.
    Serialization,
    /// Chunk out of order, missing last chunk; aborts the sequence.
    Sequence,
    /// Subscriber threw; routed through error policies.
    Processing,
    /// Outbox or offset database failure.
    Storage,
}

impl ErrorKind {
    /// Stable lowercase name used in structured log fields.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::TransientBroker => "transient-broker",
            Self::Serialization => "serialization",
            Self::Sequence => "sequence",
            Self::Processing => "processing",
            Self::Storage => "storage",
        }
    }
}

/// Errors raised by the producer and consumer pipelines and their
/// collaborators.
#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    /// Endpoint, serializer, or settings invalid; fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Connection lost, produce timeout; retriable.
    #[error("transient broker error: {0}")]
    TransientBroker(String),

    /// Payload or header malformed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Chunk out of order, missing last chunk, aborted sequence.
    #[error("sequence error: {0}")]
    Sequence(String),

    /// The subscriber failed while handling the message.
    #[error("processing error: {0}")]
    Processing(String),

    /// Outbox or offset store failure.
    #[error("storage error: {0}")]
    Storage(String),
}

impl PipelineError {
    /// The abstract kind of this failure.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::TransientBroker(_) => ErrorKind::TransientBroker,
            Self::Serialization(_) => ErrorKind::Serialization,
            Self::Sequence(_) => ErrorKind::Sequence,
            Self::Processing(_) => ErrorKind::Processing,
            Self::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Whether retrying the same operation can reasonably succeed.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::TransientBroker(_) | Self::Processing(_) | Self::Storage(_)
        )
    }

    /// Classify an arbitrary error after flattening it to its root cause.
    ///
    /// Transport adapters wrap their library errors through this single entry
    /// point so nested failure chains (wrapped causes, aggregated
    /// multi-failures) are consistently reduced before classification.
    #[must_use]
    pub fn classified(kind: ErrorKind, error: &(dyn std::error::Error + 'static)) -> Self {
        let message = flatten(error);
        match kind {
            ErrorKind::Configuration => Self::Configuration(message),
            ErrorKind::TransientBroker => Self::TransientBroker(message),
            ErrorKind::Serialization => Self::Serialization(message),
            ErrorKind::Sequence => Self::Sequence(message),
            ErrorKind::Processing => Self::Processing(message),
            ErrorKind::Storage => Self::Storage(message),
        }
    }
}

/// Reduce an error chain to the display form of its root cause.
///
/// Equivalent failures may arrive arbitrarily wrapped depending on the
/// transport; policies and logs always see the innermost cause.
#[must_use]
pub fn flatten(error: &(dyn std::error::Error + 'static)) -> String {
    let mut current = error;
    while let Some(source) = current.source() {
        current = source;
    }
    current.to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;

    #[derive(Error, Debug)]
    #[error("outer: {inner}")]
    struct Outer {
        #[source]
        inner: Inner,
    }

    #[derive(Error, Debug)]
    #[error("root cause")]
    struct Inner;

    #[test]
    fn kind_matches_variant() {
        assert_eq!(
            PipelineError::Serialization("x".into()).kind(),
            ErrorKind::Serialization
        );
        assert_eq!(
            PipelineError::TransientBroker("x".into()).kind(),
            ErrorKind::TransientBroker
        );
    }

    #[test]
    fn flatten_unwraps_to_root_cause() {
        let error = Outer { inner: Inner };
        assert_eq!(flatten(&error), "root cause");
    }

    #[test]
    fn classified_carries_flattened_message() {
        let error = Outer { inner: Inner };
        let classified = PipelineError::classified(ErrorKind::Processing, &error);
        assert_eq!(classified.to_string(), "processing error: root cause");
    }

    #[test]
    fn retriable_kinds() {
        assert!(PipelineError::TransientBroker("x".into()).is_retriable());
        assert!(!PipelineError::Configuration("x".into()).is_retriable());
    }
}
