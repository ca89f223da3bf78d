//! Typed messages and the serializer contract.
//!
//! A [`DecodedMessage`] is the typed form of a payload: a stable type name
//! plus a JSON document. Applications work with their own `serde` types and
//! convert at the edge; the type name is what routes a payload to the right
//! subscriber and, on the wire, travels in the `x-message-type` header.
//!
//! The [`MessageSerializer`] contract turns decoded messages into body bytes
//! and back. The default [`JsonMessageSerializer`] is polymorphic: it writes
//! the type header on serialize and resolves the type from the header (or an
//! endpoint-declared fallback) on deserialize.

use crate::error::PipelineError;
use crate::headers::{Headers, names};
use serde::{Serialize, de::DeserializeOwned};
use std::fmt;

/// A message in its decoded, typed form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedMessage {
    /// Stable type name (e.g. `"OrderPlaced.v1"`).
    pub type_name: String,
    /// The message content as a JSON document.
    pub payload: serde_json::Value,
}

impl DecodedMessage {
    /// Create a decoded message from a raw JSON payload.
    #[must_use]
    pub const fn new(type_name: String, payload: serde_json::Value) -> Self {
        Self { type_name, payload }
    }

    /// Create a decoded message from an application type.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Serialization`] when the value cannot be
    /// represented as JSON.
    pub fn from_value<T: Serialize>(
        type_name: impl Into<String>,
        value: &T,
    ) -> Result<Self, PipelineError> {
        Ok(Self {
            type_name: type_name.into(),
            payload: serde_json::to_value(value)
                .map_err(|e| PipelineError::Serialization(e.to_string()))?,
        })
    }

    /// Convert the payload back into an application type.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Serialization`] when the payload does not
    /// match the target type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, PipelineError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| PipelineError::Serialization(e.to_string()))
    }
}

impl fmt::Display for DecodedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.type_name)
    }
}

/// Contract for turning decoded messages into body bytes and back.
///
/// Implementations may add headers on serialize (the default implementation
/// writes `x-message-type`) and consult them on deserialize.
pub trait MessageSerializer: Send + Sync {
    /// Serialize a message into body bytes, adding any headers the
    /// deserializing side will need.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Serialization`] when the payload cannot be
    /// encoded.
    fn serialize(
        &self,
        message: &DecodedMessage,
        headers: &mut Headers,
    ) -> Result<Vec<u8>, PipelineError>;

    /// Deserialize body bytes into a message.
    ///
    /// `fallback_type` is the endpoint's declared message type, used when the
    /// wire carries no type header.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Serialization`] when the body is malformed or
    /// the message type cannot be determined.
    fn deserialize(
        &self,
        body: &[u8],
        headers: &Headers,
        fallback_type: Option<&str>,
    ) -> Result<DecodedMessage, PipelineError>;
}

/// JSON serializer; the default for every endpoint.
///
/// Polymorphic: the concrete type travels in the `x-message-type` header.
/// With `require_headers` set, a missing type header fails the envelope
/// instead of falling back to the endpoint's declared type.
#[derive(Clone, Debug, Default)]
pub struct JsonMessageSerializer {
    require_headers: bool,
}

impl JsonMessageSerializer {
    /// Create a serializer with the default settings.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            require_headers: false,
        }
    }

    /// Fail deserialization when the `x-message-type` header is missing,
    /// instead of falling back to the endpoint's declared type.
    #[must_use]
    pub const fn require_headers(mut self) -> Self {
        self.require_headers = true;
        self
    }
}

impl MessageSerializer for JsonMessageSerializer {
    fn serialize(
        &self,
        message: &DecodedMessage,
        headers: &mut Headers,
    ) -> Result<Vec<u8>, PipelineError> {
        headers.set(names::MESSAGE_TYPE, message.type_name.clone());
        serde_json::to_vec(&message.payload)
            .map_err(|e| PipelineError::Serialization(e.to_string()))
    }

    fn deserialize(
        &self,
        body: &[u8],
        headers: &Headers,
        fallback_type: Option<&str>,
    ) -> Result<DecodedMessage, PipelineError> {
        let type_name = match headers.message_type() {
            Some(name) => name.to_string(),
            None if self.require_headers => {
                return Err(PipelineError::Serialization(format!(
                    "required header '{}' is missing",
                    names::MESSAGE_TYPE
                )));
            }
            None => fallback_type
                .ok_or_else(|| {
                    PipelineError::Serialization(format!(
                        "no '{}' header and no message type declared on the endpoint",
                        names::MESSAGE_TYPE
                    ))
                })?
                .to_string(),
        };

        let payload = if body.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(body)
                .map_err(|e| PipelineError::Serialization(e.to_string()))?
        };

        Ok(DecodedMessage { type_name, payload })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Order {
        n: i64,
    }

    #[test]
    fn serialize_writes_type_header() {
        let serializer = JsonMessageSerializer::new();
        let message = DecodedMessage::from_value("Order.v1", &Order { n: 1 }).unwrap();
        let mut headers = Headers::new();

        let body = serializer.serialize(&message, &mut headers).unwrap();

        assert_eq!(headers.message_type(), Some("Order.v1"));
        assert_eq!(body, br#"{"n":1}"#);
    }

    #[test]
    fn roundtrip_is_identity() {
        let serializer = JsonMessageSerializer::new();
        let message = DecodedMessage::from_value("Order.v1", &Order { n: 42 }).unwrap();
        let mut headers = Headers::new();

        let body = serializer.serialize(&message, &mut headers).unwrap();
        let decoded = serializer.deserialize(&body, &headers, None).unwrap();

        assert_eq!(decoded, message);
        assert_eq!(decoded.decode::<Order>().unwrap(), Order { n: 42 });
    }

    #[test]
    fn deserialize_falls_back_to_declared_type() {
        let serializer = JsonMessageSerializer::new();
        let decoded = serializer
            .deserialize(br#"{"n":1}"#, &Headers::new(), Some("Order.v1"))
            .unwrap();
        assert_eq!(decoded.type_name, "Order.v1");
    }

    #[test]
    fn require_headers_fails_without_type_header() {
        let serializer = JsonMessageSerializer::new().require_headers();
        let result = serializer.deserialize(br#"{"n":1}"#, &Headers::new(), Some("Order.v1"));
        assert!(matches!(result, Err(PipelineError::Serialization(_))));
    }

    #[test]
    fn empty_body_decodes_to_null_payload() {
        let serializer = JsonMessageSerializer::new();
        let decoded = serializer
            .deserialize(b"", &Headers::new(), Some("Tombstone.v1"))
            .unwrap();
        assert_eq!(decoded.payload, serde_json::Value::Null);
    }

    #[test]
    fn malformed_body_is_a_serialization_error() {
        let serializer = JsonMessageSerializer::new();
        let result = serializer.deserialize(b"{broken", &Headers::new(), Some("Order.v1"));
        assert!(matches!(result, Err(PipelineError::Serialization(_))));
    }
}
