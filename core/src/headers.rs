//! Message headers: an ordered string multimap with reserved wire-level names.
//!
//! Headers travel with every envelope. Duplicate names are allowed and
//! insertion order is preserved, because both matter for wire compatibility
//! with other implementations reading the same topics. Reads are
//! case-insensitive per the wire contract.
//!
//! # Example
//!
//! ```
//! use ferrobus_core::headers::{Headers, names};
//!
//! let mut headers = Headers::new();
//! headers.insert(names::MESSAGE_TYPE, "OrderPlaced");
//! headers.insert("x-custom", "a");
//! headers.insert("x-custom", "b");
//!
//! assert_eq!(headers.get(names::MESSAGE_TYPE), Some("OrderPlaced"));
//! assert_eq!(headers.get_all("X-Custom").count(), 2);
//! ```

use smallvec::SmallVec;
use std::fmt;

/// Reserved wire-level header names.
///
/// These names must be emitted and honored bit-identically for
/// interoperability with other implementations on the same topics.
/// Matching is case-insensitive on the read side.
pub mod names {
    /// Unique message id; also the sequence id shared by all chunks of one message.
    pub const MESSAGE_ID: &str = "x-message-id";
    /// Fully qualified message type name used for polymorphic deserialization.
    pub const MESSAGE_TYPE: &str = "x-message-type";
    /// Number of processing failures observed for this message so far.
    pub const FAILED_ATTEMPTS: &str = "x-failed-attempts";
    /// Zero-based index of a chunk within its sequence.
    pub const CHUNK_INDEX: &str = "x-chunk-index";
    /// Total number of chunks in the sequence, when known at produce time.
    pub const CHUNKS_COUNT: &str = "x-chunks-count";
    /// Broker offset of the first chunk of the sequence.
    pub const FIRST_CHUNK_OFFSET: &str = "x-first-chunk-offset";
    /// `true` on the final chunk of a sequence.
    pub const CHUNK_IS_LAST: &str = "x-chunk-is-last";
    /// Identifier of the batch a message was grouped into.
    pub const BATCH_ID: &str = "x-batch-id";
    /// Size of the batch a message was grouped into.
    pub const BATCH_SIZE: &str = "x-batch-size";
    /// Identifier of the key used to encrypt the payload.
    pub const ENCRYPTION_KEY_ID: &str = "x-encryption-key-id";
    /// W3C trace context `traceparent`.
    pub const TRACEPARENT: &str = "x-traceparent";
    /// W3C trace context `tracestate`.
    pub const TRACESTATE: &str = "x-tracestate";
    /// W3C trace context baggage.
    pub const TRACE_BAGGAGE: &str = "x-trace-baggage";
}

/// A single header entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    /// Header name, stored with the casing it was written with.
    pub name: String,
    /// Header value.
    pub value: String,
}

/// An ordered multimap of message headers.
///
/// Duplicates are allowed and insertion order is preserved. All lookups are
/// case-insensitive.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Headers {
    entries: SmallVec<[Header; 8]>,
}

impl Headers {
    /// Create an empty header map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header, keeping any existing entries with the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push(Header {
            name: name.into(),
            value: value.into(),
        });
    }

    /// Replace all entries with the given name by a single entry.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.entries
            .retain(|h| !h.name.eq_ignore_ascii_case(&name));
        self.entries.push(Header {
            name,
            value: value.into(),
        });
    }

    /// Get the first value for a name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// Iterate over all values for a name, in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// Whether a header with the given name exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Remove all entries with the given name.
    pub fn remove(&mut self, name: &str) {
        self.entries
            .retain(|h| !h.name.eq_ignore_ascii_case(name));
    }

    /// Get the first value for a name, parsed into `T`.
    ///
    /// Returns `None` when the header is absent or does not parse.
    #[must_use]
    pub fn get_parsed<T: std::str::FromStr>(&self, name: &str) -> Option<T> {
        self.get(name).and_then(|v| v.parse().ok())
    }

    /// Number of header entries (duplicates included).
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over all entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.entries.iter()
    }

    /// Serialize to the JSON multimap form: an array of `[name, value]` pairs.
    ///
    /// A plain JSON object would silently drop duplicate names, so the pair
    /// array is the persisted representation (outbox rows, moved messages).
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Array(
            self.entries
                .iter()
                .map(|h| {
                    serde_json::Value::Array(vec![
                        serde_json::Value::String(h.name.clone()),
                        serde_json::Value::String(h.value.clone()),
                    ])
                })
                .collect(),
        )
    }

    /// Deserialize from the JSON multimap form produced by [`Headers::to_json`].
    ///
    /// # Errors
    ///
    /// Returns the offending JSON fragment as an error string when the value
    /// is not an array of `[name, value]` string pairs.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, String> {
        let array = value
            .as_array()
            .ok_or_else(|| format!("expected header array, got {value}"))?;

        let mut headers = Self::new();
        for pair in array {
            let pair = pair
                .as_array()
                .filter(|p| p.len() == 2)
                .ok_or_else(|| format!("expected [name, value] pair, got {pair}"))?;
            let name = pair[0]
                .as_str()
                .ok_or_else(|| format!("header name must be a string, got {}", pair[0]))?;
            let value = pair[1]
                .as_str()
                .ok_or_else(|| format!("header value must be a string, got {}", pair[1]))?;
            headers.insert(name, value);
        }
        Ok(headers)
    }

    /// The `x-message-id` header.
    #[must_use]
    pub fn message_id(&self) -> Option<&str> {
        self.get(names::MESSAGE_ID)
    }

    /// The `x-message-type` header.
    #[must_use]
    pub fn message_type(&self) -> Option<&str> {
        self.get(names::MESSAGE_TYPE)
    }

    /// The `x-chunk-index` header, parsed.
    #[must_use]
    pub fn chunk_index(&self) -> Option<u32> {
        self.get_parsed(names::CHUNK_INDEX)
    }

    /// The `x-chunks-count` header, parsed.
    #[must_use]
    pub fn chunks_count(&self) -> Option<u32> {
        self.get_parsed(names::CHUNKS_COUNT)
    }

    /// Whether `x-chunk-is-last` is set to `true`.
    #[must_use]
    pub fn is_last_chunk(&self) -> bool {
        self.get(names::CHUNK_IS_LAST)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    /// The `x-failed-attempts` header, parsed; `0` when absent.
    #[must_use]
    pub fn failed_attempts(&self) -> u32 {
        self.get_parsed(names::FAILED_ATTEMPTS).unwrap_or(0)
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, h) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", h.name, h.value)?;
        }
        write!(f, "}}")
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = &'a Header;
    type IntoIter = std::slice::Iter<'a, Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut headers = Self::new();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;

    #[test]
    fn insert_preserves_order_and_duplicates() {
        let mut headers = Headers::new();
        headers.insert("a", "1");
        headers.insert("b", "2");
        headers.insert("a", "3");

        let values: Vec<_> = headers.get_all("a").collect();
        assert_eq!(values, vec!["1", "3"]);
        assert_eq!(headers.len(), 3);
    }

    #[test]
    fn reads_are_case_insensitive() {
        let mut headers = Headers::new();
        headers.insert("X-Message-Id", "abc");

        assert_eq!(headers.get("x-message-id"), Some("abc"));
        assert!(headers.contains("X-MESSAGE-ID"));
    }

    #[test]
    fn set_replaces_all_duplicates() {
        let mut headers = Headers::new();
        headers.insert("a", "1");
        headers.insert("A", "2");
        headers.set("a", "3");

        assert_eq!(headers.get_all("a").count(), 1);
        assert_eq!(headers.get("a"), Some("3"));
    }

    #[test]
    fn json_roundtrip_keeps_duplicates_and_order() {
        let mut headers = Headers::new();
        headers.insert("a", "1");
        headers.insert("b", "2");
        headers.insert("a", "3");

        let json = headers.to_json();
        let parsed = Headers::from_json(&json).expect("valid header json");

        assert_eq!(parsed, headers);
    }

    #[test]
    fn from_json_rejects_non_pairs() {
        let json = serde_json::json!([["a", "1"], ["broken"]]);
        assert!(Headers::from_json(&json).is_err());

        let json = serde_json::json!({"a": "1"});
        assert!(Headers::from_json(&json).is_err());
    }

    #[test]
    fn chunk_helpers_parse_reserved_headers() {
        let mut headers = Headers::new();
        headers.insert(names::CHUNK_INDEX, "2");
        headers.insert(names::CHUNKS_COUNT, "3");
        headers.insert(names::CHUNK_IS_LAST, "true");

        assert_eq!(headers.chunk_index(), Some(2));
        assert_eq!(headers.chunks_count(), Some(3));
        assert!(headers.is_last_chunk());
    }

    #[test]
    fn failed_attempts_defaults_to_zero() {
        let headers = Headers::new();
        assert_eq!(headers.failed_attempts(), 0);

        let mut headers = Headers::new();
        headers.insert(names::FAILED_ATTEMPTS, "2");
        assert_eq!(headers.failed_attempts(), 2);
    }
}
