//! Broker record identifiers.
//!
//! A [`BrokerRecordId`] is the opaque handle a broker assigns to a consumed
//! or produced record. The two variants cover the partitioned-log family
//! (Kafka and compatibles) and the per-message-id family (MQTT and
//! compatibles); the tagged variant replaces a trait hierarchy so identifiers
//! stay plain comparable values that can travel through stores and logs.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier of a record at its broker.
///
/// Guarantees equality, a short log form, and a group key used for commit
/// aggregation (records sharing a group key are committed together).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BrokerRecordId {
    /// A record in a partitioned log: `(topic, partition, offset)`.
    TopicPartitionOffset {
        /// Topic name.
        topic: String,
        /// Partition number within the topic.
        partition: i32,
        /// Offset within the partition.
        offset: i64,
    },
    /// A record identified by a broker-assigned message id.
    MessageId {
        /// Endpoint (e.g. MQTT topic) the record belongs to.
        endpoint: String,
        /// Broker-assigned message id.
        id: String,
    },
}

impl BrokerRecordId {
    /// Short human-readable form used in log records.
    #[must_use]
    pub fn log_form(&self) -> String {
        match self {
            Self::TopicPartitionOffset {
                topic,
                partition,
                offset,
            } => format!("{topic}[{partition}]@{offset}"),
            Self::MessageId { endpoint, id } => format!("{endpoint}#{id}"),
        }
    }

    /// Key used to aggregate commits; identifiers sharing a group key belong
    /// to the same ordered unit (topic + partition, or the endpoint itself).
    #[must_use]
    pub fn group_key(&self) -> String {
        match self {
            Self::TopicPartitionOffset {
                topic, partition, ..
            } => format!("{topic}[{partition}]"),
            Self::MessageId { endpoint, .. } => endpoint.clone(),
        }
    }

    /// The endpoint (topic) name this record belongs to.
    #[must_use]
    pub fn endpoint_name(&self) -> &str {
        match self {
            Self::TopicPartitionOffset { topic, .. } => topic,
            Self::MessageId { endpoint, .. } => endpoint,
        }
    }

    /// The partition offset, when the broker assigns one.
    #[must_use]
    pub const fn offset(&self) -> Option<i64> {
        match self {
            Self::TopicPartitionOffset { offset, .. } => Some(*offset),
            Self::MessageId { .. } => None,
        }
    }

    /// The partition number, when the broker assigns one.
    #[must_use]
    pub const fn partition(&self) -> Option<i32> {
        match self {
            Self::TopicPartitionOffset { partition, .. } => Some(*partition),
            Self::MessageId { .. } => None,
        }
    }
}

impl fmt::Display for BrokerRecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.log_form())
    }
}
