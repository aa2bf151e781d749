//! Queue-trigger event model, shaped like an SQS event-source payload.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::queue::QueueMessage;

/// Batch handed to the entry point. The dispatcher accepts exactly one record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEvent {
    #[serde(rename = "Records")]
    pub records: Vec<QueueRecord>,
}

impl QueueEvent {
    #[must_use]
    pub fn single(record: QueueRecord) -> Self {
        Self {
            records: vec![record],
        }
    }
}

/// One delivered queue message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueRecord {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
    #[serde(rename = "eventSourceARN", default)]
    pub event_source_arn: String,
    #[serde(default)]
    pub attributes: RecordAttributes,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordAttributes {
    /// Delivery count, a decimal string on the wire.
    #[serde(
        rename = "ApproximateReceiveCount",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub approximate_receive_count: Option<String>,
}

impl QueueRecord {
    /// Wraps a queue delivery, attributing it to `queue` in a local ARN.
    #[must_use]
    pub fn from_message(queue: &str, message: QueueMessage) -> Self {
        Self {
            message_id: message.message_id,
            receipt_handle: message.receipt_handle,
            body: message.body,
            event_source_arn: format!("arn:aws:sqs:local:000000000000:{queue}"),
            attributes: RecordAttributes {
                approximate_receive_count: Some(message.receive_count.to_string()),
            },
        }
    }

    /// Queue name: the last `:`-separated segment of the source ARN.
    #[must_use]
    pub fn queue_name(&self) -> Option<&str> {
        self.event_source_arn
            .rsplit(':')
            .next()
            .filter(|name| !name.is_empty())
    }

    /// Delivery count, `1` when the attribute is absent or unreadable.
    #[must_use]
    pub fn receive_count(&self) -> u32 {
        self.attributes
            .approximate_receive_count
            .as_deref()
            .and_then(|count| count.parse().ok())
            .unwrap_or(1)
    }
}

/// Per-invocation context supplied by the hosting platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationContext {
    pub request_id: String,
}

impl InvocationContext {
    #[must_use]
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
        }
    }
}

impl Default for InvocationContext {
    fn default() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }
}
