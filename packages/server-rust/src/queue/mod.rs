//! Queue client: message shape and the in-process implementation.
//!
//! The dispatcher only depends on [`MessageQueue`](crate::traits::MessageQueue);
//! [`MemoryQueue`] backs local runs and tests.

pub mod memory;

use serde::{Deserialize, Serialize};

pub use memory::{MemoryQueue, PendingMessage, QueueError};

/// Longest delay a single enqueue may request, matching SQS.
pub const MAX_DELAY_SECONDS: u64 = 900;

/// One delivery of a queued message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub message_id: String,
    /// Acknowledgment token for this delivery only.
    pub receipt_handle: String,
    pub body: String,
    /// Number of times the message has been delivered, this one included.
    pub receive_count: u32,
}
