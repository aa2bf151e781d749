use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use super::{QueueMessage, MAX_DELAY_SECONDS};
use crate::clock::ClockSource;
use crate::traits::MessageQueue;

/// Errors raised by [`MemoryQueue`].
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("delay of {requested}s exceeds the {max}s maximum")]
    DelayTooLong { requested: u64, max: u64 },
    #[error("no in-flight message in `{queue}` with receipt `{receipt_handle}`")]
    ReceiptNotFound {
        queue: String,
        receipt_handle: String,
    },
}

/// Inspection view of a message still held by the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    pub message_id: String,
    pub body: String,
    pub visible_at: DateTime<Utc>,
    /// Delay requested at enqueue time.
    pub delay_seconds: u64,
    pub receive_count: u32,
    pub in_flight: bool,
}

#[derive(Debug)]
struct Entry {
    message_id: String,
    body: String,
    delay_seconds: u64,
    visible_at: DateTime<Utc>,
    receipt_handle: Option<String>,
    receive_count: u32,
}

/// In-process queue with SQS semantics: per-message delay, visibility
/// timeout, and a fresh receipt handle per delivery.
///
/// Delivery order among visible messages is by visibility time, but callers
/// must not rely on it.
pub struct MemoryQueue {
    clock: Arc<dyn ClockSource>,
    queues: Mutex<HashMap<String, Vec<Entry>>>,
}

impl MemoryQueue {
    #[must_use]
    pub fn new(clock: Arc<dyn ClockSource>) -> Self {
        Self {
            clock,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Every message held for `queue`, in-flight ones included.
    #[must_use]
    pub fn pending(&self, queue: &str) -> Vec<PendingMessage> {
        let queues = self.queues.lock();
        queues
            .get(queue)
            .map(|entries| {
                entries
                    .iter()
                    .map(|entry| PendingMessage {
                        message_id: entry.message_id.clone(),
                        body: entry.body.clone(),
                        visible_at: entry.visible_at,
                        delay_seconds: entry.delay_seconds,
                        receive_count: entry.receive_count,
                        in_flight: entry.receipt_handle.is_some(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Earliest time any message of `queue` becomes visible.
    #[must_use]
    pub fn next_visible_at(&self, queue: &str) -> Option<DateTime<Utc>> {
        let queues = self.queues.lock();
        queues
            .get(queue)
            .and_then(|entries| entries.iter().map(|entry| entry.visible_at).min())
    }

    #[must_use]
    pub fn is_empty(&self, queue: &str) -> bool {
        self.queues
            .lock()
            .get(queue)
            .map_or(true, Vec::is_empty)
    }
}

impl std::fmt::Debug for MemoryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let queues = self.queues.lock();
        let sizes: HashMap<&str, usize> = queues
            .iter()
            .map(|(name, entries)| (name.as_str(), entries.len()))
            .collect();
        f.debug_struct("MemoryQueue").field("queues", &sizes).finish()
    }
}

fn seconds(value: u64) -> TimeDelta {
    TimeDelta::try_seconds(i64::try_from(value).unwrap_or(i64::MAX)).unwrap_or(TimeDelta::MAX)
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn add(&self, queue: &str, body: String, delay_seconds: u64) -> anyhow::Result<String> {
        if delay_seconds > MAX_DELAY_SECONDS {
            return Err(QueueError::DelayTooLong {
                requested: delay_seconds,
                max: MAX_DELAY_SECONDS,
            }
            .into());
        }
        let message_id = Uuid::new_v4().to_string();
        let entry = Entry {
            message_id: message_id.clone(),
            body,
            delay_seconds,
            visible_at: self.clock.now() + seconds(delay_seconds),
            receipt_handle: None,
            receive_count: 0,
        };
        self.queues
            .lock()
            .entry(queue.to_string())
            .or_default()
            .push(entry);
        tracing::debug!(queue, message_id = %message_id, delay_seconds, "message enqueued");
        Ok(message_id)
    }

    async fn remove(&self, queue: &str, receipt_handle: &str) -> anyhow::Result<()> {
        let mut queues = self.queues.lock();
        let entries = queues.get_mut(queue);
        let position = entries.as_ref().and_then(|entries| {
            entries
                .iter()
                .position(|entry| entry.receipt_handle.as_deref() == Some(receipt_handle))
        });
        match (entries, position) {
            (Some(entries), Some(position)) => {
                let entry = entries.remove(position);
                tracing::debug!(queue, message_id = %entry.message_id, "message removed");
                Ok(())
            }
            _ => Err(QueueError::ReceiptNotFound {
                queue: queue.to_string(),
                receipt_handle: receipt_handle.to_string(),
            }
            .into()),
        }
    }

    async fn receive(
        &self,
        queue: &str,
        max: usize,
        visibility_seconds: u64,
    ) -> anyhow::Result<Vec<QueueMessage>> {
        let now = self.clock.now();
        let mut queues = self.queues.lock();
        let Some(entries) = queues.get_mut(queue) else {
            return Ok(Vec::new());
        };

        let mut visible: Vec<&mut Entry> = entries
            .iter_mut()
            .filter(|entry| entry.visible_at <= now)
            .collect();
        visible.sort_by_key(|entry| entry.visible_at);

        Ok(visible
            .into_iter()
            .take(max)
            .map(|entry| {
                let receipt_handle = Uuid::new_v4().to_string();
                entry.receipt_handle = Some(receipt_handle.clone());
                entry.receive_count += 1;
                entry.visible_at = now + seconds(visibility_seconds);
                QueueMessage {
                    message_id: entry.message_id.clone(),
                    receipt_handle,
                    body: entry.body.clone(),
                    receive_count: entry.receive_count,
                }
            })
            .collect())
    }

    async fn peek(
        &self,
        queue: &str,
        receipt_handle: &str,
    ) -> anyhow::Result<Option<QueueMessage>> {
        let queues = self.queues.lock();
        Ok(queues.get(queue).and_then(|entries| {
            entries
                .iter()
                .find(|entry| entry.receipt_handle.as_deref() == Some(receipt_handle))
                .map(|entry| QueueMessage {
                    message_id: entry.message_id.clone(),
                    receipt_handle: receipt_handle.to_string(),
                    body: entry.body.clone(),
                    receive_count: entry.receive_count,
                })
        }))
    }
}
