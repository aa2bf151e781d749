use std::path::{Path, PathBuf};

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use triage_core::{AnalysisRecord, Submission};

use crate::queue::QueueMessage;

/// At-least-once, delay-capable message queue.
/// Implementations: in-process memory (local runs, tests), SQS (deployment).
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Enqueue `body`, invisible to consumers for `delay_seconds`.
    /// Returns the new message id.
    async fn add(&self, queue: &str, body: String, delay_seconds: u64) -> anyhow::Result<String>;

    /// Permanently delete one delivered message by its receipt handle.
    async fn remove(&self, queue: &str, receipt_handle: &str) -> anyhow::Result<()>;

    /// Deliver up to `max` visible messages, hiding each for `visibility_seconds`.
    async fn receive(
        &self,
        queue: &str,
        max: usize,
        visibility_seconds: u64,
    ) -> anyhow::Result<Vec<QueueMessage>>;

    /// Look at an in-flight delivery without changing its visibility.
    async fn peek(&self, queue: &str, receipt_handle: &str)
        -> anyhow::Result<Option<QueueMessage>>;
}

/// Overwrite-by-key string store used for cross-run bookkeeping (watermarks).
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> anyhow::Result<()>;

    /// Read a timestamp stored by [`set_timestamp`](Self::set_timestamp),
    /// or `default` if the key is unset.
    async fn get_timestamp(
        &self,
        key: &str,
        default: DateTime<Utc>,
    ) -> anyhow::Result<DateTime<Utc>> {
        match self.get(key).await? {
            Some(raw) => Ok(DateTime::parse_from_rfc3339(&raw)
                .with_context(|| format!("stored value at `{key}` is not a timestamp"))?
                .with_timezone(&Utc)),
            None => Ok(default),
        }
    }

    async fn set_timestamp(&self, key: &str, at: DateTime<Utc>) -> anyhow::Result<()> {
        self.set(key, &at.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            .await
    }
}

/// Downstream store for finished work.
///
/// Calls may repeat for one logical completion (queue redelivery), so
/// receivers deduplicate by analysis id and status, and by submission id.
#[async_trait]
pub trait Database: Send + Sync {
    async fn submit_analysis(&self, record: &AnalysisRecord) -> anyhow::Result<()>;

    async fn submit_submission(&self, submission: &Submission) -> anyhow::Result<()>;
}

/// Content-addressed storage for file bodies.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store the file at `path` and return its content hash id.
    async fn upload(&self, path: &Path) -> anyhow::Result<String>;

    /// Make the object with `id` available locally and return its path.
    async fn download(&self, id: &str) -> anyhow::Result<PathBuf>;
}

/// Named secret lookup (API keys, tokens).
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, name: &str) -> anyhow::Result<String>;
}
