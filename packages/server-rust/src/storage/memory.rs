//! In-memory [`KeyValueStore`] backed by [`DashMap`], plus a per-service view.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use triage_core::ServiceId;

use crate::traits::KeyValueStore;

/// Key/value store held in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, String>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Persisted state of one service, keyed by `type[:instance]`.
///
/// Two instances of the same service type never see each other's keys.
#[derive(Clone)]
pub struct ScopedState {
    store: Arc<dyn KeyValueStore>,
    prefix: String,
}

impl ScopedState {
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>, owner: &ServiceId) -> Self {
        Self {
            store,
            prefix: owner.key(),
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}/{key}", self.prefix)
    }

    /// # Errors
    ///
    /// Returns the backing store's error.
    pub async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        self.store.get(&self.key(key)).await
    }

    /// # Errors
    ///
    /// Returns the backing store's error.
    pub async fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.store.set(&self.key(key), value).await
    }

    /// # Errors
    ///
    /// Returns the backing store's error, or a parse error for a stored
    /// value that is not a timestamp.
    pub async fn get_timestamp(
        &self,
        key: &str,
        default: DateTime<Utc>,
    ) -> anyhow::Result<DateTime<Utc>> {
        self.store.get_timestamp(&self.key(key), default).await
    }

    /// # Errors
    ///
    /// Returns the backing store's error.
    pub async fn set_timestamp(&self, key: &str, at: DateTime<Utc>) -> anyhow::Result<()> {
        self.store.set_timestamp(&self.key(key), at).await
    }
}

impl std::fmt::Debug for ScopedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedState")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[tokio::test]
    async fn get_and_set() {
        let store = MemoryStore::new();
        assert_eq!(store.get("k").await.unwrap(), None);
        store.set("k", "v").await.unwrap();
        store.set("k", "w").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("w"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn timestamps_default_and_round_trip() {
        let store = MemoryStore::new();
        let epoch = DateTime::<Utc>::UNIX_EPOCH;
        assert_eq!(store.get_timestamp("seen", epoch).await.unwrap(), epoch);

        let at = Utc.with_ymd_and_hms(2024, 3, 9, 12, 30, 0).unwrap();
        store.set_timestamp("seen", at).await.unwrap();
        assert_eq!(store.get_timestamp("seen", epoch).await.unwrap(), at);
    }

    #[tokio::test]
    async fn garbage_timestamp_is_an_error() {
        let store = MemoryStore::new();
        store.set("seen", "yesterday").await.unwrap();
        assert!(store.get_timestamp("seen", Utc::now()).await.is_err());
    }

    #[tokio::test]
    async fn scoped_state_separates_instances() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let a = ScopedState::new(store.clone(), &ServiceId::new("directory", Some("a".into())));
        let b = ScopedState::new(store.clone(), &ServiceId::new("directory", None));

        a.set("cursor", "1").await.unwrap();
        assert_eq!(b.get("cursor").await.unwrap(), None);
        assert_eq!(store.get("directory:a/cursor").await.unwrap().as_deref(), Some("1"));
    }
}
