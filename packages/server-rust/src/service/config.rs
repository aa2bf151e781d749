use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context as _;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use triage_core::ServiceId;

use crate::queue::MAX_DELAY_SECONDS;

/// Dispatcher and module configuration.
///
/// Every field has a default, so a partial JSON file is a valid config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Queue that instructions are sent to and received from.
    pub queue: String,
    /// Longest delay the queue accepts for a single enqueue. Longer waits are
    /// carried in the instruction's `not_before`.
    pub max_delay_seconds: u64,
    /// How long a received message stays hidden before redelivery.
    pub visibility_timeout_seconds: u64,
    /// Per-module settings keyed by `type` or `type:instance`.
    pub modules: BTreeMap<String, Value>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue: "analysis".to_string(),
            max_delay_seconds: MAX_DELAY_SECONDS,
            visibility_timeout_seconds: 30,
            modules: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Loads a config from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a valid config.
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Raw settings for `id`: the `type:instance` entry wins over `type`.
    #[must_use]
    pub fn module_value(&self, id: &ServiceId) -> Option<&Value> {
        id.instance
            .as_ref()
            .and_then(|_| self.modules.get(&id.key()))
            .or_else(|| self.modules.get(&id.kind))
    }

    /// Typed settings for `id`, or `T::default()` when none are configured.
    ///
    /// # Errors
    ///
    /// Returns an error if configured settings do not decode as `T`.
    pub fn settings<T: DeserializeOwned + Default>(&self, id: &ServiceId) -> anyhow::Result<T> {
        match self.module_value(id) {
            Some(value) => serde_json::from_value(value.clone())
                .with_context(|| format!("settings for module `{}`", id.key())),
            None => Ok(T::default()),
        }
    }
}
