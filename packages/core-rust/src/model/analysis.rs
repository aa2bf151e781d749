//! Analysis: one module's inspection of one target observable.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::observable::{insert_observable, Observable, ObservableType};
use crate::envelope::ServiceId;
use crate::error::{ModelError, Result};
use crate::registry::Fields;

/// Lifecycle of an analysis. `Running` moves to exactly one terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Running,
    #[serde(alias = "ignore")]
    Ignored,
    Complete,
}

impl Status {
    /// Whether no further transition is allowed.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Ignored | Self::Complete)
    }

    /// Wire spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Ignored => "ignored",
            Self::Complete => "complete",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Work in progress for one target observable.
///
/// `state` is scratch data carried across continuations; it never leaves the
/// dispatch loop (see [`AnalysisRecord`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub id: String,
    pub target: Observable,
    #[serde(default)]
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub details: Value,
    #[serde(default)]
    pub observables: Vec<Observable>,
    #[serde(default)]
    pub state: Fields,
}

impl Analysis {
    /// Starts a running analysis of `target` with a fresh id.
    #[must_use]
    pub fn new(target: Observable) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            target,
            status: Status::Running,
            summary: None,
            details: Value::Null,
            observables: Vec::new(),
            state: Fields::new(),
        }
    }

    /// Adds a child observable of variant `T` unless an equal one exists.
    ///
    /// Returns the stored observable so callers can attach metadata to it.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidValue`] if `T` rejects the value.
    pub fn add<T: ObservableType>(&mut self, value: impl AsRef<str>) -> Result<&mut Observable> {
        let observable = Observable::new::<T>(value)?;
        Ok(self.add_observable(observable))
    }

    /// Adds `observable`, merging its metadata into an equal existing entry.
    pub fn add_observable(&mut self, observable: Observable) -> &mut Observable {
        insert_observable(&mut self.observables, observable)
    }

    /// Finds a child observable by `(type, value)`.
    #[must_use]
    pub fn find<T: ObservableType>(&self, value: &str) -> Option<&Observable> {
        let value = T::normalize(value).ok()?;
        self.observables
            .iter()
            .find(|o| o.is::<T>() && o.value == value)
    }

    /// Marks the analysis ignored.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidTransition`] unless the analysis is running.
    pub fn ignore(&mut self) -> Result<()> {
        self.transition(Status::Ignored)
    }

    /// Marks the analysis complete.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidTransition`] unless the analysis is running.
    pub fn complete(&mut self) -> Result<()> {
        self.transition(Status::Complete)
    }

    fn transition(&mut self, to: Status) -> Result<()> {
        if self.status != Status::Running {
            return Err(ModelError::InvalidTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        Ok(())
    }

    /// Reads a scratch value.
    #[must_use]
    pub fn state<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.state
            .get(key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    /// Writes a scratch value.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Encode`] if `value` does not serialize.
    pub fn set_state(&mut self, key: impl Into<String>, value: impl Serialize) -> Result<()> {
        self.state.insert(key.into(), serde_json::to_value(value)?);
        Ok(())
    }

    /// Snapshot handed to the database, without scratch state.
    #[must_use]
    pub fn record(&self, module: ServiceId) -> AnalysisRecord {
        AnalysisRecord {
            id: self.id.clone(),
            module,
            target: self.target.clone(),
            status: self.status,
            summary: self.summary.clone(),
            details: self.details.clone(),
            observables: self.observables.clone(),
        }
    }
}

/// Finished analysis as persisted downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub id: String,
    pub module: ServiceId,
    pub target: Observable,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub details: Value,
    #[serde(default)]
    pub observables: Vec<Observable>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::model::metadata::Tag;
    use crate::model::observable::{Fqdn, Ipv4};

    fn analysis() -> Analysis {
        Analysis::new(Observable::new::<Fqdn>("evil.example").unwrap())
    }

    #[test]
    fn add_is_idempotent_and_returns_stored() {
        let mut a = analysis();
        a.add::<Ipv4>("1.2.3.4").unwrap().tag("first");
        let again = a.add::<Ipv4>("1.2.3.4").unwrap();
        assert_eq!(again.tags(), vec!["first"]);
        assert_eq!(a.observables.len(), 1);
    }

    #[test]
    fn add_deduplicates_after_normalization() {
        let mut a = analysis();
        a.add::<Fqdn>("Evil.Example.").unwrap();
        a.add::<Fqdn>("evil.example").unwrap();
        assert_eq!(a.observables.len(), 1);
        assert!(a.find::<Fqdn>("EVIL.example").is_some());
    }

    #[test]
    fn status_is_monotonic() {
        let mut a = analysis();
        a.complete().unwrap();
        assert!(a.status.is_terminal());
        assert!(matches!(
            a.ignore(),
            Err(ModelError::InvalidTransition { from, to }) if from == "complete" && to == "ignored"
        ));
        assert!(a.complete().is_err());
        assert_eq!(a.status, Status::Complete);
    }

    #[test]
    fn legacy_ignore_spelling_is_accepted() {
        let status: Status = serde_json::from_value(json!("ignore")).unwrap();
        assert_eq!(status, Status::Ignored);
        assert_eq!(serde_json::to_value(status).unwrap(), json!("ignored"));
    }

    #[test]
    fn state_round_trips_through_json() {
        let mut a = analysis();
        a.set_state("polls", 3).unwrap();
        a.set_state("task", "t-1").unwrap();

        let decoded: Analysis = serde_json::from_value(serde_json::to_value(&a).unwrap()).unwrap();
        assert_eq!(decoded.state::<u32>("polls"), Some(3));
        assert_eq!(decoded.state::<String>("task").as_deref(), Some("t-1"));
        assert_eq!(decoded.state::<u32>("missing"), None);
    }

    #[test]
    fn record_drops_scratch_state() {
        let mut a = analysis();
        a.set_state("secret", "x").unwrap();
        a.add::<Ipv4>("9.9.9.9").unwrap().add::<Tag>("resolver");
        a.complete().unwrap();

        let record = a.record(ServiceId::new("dns", None));
        let wire = serde_json::to_value(&record).unwrap();
        assert!(wire.get("state").is_none());
        assert_eq!(wire["status"], json!("complete"));
        assert_eq!(wire["module"], json!({"type": "dns", "instance": null}));
        assert_eq!(record.observables.len(), 1);
    }
}
