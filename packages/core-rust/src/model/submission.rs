//! Submission: a batch of observables a collector hands to the database.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::observable::{insert_observable, Observable, ObservableType};
use crate::error::Result;

/// Collector output describing one upstream event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub id: String,
    /// Source of the submission, e.g. the collector type.
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub details: Value,
    #[serde(default)]
    pub observables: Vec<Observable>,
}

impl Submission {
    /// Creates an empty submission stamped with `time`.
    #[must_use]
    pub fn new(kind: impl Into<String>, description: impl Into<String>, time: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: kind.into(),
            description: description.into(),
            time,
            details: Value::Null,
            observables: Vec::new(),
        }
    }

    /// Replaces the random id with a stable one, so resubmitting the same
    /// upstream event is recognized downstream.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Adds an observable of variant `T` unless an equal one exists.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidValue`](crate::ModelError::InvalidValue)
    /// if `T` rejects the value.
    pub fn add<T: ObservableType>(&mut self, value: impl AsRef<str>) -> Result<&mut Observable> {
        let observable = Observable::new::<T>(value)?;
        Ok(self.add_observable(observable))
    }

    /// Adds `observable`, merging metadata into an equal existing entry.
    pub fn add_observable(&mut self, observable: Observable) -> &mut Observable {
        insert_observable(&mut self.observables, observable)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::model::observable::Url;

    #[test]
    fn add_is_idempotent() {
        let when = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut s = Submission::new("phish_report", "reported mail", when);
        s.add::<Url>("https://a.example/x").unwrap().tag("phish");
        s.add::<Url>("https://a.example/x").unwrap();
        assert_eq!(s.observables.len(), 1);
        assert_eq!(s.observables[0].tags(), vec!["phish"]);
    }

    #[test]
    fn stable_id_replaces_random_one() {
        let when = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let a = Submission::new("feed", "event", when).with_id("evt-1");
        let b = Submission::new("feed", "event", when).with_id("evt-1");
        assert_eq!(a, b);
        assert_ne!(Submission::new("feed", "event", when).id, a.id);
    }
}
