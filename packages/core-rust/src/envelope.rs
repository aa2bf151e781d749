//! Dispatch envelopes: "continue later" pointers and the queue wire format.
//!
//! An [`Instruction`] is what travels through the queue:
//!
//! ```json
//! { "service": {"type": "sandbox", "instance": null, ...fields...},
//!   "method": "get_results", "args": [...], "kwargs": {...} }
//! ```
//!
//! It owns a serialized snapshot of the target service, never a live
//! reference. A [`Callback`] is what a handler returns to ask for another hop;
//! the dispatcher turns it into an `Instruction` carrying the service's
//! current snapshot.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ModelError, Result};
use crate::registry::{tag_of, Fields, TYPE_FIELD};

/// Identity of a service: its own type plus an optional configuration slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceId {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub instance: Option<String>,
}

impl ServiceId {
    #[must_use]
    pub fn new(kind: impl Into<String>, instance: Option<String>) -> Self {
        Self {
            kind: kind.into(),
            instance,
        }
    }

    /// Reads the identity out of a service snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::MissingTag`] if the snapshot has no `type`.
    pub fn from_snapshot(snapshot: &Fields) -> Result<Self> {
        let kind = tag_of(snapshot).ok_or(ModelError::MissingTag { family: "service" })?;
        let instance = snapshot
            .get("instance")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(Self::new(kind, instance))
    }

    /// Stable key for per-service persisted state: `type` or `type:instance`.
    #[must_use]
    pub fn key(&self) -> String {
        match &self.instance {
            Some(instance) => format!("{}:{instance}", self.kind),
            None => self.kind.clone(),
        }
    }
}

/// Request for another hop: which method to run next, with what, and when.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Callback {
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Fields,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<DateTime<Utc>>,
}

impl Callback {
    /// Runs `method` as soon as possible.
    #[must_use]
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            args: Vec::new(),
            kwargs: Fields::new(),
            delay_seconds: None,
            at: None,
        }
    }

    /// Runs after `delay`, rounded up to whole seconds.
    #[must_use]
    pub fn after(mut self, delay: Duration) -> Self {
        self.delay_seconds = Some(delay.as_secs() + u64::from(delay.subsec_nanos() > 0));
        self.at = None;
        self
    }

    /// Runs no earlier than `at`.
    #[must_use]
    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.at = Some(at);
        self.delay_seconds = None;
        self
    }

    #[must_use]
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    #[must_use]
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    /// Absolute time the next hop is due, relative to `now`.
    #[must_use]
    pub fn resume_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        if let Some(at) = self.at {
            return at.max(now);
        }
        let seconds = self
            .delay_seconds
            .and_then(|s| i64::try_from(s).ok())
            .unwrap_or(0);
        now + TimeDelta::try_seconds(seconds).unwrap_or(TimeDelta::MAX)
    }
}

/// Queue wire envelope: a service snapshot plus the method to invoke on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub service: Fields,
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Fields,
    /// Earliest time the method may run, set when the requested delay
    /// exceeds what the queue can hold.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
}

impl Instruction {
    /// Targets `method` on the service captured in `service`.
    #[must_use]
    pub fn new(service: Fields, method: impl Into<String>) -> Self {
        Self {
            service,
            method: method.into(),
            args: Vec::new(),
            kwargs: Fields::new(),
            not_before: None,
        }
    }

    /// Turns a handler's callback into the next hop for `service`.
    #[must_use]
    pub fn continuation(service: Fields, callback: Callback) -> Self {
        Self {
            service,
            method: callback.method,
            args: callback.args,
            kwargs: callback.kwargs,
            not_before: None,
        }
    }

    #[must_use]
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    #[must_use]
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    /// Identity of the target service.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::MissingTag`] if the snapshot has no `type`.
    pub fn service_id(&self) -> Result<ServiceId> {
        ServiceId::from_snapshot(&self.service)
    }

    /// Type tag of the target service, if present.
    #[must_use]
    pub fn service_type(&self) -> Option<&str> {
        self.service.get(TYPE_FIELD).and_then(Value::as_str)
    }

    /// Arguments for the handler.
    #[must_use]
    pub fn invocation(&self) -> Invocation {
        Invocation {
            args: self.args.clone(),
            kwargs: self.kwargs.clone(),
        }
    }

    /// Serializes to the queue message body.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Encode`] if a field does not serialize.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a queue message body.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Malformed`] if the body is not an instruction.
    pub fn decode(body: &str) -> Result<Self> {
        serde_json::from_str(body).map_err(|e| ModelError::malformed("instruction", e))
    }
}

/// Arguments delivered to a handler.
///
/// Accessors decode on demand, so a parameter read as [`Instruction`] or
/// [`Callback`] is rebuilt recursively from its wire form.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Invocation {
    pub args: Vec<Value>,
    pub kwargs: Fields,
}

impl Invocation {
    /// Decodes positional argument `index`.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::MissingArgument`] if absent or
    /// [`ModelError::Malformed`] if it does not decode as `T`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T> {
        let value = self.args.get(index).ok_or_else(|| ModelError::MissingArgument {
            name: format!("#{index}"),
        })?;
        serde_json::from_value(value.clone())
            .map_err(|e| ModelError::malformed(&format!("argument #{index}"), e))
    }

    /// Decodes keyword argument `name`, `None` if absent.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Malformed`] if present but not a `T`.
    pub fn kwarg<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        self.kwargs
            .get(name)
            .map(|value| {
                serde_json::from_value(value.clone())
                    .map_err(|e| ModelError::malformed(&format!("argument `{name}`"), e))
            })
            .transpose()
    }

    /// Decodes a keyword argument that must be present.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::MissingArgument`] if absent.
    pub fn required<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        self.kwarg(name)?.ok_or_else(|| ModelError::MissingArgument {
            name: name.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    fn snapshot() -> Fields {
        match json!({"type": "sandbox", "instance": "lab", "analysis": {"id": "a-1"}}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn wire_format_has_four_keys() {
        let instruction = Instruction::new(snapshot(), "run").arg(1).kwarg("mode", "fast");
        let wire: Value = serde_json::from_str(&instruction.encode().unwrap()).unwrap();
        assert_eq!(
            wire,
            json!({
                "service": {"type": "sandbox", "instance": "lab", "analysis": {"id": "a-1"}},
                "method": "run",
                "args": [1],
                "kwargs": {"mode": "fast"},
            })
        );
    }

    #[test]
    fn decode_tolerates_missing_args() {
        let instruction =
            Instruction::decode(r#"{"service": {"type": "x"}, "method": "run"}"#).unwrap();
        assert!(instruction.args.is_empty());
        assert!(instruction.kwargs.is_empty());
        assert_eq!(instruction.service_type(), Some("x"));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            Instruction::decode("{\"method\": 3}"),
            Err(ModelError::Malformed { .. })
        ));
    }

    #[test]
    fn service_id_from_snapshot() {
        let id = ServiceId::from_snapshot(&snapshot()).unwrap();
        assert_eq!(id, ServiceId::new("sandbox", Some("lab".into())));
        assert_eq!(id.key(), "sandbox:lab");
        assert_eq!(ServiceId::new("dns", None).key(), "dns");
    }

    #[test]
    fn callback_resume_at() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        assert_eq!(Callback::new("m").resume_at(now), now);
        assert_eq!(
            Callback::new("m").after(Duration::from_secs(5)).resume_at(now),
            now + TimeDelta::seconds(5)
        );
        // Partial seconds never fire early.
        let fractional = Callback::new("m").after(Duration::from_millis(1500));
        assert_eq!(fractional.delay_seconds, Some(2));
        assert_eq!(fractional.resume_at(now), now + TimeDelta::seconds(2));
        assert_eq!(
            Callback::new("m").after(Duration::from_millis(1)).delay_seconds,
            Some(1)
        );
        let later = now + TimeDelta::hours(2);
        assert_eq!(Callback::new("m").at(later).resume_at(now), later);
        // A time already in the past means "now".
        assert_eq!(Callback::new("m").at(now - TimeDelta::hours(1)).resume_at(now), now);
    }

    #[test]
    fn continuation_carries_callback_arguments() {
        let callback = Callback::new("get_results").arg("t-9").kwarg("attempt", 2);
        let next = Instruction::continuation(snapshot(), callback);
        assert_eq!(next.method, "get_results");
        assert_eq!(next.invocation().arg::<String>(0).unwrap(), "t-9");
        assert_eq!(next.invocation().kwarg::<u32>("attempt").unwrap(), Some(2));
    }

    #[test]
    fn nested_instruction_arguments_rebuild() {
        let reply = Instruction::new(snapshot(), "on_reply");
        let outer = Instruction::new(snapshot(), "echo")
            .arg(serde_json::to_value(&reply).unwrap())
            .arg("ping");
        let decoded = Instruction::decode(&outer.encode().unwrap()).unwrap();

        let rebuilt: Instruction = decoded.invocation().arg(0).unwrap();
        assert_eq!(rebuilt, reply);
        assert_eq!(rebuilt.service_id().unwrap().kind, "sandbox");
    }

    #[test]
    fn missing_and_malformed_arguments() {
        let inv = Invocation {
            args: vec![json!("x")],
            kwargs: Fields::new(),
        };
        assert!(matches!(inv.arg::<String>(1), Err(ModelError::MissingArgument { .. })));
        assert!(matches!(inv.arg::<u32>(0), Err(ModelError::Malformed { .. })));
        assert_eq!(inv.kwarg::<u32>("absent").unwrap(), None);
        assert!(matches!(
            inv.required::<u32>("absent"),
            Err(ModelError::MissingArgument { name }) if name == "absent"
        ));
    }
}
