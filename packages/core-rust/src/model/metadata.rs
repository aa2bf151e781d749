//! Metadata: typed annotations attached to an [`Observable`](super::Observable).
//!
//! On the wire every entry is `{"type": <tag>, "value": <json>}`. The concrete
//! variants below are zero-sized markers implementing [`MetadataType`]; they
//! say how a value is encoded and decoded. Entries with a tag this build does
//! not know survive as raw JSON and re-serialize unchanged.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ModelError, Result};

/// A single metadata entry. Equality is `(type, value)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: Value,
}

impl Metadata {
    /// Builds an entry of variant `M`.
    #[must_use]
    pub fn new<M: MetadataType>(value: impl Into<M::Value>) -> Self {
        Self {
            kind: M::TAG.to_string(),
            value: M::encode(value.into()),
        }
    }

    /// Whether this entry carries the tag of `M`.
    #[must_use]
    pub fn is<M: MetadataType>(&self) -> bool {
        self.kind == M::TAG
    }

    /// Decodes the value as `M`, if the tag matches and the value is well formed.
    #[must_use]
    pub fn get<M: MetadataType>(&self) -> Option<M::Value> {
        if self.is::<M>() {
            M::decode(&self.value)
        } else {
            None
        }
    }
}

/// A registered metadata variant.
pub trait MetadataType: 'static {
    /// Discriminator, unique within the metadata family.
    const TAG: &'static str;

    /// The typed value carried by this variant.
    type Value;

    /// Encodes a typed value to its canonical JSON form.
    fn encode(value: Self::Value) -> Value;

    /// Decodes a JSON value, `None` if it is not a valid value for this variant.
    fn decode(value: &Value) -> Option<Self::Value>;

    /// Validates and canonicalizes a decoded entry. Used by the catalog.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidValue`] if the value does not decode.
    fn resolve(mut entry: Metadata) -> Result<Metadata> {
        let Some(decoded) = Self::decode(&entry.value) else {
            return Err(ModelError::invalid(
                Self::TAG,
                &entry.value.to_string(),
                "value does not match the variant",
            ));
        };
        entry.value = Self::encode(decoded);
        Ok(entry)
    }
}

macro_rules! string_metadata {
    (
        $(#[$meta:meta])*
        $name:ident, $tag:expr
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy)]
        pub struct $name;

        impl MetadataType for $name {
            const TAG: &'static str = $tag;
            type Value = String;

            fn encode(value: String) -> Value {
                Value::String(value)
            }

            fn decode(value: &Value) -> Option<String> {
                value.as_str().map(str::to_string)
            }
        }
    };
}

string_metadata!(
    /// Free-form label, e.g. `"malware"`.
    Tag, "tag"
);

string_metadata!(
    /// Instruction for downstream modules, e.g. `"sandbox"`.
    Directive, "directive"
);

string_metadata!(
    /// Description of something that makes the observable alert-worthy.
    DetectionPoint, "detection_point"
);

string_metadata!(
    /// Human-facing override of the observable's value.
    DisplayValue, "display_value"
);

/// Marks an observable as critical to the alert. The value is a flag.
#[derive(Debug, Clone, Copy)]
pub struct CriticalPoint;

impl MetadataType for CriticalPoint {
    const TAG: &'static str = "critical_point";
    type Value = bool;

    fn encode(value: bool) -> Value {
        Value::Bool(value)
    }

    fn decode(value: &Value) -> Option<bool> {
        value.as_bool()
    }
}

/// When the observable was seen. RFC 3339, UTC.
#[derive(Debug, Clone, Copy)]
pub struct Time;

impl MetadataType for Time {
    const TAG: &'static str = "time";
    type Value = DateTime<Utc>;

    fn encode(value: DateTime<Utc>) -> Value {
        Value::String(value.to_rfc3339_opts(SecondsFormat::AutoSi, true))
    }

    fn decode(value: &Value) -> Option<DateTime<Utc>> {
        let text = value.as_str()?;
        DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|parsed| parsed.with_timezone(&Utc))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    #[test]
    fn wire_shape_is_type_and_value() {
        let entry = Metadata::new::<Tag>("bad");
        assert_eq!(
            serde_json::to_value(&entry).unwrap(),
            json!({"type": "tag", "value": "bad"})
        );
    }

    #[test]
    fn equality_is_type_and_value() {
        assert_eq!(Metadata::new::<Tag>("x"), Metadata::new::<Tag>("x"));
        assert_ne!(Metadata::new::<Tag>("x"), Metadata::new::<Directive>("x"));
        assert_ne!(Metadata::new::<Tag>("x"), Metadata::new::<Tag>("y"));
    }

    #[test]
    fn typed_get_checks_tag() {
        let entry = Metadata::new::<DisplayValue>("invoice.pdf");
        assert_eq!(entry.get::<DisplayValue>().as_deref(), Some("invoice.pdf"));
        assert_eq!(entry.get::<Tag>(), None);
    }

    #[test]
    fn time_is_canonical_rfc3339() {
        let when = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        let entry = Metadata::new::<Time>(when);
        assert_eq!(entry.value, json!("2024-03-01T12:30:00Z"));
        assert_eq!(entry.get::<Time>(), Some(when));
    }

    #[test]
    fn resolve_canonicalizes_offsets() {
        let entry = Metadata {
            kind: "time".into(),
            value: json!("2024-03-01T14:30:00+02:00"),
        };
        let resolved = Time::resolve(entry).unwrap();
        assert_eq!(resolved.value, json!("2024-03-01T12:30:00Z"));
    }

    #[test]
    fn resolve_rejects_wrong_shape() {
        let entry = Metadata {
            kind: "critical_point".into(),
            value: json!("yes"),
        };
        assert!(matches!(
            CriticalPoint::resolve(entry),
            Err(ModelError::InvalidValue { tag, .. }) if tag == "critical_point"
        ));
    }
}
