//! Catalog of observable and metadata variants known to this process.
//!
//! Values are first decoded generically by serde (every variant shares the
//! same shape), then resolved here: a registered tag validates and normalizes
//! the value, an unknown tag passes through untouched.

use serde_json::Value;

use crate::error::{ModelError, Result};
use crate::model::analysis::Analysis;
use crate::model::metadata::{
    CriticalPoint, DetectionPoint, Directive, DisplayValue, Metadata, MetadataType, Tag, Time,
};
use crate::model::observable::{
    EmailAddress, File, Fqdn, Hostname, Ipv4, Ipv6, Md5, Observable, ObservableType, Sha1,
    Sha256, Url, User,
};
use crate::model::submission::Submission;
use crate::registry::{Family, TypeRegistry};

/// Observable variant family.
#[derive(Debug)]
pub struct ObservableFamily;

impl Family for ObservableFamily {
    const NAME: &'static str = "observable";
    type Raw = Observable;
    type Value = Observable;

    fn tag(raw: &Observable) -> Option<&str> {
        Some(raw.kind.as_str())
    }

    fn fallback(catalog: &Catalog, mut raw: Observable) -> Result<Observable> {
        raw.metadata = catalog.resolve_metadata_list(raw.metadata)?;
        Ok(raw)
    }
}

/// Metadata variant family.
#[derive(Debug)]
pub struct MetadataFamily;

impl Family for MetadataFamily {
    const NAME: &'static str = "metadata";
    type Raw = Metadata;
    type Value = Metadata;

    fn tag(raw: &Metadata) -> Option<&str> {
        Some(raw.kind.as_str())
    }

    fn fallback(_catalog: &Catalog, raw: Metadata) -> Result<Metadata> {
        Ok(raw)
    }
}

/// Registries for the value families embedded in analyses and submissions.
#[derive(Debug, Default)]
pub struct Catalog {
    observables: TypeRegistry<ObservableFamily>,
    metadata: TypeRegistry<MetadataFamily>,
}

impl Catalog {
    /// Creates an empty catalog. Every value decodes through the fallback.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a catalog with the built-in observable and metadata variants.
    ///
    /// # Errors
    ///
    /// Never in practice; registration only fails on duplicate tags.
    pub fn with_builtins() -> Result<Self> {
        let mut catalog = Self::new();
        catalog.register_metadata::<Tag>()?;
        catalog.register_metadata::<Directive>()?;
        catalog.register_metadata::<DetectionPoint>()?;
        catalog.register_metadata::<DisplayValue>()?;
        catalog.register_metadata::<CriticalPoint>()?;
        catalog.register_metadata::<Time>()?;

        catalog.register_observable::<Ipv4>()?;
        catalog.register_observable::<Ipv6>()?;
        catalog.register_observable::<Fqdn>()?;
        catalog.register_observable::<Hostname>()?;
        catalog.register_observable::<Url>()?;
        catalog.register_observable::<EmailAddress>()?;
        catalog.register_observable::<User>()?;
        catalog.register_observable::<File>()?;
        catalog.register_observable::<Md5>()?;
        catalog.register_observable::<Sha1>()?;
        catalog.register_observable::<Sha256>()?;
        Ok(catalog)
    }

    /// Registers observable variant `T`.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::DuplicateTag`] if `T::TAG` is taken.
    pub fn register_observable<T: ObservableType>(&mut self) -> Result<()> {
        self.observables.register(T::TAG, |catalog, mut raw: Observable| {
            raw.value = T::normalize(&raw.value)?;
            raw.metadata = catalog.resolve_metadata_list(raw.metadata)?;
            Ok(raw)
        })
    }

    /// Registers metadata variant `M`.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::DuplicateTag`] if `M::TAG` is taken.
    pub fn register_metadata<M: MetadataType>(&mut self) -> Result<()> {
        self.metadata.register(M::TAG, |_catalog, raw| M::resolve(raw))
    }

    /// Whether an observable variant is registered for `tag`.
    #[must_use]
    pub fn knows_observable(&self, tag: &str) -> bool {
        self.observables.contains(tag)
    }

    /// Whether a metadata variant is registered for `tag`.
    #[must_use]
    pub fn knows_metadata(&self, tag: &str) -> bool {
        self.metadata.contains(tag)
    }

    /// Validates and normalizes a decoded observable and its metadata.
    ///
    /// # Errors
    ///
    /// Returns the registered variant's error for invalid values.
    pub fn resolve_observable(&self, observable: Observable) -> Result<Observable> {
        self.observables.construct(self, observable)
    }

    /// Validates and normalizes a decoded metadata entry.
    ///
    /// # Errors
    ///
    /// Returns the registered variant's error for invalid values.
    pub fn resolve_metadata(&self, entry: Metadata) -> Result<Metadata> {
        self.metadata.construct(self, entry)
    }

    /// Resolves a list of metadata entries. An entry whose value no longer
    /// decodes under its registered tag is kept raw.
    fn resolve_metadata_list(&self, entries: Vec<Metadata>) -> Result<Vec<Metadata>> {
        let mut resolved: Vec<Metadata> = Vec::with_capacity(entries.len());
        for entry in entries {
            let entry = match self.resolve_metadata(entry.clone()) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(tag = %entry.kind, error = %e, "keeping metadata value unresolved");
                    MetadataFamily::fallback(self, entry)?
                }
            };
            // Normalization can make two raw entries equal.
            if !resolved.contains(&entry) {
                resolved.push(entry);
            }
        }
        Ok(resolved)
    }

    /// Decodes an observable from JSON and resolves it.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Malformed`] if the JSON is not observable-shaped,
    /// or the variant's error for invalid values.
    pub fn decode_observable(&self, value: Value) -> Result<Observable> {
        let tag = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or(ObservableFamily::NAME)
            .to_string();
        let observable: Observable =
            serde_json::from_value(value).map_err(|e| ModelError::malformed(&tag, e))?;
        self.resolve_observable(observable)
    }

    /// Resolves an observable read back from a stored snapshot. A value that
    /// its registered variant now rejects is kept as the generic value.
    fn resolve_stored(&self, observable: Observable) -> Result<Observable> {
        match self.resolve_observable(observable.clone()) {
            Ok(resolved) => Ok(resolved),
            Err(e) => {
                tracing::warn!(
                    tag = %observable.kind,
                    value = %observable.value,
                    error = %e,
                    "keeping observable value unresolved"
                );
                ObservableFamily::fallback(self, observable)
            }
        }
    }

    /// Resolves the target and every child observable of an analysis in place.
    ///
    /// One entry that no longer validates does not fail the whole analysis;
    /// it keeps its raw value.
    ///
    /// # Errors
    ///
    /// Only if the generic fallback itself fails.
    pub fn resolve_analysis(&self, analysis: &mut Analysis) -> Result<()> {
        analysis.target = self.resolve_stored(analysis.target.clone())?;
        let children = std::mem::take(&mut analysis.observables);
        for child in children {
            let child = self.resolve_stored(child)?;
            analysis.add_observable(child);
        }
        Ok(())
    }

    /// Resolves every observable of a submission in place, with the same
    /// tolerance as [`resolve_analysis`](Self::resolve_analysis).
    ///
    /// # Errors
    ///
    /// Only if the generic fallback itself fails.
    pub fn resolve_submission(&self, submission: &mut Submission) -> Result<()> {
        let observables = std::mem::take(&mut submission.observables);
        for observable in observables {
            let observable = self.resolve_stored(observable)?;
            submission.add_observable(observable);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn catalog() -> Catalog {
        Catalog::with_builtins().unwrap()
    }

    #[test]
    fn builtins_are_registered() {
        let c = catalog();
        assert!(c.knows_observable("ipv4"));
        assert!(c.knows_observable("file"));
        assert!(c.knows_metadata("display_value"));
        assert!(!c.knows_observable("ja3_fingerprint"));
    }

    #[test]
    fn known_variant_is_normalized() {
        let o = catalog()
            .decode_observable(json!({"type": "fqdn", "value": "WWW.Example.org."}))
            .unwrap();
        assert!(o.is::<Fqdn>());
        assert_eq!(o.value, "www.example.org");
    }

    #[test]
    fn stale_value_in_snapshot_keeps_the_rest() {
        let raw = json!({
            "id": "00000000-0000-0000-0000-000000000001",
            "target": {"type": "fqdn", "value": "Old.Example"},
            "status": "running",
            "observables": [
                {"type": "ipv4", "value": "010.1.1.1",
                 "metadata": [{"type": "time", "value": "yesterday"}, {"type": "tag", "value": "legacy"}]},
                {"type": "ipv4", "value": "192.0.2.7"}
            ]
        });
        let mut analysis: Analysis = serde_json::from_value(raw).unwrap();
        catalog().resolve_analysis(&mut analysis).unwrap();

        assert_eq!(analysis.target.value, "old.example");
        assert_eq!(analysis.observables.len(), 2);
        let stale = &analysis.observables[0];
        assert_eq!(stale.kind, "ipv4");
        assert_eq!(stale.value, "010.1.1.1");
        assert_eq!(stale.metadata[0].value, json!("yesterday"));
        assert_eq!(stale.tags(), vec!["legacy"]);
        assert_eq!(analysis.observables[1].value, "192.0.2.7");
    }

    #[test]
    fn fresh_input_with_bad_value_is_rejected() {
        let err = catalog()
            .decode_observable(json!({"type": "ipv4", "value": "not-an-ip"}))
            .unwrap_err();
        assert!(matches!(err, ModelError::InvalidValue { tag, .. } if tag == "ipv4"));
    }

    #[test]
    fn unknown_variant_keeps_raw_fields() {
        let raw = json!({
            "type": "ja3_fingerprint",
            "value": "771,4865-4866",
            "metadata": [{"type": "tag", "value": "tls"}],
            "client": "curl",
        });
        let o = catalog().decode_observable(raw.clone()).unwrap();
        assert_eq!(o.kind, "ja3_fingerprint");
        assert_eq!(o.extra.get("client"), Some(&json!("curl")));
        assert_eq!(serde_json::to_value(&o).unwrap(), raw);
    }

    #[test]
    fn unknown_metadata_survives() {
        let raw = json!({
            "type": "ipv4",
            "value": "10.1.1.1",
            "metadata": [{"type": "geo", "value": {"country": "NL"}}],
        });
        let o = catalog().decode_observable(raw).unwrap();
        assert_eq!(o.metadata[0].kind, "geo");
        assert_eq!(o.metadata[0].value, json!({"country": "NL"}));
    }

    #[test]
    fn empty_catalog_accepts_everything() {
        let o = Catalog::new()
            .decode_observable(json!({"type": "ipv4", "value": "not-an-ip"}))
            .unwrap();
        assert_eq!(o.value, "not-an-ip");
    }

    #[test]
    fn resolving_analysis_merges_normalized_duplicates() {
        let mut analysis = Analysis::new(Observable::new::<Fqdn>("a.example").unwrap());
        analysis.observables.push(Observable {
            kind: "fqdn".into(),
            value: "B.example".into(),
            metadata: vec![Metadata::new::<Tag>("x")],
            extra: crate::Fields::new(),
        });
        analysis.observables.push(Observable {
            kind: "fqdn".into(),
            value: "b.example".into(),
            metadata: vec![Metadata::new::<Tag>("y")],
            extra: crate::Fields::new(),
        });

        catalog().resolve_analysis(&mut analysis).unwrap();
        assert_eq!(analysis.observables.len(), 1);
        assert_eq!(analysis.observables[0].tags(), vec!["x", "y"]);
    }

    mod props {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #[test]
            fn repeated_add_never_grows(tags in proptest::collection::vec("[a-z]{1,6}", 1..12)) {
                let mut o = Observable::new::<Ipv4>("127.0.0.1").unwrap();
                for tag in &tags {
                    o.tag(tag.clone());
                }
                let before = o.metadata.len();
                for tag in &tags {
                    o.tag(tag.clone());
                }
                prop_assert_eq!(o.metadata.len(), before);
                let mut unique = tags.clone();
                unique.sort();
                unique.dedup();
                prop_assert_eq!(before, unique.len());
            }

            #[test]
            fn unknown_tags_round_trip(kind in "x_[a-z]{1,10}", value in "[ -~]{0,24}", extra in "[a-z]{1,8}") {
                let raw = serde_json::json!({
                    "type": kind,
                    "value": value,
                    "metadata": [],
                    "note": extra,
                });
                let o = Catalog::with_builtins().unwrap().decode_observable(raw.clone()).unwrap();
                prop_assert_eq!(serde_json::to_value(&o).unwrap(), raw);
            }

            #[test]
            fn fqdn_normalization_is_idempotent(label in "[a-zA-Z]{1,12}", tld in "[a-zA-Z]{2,4}") {
                let c = Catalog::with_builtins().unwrap();
                let once = c
                    .decode_observable(serde_json::json!({"type": "fqdn", "value": format!("{label}.{tld}.")}))
                    .unwrap();
                let twice = c.resolve_observable(once.clone()).unwrap();
                prop_assert_eq!(once.value, twice.value);
            }
        }
    }
}
