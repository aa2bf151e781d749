//! Observables: typed units of evidence (addresses, domains, files, hashes).
//!
//! All variants share one shape, `{type, value, metadata}`, so [`Observable`]
//! is a single struct; variants are zero-sized markers implementing
//! [`ObservableType`] that validate and normalize the value. Unknown variants
//! keep any additional raw fields in [`Observable::extra`].

use std::hash::{Hash, Hasher};
use std::net::{Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

use super::metadata::{Metadata, MetadataType, DetectionPoint, Directive, DisplayValue, Tag};
use crate::error::{ModelError, Result};
use crate::registry::Fields;

/// A typed piece of evidence with ordered metadata.
///
/// Equality and hashing use `(type, value)` only, so merging two equal
/// observables never changes identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observable {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
    #[serde(default)]
    pub metadata: Vec<Metadata>,
    /// Raw fields beyond the common shape, kept for forward compatibility.
    #[serde(flatten)]
    pub extra: Fields,
}

impl Observable {
    /// Builds an observable of variant `T`, normalizing the value.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidValue`] if `T` rejects the value.
    pub fn new<T: ObservableType>(value: impl AsRef<str>) -> Result<Self> {
        Ok(Self {
            kind: T::TAG.to_string(),
            value: T::normalize(value.as_ref())?,
            metadata: Vec::new(),
            extra: Fields::new(),
        })
    }

    /// Whether this observable carries the tag of `T`.
    #[must_use]
    pub fn is<T: ObservableType>(&self) -> bool {
        self.kind == T::TAG
    }

    /// Adds a metadata entry of variant `M` unless an equal one exists.
    ///
    /// Returns the stored entry, which is the pre-existing one on a repeat call.
    pub fn add<M: MetadataType>(&mut self, value: impl Into<M::Value>) -> &Metadata {
        self.add_metadata(Metadata::new::<M>(value))
    }

    /// Appends `entry` unless an equal `(type, value)` entry exists.
    pub fn add_metadata(&mut self, entry: Metadata) -> &Metadata {
        let index = match self.metadata.iter().position(|existing| *existing == entry) {
            Some(index) => index,
            None => {
                self.metadata.push(entry);
                self.metadata.len() - 1
            }
        };
        &self.metadata[index]
    }

    /// Folds the metadata of an equal observable into this one, in order.
    pub fn merge(&mut self, other: Observable) {
        for entry in other.metadata {
            self.add_metadata(entry);
        }
        for (key, value) in other.extra {
            self.extra.entry(key).or_insert(value);
        }
    }

    /// First value of variant `M`, in insertion order.
    #[must_use]
    pub fn get<M: MetadataType>(&self) -> Option<M::Value> {
        self.metadata.iter().find_map(Metadata::get::<M>)
    }

    /// All values of variant `M`, in insertion order.
    #[must_use]
    pub fn all<M: MetadataType>(&self) -> Vec<M::Value> {
        self.metadata.iter().filter_map(Metadata::get::<M>).collect()
    }

    /// Whether an entry `(M, value)` is present.
    #[must_use]
    pub fn has<M: MetadataType>(&self, value: impl Into<M::Value>) -> bool {
        let candidate = Metadata::new::<M>(value);
        self.metadata.contains(&candidate)
    }

    /// Adds a [`Tag`].
    pub fn tag(&mut self, name: impl Into<String>) -> &Metadata {
        self.add::<Tag>(name.into())
    }

    /// Tags in insertion order.
    #[must_use]
    pub fn tags(&self) -> Vec<String> {
        self.all::<Tag>()
    }

    /// Directives in insertion order.
    #[must_use]
    pub fn directives(&self) -> Vec<String> {
        self.all::<Directive>()
    }

    /// Detection points in insertion order.
    #[must_use]
    pub fn detection_points(&self) -> Vec<String> {
        self.all::<DetectionPoint>()
    }

    /// The first [`DisplayValue`] if present, otherwise the raw value.
    #[must_use]
    pub fn display_value(&self) -> &str {
        self.metadata
            .iter()
            .find(|entry| entry.is::<DisplayValue>())
            .and_then(|entry| entry.value.as_str())
            .unwrap_or(&self.value)
    }

    /// Lower-cased suffix after the last `.` of the display value.
    ///
    /// Only file observables have an extension; `None` when there is no dot
    /// or nothing follows it.
    #[must_use]
    pub fn extension(&self) -> Option<String> {
        if !self.is::<File>() {
            return None;
        }
        let (_, suffix) = self.display_value().rsplit_once('.')?;
        if suffix.is_empty() {
            None
        } else {
            Some(suffix.to_lowercase())
        }
    }
}

impl PartialEq for Observable {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.value == other.value
    }
}

impl Eq for Observable {}

impl Hash for Observable {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.value.hash(state);
    }
}

/// Inserts `observable` into `list` unless an equal one exists, merging metadata.
///
/// Returns the stored observable.
pub(crate) fn insert_observable(list: &mut Vec<Observable>, observable: Observable) -> &mut Observable {
    match list.iter().position(|existing| *existing == observable) {
        Some(index) => {
            let stored = &mut list[index];
            stored.merge(observable);
            stored
        }
        None => {
            list.push(observable);
            let last = list.len() - 1;
            &mut list[last]
        }
    }
}

/// A registered observable variant.
pub trait ObservableType: 'static {
    /// Discriminator, unique within the observable family.
    const TAG: &'static str;

    /// Validates and canonicalizes a raw value.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidValue`] for values this variant cannot hold.
    fn normalize(value: &str) -> Result<String> {
        Ok(value.to_string())
    }
}

fn non_empty(tag: &str, value: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(ModelError::invalid(tag, value, "empty value"))
    } else {
        Ok(trimmed.to_string())
    }
}

fn hex_digest(tag: &str, value: &str, len: usize) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.len() != len || !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ModelError::invalid(
            tag,
            value,
            format!("expected {len} hex characters"),
        ));
    }
    Ok(trimmed.to_ascii_lowercase())
}

/// IPv4 address.
#[derive(Debug, Clone, Copy)]
pub struct Ipv4;

impl ObservableType for Ipv4 {
    const TAG: &'static str = "ipv4";

    fn normalize(value: &str) -> Result<String> {
        value
            .trim()
            .parse::<Ipv4Addr>()
            .map(|addr| addr.to_string())
            .map_err(|e| ModelError::invalid(Self::TAG, value, e.to_string()))
    }
}

/// IPv6 address, stored in its compressed canonical form.
#[derive(Debug, Clone, Copy)]
pub struct Ipv6;

impl ObservableType for Ipv6 {
    const TAG: &'static str = "ipv6";

    fn normalize(value: &str) -> Result<String> {
        value
            .trim()
            .parse::<Ipv6Addr>()
            .map(|addr| addr.to_string())
            .map_err(|e| ModelError::invalid(Self::TAG, value, e.to_string()))
    }
}

/// Fully qualified domain name, lower-cased without a trailing dot.
#[derive(Debug, Clone, Copy)]
pub struct Fqdn;

impl ObservableType for Fqdn {
    const TAG: &'static str = "fqdn";

    fn normalize(value: &str) -> Result<String> {
        let name = non_empty(Self::TAG, value)?;
        let name = name.trim_end_matches('.').to_ascii_lowercase();
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(ModelError::invalid(Self::TAG, value, "not a domain name"));
        }
        Ok(name)
    }
}

/// Host name, lower-cased.
#[derive(Debug, Clone, Copy)]
pub struct Hostname;

impl ObservableType for Hostname {
    const TAG: &'static str = "hostname";

    fn normalize(value: &str) -> Result<String> {
        Ok(non_empty(Self::TAG, value)?.to_ascii_lowercase())
    }
}

/// URL. Must carry a scheme.
#[derive(Debug, Clone, Copy)]
pub struct Url;

impl ObservableType for Url {
    const TAG: &'static str = "url";

    fn normalize(value: &str) -> Result<String> {
        let url = non_empty(Self::TAG, value)?;
        match url.split_once("://") {
            Some((scheme, rest)) if !scheme.is_empty() && !rest.is_empty() => Ok(url),
            _ => Err(ModelError::invalid(Self::TAG, value, "missing scheme")),
        }
    }
}

/// E-mail address, lower-cased.
#[derive(Debug, Clone, Copy)]
pub struct EmailAddress;

impl ObservableType for EmailAddress {
    const TAG: &'static str = "email_address";

    fn normalize(value: &str) -> Result<String> {
        let address = non_empty(Self::TAG, value)?;
        match address.split_once('@') {
            Some((local, domain)) if !local.is_empty() && !domain.is_empty() => {
                Ok(address.to_lowercase())
            }
            _ => Err(ModelError::invalid(Self::TAG, value, "missing `@`")),
        }
    }
}

/// User account name.
#[derive(Debug, Clone, Copy)]
pub struct User;

impl ObservableType for User {
    const TAG: &'static str = "user";

    fn normalize(value: &str) -> Result<String> {
        non_empty(Self::TAG, value)
    }
}

/// File body held in object storage. The value is the content hash id; the
/// file name travels as a [`DisplayValue`].
#[derive(Debug, Clone, Copy)]
pub struct File;

impl ObservableType for File {
    const TAG: &'static str = "file";

    fn normalize(value: &str) -> Result<String> {
        non_empty(Self::TAG, value)
    }
}

/// MD5 digest.
#[derive(Debug, Clone, Copy)]
pub struct Md5;

impl ObservableType for Md5 {
    const TAG: &'static str = "md5";

    fn normalize(value: &str) -> Result<String> {
        hex_digest(Self::TAG, value, 32)
    }
}

/// SHA-1 digest.
#[derive(Debug, Clone, Copy)]
pub struct Sha1;

impl ObservableType for Sha1 {
    const TAG: &'static str = "sha1";

    fn normalize(value: &str) -> Result<String> {
        hex_digest(Self::TAG, value, 40)
    }
}

/// SHA-256 digest.
#[derive(Debug, Clone, Copy)]
pub struct Sha256;

impl ObservableType for Sha256 {
    const TAG: &'static str = "sha256";

    fn normalize(value: &str) -> Result<String> {
        hex_digest(Self::TAG, value, 64)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::model::metadata::CriticalPoint;

    #[test]
    fn repeated_metadata_add_is_idempotent() {
        let mut o = Observable::new::<Ipv4>("127.0.0.1").unwrap();
        o.add::<Tag>("bad");
        o.add::<Tag>("bad");
        assert_eq!(o.metadata, vec![Metadata::new::<Tag>("bad")]);
    }

    #[test]
    fn add_returns_stored_entry() {
        let mut o = Observable::new::<Fqdn>("example.com").unwrap();
        o.add::<CriticalPoint>(true);
        let stored = o.add::<CriticalPoint>(true).clone();
        assert_eq!(stored, Metadata::new::<CriticalPoint>(true));
        assert_eq!(o.metadata.len(), 1);
    }

    #[test]
    fn metadata_keeps_insertion_order() {
        let mut o = Observable::new::<User>("alice").unwrap();
        o.tag("b");
        o.tag("a");
        o.add::<Directive>("sandbox");
        o.tag("b");
        assert_eq!(o.tags(), vec!["b", "a"]);
        assert_eq!(o.directives(), vec!["sandbox"]);
    }

    #[test]
    fn equality_ignores_metadata() {
        let mut a = Observable::new::<Ipv4>("10.0.0.1").unwrap();
        let b = Observable::new::<Ipv4>("10.0.0.1").unwrap();
        a.tag("internal");
        assert_eq!(a, b);
        assert_ne!(a, Observable::new::<Hostname>("10.0.0.1").unwrap());
    }

    #[test]
    fn display_value_prefers_first_override() {
        let mut o = Observable::new::<File>("abc123").unwrap();
        assert_eq!(o.display_value(), "abc123");
        o.add::<DisplayValue>("first.doc");
        o.add::<DisplayValue>("second.doc");
        assert_eq!(o.display_value(), "first.doc");
    }

    #[test]
    fn extension_is_lowercased_suffix() {
        let mut o = Observable::new::<File>("abc123").unwrap();
        o.add::<DisplayValue>("Report.Final.PDF");
        assert_eq!(o.extension().as_deref(), Some("pdf"));
    }

    #[test]
    fn extension_absent_without_suffix() {
        let mut no_dot = Observable::new::<File>("abc").unwrap();
        no_dot.add::<DisplayValue>("README");
        assert_eq!(no_dot.extension(), None);

        let mut trailing = Observable::new::<File>("abc").unwrap();
        trailing.add::<DisplayValue>("archive.");
        assert_eq!(trailing.extension(), None);
    }

    #[test]
    fn extension_only_for_files() {
        let o = Observable::new::<Url>("https://example.com/a.exe").unwrap();
        assert_eq!(o.extension(), None);
    }

    #[test]
    fn variants_normalize_values() {
        assert_eq!(Observable::new::<Fqdn>("Example.COM.").unwrap().value, "example.com");
        assert_eq!(
            Observable::new::<Ipv6>("2001:0db8:0000:0000:0000:0000:0000:0001").unwrap().value,
            "2001:db8::1"
        );
        assert_eq!(
            Observable::new::<Md5>("D41D8CD98F00B204E9800998ECF8427E").unwrap().value,
            "d41d8cd98f00b204e9800998ecf8427e"
        );
        assert_eq!(
            Observable::new::<EmailAddress>(" Bob@Example.com ").unwrap().value,
            "bob@example.com"
        );
    }

    #[test]
    fn variants_reject_invalid_values() {
        assert!(Observable::new::<Ipv4>("300.1.1.1").is_err());
        assert!(Observable::new::<Sha256>("abc").is_err());
        assert!(Observable::new::<Url>("example.com").is_err());
        assert!(Observable::new::<EmailAddress>("nobody").is_err());
        assert!(Observable::new::<User>("   ").is_err());
    }

    #[test]
    fn wire_shape_preserves_order_and_type() {
        let mut o = Observable::new::<Ipv4>("1.2.3.4").unwrap();
        o.tag("z");
        o.tag("a");
        assert_eq!(
            serde_json::to_value(&o).unwrap(),
            json!({
                "type": "ipv4",
                "value": "1.2.3.4",
                "metadata": [
                    {"type": "tag", "value": "z"},
                    {"type": "tag", "value": "a"},
                ],
            })
        );
    }

    #[test]
    fn merge_folds_metadata_into_existing() {
        let mut list = Vec::new();
        let mut first = Observable::new::<Ipv4>("8.8.8.8").unwrap();
        first.tag("dns");
        insert_observable(&mut list, first);

        let mut second = Observable::new::<Ipv4>("8.8.8.8").unwrap();
        second.tag("google");
        second.tag("dns");
        let stored = insert_observable(&mut list, second);
        assert_eq!(stored.tags(), vec!["dns", "google"]);
        assert_eq!(list.len(), 1);
    }
}
