//! Tagged-value registry: maps a `type` discriminator to a constructor.
//!
//! Every polymorphic value that crosses a serialization boundary carries a
//! `type` string. A [`TypeRegistry`] holds, per [`Family`], the constructors
//! for the tags this process knows about. Decoding consults the registry only
//! at that boundary:
//!
//! - a registered tag runs its constructor, which may validate and normalize;
//! - an unknown tag produces the family's generic value via
//!   [`Family::fallback`], keeping every raw field. Readers never fail on a
//!   tag they were not built with, they only lose type-specific behavior.
//!
//! Registration happens through explicit calls at start-up (see
//! [`Catalog::with_builtins`](crate::Catalog::with_builtins)); there is no
//! global registry.

use std::collections::HashMap;
use std::fmt;

use crate::catalog::Catalog;
use crate::error::{ModelError, Result};

/// Raw JSON object fields of a tagged value, `type` included.
pub type Fields = serde_json::Map<String, serde_json::Value>;

/// Name of the discriminator field on the wire.
pub const TYPE_FIELD: &str = "type";

/// A family of variants sharing one discriminator namespace.
pub trait Family: 'static {
    /// Human-readable family name for logs and errors.
    const NAME: &'static str;

    /// The decoded-but-unresolved input handed to constructors.
    type Raw;

    /// The value constructors produce.
    type Value;

    /// Reads the `type` tag from raw input.
    fn tag(raw: &Self::Raw) -> Option<&str>;

    /// Builds the generic value for a tag with no registered constructor.
    ///
    /// # Errors
    ///
    /// Only for input the generic value itself cannot hold.
    fn fallback(catalog: &Catalog, raw: Self::Raw) -> Result<Self::Value>;
}

/// Constructor stored per tag.
pub type Constructor<F> = Box<
    dyn Fn(&Catalog, <F as Family>::Raw) -> Result<<F as Family>::Value> + Send + Sync,
>;

/// Registry of constructors for one [`Family`].
pub struct TypeRegistry<F: Family> {
    constructors: HashMap<&'static str, Constructor<F>>,
}

impl<F: Family> TypeRegistry<F> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Registers the constructor for `tag`.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::DuplicateTag`] if the tag is already taken in this
    /// family. The existing constructor is left in place.
    pub fn register<C>(&mut self, tag: &'static str, constructor: C) -> Result<()>
    where
        C: Fn(&Catalog, F::Raw) -> Result<F::Value> + Send + Sync + 'static,
    {
        if self.constructors.contains_key(tag) {
            return Err(ModelError::DuplicateTag {
                family: F::NAME,
                tag: tag.to_string(),
            });
        }
        self.constructors.insert(tag, Box::new(constructor));
        Ok(())
    }

    /// Whether a constructor is registered for `tag`.
    #[must_use]
    pub fn contains(&self, tag: &str) -> bool {
        self.constructors.contains_key(tag)
    }

    /// Registered tags, sorted.
    #[must_use]
    pub fn tags(&self) -> Vec<&'static str> {
        let mut tags: Vec<_> = self.constructors.keys().copied().collect();
        tags.sort_unstable();
        tags
    }

    /// Constructs a value from raw input.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::MissingTag`] when the input has no `type`, or
    /// whatever the registered constructor reports for invalid fields. An
    /// unknown tag is not an error.
    pub fn construct(&self, catalog: &Catalog, raw: F::Raw) -> Result<F::Value> {
        let Some(tag) = F::tag(&raw) else {
            return Err(ModelError::MissingTag { family: F::NAME });
        };
        match self.constructors.get(tag) {
            Some(constructor) => constructor(catalog, raw),
            None => {
                tracing::debug!(family = F::NAME, tag, "unregistered tag, using generic value");
                F::fallback(catalog, raw)
            }
        }
    }
}

impl<F: Family> Default for TypeRegistry<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: Family> fmt::Debug for TypeRegistry<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("family", &F::NAME)
            .field("tags", &self.tags())
            .finish()
    }
}

/// Reads the `type` field of a raw object.
#[must_use]
pub fn tag_of(fields: &Fields) -> Option<&str> {
    fields.get(TYPE_FIELD).and_then(serde_json::Value::as_str)
}
