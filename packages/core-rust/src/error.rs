//! Error type shared by the registry, the domain model, and the envelope codecs.

/// The result type used throughout `triage-core`.
pub type Result<T> = std::result::Result<T, ModelError>;

/// Errors raised while constructing, decoding, or mutating domain values.
///
/// An unknown `type` tag is deliberately absent: decoding an unregistered
/// variant falls back to the family's generic value instead of failing.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// A tag was registered twice within the same family.
    #[error("{family} tag `{tag}` is already registered")]
    DuplicateTag { family: &'static str, tag: String },

    /// A raw value carried no `type` discriminator.
    #[error("{family} value has no `type` field")]
    MissingTag { family: &'static str },

    /// The fields of a registered variant could not be decoded.
    #[error("malformed `{tag}` value: {source}")]
    Malformed {
        tag: String,
        #[source]
        source: serde_json::Error,
    },

    /// A registered variant rejected its value during normalization.
    #[error("invalid `{tag}` value {value:?}: {reason}")]
    InvalidValue {
        tag: String,
        value: String,
        reason: String,
    },

    /// An analysis status change that would leave a terminal state.
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// A positional or keyword argument the handler requires was not supplied.
    #[error("missing argument `{name}`")]
    MissingArgument { name: String },

    /// Encoding a value to JSON failed.
    #[error("encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ModelError {
    /// Builds an [`InvalidValue`](Self::InvalidValue) error.
    #[must_use]
    pub fn invalid(tag: &str, value: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            tag: tag.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    /// Builds a [`Malformed`](Self::Malformed) error.
    #[must_use]
    pub fn malformed(tag: &str, source: serde_json::Error) -> Self {
        Self::Malformed {
            tag: tag.to_string(),
            source,
        }
    }
}
