use chrono::{DateTime, Utc};
use triage_core::{Callback, ModelError};

/// What a handler asks the dispatcher to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// The service is finished; run its finish hook.
    Done,
    /// Re-enqueue the service to run `callback` later.
    Continue(Callback),
}

impl From<Callback> for Step {
    fn from(callback: Callback) -> Self {
        Self::Continue(callback)
    }
}

impl From<Option<Callback>> for Step {
    fn from(callback: Option<Callback>) -> Self {
        callback.map_or(Self::Done, Self::Continue)
    }
}

/// Result of dispatching one queue message successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The service finished and its finish hook ran.
    Completed,
    /// A continuation was enqueued.
    Continued {
        method: String,
        resume_at: DateTime<Utc>,
    },
    /// The message arrived before its `not_before` and was re-enqueued.
    Deferred { not_before: DateTime<Utc> },
}

impl DispatchOutcome {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Continued { .. } => "continued",
            Self::Deferred { .. } => "deferred",
        }
    }
}

/// Errors returned by the dispatcher. The triggering message is never
/// deleted when one of these is returned.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("expected exactly one queue record, got {count}")]
    RecordCount { count: usize },
    #[error("malformed instruction: {0}")]
    Malformed(#[source] ModelError),
    #[error("cannot reconstruct service `{service}`: {source}")]
    Decode {
        service: String,
        #[source]
        source: ModelError,
    },
    #[error("service `{service}` has no method `{method}`")]
    UnknownMethod { service: String, method: String },
    /// Raised by the service's own logic.
    #[error(transparent)]
    Handler(anyhow::Error),
    /// Raised by the queue, database, or another external surface.
    #[error(transparent)]
    External(anyhow::Error),
}

impl DispatchError {
    /// Short label for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::RecordCount { .. } => "record_count",
            Self::Malformed(_) => "malformed",
            Self::Decode { .. } => "decode",
            Self::UnknownMethod { .. } => "unknown_method",
            Self::Handler(_) => "handler",
            Self::External(_) => "external",
        }
    }
}
