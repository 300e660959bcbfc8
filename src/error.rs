//! Main crate error.

use crate::shutdown::StopCause;

/// Main error enum.
///
/// The variants mirror how callers are expected to react: `Invalid`,
/// `NotFound` and `Exists` are surfaced to the caller and never retried;
/// `Transient` is retried with backoff by the owning supervisor;
/// `FatalInit` aborts startup; `Invariant` halts the supervisor until an
/// operator intervenes.
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    /// Caller-side validation failure (size below min, non-positive price, ...).
    #[error("invalid argument: {0}")]
    Invalid(String),
    /// No such job, product or order.
    #[error("not found: {0}")]
    NotFound(String),
    /// Duplicate creation (uid already exists, clientID already consumed).
    #[error("already exists: {0}")]
    Exists(String),
    /// Network, timeout, 5xx, websocket-closed or sequence-gap failure.
    #[error("transient failure: {0}")]
    Transient(String),
    /// Clock skew out of bounds, unreadable credentials and similar
    /// startup-only failures.
    #[error("fatal initialization failure: {0}")]
    FatalInit(String),
    /// An internal invariant no longer holds; indicates a bug or
    /// corrupted state.
    #[error("invariant violated: {0}")]
    Invariant(String),
    /// The surrounding context was asked to stop mid-operation.
    #[error("stopped ({0:?})")]
    Stopped(Option<StopCause>),
    /// Datastore failure.
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
    /// Serialization of a wire or persisted record failed.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl EngineError {
    /// Whether a retry with backoff is a reasonable reaction.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Whether this error only reports cooperative shutdown.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped(_))
    }

    /// Shorthand for an [`EngineError::Invalid`] with a formatted message.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    /// Shorthand for an [`EngineError::Transient`] with a formatted message.
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(value: reqwest::Error) -> Self {
        EngineError::Transient(value.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for EngineError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        EngineError::Transient(value.to_string())
    }
}

impl From<chrono::ParseError> for EngineError {
    fn from(value: chrono::ParseError) -> Self {
        EngineError::Invalid(format!("timestamp: {value}"))
    }
}
