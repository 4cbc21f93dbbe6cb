use thiserror::Error;

/// Error kinds the Event Processor and its collaborators surface.
///
/// `NotFound`/`Conflict`/`Ambiguous` are normal branches the Processor handles
/// without alarm or retry; `Transient` is retried by the timer or the Delivery
/// Worker; `Fatal` aborts the current tick (or, at startup, the process).
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("ambiguous: {0}")]
    Ambiguous(String),

    #[error("transient I/O error: {0}")]
    Transient(String),

    #[error("fatal error: {0}")]
    Fatal(String),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RelayError {
    /// Whether a Delivery Worker attempt that failed with this error is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RelayError::Transient(_) | RelayError::Http(_))
    }
}
