//! Error types for the Mixpanel data workspace.
//!
//! All fallible operations in the crate return [`Result<T>`], whose error
//! type is the single [`MixpanelError`] sum type. The variants mirror the
//! Provider's failure taxonomy (authentication, throttling, caller error,
//! server error, transport, protocol drift) plus the local storage
//! preconditions (table exists / table not found).

use thiserror::Error;

/// Result type alias for workspace operations.
pub type Result<T> = std::result::Result<T, MixpanelError>;

/// Errors surfaced by the workspace, transport, fetchers, and storage engine.
#[derive(Debug, Error)]
pub enum MixpanelError {
    /// Invalid or revoked credentials (HTTP 401/403). Never retried.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The Provider throttled the request and internal retries were
    /// exhausted. Carries the server-advertised retry delay in seconds.
    #[error("rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited {
        /// Seconds the Provider asked us to wait before retrying.
        retry_after_secs: u64,
    },

    /// Caller-correctable 4xx (invalid event name, malformed expression,
    /// unknown bookmark). Carries the server message. Never retried.
    #[error("query rejected: {0}")]
    Query(String),

    /// Provider 5xx after retries were exhausted.
    #[error("provider server error: {0}")]
    Server(String),

    /// Network or I/O failure talking to the Provider, after retries.
    #[error("transport error: {0}")]
    Transport(String),

    /// The Provider returned a body this client cannot interpret
    /// (missing keys, wrong value kinds). Indicates API version drift.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The target table already exists and neither `append` nor `replace`
    /// was requested.
    #[error("table already exists: {0}")]
    TableExists(String),

    /// The target table does not exist.
    #[error("table not found: {0}")]
    TableNotFound(String),

    /// Workspace construction or option validation failure.
    #[error("configuration error: {0}")]
    Config(String),

    /// Local storage engine failure (DuckDB).
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Local serialization failure (not a Provider body parse failure,
    /// which maps to [`MixpanelError::Protocol`]).
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MixpanelError {
    pub fn authentication(detail: impl Into<String>) -> Self {
        Self::AuthenticationFailed(detail.into())
    }

    pub fn rate_limited(retry_after_secs: u64) -> Self {
        Self::RateLimited { retry_after_secs }
    }

    pub fn query(detail: impl Into<String>) -> Self {
        Self::Query(detail.into())
    }

    pub fn server(detail: impl Into<String>) -> Self {
        Self::Server(detail.into())
    }

    pub fn transport(detail: impl Into<String>) -> Self {
        Self::Transport(detail.into())
    }

    /// Protocol error with the endpoint and the reason the envelope was
    /// rejected.
    pub fn protocol(context: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Protocol(format!("{}: {}", context.into(), detail.into()))
    }

    pub fn config(detail: impl Into<String>) -> Self {
        Self::Config(detail.into())
    }

    pub fn storage(detail: impl Into<String>) -> Self {
        Self::Storage(detail.into())
    }

    /// Whether the caller could reasonably retry the whole operation.
    /// Transport retries transient failures internally; this classifies
    /// what remains after exhaustion.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            MixpanelError::RateLimited { .. }
                | MixpanelError::Server(_)
                | MixpanelError::Transport(_)
        )
    }

    /// Whether this failure is fatal to a whole fetch job rather than to a
    /// single slice. Auth failures poison every sibling slice; everything
    /// else is isolated.
    pub fn is_fatal_for_job(&self) -> bool {
        matches!(self, MixpanelError::AuthenticationFailed(_))
    }
}

impl From<duckdb::Error> for MixpanelError {
    fn from(e: duckdb::Error) -> Self {
        MixpanelError::Storage(e.to_string())
    }
}
