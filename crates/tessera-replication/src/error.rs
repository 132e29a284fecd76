use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors produced by canonical stores and replicas.
#[derive(Debug, Error)]
pub enum ReplicationError {
    /// The source could not produce an update (network failure, refusal).
    #[error("replica source failed: {0}")]
    Source(String),

    /// An object in an update failed validation; the whole update was dropped.
    #[error("object '{key}' failed validation: {reason}")]
    Validation { key: String, reason: String },

    /// An incremental update did not start at the replica's version.
    #[error("update from version {received} does not apply to local version {local}")]
    VersionMismatch { local: u64, received: u64 },

    /// A replica was read past its lease without being refreshed.
    #[error("replica '{name}' lease expired at {valid_until}")]
    LeaseExpired {
        name: String,
        valid_until: DateTime<Utc>,
    },

    /// A refresh did not succeed within the caller's deadline.
    #[error("replica '{name}' could not be refreshed within {waited_ms} ms: {last_error}")]
    Timeout {
        name: String,
        waited_ms: u64,
        last_error: String,
    },

    /// No live object with this key exists.
    #[error("object '{0}' not found")]
    NotFound(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Persisted state could not be interpreted.
    #[error("corrupt persisted state: {0}")]
    Corrupt(String),
}
