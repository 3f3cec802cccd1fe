//! Error types for schema registry and serialization operations.
//!
//! Errors carry their own retryability classification: transport-level and
//! timeout failures are transient and worth retrying with backoff, while
//! authentication failures and malformed schemas will never succeed on a
//! second attempt. The retry driver in [`crate::retry`] consults
//! [`SchemaError::is_retryable`] instead of pattern-matching at every call
//! site.

use thiserror::Error;

/// Convenience type alias for `Result<T, SchemaError>`.
pub type Result<T> = std::result::Result<T, SchemaError>;

/// Error type for schema registry and serialization operations.
///
/// ## Error Categories
///
/// - **Transient** (retryable): `Transport`, `Timeout`, `RegistryStatus`
///   with a 5xx status
/// - **Permanent** (non-retryable): `Unauthorized`, `InvalidSchema`,
///   `SubjectNotFound`, `Incompatible`, 4xx `RegistryStatus`
/// - **Local**: `Serialization`, `Deserialization` (never involve the
///   registry, never retried)
/// - **Control**: `Cancelled` (caller aborted the operation)
#[derive(Debug, Error)]
pub enum SchemaError {
    /// Network-level failure reaching the schema registry.
    ///
    /// Connection refused, DNS failure, broken pipe. The registry may be
    /// restarting; retryable.
    #[error("Schema registry transport error: {0}")]
    Transport(String),

    /// Registry request exceeded its deadline. Retryable.
    #[error("Schema registry request timed out")]
    Timeout,

    /// Registry responded with a non-success HTTP status.
    ///
    /// 5xx statuses indicate a server-side problem and are retryable;
    /// 4xx statuses indicate a request problem and are not.
    #[error("Schema registry returned status {status}: {body}")]
    RegistryStatus { status: u16, body: String },

    /// Authentication or authorization failure. Never retryable.
    #[error("Schema registry rejected credentials: {0}")]
    Unauthorized(String),

    /// The schema text was rejected as malformed. Never retryable.
    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    /// The requested subject does not exist in the registry.
    #[error("Subject '{0}' not found")]
    SubjectNotFound(String),

    /// A compatibility check reported the schema as incompatible with the
    /// currently registered version.
    #[error("Schema for subject '{0}' is incompatible with the registered version")]
    Incompatible(String),

    /// Encoding an entity record to wire bytes failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Decoding wire bytes back to an entity record failed.
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// The operation was cancelled by the caller's cancellation token.
    ///
    /// Distinct from registry errors so callers can tell an aborted
    /// operation from a failed one.
    #[error("Operation cancelled")]
    Cancelled,
}

impl SchemaError {
    /// Check whether this error is worth retrying with backoff.
    ///
    /// # Returns
    ///
    /// `true` for transient failures (transport, timeout, 5xx), `false`
    /// for permanent failures and local serialization errors.
    pub fn is_retryable(&self) -> bool {
        match self {
            SchemaError::Transport(_) => true,
            SchemaError::Timeout => true,
            SchemaError::RegistryStatus { status, .. } => *status >= 500,

            SchemaError::Unauthorized(_) => false,
            SchemaError::InvalidSchema(_) => false,
            SchemaError::SubjectNotFound(_) => false,
            SchemaError::Incompatible(_) => false,
            SchemaError::Serialization(_) => false,
            SchemaError::Deserialization(_) => false,
            SchemaError::Cancelled => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_is_retryable() {
        assert!(SchemaError::Transport("connection refused".into()).is_retryable());
    }

    #[test]
    fn test_timeout_is_retryable() {
        assert!(SchemaError::Timeout.is_retryable());
    }

    #[test]
    fn test_server_status_is_retryable() {
        let err = SchemaError::RegistryStatus {
            status: 503,
            body: "unavailable".into(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn test_client_status_is_not_retryable() {
        let err = SchemaError::RegistryStatus {
            status: 422,
            body: "invalid schema".into(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_unauthorized_is_not_retryable() {
        assert!(!SchemaError::Unauthorized("bad token".into()).is_retryable());
    }

    #[test]
    fn test_invalid_schema_is_not_retryable() {
        assert!(!SchemaError::InvalidSchema("not a record".into()).is_retryable());
    }

    #[test]
    fn test_cancelled_is_not_retryable() {
        assert!(!SchemaError::Cancelled.is_retryable());
    }

    #[test]
    fn test_local_codec_errors_are_not_retryable() {
        assert!(!SchemaError::Serialization("boom".into()).is_retryable());
        assert!(!SchemaError::Deserialization("boom".into()).is_retryable());
    }
}
