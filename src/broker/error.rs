//! Error types for the broker core and their retry classification.
//!
//! Every failure that leaves the core is a [`BrokerError`]. Variants fall into
//! the following families:
//!
//! 1. **Validation** (caller input fault, never retried): bad identifiers,
//!    empty/oversized/dangerous commands, a missing WHERE clause, unknown
//!    profiles.
//!
//! 2. **Transport** (`Connection`, `CommandTimeout`, `Query`): the remote side
//!    failed. Connection failures may be retried by the caller with backoff,
//!    unless the message shows an authentication failure.
//!
//! 3. **Capacity** (`PoolExhausted`, `LockTimeout`): contention. The caller
//!    should retry later or reduce concurrency.
//!
//! 4. **Vault** (`Decryption`, `PayloadTooLarge`, `KeyMaterial`): fatal for the
//!    affected profile until corrected.
//!
//! The pool never retries on its own; [`BrokerError::is_retryable`] exists so
//! the dispatcher in front of the core can apply its own policy.

use thiserror::Error;

use super::types::{PoolKey, ResourceType};

/// Result alias used throughout the broker core.
pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("invalid identifier '{0}': must match [A-Za-z_][A-Za-z0-9_]* and fit the length limit")]
    InvalidIdentifier(String),

    #[error("command is empty")]
    EmptyCommand,

    #[error("command is {len} bytes, limit is {max}")]
    CommandTooLong { len: usize, max: usize },

    #[error("command rejected: {0}")]
    DangerousOperation(String),

    #[error("a non-empty WHERE clause is required for {0}")]
    MissingWhereClause(&'static str),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("profile '{0}' not found")]
    ProfileNotFound(String),

    #[error("profile '{name}' is a {actual} profile, not {expected}")]
    ProfileTypeMismatch {
        name: String,
        expected: ResourceType,
        actual: ResourceType,
    },

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("command timed out after {0:?}")]
    CommandTimeout(std::time::Duration),

    #[error("query failed: {0}")]
    Query(String),

    #[error("connection pool exhausted for {key} ({max} connections in use)")]
    PoolExhausted { key: PoolKey, max: usize },

    #[error("timed out after {0:?} waiting for exclusive access")]
    LockTimeout(std::time::Duration),

    #[error("failed to decrypt secret: {0}")]
    Decryption(String),

    #[error("secret is {len} bytes, limit is {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("encryption key unavailable: {0}")]
    KeyMaterial(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BrokerError {
    /// Stable snake_case discriminator, used by the front end in error strings.
    pub fn kind(&self) -> &'static str {
        match self {
            BrokerError::InvalidIdentifier(_)
            | BrokerError::EmptyCommand
            | BrokerError::CommandTooLong { .. }
            | BrokerError::DangerousOperation(_)
            | BrokerError::MissingWhereClause(_)
            | BrokerError::InvalidInput(_)
            | BrokerError::ProfileNotFound(_)
            | BrokerError::ProfileTypeMismatch { .. } => "validation_error",
            BrokerError::Connection(_) | BrokerError::CommandTimeout(_) => "connection_error",
            BrokerError::Query(_) => "query_error",
            BrokerError::PoolExhausted { .. } => "pool_exhausted",
            BrokerError::LockTimeout(_) => "lock_timeout",
            BrokerError::Decryption(_) | BrokerError::KeyMaterial(_) => "decryption_error",
            BrokerError::PayloadTooLarge { .. } => "payload_too_large",
            BrokerError::Io(_) => "io_error",
        }
    }

    /// Whether a caller may reasonably retry the failed operation.
    ///
    /// Capacity errors are always retryable. Connection errors are retryable
    /// unless the transport reported an authentication failure, which would
    /// only fail again (and may lock the account).
    pub fn is_retryable(&self) -> bool {
        match self {
            BrokerError::PoolExhausted { .. } | BrokerError::LockTimeout(_) => true,
            BrokerError::Connection(message) => is_retryable_error(message),
            _ => false,
        }
    }
}

impl From<sqlx::Error> for BrokerError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db) => BrokerError::Query(db.to_string()),
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::ColumnIndexOutOfBounds { .. }
            | sqlx::Error::Decode(_)
            | sqlx::Error::TypeNotFound { .. }
            | sqlx::Error::RowNotFound => BrokerError::Query(err.to_string()),
            other => BrokerError::Connection(other.to_string()),
        }
    }
}

impl From<russh::Error> for BrokerError {
    fn from(err: russh::Error) -> Self {
        BrokerError::Connection(err.to_string())
    }
}

/// Authentication error patterns that indicate permanent failures.
const AUTH_ERRORS: &[&str] = &[
    "authentication failed",
    "password authentication failed",
    "key authentication failed",
    "permission denied",
    "publickey",
    "auth fail",
    "no authentication",
    "all authentication methods failed",
    "invalid authorization specification",
];

/// Connection error patterns that indicate transient failures.
const RETRYABLE_ERRORS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection timed out",
    "timeout",
    "timed out",
    "network is unreachable",
    "no route to host",
    "host is down",
    "temporary failure",
    "resource temporarily unavailable",
    "handshake failed",
    "failed to connect",
    "broken pipe",
    "would block",
    "pool timed out",
];

/// Classifies a transport error message as transient or permanent.
///
/// Authentication failures are checked first and always win. Known transient
/// network conditions are retryable. Anything else is retried unless it looks
/// like a protocol error ("ssh", "protocol") without a timeout/connect hint.
pub(crate) fn is_retryable_error(error: &str) -> bool {
    let error_lower = error.to_lowercase();

    if AUTH_ERRORS.iter().any(|auth_err| error_lower.contains(auth_err)) {
        return false;
    }

    if RETRYABLE_ERRORS
        .iter()
        .any(|retryable_err| error_lower.contains(retryable_err))
    {
        return true;
    }

    let protocol_error = error_lower.contains("ssh") || error_lower.contains("protocol");
    !protocol_error || error_lower.contains("connect")
}
