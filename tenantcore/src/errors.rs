//! Error types for tenantcore.
//!
//! Each subsystem owns its error enum:
//!
//! - **StoreError**: repository and backend failures
//! - **LockError**: distributed lock acquisition, release and configuration failures
//! - **ConfigError**: configuration loading failures
//!
//! Errors are propagated unchanged to the calling service. Translating them into
//! user-facing messages is the job of the presentation boundary, not this crate.
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use tenantcore::errors::{LockError, StoreError};
//!
//! match repository.find_by_id(&id).await {
//!     Ok(Some(label)) => render(label),
//!     Ok(None) => not_found(),
//!     Err(StoreError::Backend { operation, .. }) => {
//!         tracing::error!(%operation, "label lookup failed");
//!     }
//!     Err(e) => return Err(e.into()),
//! }
//! ```

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Boxed driver error carried as the source of a [`StoreError::Backend`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The store operation that was running when a failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Establishing or checking a connection.
    Connect,
    /// Creating tables, collections or indexes.
    EnsureSchema,
    /// Inserting or replacing entities.
    Save,
    /// Reading entities.
    Find,
    /// Counting entities.
    Count,
    /// Applying a field patch to matching entities.
    Update,
    /// Physically removing entities.
    Delete,
    /// Beginning, committing or rolling back a transaction.
    Transaction,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connect => "connect",
            Self::EnsureSchema => "ensure_schema",
            Self::Save => "save",
            Self::Find => "find",
            Self::Count => "count",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Transaction => "transaction",
        };
        f.write_str(name)
    }
}

/// Errors that can occur when a repository talks to its backing store.
///
/// The driver's own error is kept as the source of [`StoreError::Backend`], so
/// connectivity and query failures surface unchanged to the caller. The
/// repository layer never retries on its own.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached while establishing a connection.
    #[error("connection to {backend} failed")]
    ConnectionFailed {
        /// Backend that failed to connect ("postgres", "mongo", ...)
        backend: &'static str,
        /// Driver error
        #[source]
        source: BoxError,
    },

    /// A store operation failed inside the driver.
    #[error("{operation} operation failed")]
    Backend {
        /// The operation that failed
        operation: Operation,
        /// Driver error
        #[source]
        source: BoxError,
    },

    /// An entity could not be converted into a stored document.
    #[error("serialization failed for {entity}: {detail}")]
    Serialization {
        /// Entity name
        entity: &'static str,
        /// Description of the failure
        detail: String,
    },

    /// A stored document could not be converted back into an entity.
    #[error("deserialization failed for {entity}: {detail}")]
    Deserialization {
        /// Entity name
        entity: &'static str,
        /// Description of the failure
        detail: String,
    },

    /// A table or collection name is not a plain identifier.
    #[error("invalid collection name `{0}`")]
    InvalidCollection(String),

    /// The transaction was already committed or rolled back.
    #[error("transaction already closed")]
    TransactionClosed,
}

impl StoreError {
    /// Wraps a driver error raised during `operation`.
    pub fn backend<E>(operation: Operation, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend {
            operation,
            source: Box::new(source),
        }
    }

    /// Returns the failed operation, if the error came from the driver.
    pub const fn operation(&self) -> Option<Operation> {
        match self {
            Self::Backend { operation, .. } => Some(*operation),
            Self::ConnectionFailed { .. } => Some(Operation::Connect),
            _ => None,
        }
    }
}

/// Errors raised by [`crate::lock::DistributedLock`] and the locked invocation
/// wrapper.
///
/// A version mismatch on release is deliberately *not* an error: the lock may
/// have expired and been re-acquired by another holder, so release logs the
/// mismatch and reports `false`.
#[derive(Debug, Error)]
pub enum LockError {
    /// The lock was configured incorrectly: an empty or unresolvable key, or no
    /// lock client. Fatal to the call and never retried.
    #[error("lock configuration error: {0}")]
    Configuration(String),

    /// Acquisition retries were exhausted before the lock became free.
    #[error("timed out after {waited:?} waiting for lock `{key}`")]
    Timeout {
        /// Fully formatted lock key
        key: String,
        /// How long the caller waited
        waited: Duration,
    },

    /// The backing key-value store failed.
    #[error("lock store failure during {action} on `{key}`")]
    Store {
        /// "acquire" or "release"
        action: &'static str,
        /// Fully formatted lock key
        key: String,
        /// Driver error
        #[source]
        source: BoxError,
    },
}

impl LockError {
    /// Returns true when the error is a [`LockError::Timeout`].
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable held a value that could not be parsed.
    #[error("environment variable {name} has invalid value `{value}`: {reason}")]
    InvalidEnv {
        /// Variable name
        name: &'static str,
        /// Raw value
        value: String,
        /// Parse or validation failure
        reason: String,
    },

    /// A setting was outside its permitted range.
    #[error("invalid setting {name}: {reason}")]
    InvalidSetting {
        /// Setting name
        name: &'static str,
        /// Validation failure
        reason: String,
    },
}

/// Type alias for repository results.
pub type StoreResult<T> = Result<T, StoreError>;

/// Type alias for lock results.
pub type LockResult<T> = Result<T, LockError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_error_keeps_driver_source() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let error = StoreError::backend(Operation::Find, io);

        assert_eq!(error.operation(), Some(Operation::Find));
        let source = std::error::Error::source(&error).expect("source should be kept");
        assert_eq!(source.to_string(), "reset by peer");
    }

    #[test]
    fn timeout_is_distinguishable() {
        let error = LockError::Timeout {
            key: "app:lock:label:7".to_string(),
            waited: Duration::from_secs(1),
        };
        assert!(error.is_timeout());
        assert!(!LockError::Configuration("empty key".to_string()).is_timeout());
    }

    #[test]
    fn operation_display_is_snake_case() {
        assert_eq!(Operation::EnsureSchema.to_string(), "ensure_schema");
        assert_eq!(Operation::Find.to_string(), "find");
    }
}
