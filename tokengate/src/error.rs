//! Describes rate limiting errors

use std::{
    error::Error as StdError,
    fmt::{Display, Formatter},
    time::Duration
};

/// Result type for bucket store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by bucket stores and the rate limiter facade.
///
/// A denied request is never an error: it is reported as
/// [`Decision::allowed`](crate::Decision) being `false`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The shared store is unreachable or rejected a command.
    StoreUnavailable(String),

    /// A shared store round trip did not complete within the configured timeout.
    Timeout(Duration),

    /// Capacity or refill rate is not positive, or the configuration
    /// selects something that is not supported.
    InvalidConfiguration(&'static str),

    /// Every optimistic commit attempt lost the race against another writer.
    ConcurrentModification {
        /// Client whose bucket could not be updated
        client_id: String,
        /// Number of attempts made before giving up
        attempts: u32,
    },

    /// A persisted entry does not hold a non-negative decimal number.
    CorruptedRecord {
        /// Store key of the entry
        key: String,
        /// Raw value found under the key
        value: String,
    },
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::StoreUnavailable(msg) => write!(f, "Store Error: store unavailable: {msg}"),
            Error::Timeout(after) => write!(f, "Store Error: operation timed out after {}ms", after.as_millis()),
            Error::InvalidConfiguration(msg) => write!(f, "Configuration Error: {msg}"),
            Error::ConcurrentModification { client_id, attempts } => write!(
                f,
                "Store Error: bucket for {client_id} was concurrently modified ({attempts} attempts)"
            ),
            Error::CorruptedRecord { key, value } => write!(f, "Store Error: corrupted entry {key}: {value:?}"),
        }
    }
}

impl StdError for Error {}

impl Error {
    /// Returns `true` if the shared store could not be reached,
    /// either because it failed or because it timed out.
    #[inline]
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Error::StoreUnavailable(_) | Error::Timeout(_))
    }

    /// Returns `true` if the error indicates a configuration problem.
    #[inline]
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfiguration(_))
    }

    /// Returns `true` if retrying the same operation later may succeed.
    #[inline]
    pub fn is_transient(&self) -> bool {
        self.is_store_unavailable() || matches!(self, Error::ConcurrentModification { .. })
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::StoreUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_formats_errors() {
        assert_eq!(
            Error::StoreUnavailable("connection refused".into()).to_string(),
            "Store Error: store unavailable: connection refused"
        );
        assert_eq!(
            Error::Timeout(Duration::from_millis(250)).to_string(),
            "Store Error: operation timed out after 250ms"
        );
        assert_eq!(
            Error::InvalidConfiguration("capacity must be positive").to_string(),
            "Configuration Error: capacity must be positive"
        );
        assert_eq!(
            Error::ConcurrentModification { client_id: "c1".into(), attempts: 3 }.to_string(),
            "Store Error: bucket for c1 was concurrently modified (3 attempts)"
        );
    }

    #[test]
    fn it_classifies_store_failures() {
        assert!(Error::StoreUnavailable("down".into()).is_store_unavailable());
        assert!(Error::Timeout(Duration::from_secs(1)).is_store_unavailable());
        assert!(!Error::InvalidConfiguration("bad").is_store_unavailable());

        assert!(Error::ConcurrentModification { client_id: "a".into(), attempts: 1 }.is_transient());
        assert!(!Error::CorruptedRecord { key: "k".into(), value: "x".into() }.is_transient());
        assert!(Error::InvalidConfiguration("bad").is_config_error());
    }
}
