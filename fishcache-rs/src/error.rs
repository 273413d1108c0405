//! The error type shared by the cache, the peer transport and the discovery glue.
//!
//! Errors are deliberately cheap to clone: the single-flight memo hands the very same
//! outcome (value or error) to every waiter of a coalesced load, so the error type
//! carries plain strings instead of source chains.
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Enumerates the error conditions surfaced by the cache.
///
/// **InvalidArgument** and the loader-reported **NotFound** are fatal to the current
/// call and never retried. **PeerUnavailable** is recovered internally by falling back
/// to the local loader. **RegistryLost** is only produced by the discovery glue and
/// handed to the bootstrap which decides whether to re-register or terminate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The caller passed data we refuse to work with (empty key, non-positive size).
    InvalidArgument(String),

    /// The user supplied loader reported that the key does not exist at the origin.
    NotFound(String),

    /// A remote peer could not be reached, timed out or answered with an error.
    PeerUnavailable(String),

    /// The connection to the service registry broke down or the lease was revoked.
    RegistryLost(String),

    /// The node is shutting down and no longer accepts requests.
    ShuttingDown,
}

impl CacheError {
    /// Creates a **NotFound** error for the given key.
    ///
    /// This is a convenience for user supplied loaders which report missing keys.
    pub fn not_found(key: &str) -> Self {
        CacheError::NotFound(format!("{} not exist", key))
    }

    /// Determines if this error represents a missing key at the origin.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::NotFound(_))
    }
}

impl Display for CacheError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::InvalidArgument(message) => write!(f, "invalid argument: {}", message),
            CacheError::NotFound(message) => write!(f, "not found: {}", message),
            CacheError::PeerUnavailable(message) => write!(f, "peer unavailable: {}", message),
            CacheError::RegistryLost(message) => write!(f, "registry lost: {}", message),
            CacheError::ShuttingDown => write!(f, "the node is shutting down"),
        }
    }
}

impl Error for CacheError {}

#[cfg(test)]
mod tests {
    use super::CacheError;

    #[test]
    fn display_renders_the_error_kind() {
        assert_eq!(
            CacheError::InvalidArgument("key is empty".to_owned()).to_string(),
            "invalid argument: key is empty"
        );
        assert_eq!(
            CacheError::not_found("Tam").to_string(),
            "not found: Tam not exist"
        );
        assert_eq!(CacheError::ShuttingDown.to_string(), "the node is shutting down");
    }

    #[test]
    fn not_found_is_detected() {
        assert!(CacheError::not_found("x").is_not_found());
        assert!(!CacheError::ShuttingDown.is_not_found());
    }
}
