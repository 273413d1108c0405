//! Provides the immutable byte payload stored by the cache.
//!
//! A [Value] owns its bytes and reports its own length, which is all the LRU needs to
//! enforce its byte budget. The payload is copied on intake so that the caller cannot
//! mutate cached data, and [Value::as_bytes](Value::as_bytes) hands out a fresh copy for
//! the same reason. Cloning a value only bumps a reference count, therefore values can be
//! passed around freely between the cache, the single-flight memo and the peer server.
#[cfg(test)]
use mock_instant::Instant;
#[cfg(not(test))]
use std::time::Instant;

use bytes::Bytes;

/// An immutable byte payload with an optional absolute expiry instant.
///
/// # Examples
/// ```
/// # use fishcache::value::Value;
/// let value = Value::new(b"630");
/// assert_eq!(value.len(), 3);
/// assert_eq!(value.as_bytes(), b"630".to_vec());
/// ```
#[derive(Clone, Debug)]
pub struct Value {
    data: Bytes,
    expires_at: Option<Instant>,
}

impl Value {
    /// Creates a value which never expires.
    ///
    /// The given bytes are copied so that the caller keeps no handle on the stored data.
    pub fn new(data: &[u8]) -> Self {
        Value {
            data: Bytes::copy_from_slice(data),
            expires_at: None,
        }
    }

    /// Creates a value which expires at the given absolute instant.
    pub fn with_expiry(data: &[u8], expires_at: Instant) -> Self {
        Value {
            data: Bytes::copy_from_slice(data),
            expires_at: Some(expires_at),
        }
    }

    /// Returns the number of payload bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Determines if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns a fresh copy of the payload.
    pub fn as_bytes(&self) -> Vec<u8> {
        self.data.to_vec()
    }

    /// Renders the payload as a string, replacing invalid UTF-8 sequences.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }

    /// Determines if the value has expired at the given instant.
    ///
    /// A value without an expiry never expires.
    pub fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(expires_at) if expires_at < now)
    }
}
