//! Error types shared across the Concord workspace.
//!
//! Higher layers define their own domain error enums; this crate only
//! covers what the shared primitives can fail with.

use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the core primitives.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid hash format or value.
    #[error("invalid hash: {0}")]
    InvalidHash(String),

    /// Invalid cryptographic key.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Signature verification failed.
    #[error("signature verification failed")]
    InvalidSignature,

    /// A referenced item was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an InvalidHash error.
    pub fn invalid_hash(message: impl Into<String>) -> Self {
        Error::InvalidHash(message.into())
    }

    /// Create an InvalidKey error.
    pub fn invalid_key(message: impl Into<String>) -> Self {
        Error::InvalidKey(message.into())
    }

    /// Create an InvalidSignature error.
    pub fn invalid_signature() -> Self {
        Error::InvalidSignature
    }

    /// Create a NotFound error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Error::NotFound(message.into())
    }

    /// Create an Internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal(message.into())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Internal(e.to_string())
    }
}

impl From<hex::FromHexError> for Error {
    fn from(e: hex::FromHexError) -> Self {
        Error::InvalidHash(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = Error::invalid_hash("bad hex");
        assert!(e.to_string().contains("bad hex"));
    }

    #[test]
    fn test_from_hex_error() {
        let err: Error = hex::decode("zz").unwrap_err().into();
        assert!(matches!(err, Error::InvalidHash(_)));
    }
}
