//! Error types for the hypervisor abstraction layer.

use thiserror::Error;

/// Errors that can occur during hypervisor operations.
///
/// The `Display` output of `Validation`, `Gate`, `Native` and `Agent` is the
/// user-visible message forwarded verbatim over the RPC surface, so those
/// variants carry the final wording.
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to connect to the hypervisor.
    #[error("failed to connect to hypervisor: {0}")]
    ConnectionFailed(String),

    /// A named object (domain, pool, volume, network, device, snapshot)
    /// does not exist.
    #[error("{0}")]
    NotFound(String),

    /// Request rejected before any mutation was attempted.
    #[error("{0}")]
    Validation(String),

    /// A safety-gate predicate refused the mutation.
    #[error("{0}")]
    Gate(String),

    /// The underlying hypervisor library returned an error.
    #[error("{0}")]
    Native(String),

    /// Guest agent exchange failed or returned a malformed payload.
    #[error("{0}")]
    Agent(String),

    /// XML generation or parsing error.
    #[error("XML error: {0}")]
    Xml(String),

    /// Filesystem error (backup archives, /proc readers).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected internal state.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn gate(msg: impl Into<String>) -> Self {
        Error::Gate(msg.into())
    }

    pub fn native(msg: impl Into<String>) -> Self {
        Error::Native(msg.into())
    }
}

/// Result type alias for hypervisor operations.
pub type Result<T> = std::result::Result<T, Error>;
