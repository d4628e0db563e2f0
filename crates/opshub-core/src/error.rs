//! Error types for the connection lifecycle core.

use thiserror::Error;

use crate::endpoint::ResourceId;

/// Main error type for opshub operations.
///
/// Variants carry string payloads only so the type stays `Clone`: a single
/// establishment attempt's outcome is fanned out to every concurrent waiter
/// on the same resource id.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Malformed descriptor, unsupported auth method, or tunnel cycle.
    /// Fatal for the given configuration; never retried.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Dial, handshake, or channel failure on the transport to a resource.
    /// Not retried by the cache; a later lookup starts a fresh attempt.
    #[error("transport error for resource {id}: {message}")]
    Transport { id: ResourceId, message: String },

    /// Per-operation protocol failure (pty allocation, remote command).
    /// Does not invalidate the underlying shared connection.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Authentication was rejected by the remote end.
    #[error("authentication failed for resource {id}: {message}")]
    Auth { id: ResourceId, message: String },

    /// No metadata exists for the requested resource id.
    #[error("resource not found: {0}")]
    NotFound(ResourceId),

    /// The resource exists but its persisted status is disabled.
    #[error("resource {0} is disabled")]
    Disabled(ResourceId),

    /// The caller is not allowed to attach to the resource.
    #[error("access denied: {message}")]
    AccessDenied { message: String },

    /// Replay-log write or decode failure.
    #[error("recording error: {message}")]
    Recording { message: String },

    /// The terminal session is already closed.
    #[error("session closed")]
    SessionClosed,
}

impl Error {
    /// Configuration error with a formatted message.
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
        }
    }

    /// Transport error tagged with the failing resource id.
    pub fn transport(id: ResourceId, message: impl Into<String>) -> Self {
        Error::Transport {
            id,
            message: message.into(),
        }
    }

    /// Protocol error with a formatted message.
    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol {
            message: message.into(),
        }
    }

    /// Recording error with a formatted message.
    pub fn recording(message: impl Into<String>) -> Self {
        Error::Recording {
            message: message.into(),
        }
    }

    /// Returns true if this error is transient and a fresh lookup may help.
    ///
    /// Transport-class failures qualify; configuration and access errors
    /// never do.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transport { .. } | Error::SessionClosed)
    }
}

/// Result type alias using the opshub error.
pub type Result<T> = std::result::Result<T, Error>;
