//! Error taxonomy for the controller core.
//!
//! The variants mirror how failures propagate to clients: `InvalidInput`,
//! `InvalidDefinition` and `InvalidState` are rejected before any work
//! happens; `Deploy` aborts the current service's transaction and surfaces
//! as a final `{error}` event on the stream. Deploys are not atomic across
//! services, so a `Deploy` error can leave a multi-service setup half
//! applied.

use thiserror::Error;

/// Errors raised by the controller core and its collaborators.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed request, unknown deployment, duplicate create.
    #[error("{0}")]
    InvalidInput(String),

    /// A service definition failed canonicalization.
    #[error("invalid service definition: {0}")]
    InvalidDefinition(String),

    /// An illegal state transition, e.g. holding a versioned service.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Recoverable failure during a deploy operation.
    #[error("{0}")]
    Deploy(String),

    /// Service discovery lookup or registration failed.
    #[error("service discovery failed: {0}")]
    Discovery(String),

    /// A container backend operation failed.
    #[error("backend error: {0}")]
    Backend(String),

    /// A concurrent commit won; the snapshot this connection read from is
    /// stale. Retrying the whole operation is the caller's concern.
    #[error("concurrent modification, commit aborted")]
    Conflict,

    #[error("store error: {0}")]
    Store(#[from] sled::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for a [`Error::Deploy`] with a formatted message.
    pub fn deploy(msg: impl Into<String>) -> Self {
        Error::Deploy(msg.into())
    }

    /// Shorthand for a [`Error::InvalidInput`] with a formatted message.
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }
}

/// Result type used throughout the controller.
pub type Result<T, E = Error> = std::result::Result<T, E>;
