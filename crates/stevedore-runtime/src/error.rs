//! Runtime error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading and resolving the configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file not found at the specified path.
    #[error("configuration file not found: {0}")]
    FileNotFound(PathBuf),

    /// Extraction from file/environment sources failed.
    #[error("configuration error: {0}")]
    Extract(#[from] figment::Error),

    /// No host address configured and none detectable.
    #[error("cannot determine host ip, set the HOST_IP environment variable")]
    HostIp,
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
