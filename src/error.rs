//! GSFS Error Types

use thiserror::Error;

use crate::registry::HostId;

/// Result type alias for GSFS operations
pub type Result<T> = std::result::Result<T, Error>;

/// GSFS error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Startup errors
    #[error("Export error: {0}")]
    Export(String),

    #[error("Staging error: {0}")]
    Staging(String),

    // Encoding errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Invalid tree: {0}")]
    InvalidTree(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    // Namespace errors
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Unknown host: {0}")]
    HostNotFound(HostId),

    #[error("Remote read from host {host} failed: {reason}")]
    RemoteRead { host: HostId, reason: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Convert to a libc error code for FUSE replies
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::NotFound(_) => libc::ENOENT,
            Error::HostNotFound(_) => libc::EIO,
            Error::RemoteRead { .. } => libc::EIO,
            _ => libc::EIO,
        }
    }

    /// Check if this error must abort the process before mounting
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::ConfigParse(_) | Error::Export(_) | Error::Staging(_)
        )
    }
}
