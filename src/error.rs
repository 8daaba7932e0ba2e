//! Error types for CA lifecycle and trust validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

/// Errors raised by the CA engine and its collaborators.
#[derive(Error, Debug)]
pub enum IcpError {
    /// A configuration file is missing, malformed or inconsistent.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The external toolchain exited with a non-zero status.
    #[error("{operation} failed (exit status {status}): {stderr}")]
    Toolchain {
        operation: String,
        status: String,
        stderr: String,
    },

    /// The external toolchain did not finish before its deadline.
    #[error("{operation} timed out after {}s", .timeout.as_secs())]
    Timeout { operation: String, timeout: Duration },

    /// A directory or file could not be created, read or removed.
    #[error("filesystem error at {}: {source}", .path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A CA or certificate name could not be resolved.
    #[error("not found: {0}")]
    NotFound(String),

    /// A caller-supplied parameter was rejected.
    #[error("validation error: {0}")]
    Validation(String),

    /// A CRL could not be retrieved from a distribution point.
    #[error("transport error for {uri}: {reason}")]
    Transport { uri: String, reason: String },

    /// The operation exists but is deliberately not implemented.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// In-process certificate handling failed.
    #[error("openssl error: {0}")]
    Openssl(#[from] openssl::error::ErrorStack),

    /// Catalog (de)serialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Fieldless category of an [`IcpError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Toolchain,
    Timeout,
    Filesystem,
    NotFound,
    Validation,
    Transport,
    Unsupported,
    Openssl,
    Json,
}

impl IcpError {
    /// Category tag for matching without destructuring.
    pub fn kind(&self) -> ErrorKind {
        match self {
            IcpError::Configuration(_) => ErrorKind::Configuration,
            IcpError::Toolchain { .. } => ErrorKind::Toolchain,
            IcpError::Timeout { .. } => ErrorKind::Timeout,
            IcpError::Filesystem { .. } => ErrorKind::Filesystem,
            IcpError::NotFound(_) => ErrorKind::NotFound,
            IcpError::Validation(_) => ErrorKind::Validation,
            IcpError::Transport { .. } => ErrorKind::Transport,
            IcpError::Unsupported(_) => ErrorKind::Unsupported,
            IcpError::Openssl(_) => ErrorKind::Openssl,
            IcpError::Json(_) => ErrorKind::Json,
        }
    }

    /// Captured toolchain stderr, if this error came from the toolchain.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            IcpError::Toolchain { stderr, .. } => Some(stderr),
            _ => None,
        }
    }

    pub(crate) fn transport(uri: &str, reason: impl std::fmt::Display) -> Self {
        IcpError::Transport {
            uri: uri.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn fs(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        IcpError::Filesystem {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, IcpError>;
