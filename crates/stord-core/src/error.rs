//! Storage service errors.

use std::io;
use std::path::{Path, PathBuf};

use stord_protocol::RpcError;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors surfaced by the storage service.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Malformed package name, volume UUID or caller-supplied path.
    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    /// Caller lacks the elevated system identity.
    #[error("security: {0}")]
    Security(String),

    /// A syscall failed; the errno is kept on `source`.
    #[error("{message}: {source}")]
    Io {
        message: String,
        #[source]
        source: io::Error,
    },

    /// Failure without an errno, e.g. a child process exit status.
    #[error("{message} (code {code})")]
    ServiceSpecific { code: i32, message: String },

    /// A free-cache run ended below its target.
    #[error("failed to free up {target} on {}; final free space {free}", .path.display())]
    InsufficientSpace {
        path: PathBuf,
        target: i64,
        free: i64,
    },
}

impl StorageError {
    pub fn illegal_argument(message: impl Into<String>) -> Self {
        Self::IllegalArgument(message.into())
    }

    pub fn security(message: impl Into<String>) -> Self {
        Self::Security(message.into())
    }

    /// Wrap an I/O error with a message naming the failed step.
    pub fn io(message: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }

    /// Wrap an I/O error raised while operating on `path`.
    pub fn io_at(action: &str, path: &Path, source: io::Error) -> Self {
        Self::io(format!("failed to {} {}", action, path.display()), source)
    }

    pub fn service_specific(code: i32, message: impl Into<String>) -> Self {
        Self::ServiceSpecific {
            code,
            message: message.into(),
        }
    }

    /// The originating errno, when the failure came from a syscall.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::Io { source, .. } => source.raw_os_error(),
            Self::ServiceSpecific { code, .. } => Some(*code),
            Self::InsufficientSpace { .. } => Some(libc::ENOSPC),
            _ => None,
        }
    }
}

impl From<StorageError> for RpcError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::IllegalArgument(message) => RpcError::illegal_argument(message),
            StorageError::Security(message) => RpcError::security(message),
            other => {
                let errno = other.errno().unwrap_or(libc::EIO);
                RpcError::service_specific(errno, other.to_string())
            }
        }
    }
}
