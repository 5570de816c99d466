use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of every failure the library reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidLayout,
    UnsupportedLayout,
    IoFailure,
    InvalidArgument,
    PermissionDenied,
    ResourceExhausted,
    Cancelled,
    RollbackFailed,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid partition layout: {0}")]
    InvalidLayout(String),

    #[error("unsupported partition layout: {0}")]
    UnsupportedLayout(String),

    #[error("I/O error on {}{}: {source}", path.display(), fmt_offset(*offset))]
    Io {
        path: PathBuf,
        offset: Option<u64>,
        #[source]
        source: io::Error,
    },

    #[error("virtual disk engine failed on {}: {reason}", path.display())]
    DiskEngine { path: PathBuf, reason: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("permission denied on {}: {reason}", path.display())]
    PermissionDenied { path: PathBuf, reason: String },

    #[error(
        "insufficient disk space on {}: {needed} bytes needed, {available} bytes available",
        path.display()
    )]
    InsufficientSpace {
        path: PathBuf,
        needed: u64,
        available: u64,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error(
        "rollback failed, machine files need manual recovery ({}); original error: {original}",
        failures.join("; ")
    )]
    RollbackFailed {
        original: Box<Error>,
        failures: Vec<String>,
    },
}

fn fmt_offset(offset: Option<u64>) -> String {
    match offset {
        Some(off) => format!(" at byte offset {off}"),
        None => String::new(),
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidLayout(_) => ErrorKind::InvalidLayout,
            Error::UnsupportedLayout(_) => ErrorKind::UnsupportedLayout,
            Error::Io { source, .. } if source.kind() == io::ErrorKind::PermissionDenied => {
                ErrorKind::PermissionDenied
            }
            Error::Io { .. } | Error::DiskEngine { .. } => ErrorKind::IoFailure,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Error::InsufficientSpace { .. } => ErrorKind::ResourceExhausted,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::RollbackFailed { .. } => ErrorKind::RollbackFailed,
        }
    }

    /// The error that started the failure, looking through a failed rollback.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::RollbackFailed { original, .. } => original.root_cause(),
            other => other,
        }
    }

    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        Error::Io {
            path: path.as_ref().to_path_buf(),
            offset: None,
            source,
        }
    }

    pub fn io_at(path: impl AsRef<Path>, offset: u64, source: io::Error) -> Self {
        Error::Io {
            path: path.as_ref().to_path_buf(),
            offset: Some(offset),
            source,
        }
    }

    pub fn invalid_layout(reason: impl Into<String>) -> Self {
        Error::InvalidLayout(reason.into())
    }

    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Error::InvalidArgument(reason.into())
    }
}
