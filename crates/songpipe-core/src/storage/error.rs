use std::{error::Error, fmt, io};

use snafu::{Backtrace, prelude::*};

/// Errors produced by the storage backend implementation.
///
/// Only the local filesystem backend exists today; backend-specific I/O
/// errors are wrapped here so higher layers can map them into
/// [`StorageError`] variants with path context.
#[derive(Debug)]
pub enum BackendError {
    /// A local filesystem I/O error.
    Local(io::Error),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Local(e) => write!(f, "local I/O error: {e}"),
        }
    }
}

impl Error for BackendError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            BackendError::Local(e) => Some(e),
        }
    }
}

impl BackendError {
    pub(crate) fn is_not_found(&self) -> bool {
        match self {
            BackendError::Local(e) => e.kind() == io::ErrorKind::NotFound,
        }
    }

    pub(crate) fn is_already_exists(&self) -> bool {
        match self {
            BackendError::Local(e) => e.kind() == io::ErrorKind::AlreadyExists,
        }
    }
}

/// Errors that can occur during storage operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    /// The specified path was not found.
    #[snafu(display("Path not found: {path}"))]
    NotFound {
        /// The path that was not found.
        path: String,
        /// Underlying backend error that caused the failure.
        source: BackendError,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// The path exists but create-new semantics were requested.
    #[snafu(display("Path already exists: {path}"))]
    AlreadyExists {
        /// The path that was found to already exist.
        path: String,
        /// Underlying backend error that indicates the existing resource.
        source: BackendError,
        /// The backtrace captured when the error occurred.
        backtrace: Backtrace,
    },

    /// Any other I/O failure on the backend.
    #[snafu(display("Local I/O error at {path}: {source}"))]
    OtherIo {
        /// The path where the I/O error occurred.
        path: String,
        /// Underlying backend I/O error with platform-specific details.
        source: BackendError,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// A user-supplied location string could not be interpreted.
    #[snafu(display("Unsupported storage location {spec:?}: {reason}"))]
    InvalidLocation {
        /// The location string as supplied.
        spec: String,
        /// Why it was rejected.
        reason: String,
        /// The backtrace captured when the error occurred.
        backtrace: Backtrace,
    },
}

impl StorageError {
    /// Build the right variant for a raw backend error.
    pub(crate) fn classify(path: String, source: BackendError) -> Self {
        if source.is_not_found() {
            StorageError::NotFound {
                path,
                source,
                backtrace: Backtrace::capture(),
            }
        } else if source.is_already_exists() {
            StorageError::AlreadyExists {
                path,
                source,
                backtrace: Backtrace::capture(),
            }
        } else {
            StorageError::OtherIo {
                path,
                source,
                backtrace: Backtrace::capture(),
            }
        }
    }
}
