//! Error types shared by the transfer services and their collaborators.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::model::DaemonJobId;

/// Errors surfaced by the client transfer path.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The store refused access to the requested resource.
    #[error("permission denied")]
    PermissionDenied {
        /// Owner the request was made for.
        owner: String,
        /// Requested store path.
        path: String,
        /// Reason reported by the store.
        reason: String,
    },
    /// The requested resource does not exist.
    #[error("resource not found")]
    NotFound {
        /// Owner the request was made for.
        owner: String,
        /// Requested store path.
        path: String,
    },
    /// A transfer parameter was invalid.
    #[error("invalid transfer configuration")]
    InvalidConfiguration {
        /// Field that failed validation.
        field: &'static str,
        /// Machine-readable reason.
        reason: &'static str,
        /// Offending value, when printable.
        value: Option<String>,
    },
    /// The source ended before delivering its declared size.
    #[error("transfer truncated")]
    TruncatedTransfer {
        /// Declared size in bytes.
        expected: u64,
        /// Bytes actually received.
        received: u64,
    },
    /// I/O failure on either end of the transfer.
    #[error("transfer io failure")]
    Io {
        /// Operation that failed.
        operation: &'static str,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
}

impl TransferError {
    /// Wrap an I/O error with its operation.
    #[must_use]
    pub const fn io(operation: &'static str, source: io::Error) -> Self {
        Self::Io { operation, source }
    }

    /// Translate a store error raised on behalf of `owner`.
    #[must_use]
    pub fn from_store(owner: &str, path: &str, error: StoreError) -> Self {
        match error {
            StoreError::NotFound { .. } => Self::NotFound {
                owner: owner.to_string(),
                path: path.to_string(),
            },
            StoreError::PermissionDenied { reason, .. } => Self::PermissionDenied {
                owner: owner.to_string(),
                path: path.to_string(),
                reason,
            },
            StoreError::Io {
                operation, source, ..
            } => Self::Io { operation, source },
        }
    }
}

/// Convenience alias for transfer results.
pub type TransferResult<T> = Result<T, TransferError>;

/// Errors raised by file store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The path does not resolve to a file.
    #[error("store entry not found")]
    NotFound {
        /// Requested store path.
        path: String,
    },
    /// The store refused the operation.
    #[error("store permission denied")]
    PermissionDenied {
        /// Requested store path.
        path: String,
        /// Machine-readable reason.
        reason: String,
    },
    /// Filesystem failure.
    #[error("store io failure")]
    Io {
        /// Operation that failed.
        operation: &'static str,
        /// Filesystem path involved.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    /// Wrap an I/O error with its operation and path.
    #[must_use]
    pub fn io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    /// Build a permission error.
    #[must_use]
    pub fn denied(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PermissionDenied {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Convenience alias for file store results.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by download daemon adapters.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// The daemon could not be reached or did not answer in time.
    #[error("download daemon unreachable")]
    Unreachable {
        /// Control operation attempted.
        operation: &'static str,
        /// Transport detail.
        detail: String,
    },
    /// The daemon refused the request.
    #[error("download daemon rejected request")]
    Rejected {
        /// Control operation attempted.
        operation: &'static str,
        /// Message returned by the daemon.
        message: String,
    },
    /// The daemon does not know the job.
    #[error("download daemon does not know job")]
    UnknownJob {
        /// Identifier that was queried.
        id: DaemonJobId,
    },
    /// The daemon answered with something the adapter could not interpret.
    #[error("download daemon protocol error")]
    Protocol {
        /// Control operation attempted.
        operation: &'static str,
        /// What was wrong with the reply.
        detail: String,
    },
}

impl DaemonError {
    /// Transient failures leave job state untouched and are retried later.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable { .. })
    }

    /// Human-readable detail for job records and logs.
    #[must_use]
    pub fn detail(&self) -> String {
        match self {
            Self::Unreachable { operation, detail } => {
                format!("{operation}: daemon unreachable: {detail}")
            }
            Self::Rejected { operation, message } => format!("{operation}: {message}"),
            Self::UnknownJob { id } => format!("unknown daemon job {id}"),
            Self::Protocol { operation, detail } => {
                format!("{operation}: protocol error: {detail}")
            }
        }
    }
}

/// Convenience alias for daemon control results.
pub type DaemonResult<T> = Result<T, DaemonError>;
