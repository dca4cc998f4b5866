//! Error types for registry operations.

use std::error::Error;

use stowage_events::JobState;
use stowage_transfer_core::{DownloadJob, JobId};
use thiserror::Error;

/// Primary error type for the job registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A non-terminal job already targets the same owner and destination.
    #[error("download job conflict")]
    Conflict {
        /// The job occupying the slot.
        existing: Box<DownloadJob>,
    },
    /// No job with the identifier exists.
    #[error("download job not found")]
    NotFound {
        /// Missing job identifier.
        id: JobId,
    },
    /// The requested edge is not part of the job state machine.
    #[error("invalid job state transition")]
    InvalidTransition {
        /// Job identifier.
        id: JobId,
        /// Current state.
        from: JobState,
        /// Requested state.
        to: JobState,
    },
    /// The job was not in the expected state when the update was applied.
    #[error("job state changed concurrently")]
    StaleState {
        /// Job identifier.
        id: JobId,
        /// State the caller expected.
        expected: JobState,
        /// State actually persisted.
        actual: JobState,
    },
    /// Concurrent writers kept winning the revision race.
    #[error("job kept changing during update")]
    Contended {
        /// Job identifier.
        id: JobId,
    },
    /// Only terminal jobs can be removed.
    #[error("job is not terminal")]
    NotTerminal {
        /// Job identifier.
        id: JobId,
        /// Current state.
        state: JobState,
    },
    /// A daemon identifier was already recorded for the job.
    #[error("daemon identifier already assigned")]
    DaemonIdAssigned {
        /// Job identifier.
        id: JobId,
    },
    /// A persisted column held a value that could not be decoded.
    #[error("persisted job record is corrupt")]
    Decode {
        /// Column that failed to decode.
        field: &'static str,
        /// Raw value.
        value: String,
    },
    /// The backing store failed.
    #[error("job store operation failed")]
    Storage {
        /// Operation identifier.
        operation: &'static str,
        /// Underlying failure.
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
}

impl RegistryError {
    pub(crate) fn storage(
        operation: &'static str,
        source: impl Into<Box<dyn Error + Send + Sync>>,
    ) -> Self {
        Self::Storage {
            operation,
            source: source.into(),
        }
    }
}

/// Convenience alias for registry results.
pub type RegistryResult<T> = Result<T, RegistryError>;
