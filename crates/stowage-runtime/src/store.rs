//! Persistence seam behind the job registry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use stowage_transfer_core::{DownloadJob, JobId};

use crate::error::RegistryResult;

/// Result of a conditional insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The job was stored.
    Inserted,
    /// A non-terminal job already holds the `(owner, destination)` slot.
    Occupied(DownloadJob),
}

/// Selection applied when listing jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobFilter {
    /// Every job not yet complete or failed.
    NonTerminal,
    /// Every job of one owner, oldest first.
    Owner(String),
    /// The non-terminal job holding a destination, if any.
    Destination {
        /// Owner of the destination.
        owner_id: String,
        /// Destination path.
        destination_path: String,
    },
}

impl JobFilter {
    /// Whether `job` is selected by the filter.
    #[must_use]
    pub fn matches(&self, job: &DownloadJob) -> bool {
        match self {
            Self::NonTerminal => job.is_non_terminal(),
            Self::Owner(owner) => job.owner_id == *owner,
            Self::Destination {
                owner_id,
                destination_path,
            } => job.is_non_terminal() && job.targets(owner_id, destination_path),
        }
    }
}

/// Durable storage for download jobs.
///
/// Implementations make `insert_if_vacant` and `compare_and_set` atomic with
/// respect to each other.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert `job` unless a non-terminal job holds its destination.
    async fn insert_if_vacant(&self, job: &DownloadJob) -> RegistryResult<InsertOutcome>;

    /// Fetch one job.
    async fn get(&self, id: JobId) -> RegistryResult<Option<DownloadJob>>;

    /// Overwrite the mutable fields of `job` if the persisted revision still
    /// equals `observed_revision`.
    ///
    /// Returns `false` when another write landed first or the job is gone.
    async fn compare_and_set(&self, observed_revision: u64, job: &DownloadJob)
    -> RegistryResult<bool>;

    /// List jobs selected by `filter`, oldest first.
    async fn list(&self, filter: &JobFilter) -> RegistryResult<Vec<DownloadJob>>;

    /// Delete a job if it is terminal. Returns whether a row was removed.
    async fn remove_terminal(&self, id: JobId) -> RegistryResult<bool>;

    /// Delete completed jobs last touched before `cutoff`.
    async fn purge_completed_before(&self, cutoff: DateTime<Utc>) -> RegistryResult<u64>;
}
