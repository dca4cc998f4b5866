//! State-machine enforcing front door to the job store.
//!
//! # Design
//! - Every mutation checks the state the caller observed, then writes
//!   conditionally on the record's revision. A lost revision race re-reads and
//!   re-applies the change, so concurrent writers never drop each other's fields.
//! - `create` holds an in-process lock on top of the store's conditional insert.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use stowage_events::JobState;
use stowage_transfer_core::{DaemonJobId, DownloadJob, JobId};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{RegistryError, RegistryResult};
use crate::store::{InsertOutcome, JobFilter, JobStore};

/// Revision races tolerated before an update gives up.
const UPDATE_ATTEMPTS: usize = 8;

/// Authoritative catalog of server fetches.
pub struct JobRegistry {
    store: Arc<dyn JobStore>,
    create_lock: Mutex<()>,
}

impl JobRegistry {
    /// Wrap a persistence backend.
    #[must_use]
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            create_lock: Mutex::new(()),
        }
    }

    /// Store a freshly accepted job.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Conflict`] when a non-terminal job already
    /// targets the same owner and destination.
    pub async fn create(&self, job: DownloadJob) -> RegistryResult<DownloadJob> {
        let _guard = self.create_lock.lock().await;
        match self.store.insert_if_vacant(&job).await? {
            InsertOutcome::Inserted => {
                debug!(job_id = %job.id, owner = %job.owner_id, "download job created");
                Ok(job)
            }
            InsertOutcome::Occupied(existing) => Err(RegistryError::Conflict {
                existing: Box::new(existing),
            }),
        }
    }

    /// Fetch a job.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] for unknown identifiers.
    pub async fn get(&self, id: JobId) -> RegistryResult<DownloadJob> {
        self.store
            .get(id)
            .await?
            .ok_or(RegistryError::NotFound { id })
    }

    /// Move a job from `expected` to `next`, recording `error_detail` when given.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidTransition`] for edges outside the state
    /// machine and [`RegistryError::StaleState`] when the job is no longer in
    /// `expected`.
    pub async fn transition(
        &self,
        id: JobId,
        expected: JobState,
        next: JobState,
        error_detail: Option<String>,
    ) -> RegistryResult<DownloadJob> {
        if !expected.can_transition_to(next) {
            return Err(RegistryError::InvalidTransition {
                id,
                from: expected,
                to: next,
            });
        }
        self.update(id, expected, |job| {
            job.state = next;
            if error_detail.is_some() {
                job.error_detail.clone_from(&error_detail);
            }
            if next.is_terminal() {
                job.cancel_requested = false;
            }
            Ok(())
        })
        .await
    }

    /// Record the daemon identifier. It can be written once.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DaemonIdAssigned`] when a different identifier
    /// is already recorded, and [`RegistryError::StaleState`] when the job left
    /// `expected` concurrently.
    pub async fn assign_daemon_id(
        &self,
        id: JobId,
        expected: JobState,
        daemon_id: DaemonJobId,
    ) -> RegistryResult<DownloadJob> {
        let current = self.get(id).await?;
        match &current.daemon_id {
            Some(existing) if *existing == daemon_id => return Ok(current),
            Some(_) => return Err(RegistryError::DaemonIdAssigned { id }),
            None => {}
        }
        self.update(id, expected, |job| match &job.daemon_id {
            Some(existing) if *existing != daemon_id => {
                Err(RegistryError::DaemonIdAssigned { id })
            }
            _ => {
                job.daemon_id = Some(daemon_id.clone());
                Ok(())
            }
        })
        .await
    }

    /// Track the daemon fetch that took over the payload from the current one.
    ///
    /// The accepted `daemon_id` is kept; status queries move to `follow_up`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::StaleState`] when the job left `expected`.
    pub async fn follow_daemon_job(
        &self,
        id: JobId,
        expected: JobState,
        follow_up: DaemonJobId,
    ) -> RegistryResult<DownloadJob> {
        self.update(id, expected, |job| {
            job.followed_by = Some(follow_up.clone());
            Ok(())
        })
        .await
    }

    /// Flag a cancellation the daemon has not acknowledged yet.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::StaleState`] when the job left `expected`.
    pub async fn mark_cancel_requested(
        &self,
        id: JobId,
        expected: JobState,
    ) -> RegistryResult<DownloadJob> {
        self.update(id, expected, |job| {
            job.cancel_requested = true;
            Ok(())
        })
        .await
    }

    /// Refresh `last_checked_at` without changing state.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::StaleState`] when the job left `expected`.
    pub async fn touch(&self, id: JobId, expected: JobState) -> RegistryResult<DownloadJob> {
        self.update(id, expected, |_| Ok(())).await
    }

    /// The non-terminal job holding `(owner, destination)`, if any.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn find_active(
        &self,
        owner_id: &str,
        destination_path: &str,
    ) -> RegistryResult<Option<DownloadJob>> {
        Ok(self
            .store
            .list(&JobFilter::Destination {
                owner_id: owner_id.to_string(),
                destination_path: destination_path.to_string(),
            })
            .await?
            .into_iter()
            .next())
    }

    /// Every job not yet complete or failed.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn list_non_terminal(&self) -> RegistryResult<Vec<DownloadJob>> {
        self.store.list(&JobFilter::NonTerminal).await
    }

    /// Every job of one owner, oldest first.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn list_for_owner(&self, owner_id: &str) -> RegistryResult<Vec<DownloadJob>> {
        self.store
            .list(&JobFilter::Owner(owner_id.to_string()))
            .await
    }

    /// Delete a terminal job.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotTerminal`] for jobs still in flight.
    pub async fn remove(&self, id: JobId) -> RegistryResult<DownloadJob> {
        let job = self.get(id).await?;
        if !job.state.is_terminal() {
            return Err(RegistryError::NotTerminal {
                id,
                state: job.state,
            });
        }
        if !self.store.remove_terminal(id).await? {
            return Err(RegistryError::NotFound { id });
        }
        Ok(job)
    }

    /// Delete completed jobs last touched before `cutoff`.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn purge_completed_before(&self, cutoff: DateTime<Utc>) -> RegistryResult<u64> {
        self.store.purge_completed_before(cutoff).await
    }

    async fn update<F>(
        &self,
        id: JobId,
        expected: JobState,
        mut apply: F,
    ) -> RegistryResult<DownloadJob>
    where
        F: FnMut(&mut DownloadJob) -> RegistryResult<()> + Send,
    {
        for _ in 0..UPDATE_ATTEMPTS {
            let mut job = self.get(id).await?;
            if job.state != expected {
                return Err(RegistryError::StaleState {
                    id,
                    expected,
                    actual: job.state,
                });
            }
            let observed = job.revision;
            apply(&mut job)?;
            job.revision = observed.wrapping_add(1);
            job.last_checked_at = Utc::now();
            if self.store.compare_and_set(observed, &job).await? {
                return Ok(job);
            }
            debug!(job_id = %id, revision = observed, "job rewritten concurrently; reapplying update");
        }
        Err(RegistryError::Contended { id })
    }
}
