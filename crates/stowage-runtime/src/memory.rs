//! In-process job store for tests and ephemeral deployments.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use stowage_events::JobState;
use stowage_transfer_core::{DownloadJob, JobId};

use crate::error::RegistryResult;
use crate::store::{InsertOutcome, JobFilter, JobStore};

/// Job store that keeps every record in a single locked map.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<JobId, DownloadJob>>,
}

impl MemoryJobStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, DownloadJob>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert_if_vacant(&self, job: &DownloadJob) -> RegistryResult<InsertOutcome> {
        let mut jobs = self.lock();
        if let Some(existing) = jobs
            .values()
            .find(|candidate| {
                candidate.is_non_terminal()
                    && candidate.targets(&job.owner_id, &job.destination_path)
            })
        {
            return Ok(InsertOutcome::Occupied(existing.clone()));
        }
        jobs.insert(job.id, job.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn get(&self, id: JobId) -> RegistryResult<Option<DownloadJob>> {
        Ok(self.lock().get(&id).cloned())
    }

    async fn compare_and_set(
        &self,
        observed_revision: u64,
        job: &DownloadJob,
    ) -> RegistryResult<bool> {
        let mut jobs = self.lock();
        match jobs.get_mut(&job.id) {
            Some(current) if current.revision == observed_revision => {
                *current = job.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list(&self, filter: &JobFilter) -> RegistryResult<Vec<DownloadJob>> {
        let mut selected: Vec<DownloadJob> = self
            .lock()
            .values()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect();
        selected.sort_by_key(|job| (job.created_at, job.id));
        Ok(selected)
    }

    async fn remove_terminal(&self, id: JobId) -> RegistryResult<bool> {
        let mut jobs = self.lock();
        if jobs.get(&id).is_some_and(|job| job.state.is_terminal()) {
            jobs.remove(&id);
            return Ok(true);
        }
        Ok(false)
    }

    async fn purge_completed_before(&self, cutoff: DateTime<Utc>) -> RegistryResult<u64> {
        let mut jobs = self.lock();
        let before = jobs.len();
        jobs.retain(|_, job| !(job.state == JobState::Complete && job.last_checked_at < cutoff));
        Ok(u64::try_from(before - jobs.len()).unwrap_or(u64::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn second_insert_for_same_destination_is_occupied() -> anyhow::Result<()> {
        let store = MemoryJobStore::new();
        let first = DownloadJob::queued("alice", "http://a/1", "/x.bin");
        let second = DownloadJob::queued("alice", "http://a/2", "/x.bin");
        assert_eq!(store.insert_if_vacant(&first).await?, InsertOutcome::Inserted);
        assert_eq!(
            store.insert_if_vacant(&second).await?,
            InsertOutcome::Occupied(first.clone())
        );

        let other_owner = DownloadJob::queued("bob", "http://a/2", "/x.bin");
        assert_eq!(
            store.insert_if_vacant(&other_owner).await?,
            InsertOutcome::Inserted
        );
        Ok(())
    }

    #[tokio::test]
    async fn terminal_jobs_free_their_destination() -> anyhow::Result<()> {
        let store = MemoryJobStore::new();
        let mut first = DownloadJob::queued("alice", "http://a/1", "/x.bin");
        store.insert_if_vacant(&first).await?;
        first.state = JobState::Failed;
        first.revision = 1;
        assert!(store.compare_and_set(0, &first).await?);

        let retry = DownloadJob::queued("alice", "http://a/1", "/x.bin");
        assert_eq!(store.insert_if_vacant(&retry).await?, InsertOutcome::Inserted);
        Ok(())
    }

    #[tokio::test]
    async fn compare_and_set_rejects_stale_revision() -> anyhow::Result<()> {
        let store = MemoryJobStore::new();
        let mut job = DownloadJob::queued("alice", "http://a/1", "/x.bin");
        store.insert_if_vacant(&job).await?;
        job.state = JobState::Active;
        job.revision = 1;
        assert!(!store.compare_and_set(1, &job).await?);
        assert!(store.compare_and_set(0, &job).await?);
        assert!(!store.compare_and_set(0, &job).await?);
        assert_eq!(
            store.get(job.id).await?.map(|stored| (stored.state, stored.revision)),
            Some((JobState::Active, 1))
        );
        Ok(())
    }

    #[tokio::test]
    async fn purge_only_drops_old_completed_jobs() -> anyhow::Result<()> {
        let store = MemoryJobStore::new();
        let mut done = DownloadJob::queued("alice", "http://a/1", "/done.bin");
        done.state = JobState::Complete;
        done.last_checked_at = Utc::now() - Duration::hours(2);
        let mut failed = DownloadJob::queued("alice", "http://a/2", "/failed.bin");
        failed.state = JobState::Failed;
        failed.last_checked_at = Utc::now() - Duration::hours(2);
        store.insert_if_vacant(&done).await?;
        store.insert_if_vacant(&failed).await?;

        let purged = store
            .purge_completed_before(Utc::now() - Duration::hours(1))
            .await?;
        assert_eq!(purged, 1);
        assert!(store.get(done.id).await?.is_none());
        assert!(store.get(failed.id).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn remove_refuses_live_jobs() -> anyhow::Result<()> {
        let store = MemoryJobStore::new();
        let job = DownloadJob::queued("alice", "http://a/1", "/x.bin");
        store.insert_if_vacant(&job).await?;
        assert!(!store.remove_terminal(job.id).await?);
        assert!(store.get(job.id).await?.is_some());
        Ok(())
    }
}
