//! Postgres-backed job store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use stowage_events::JobState;
use stowage_transfer_core::{DaemonJobId, DownloadJob, JobId};
use tracing::warn;

use crate::error::{RegistryError, RegistryResult};
use crate::store::{InsertOutcome, JobFilter, JobStore};

/// Database-backed job store.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

const INSERT_IF_VACANT_SQL: &str = r"
    INSERT INTO stowage_runtime.download_jobs (
        job_id,
        daemon_id,
        owner_id,
        destination_path,
        source_uri,
        state,
        created_at,
        last_checked_at,
        error_detail,
        cancel_requested,
        followed_by,
        revision
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
    ON CONFLICT (owner_id, destination_path) WHERE state NOT IN ('complete', 'failed')
    DO NOTHING
    RETURNING job_id
";

const SELECT_COLUMNS: &str = r"
    SELECT
        job_id,
        daemon_id,
        owner_id,
        destination_path,
        source_uri,
        state,
        created_at,
        last_checked_at,
        error_detail,
        cancel_requested,
        followed_by,
        revision
    FROM stowage_runtime.download_jobs
";

const COMPARE_AND_SET_SQL: &str = r"
    UPDATE stowage_runtime.download_jobs
    SET
        daemon_id = COALESCE(daemon_id, $3),
        followed_by = $4,
        state = $5,
        last_checked_at = $6,
        error_detail = $7,
        cancel_requested = $8,
        revision = $9
    WHERE job_id = $1 AND revision = $2
";

const DELETE_TERMINAL_SQL: &str = r"
    DELETE FROM stowage_runtime.download_jobs
    WHERE job_id = $1 AND state IN ('complete', 'failed')
";

const PURGE_COMPLETED_SQL: &str = r"
    DELETE FROM stowage_runtime.download_jobs
    WHERE state = 'complete' AND last_checked_at < $1
";

/// A terminal transition can free the slot between the failed insert and the lookup.
const INSERT_ATTEMPTS: usize = 3;

impl PgJobStore {
    /// Initialise the store, applying pending migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if migrations fail or the database is unreachable.
    pub async fn new(pool: PgPool) -> RegistryResult<Self> {
        let mut migrator = sqlx::migrate!("./migrations");
        migrator.set_ignore_missing(true);
        migrator
            .run(&pool)
            .await
            .map_err(|err| RegistryError::storage("migrate", err))?;
        Ok(Self { pool })
    }

    /// Access the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_where(
        &self,
        clause: &str,
        binds: &[&str],
        operation: &'static str,
    ) -> RegistryResult<Vec<DownloadJob>> {
        let sql = format!("{SELECT_COLUMNS} {clause} ORDER BY created_at, job_id");
        let mut query = sqlx::query(&sql);
        for bind in binds {
            query = query.bind(*bind);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|err| RegistryError::storage(operation, err))?;
        rows.iter().map(decode_job).collect()
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert_if_vacant(&self, job: &DownloadJob) -> RegistryResult<InsertOutcome> {
        for _ in 0..INSERT_ATTEMPTS {
            let inserted = sqlx::query(INSERT_IF_VACANT_SQL)
                .bind(job.id.as_uuid())
                .bind(job.daemon_id.as_ref().map(DaemonJobId::as_str))
                .bind(&job.owner_id)
                .bind(&job.destination_path)
                .bind(&job.source_uri)
                .bind(job.state.as_str())
                .bind(job.created_at)
                .bind(job.last_checked_at)
                .bind(job.error_detail.as_deref())
                .bind(job.cancel_requested)
                .bind(job.followed_by.as_ref().map(DaemonJobId::as_str))
                .bind(revision_column(job.revision))
                .fetch_optional(&self.pool)
                .await
                .map_err(|err| RegistryError::storage("insert_job", err))?;
            if inserted.is_some() {
                return Ok(InsertOutcome::Inserted);
            }

            let occupant = self
                .list(&JobFilter::Destination {
                    owner_id: job.owner_id.clone(),
                    destination_path: job.destination_path.clone(),
                })
                .await?
                .into_iter()
                .next();
            if let Some(existing) = occupant {
                return Ok(InsertOutcome::Occupied(existing));
            }
            warn!(job_id = %job.id, "destination freed during insert; retrying");
        }
        Err(RegistryError::storage(
            "insert_job",
            "destination slot kept changing during insert",
        ))
    }

    async fn get(&self, id: JobId) -> RegistryResult<Option<DownloadJob>> {
        let sql = format!("{SELECT_COLUMNS} WHERE job_id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| RegistryError::storage("get_job", err))?;
        row.as_ref().map(decode_job).transpose()
    }

    async fn compare_and_set(
        &self,
        observed_revision: u64,
        job: &DownloadJob,
    ) -> RegistryResult<bool> {
        let result = sqlx::query(COMPARE_AND_SET_SQL)
            .bind(job.id.as_uuid())
            .bind(revision_column(observed_revision))
            .bind(job.daemon_id.as_ref().map(DaemonJobId::as_str))
            .bind(job.followed_by.as_ref().map(DaemonJobId::as_str))
            .bind(job.state.as_str())
            .bind(job.last_checked_at)
            .bind(job.error_detail.as_deref())
            .bind(job.cancel_requested)
            .bind(revision_column(job.revision))
            .execute(&self.pool)
            .await
            .map_err(|err| RegistryError::storage("update_job", err))?;
        Ok(result.rows_affected() == 1)
    }

    async fn list(&self, filter: &JobFilter) -> RegistryResult<Vec<DownloadJob>> {
        match filter {
            JobFilter::NonTerminal => {
                self.fetch_where(
                    "WHERE state NOT IN ('complete', 'failed')",
                    &[],
                    "list_non_terminal",
                )
                .await
            }
            JobFilter::Owner(owner) => {
                self.fetch_where("WHERE owner_id = $1", &[owner.as_str()], "list_owner")
                    .await
            }
            JobFilter::Destination {
                owner_id,
                destination_path,
            } => {
                self.fetch_where(
                    "WHERE owner_id = $1 AND destination_path = $2 \
                     AND state NOT IN ('complete', 'failed')",
                    &[owner_id.as_str(), destination_path.as_str()],
                    "find_active",
                )
                .await
            }
        }
    }

    async fn remove_terminal(&self, id: JobId) -> RegistryResult<bool> {
        let result = sqlx::query(DELETE_TERMINAL_SQL)
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(|err| RegistryError::storage("remove_job", err))?;
        Ok(result.rows_affected() == 1)
    }

    async fn purge_completed_before(&self, cutoff: DateTime<Utc>) -> RegistryResult<u64> {
        let result = sqlx::query(PURGE_COMPLETED_SQL)
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|err| RegistryError::storage("purge_completed", err))?;
        Ok(result.rows_affected())
    }
}

fn decode_job(row: &PgRow) -> RegistryResult<DownloadJob> {
    let column = |err: sqlx::Error| RegistryError::storage("decode_job", err);
    let state_label: String = row.try_get("state").map_err(column)?;
    let state = JobState::from_label(&state_label).ok_or(RegistryError::Decode {
        field: "state",
        value: state_label,
    })?;
    let daemon_id: Option<String> = row.try_get("daemon_id").map_err(column)?;
    let followed_by: Option<String> = row.try_get("followed_by").map_err(column)?;
    let raw_revision: i64 = row.try_get("revision").map_err(column)?;
    let revision = u64::try_from(raw_revision).map_err(|_| RegistryError::Decode {
        field: "revision",
        value: raw_revision.to_string(),
    })?;

    Ok(DownloadJob {
        id: JobId::from_uuid(row.try_get("job_id").map_err(column)?),
        daemon_id: daemon_id.map(DaemonJobId::new),
        followed_by: followed_by.map(DaemonJobId::new),
        owner_id: row.try_get("owner_id").map_err(column)?,
        destination_path: row.try_get("destination_path").map_err(column)?,
        source_uri: row.try_get("source_uri").map_err(column)?,
        state,
        created_at: row.try_get("created_at").map_err(column)?,
        last_checked_at: row.try_get("last_checked_at").map_err(column)?,
        error_detail: row.try_get("error_detail").map_err(column)?,
        cancel_requested: row.try_get("cancel_requested").map_err(column)?,
        revision,
    })
}

fn revision_column(revision: u64) -> i64 {
    i64::try_from(revision).unwrap_or(i64::MAX)
}
