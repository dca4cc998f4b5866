//! Core transfer domain types shared across the workspace.

use std::fmt::{self, Display, Formatter};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stowage_events::JobState;
use uuid::Uuid;

use crate::error::{TransferError, TransferResult};

/// Result of a single direct upload attempt.
///
/// Only the named constructors build values, so `success` always implies
/// `permission_granted && !limit_reached`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransferOutcome {
    permission_granted: bool,
    success: bool,
    limit_reached: bool,
}

impl TransferOutcome {
    /// The store refused a writable resource.
    #[must_use]
    pub const fn denied() -> Self {
        Self {
            permission_granted: false,
            success: false,
            limit_reached: false,
        }
    }

    /// Every declared byte arrived and the file was committed.
    #[must_use]
    pub const fn completed() -> Self {
        Self {
            permission_granted: true,
            success: true,
            limit_reached: false,
        }
    }

    /// The source was cut short or overran its declared size.
    #[must_use]
    pub const fn truncated() -> Self {
        Self {
            permission_granted: true,
            success: false,
            limit_reached: true,
        }
    }

    /// An I/O error ended the pipeline.
    #[must_use]
    pub const fn failed() -> Self {
        Self {
            permission_granted: true,
            success: false,
            limit_reached: false,
        }
    }

    /// Whether the store granted a writable resource.
    #[must_use]
    pub const fn permission_granted(self) -> bool {
        self.permission_granted
    }

    /// Whether the upload was committed.
    #[must_use]
    pub const fn success(self) -> bool {
        self.success
    }

    /// Whether the source ended before (or beyond) its declared size.
    #[must_use]
    pub const fn limit_reached(self) -> bool {
        self.limit_reached
    }

    /// Short label for metrics and logs.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match (self.permission_granted, self.success, self.limit_reached) {
            (false, _, _) => "denied",
            (true, true, _) => "completed",
            (true, false, true) => "truncated",
            (true, false, false) => "failed",
        }
    }
}

/// Throughput cap applied to one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateConfig {
    bytes_per_second: u64,
}

impl RateConfig {
    /// Rate used when the caller does not supply one (80 MB/s).
    pub const DEFAULT_BYTES_PER_SECOND: u64 = 80_000_000;

    /// Validate and build a rate.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InvalidConfiguration`] when the rate is zero.
    pub fn new(bytes_per_second: u64) -> TransferResult<Self> {
        if bytes_per_second == 0 {
            return Err(TransferError::InvalidConfiguration {
                field: "bytes_per_second",
                reason: "must_be_positive",
                value: Some(bytes_per_second.to_string()),
            });
        }
        Ok(Self { bytes_per_second })
    }

    /// Configured throughput in bytes per second.
    #[must_use]
    pub const fn bytes_per_second(self) -> u64 {
        self.bytes_per_second
    }
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            bytes_per_second: Self::DEFAULT_BYTES_PER_SECOND,
        }
    }
}

/// Registry identifier of a download job, assigned at acceptance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Allocate a fresh identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Underlying UUID.
    #[must_use]
    pub const fn as_uuid(self) -> Uuid {
        self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for JobId {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(formatter)
    }
}

/// Opaque identifier the download daemon assigned to a fetch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DaemonJobId(String);

impl DaemonJobId {
    /// Wrap a daemon-issued identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for DaemonJobId {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

/// Why a job ended in [`JobState::Failed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The daemon refused the fetch or could not be reached to accept it.
    DaemonRejected(String),
    /// The daemon reported the fetch as failed.
    DaemonFailed(String),
    /// The owner cancelled the job.
    Cancelled,
    /// The daemon lost the job and no artifact was found.
    Orphaned,
    /// The payload could not be moved into the file store.
    ImportFailed(String),
    /// The process stopped before the job could be handed to the daemon.
    Interrupted,
}

impl Display for FailureReason {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::DaemonRejected(detail) => write!(formatter, "daemon_rejected: {detail}"),
            Self::DaemonFailed(detail) => write!(formatter, "daemon_failed: {detail}"),
            Self::Cancelled => formatter.write_str("cancelled"),
            Self::Orphaned => formatter.write_str("orphaned: no artifact found"),
            Self::ImportFailed(detail) => write!(formatter, "import_failed: {detail}"),
            Self::Interrupted => formatter.write_str("interrupted"),
        }
    }
}

/// A server-side fetch tracked from acceptance to completion or failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadJob {
    /// Registry identifier.
    pub id: JobId,
    /// Identifier assigned by the daemon; set once, on acceptance.
    pub daemon_id: Option<DaemonJobId>,
    /// Daemon fetch that took over the payload after `daemon_id` finished,
    /// as when a magnet's metadata fetch hands off to the torrent download.
    #[serde(default)]
    pub followed_by: Option<DaemonJobId>,
    /// Owner that requested the fetch.
    pub owner_id: String,
    /// Destination path inside the owner's store.
    pub destination_path: String,
    /// URI handed to the daemon.
    pub source_uri: String,
    /// Current lifecycle state.
    pub state: JobState,
    /// Acceptance timestamp.
    pub created_at: DateTime<Utc>,
    /// Last time the orchestrator looked at the job.
    pub last_checked_at: DateTime<Utc>,
    /// Failure detail for failed jobs.
    pub error_detail: Option<String>,
    /// A cancellation is waiting for the daemon to acknowledge it.
    #[serde(default)]
    pub cancel_requested: bool,
    /// Bumped on every persisted write; updates are conditional on it.
    #[serde(default)]
    pub revision: u64,
}

impl DownloadJob {
    /// Build a freshly accepted job in [`JobState::Queued`].
    #[must_use]
    pub fn queued(
        owner_id: impl Into<String>,
        source_uri: impl Into<String>,
        destination_path: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            daemon_id: None,
            followed_by: None,
            owner_id: owner_id.into(),
            destination_path: destination_path.into(),
            source_uri: source_uri.into(),
            state: JobState::Queued,
            created_at: now,
            last_checked_at: now,
            error_detail: None,
            cancel_requested: false,
            revision: 0,
        }
    }

    /// The daemon fetch currently carrying the payload.
    #[must_use]
    pub fn tracked_daemon_id(&self) -> Option<&DaemonJobId> {
        self.followed_by.as_ref().or(self.daemon_id.as_ref())
    }

    /// Whether the job occupies its `(owner, destination)` slot.
    #[must_use]
    pub const fn is_non_terminal(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Whether the job targets the given owner and destination.
    #[must_use]
    pub fn targets(&self, owner_id: &str, destination_path: &str) -> bool {
        self.owner_id == owner_id && self.destination_path == destination_path
    }
}

/// State the daemon reports for one of its fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonState {
    /// Waiting in the daemon's queue.
    Waiting,
    /// Transferring.
    Active,
    /// Held by the daemon.
    Paused,
    /// Finished; files are in the staging location.
    Complete,
    /// Failed inside the daemon.
    Error,
    /// Removed from the daemon (usually by an abort).
    Removed,
}

/// Progress snapshot for a daemon fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DaemonProgress {
    /// Bytes fetched so far.
    pub completed_bytes: u64,
    /// Total bytes expected; zero while unknown.
    pub total_bytes: u64,
    /// Current download speed.
    pub download_bps: u64,
}

impl DaemonProgress {
    /// Completion percentage (0-100).
    #[must_use]
    pub fn percent_complete(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            (to_f64(self.completed_bytes) / to_f64(self.total_bytes)) * 100.0
        }
    }
}

const fn to_f64(value: u64) -> f64 {
    #[expect(
        clippy::cast_precision_loss,
        reason = "u64 to f64 conversion is only used for percentage reporting"
    )]
    {
        value as f64
    }
}

/// Status reply from the daemon control protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonStatus {
    /// Daemon-side state.
    pub state: DaemonState,
    /// Progress counters.
    pub progress: DaemonProgress,
    /// Error reported by the daemon, if any.
    pub error_detail: Option<String>,
    /// Files the fetch produced, in the staging location.
    pub files: Vec<PathBuf>,
    /// Fetches the daemon started to continue this one. Non-empty only for
    /// hand-offs, which report a running state instead of completion.
    #[serde(default)]
    pub followed_by: Vec<DaemonJobId>,
}

/// Terminal-aware chunk produced by an upload source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceChunk {
    /// Payload bytes.
    Data(Vec<u8>),
    /// No more bytes; `truncated` is set when the source was cut short upstream.
    EndOfInput {
        /// Whether the source ended early.
        truncated: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_constructors_hold_the_success_invariant() {
        for outcome in [
            TransferOutcome::denied(),
            TransferOutcome::completed(),
            TransferOutcome::truncated(),
            TransferOutcome::failed(),
        ] {
            if outcome.success() {
                assert!(outcome.permission_granted());
                assert!(!outcome.limit_reached());
            }
        }
        assert_eq!(TransferOutcome::denied().label(), "denied");
        assert_eq!(TransferOutcome::truncated().label(), "truncated");
    }

    #[test]
    fn outcome_serialises_field_names() -> anyhow::Result<()> {
        let value = serde_json::to_value(TransferOutcome::completed())?;
        assert_eq!(value["permission_granted"], true);
        assert_eq!(value["success"], true);
        assert_eq!(value["limit_reached"], false);
        Ok(())
    }

    #[test]
    fn zero_rate_is_rejected() {
        assert!(matches!(
            RateConfig::new(0),
            Err(TransferError::InvalidConfiguration { field: "bytes_per_second", .. })
        ));
        assert_eq!(
            RateConfig::default().bytes_per_second(),
            RateConfig::DEFAULT_BYTES_PER_SECOND
        );
    }

    #[test]
    fn failure_reasons_render_detail() {
        assert_eq!(FailureReason::Cancelled.to_string(), "cancelled");
        assert_eq!(
            FailureReason::DaemonFailed("timeout".into()).to_string(),
            "daemon_failed: timeout"
        );
    }

    #[test]
    fn progress_percent_handles_unknown_total() {
        let unknown = DaemonProgress::default();
        assert!(unknown.percent_complete().abs() < f64::EPSILON);
        let half = DaemonProgress {
            completed_bytes: 50,
            total_bytes: 100,
            download_bps: 0,
        };
        assert!((half.percent_complete() - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn queued_job_starts_non_terminal() {
        let job = DownloadJob::queued("u1", "http://example/file", "/a.bin");
        assert_eq!(job.state, JobState::Queued);
        assert!(job.is_non_terminal());
        assert!(job.targets("u1", "/a.bin"));
        assert!(job.daemon_id.is_none());
        assert!(job.tracked_daemon_id().is_none());
    }

    #[test]
    fn follow_up_fetch_takes_over_tracking() {
        let mut job = DownloadJob::queued("u1", "magnet:?xt=urn:btih:08ada5a7", "/a");
        job.daemon_id = Some(DaemonJobId::new("meta"));
        assert_eq!(job.tracked_daemon_id(), Some(&DaemonJobId::new("meta")));
        job.followed_by = Some(DaemonJobId::new("payload"));
        assert_eq!(job.tracked_daemon_id(), Some(&DaemonJobId::new("payload")));
    }
}
