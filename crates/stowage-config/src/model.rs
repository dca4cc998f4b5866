//! Typed configuration consumed by bootstrap.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use url::Url;

use crate::defaults;

/// Settings for the transfer subsystem and its collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferConfig {
    /// Postgres connection string; `None` keeps the job registry in memory.
    #[serde(skip)]
    pub database_url: Option<String>,
    /// Root of the local file store; one subdirectory per owner.
    pub store_root: PathBuf,
    /// Directory the daemon downloads into.
    pub staging_root: PathBuf,
    /// Per-owner storage cap in bytes.
    pub owner_quota_bytes: Option<u64>,
    /// Throughput applied when a transfer does not request one.
    pub default_rate_bps: u64,
    /// Time between reconciliation passes.
    pub poll_interval: Duration,
    /// Upper bound on one daemon call.
    pub daemon_timeout: Duration,
    /// Cap on per-job backoff while the daemon is unreachable.
    pub max_backoff: Duration,
    /// How long completed jobs are kept before purge.
    pub completed_retention: Duration,
    /// aria2 JSON-RPC endpoint.
    pub aria2_rpc_url: Url,
    /// aria2 `--rpc-secret`, sent as a `token:` parameter.
    #[serde(skip)]
    pub aria2_secret: Option<String>,
    /// Log format label (`json` or `pretty`).
    pub log_format: Option<String>,
}

impl TransferConfig {
    /// Configuration with every knob at its default and an explicit daemon endpoint.
    #[must_use]
    pub fn with_endpoint(aria2_rpc_url: Url) -> Self {
        Self {
            database_url: None,
            store_root: PathBuf::from(defaults::STORE_ROOT),
            staging_root: PathBuf::from(defaults::STAGING_ROOT),
            owner_quota_bytes: None,
            default_rate_bps: defaults::DEFAULT_RATE_BPS,
            poll_interval: Duration::from_secs(defaults::POLL_INTERVAL_SECS),
            daemon_timeout: Duration::from_secs(defaults::DAEMON_TIMEOUT_SECS),
            max_backoff: Duration::from_secs(defaults::MAX_BACKOFF_SECS),
            completed_retention: Duration::from_secs(defaults::COMPLETED_RETENTION_SECS),
            aria2_rpc_url,
            aria2_secret: None,
            log_format: None,
        }
    }
}
