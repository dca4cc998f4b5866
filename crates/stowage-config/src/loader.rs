//! Load [`TransferConfig`] from environment variables.

use tracing::debug;

use crate::defaults;
use crate::error::{ConfigError, ConfigResult};
use crate::model::TransferConfig;
use crate::validate::{
    parse_dir, parse_log_format, parse_positive_u64, parse_rpc_url, parse_seconds,
};

/// Postgres connection string.
pub const DATABASE_URL: &str = "DATABASE_URL";
/// File store root.
pub const STORE_ROOT: &str = "STOWAGE_STORE_ROOT";
/// Daemon staging root.
pub const STAGING_ROOT: &str = "STOWAGE_STAGING_ROOT";
/// Per-owner quota in bytes.
pub const OWNER_QUOTA_BYTES: &str = "STOWAGE_OWNER_QUOTA_BYTES";
/// Default transfer rate in bytes per second.
pub const DEFAULT_RATE_BPS: &str = "STOWAGE_DEFAULT_RATE_BPS";
/// Poll interval in seconds.
pub const POLL_INTERVAL_SECS: &str = "STOWAGE_POLL_INTERVAL_SECS";
/// Daemon call timeout in seconds.
pub const DAEMON_TIMEOUT_SECS: &str = "STOWAGE_DAEMON_TIMEOUT_SECS";
/// Backoff cap in seconds.
pub const MAX_BACKOFF_SECS: &str = "STOWAGE_MAX_BACKOFF_SECS";
/// Completed-job retention in seconds.
pub const COMPLETED_RETENTION_SECS: &str = "STOWAGE_COMPLETED_RETENTION_SECS";
/// aria2 JSON-RPC endpoint.
pub const ARIA2_RPC_URL: &str = "STOWAGE_ARIA2_RPC_URL";
/// aria2 RPC secret.
pub const ARIA2_SECRET: &str = "STOWAGE_ARIA2_SECRET";
/// Log format label.
pub const LOG_FORMAT: &str = "STOWAGE_LOG_FORMAT";

impl TransferConfig {
    /// Read configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidField`] when a variable is set to an
    /// unusable value.
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable lookup.
    ///
    /// Unset and empty variables fall back to defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidField`] when a variable is set to an
    /// unusable value or the combination is inconsistent.
    pub fn from_lookup<F>(lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let endpoint = get(ARIA2_RPC_URL);
        let mut config = Self::with_endpoint(parse_rpc_url(
            ARIA2_RPC_URL,
            endpoint.as_deref().unwrap_or(defaults::ARIA2_RPC_URL),
        )?);

        config.database_url = get(DATABASE_URL);
        if let Some(raw) = get(STORE_ROOT) {
            config.store_root = parse_dir(STORE_ROOT, &raw)?;
        }
        if let Some(raw) = get(STAGING_ROOT) {
            config.staging_root = parse_dir(STAGING_ROOT, &raw)?;
        }
        if let Some(raw) = get(OWNER_QUOTA_BYTES) {
            config.owner_quota_bytes = Some(parse_positive_u64(OWNER_QUOTA_BYTES, &raw)?);
        }
        if let Some(raw) = get(DEFAULT_RATE_BPS) {
            config.default_rate_bps = parse_positive_u64(DEFAULT_RATE_BPS, &raw)?;
        }
        if let Some(raw) = get(POLL_INTERVAL_SECS) {
            config.poll_interval = parse_seconds(POLL_INTERVAL_SECS, &raw)?;
        }
        if let Some(raw) = get(DAEMON_TIMEOUT_SECS) {
            config.daemon_timeout = parse_seconds(DAEMON_TIMEOUT_SECS, &raw)?;
        }
        if let Some(raw) = get(MAX_BACKOFF_SECS) {
            config.max_backoff = parse_seconds(MAX_BACKOFF_SECS, &raw)?;
        }
        if let Some(raw) = get(COMPLETED_RETENTION_SECS) {
            config.completed_retention = parse_seconds(COMPLETED_RETENTION_SECS, &raw)?;
        }
        config.aria2_secret = get(ARIA2_SECRET);
        if let Some(raw) = get(LOG_FORMAT) {
            config.log_format = Some(parse_log_format(LOG_FORMAT, &raw)?);
        }

        config.check_consistency()?;
        debug!(
            store_root = %config.store_root.display(),
            staging_root = %config.staging_root.display(),
            persistent = config.database_url.is_some(),
            "transfer configuration loaded"
        );
        Ok(config)
    }

    fn check_consistency(&self) -> ConfigResult<()> {
        if self.store_root == self.staging_root
            || self.staging_root.starts_with(&self.store_root)
        {
            return Err(ConfigError::InvalidField {
                field: STAGING_ROOT,
                reason: "must_not_overlap_store_root",
                value: Some(self.staging_root.display().to_string()),
            });
        }
        if self.max_backoff < self.poll_interval {
            return Err(ConfigError::InvalidField {
                field: MAX_BACKOFF_SECS,
                reason: "must_not_be_below_poll_interval",
                value: Some(self.max_backoff.as_secs().to_string()),
            });
        }
        Ok(())
    }

    /// Connection string required by the persistent registry.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when `DATABASE_URL` is unset.
    pub fn require_database_url(&self) -> ConfigResult<&str> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::MissingField {
                field: DATABASE_URL,
            })
    }
}
