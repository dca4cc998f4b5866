//! Default values applied when a variable is absent.

/// Root directory of the local file store.
pub const STORE_ROOT: &str = "/var/lib/stowage/store";
/// Directory the daemon writes fetches into.
pub const STAGING_ROOT: &str = "/var/lib/stowage/staging";
/// Default per-transfer throughput cap (80 MB/s).
pub const DEFAULT_RATE_BPS: u64 = 80_000_000;
/// Seconds between poll passes.
pub const POLL_INTERVAL_SECS: u64 = 5;
/// Upper bound on a single daemon call.
pub const DAEMON_TIMEOUT_SECS: u64 = 10;
/// Cap on the per-job backoff after repeated unreachable errors.
pub const MAX_BACKOFF_SECS: u64 = 300;
/// How long completed jobs stay listed before the purge removes them.
pub const COMPLETED_RETENTION_SECS: u64 = 7 * 24 * 60 * 60;
/// aria2 JSON-RPC endpoint.
pub const ARIA2_RPC_URL: &str = "http://127.0.0.1:6800/jsonrpc";
