//! JSON-RPC envelopes and aria2 reply shapes.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use stowage_transfer_core::{DaemonJobId, DaemonProgress, DaemonState, DaemonStatus};

/// Keys requested from `aria2.tellStatus`.
pub(crate) const STATUS_KEYS: [&str; 8] = [
    "gid",
    "status",
    "totalLength",
    "completedLength",
    "downloadSpeed",
    "errorMessage",
    "files",
    "followedBy",
];

#[derive(Debug, Serialize)]
pub(crate) struct RpcRequest<'a> {
    pub(crate) jsonrpc: &'static str,
    pub(crate) id: String,
    pub(crate) method: &'a str,
    pub(crate) params: Vec<Value>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RpcResponse<T> {
    pub(crate) result: Option<T>,
    pub(crate) error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RpcError {
    #[serde(default)]
    pub(crate) code: i64,
    #[serde(default)]
    pub(crate) message: String,
}

impl RpcError {
    /// aria2 reports unknown GIDs as "GID ... is not found" or "... not found for GID ...".
    pub(crate) fn is_unknown_gid(&self) -> bool {
        self.message.contains("not found")
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct GidEntry {
    pub(crate) gid: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StatusReply {
    pub(crate) status: String,
    #[serde(default)]
    pub(crate) total_length: String,
    #[serde(default)]
    pub(crate) completed_length: String,
    #[serde(default)]
    pub(crate) download_speed: String,
    #[serde(default)]
    pub(crate) error_message: Option<String>,
    #[serde(default)]
    pub(crate) files: Vec<FileEntry>,
    #[serde(default)]
    pub(crate) followed_by: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FileEntry {
    #[serde(default)]
    pub(crate) path: String,
}

const METADATA_PREFIX: &str = "[METADATA]";

fn counter(raw: &str) -> u64 {
    raw.parse().unwrap_or_default()
}

impl StatusReply {
    /// Translate into the daemon-neutral status, or `None` for unknown states.
    ///
    /// A completed entry with follow-ups (torrent metadata, `.torrent` files)
    /// only finished the hand-off, so it reports as active.
    pub(crate) fn into_status(self) -> Option<DaemonStatus> {
        let handed_off = !self.followed_by.is_empty();
        let state = match self.status.as_str() {
            "active" => DaemonState::Active,
            "waiting" => DaemonState::Waiting,
            "paused" => DaemonState::Paused,
            "complete" if handed_off => DaemonState::Active,
            "complete" => DaemonState::Complete,
            "error" => DaemonState::Error,
            "removed" => DaemonState::Removed,
            _ => return None,
        };
        Some(DaemonStatus {
            state,
            progress: DaemonProgress {
                completed_bytes: counter(&self.completed_length),
                total_bytes: counter(&self.total_length),
                download_bps: counter(&self.download_speed),
            },
            error_detail: self.error_message.filter(|message| !message.is_empty()),
            // Metadata-only entries have no path or a `[METADATA]` placeholder.
            files: self
                .files
                .into_iter()
                .filter(|file| !file.path.is_empty() && !file.path.starts_with(METADATA_PREFIX))
                .map(|file| PathBuf::from(file.path))
                .collect(),
            followed_by: self.followed_by.into_iter().map(DaemonJobId::new).collect(),
        })
    }
}
