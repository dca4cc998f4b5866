//! JSON-RPC client implementing [`DaemonControl`] against aria2.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use stowage_transfer_core::{DaemonControl, DaemonError, DaemonJobId, DaemonResult, DaemonStatus};
use tracing::{debug, warn};
use url::Url;

use crate::wire::{GidEntry, RpcRequest, RpcResponse, STATUS_KEYS, StatusReply};

/// Upper bound on entries fetched from the waiting and stopped queues.
const LIST_PAGE: u64 = 1_000;

/// Connection settings for an aria2 RPC endpoint.
#[derive(Debug, Clone)]
pub struct Aria2Config {
    /// `http(s)://host:port/jsonrpc` endpoint.
    pub endpoint: Url,
    /// Value of aria2's `--rpc-secret`, if set.
    pub secret: Option<String>,
    /// Per-request timeout.
    pub timeout: Duration,
}

/// aria2 JSON-RPC client.
pub struct Aria2Client {
    http: reqwest::Client,
    config: Aria2Config,
    next_id: AtomicU64,
}

impl Aria2Client {
    /// Build a client for the configured endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::Protocol`] when the HTTP client cannot be built.
    pub fn new(config: Aria2Config) -> DaemonResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| DaemonError::Protocol {
                operation: "build_client",
                detail: err.to_string(),
            })?;
        Ok(Self {
            http,
            config,
            next_id: AtomicU64::new(1),
        })
    }

    fn params(&self, rest: impl IntoIterator<Item = Value>) -> Vec<Value> {
        let mut params = Vec::new();
        if let Some(secret) = &self.config.secret {
            params.push(Value::String(format!("token:{secret}")));
        }
        params.extend(rest);
        params
    }

    async fn call<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        method: &str,
        params: Vec<Value>,
        gid: Option<&DaemonJobId>,
    ) -> DaemonResult<T> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: format!("stowage-{}", self.next_id.fetch_add(1, Ordering::Relaxed)),
            method,
            params,
        };
        debug!(method, id = %request.id, "aria2 rpc call");

        let response = self
            .http
            .post(self.config.endpoint.clone())
            .json(&request)
            .send()
            .await
            .map_err(|err| DaemonError::Unreachable {
                operation,
                detail: err.to_string(),
            })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(DaemonError::Unreachable {
                operation,
                detail: format!("http status {status}"),
            });
        }
        let body = response
            .bytes()
            .await
            .map_err(|err| DaemonError::Unreachable {
                operation,
                detail: err.to_string(),
            })?;
        let reply: RpcResponse<T> =
            serde_json::from_slice(&body).map_err(|err| DaemonError::Protocol {
                operation,
                detail: format!("http status {status}: {err}"),
            })?;

        if let Some(error) = reply.error {
            if let Some(id) = gid.filter(|_| error.is_unknown_gid()) {
                return Err(DaemonError::UnknownJob { id: id.clone() });
            }
            warn!(method, code = error.code, message = %error.message, "aria2 rejected call");
            return Err(DaemonError::Rejected {
                operation,
                message: format!("aria2 error {}: {}", error.code, error.message),
            });
        }
        reply.result.ok_or(DaemonError::Protocol {
            operation,
            detail: "response carried neither result nor error".into(),
        })
    }

    async fn gids(&self, method: &str, paged: bool) -> DaemonResult<Vec<DaemonJobId>> {
        let mut rest = Vec::new();
        if paged {
            rest.push(json!(0));
            rest.push(json!(LIST_PAGE));
        }
        rest.push(json!(["gid"]));
        let entries: Vec<GidEntry> = self
            .call("list_jobs", method, self.params(rest), None)
            .await?;
        Ok(entries
            .into_iter()
            .map(|entry| DaemonJobId::new(entry.gid))
            .collect())
    }
}

#[async_trait]
impl DaemonControl for Aria2Client {
    async fn add_fetch(
        &self,
        source_uri: &str,
        staging_hint: &Path,
    ) -> DaemonResult<DaemonJobId> {
        let dir = staging_hint.to_str().ok_or_else(|| DaemonError::Rejected {
            operation: "add_fetch",
            message: "staging directory is not valid UTF-8".into(),
        })?;
        let params = self.params([json!([source_uri]), json!({ "dir": dir })]);
        let gid: String = self.call("add_fetch", "aria2.addUri", params, None).await?;
        Ok(DaemonJobId::new(gid))
    }

    async fn status(&self, id: &DaemonJobId) -> DaemonResult<DaemonStatus> {
        let params = self.params([json!(id.as_str()), json!(STATUS_KEYS)]);
        let reply: StatusReply = self
            .call("status", "aria2.tellStatus", params, Some(id))
            .await?;
        let label = reply.status.clone();
        reply.into_status().ok_or(DaemonError::Protocol {
            operation: "status",
            detail: format!("unknown aria2 status {label}"),
        })
    }

    async fn abort(&self, id: &DaemonJobId) -> DaemonResult<()> {
        let params = self.params([json!(id.as_str())]);
        let _: String = self
            .call("abort", "aria2.forceRemove", params, Some(id))
            .await?;
        Ok(())
    }

    async fn list_jobs(&self) -> DaemonResult<Vec<DaemonJobId>> {
        let mut ids = self.gids("aria2.tellActive", false).await?;
        ids.extend(self.gids("aria2.tellWaiting", true).await?);
        ids.extend(self.gids("aria2.tellStopped", true).await?);
        Ok(ids)
    }
}
