//! Node API client
//!
//! [`LedgerClient`] is the per-node capability the workers use. The
//! production implementation, [`HttpLedgerClient`], speaks the node's JSON
//! command API: every call is a `POST` of `{"command": ..., ...}` with the
//! `X-IOTA-API-Version` header. Failed commands come back as
//! `{"error": "..."}` and surface as [`NetworkError::CommandRejected`].

use anyhow::Result;
use async_trait::async_trait;
use core_logic::NetworkError;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::types::{Bundle, Hash, Node, TipHashes, TransactionBody};

pub const API_VERSION_HEADER: &str = "X-IOTA-API-Version";
pub const API_VERSION: &str = "1";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Calls the engine makes against a single node.
///
/// Errors are `anyhow` errors wrapping [`NetworkError`] when they come from
/// the wire, so callers can `downcast_ref` to inspect node replies.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    fn endpoint(&self) -> &str;

    async fn get_transactions_to_approve(&self, depth: u32) -> Result<TipHashes>;

    async fn get_tips(&self) -> Result<Vec<Hash>>;

    /// Hash of the most recent milestone the node knows about.
    async fn get_latest_milestone(&self) -> Result<Hash>;

    /// Bodies for `hashes`, in the same order.
    async fn fetch_bodies(&self, hashes: &[Hash]) -> Result<Vec<TransactionBody>>;

    /// Remote proof-of-work. The returned bodies carry no hash.
    async fn attach_to_tangle(
        &self,
        trunk: &str,
        branch: &str,
        mwm: u32,
        bundle: &Bundle,
    ) -> Result<Bundle>;

    async fn broadcast(&self, bundle: &Bundle) -> Result<()>;
}

/// Builds the client a node's workers share.
pub trait LedgerConnector: Send + Sync {
    fn connect(&self, node: &Node) -> Result<Arc<dyn LedgerClient>>;
}

/// Connects to nodes over HTTP.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    timeout: Duration,
}

impl HttpConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for HttpConnector {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl LedgerConnector for HttpConnector {
    fn connect(&self, node: &Node) -> Result<Arc<dyn LedgerClient>> {
        Ok(Arc::new(HttpLedgerClient::with_timeout(&node.url, self.timeout)?))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TipsResponse {
    hashes: Vec<Hash>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeInfoResponse {
    latest_milestone: Hash,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrytesResponse {
    trytes: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

/// JSON-over-HTTP client for one node.
#[derive(Clone, Debug)]
pub struct HttpLedgerClient {
    endpoint: String,
    timeout: Duration,
    http: Client,
}

impl HttpLedgerClient {
    pub fn new(endpoint: &str) -> Result<Self> {
        Self::with_timeout(endpoint, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(endpoint: &str, timeout: Duration) -> Result<Self> {
        Url::parse(endpoint).map_err(|_| core_logic::ConfigError::InvalidNodeUrl {
            url: endpoint.to_string(),
        })?;

        let http = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(4)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;

        Ok(Self {
            endpoint: endpoint.to_string(),
            timeout,
            http,
        })
    }

    /// Send one API command and return the raw JSON reply.
    pub async fn command(&self, request: Value) -> Result<Value, NetworkError> {
        let command = request
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();

        let response = self
            .http
            .post(&self.endpoint)
            .header(API_VERSION_HEADER, API_VERSION)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| NetworkError::InvalidResponse {
                endpoint: self.endpoint.clone(),
                reason: e.to_string(),
            })?;

        if let Ok(ErrorResponse { error }) = serde_json::from_value::<ErrorResponse>(body.clone())
        {
            return Err(NetworkError::CommandRejected {
                endpoint: self.endpoint.clone(),
                command,
                reason: error,
            });
        }

        if status.as_u16() == 429 {
            return Err(NetworkError::RateLimited {
                endpoint: self.endpoint.clone(),
                retry_after: 1,
            });
        }
        if !status.is_success() {
            return Err(NetworkError::HttpError {
                status_code: status.as_u16(),
                endpoint: self.endpoint.clone(),
            });
        }

        Ok(body)
    }

    async fn call<T: DeserializeOwned>(&self, request: Value) -> Result<T, NetworkError> {
        let body = self.command(request).await?;
        serde_json::from_value(body).map_err(|e| NetworkError::InvalidResponse {
            endpoint: self.endpoint.clone(),
            reason: e.to_string(),
        })
    }

    fn transport_error(&self, e: reqwest::Error) -> NetworkError {
        if e.is_timeout() {
            NetworkError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
                endpoint: self.endpoint.clone(),
            }
        } else {
            NetworkError::ConnectionRefused {
                endpoint: self.endpoint.clone(),
                reason: e.to_string(),
            }
        }
    }

    fn invalid(&self, reason: impl Into<String>) -> NetworkError {
        NetworkError::InvalidResponse {
            endpoint: self.endpoint.clone(),
            reason: reason.into(),
        }
    }

    fn encode_bundle(&self, bundle: &Bundle) -> Result<Vec<String>, NetworkError> {
        bundle
            .iter()
            .map(|body| body.to_trytes().map_err(|e| self.invalid(e.to_string())))
            .collect()
    }
}

#[async_trait]
impl LedgerClient for HttpLedgerClient {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn get_transactions_to_approve(&self, depth: u32) -> Result<TipHashes> {
        let tips = self
            .call(json!({ "command": "getTransactionsToApprove", "depth": depth }))
            .await?;
        Ok(tips)
    }

    async fn get_tips(&self) -> Result<Vec<Hash>> {
        let tips: TipsResponse = self.call(json!({ "command": "getTips" })).await?;
        Ok(tips.hashes)
    }

    async fn get_latest_milestone(&self) -> Result<Hash> {
        let info: NodeInfoResponse = self.call(json!({ "command": "getNodeInfo" })).await?;
        Ok(info.latest_milestone)
    }

    async fn fetch_bodies(&self, hashes: &[Hash]) -> Result<Vec<TransactionBody>> {
        if hashes.is_empty() {
            return Ok(Vec::new());
        }
        let reply: TrytesResponse = self
            .call(json!({ "command": "getTrytes", "hashes": hashes }))
            .await?;

        if reply.trytes.len() != hashes.len() {
            return Err(self
                .invalid(format!(
                    "asked for {} transactions, got {}",
                    hashes.len(),
                    reply.trytes.len()
                ))
                .into());
        }

        let bodies = hashes
            .iter()
            .zip(reply.trytes.iter())
            .map(|(hash, trytes)| {
                TransactionBody::from_trytes(hash.clone(), trytes)
                    .map_err(|e| self.invalid(format!("{}: {}", hash, e)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(bodies)
    }

    async fn attach_to_tangle(
        &self,
        trunk: &str,
        branch: &str,
        mwm: u32,
        bundle: &Bundle,
    ) -> Result<Bundle> {
        let trytes = self.encode_bundle(bundle)?;
        let reply: TrytesResponse = self
            .call(json!({
                "command": "attachToTangle",
                "trunkTransaction": trunk,
                "branchTransaction": branch,
                "minWeightMagnitude": mwm,
                "trytes": trytes,
            }))
            .await?;

        let attached = reply
            .trytes
            .iter()
            .map(|t| TransactionBody::from_trytes(String::new(), t))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| self.invalid(e.to_string()))?;
        Ok(attached)
    }

    async fn broadcast(&self, bundle: &Bundle) -> Result<()> {
        let trytes = self.encode_bundle(bundle)?;
        self.command(json!({ "command": "broadcastTransactions", "trytes": trytes }))
            .await?;
        Ok(())
    }
}
