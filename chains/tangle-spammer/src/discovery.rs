//! Node discovery
//!
//! Builds the node set a run spams through:
//!
//! 1. Optionally download a public node list (`[{"hostname": .., "port": ..}]`)
//!    and turn each entry into `http://host:port`.
//! 2. Merge in the explicitly configured node URLs, dropping duplicates.
//! 3. Probe every node concurrently with a deliberately malformed
//!    `attachToTangle` call. The node's error text tells us whether it runs
//!    remote proof-of-work:
//!    - `Invalid trytes input` means the command exists and parsed our request.
//!    - `COMMAND attachToTangle is not available on this node` means it is
//!      disabled.
//!
//!    Nodes that do not answer at all are dropped.

use anyhow::{Context, Result};
use core_logic::{is_transient_error, with_retry_if, NetworkError, RetryConfig};
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::client::HttpLedgerClient;
use crate::types::Node;

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

const ATTACH_SUPPORTED: &str = "Invalid trytes input";
const ATTACH_DISABLED: &str = "COMMAND attachToTangle is not available on this node";

const PROBE_TRUNK: &str =
    "JVMTDGDPDFYHMZPMWEKKANBQSLSDTIIHAYQUMZOKHXXXGJHJDQPOMDOMNRDKYCZRUFZROZDADTHZC9999";
const PROBE_BRANCH: &str =
    "P9KFSJVGSPLXAEBJSHWFZLGP9GGJTIO9YITDEHATDTGAFLPLBZ9FOFWWTKMAZXZHFGQHUOXLXUALY9999";

/// One row of a public node list. Extra columns (load, ping, ...) are ignored.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct NodeListEntry {
    #[serde(alias = "Hostname")]
    pub hostname: String,
    #[serde(alias = "Port")]
    pub port: u16,
}

impl NodeListEntry {
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.hostname, self.port)
    }
}

/// Download and parse a node list.
pub async fn fetch_node_list(list_url: &str) -> Result<Vec<String>> {
    let http = reqwest::Client::builder()
        .timeout(PROBE_TIMEOUT)
        .build()
        .context("Failed to build HTTP client")?;

    let entries: Vec<NodeListEntry> = with_retry_if(
        RetryConfig::new(2, 500),
        "fetch node list",
        || {
            let http = http.clone();
            async move {
                let entries = http
                    .get(list_url)
                    .send()
                    .await?
                    .error_for_status()?
                    .json::<Vec<NodeListEntry>>()
                    .await?;
                Ok(entries)
            }
        },
        is_transient_error,
    )
    .await
    .with_context(|| format!("Unable to fetch node list from {}", list_url))?;

    info!("{} hosts loaded from {}", entries.len(), list_url);
    Ok(entries.iter().map(NodeListEntry::url).collect())
}

/// Outcome of a probe reply: `Some(supported)` or `None` when the node is
/// unusable.
pub fn classify_probe_reply(url: &str, reply: Result<Value, NetworkError>) -> Option<bool> {
    match reply {
        Err(NetworkError::CommandRejected { reason, .. }) => {
            if reason == ATTACH_SUPPORTED {
                Some(true)
            } else {
                if reason != ATTACH_DISABLED {
                    warn!("{}: {}", url, reason);
                }
                Some(false)
            }
        }
        // A node that accepted garbage still answered
        Ok(_) => Some(false),
        Err(NetworkError::HttpError { .. }) => Some(false),
        Err(e) => {
            debug!("Dropping node {}: {}", url, e);
            None
        }
    }
}

/// Probe a single node. `None` when it cannot be reached.
pub async fn probe_remote_attach(url: &str) -> Option<Node> {
    let client = match HttpLedgerClient::with_timeout(url, PROBE_TIMEOUT) {
        Ok(c) => c,
        Err(e) => {
            warn!("Skipping node {}: {:#}", url, e);
            return None;
        }
    };

    let reply = client
        .command(json!({
            "command": "attachToTangle",
            "trunkTransaction": PROBE_TRUNK,
            "branchTransaction": PROBE_BRANCH,
            "minWeightMagnitude": 18,
            "trytes": ["TRYTVALUEHERE"],
        }))
        .await;

    classify_probe_reply(url, reply).map(|supported| Node::new(url, supported))
}

/// Normalize and deduplicate `urls`, keeping first-seen order.
pub fn dedupe_urls<I>(urls: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut seen = HashSet::new();
    urls.into_iter()
        .map(|u| u.trim().trim_end_matches('/').to_string())
        .filter(|u| !u.is_empty() && seen.insert(u.clone()))
        .collect()
}

/// Probe `urls` with at most `concurrency` requests in flight.
pub async fn check_nodes(urls: Vec<String>, concurrency: usize, only_with_pow: bool) -> Vec<Node> {
    let urls = dedupe_urls(urls);
    info!(
        "Checking {} nodes for attachToTangle support ({} concurrent)",
        urls.len(),
        concurrency.max(1)
    );

    let mut responded: Vec<Node> = stream::iter(urls)
        .map(|url| async move { probe_remote_attach(&url).await })
        .buffer_unordered(concurrency.max(1))
        .filter_map(|node| async move { node })
        .collect()
        .await;
    responded.sort_by(|a, b| a.url.cmp(&b.url));

    let attach_count = responded.iter().filter(|n| n.supports_remote_attach).count();
    info!("{} nodes responded", responded.len());
    info!("{} nodes support attachToTangle", attach_count);

    if only_with_pow {
        info!("will only use nodes which support remote PoW");
        responded.retain(|n| n.supports_remote_attach);
    }
    responded
}
