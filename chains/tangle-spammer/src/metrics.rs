//! Metrics router
//!
//! One task owns the run's [`RunMetrics`]. Everything else holds a cheap
//! [`MetricsHandle`] and sends it events; nothing reads the counters
//! directly until [`MetricsRouter::stop`] hands back the final totals.

use core_logic::{RunMetrics, RESULT_TARGET};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::types::{Hash, Node, Transaction};

const EVENT_BUFFER: usize = 1024;
const EXPLORER_URL: &str = "https://thetangle.org";

/// Event kinds. Serialized as their numeric code for relay consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum MetricKind {
    MilestoneBranch = 0,
    MilestoneTrunk = 1,
    BadTrunk = 2,
    BadBranch = 3,
    BadTrunkAndBranch = 4,
    FailedTx = 5,
    SuccessfulTx = 6,
    Summary = 7,
    CacheHit = 8,
    CacheMiss = 9,
}

impl From<MetricKind> for u8 {
    fn from(kind: MetricKind) -> Self {
        kind as u8
    }
}

impl TryFrom<u8> for MetricKind {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            0 => MetricKind::MilestoneBranch,
            1 => MetricKind::MilestoneTrunk,
            2 => MetricKind::BadTrunk,
            3 => MetricKind::BadBranch,
            4 => MetricKind::BadTrunkAndBranch,
            5 => MetricKind::FailedTx,
            6 => MetricKind::SuccessfulTx,
            7 => MetricKind::Summary,
            8 => MetricKind::CacheHit,
            9 => MetricKind::CacheMiss,
            other => return Err(format!("unknown metric kind {}", other)),
        })
    }
}

/// Point-in-time counters sent to relay consumers after every success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub txs_succeeded: u64,
    pub txs_failed: u64,
    pub bad_branch: u64,
    pub bad_trunk: u64,
    pub bad_trunk_and_branch: u64,
    pub milestone_trunk: u64,
    pub milestone_branch: u64,
    pub tps: f64,
    pub error_rate: f64,
}

impl Summary {
    fn from_metrics(metrics: &RunMetrics) -> Self {
        Self {
            txs_succeeded: metrics.succeeded,
            txs_failed: metrics.failed,
            bad_branch: metrics.bad_branch,
            bad_trunk: metrics.bad_trunk,
            bad_trunk_and_branch: metrics.bad_trunk_and_branch,
            milestone_trunk: metrics.milestone_trunk,
            milestone_branch: metrics.milestone_branch,
            tps: metrics.tps(),
            error_rate: metrics.error_rate(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxData {
    pub hash: Hash,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricData {
    Summary(Summary),
    Tx(TxData),
}

/// What relay consumers receive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub kind: MetricKind,
    pub data: Option<MetricData>,
}

impl Metric {
    pub fn bare(kind: MetricKind) -> Self {
        Self { kind, data: None }
    }
}

#[derive(Debug)]
pub enum MetricEvent {
    Count(MetricKind),
    Sent { transaction: Transaction, node: Node },
}

#[derive(Debug, Clone)]
pub struct MetricsHandle {
    tx: mpsc::Sender<MetricEvent>,
}

impl MetricsHandle {
    pub async fn record(&self, kind: MetricKind) {
        // The router only goes away at shutdown; late events are dropped
        let _ = self.tx.send(MetricEvent::Count(kind)).await;
    }

    pub async fn sent(&self, transaction: Transaction, node: Node) {
        let _ = self
            .tx
            .send(MetricEvent::Sent { transaction, node })
            .await;
    }
}

pub struct MetricsRouter {
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<RunMetrics>,
}

impl MetricsRouter {
    /// Spawn the router task. Events are forwarded to `relay` when given.
    pub fn start(relay: Option<mpsc::Sender<Metric>>) -> (Self, MetricsHandle) {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let (stop_tx, stop_rx) = oneshot::channel();

        let collector = Collector {
            metrics: RunMetrics::default(),
            relay,
        };
        let task = tokio::spawn(collector.run(rx, stop_rx));

        (Self { stop_tx, task }, MetricsHandle { tx })
    }

    /// Stop the router and return the final counters.
    ///
    /// Events already queued are still counted.
    pub async fn stop(self) -> RunMetrics {
        let _ = self.stop_tx.send(());
        match self.task.await {
            Ok(metrics) => metrics,
            Err(e) => {
                warn!("Metrics router task failed: {}", e);
                let mut metrics = RunMetrics::default();
                metrics.finish();
                metrics
            }
        }
    }
}

struct Collector {
    metrics: RunMetrics,
    relay: Option<mpsc::Sender<Metric>>,
}

impl Collector {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<MetricEvent>,
        mut stop_rx: oneshot::Receiver<()>,
    ) -> RunMetrics {
        loop {
            tokio::select! {
                biased;
                _ = &mut stop_rx => break,
                event = rx.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
            }
        }

        rx.close();
        while let Ok(event) = rx.try_recv() {
            self.handle(event);
        }
        self.metrics.finish();
        self.metrics
    }

    fn handle(&mut self, event: MetricEvent) {
        let kind = match event {
            MetricEvent::Sent { transaction, node } => {
                self.metrics.succeeded += 1;
                self.on_success(&transaction, &node);
                return;
            }
            MetricEvent::Count(kind) => kind,
        };

        let m = &mut self.metrics;
        match kind {
            MetricKind::MilestoneBranch => m.milestone_branch += 1,
            MetricKind::MilestoneTrunk => m.milestone_trunk += 1,
            MetricKind::BadTrunk => m.bad_trunk += 1,
            MetricKind::BadBranch => m.bad_branch += 1,
            MetricKind::BadTrunkAndBranch => m.bad_trunk_and_branch += 1,
            MetricKind::FailedTx => m.failed += 1,
            MetricKind::SuccessfulTx => m.succeeded += 1,
            MetricKind::CacheHit => m.cache_hits += 1,
            MetricKind::CacheMiss => m.cache_misses += 1,
            MetricKind::Summary => {}
        }
        self.relay(Metric::bare(kind));
    }

    fn on_success(&mut self, transaction: &Transaction, node: &Node) {
        let count = transaction.bundle.len();
        let hash = transaction.display_hash().unwrap_or_default().to_string();
        let link = if count > 1 {
            format!("{}/bundle/{}", EXPLORER_URL, hash)
        } else {
            format!("{}/transaction/{}", EXPLORER_URL, hash)
        };

        let m = &self.metrics;
        let uptime = m.uptime();
        let tps = m.tps_over(uptime);
        info!(
            target: RESULT_TARGET,
            "SUCCESS {} sent to {} | {}",
            if count > 1 { "Bundle" } else { "Txn" },
            node,
            link
        );
        info!(
            target: RESULT_TARGET,
            "{:.2} TPS -- success rate {:.0}% | {:.1}s Count: {} Milestone Trunk: {} Milestone Branch: {} Bad Trunk: {} Bad Branch: {} Both: {}",
            tps,
            m.success_rate(),
            uptime.as_secs_f64(),
            m.succeeded,
            m.milestone_trunk,
            m.milestone_branch,
            m.bad_trunk,
            m.bad_branch,
            m.bad_trunk_and_branch
        );

        if self.relay.is_some() {
            let summary = Summary::from_metrics(&self.metrics);
            self.relay(Metric {
                kind: MetricKind::Summary,
                data: Some(MetricData::Summary(summary)),
            });
            self.relay(Metric {
                kind: MetricKind::SuccessfulTx,
                data: Some(MetricData::Tx(TxData { hash, count })),
            });
        }
    }

    fn relay(&mut self, metric: Metric) {
        let Some(relay) = &self.relay else {
            return;
        };
        match relay.try_send(metric) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(metric)) => {
                self.metrics.relay_dropped += 1;
                warn!("Metrics relay is full, dropping {:?} event", metric.kind);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Metrics relay closed, no longer relaying");
                self.relay = None;
            }
        }
    }
}
