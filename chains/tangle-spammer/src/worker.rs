//! Per-node workers: one keeps the tips channel full, the other finalizes
//! and broadcasts work items.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{run_timestamp, ReferenceStore};
use crate::client::LedgerClient;
use crate::error::SpamError;
use crate::metrics::{MetricKind, MetricsHandle};
use crate::pow::{finalize_local, finalize_remote, ProofOfWork};
use crate::strategy::TipStrategy;
use crate::types::{Node, Tips, Transaction};

pub struct TipWorker {
    pub node: Node,
    pub strategy: Box<dyn TipStrategy>,
    pub tips_tx: mpsc::Sender<Tips>,
    pub verbose: bool,
}

impl TipWorker {
    pub async fn run(self, cancel: CancellationToken) {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = self.strategy.next_tips() => next,
            };

            match next {
                Ok(tips) => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        sent = self.tips_tx.send(tips) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    if self.verbose {
                        info!("[{}] tip selection failed: {}", self.node.url, e);
                    } else {
                        debug!("[{}] tip selection failed: {}", self.node.url, e);
                    }
                    tokio::task::yield_now().await;
                }
            }
        }
        debug!("[{}] tip worker stopped", self.node.url);
    }
}

/// Run-wide settings the spam workers share.
#[derive(Debug, Clone)]
pub struct SpamSettings {
    pub local_pow: bool,
    pub mwm: u32,
    pub cooldown: Option<Duration>,
    pub run_id: String,
    pub verbose: bool,
}

enum Outcome {
    Sent,
    Failed(SpamError),
    Cancelled,
}

pub struct SpamWorker {
    pub node: Node,
    pub client: Arc<dyn LedgerClient>,
    pub pow: Arc<dyn ProofOfWork>,
    pub pow_lock: Arc<Mutex<()>>,
    pub store: Arc<dyn ReferenceStore>,
    pub metrics: MetricsHandle,
    pub work_rx: Arc<Mutex<mpsc::Receiver<Transaction>>>,
    pub settings: Arc<SpamSettings>,
}

impl SpamWorker {
    pub async fn run(self, cancel: CancellationToken) {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = async { self.work_rx.lock().await.recv().await } => next,
            };
            let Some(mut tx) = next else {
                break;
            };

            match self.process(&mut tx, &cancel).await {
                Outcome::Sent => {
                    self.metrics.sent(tx, self.node.clone()).await;
                    if let Some(cooldown) = self.settings.cooldown {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(cooldown) => {}
                        }
                    }
                }
                Outcome::Failed(e) => {
                    self.metrics.record(MetricKind::FailedTx).await;
                    warn!("[{}] FAILED {}", self.node.url, e);
                }
                Outcome::Cancelled => break,
            }
        }
        debug!("[{}] spam worker stopped", self.node.url);
    }

    async fn process(&self, tx: &mut Transaction, cancel: &CancellationToken) -> Outcome {
        let finalized = if !self.settings.local_pow && self.node.supports_remote_attach {
            if self.settings.verbose {
                info!("[{}] attaching to tangle", self.node.url);
            }
            finalize_remote(tx, self.settings.mwm, self.client.as_ref(), self.pow.as_ref()).await
        } else {
            let _guard = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Outcome::Cancelled,
                guard = self.pow_lock.lock() => guard,
            };
            if self.settings.verbose {
                info!("[{}] doing PoW", self.node.url);
            }
            finalize_local(tx, self.settings.mwm, self.pow.as_ref()).await
        };
        if let Err(e) = finalized {
            return Outcome::Failed(e);
        }

        if let Err(e) = self.client.broadcast(&tx.bundle).await {
            return Outcome::Failed(SpamError::Broadcast {
                endpoint: self.node.url.clone(),
                reason: format!("{:#}", e),
            });
        }

        self.record_sent(tx).await;
        Outcome::Sent
    }

    async fn record_sent(&self, tx: &Transaction) {
        if let Err(e) = self.store.put(&tx.bundle).await {
            warn!("Failed to store sent bundle: {:#}", e);
        }
        for body in &tx.bundle {
            if let Err(e) = self
                .store
                .append_sent(&self.settings.run_id, &run_timestamp(), &body.hash)
                .await
            {
                warn!("Failed to log sent transaction {}: {:#}", body.hash, e);
            }
        }
    }
}
