//! The spam engine: wires workers, assembler and metrics router together
//! and owns the run lifecycle.

use async_trait::async_trait;
use core_logic::{RunMetrics, SpammerStats, SpammerTrait, RESULT_TARGET};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::assembler::Assembler;
use crate::cache::{run_timestamp, MemoryStore, ReferenceStore};
use crate::client::{LedgerClient, LedgerConnector};
use crate::config::EngineConfig;
use crate::error::SpamError;
use crate::metrics::{Metric, MetricKind, MetricsHandle, MetricsRouter};
use crate::pow::{BundlePreparer, ProofOfWork};
use crate::types::{Node, Seed, Tips, Transaction, Transfer};
use crate::worker::{SpamSettings, SpamWorker, TipWorker};

pub const TIPS_BUFFER: usize = 50;
pub const WORK_BUFFER: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Created,
    Running,
    Stopping,
    Stopped,
}

pub struct Engine {
    config: Arc<EngineConfig>,
    connector: Arc<dyn LedgerConnector>,
    preparer: Arc<dyn BundlePreparer>,
    pow: Arc<dyn ProofOfWork>,
    store: Arc<dyn ReferenceStore>,
    relay: Option<mpsc::Sender<Metric>>,
    state: watch::Sender<EngineState>,
    shutdown: CancellationToken,
    last_metrics: Mutex<Option<RunMetrics>>,
}

impl Engine {
    /// Runs keep only an in-memory reference store unless
    /// [`with_store`](Self::with_store) supplies one.
    pub fn new(
        config: EngineConfig,
        connector: Arc<dyn LedgerConnector>,
        preparer: Arc<dyn BundlePreparer>,
        pow: Arc<dyn ProofOfWork>,
    ) -> Self {
        let (state, _) = watch::channel(EngineState::Created);
        Self {
            config: Arc::new(config),
            connector,
            preparer,
            pow,
            store: Arc::new(MemoryStore::new()),
            relay: None,
            state,
            shutdown: CancellationToken::new(),
            last_metrics: Mutex::new(None),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ReferenceStore>) -> Self {
        self.store = store;
        self
    }

    /// Forward metric events to `relay`. Events are dropped when it is full.
    pub fn with_relay(mut self, relay: mpsc::Sender<Metric>) -> Self {
        self.relay = Some(relay);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    /// Counters of the finished run, if there was one.
    pub async fn final_metrics(&self) -> Option<RunMetrics> {
        self.last_metrics.lock().await.clone()
    }

    /// Run until [`stop`](Self::stop) is called or the configured timeout
    /// expires.
    pub async fn start(&self) -> Result<SpammerStats, SpamError> {
        self.start_with(CancellationToken::new()).await
    }

    /// Like [`start`](Self::start), also stopping when `external` fires.
    pub async fn start_with(&self, external: CancellationToken) -> Result<SpammerStats, SpamError> {
        let started = self.state.send_if_modified(|state| {
            if *state == EngineState::Created {
                *state = EngineState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(SpamError::AlreadyStarted);
        }

        let result = self.run(external).await;
        self.state.send_replace(EngineState::Stopped);
        result
    }

    /// Signal every task to stop and wait until the run has wound down.
    ///
    /// Before `start` this retires the engine without running it.
    pub async fn stop(&self) {
        let retired = self.state.send_if_modified(|state| {
            if *state == EngineState::Created {
                *state = EngineState::Stopped;
                true
            } else {
                false
            }
        });
        if retired {
            return;
        }

        self.shutdown.cancel();
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|s| *s == EngineState::Stopped).await;
    }

    async fn run(&self, external: CancellationToken) -> Result<SpammerStats, SpamError> {
        let config = self.config.clone();
        config.validate()?;

        let clients = config
            .nodes
            .iter()
            .map(|node| Ok((node.clone(), self.connector.connect(node)?)))
            .collect::<anyhow::Result<Vec<(Node, Arc<dyn LedgerClient>)>>>()
            .map_err(|e| SpamError::invalid("nodes", format!("{:#}", e)))?;

        let cancel = self.shutdown.child_token();
        forward_cancellation(external, cancel.clone());
        if let Some(timeout) = config.timeout {
            spawn_timeout(timeout, cancel.clone());
        }

        let run_id = run_timestamp();
        if let Err(e) = self.store.new_run(&run_id, &run_id).await {
            warn!("Failed to register run {}: {:#}", run_id, e);
        }
        self.log_run(&run_id, "spammer started").await;

        info!(
            target: RESULT_TARGET,
            "Spamalot starting | run {} | strategy '{}' | nodes: {}",
            run_id,
            config.strategy,
            config
                .nodes
                .iter()
                .map(|n| n.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );

        let (router, metrics) = MetricsRouter::start(self.relay.clone());
        let (tips_tx, mut tips_rx) = mpsc::channel::<Tips>(TIPS_BUFFER);
        let (work_tx, work_rx) = mpsc::channel::<Transaction>(WORK_BUFFER);
        let work_rx = Arc::new(Mutex::new(work_rx));
        let pow_lock = Arc::new(Mutex::new(()));
        let settings = Arc::new(SpamSettings {
            local_pow: config.local_pow,
            mwm: config.mwm,
            cooldown: config.cooldown,
            run_id: run_id.clone(),
            verbose: config.verbose,
        });

        let mut workers = JoinSet::new();
        for (node, client) in clients {
            let tip_worker = TipWorker {
                node: node.clone(),
                strategy: config.strategy.build(
                    client.clone(),
                    self.store.clone(),
                    metrics.clone(),
                    config.depth,
                ),
                tips_tx: tips_tx.clone(),
                verbose: config.verbose,
            };
            workers.spawn(tip_worker.run(cancel.clone()));

            let spam_worker = SpamWorker {
                node,
                client,
                pow: self.pow.clone(),
                pow_lock: pow_lock.clone(),
                store: self.store.clone(),
                metrics: metrics.clone(),
                work_rx: work_rx.clone(),
                settings: settings.clone(),
            };
            workers.spawn(spam_worker.run(cancel.clone()));
        }
        drop(tips_tx);

        self.produce(&config, &mut tips_rx, &work_tx, &metrics, &cancel)
            .await;

        self.state.send_if_modified(|state| {
            if *state == EngineState::Running {
                *state = EngineState::Stopping;
                true
            } else {
                false
            }
        });
        info!(target: RESULT_TARGET, "Waiting for workers to terminate...");

        cancel.cancel();
        drop(work_tx);
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                warn!("Worker task failed: {}", e);
            }
        }
        drop(metrics);

        let totals = router.stop().await;
        self.log_run(
            &run_id,
            &format!(
                "spammer stopped: {} succeeded, {} failed",
                totals.succeeded, totals.failed
            ),
        )
        .await;
        info!(
            target: RESULT_TARGET,
            "Run {} finished in {:.1}s | {} succeeded | {} failed | {:.2} TPS",
            run_id,
            totals.uptime().as_secs_f64(),
            totals.succeeded,
            totals.failed,
            totals.tps()
        );

        let stats = SpammerStats {
            success: totals.succeeded,
            failed: totals.failed,
        };
        *self.last_metrics.lock().await = Some(totals);
        Ok(stats)
    }

    /// Bundle-preparation loop. Returns once cancelled.
    async fn produce(
        &self,
        config: &EngineConfig,
        tips_rx: &mut mpsc::Receiver<Tips>,
        work_tx: &mpsc::Sender<Transaction>,
        metrics: &MetricsHandle,
        cancel: &CancellationToken,
    ) {
        let seed = Seed::random();
        let transfers = [Transfer {
            address: config.destination.clone(),
            value: 0,
            tag: config.tag.clone(),
            message: config.message.clone(),
        }];
        let assembler = Assembler::new(&config.tag, &config.milestone_address, config.filters);

        loop {
            let prepared = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                prepared = self.preparer.prepare_bundle(&seed, &transfers, config.security_level) => prepared,
            };
            let bundle = match prepared {
                Ok(bundle) => bundle,
                Err(e) => {
                    metrics.record(MetricKind::FailedTx).await;
                    self.log_verbose(format_args!("Error preparing transfer: {:#}", e));
                    tokio::task::yield_now().await;
                    continue;
                }
            };

            let tx = match assembler.assemble(bundle, tips_rx, metrics, cancel).await {
                Ok(Some(tx)) => tx,
                Ok(None) => return,
                Err(e) => {
                    metrics.record(MetricKind::FailedTx).await;
                    self.log_verbose(format_args!("Error building transaction: {}", e));
                    continue;
                }
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                sent = work_tx.send(tx) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
        }
    }

    fn log_verbose(&self, message: std::fmt::Arguments<'_>) {
        if self.config.verbose {
            info!("{}", message);
        } else {
            debug!("{}", message);
        }
    }

    async fn log_run(&self, run_id: &str, message: &str) {
        if let Err(e) = self.store.append_log(run_id, &run_timestamp(), message).await {
            warn!("Failed to write run log: {:#}", e);
        }
    }
}

fn forward_cancellation(external: CancellationToken, cancel: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = external.cancelled() => cancel.cancel(),
        }
    });
}

fn spawn_timeout(timeout: Duration, cancel: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(timeout) => {
                info!(target: RESULT_TARGET, "Timeout of {:?} reached, stopping", timeout);
                cancel.cancel();
            }
        }
    });
}

#[async_trait]
impl SpammerTrait for Engine {
    async fn start(&self, cancellation_token: CancellationToken) -> anyhow::Result<SpammerStats> {
        Ok(self.start_with(cancellation_token).await?)
    }

    async fn stop(&self) -> anyhow::Result<()> {
        Engine::stop(self).await;
        Ok(())
    }

    fn is_running(&self) -> bool {
        Engine::is_running(self)
    }
}
