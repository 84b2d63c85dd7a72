//! In-memory node, signer and PoW doubles for unit tests.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::client::{LedgerClient, LedgerConnector};
use crate::pow::{BundlePreparer, PowOutcome, ProofOfWork};
use crate::types::{
    pad_tag, Bundle, Hash, Node, SecurityLevel, Seed, TipHashes, TransactionBody, Transfer,
};

/// Deterministic, distinct 81-tryte hash for `n`.
pub fn hash_of(n: usize) -> Hash {
    let mut out = String::from("TEST");
    let mut rest = n;
    loop {
        out.push((b'A' + (rest % 26) as u8) as char);
        rest /= 26;
        if rest == 0 {
            break;
        }
    }
    while out.len() < 81 {
        out.push('9');
    }
    out
}

pub fn body_with_tag(tag: &str) -> TransactionBody {
    TransactionBody {
        address: "A".repeat(81),
        tag: pad_tag(tag),
        obsolete_tag: pad_tag(tag),
        timestamp: 1_530_000_000,
        bundle: "B".repeat(81),
        ..Default::default()
    }
}

#[derive(Default)]
struct LedgerState {
    approve: Option<TipHashes>,
    tips: Vec<Hash>,
    latest_milestone: Hash,
    bodies: HashMap<Hash, TransactionBody>,
    fetched: Vec<Hash>,
}

/// Scriptable node.
pub struct MockLedger {
    endpoint: String,
    state: Mutex<LedgerState>,
    fetch_calls: AtomicUsize,
    attach_calls: AtomicUsize,
    broadcast_calls: AtomicUsize,
    fail_broadcast: AtomicBool,
    fail_approve: AtomicBool,
    approvals_left: Mutex<Option<usize>>,
    latency: Mutex<Option<Duration>>,
}

impl MockLedger {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            state: Mutex::new(LedgerState::default()),
            fetch_calls: AtomicUsize::new(0),
            attach_calls: AtomicUsize::new(0),
            broadcast_calls: AtomicUsize::new(0),
            fail_broadcast: AtomicBool::new(false),
            fail_approve: AtomicBool::new(false),
            approvals_left: Mutex::new(None),
            latency: Mutex::new(None),
        }
    }

    pub fn insert_body(&self, body: TransactionBody) {
        let mut state = self.state.lock().unwrap();
        state.bodies.insert(body.hash.clone(), body);
    }

    /// Make `getTransactionsToApprove` return this pair, registering both
    /// bodies.
    pub fn set_approve(&self, trunk: TransactionBody, branch: TransactionBody) {
        let pair = TipHashes {
            trunk_transaction: trunk.hash.clone(),
            branch_transaction: branch.hash.clone(),
        };
        self.insert_body(trunk);
        self.insert_body(branch);
        self.state.lock().unwrap().approve = Some(pair);
    }

    pub fn set_tips(&self, tips: Vec<TransactionBody>) {
        let hashes = tips.iter().map(|b| b.hash.clone()).collect();
        for body in tips {
            self.insert_body(body);
        }
        self.state.lock().unwrap().tips = hashes;
    }

    /// List `hash` as a tip without a body behind it.
    pub fn add_unknown_tip(&self, hash: Hash) {
        self.state.lock().unwrap().tips.push(hash);
    }

    pub fn set_latest_milestone(&self, milestone: TransactionBody) {
        let hash = milestone.hash.clone();
        self.insert_body(milestone);
        self.state.lock().unwrap().latest_milestone = hash;
    }

    pub fn set_fail_broadcast(&self, fail: bool) {
        self.fail_broadcast.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_approve(&self, fail: bool) {
        self.fail_approve.store(fail, Ordering::SeqCst);
    }

    /// Serve only `n` more tip pairs; later requests fail.
    pub fn limit_approvals(&self, n: usize) {
        *self.approvals_left.lock().unwrap() = Some(n);
    }

    /// Delay applied to every call.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = Some(latency);
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn fetched_hashes(&self) -> Vec<Hash> {
        self.state.lock().unwrap().fetched.clone()
    }

    pub fn attach_calls(&self) -> usize {
        self.attach_calls.load(Ordering::SeqCst)
    }

    pub fn broadcast_calls(&self) -> usize {
        self.broadcast_calls.load(Ordering::SeqCst)
    }

    async fn delay(&self) {
        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl LedgerClient for MockLedger {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn get_transactions_to_approve(&self, _depth: u32) -> Result<TipHashes> {
        self.delay().await;
        if self.fail_approve.load(Ordering::SeqCst) {
            return Err(anyhow!("getTransactionsToApprove failed"));
        }
        if let Some(left) = self.approvals_left.lock().unwrap().as_mut() {
            if *left == 0 {
                return Err(anyhow!("no more tips"));
            }
            *left -= 1;
        }
        self.state
            .lock()
            .unwrap()
            .approve
            .clone()
            .ok_or_else(|| anyhow!("no tips configured"))
    }

    async fn get_tips(&self) -> Result<Vec<Hash>> {
        self.delay().await;
        Ok(self.state.lock().unwrap().tips.clone())
    }

    async fn get_latest_milestone(&self) -> Result<Hash> {
        self.delay().await;
        Ok(self.state.lock().unwrap().latest_milestone.clone())
    }

    async fn fetch_bodies(&self, hashes: &[Hash]) -> Result<Vec<TransactionBody>> {
        self.delay().await;
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        state.fetched.extend(hashes.iter().cloned());
        hashes
            .iter()
            .map(|h| {
                state
                    .bodies
                    .get(h)
                    .cloned()
                    .ok_or_else(|| anyhow!("unknown transaction {}", h))
            })
            .collect()
    }

    async fn attach_to_tangle(
        &self,
        trunk: &str,
        branch: &str,
        _mwm: u32,
        bundle: &Bundle,
    ) -> Result<Bundle> {
        self.delay().await;
        self.attach_calls.fetch_add(1, Ordering::SeqCst);
        let mut attached = bundle.clone();
        let mut next: Option<Hash> = None;
        for (i, body) in attached.iter_mut().enumerate().rev() {
            match next.take() {
                None => {
                    body.trunk_transaction = trunk.to_string();
                    body.branch_transaction = branch.to_string();
                }
                Some(h) => {
                    body.trunk_transaction = h;
                    body.branch_transaction = trunk.to_string();
                }
            }
            body.nonce = "ATTACHED".to_string();
            body.hash = String::new();
            next = Some(hash_of(10_000 + i));
        }
        Ok(attached)
    }

    async fn broadcast(&self, _bundle: &Bundle) -> Result<()> {
        self.delay().await;
        self.broadcast_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_broadcast.load(Ordering::SeqCst) {
            return Err(anyhow!("broadcastTransactions failed"));
        }
        Ok(())
    }
}

/// Hands out pre-registered [`MockLedger`]s by URL.
#[derive(Default)]
pub struct MockConnector {
    ledgers: HashMap<String, Arc<MockLedger>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, ledger: Arc<MockLedger>) -> Self {
        self.ledgers.insert(ledger.endpoint.clone(), ledger);
        self
    }
}

impl LedgerConnector for MockConnector {
    fn connect(&self, node: &Node) -> Result<Arc<dyn LedgerClient>> {
        let ledger = self
            .ledgers
            .get(&node.url)
            .cloned()
            .ok_or_else(|| anyhow!("no mock ledger for {}", node.url))?;
        Ok(ledger)
    }
}

/// Nonce search double. Tracks how many searches overlap.
#[derive(Default)]
pub struct FakePow {
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    failing: bool,
    delay: Option<Duration>,
}

impl FakePow {
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Default::default()
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of concurrent `search_nonce` calls observed.
    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProofOfWork for FakePow {
    async fn search_nonce(&self, _trytes: &str, _mwm: u32) -> Result<PowOutcome> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.failing {
            return Err(anyhow!("pow failed"));
        }
        Ok(PowOutcome {
            nonce: pad_tag("NONCE"),
            hash: hash_of(n),
        })
    }

    async fn transaction_hash(&self, _trytes: &str) -> Result<Hash> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing {
            return Err(anyhow!("hashing failed"));
        }
        Ok(hash_of(n))
    }
}

/// Produces one-entry zero-value bundles.
#[derive(Default)]
pub struct FakePreparer {
    calls: AtomicUsize,
    failing: AtomicBool,
}

impl FakePreparer {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl BundlePreparer for FakePreparer {
    async fn prepare_bundle(
        &self,
        _seed: &Seed,
        transfers: &[Transfer],
        _security: SecurityLevel,
    ) -> Result<Bundle> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("signer unavailable"));
        }
        Ok(transfers
            .iter()
            .enumerate()
            .map(|(i, transfer)| TransactionBody {
                address: transfer.address.clone(),
                value: transfer.value,
                tag: pad_tag(&transfer.tag),
                obsolete_tag: pad_tag(&transfer.tag),
                signature_message_fragment: transfer.message.clone(),
                current_index: i as i64,
                last_index: transfers.len() as i64 - 1,
                bundle: hash_of(50_000 + n),
                ..Default::default()
            })
            .collect())
    }
}
