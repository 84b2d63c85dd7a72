//! Bundle preparation and proof-of-work
//!
//! Signing, hashing and nonce search are never done in-process. They sit
//! behind [`BundlePreparer`] and [`ProofOfWork`]; [`SignerClient`] reaches
//! an external signer service over the same JSON command protocol a node
//! uses. This module only sequences the calls.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use crate::client::{HttpLedgerClient, LedgerClient};
use crate::error::SpamError;
use crate::types::{Bundle, Hash, SecurityLevel, Seed, Transaction, Transfer};

/// Result of a nonce search: the nonce and the hash of the finished
/// transaction.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PowOutcome {
    pub nonce: String,
    pub hash: Hash,
}

#[async_trait]
pub trait ProofOfWork: Send + Sync {
    /// Find a nonce for the transaction encoded in `trytes` that meets
    /// `mwm`.
    async fn search_nonce(&self, trytes: &str, mwm: u32) -> Result<PowOutcome>;

    /// Hash of an already attached transaction.
    async fn transaction_hash(&self, trytes: &str) -> Result<Hash>;
}

#[async_trait]
pub trait BundlePreparer: Send + Sync {
    /// Build and sign a bundle for `transfers`, ready for attachment.
    async fn prepare_bundle(
        &self,
        seed: &Seed,
        transfers: &[Transfer],
        security: SecurityLevel,
    ) -> Result<Bundle>;
}

#[derive(Debug, Deserialize)]
struct PreparedBundle {
    bundle: Bundle,
}

#[derive(Debug, Deserialize)]
struct HashReply {
    hash: Hash,
}

/// Client for an external signer / PoW service.
#[derive(Clone, Debug)]
pub struct SignerClient {
    transport: HttpLedgerClient,
}

impl SignerClient {
    /// PoW at a high weight can take minutes.
    pub const TIMEOUT: Duration = Duration::from_secs(300);

    pub fn new(endpoint: &str) -> Result<Self> {
        let transport = HttpLedgerClient::with_timeout(endpoint, Self::TIMEOUT)
            .context("Invalid signer endpoint")?;
        Ok(Self { transport })
    }

    pub fn endpoint(&self) -> &str {
        self.transport.endpoint()
    }
}

#[async_trait]
impl BundlePreparer for SignerClient {
    async fn prepare_bundle(
        &self,
        seed: &Seed,
        transfers: &[Transfer],
        security: SecurityLevel,
    ) -> Result<Bundle> {
        let reply = self
            .transport
            .command(json!({
                "command": "prepareTransfers",
                "seed": seed.expose(),
                "transfers": transfers,
                "security": u8::from(security),
            }))
            .await?;
        let prepared: PreparedBundle =
            serde_json::from_value(reply).context("Malformed prepareTransfers reply")?;
        Ok(prepared.bundle)
    }
}

#[async_trait]
impl ProofOfWork for SignerClient {
    async fn search_nonce(&self, trytes: &str, mwm: u32) -> Result<PowOutcome> {
        let reply = self
            .transport
            .command(json!({
                "command": "pow",
                "trytes": trytes,
                "minWeightMagnitude": mwm,
            }))
            .await?;
        serde_json::from_value(reply).context("Malformed pow reply")
    }

    async fn transaction_hash(&self, trytes: &str) -> Result<Hash> {
        let reply = self
            .transport
            .command(json!({ "command": "getTransactionHash", "trytes": trytes }))
            .await?;
        let reply: HashReply =
            serde_json::from_value(reply).context("Malformed getTransactionHash reply")?;
        Ok(reply.hash)
    }
}

/// Local proof-of-work over a whole bundle.
///
/// Walks the bundle from the last entry to the first. The last entry
/// references `(trunk, branch)`; every earlier entry references the entry
/// after it as trunk and `trunk` as branch. The caller must hold the
/// process-wide PoW lock.
pub async fn finalize_local(
    tx: &mut Transaction,
    mwm: u32,
    pow: &dyn ProofOfWork,
) -> Result<(), SpamError> {
    if tx.bundle.is_empty() {
        return Err(SpamError::Finalization("empty bundle".into()));
    }

    let mut prev: Option<Hash> = None;
    for body in tx.bundle.iter_mut().rev() {
        match prev.take() {
            None => {
                body.trunk_transaction = tx.trunk.clone();
                body.branch_transaction = tx.branch.clone();
            }
            Some(next_hash) => {
                body.trunk_transaction = next_hash;
                body.branch_transaction = tx.trunk.clone();
            }
        }

        let trytes = body.to_trytes()?;
        let outcome = pow
            .search_nonce(&trytes, mwm)
            .await
            .map_err(|e| SpamError::Finalization(format!("{:#}", e)))?;

        body.nonce = outcome.nonce;
        body.hash = outcome.hash.clone();
        prev = Some(outcome.hash);
    }
    Ok(())
}

/// Remote proof-of-work via the node's `attachToTangle`.
///
/// The node returns bare trytes, so hashes are filled in through `pow`.
pub async fn finalize_remote(
    tx: &mut Transaction,
    mwm: u32,
    client: &dyn LedgerClient,
    pow: &dyn ProofOfWork,
) -> Result<(), SpamError> {
    let mut attached = client
        .attach_to_tangle(&tx.trunk, &tx.branch, mwm, &tx.bundle)
        .await
        .map_err(|e| SpamError::Finalization(format!("{:#}", e)))?;

    if attached.len() != tx.bundle.len() {
        return Err(SpamError::Finalization(format!(
            "node attached {} of {} transactions",
            attached.len(),
            tx.bundle.len()
        )));
    }

    for body in attached.iter_mut() {
        let trytes = body.to_trytes()?;
        body.hash = pow
            .transaction_hash(&trytes)
            .await
            .map_err(|e| SpamError::Finalization(format!("{:#}", e)))?;
    }

    tx.bundle = attached;
    Ok(())
}
