//! Reference store and cache-or-fetch resolution of tip bodies.

use anyhow::{Context, Result};
use async_trait::async_trait;
use core_logic::{DatabaseError, DatabaseManager, RunRecord};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::client::LedgerClient;
use crate::error::SpamError;
use crate::metrics::{MetricKind, MetricsHandle};
use crate::types::{Hash, TipHashes, Tips, TransactionBody};

/// Fixed-width RFC3339 with nanoseconds, so lexical order is time order.
pub const RUN_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.9f%:z";

pub fn run_timestamp() -> String {
    chrono::Utc::now().format(RUN_TIMESTAMP_FORMAT).to_string()
}

/// Persistent hash -> body cache plus the per-run sent and text logs.
#[async_trait]
pub trait ReferenceStore: Send + Sync {
    /// Bodies for `hashes`, aligned with the input; `None` is a miss.
    async fn get(&self, hashes: &[Hash]) -> Result<Vec<Option<TransactionBody>>>;

    /// Store bodies under their own hash. Re-storing is harmless.
    async fn put(&self, bodies: &[TransactionBody]) -> Result<()>;

    async fn new_run(&self, run_id: &str, started_at: &str) -> Result<()>;

    async fn append_sent(&self, run_id: &str, timestamp: &str, hash: &str) -> Result<()>;

    async fn append_log(&self, run_id: &str, timestamp: &str, message: &str) -> Result<()>;
}

/// [`ReferenceStore`] on top of the shared SQLite database.
///
/// Run records go through the database's async queue when it has one.
pub struct SqliteStore {
    db: Arc<DatabaseManager>,
}

impl SqliteStore {
    pub fn new(db: Arc<DatabaseManager>) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Arc<DatabaseManager> {
        &self.db
    }

    async fn write_record(&self, record: RunRecord) -> Result<()> {
        if self.db.is_async() {
            self.db.queue_record(record).await
        } else {
            self.db.log_record(&record).await
        }
    }
}

#[async_trait]
impl ReferenceStore for SqliteStore {
    async fn get(&self, hashes: &[Hash]) -> Result<Vec<Option<TransactionBody>>> {
        let rows = self.db.get_transactions(hashes).await?;
        hashes
            .iter()
            .zip(rows)
            .map(|(hash, row)| match row {
                None => Ok(None),
                Some(json) => serde_json::from_str(&json).map(Some).map_err(|e| {
                    DatabaseError::Corrupt {
                        key: hash.clone(),
                        reason: e.to_string(),
                    }
                    .into()
                }),
            })
            .collect()
    }

    async fn put(&self, bodies: &[TransactionBody]) -> Result<()> {
        let entries = bodies
            .iter()
            .map(|body| Ok((body.hash.clone(), serde_json::to_string(body)?)))
            .collect::<Result<Vec<_>>>()?;
        self.db
            .store_transactions(&entries)
            .await
            .context("Failed to cache transactions")?;
        Ok(())
    }

    async fn new_run(&self, run_id: &str, started_at: &str) -> Result<()> {
        self.db.create_run(run_id, started_at).await
    }

    async fn append_sent(&self, run_id: &str, timestamp: &str, hash: &str) -> Result<()> {
        self.write_record(RunRecord::Sent {
            run_id: run_id.to_string(),
            timestamp: timestamp.to_string(),
            hash: hash.to_string(),
        })
        .await
    }

    async fn append_log(&self, run_id: &str, timestamp: &str, message: &str) -> Result<()> {
        self.write_record(RunRecord::Log {
            run_id: run_id.to_string(),
            timestamp: timestamp.to_string(),
            message: message.to_string(),
        })
        .await
    }
}

#[derive(Debug, Default, Clone)]
pub struct RunLog {
    pub sent: Vec<(String, Hash)>,
    pub logs: Vec<(String, String)>,
}

/// In-process store for runs without a database.
#[derive(Debug, Default)]
pub struct MemoryStore {
    transactions: RwLock<HashMap<Hash, TransactionBody>>,
    runs: RwLock<HashMap<String, RunLog>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.transactions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn run(&self, run_id: &str) -> Option<RunLog> {
        self.runs.read().await.get(run_id).cloned()
    }

    pub async fn run_ids(&self) -> Vec<String> {
        self.runs.read().await.keys().cloned().collect()
    }
}

#[async_trait]
impl ReferenceStore for MemoryStore {
    async fn get(&self, hashes: &[Hash]) -> Result<Vec<Option<TransactionBody>>> {
        let transactions = self.transactions.read().await;
        Ok(hashes.iter().map(|h| transactions.get(h).cloned()).collect())
    }

    async fn put(&self, bodies: &[TransactionBody]) -> Result<()> {
        let mut transactions = self.transactions.write().await;
        for body in bodies {
            transactions.insert(body.hash.clone(), body.clone());
        }
        Ok(())
    }

    async fn new_run(&self, run_id: &str, _started_at: &str) -> Result<()> {
        self.runs
            .write()
            .await
            .entry(run_id.to_string())
            .or_default();
        Ok(())
    }

    async fn append_sent(&self, run_id: &str, timestamp: &str, hash: &str) -> Result<()> {
        self.runs
            .write()
            .await
            .entry(run_id.to_string())
            .or_default()
            .sent
            .push((timestamp.to_string(), hash.to_string()));
        Ok(())
    }

    async fn append_log(&self, run_id: &str, timestamp: &str, message: &str) -> Result<()> {
        self.runs
            .write()
            .await
            .entry(run_id.to_string())
            .or_default()
            .logs
            .push((timestamp.to_string(), message.to_string()));
        Ok(())
    }
}

/// Resolve a tip pair to bodies, preferring the store.
///
/// Every hit and miss is counted. Misses are fetched from the node in one
/// call and written back to the store.
pub async fn resolve_tips(
    store: &dyn ReferenceStore,
    client: &dyn LedgerClient,
    metrics: &MetricsHandle,
    hashes: TipHashes,
) -> Result<Tips, SpamError> {
    let wanted = [hashes.trunk_transaction, hashes.branch_transaction];

    let cached = match store.get(&wanted).await {
        Ok(found) if found.len() == wanted.len() => found,
        Ok(found) => {
            warn!(
                "Reference store returned {} entries for {} hashes",
                found.len(),
                wanted.len()
            );
            vec![None, None]
        }
        Err(e) => {
            debug!("Reference store lookup failed, fetching from node: {:#}", e);
            vec![None, None]
        }
    };

    let mut resolved: [Option<TransactionBody>; 2] = [None, None];
    let mut missing = Vec::with_capacity(2);
    for (slot, entry) in cached.into_iter().enumerate() {
        match entry {
            Some(body) => {
                metrics.record(MetricKind::CacheHit).await;
                resolved[slot] = Some(body);
            }
            None => {
                metrics.record(MetricKind::CacheMiss).await;
                missing.push(slot);
            }
        }
    }

    if !missing.is_empty() {
        let to_fetch: Vec<Hash> = missing.iter().map(|&slot| wanted[slot].clone()).collect();
        let fetched = client
            .fetch_bodies(&to_fetch)
            .await
            .map_err(|e| SpamError::transient(client.endpoint(), format!("{:#}", e)))?;

        if fetched.len() != to_fetch.len() {
            return Err(SpamError::transient(
                client.endpoint(),
                format!("expected {} bodies, got {}", to_fetch.len(), fetched.len()),
            ));
        }

        if let Err(e) = store.put(&fetched).await {
            warn!("Failed to cache fetched transactions: {:#}", e);
        }

        for (slot, body) in missing.into_iter().zip(fetched) {
            resolved[slot] = Some(body);
        }
    }

    let [trunk_hash, branch_hash] = wanted;
    match resolved {
        [Some(trunk), Some(branch)] => Ok(Tips {
            trunk_hash,
            branch_hash,
            trunk,
            branch,
        }),
        _ => Err(SpamError::transient(
            client.endpoint(),
            "tip bodies could not be resolved",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsRouter;
    use crate::testing::{body_with_tag, hash_of, MockLedger};

    fn tip_hashes(trunk: &str, branch: &str) -> TipHashes {
        TipHashes {
            trunk_transaction: trunk.to_string(),
            branch_transaction: branch.to_string(),
        }
    }

    #[tokio::test]
    async fn test_cache_hits_skip_the_node() {
        let store = MemoryStore::new();
        let ledger = MockLedger::new("http://node-a");
        let (router, metrics) = MetricsRouter::start(None);

        let mut trunk = body_with_tag("A");
        trunk.hash = hash_of(1);
        let mut branch = body_with_tag("B");
        branch.hash = hash_of(2);
        store.put(&[trunk.clone(), branch.clone()]).await.unwrap();

        let tips = resolve_tips(&store, &ledger, &metrics, tip_hashes(&trunk.hash, &branch.hash))
            .await
            .unwrap();
        assert_eq!(tips.trunk, trunk);
        assert_eq!(tips.branch, branch);
        assert_eq!(ledger.fetch_calls(), 0);

        let totals = router.stop().await;
        assert_eq!(totals.cache_hits, 2);
        assert_eq!(totals.cache_misses, 0);
    }

    #[tokio::test]
    async fn test_misses_are_fetched_once_and_stored() {
        let store = MemoryStore::new();
        let ledger = MockLedger::new("http://node-a");
        let (router, metrics) = MetricsRouter::start(None);

        let mut trunk = body_with_tag("A");
        trunk.hash = hash_of(1);
        store.put(&[trunk.clone()]).await.unwrap();

        let mut branch = body_with_tag("B");
        branch.hash = hash_of(2);
        ledger.insert_body(branch.clone());

        let tips = resolve_tips(&store, &ledger, &metrics, tip_hashes(&trunk.hash, &branch.hash))
            .await
            .unwrap();
        assert_eq!(tips.branch.tag, branch.tag);
        assert_eq!(ledger.fetch_calls(), 1);
        assert_eq!(ledger.fetched_hashes(), vec![branch.hash.clone()]);
        assert_eq!(store.len().await, 2);

        // Second resolution is served entirely from the store
        resolve_tips(&store, &ledger, &metrics, tip_hashes(&trunk.hash, &branch.hash))
            .await
            .unwrap();
        assert_eq!(ledger.fetch_calls(), 1);

        let totals = router.stop().await;
        assert_eq!(totals.cache_hits, 3);
        assert_eq!(totals.cache_misses, 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_transient() {
        let store = MemoryStore::new();
        let ledger = MockLedger::new("http://node-a");
        let (_router, metrics) = MetricsRouter::start(None);

        let err = resolve_tips(&store, &ledger, &metrics, tip_hashes(&hash_of(7), &hash_of(8)))
            .await
            .unwrap_err();
        assert!(matches!(err, SpamError::TransientFetch { .. }));
    }

    #[tokio::test]
    async fn test_sqlite_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let db = Arc::new(DatabaseManager::new(path.to_str().unwrap()).await.unwrap());
        let store = SqliteStore::new(db.clone());

        let mut body = body_with_tag("SQL");
        body.hash = hash_of(3);
        body.value = 42;
        store.put(&[body.clone()]).await.unwrap();

        let found = store.get(&[hash_of(4), body.hash.clone()]).await.unwrap();
        assert_eq!(found, vec![None, Some(body.clone())]);

        store.new_run("run-1", "2026-01-01").await.unwrap();
        store
            .append_sent("run-1", &run_timestamp(), &body.hash)
            .await
            .unwrap();
        store
            .append_log("run-1", &run_timestamp(), "hello")
            .await
            .unwrap();

        let sent = db.get_sent("run-1").await.unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, body.hash);
        assert_eq!(db.get_run_logs("run-1").await.unwrap()[0].1, "hello");
    }

    #[test]
    fn test_run_timestamps_sort_lexically() {
        let first = run_timestamp();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = run_timestamp();
        assert!(first < second);
        assert_eq!(first.len(), second.len());
    }
}
