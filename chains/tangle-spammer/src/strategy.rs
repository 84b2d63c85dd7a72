//! Tip-selection strategies.

use async_trait::async_trait;
use rand::Rng;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

use crate::cache::{resolve_tips, ReferenceStore};
use crate::client::LedgerClient;
use crate::error::SpamError;
use crate::metrics::MetricsHandle;
use crate::types::{Hash, Tips, TransactionBody};

/// Produces the next tip pair to attach to.
#[async_trait]
pub trait TipStrategy: Send + Sync {
    async fn next_tips(&self) -> Result<Tips, SpamError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrategyKind {
    /// Node's tip-selection walk.
    #[default]
    ApproveTips,
    /// Latest milestone as trunk, a random value-carrying tip as branch.
    NonZeroPromote,
}

impl FromStr for StrategyKind {
    type Err = SpamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "approve" => Ok(StrategyKind::ApproveTips),
            "non zero promote" | "non-zero" => Ok(StrategyKind::NonZeroPromote),
            other => Err(SpamError::invalid(
                "strategy",
                format!("unknown strategy '{}'", other),
            )),
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyKind::ApproveTips => f.write_str("approve"),
            StrategyKind::NonZeroPromote => f.write_str("non zero promote"),
        }
    }
}

impl StrategyKind {
    pub fn build(
        self,
        client: Arc<dyn LedgerClient>,
        store: Arc<dyn ReferenceStore>,
        metrics: MetricsHandle,
        depth: u32,
    ) -> Box<dyn TipStrategy> {
        match self {
            StrategyKind::ApproveTips => Box::new(ApproveTips {
                client,
                store,
                metrics,
                depth,
            }),
            StrategyKind::NonZeroPromote => Box::new(NonZeroTip { client }),
        }
    }
}

pub struct ApproveTips {
    client: Arc<dyn LedgerClient>,
    store: Arc<dyn ReferenceStore>,
    metrics: MetricsHandle,
    depth: u32,
}

#[async_trait]
impl TipStrategy for ApproveTips {
    async fn next_tips(&self) -> Result<Tips, SpamError> {
        let hashes = self
            .client
            .get_transactions_to_approve(self.depth)
            .await
            .map_err(|e| SpamError::transient(self.client.endpoint(), format!("{:#}", e)))?;

        resolve_tips(
            self.store.as_ref(),
            self.client.as_ref(),
            &self.metrics,
            hashes,
        )
        .await
    }
}

pub struct NonZeroTip {
    client: Arc<dyn LedgerClient>,
}

impl NonZeroTip {
    async fn fetch_one(&self, hash: &Hash) -> Result<TransactionBody, SpamError> {
        let endpoint = self.client.endpoint();
        self.client
            .fetch_bodies(std::slice::from_ref(hash))
            .await
            .map_err(|e| SpamError::transient(endpoint, format!("{:#}", e)))?
            .into_iter()
            .next()
            .ok_or_else(|| SpamError::transient(endpoint, format!("no body for {}", hash)))
    }

    /// Random tip with a non-zero value. Zero-value and unreadable
    /// candidates are dropped until one qualifies or none are left.
    async fn pick_branch(&self, mut candidates: Vec<Hash>) -> Result<(Hash, TransactionBody), SpamError> {
        while !candidates.is_empty() {
            let idx = rand::thread_rng().gen_range(0..candidates.len());
            match self.fetch_one(&candidates[idx]).await {
                Ok(body) if body.value != 0 => {
                    return Ok((candidates.swap_remove(idx), body));
                }
                Ok(_) => {}
                Err(e) => debug!("Dropping tip candidate: {}", e),
            }
            candidates.swap_remove(idx);
        }
        Err(SpamError::transient(
            self.client.endpoint(),
            "no non-zero tip available",
        ))
    }
}

#[async_trait]
impl TipStrategy for NonZeroTip {
    async fn next_tips(&self) -> Result<Tips, SpamError> {
        let endpoint = self.client.endpoint();
        let candidates = self
            .client
            .get_tips()
            .await
            .map_err(|e| SpamError::transient(endpoint, format!("{:#}", e)))?;

        let (branch_hash, branch) = self.pick_branch(candidates).await?;

        let trunk_hash = self
            .client
            .get_latest_milestone()
            .await
            .map_err(|e| SpamError::transient(endpoint, format!("{:#}", e)))?;
        let trunk = self.fetch_one(&trunk_hash).await?;

        Ok(Tips {
            trunk_hash,
            branch_hash,
            trunk,
            branch,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use crate::metrics::MetricsRouter;
    use crate::testing::{body_with_tag, hash_of, MockLedger};

    fn body(n: usize, value: i64) -> TransactionBody {
        let mut body = body_with_tag("TIP");
        body.hash = hash_of(n);
        body.value = value;
        body
    }

    #[test]
    fn test_strategy_names() {
        assert_eq!("".parse::<StrategyKind>().unwrap(), StrategyKind::ApproveTips);
        assert_eq!(
            "approve".parse::<StrategyKind>().unwrap(),
            StrategyKind::ApproveTips
        );
        assert_eq!(
            "Non Zero Promote".parse::<StrategyKind>().unwrap(),
            StrategyKind::NonZeroPromote
        );
        assert_eq!(
            "non-zero".parse::<StrategyKind>().unwrap(),
            StrategyKind::NonZeroPromote
        );
        assert!(matches!(
            "random".parse::<StrategyKind>(),
            Err(SpamError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_approve_resolves_through_store() {
        let ledger = Arc::new(MockLedger::new("http://node-a"));
        ledger.set_approve(body(1, 0), body(2, 0));
        let store = Arc::new(MemoryStore::new());
        let (router, metrics) = MetricsRouter::start(None);

        let strategy = StrategyKind::ApproveTips.build(ledger.clone(), store.clone(), metrics, 3);
        let first = strategy.next_tips().await.unwrap();
        let second = strategy.next_tips().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.trunk_hash, hash_of(1));
        assert_eq!(ledger.fetch_calls(), 1);

        let totals = router.stop().await;
        assert_eq!(totals.cache_misses, 2);
        assert_eq!(totals.cache_hits, 2);
    }

    #[tokio::test]
    async fn test_approve_failure_is_transient() {
        let ledger = Arc::new(MockLedger::new("http://node-a"));
        ledger.set_approve(body(1, 0), body(2, 0));
        ledger.set_fail_approve(true);
        let (_router, metrics) = MetricsRouter::start(None);

        let strategy = StrategyKind::ApproveTips.build(ledger.clone(), Arc::new(MemoryStore::new()), metrics, 3);
        let err = strategy.next_tips().await.unwrap_err();
        assert!(matches!(err, SpamError::TransientFetch { ref endpoint, .. } if endpoint == "http://node-a"));
        assert_eq!(ledger.fetch_calls(), 0);
    }

    #[tokio::test]
    async fn test_non_zero_picks_value_tip_and_milestone_trunk() {
        let ledger = Arc::new(MockLedger::new("http://node-a"));
        ledger.set_tips(vec![body(1, 0), body(2, 7), body(3, 0)]);
        ledger.set_latest_milestone(body(9, 0));
        let (_router, metrics) = MetricsRouter::start(None);

        let strategy =
            StrategyKind::NonZeroPromote.build(ledger.clone(), Arc::new(MemoryStore::new()), metrics, 3);
        for _ in 0..5 {
            let tips = strategy.next_tips().await.unwrap();
            assert_eq!(tips.branch_hash, hash_of(2));
            assert_eq!(tips.branch.value, 7);
            assert_eq!(tips.trunk_hash, hash_of(9));
        }
    }

    #[tokio::test]
    async fn test_non_zero_exhausted_is_transient() {
        let ledger = Arc::new(MockLedger::new("http://node-a"));
        ledger.set_tips(vec![body(1, 0), body(2, 0)]);
        ledger.set_latest_milestone(body(9, 0));
        let (_router, metrics) = MetricsRouter::start(None);

        let strategy =
            StrategyKind::NonZeroPromote.build(ledger.clone(), Arc::new(MemoryStore::new()), metrics, 3);
        let err = strategy.next_tips().await.unwrap_err();
        assert!(matches!(err, SpamError::TransientFetch { .. }));
        assert_eq!(ledger.fetch_calls(), 2);
    }

    #[tokio::test]
    async fn test_non_zero_skips_unreadable_candidate() {
        let ledger = Arc::new(MockLedger::new("http://node-a"));
        ledger.set_tips(vec![body(2, 7)]);
        ledger.add_unknown_tip(hash_of(1));
        ledger.set_latest_milestone(body(9, 0));
        let (_router, metrics) = MetricsRouter::start(None);

        let strategy =
            StrategyKind::NonZeroPromote.build(ledger.clone(), Arc::new(MemoryStore::new()), metrics, 3);
        let unreadable_fetches =
            || ledger.fetched_hashes().iter().filter(|h| **h == hash_of(1)).count();
        for round in 1..=5 {
            let tips = strategy.next_tips().await.unwrap();
            assert_eq!(tips.branch_hash, hash_of(2));
            assert_eq!(tips.branch.value, 7);
            assert!(unreadable_fetches() <= round);
        }
    }
}
