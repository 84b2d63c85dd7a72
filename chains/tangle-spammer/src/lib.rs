//! Tangle Spammer - zero-value transaction spammer for IOTA nodes
//!
//! A multi-node spam engine that keeps a set of nodes busy with signed
//! zero-value bundles. Each bundle references a tip pair picked by a
//! pluggable strategy, gets its proof-of-work either locally or on the node,
//! and is broadcast back to the network.
//!
//! # Features
//!
//! - **Node Discovery**: Optional public node list plus a probe that detects
//!   which nodes accept remote `attachToTangle`
//! - **Tip Strategies**: Node tip selection (`approve`) or milestone trunk
//!   with a random value-carrying branch (`non zero promote`)
//! - **Reference Filters**: Skip tips that are our own spam or milestones
//! - **Serialized Local PoW**: One nonce search at a time across all nodes
//! - **Reference Cache**: Fetched bodies are kept in memory or SQLite, and
//!   every sent hash is logged per run
//! - **Metrics Router**: Live counters with an optional relay channel for
//!   external consumers
//!
//! # Architecture
//!
//! - **[`Engine`]**: Owns the run lifecycle, spawns per-node workers and
//!   produces work items
//! - **[`TipWorker`](worker::TipWorker)**: Feeds tip pairs from one node's
//!   [`TipStrategy`] into the shared tips channel
//! - **[`SpamWorker`](worker::SpamWorker)**: Finalizes and broadcasts work
//!   items through one node
//! - **[`Assembler`]**: Checks a tip pair against the reference filters and
//!   pairs it with a fresh bundle
//! - **[`MetricsRouter`]**: Single task that owns the run counters
//!
//! ```text
//!  TipWorker (per node) ──tips──▶ producer ──work──▶ SpamWorker (per node)
//!         │                          │                    │
//!         └──────── metrics events ──┴────────────────────┘──▶ MetricsRouter
//! ```
//!
//! # Quick Start
//!
//! ```bash
//! # Spam a local node with default settings
//! cargo run -p tangle-spammer --bin tangle-spammer
//!
//! # Use a public node list, only nodes with remote PoW, for ten minutes
//! cargo run -p tangle-spammer --bin tangle-spammer -- \
//!     --nodelist https://example.org/nodes.json --only-with-pow --remote-pow --timeout 600
//! ```
//!
//! # Configuration
//!
//! Settings are read from `config/config.toml` and can be overridden on the
//! command line. See the [`config`] module.
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tangle_spammer::{Engine, EngineConfig, HttpConnector, Node, SignerClient};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = EngineConfig::builder()
//!     .node(Node::new("http://localhost:14265", true))
//!     .strategy("approve")
//!     .build()?;
//!
//! let signer = Arc::new(SignerClient::new("http://localhost:14700")?);
//! let engine = Engine::new(config, Arc::new(HttpConnector::default()), signer.clone(), signer);
//! let stats = engine.start().await?;
//! println!("{} sent, {} failed", stats.success, stats.failed);
//! # Ok(())
//! # }
//! ```

pub mod assembler;
pub mod cache;
pub mod client;
pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod pow;
pub mod strategy;
pub mod types;
pub mod worker;

#[cfg(test)]
pub mod testing;

pub use assembler::{Assembler, ReferenceFilters};
pub use cache::{MemoryStore, ReferenceStore, SqliteStore};
pub use client::{HttpConnector, HttpLedgerClient, LedgerClient, LedgerConnector};
pub use config::{EngineConfig, EngineConfigBuilder, TangleSpammerConfig};
pub use engine::{Engine, EngineState};
pub use error::{ReferenceSide, SpamError};
pub use metrics::{Metric, MetricKind, MetricsRouter, Summary, TxData};
pub use pow::{BundlePreparer, ProofOfWork, SignerClient};
pub use strategy::{StrategyKind, TipStrategy};
pub use types::{Node, SecurityLevel, Tips, Transaction, TransactionBody};
