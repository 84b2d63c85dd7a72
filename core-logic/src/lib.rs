//! # Core Logic - Shared Infrastructure for the Spammer Workspace
//!
//! This crate provides the plumbing shared by spam engines: persistence,
//! run metrics, logging, retries and the process runner.
//!
//! ## Modules
//!
//! - [`database`] - Async SQLite reference store with connection pooling
//! - [`error`] - Typed error handling with thiserror
//! - [`metrics`] - Per-run counters and serializable snapshots
//! - [`traits`] - Core trait definitions

pub mod database;
pub mod error;
pub mod metrics;
pub mod traits;
pub(crate) mod utils;

pub use database::{
    AsyncDbConfig, DatabaseManager, DbMetrics, DbMetricsSnapshot, FallbackStrategy, RunEntry,
    RunRecord,
};
pub use error::{ConfigError, DatabaseError, NetworkError};
pub use metrics::{MetricsSnapshot, RunMetrics};
pub use traits::{Spammer as SpammerTrait, SpammerStats};

pub use utils::logger::RESULT_TARGET;
pub use utils::{setup_logger, LoggerOptions, WorkerRunner};

pub use utils::retry::{is_transient_error, with_retry, with_retry_if, RetryConfig};
