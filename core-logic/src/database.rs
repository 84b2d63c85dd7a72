use anyhow::{Context, Result};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{ConfigError, DatabaseError};
use smallvec::SmallVec;

/// Configuration for async run logging
#[derive(Debug, Clone, Copy)]
pub struct AsyncDbConfig {
    pub channel_capacity: usize,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
}

impl Default for AsyncDbConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1000,
            batch_size: 200,
            flush_interval_ms: 200,
        }
    }
}

/// A row destined for one of the per-run append-only logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunRecord {
    /// A transaction hash that was broadcast during the run.
    Sent {
        run_id: String,
        timestamp: String,
        hash: String,
    },
    /// A free-form text line attached to the run.
    Log {
        run_id: String,
        timestamp: String,
        message: String,
    },
}

impl RunRecord {
    pub fn run_id(&self) -> &str {
        match self {
            RunRecord::Sent { run_id, .. } | RunRecord::Log { run_id, .. } => run_id,
        }
    }
}

/// Fallback strategy when channel is full
#[derive(Debug, Clone, Copy)]
pub enum FallbackStrategy {
    /// Silently drop the record
    Drop,
    /// Write the record directly to the pool, bypassing the queue
    Sync,
    /// Drop but log a warning (recommended)
    Hybrid,
}

/// SQLite-backed reference store.
///
/// Holds three kinds of data:
/// - `transactions`: transaction hash -> serialized body, written once and never invalidated
/// - `sent_transactions`: per-run log of broadcast hashes keyed by timestamp
/// - `run_logs`: per-run text log keyed by timestamp
///
/// Note: This struct is not Clone because it contains a JoinHandle.
/// Use Arc<DatabaseManager> for shared ownership.
#[derive(Debug)]
pub struct DatabaseManager {
    pool: SqlitePool,
    metrics: Arc<DbMetrics>,
    /// Async record channel sender (None if sync mode)
    record_sender: Option<mpsc::Sender<RunRecord>>,
    /// Background flush task handle
    flush_handle: Option<JoinHandle<()>>,
    /// Async configuration
    async_config: Option<AsyncDbConfig>,
    /// Fallback strategy for channel full
    fallback_strategy: Option<FallbackStrategy>,
}

#[derive(Debug, Default)]
pub struct DbMetrics {
    pub total_queries: AtomicU64,
    pub total_errors: AtomicU64,
    pub total_inserts: AtomicU64,
    pub total_selects: AtomicU64,
    /// Async-specific metrics
    pub queued_entries: AtomicU64,
    pub dropped_entries: AtomicU64,
    pub batch_flush_count: AtomicU64,
}

/// A run registered in the store.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RunEntry {
    pub run_id: String,
    pub started_at: String,
}

impl DatabaseManager {
    pub const DEFAULT_MAX_CONNECTIONS: u32 = 20;
    pub const DEFAULT_TIMEOUT_MS: u64 = 30000;

    pub async fn new(db_path: &str) -> Result<Self> {
        let pool = Self::connect(db_path).await?;

        let manager = Self {
            pool,
            metrics: Arc::new(DbMetrics::default()),
            record_sender: None,
            flush_handle: None,
            async_config: None,
            fallback_strategy: None,
        };
        manager.init_schema().await?;
        info!(
            "Database initialized with pool size {} (WAL Mode)",
            Self::DEFAULT_MAX_CONNECTIONS
        );
        Ok(manager)
    }

    /// Create a new DatabaseManager whose run records are written by a
    /// background batching task.
    pub async fn new_with_async(
        db_path: &str,
        config: AsyncDbConfig,
        fallback: FallbackStrategy,
    ) -> Result<Self> {
        let pool = Self::connect(db_path).await?;
        let metrics = Arc::new(DbMetrics::default());

        let (tx, rx) = mpsc::channel(config.channel_capacity);

        let pool_clone = pool.clone();
        let worker_metrics = metrics.clone();
        let flush_handle = tokio::spawn(async move {
            db_flush_worker(rx, pool_clone, config, worker_metrics).await;
        });

        let manager = Self {
            pool,
            metrics,
            record_sender: Some(tx),
            flush_handle: Some(flush_handle),
            async_config: Some(config),
            fallback_strategy: Some(fallback),
        };

        manager.init_schema().await?;
        info!(
            "Database initialized with async logging (channel: {}, batch: {}, interval: {}ms)",
            config.channel_capacity, config.batch_size, config.flush_interval_ms
        );

        Ok(manager)
    }

    async fn connect(db_path: &str) -> Result<SqlitePool> {
        if !Path::new(db_path).exists() {
            std::fs::File::create(db_path).map_err(|e| ConfigError::IoError {
                path: db_path.to_string(),
                msg: e.to_string(),
            })?;
            info!("Created new database file: {}", db_path);
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(Self::DEFAULT_MAX_CONNECTIONS)
            .acquire_timeout(Duration::from_millis(Self::DEFAULT_TIMEOUT_MS))
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    sqlx::query("PRAGMA journal_mode=WAL;")
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query("PRAGMA synchronous=NORMAL;")
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(&format!("sqlite://{}", db_path))
            .await
            .map_err(|e| DatabaseError::TransactionFailed { msg: e.to_string() })?;

        Ok(pool)
    }

    async fn init_schema(&self) -> Result<()> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|_| DatabaseError::PoolExhausted {
                max_size: Self::DEFAULT_MAX_CONNECTIONS,
            })?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS transactions (
                hash TEXT PRIMARY KEY,
                body TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                started_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS sent_transactions (
                id INTEGER PRIMARY KEY,
                run_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                hash TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS run_logs (
                id INTEGER PRIMARY KEY,
                run_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                message TEXT NOT NULL
            );",
        )
        .execute(&mut *conn)
        .await
        .map_err(|e| DatabaseError::TransactionFailed { msg: e.to_string() })?;

        self.create_indexes().await?;

        info!("Database schema initialized with indexes.");
        Ok(())
    }

    async fn create_indexes(&self) -> Result<()> {
        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_sent_run_ts ON sent_transactions(run_id, timestamp);",
            "CREATE INDEX IF NOT EXISTS idx_run_logs_run_ts ON run_logs(run_id, timestamp);",
        ];

        for idx_sql in indexes {
            if let Err(e) = sqlx::query(idx_sql).execute(&self.pool).await {
                debug!("Index creation skipped (may exist): {}", e);
            }
        }
        Ok(())
    }

    /// Look up serialized bodies for `hashes`.
    ///
    /// The result is aligned with the input: `None` marks a hash the store
    /// has never seen.
    pub async fn get_transactions(&self, hashes: &[String]) -> Result<Vec<Option<String>>> {
        if hashes.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT hash, body FROM transactions WHERE hash IN (");
        let mut separated = builder.separated(", ");
        for hash in hashes {
            separated.push_bind(hash);
        }
        separated.push_unseparated(")");

        let rows = builder.build().fetch_all(&self.pool).await;

        self.metrics.total_selects.fetch_add(1, Ordering::SeqCst);

        let rows = match rows {
            Ok(rows) => {
                self.metrics.total_queries.fetch_add(1, Ordering::SeqCst);
                rows
            }
            Err(e) => {
                self.metrics.total_errors.fetch_add(1, Ordering::SeqCst);
                return Err(e).context("Failed to look up cached transactions");
            }
        };

        let mut found = std::collections::HashMap::with_capacity(rows.len());
        for row in rows {
            let hash: String = row.try_get("hash")?;
            let body: String = row.try_get("body")?;
            found.insert(hash, body);
        }

        Ok(hashes.iter().map(|h| found.get(h).cloned()).collect())
    }

    /// Upsert `(hash, body)` pairs in a single transaction.
    ///
    /// Storing a hash that already exists overwrites it with the same body.
    pub async fn store_transactions(&self, entries: &[(String, String)]) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for (hash, body) in entries {
            let result = sqlx::query(
                "INSERT INTO transactions (hash, body) VALUES (?, ?)
                 ON CONFLICT(hash) DO UPDATE SET body = excluded.body",
            )
            .bind(hash)
            .bind(body)
            .execute(&mut *tx)
            .await;

            match result {
                Ok(_) => {
                    inserted += 1;
                    self.metrics.total_inserts.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) => {
                    self.metrics.total_errors.fetch_add(1, Ordering::SeqCst);
                    debug!("Failed to store transaction {}: {}", hash, e);
                }
            }
        }

        tx.commit().await?;
        self.metrics
            .total_queries
            .fetch_add(entries.len() as u64, Ordering::SeqCst);

        Ok(inserted)
    }

    /// Register a run. Registering the same id twice is a no-op.
    pub async fn create_run(&self, run_id: &str, started_at: &str) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO runs (run_id, started_at) VALUES (?, ?)")
            .bind(run_id)
            .bind(started_at)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to register run {}", run_id))?;
        self.metrics.total_inserts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub async fn list_runs(&self) -> Result<Vec<RunEntry>> {
        let runs = sqlx::query_as::<_, RunEntry>(
            "SELECT run_id, started_at FROM runs ORDER BY started_at ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list runs")?;
        self.metrics.total_selects.fetch_add(1, Ordering::SeqCst);
        Ok(runs)
    }

    /// Write a run record immediately, bypassing the async queue.
    pub async fn log_record(&self, record: &RunRecord) -> Result<()> {
        let result = insert_record(record, &self.pool).await;
        match result {
            Ok(_) => {
                self.metrics.total_inserts.fetch_add(1, Ordering::SeqCst);
                self.metrics.total_queries.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                self.metrics.total_errors.fetch_add(1, Ordering::SeqCst);
                error!("Failed to write run record: {}", e);
                Err(e).context("Failed to insert run record")
            }
        }
    }

    /// Queue a run record for async logging
    ///
    /// Returns as soon as the record is queued; it is flushed in batches by
    /// the background task. When the queue is full the fallback strategy
    /// decides: `Sync` writes the record directly, the others drop it. When
    /// async mode is disabled the caller should use
    /// [`DatabaseManager::log_record`] instead.
    ///
    /// # Returns
    /// * `Ok(())` - Queued, written directly, or dropped per the fallback strategy
    /// * `Err` - Channel is closed (database shutting down) or the direct write failed
    pub async fn queue_record(&self, record: RunRecord) -> Result<()> {
        let Some(sender) = &self.record_sender else {
            return Err(anyhow::anyhow!("Async logging not initialized"));
        };

        match sender.try_send(record) {
            Ok(_) => {
                self.metrics.queued_entries.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(record)) => match self.fallback_strategy {
                Some(FallbackStrategy::Sync) => {
                    debug!("Channel full, writing run record directly");
                    self.log_record(&record).await
                }
                Some(FallbackStrategy::Hybrid) => {
                    self.metrics.dropped_entries.fetch_add(1, Ordering::SeqCst);
                    warn!("Dropped run record (channel full), continuing execution");
                    Ok(())
                }
                Some(FallbackStrategy::Drop) | None => {
                    self.metrics.dropped_entries.fetch_add(1, Ordering::SeqCst);
                    debug!("Dropped run record (channel full)");
                    Ok(())
                }
            },
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DatabaseError::ChannelClosed.into()),
        }
    }

    /// Hashes broadcast during `run_id`, oldest first.
    pub async fn get_sent(&self, run_id: &str) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query(
            "SELECT timestamp, hash FROM sent_transactions WHERE run_id = ? ORDER BY timestamp ASC, id ASC",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("Failed to read sent log for run {}", run_id))?;
        self.metrics.total_selects.fetch_add(1, Ordering::SeqCst);

        rows.into_iter()
            .map(|row| -> Result<(String, String)> {
                Ok((row.try_get("timestamp")?, row.try_get("hash")?))
            })
            .collect()
    }

    /// Text log lines of `run_id`, oldest first.
    pub async fn get_run_logs(&self, run_id: &str) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query(
            "SELECT timestamp, message FROM run_logs WHERE run_id = ? ORDER BY timestamp ASC, id ASC",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("Failed to read run log for run {}", run_id))?;
        self.metrics.total_selects.fetch_add(1, Ordering::SeqCst);

        rows.into_iter()
            .map(|row| -> Result<(String, String)> {
                Ok((row.try_get("timestamp")?, row.try_get("message")?))
            })
            .collect()
    }

    /// Gracefully shutdown the database, flushing any pending async writes
    pub async fn shutdown(mut self) -> Result<()> {
        info!("Shutting down database (flushing remaining entries)...");

        // Drop sender to signal shutdown to worker
        self.record_sender = None;

        if let Some(handle) = self.flush_handle.take() {
            match tokio::time::timeout(Duration::from_secs(5), handle).await {
                Ok(Ok(())) => info!("Database flush completed"),
                Ok(Err(e)) => error!("Flush task error: {}", e),
                Err(_) => warn!("Flush timeout - some data may be lost"),
            }
        }

        self.pool.close().await;
        info!("Database shutdown complete");

        Ok(())
    }

    pub fn get_metrics(&self) -> DbMetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::SeqCst);
        DbMetricsSnapshot {
            total_queries: load(&self.metrics.total_queries),
            total_errors: load(&self.metrics.total_errors),
            total_inserts: load(&self.metrics.total_inserts),
            total_selects: load(&self.metrics.total_selects),
            queued_records: load(&self.metrics.queued_entries),
            dropped_records: load(&self.metrics.dropped_entries),
            batch_flushes: load(&self.metrics.batch_flush_count),
        }
    }

    /// Whether run records go through the batching task.
    pub fn is_async(&self) -> bool {
        self.async_config.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct DbMetricsSnapshot {
    pub total_queries: u64,
    pub total_errors: u64,
    pub total_inserts: u64,
    pub total_selects: u64,
    pub queued_records: u64,
    pub dropped_records: u64,
    pub batch_flushes: u64,
}

impl DbMetricsSnapshot {
    pub fn error_rate(&self) -> f64 {
        if self.total_queries == 0 {
            0.0
        } else {
            self.total_errors as f64 / self.total_queries as f64 * 100.0
        }
    }
}

async fn insert_record<'e, E>(record: &RunRecord, executor: E) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    match record {
        RunRecord::Sent {
            run_id,
            timestamp,
            hash,
        } => {
            sqlx::query(
                "INSERT INTO sent_transactions (run_id, timestamp, hash) VALUES (?, ?, ?)",
            )
            .bind(run_id)
            .bind(timestamp)
            .bind(hash)
            .execute(executor)
            .await?;
        }
        RunRecord::Log {
            run_id,
            timestamp,
            message,
        } => {
            sqlx::query("INSERT INTO run_logs (run_id, timestamp, message) VALUES (?, ?, ?)")
                .bind(run_id)
                .bind(timestamp)
                .bind(message)
                .execute(executor)
                .await?;
        }
    }
    Ok(())
}

/// Background worker that batches and flushes run records
///
/// This function runs in a separate tokio task and handles:
/// - Receiving records from workers via channel
/// - Batching records up to config.batch_size
/// - Periodic flushing based on config.flush_interval_ms
/// - Graceful shutdown when channel closes
async fn db_flush_worker(
    mut rx: mpsc::Receiver<RunRecord>,
    pool: SqlitePool,
    config: AsyncDbConfig,
    metrics: Arc<DbMetrics>,
) {
    let mut batch: SmallVec<[RunRecord; 64]> = SmallVec::new();
    let mut flush_interval = tokio::time::interval(Duration::from_millis(config.flush_interval_ms));

    info!(
        "Database flush worker started (batch: {}, interval: {}ms)",
        config.batch_size, config.flush_interval_ms
    );

    loop {
        tokio::select! {
            entry = rx.recv() => {
                let Some(entry) = entry else {
                    info!("Database channel closed, performing final flush");
                    break;
                };
                batch.push(entry);

                if batch.len() >= config.batch_size {
                    flush_and_count(&batch, &pool, &metrics).await;
                    batch.clear();
                }
            }

            _ = flush_interval.tick() => {
                if !batch.is_empty() {
                    flush_and_count(&batch, &pool, &metrics).await;
                    batch.clear();
                }
            }
        }
    }

    if !batch.is_empty() {
        flush_and_count(&batch, &pool, &metrics).await;
        info!("Final flush completed: {} entries", batch.len());
    }

    info!("Database flush worker stopped");
}

async fn flush_and_count(batch: &[RunRecord], pool: &SqlitePool, metrics: &DbMetrics) {
    match flush_batch(batch, pool).await {
        Ok(()) => {
            metrics.batch_flush_count.fetch_add(1, Ordering::SeqCst);
            metrics
                .total_inserts
                .fetch_add(batch.len() as u64, Ordering::SeqCst);
        }
        Err(e) => {
            metrics.total_errors.fetch_add(1, Ordering::SeqCst);
            error!("Failed to flush batch: {}", e);
        }
    }
}

/// Flush a batch of run records to SQLite in a single transaction
async fn flush_batch(batch: &[RunRecord], pool: &SqlitePool) -> Result<()> {
    if batch.is_empty() {
        return Ok(());
    }

    let start = Instant::now();
    let mut tx = pool.begin().await?;

    for record in batch {
        insert_record(record, &mut *tx).await?;
    }

    tx.commit().await?;

    let elapsed = start.elapsed();
    debug!(
        target: "database",
        "Flushed {} entries in {:.2}ms ({:.0} entries/sec)",
        batch.len(),
        elapsed.as_millis(),
        batch.len() as f64 / elapsed.as_secs_f64()
    );

    Ok(())
}
