use anyhow::{bail, Context, Result};
use clap::Parser;
use core_logic::database::{AsyncDbConfig, DatabaseManager, FallbackStrategy};
use core_logic::{setup_logger, LoggerOptions, WorkerRunner, RESULT_TARGET};
use dotenv::dotenv;
use std::path::Path;
use std::sync::Arc;
use tangle_spammer::config::TangleSpammerConfig as Config;
use tangle_spammer::discovery::{check_nodes, dedupe_urls, fetch_node_list};
use tangle_spammer::{
    Engine, HttpConnector, MemoryStore, Node, ReferenceStore, SecurityLevel, SignerClient,
    SqliteStore,
};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Zero-value transaction spammer for IOTA nodes", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config/config.toml")]
    config: String,

    /// Node API URL (repeatable)
    #[arg(long = "node")]
    nodes: Vec<String>,

    /// URL of a JSON node list
    #[arg(long)]
    nodelist: Option<String>,

    /// Drop nodes that do not support remote PoW
    #[arg(long)]
    only_with_pow: bool,

    #[arg(long)]
    mwm: Option<u32>,

    #[arg(long)]
    depth: Option<u32>,

    /// Stop after this many seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Seconds each node waits after a successful broadcast
    #[arg(long)]
    cooldown: Option<u64>,

    #[arg(long = "security-lvl")]
    security_lvl: Option<u8>,

    /// Destination address
    #[arg(long)]
    dest: Option<String>,

    #[arg(long)]
    tag: Option<String>,

    #[arg(long)]
    msg: Option<String>,

    /// Let nodes that support it do the PoW
    #[arg(long, conflicts_with = "local_pow")]
    remote_pow: bool,

    #[arg(long)]
    local_pow: Option<bool>,

    /// Signer / PoW service URL
    #[arg(long)]
    signer: Option<String>,

    /// "approve" or "non zero promote"
    #[arg(long)]
    strategy: Option<String>,

    /// Skip tips whose trunk is our own transaction
    #[arg(long)]
    filter_trunk: bool,

    /// Skip tips whose branch is our own transaction
    #[arg(long)]
    filter_branch: bool,

    /// Skip tips referencing a milestone
    #[arg(long)]
    filter_milestone: bool,

    #[arg(short, long)]
    verbose: bool,

    /// SQLite database path
    #[arg(long)]
    db: Option<String>,

    /// Keep the reference cache in memory only
    #[arg(long)]
    no_db: bool,

    /// Write final metrics as JSON to this file
    #[arg(long)]
    export_metrics: Option<String>,
}

impl Args {
    /// Command-line values win over the file.
    fn apply(self, mut config: Config) -> Config {
        if !self.nodes.is_empty() {
            config.nodes = self.nodes;
        }
        if self.nodelist.is_some() {
            config.nodelist = self.nodelist;
        }
        config.only_with_pow |= self.only_with_pow;
        if let Some(mwm) = self.mwm {
            config.mwm = mwm;
        }
        if let Some(depth) = self.depth {
            config.depth = depth;
        }
        if let Some(timeout) = self.timeout {
            config.timeout_secs = timeout;
        }
        if let Some(cooldown) = self.cooldown {
            config.cooldown_secs = cooldown;
        }
        if let Some(dest) = self.dest {
            config.destination = dest;
        }
        if let Some(tag) = self.tag {
            config.tag = tag;
        }
        if let Some(msg) = self.msg {
            config.message = msg;
        }
        if self.remote_pow {
            config.local_pow = false;
        }
        if let Some(local_pow) = self.local_pow {
            config.local_pow = local_pow;
        }
        if let Some(signer) = self.signer {
            config.signer_url = signer;
        }
        if let Some(strategy) = self.strategy {
            config.strategy = strategy;
        }
        config.filters.trunk |= self.filter_trunk;
        config.filters.branch |= self.filter_branch;
        config.filters.milestone |= self.filter_milestone;
        config.verbose |= self.verbose;
        if let Some(db) = self.db {
            config.database_path = db;
        }
        if self.no_db {
            config.use_database = false;
        }
        if self.export_metrics.is_some() {
            config.export_metrics = self.export_metrics;
        }
        config
    }
}

fn load_config(path: &str) -> Result<Config> {
    // Auto-detect config path when run from the workspace root
    let fallback = "chains/tangle-spammer/config/config.toml";
    if Path::new(path).exists() {
        Config::from_path(path)
    } else if path == "config/config.toml" && Path::new(fallback).exists() {
        Config::from_path(fallback)
    } else {
        Ok(Config::default())
    }
}

async fn discover_nodes(config: &Config) -> Result<Vec<Node>> {
    let mut urls = Vec::new();
    if let Some(list) = &config.nodelist {
        urls.extend(fetch_node_list(list).await?);
    }
    urls.extend(config.nodes.iter().cloned());

    if !config.probe_nodes {
        return Ok(dedupe_urls(urls)
            .into_iter()
            .map(|url| Node::new(url, false))
            .collect());
    }
    Ok(check_nodes(urls, config.discovery_concurrency, config.only_with_pow).await)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    let args = Args::parse();
    let security_lvl = args.security_lvl;
    let file_config = load_config(&args.config)?;
    let config = args.apply(file_config);

    let _log_guard = setup_logger(LoggerOptions {
        verbose: config.verbose,
        ..Default::default()
    });

    println!(
        r#"
        ╔════════════════════════════════════════════════════════════╗
        ║                TANGLE SPAMMER - LIVE LOG                   ║
        ╚════════════════════════════════════════════════════════════╝
        "#
    );

    let nodes = discover_nodes(&config).await?;
    if nodes.is_empty() {
        bail!("No usable nodes");
    }
    for node in &nodes {
        info!(target: RESULT_TARGET, "Node: {}", node);
    }

    let mut builder = config.engine_builder().nodes(nodes);
    if let Some(level) = security_lvl {
        let level = SecurityLevel::try_from(level).map_err(anyhow::Error::msg)?;
        builder = builder.security_level(level);
    }
    let engine_config = builder.build().context("Invalid configuration")?;

    info!(target: RESULT_TARGET, "Strategy: {}", engine_config.strategy);
    info!(target: RESULT_TARGET, "MWM: {} | Depth: {}", engine_config.mwm, engine_config.depth);
    if engine_config.local_pow {
        info!(target: RESULT_TARGET, "PoW: signer at {}", config.signer_url);
    } else {
        info!(target: RESULT_TARGET, "PoW: remote where supported, signer at {} otherwise", config.signer_url);
    }

    let database = if config.use_database {
        let db = DatabaseManager::new_with_async(
            &config.database_path,
            AsyncDbConfig::default(),
            FallbackStrategy::Hybrid,
        )
        .await
        .context("Failed to open database")?;
        Some(Arc::new(db))
    } else {
        None
    };

    let store: Arc<dyn ReferenceStore> = match &database {
        Some(db) => Arc::new(SqliteStore::new(db.clone())),
        None => Arc::new(MemoryStore::new()),
    };

    let signer = Arc::new(SignerClient::new(&config.signer_url)?);
    let engine = Arc::new(
        Engine::new(
            engine_config,
            Arc::new(HttpConnector::default()),
            signer.clone(),
            signer,
        )
        .with_store(store),
    );

    let outcome = WorkerRunner::run_until_ctrl_c(engine.clone()).await;

    if let Some(path) = &config.export_metrics {
        match engine.final_metrics().await {
            Some(metrics) => match metrics.export_to_file(path).await {
                Ok(()) => info!(target: RESULT_TARGET, "Metrics written to {}", path),
                Err(e) => warn!("Failed to export metrics to {}: {}", path, e),
            },
            None => warn!("No metrics to export"),
        }
    }

    // The engine holds the store, which holds the database
    drop(engine);
    if let Some(db) = database {
        let stats = db.get_metrics();
        info!(
            target: RESULT_TARGET,
            "Database: {} queries | {} errors ({:.2}%) | {} records queued, {} dropped",
            stats.total_queries,
            stats.total_errors,
            stats.error_rate(),
            stats.queued_records,
            stats.dropped_records
        );
        match Arc::try_unwrap(db) {
            Ok(db) => db.shutdown().await?,
            Err(_) => warn!("Database still in use, skipping flush"),
        }
    }

    if let Err(e) = &outcome {
        error!("Spammer failed: {:#}", e);
    }
    outcome.map(|_| ())
}
