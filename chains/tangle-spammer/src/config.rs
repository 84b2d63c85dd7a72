//! Configuration for tangle-spammer
//!
//! [`TangleSpammerConfig`] is the on-disk TOML form. It is turned into an
//! [`EngineConfig`] through [`EngineConfigBuilder`], which validates every
//! field; the engine never sees an unvalidated value.

use anyhow::{Context, Result};
use core_logic::ConfigError;
use serde::Deserialize;
use std::fs;
use std::time::Duration;
use url::Url;

use crate::assembler::ReferenceFilters;
use crate::error::SpamError;
use crate::strategy::StrategyKind;
use crate::types::{
    is_trytes, normalize_address, Node, SecurityLevel, HASH_LEN, MILESTONE_ADDRESS, TAG_LEN,
};

pub const DEFAULT_NODE: &str = "http://localhost:14625";
pub const DEFAULT_DESTINATION: &str =
    "SPPRLTTIVYUONPOPQSWGCPMZWDOMQGWFUEPKUQIVUKROCHRNCR9MXNGNQSAGLKUDX9MZQWCPFJQS9DWAY";
pub const DEFAULT_TAG: &str = "999SPAMALOT";
pub const DEFAULT_MESSAGE: &str = "GOSPAMMER9VERSION9ONE9THREE";
pub const DEFAULT_STRATEGY: &str = "non zero promote";
pub const DEFAULT_SIGNER: &str = "http://localhost:14700";

/// Longest message that fits one signature fragment.
const MAX_MESSAGE_LEN: usize = 2187;

/// Reference filters as written in the config file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub trunk: bool,
    pub branch: bool,
    pub milestone: bool,
}

impl From<FilterConfig> for ReferenceFilters {
    fn from(f: FilterConfig) -> Self {
        ReferenceFilters {
            trunk: f.trunk,
            branch: f.branch,
            milestone: f.milestone,
        }
    }
}

/// Configuration file for the tangle spammer
#[derive(Debug, Clone, Deserialize)]
pub struct TangleSpammerConfig {
    /// Node API URLs
    #[serde(default = "default_nodes")]
    pub nodes: Vec<String>,
    /// URL of a JSON node list to add to `nodes`
    #[serde(default)]
    pub nodelist: Option<String>,
    /// Keep only nodes that accept remote PoW
    #[serde(default)]
    pub only_with_pow: bool,
    /// Probe nodes for remote PoW support at startup
    #[serde(default = "default_true")]
    pub probe_nodes: bool,
    #[serde(default = "default_discovery_concurrency")]
    pub discovery_concurrency: usize,

    #[serde(default = "default_mwm")]
    pub mwm: u32,
    /// Tip-selection walk depth
    #[serde(default = "default_depth")]
    pub depth: u32,
    #[serde(default)]
    pub security_level: SecurityLevel,

    #[serde(default = "default_destination")]
    pub destination: String,
    #[serde(default = "default_tag")]
    pub tag: String,
    #[serde(default = "default_message")]
    pub message: String,
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default)]
    pub filters: FilterConfig,
    #[serde(default = "default_milestone_address")]
    pub milestone_address: String,

    /// Do PoW locally (through the signer) rather than on the node
    #[serde(default = "default_true")]
    pub local_pow: bool,
    /// Signer / PoW service endpoint
    #[serde(default = "default_signer")]
    pub signer_url: String,

    /// Stop after this many seconds (0 = run until interrupted)
    #[serde(default)]
    pub timeout_secs: u64,
    /// Per-node pause after each successful broadcast, in seconds
    #[serde(default)]
    pub cooldown_secs: u64,
    #[serde(default)]
    pub verbose: bool,

    #[serde(default = "default_true")]
    pub use_database: bool,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    /// Write the final metrics snapshot here as JSON
    #[serde(default)]
    pub export_metrics: Option<String>,
}

fn default_nodes() -> Vec<String> {
    vec![DEFAULT_NODE.to_string()]
}

fn default_true() -> bool {
    true
}

fn default_discovery_concurrency() -> usize {
    16
}

fn default_mwm() -> u32 {
    14
}

fn default_depth() -> u32 {
    3
}

fn default_destination() -> String {
    DEFAULT_DESTINATION.to_string()
}

fn default_tag() -> String {
    DEFAULT_TAG.to_string()
}

fn default_message() -> String {
    DEFAULT_MESSAGE.to_string()
}

fn default_strategy() -> String {
    DEFAULT_STRATEGY.to_string()
}

fn default_milestone_address() -> String {
    MILESTONE_ADDRESS.to_string()
}

fn default_signer() -> String {
    DEFAULT_SIGNER.to_string()
}

fn default_database_path() -> String {
    "spamalot.db".to_string()
}

impl Default for TangleSpammerConfig {
    fn default() -> Self {
        Self {
            nodes: default_nodes(),
            nodelist: None,
            only_with_pow: false,
            probe_nodes: true,
            discovery_concurrency: default_discovery_concurrency(),
            mwm: default_mwm(),
            depth: default_depth(),
            security_level: SecurityLevel::default(),
            destination: default_destination(),
            tag: default_tag(),
            message: default_message(),
            strategy: default_strategy(),
            filters: FilterConfig::default(),
            milestone_address: default_milestone_address(),
            local_pow: true,
            signer_url: default_signer(),
            timeout_secs: 0,
            cooldown_secs: 0,
            verbose: false,
            use_database: true,
            database_path: default_database_path(),
            export_metrics: None,
        }
    }
}

impl TangleSpammerConfig {
    /// Load configuration from a TOML file
    ///
    /// # Example
    /// ```ignore
    /// let config = TangleSpammerConfig::from_path("config/config.toml")?;
    /// ```
    pub fn from_path(path: &str) -> Result<Self> {
        let content =
            fs::read_to_string(path).context(format!("Failed to read config from {}", path))?;
        toml::from_str(&content).context("Failed to parse config TOML")
    }

    /// Builder pre-filled with everything but the nodes, which come from
    /// discovery.
    pub fn engine_builder(&self) -> EngineConfigBuilder {
        let mut builder = EngineConfig::builder()
            .mwm(self.mwm)
            .depth(self.depth)
            .security_level(self.security_level)
            .destination(&self.destination)
            .tag(&self.tag)
            .message(&self.message)
            .strategy(&self.strategy)
            .filters(self.filters.clone().into())
            .milestone_address(&self.milestone_address)
            .local_pow(self.local_pow)
            .verbose(self.verbose);
        if self.timeout_secs > 0 {
            builder = builder.timeout(Duration::from_secs(self.timeout_secs));
        }
        if self.cooldown_secs > 0 {
            builder = builder.cooldown(Duration::from_secs(self.cooldown_secs));
        }
        builder
    }
}

/// Validated engine settings. Fixed for the lifetime of an engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub nodes: Vec<Node>,
    pub mwm: u32,
    pub depth: u32,
    pub security_level: SecurityLevel,
    /// 81-tryte address, checksum stripped
    pub destination: String,
    pub tag: String,
    pub message: String,
    pub strategy: StrategyKind,
    pub filters: ReferenceFilters,
    pub milestone_address: String,
    pub local_pow: bool,
    pub timeout: Option<Duration>,
    pub cooldown: Option<Duration>,
    pub verbose: bool,
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Re-check invariants. `build()` already does this.
    pub fn validate(&self) -> Result<(), SpamError> {
        if self.nodes.is_empty() {
            return Err(ConfigError::MissingField {
                field: "nodes".into(),
            }
            .into());
        }
        for node in &self.nodes {
            Url::parse(&node.url).map_err(|_| ConfigError::InvalidNodeUrl {
                url: node.url.clone(),
            })?;
        }
        if self.mwm == 0 {
            return Err(SpamError::invalid("mwm", "must be at least 1"));
        }
        if self.destination.len() != HASH_LEN || !is_trytes(&self.destination) {
            return Err(SpamError::invalid("destination", "not an 81-tryte address"));
        }
        if self.tag.len() > TAG_LEN || !is_trytes(&self.tag) {
            return Err(SpamError::invalid(
                "tag",
                format!("must be at most {} trytes", TAG_LEN),
            ));
        }
        if self.message.len() > MAX_MESSAGE_LEN || !is_trytes(&self.message) {
            return Err(SpamError::invalid(
                "message",
                format!("must be at most {} trytes", MAX_MESSAGE_LEN),
            ));
        }
        if self.milestone_address.len() != HASH_LEN || !is_trytes(&self.milestone_address) {
            return Err(SpamError::invalid(
                "milestone_address",
                "not an 81-tryte address",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfigBuilder {
    nodes: Vec<Node>,
    mwm: u32,
    depth: u32,
    security_level: SecurityLevel,
    destination: String,
    tag: String,
    message: String,
    strategy: String,
    filters: ReferenceFilters,
    milestone_address: String,
    local_pow: bool,
    timeout: Option<Duration>,
    cooldown: Option<Duration>,
    verbose: bool,
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            mwm: default_mwm(),
            depth: default_depth(),
            security_level: SecurityLevel::default(),
            destination: default_destination(),
            tag: default_tag(),
            message: default_message(),
            strategy: String::new(),
            filters: ReferenceFilters::default(),
            milestone_address: default_milestone_address(),
            local_pow: true,
            timeout: None,
            cooldown: None,
            verbose: false,
        }
    }
}

impl EngineConfigBuilder {
    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn nodes(mut self, nodes: impl IntoIterator<Item = Node>) -> Self {
        self.nodes.extend(nodes);
        self
    }

    pub fn mwm(mut self, mwm: u32) -> Self {
        self.mwm = mwm;
        self
    }

    pub fn depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    pub fn security_level(mut self, level: SecurityLevel) -> Self {
        self.security_level = level;
        self
    }

    pub fn destination(mut self, address: &str) -> Self {
        self.destination = address.to_string();
        self
    }

    pub fn tag(mut self, tag: &str) -> Self {
        self.tag = tag.to_string();
        self
    }

    pub fn message(mut self, message: &str) -> Self {
        self.message = message.to_string();
        self
    }

    /// Strategy by name; unknown names fail in [`build`](Self::build).
    pub fn strategy(mut self, name: &str) -> Self {
        self.strategy = name.to_string();
        self
    }

    pub fn filters(mut self, filters: ReferenceFilters) -> Self {
        self.filters = filters;
        self
    }

    pub fn milestone_address(mut self, address: &str) -> Self {
        self.milestone_address = address.to_string();
        self
    }

    pub fn local_pow(mut self, local_pow: bool) -> Self {
        self.local_pow = local_pow;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = Some(cooldown);
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn build(self) -> Result<EngineConfig, SpamError> {
        let destination = normalize_address(&self.destination)
            .map_err(|e| SpamError::invalid("destination", e.to_string()))?;
        let strategy = self.strategy.parse::<StrategyKind>()?;

        let config = EngineConfig {
            nodes: self.nodes,
            mwm: self.mwm,
            depth: self.depth,
            security_level: self.security_level,
            destination,
            tag: self.tag,
            message: self.message,
            strategy,
            filters: self.filters,
            milestone_address: self.milestone_address,
            local_pow: self.local_pow,
            timeout: self.timeout.filter(|d| !d.is_zero()),
            cooldown: self.cooldown.filter(|d| !d.is_zero()),
            verbose: self.verbose,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn node() -> Node {
        Node::new(DEFAULT_NODE, false)
    }

    #[test]
    fn test_defaults_match_cli_defaults() {
        let cfg = TangleSpammerConfig::default();
        assert_eq!(cfg.nodes, vec![DEFAULT_NODE.to_string()]);
        assert_eq!(cfg.mwm, 14);
        assert_eq!(cfg.depth, 3);
        assert_eq!(cfg.security_level, SecurityLevel::Medium);
        assert_eq!(cfg.strategy, "non zero promote");
        assert!(cfg.local_pow);
        assert!(cfg.probe_nodes);

        let engine = cfg.engine_builder().node(node()).build().unwrap();
        assert_eq!(engine.strategy, StrategyKind::NonZeroPromote);
        assert_eq!(engine.timeout, None);
        assert_eq!(engine.cooldown, None);
    }

    #[test]
    fn test_from_path_reads_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
nodes = ["http://a:14265", "http://b:14265"]
mwm = 9
strategy = "approve"
timeout_secs = 30
security_level = 3

[filters]
trunk = true
milestone = true
"#
        )
        .unwrap();

        let cfg = TangleSpammerConfig::from_path(file.path().to_str().unwrap()).unwrap();
        assert_eq!(cfg.nodes.len(), 2);
        assert_eq!(cfg.mwm, 9);
        assert_eq!(cfg.security_level, SecurityLevel::High);
        assert!(cfg.filters.trunk && cfg.filters.milestone && !cfg.filters.branch);
        assert_eq!(cfg.tag, DEFAULT_TAG);

        let engine = cfg.engine_builder().node(node()).build().unwrap();
        assert_eq!(engine.strategy, StrategyKind::ApproveTips);
        assert_eq!(engine.timeout, Some(Duration::from_secs(30)));
        assert!(engine.filters.trunk);
    }

    #[test]
    fn test_empty_file_equals_default() {
        let parsed: TangleSpammerConfig = toml::from_str("").unwrap();
        let default = TangleSpammerConfig::default();
        assert_eq!(parsed.nodes, default.nodes);
        assert_eq!(parsed.strategy, default.strategy);
        assert_eq!(parsed.database_path, default.database_path);
        assert_eq!(parsed.use_database, default.use_database);
    }

    #[test]
    fn test_bad_security_level_fails_to_parse() {
        assert!(toml::from_str::<TangleSpammerConfig>("security_level = 4").is_err());
        assert!(TangleSpammerConfig::from_path("/nonexistent/config.toml").is_err());
    }

    #[test]
    fn test_build_rejects_invalid_settings() {
        assert!(matches!(
            EngineConfig::builder().build(),
            Err(SpamError::Configuration(ConfigError::MissingField { .. }))
        ));
        assert!(EngineConfig::builder()
            .node(node())
            .strategy("fastest")
            .build()
            .is_err());
        assert!(EngineConfig::builder()
            .node(node())
            .tag("lowercase")
            .build()
            .is_err());
        assert!(EngineConfig::builder()
            .node(node())
            .tag(&"A".repeat(28))
            .build()
            .is_err());
        assert!(EngineConfig::builder()
            .node(node())
            .destination("SHORT")
            .build()
            .is_err());
        assert!(EngineConfig::builder().node(node()).mwm(0).build().is_err());
        assert!(EngineConfig::builder()
            .node(Node::new("not a url", false))
            .build()
            .is_err());
    }

    #[test]
    fn test_checksum_is_stripped_and_zero_durations_dropped() {
        let with_checksum = format!("{}ABCDEFGHI", DEFAULT_DESTINATION);
        let cfg = EngineConfig::builder()
            .node(node())
            .destination(&with_checksum)
            .cooldown(Duration::ZERO)
            .build()
            .unwrap();
        assert_eq!(cfg.destination, DEFAULT_DESTINATION);
        assert_eq!(cfg.cooldown, None);
    }
}
