use core_logic::ConfigError;
use std::fmt;
use thiserror::Error;

use crate::types::TrytesError;

/// Which side of a tip pair an assembly rejection refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceSide {
    Trunk,
    Branch,
    Both,
}

impl fmt::Display for ReferenceSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReferenceSide::Trunk => f.write_str("trunk"),
            ReferenceSide::Branch => f.write_str("branch"),
            ReferenceSide::Both => f.write_str("trunk and branch"),
        }
    }
}

#[derive(Error, Debug)]
pub enum SpamError {
    /// A node call failed; the caller retries from the top.
    #[error("fetch from {endpoint} failed: {reason}")]
    TransientFetch { endpoint: String, reason: String },

    #[error("{side} transaction tag is ours")]
    SelfReference { side: ReferenceSide },

    #[error("{side} transaction is a milestone")]
    MilestoneReference { side: ReferenceSide },

    #[error("finalizing bundle failed: {0}")]
    Finalization(String),

    #[error("broadcast to {endpoint} failed: {reason}")]
    Broadcast { endpoint: String, reason: String },

    #[error("preparing bundle failed: {0}")]
    Preparation(String),

    #[error(transparent)]
    Configuration(#[from] ConfigError),

    #[error("spammer was already started")]
    AlreadyStarted,

    #[error("reference store error: {0}")]
    Store(String),
}

impl SpamError {
    pub fn transient(endpoint: &str, err: impl fmt::Display) -> Self {
        SpamError::TransientFetch {
            endpoint: endpoint.to_string(),
            reason: err.to_string(),
        }
    }

    pub fn invalid(field: &str, reason: impl Into<String>) -> Self {
        SpamError::Configuration(ConfigError::InvalidValue {
            field: field.to_string(),
            reason: reason.into(),
        })
    }

    /// Rejections produced by the reference filter.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            SpamError::SelfReference { .. } | SpamError::MilestoneReference { .. }
        )
    }
}

impl From<TrytesError> for SpamError {
    fn from(e: TrytesError) -> Self {
        SpamError::Finalization(e.to_string())
    }
}
