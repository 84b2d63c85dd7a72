use anyhow::Result;
use async_trait::async_trait;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SpammerStats {
    pub success: u64,
    pub failed: u64,
}

impl SpammerStats {
    pub fn total(&self) -> u64 {
        self.success + self.failed
    }
}

/// Lifecycle of a long-running spam engine.
#[async_trait]
pub trait Spammer: Send + Sync {
    /// Run until `cancellation_token` fires or [`Spammer::stop`] is called.
    ///
    /// A spammer runs at most once; a second call returns an error.
    async fn start(
        &self,
        cancellation_token: tokio_util::sync::CancellationToken,
    ) -> Result<SpammerStats>;

    /// Stop the spamming process and wait until it has fully wound down.
    async fn stop(&self) -> Result<()>;

    fn is_running(&self) -> bool;
}
