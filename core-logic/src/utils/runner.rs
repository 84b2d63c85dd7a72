use crate::traits::{Spammer, SpammerStats};
use crate::utils::logger::RESULT_TARGET;
use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Instrument};

pub struct WorkerRunner;

impl WorkerRunner {
    /// Runs `spammer` until it stops on its own or Ctrl+C is pressed, then
    /// prints the final totals.
    pub async fn run_until_ctrl_c(spammer: Arc<dyn Spammer>) -> Result<SpammerStats> {
        let token = CancellationToken::new();
        let listener_token = token.clone();
        let stopper = spammer.clone();

        let listener = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = listener_token.cancelled() => {}
                res = signal::ctrl_c() => match res {
                    Ok(()) => {
                        info!(target: RESULT_TARGET, "🛑 Received Ctrl+C. Initiating graceful shutdown...");
                        if let Err(e) = stopper.stop().await {
                            error!("Failed to stop spammer: {:?}", e);
                        }
                    }
                    Err(err) => {
                        error!("Unable to listen for shutdown signal: {}", err);
                    }
                },
            }
        });

        let start_time = std::time::Instant::now();
        let span = tracing::info_span!("engine");
        let result = spammer.start(token.clone()).instrument(span).await;

        // Release the listener if the spammer ended by itself (timeout)
        token.cancel();
        let _ = listener.await;

        let stats = result?;
        let total_duration = start_time.elapsed();
        let rate = if stats.total() > 0 {
            (stats.success as f64 / stats.total() as f64) * 100.0
        } else {
            0.0
        };

        info!(target: RESULT_TARGET, "🛑 Shutdown Complete.");
        info!(
            target: RESULT_TARGET,
            "Total Time: {:.1}s | Total Success: {} | Total Fail: {} | Success Rate: {:.2}%",
            total_duration.as_secs_f64(),
            stats.success,
            stats.failed,
            rate
        );

        Ok(stats)
    }
}
