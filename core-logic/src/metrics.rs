use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: String,
    pub uptime_secs: f64,
    pub transactions: TransactionMetrics,
    pub references: ReferenceMetrics,
    pub cache: CacheMetrics,
    pub relay_dropped: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionMetrics {
    pub succeeded: u64,
    pub failed: u64,
    pub tps: f64,
    pub success_rate: f64,
    pub error_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceMetrics {
    pub bad_trunk: u64,
    pub bad_branch: u64,
    pub bad_trunk_and_branch: u64,
    pub milestone_trunk: u64,
    pub milestone_branch: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
}

/// Counters for a single spam run.
///
/// Not synchronized: exactly one task owns an instance and everybody else
/// talks to that task.
#[derive(Debug, Clone)]
pub struct RunMetrics {
    pub succeeded: u64,
    pub failed: u64,
    pub bad_trunk: u64,
    pub bad_branch: u64,
    pub bad_trunk_and_branch: u64,
    pub milestone_trunk: u64,
    pub milestone_branch: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub relay_dropped: u64,
    start_time: Instant,
    end_time: Option<Instant>,
}

impl Default for RunMetrics {
    fn default() -> Self {
        Self::started_at(Instant::now())
    }
}

impl RunMetrics {
    pub fn started_at(start_time: Instant) -> Self {
        Self {
            succeeded: 0,
            failed: 0,
            bad_trunk: 0,
            bad_branch: 0,
            bad_trunk_and_branch: 0,
            milestone_trunk: 0,
            milestone_branch: 0,
            cache_hits: 0,
            cache_misses: 0,
            relay_dropped: 0,
            start_time,
            end_time: None,
        }
    }

    /// Freeze the clock. Later calls keep the first end instant.
    pub fn finish(&mut self) {
        self.end_time.get_or_insert_with(Instant::now);
    }

    pub fn is_finished(&self) -> bool {
        self.end_time.is_some()
    }

    /// Time since the run started, or the run length once finished.
    pub fn uptime(&self) -> Duration {
        match self.end_time {
            Some(end) => end.duration_since(self.start_time),
            None => self.start_time.elapsed(),
        }
    }

    /// Successful transactions per second since the run started.
    pub fn tps(&self) -> f64 {
        self.tps_over(self.uptime())
    }

    pub fn tps_over(&self, elapsed: Duration) -> f64 {
        let secs = elapsed.as_secs_f64();
        if secs > 0.0 {
            self.succeeded as f64 / secs
        } else {
            0.0
        }
    }

    /// Percentage of finished transactions that succeeded.
    pub fn success_rate(&self) -> f64 {
        let total = self.succeeded + self.failed;
        if total > 0 {
            self.succeeded as f64 / total as f64 * 100.0
        } else {
            0.0
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.succeeded + self.failed == 0 {
            0.0
        } else {
            100.0 - self.success_rate()
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let uptime = self.uptime();
        MetricsSnapshot {
            timestamp: Utc::now().to_rfc3339(),
            uptime_secs: uptime.as_secs_f64(),
            transactions: TransactionMetrics {
                succeeded: self.succeeded,
                failed: self.failed,
                tps: self.tps_over(uptime),
                success_rate: self.success_rate(),
                error_rate: self.error_rate(),
            },
            references: ReferenceMetrics {
                bad_trunk: self.bad_trunk,
                bad_branch: self.bad_branch,
                bad_trunk_and_branch: self.bad_trunk_and_branch,
                milestone_trunk: self.milestone_trunk,
                milestone_branch: self.milestone_branch,
            },
            cache: CacheMetrics {
                hits: self.cache_hits,
                misses: self.cache_misses,
            },
            relay_dropped: self.relay_dropped,
        }
    }

    pub fn to_json(&self) -> String {
        let snapshot = self.snapshot();
        serde_json::to_string_pretty(&snapshot).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn to_compact_json(&self) -> String {
        let snapshot = self.snapshot();
        serde_json::to_string(&snapshot).unwrap_or_else(|_| "{}".to_string())
    }

    pub async fn export_to_file(&self, path: &str) -> std::io::Result<()> {
        let json = self.to_json();
        tokio::fs::write(path, json).await
    }
}
