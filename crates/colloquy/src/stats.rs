//! Counters for one conversation session
//!
//! The collector is shared between the session driver, the round coordinator
//! and the scheduler; a snapshot is attached to the final report.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Round duration percentiles in milliseconds
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoundLatency {
    pub p50: f64,
    pub p95: f64,
    pub max: f64,
}

/// Snapshot of a session's counters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionStats {
    /// Rounds that reached `Done`
    pub rounds_completed: u64,
    /// Messages this role published
    pub messages_published: u64,
    /// Messages this role consumed and acked
    pub messages_received: u64,
    /// Consume attempts across all rounds
    pub fetch_attempts: u64,
    /// Consume attempts that found the queue empty
    pub empty_polls: u64,
    /// Background task runs that failed or panicked
    pub background_failures: u64,
    /// Publishes the broker nacked
    pub publish_nacks: u64,
    /// How long rounds took
    pub round_latency_ms: RoundLatency,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SessionStats {
    /// Wall-clock time between start and finish, if both are known
    pub fn elapsed(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

/// Shared, cloneable stats recorder
#[derive(Debug, Clone)]
pub struct StatsCollector {
    stats: Arc<RwLock<SessionStats>>,
    round_samples: Arc<RwLock<Vec<u64>>>,
    max_samples: usize,
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl StatsCollector {
    /// Create a collector keeping at most `max_samples` round durations
    pub fn new(max_samples: usize) -> Self {
        Self {
            stats: Arc::new(RwLock::new(SessionStats::default())),
            round_samples: Arc::new(RwLock::new(Vec::new())),
            max_samples,
        }
    }

    pub async fn record_started(&self) {
        self.stats.write().await.started_at = Some(Utc::now());
    }

    pub async fn record_finished(&self) {
        self.stats.write().await.finished_at = Some(Utc::now());
    }

    pub async fn record_publish(&self) {
        let mut stats = self.stats.write().await;
        stats.messages_published = stats.messages_published.saturating_add(1);
    }

    pub async fn record_publish_nack(&self) {
        let mut stats = self.stats.write().await;
        stats.publish_nacks = stats.publish_nacks.saturating_add(1);
    }

    /// Record one consume attempt and whether it came back empty
    pub async fn record_fetch(&self, received: bool) {
        let mut stats = self.stats.write().await;
        stats.fetch_attempts = stats.fetch_attempts.saturating_add(1);
        if received {
            stats.messages_received = stats.messages_received.saturating_add(1);
        } else {
            stats.empty_polls = stats.empty_polls.saturating_add(1);
        }
    }

    pub async fn record_background_failure(&self) {
        let mut stats = self.stats.write().await;
        stats.background_failures = stats.background_failures.saturating_add(1);
    }

    /// Record a finished round and how long it took
    pub async fn record_round(&self, took: Duration) {
        let latency = {
            let mut samples = self.round_samples.write().await;
            samples.push(u64::try_from(took.as_millis()).unwrap_or(u64::MAX));
            if samples.len() > self.max_samples {
                let excess = samples.len() - self.max_samples;
                samples.drain(0..excess);
            }
            percentiles(&samples)
        };

        let mut stats = self.stats.write().await;
        stats.rounds_completed = stats.rounds_completed.saturating_add(1);
        stats.round_latency_ms = latency;
    }

    /// Copy of the current counters
    pub async fn snapshot(&self) -> SessionStats {
        self.stats.read().await.clone()
    }
}

fn percentiles(samples: &[u64]) -> RoundLatency {
    if samples.is_empty() {
        return RoundLatency::default();
    }

    let mut sorted = samples.to_vec();
    sorted.sort_unstable();
    let at = |fraction: f64| {
        let index = ((sorted.len() as f64) * fraction) as usize;
        sorted[index.min(sorted.len() - 1)] as f64
    };

    RoundLatency {
        p50: at(0.50),
        p95: at(0.95),
        max: sorted[sorted.len() - 1] as f64,
    }
}
