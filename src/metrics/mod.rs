//! Process metrics
//!
//! Lightweight atomic counters surfaced on the health endpoint. Handed
//! around as an explicit `Arc<Metrics>`; nothing here is a global.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    pub sessions_started: AtomicU64,
    pub sessions_stopped: AtomicU64,
    pub sessions_deadline_killed: AtomicU64,
    pub sessions_resource_killed: AtomicU64,
    pub upstream_reconnects: AtomicU64,
    pub playlist_promotions: AtomicU64,
    pub zombie_workers: AtomicU64,
    pub intents_rejected_circuit_open: AtomicU64,
    /// Labelled decision counter, keyed by (mode, protocol, primary reason)
    decisions: Mutex<HashMap<(String, String, String), u64>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub sessions_started: u64,
    pub sessions_stopped: u64,
    pub sessions_deadline_killed: u64,
    pub sessions_resource_killed: u64,
    pub upstream_reconnects: u64,
    pub playlist_promotions: u64,
    pub zombie_workers: u64,
    pub intents_rejected_circuit_open: u64,
    pub decisions: Vec<DecisionCount>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DecisionCount {
    pub mode: String,
    pub protocol: String,
    pub primary_reason: String,
    pub count: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics::default()
    }

    /// Exactly one increment per decision, labelled like the decision span
    pub fn record_decision(&self, mode: &str, protocol: &str, primary_reason: &str) {
        let mut decisions = self.decisions.lock().expect("metrics mutex poisoned");
        *decisions
            .entry((
                mode.to_string(),
                protocol.to_string(),
                primary_reason.to_string(),
            ))
            .or_insert(0) += 1;
    }

    pub fn decision_count(&self, mode: &str, protocol: &str, primary_reason: &str) -> u64 {
        let decisions = self.decisions.lock().expect("metrics mutex poisoned");
        decisions
            .get(&(
                mode.to_string(),
                protocol.to_string(),
                primary_reason.to_string(),
            ))
            .copied()
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let decisions = self.decisions.lock().expect("metrics mutex poisoned");
        let mut counts: Vec<DecisionCount> = decisions
            .iter()
            .map(|((mode, protocol, reason), count)| DecisionCount {
                mode: mode.clone(),
                protocol: protocol.clone(),
                primary_reason: reason.clone(),
                count: *count,
            })
            .collect();
        counts.sort_by(|a, b| b.count.cmp(&a.count));

        MetricsSnapshot {
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            sessions_stopped: self.sessions_stopped.load(Ordering::Relaxed),
            sessions_deadline_killed: self.sessions_deadline_killed.load(Ordering::Relaxed),
            sessions_resource_killed: self.sessions_resource_killed.load(Ordering::Relaxed),
            upstream_reconnects: self.upstream_reconnects.load(Ordering::Relaxed),
            playlist_promotions: self.playlist_promotions.load(Ordering::Relaxed),
            zombie_workers: self.zombie_workers.load(Ordering::Relaxed),
            intents_rejected_circuit_open: self
                .intents_rejected_circuit_open
                .load(Ordering::Relaxed),
            decisions: counts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_counter_accumulates_per_label() {
        let metrics = Metrics::new();
        metrics.record_decision("deny", "none", "container_not_supported_by_client");
        metrics.record_decision("deny", "none", "container_not_supported_by_client");
        metrics.record_decision("transcode", "hls", "transcode_allowed_by_policy");

        assert_eq!(
            metrics.decision_count("deny", "none", "container_not_supported_by_client"),
            2
        );
        assert_eq!(
            metrics.decision_count("transcode", "hls", "transcode_allowed_by_policy"),
            1
        );
        assert_eq!(metrics.snapshot().decisions.len(), 2);
    }
}
