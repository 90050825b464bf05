//! In-process metrics for the execution engine.
//!
//! Counters and gauges are keyed by name; the names used by the engine are
//! the constants below. Latency samples are kept in a bounded window.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

pub const ORDERS_ATTEMPTED: &str = "engine_orders_attempted_total";
pub const ORDERS_FILLED: &str = "engine_orders_filled_total";
pub const ORDERS_FAILED: &str = "engine_orders_failed_total";
pub const ORDERS_UNCERTAIN: &str = "engine_orders_uncertain_total";
pub const EXECUTION_RETRIES: &str = "engine_execution_retries_total";
pub const DECIMALS_CACHE_HITS: &str = "engine_decimals_cache_hits_total";
pub const DECIMALS_CACHE_MISSES: &str = "engine_decimals_cache_misses_total";
pub const CANDIDATES_RECEIVED: &str = "engine_candidates_received_total";
pub const CANDIDATES_FILTERED: &str = "engine_candidates_filtered_total";
pub const RISK_REJECTIONS: &str = "engine_risk_rejections_total";
pub const OPEN_POSITIONS: &str = "engine_open_positions";
pub const EXECUTION_SECONDS: &str = "engine_execution_duration_seconds";

const MAX_SAMPLES: usize = 1_000;

/// Metrics collector shared by the engine components.
#[derive(Default)]
pub struct MetricsCollector {
    metrics: RwLock<InternalMetrics>,
}

#[derive(Debug, Default)]
struct InternalMetrics {
    counters: HashMap<String, u64>,
    gauges: HashMap<String, f64>,
    samples: HashMap<String, VecDeque<f64>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn increment_counter(&self, name: &str) {
        self.add_to_counter(name, 1).await;
    }

    pub async fn add_to_counter(&self, name: &str, value: u64) {
        let mut metrics = self.metrics.write().await;
        *metrics.counters.entry(name.to_string()).or_insert(0) += value;
    }

    pub async fn set_gauge(&self, name: &str, value: f64) {
        let mut metrics = self.metrics.write().await;
        metrics.gauges.insert(name.to_string(), value);
        debug!("Set gauge {}: {}", name, value);
    }

    pub async fn record_duration(&self, name: &str, duration: Duration) {
        let mut metrics = self.metrics.write().await;
        let window = metrics.samples.entry(name.to_string()).or_default();
        window.push_back(duration.as_secs_f64());
        while window.len() > MAX_SAMPLES {
            window.pop_front();
        }
    }

    pub async fn counter(&self, name: &str) -> u64 {
        self.metrics.read().await.counters.get(name).copied().unwrap_or(0)
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        let metrics = self.metrics.read().await;
        let mean_durations = metrics
            .samples
            .iter()
            .filter(|(_, window)| !window.is_empty())
            .map(|(name, window)| (name.clone(), window.iter().sum::<f64>() / window.len() as f64))
            .collect();

        MetricsSnapshot {
            counters: metrics.counters.clone(),
            gauges: metrics.gauges.clone(),
            mean_durations,
            taken_at: Instant::now(),
        }
    }
}

/// Point-in-time copy of all metrics.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, u64>,
    pub gauges: HashMap<String, f64>,
    /// Mean of the retained samples, in seconds
    pub mean_durations: HashMap<String, f64>,
    pub taken_at: Instant,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counters_accumulate() {
        let collector = MetricsCollector::new();

        collector.increment_counter(ORDERS_FILLED).await;
        collector.increment_counter(ORDERS_FILLED).await;
        collector.add_to_counter(EXECUTION_RETRIES, 3).await;

        assert_eq!(collector.counter(ORDERS_FILLED).await, 2);
        assert_eq!(collector.counter(EXECUTION_RETRIES).await, 3);
        assert_eq!(collector.counter(ORDERS_FAILED).await, 0);
    }

    #[tokio::test]
    async fn test_snapshot_means_durations() {
        let collector = MetricsCollector::new();

        collector.record_duration(EXECUTION_SECONDS, Duration::from_millis(100)).await;
        collector.record_duration(EXECUTION_SECONDS, Duration::from_millis(300)).await;
        collector.set_gauge(OPEN_POSITIONS, 2.0).await;

        let snapshot = collector.snapshot().await;
        let mean = snapshot.mean_durations.get(EXECUTION_SECONDS).unwrap();
        assert!((mean - 0.2).abs() < 1e-9);
        assert_eq!(snapshot.gauges.get(OPEN_POSITIONS), Some(&2.0));
    }
}
