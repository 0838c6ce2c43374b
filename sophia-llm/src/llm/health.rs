//! Per-provider health statistics.
//!
//! Latency is an exponential moving average (0.9 old, 0.1 new). The first
//! successful call seeds the average directly.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::Provider;

/// Weight kept from the previous latency average.
const LATENCY_SMOOTHING: f64 = 0.9;

/// Rolling statistics for one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderStats {
    /// EMA of observed latency in milliseconds
    pub latency_avg: f64,
    /// (total_requests - error_count) / total_requests
    pub success_rate: f64,
    pub error_count: u64,
    pub total_requests: u64,
    /// Successful requests, used to detect the first success
    pub successes: u64,
    pub last_error_time: Option<DateTime<Utc>>,
    /// Accumulated estimated spend in USD
    pub total_cost: f64,
}

impl Default for ProviderStats {
    fn default() -> Self {
        Self {
            latency_avg: 0.0,
            success_rate: 1.0,
            error_count: 0,
            total_requests: 0,
            successes: 0,
            last_error_time: None,
            total_cost: 0.0,
        }
    }
}

impl ProviderStats {
    /// Record a completed request.
    pub fn record_success(&mut self, latency_ms: f64, cost: f64) {
        self.total_requests += 1;
        self.successes += 1;
        if self.successes == 1 {
            self.latency_avg = latency_ms;
        } else {
            self.latency_avg =
                LATENCY_SMOOTHING * self.latency_avg + (1.0 - LATENCY_SMOOTHING) * latency_ms;
        }
        self.total_cost += cost;
        self.recompute_success_rate();
    }

    /// Record a failed request.
    pub fn record_failure(&mut self) {
        self.total_requests += 1;
        self.error_count += 1;
        self.last_error_time = Some(Utc::now());
        self.recompute_success_rate();
    }

    fn recompute_success_rate(&mut self) {
        self.success_rate = if self.total_requests == 0 {
            1.0
        } else {
            (self.total_requests - self.error_count) as f64 / self.total_requests as f64
        };
    }

    /// Routing score component: success rate over latency, latency floored at 1ms.
    pub fn health_score(&self) -> f64 {
        self.success_rate / self.latency_avg.max(1.0)
    }
}

/// Statistics for every provider the router has used.
#[derive(Debug, Clone, Default)]
pub struct ProviderHealthTracker {
    stats: HashMap<Provider, ProviderStats>,
}

impl ProviderHealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&mut self, provider: Provider, latency_ms: f64, cost: f64) {
        self.stats
            .entry(provider)
            .or_default()
            .record_success(latency_ms, cost);
    }

    pub fn record_failure(&mut self, provider: Provider) {
        self.stats.entry(provider).or_default().record_failure();
    }

    /// Stats for a provider; defaults for one never used.
    pub fn get(&self, provider: Provider) -> ProviderStats {
        self.stats.get(&provider).cloned().unwrap_or_default()
    }

    pub fn snapshot(&self) -> HashMap<Provider, ProviderStats> {
        self.stats.clone()
    }

    pub fn reset(&mut self) {
        self.stats.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_success_seeds_latency() {
        let mut stats = ProviderStats::default();
        stats.record_success(250.0, 0.01);
        assert_eq!(stats.latency_avg, 250.0);
        assert_eq!(stats.success_rate, 1.0);
        assert_eq!(stats.total_requests, 1);

        stats.record_success(350.0, 0.01);
        assert!((stats.latency_avg - 260.0).abs() < 1e-9);
        assert!((stats.total_cost - 0.02).abs() < 1e-12);
    }

    #[test]
    fn test_failure_after_failures_still_seeds_on_first_success() {
        let mut stats = ProviderStats::default();
        stats.record_failure();
        stats.record_failure();
        assert_eq!(stats.success_rate, 0.0);
        assert!(stats.last_error_time.is_some());

        stats.record_success(100.0, 0.0);
        assert_eq!(stats.latency_avg, 100.0);
        assert!((stats.success_rate - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_health_score_floors_latency() {
        let stats = ProviderStats::default();
        assert_eq!(stats.health_score(), 1.0);

        let mut fast = ProviderStats::default();
        fast.record_success(0.2, 0.0);
        assert_eq!(fast.health_score(), 1.0);
    }

    #[test]
    fn test_tracker_keeps_providers_apart() {
        let mut tracker = ProviderHealthTracker::new();
        tracker.record_success(Provider::OpenAI, 100.0, 0.0);
        tracker.record_failure(Provider::Anthropic);

        assert_eq!(tracker.get(Provider::OpenAI).success_rate, 1.0);
        assert_eq!(tracker.get(Provider::Anthropic).success_rate, 0.0);
        assert_eq!(tracker.get(Provider::Groq), ProviderStats::default());
        assert_eq!(tracker.snapshot().len(), 2);

        tracker.reset();
        assert!(tracker.snapshot().is_empty());
    }
}
