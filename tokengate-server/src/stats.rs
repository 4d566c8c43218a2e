//! Per-client request statistics

use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokengate::Decision;

/// Counters of the requests checked through this server instance.
///
/// Counters are process-local even when buckets are shared through Redis.
#[derive(Debug, Default)]
pub struct StatsRegistry {
    clients: DashMap<String, Counters>,
}

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    allowed: AtomicU64,
}

impl StatsRegistry {
    /// Creates an empty registry.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one checked request of `client_id`.
    pub fn record(&self, client_id: &str, allowed: bool) {
        if let Some(counters) = self.clients.get(client_id) {
            counters.add(allowed);
            return;
        }
        self.clients
            .entry(client_id.to_owned())
            .or_default()
            .add(allowed);
    }

    /// Requests and admitted requests of `client_id`, if it was ever checked.
    pub fn counts(&self, client_id: &str) -> Option<(u64, u64)> {
        self.clients
            .get(client_id)
            .map(|counters| (counters.requests.load(Relaxed), counters.allowed.load(Relaxed)))
    }

    /// Combines the counters of `client_id` with its bucket state.
    pub fn snapshot(&self, client_id: &str, decision: Decision) -> RateLimiterStats {
        let (request_count, allowed_count) = self.counts(client_id).unwrap_or_default();
        RateLimiterStats::new(decision, request_count, allowed_count)
    }

    /// Number of clients with counters.
    #[inline]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Returns `true` if no request was recorded yet.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl Counters {
    #[inline]
    fn add(&self, allowed: bool) {
        self.requests.fetch_add(1, Relaxed);
        if allowed {
            self.allowed.fetch_add(1, Relaxed);
        }
    }
}

/// Bucket state of a client together with its request counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimiterStats {
    /// Bucket state
    #[serde(flatten)]
    pub decision: Decision,

    /// Requests checked
    pub request_count: u64,

    /// Requests admitted
    pub allowed_count: u64,

    /// Share of admitted requests in percent
    pub success_rate: f64,
}

impl RateLimiterStats {
    /// Creates stats from a bucket state and counters.
    pub fn new(decision: Decision, request_count: u64, allowed_count: u64) -> Self {
        let success_rate = if request_count == 0 {
            0.0
        } else {
            allowed_count as f64 * 100.0 / request_count as f64
        };
        Self { decision, request_count, allowed_count, success_rate }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(allowed: bool) -> Decision {
        Decision { allowed, current_tokens: 1, capacity: 10, refill_rate: 2 }
    }

    #[test]
    fn it_counts_requests_per_client() {
        let stats = StatsRegistry::new();

        stats.record("a", true);
        stats.record("a", true);
        stats.record("a", false);
        stats.record("b", false);

        assert_eq!(stats.counts("a"), Some((3, 2)));
        assert_eq!(stats.counts("b"), Some((1, 0)));
        assert_eq!(stats.counts("c"), None);
        assert_eq!(stats.len(), 2);
    }

    #[test]
    fn it_computes_success_rate_in_percent() {
        let stats = RateLimiterStats::new(decision(true), 4, 3);
        assert_eq!(stats.success_rate, 75.0);

        let stats = RateLimiterStats::new(decision(true), 0, 0);
        assert_eq!(stats.success_rate, 0.0);
    }

    #[test]
    fn it_serializes_flat_camel_case() {
        let stats = StatsRegistry::new();
        stats.record("a", true);
        stats.record("a", false);

        let json = serde_json::to_value(stats.snapshot("a", decision(false))).unwrap();

        assert_eq!(json, serde_json::json!({
            "allowed": false,
            "currentTokens": 1,
            "capacity": 10,
            "refillRate": 2,
            "requestCount": 2,
            "allowedCount": 1,
            "successRate": 50.0
        }));
    }
}
