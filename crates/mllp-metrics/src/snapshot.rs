use std::collections::BTreeMap;

use serde::Serialize;

/// Point-in-time value of one counter.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub description: String,
    pub value: u64,
}

/// Point-in-time state of one latency distribution.
///
/// `buckets[i]` counts observations below the i-th bound of
/// [`crate::LATENCY_BUCKETS_MS`]; the last bucket is unbounded.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LatencySnapshot {
    pub description: String,
    pub count: u64,
    pub sum_ms: f64,
    pub buckets: Vec<u64>,
}

/// Everything the registry knows, in deterministic order for export.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, CounterSnapshot>,
    pub latencies: BTreeMap<String, LatencySnapshot>,
}
