use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::snapshot::{CounterSnapshot, LatencySnapshot, MetricsSnapshot};

/// Upper bounds (milliseconds) of the latency histogram buckets. A ninth
/// implicit bucket catches everything at or above the last bound.
pub const LATENCY_BUCKETS_MS: [f64; 8] = [50.0, 100.0, 200.0, 400.0, 1000.0, 2000.0, 4000.0, f64::INFINITY];

#[derive(Debug)]
struct Counter {
    description: String,
    value: AtomicU64,
}

impl Counter {
    fn new(description: &str) -> Self {
        Self {
            description: description.to_string(),
            value: AtomicU64::new(0),
        }
    }

    fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            description: self.description.clone(),
            value: self.value.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
struct Latency {
    description: String,
    // Sample counts per bucket; bucket i holds values below
    // LATENCY_BUCKETS_MS[i] and at or above the previous bound.
    buckets: [AtomicU64; LATENCY_BUCKETS_MS.len()],
    count: AtomicU64,
    // Total milliseconds, stored in micros so an atomic works.
    sum_us: AtomicU64,
}

impl Latency {
    fn new(description: &str) -> Self {
        Self {
            description: description.to_string(),
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
        }
    }

    fn observe(&self, value_ms: f64) {
        let value_ms = value_ms.max(0.0);
        let idx = LATENCY_BUCKETS_MS
            .iter()
            .position(|bound| value_ms < *bound)
            .unwrap_or(LATENCY_BUCKETS_MS.len() - 1);
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_us
            .fetch_add((value_ms * 1000.0) as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> LatencySnapshot {
        LatencySnapshot {
            description: self.description.clone(),
            count: self.count.load(Ordering::Relaxed),
            sum_ms: self.sum_us.load(Ordering::Relaxed) as f64 / 1000.0,
            buckets: self
                .buckets
                .iter()
                .map(|b| b.load(Ordering::Relaxed))
                .collect(),
        }
    }
}

/// Process-scoped, name-keyed metric registry.
///
/// Created once at startup and shared (`Arc`) by every task; counters and
/// latency distributions are registered up front by the component that
/// owns them and mutated for the process lifetime. Increments and
/// observations are lock-free once the metric exists; the outer maps take
/// a write lock only on registration.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    counters: RwLock<HashMap<String, Arc<Counter>>>,
    latencies: RwLock<HashMap<String, Arc<Latency>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a counter. Re-registering an existing name keeps the
    /// original cell and its value.
    pub fn new_counter(&self, name: &str, description: &str) {
        let mut counters = self.counters.write().unwrap();
        counters
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Counter::new(description)));
    }

    /// Increments a counter by one, registering it on the fly if the
    /// owning component never declared it.
    pub fn inc_counter(&self, name: &str) {
        let counter = {
            let counters = self.counters.read().unwrap();
            counters.get(name).cloned()
        };
        let counter = match counter {
            Some(c) => c,
            None => {
                let mut counters = self.counters.write().unwrap();
                counters
                    .entry(name.to_string())
                    .or_insert_with(|| Arc::new(Counter::new("")))
                    .clone()
            }
        };
        counter.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Registers a latency distribution.
    pub fn new_latency(&self, name: &str, description: &str) {
        let mut latencies = self.latencies.write().unwrap();
        latencies
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Latency::new(description)));
    }

    /// Records one latency observation in milliseconds.
    pub fn add_latency(&self, name: &str, value_ms: f64) {
        let latency = {
            let latencies = self.latencies.read().unwrap();
            latencies.get(name).cloned()
        };
        let latency = match latency {
            Some(l) => l,
            None => {
                let mut latencies = self.latencies.write().unwrap();
                latencies
                    .entry(name.to_string())
                    .or_insert_with(|| Arc::new(Latency::new("")))
                    .clone()
            }
        };
        latency.observe(value_ms);
    }

    /// Current value of a counter; zero if it was never touched.
    pub fn counter_value(&self, name: &str) -> u64 {
        let counters = self.counters.read().unwrap();
        counters
            .get(name)
            .map(|c| c.value.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Number of observations recorded against a latency distribution.
    pub fn latency_count(&self, name: &str) -> u64 {
        let latencies = self.latencies.read().unwrap();
        latencies
            .get(name)
            .map(|l| l.count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Takes a consistent-enough snapshot of every metric for export.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = {
            let counters = self.counters.read().unwrap();
            counters
                .iter()
                .map(|(name, c)| (name.clone(), c.snapshot()))
                .collect()
        };
        let latencies = {
            let latencies = self.latencies.read().unwrap();
            latencies
                .iter()
                .map(|(name, l)| (name.clone(), l.snapshot()))
                .collect()
        };
        MetricsSnapshot {
            counters,
            latencies,
        }
    }
}
