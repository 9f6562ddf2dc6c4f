//! Metric collection for the MLLP adapter.
//!
//! A single [`MetricsRegistry`] is created at startup and shared by every
//! component. Counters and latency distributions are registered by name;
//! increments and observations are safe from any task. [`export`] serves
//! the registry over HTTP when the adapter runs in a supported cloud
//! environment and quietly stays off otherwise.

pub mod export;
mod registry;
mod snapshot;

pub use export::start_export;
pub use registry::{MetricsRegistry, LATENCY_BUCKETS_MS};
pub use snapshot::{CounterSnapshot, LatencySnapshot, MetricsSnapshot};
