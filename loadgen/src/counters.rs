//! Outcome counters.
//!
//! Clients never talk to a metrics registry directly. The host process
//! injects a [`CounterStore`] at construction, which lets the binary export
//! through the `metrics` facade while tests read counts back from a
//! [`MemoryStore`].
//!
//! ## Metrics
//!
//! `loadgen_queries_total`: Range queries attempted, by `result` and `query`
//! `loadgen_query_results_compared_total`: Query results verified, by `result` and `query`
//! `loadgen_write_requests_total`: Remote write requests sent, by `result`
//! `loadgen_write_series_total`: Series accepted by the remote write endpoint
//!
//! Every counter carries a `tenant` label.

use std::{fmt, sync::Mutex};

use metrics::counter;
use rustc_hash::FxHashMap;

/// Name of the attempted query counter.
pub const QUERIES_TOTAL: &str = "loadgen_queries_total";
/// Name of the compared query result counter.
pub const RESULTS_COMPARED_TOTAL: &str = "loadgen_query_results_compared_total";
/// Name of the remote write request counter.
pub const WRITE_REQUESTS_TOTAL: &str = "loadgen_write_requests_total";
/// Name of the written series counter.
pub const WRITE_SERIES_TOTAL: &str = "loadgen_write_series_total";

/// The `result` label of a counted outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// The operation succeeded
    Success,
    /// The operation failed
    Failed,
    /// The operation was not attempted
    Skipped,
}

impl Outcome {
    /// The label value of this outcome.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failed => "failed",
            Outcome::Skipped => "skipped",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A thread-safe, append-only store of counters.
pub trait CounterStore: fmt::Debug + Send + Sync {
    /// Add `value` to the counter identified by `name` and `labels`,
    /// registering it first if needed. Adding zero only registers.
    fn increment(&self, name: &'static str, labels: &[(String, String)], value: u64);
}

/// Forwards to the global `metrics` recorder installed by the host process.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsStore;

impl CounterStore for MetricsStore {
    fn increment(&self, name: &'static str, labels: &[(String, String)], value: u64) {
        let labels = labels.to_vec();
        counter!(name, &labels).increment(value);
    }
}

type Key = (String, Vec<(String, String)>);

/// Keeps counters in memory. Label order does not matter for lookups.
#[derive(Debug, Default)]
pub struct MemoryStore {
    counters: Mutex<FxHashMap<Key, u64>>,
}

impl MemoryStore {
    /// Create a new, empty [`MemoryStore`]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The value of the counter identified by `name` and `labels`, or `None`
    /// if it was never registered.
    #[must_use]
    pub fn get(&self, name: &str, labels: &[(&str, &str)]) -> Option<u64> {
        let labels: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        let key = key(name, &labels);
        let counters = self
            .counters
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        counters.get(&key).copied()
    }

    /// Number of distinct counters registered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.counters
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether no counter was registered yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CounterStore for MemoryStore {
    fn increment(&self, name: &'static str, labels: &[(String, String)], value: u64) {
        let key = key(name, labels);
        let mut counters = self
            .counters
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *counters.entry(key).or_default() += value;
    }
}

fn key(name: &str, labels: &[(String, String)]) -> Key {
    let mut labels = labels.to_vec();
    labels.sort_unstable();
    (name.to_string(), labels)
}

/// Builder for consistent counter labels.
#[derive(Debug, Clone)]
pub(crate) struct Labels {
    labels: Vec<(String, String)>,
}

impl Labels {
    /// Labels identifying `tenant`.
    pub(crate) fn tenant(tenant: &str) -> Self {
        Self {
            labels: vec![("tenant".to_string(), tenant.to_string())],
        }
    }

    /// Add the `result` label.
    pub(crate) fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.labels
            .push(("result".to_string(), outcome.as_str().to_string()));
        self
    }

    /// Add the `query` label.
    pub(crate) fn with_query(mut self, query: &str) -> Self {
        self.labels.push(("query".to_string(), query.to_string()));
        self
    }

    pub(crate) fn build(self) -> Vec<(String, String)> {
        self.labels
    }
}

#[cfg(test)]
mod tests {
    use metrics::{Key as MetricKey, Label};
    use metrics_util::{
        CompositeKey, MetricKind,
        debugging::{DebugValue, DebuggingRecorder},
    };

    use super::*;

    #[test]
    fn memory_store_accumulates_regardless_of_label_order() {
        let store = MemoryStore::new();
        assert!(store.is_empty());

        let labels = Labels::tenant("t-1").with_outcome(Outcome::Success).build();
        store.increment(QUERIES_TOTAL, &labels, 0);
        assert_eq!(
            store.get(QUERIES_TOTAL, &[("tenant", "t-1"), ("result", "success")]),
            Some(0)
        );

        store.increment(QUERIES_TOTAL, &labels, 2);
        store.increment(QUERIES_TOTAL, &labels, 3);
        assert_eq!(
            store.get(QUERIES_TOTAL, &[("result", "success"), ("tenant", "t-1")]),
            Some(5)
        );
        assert_eq!(
            store.get(QUERIES_TOTAL, &[("result", "failed"), ("tenant", "t-1")]),
            None
        );
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn metrics_store_forwards_to_recorder() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            let labels = Labels::tenant("t-1")
                .with_outcome(Outcome::Failed)
                .with_query("up")
                .build();
            MetricsStore.increment(QUERIES_TOTAL, &labels, 4);
        });

        let snapshot = snapshotter.snapshot().into_hashmap();
        let metric = snapshot
            .get(&CompositeKey::new(
                MetricKind::Counter,
                MetricKey::from_parts(
                    QUERIES_TOTAL,
                    vec![
                        Label::new("tenant", "t-1"),
                        Label::new("result", "failed"),
                        Label::new("query", "up"),
                    ],
                ),
            ))
            .expect("counter not found");
        match metric.2 {
            DebugValue::Counter(value) => assert_eq!(value, 4),
            _ => panic!("unexpected metric type"),
        }
    }

    #[test]
    fn outcomes_render_as_label_values() {
        assert_eq!(Outcome::Success.to_string(), "success");
        assert_eq!(Outcome::Failed.to_string(), "failed");
        assert_eq!(Outcome::Skipped.to_string(), "skipped");
    }
}
