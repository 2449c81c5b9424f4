//! Metrics for monitoring a grid node.
//!
//! Lock-free counters and gauges, cheap enough to bump on every command:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        GridMetrics                            │
//! │  ┌──────────────────┐  ┌────────────────┐  ┌───────────────┐  │
//! │  │ Commands         │  │ Topology       │  │ State transfer│  │
//! │  │ - by type        │  │ - installs     │  │ - chunks      │  │
//! │  │ - retries        │  │ - rebalances   │  │ - entries     │  │
//! │  │ - errors by kind │  │ - topology id  │  │ - segments    │  │
//! │  └──────────────────┘  └────────────────┘  └───────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust
//! use segment_grid::metrics::GridMetrics;
//!
//! let metrics = GridMetrics::new();
//! metrics.record_command("Get");
//! metrics.record_retry();
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.commands_total, 1);
//! assert_eq!(snapshot.retries, 1);
//! ```

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// A monotonically increasing counter.
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    value: AtomicU64,
}

impl Counter {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            value: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Increment the counter by 1.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the counter by a specific amount.
    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A value that can go up and down.
#[derive(Debug)]
pub struct Gauge {
    name: &'static str,
    value: AtomicI64,
}

impl Gauge {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            value: AtomicI64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn add(&self, n: i64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A counter partitioned by one label.
#[derive(Debug)]
pub struct LabeledCounter {
    name: &'static str,
    counters: RwLock<HashMap<String, AtomicU64>>,
}

impl LabeledCounter {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            counters: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn inc(&self, label: &str) {
        {
            let counters = self.counters.read();
            if let Some(counter) = counters.get(label) {
                counter.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        self.counters
            .write()
            .entry(label.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, label: &str) -> u64 {
        self.counters
            .read()
            .get(label)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counters
            .read()
            .values()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }
}

/// Metrics for one grid node.
#[derive(Debug)]
pub struct GridMetrics {
    // Dispatch
    /// Commands dispatched, by command type.
    pub commands: LabeledCounter,
    /// Commands executed on behalf of any origin, by command type.
    pub commands_executed: LabeledCounter,
    /// Retries triggered by topology changes or suspected nodes.
    pub retries: Counter,
    /// Failures, by exception kind.
    pub errors: LabeledCounter,
    /// Writes answered from the completed-invocation cache.
    pub duplicate_invocations: Counter,

    // Topology
    /// Topologies installed on this node.
    pub topologies_installed: Counter,
    /// Id of the installed topology.
    pub topology_id: Gauge,
    /// Rebalances started by this node as coordinator.
    pub rebalances_started: Counter,
    /// Rebalances completed by this node as coordinator.
    pub rebalances_completed: Counter,

    // State transfer
    /// Chunks sent to new owners.
    pub chunks_sent: Counter,
    /// Chunks applied from previous owners.
    pub chunks_received: Counter,
    /// Entries applied from chunks.
    pub entries_transferred: Counter,
    /// Segments waiting for their final chunk.
    pub segments_in_transfer: Gauge,
    /// Segments dropped after losing ownership.
    pub segments_dropped: Counter,
}

impl GridMetrics {
    pub fn new() -> Self {
        Self {
            commands: LabeledCounter::new("grid_commands_total"),
            commands_executed: LabeledCounter::new("grid_commands_executed_total"),
            retries: Counter::new("grid_command_retries_total"),
            errors: LabeledCounter::new("grid_errors_total"),
            duplicate_invocations: Counter::new("grid_duplicate_invocations_total"),

            topologies_installed: Counter::new("grid_topologies_installed_total"),
            topology_id: Gauge::new("grid_topology_id"),
            rebalances_started: Counter::new("grid_rebalances_started_total"),
            rebalances_completed: Counter::new("grid_rebalances_completed_total"),

            chunks_sent: Counter::new("grid_transfer_chunks_sent_total"),
            chunks_received: Counter::new("grid_transfer_chunks_received_total"),
            entries_transferred: Counter::new("grid_transfer_entries_total"),
            segments_in_transfer: Gauge::new("grid_segments_in_transfer"),
            segments_dropped: Counter::new("grid_segments_dropped_total"),
        }
    }

    /// Record a command leaving the dispatcher.
    pub fn record_command(&self, command: &str) {
        self.commands.inc(command);
    }

    /// Record a command being executed locally.
    pub fn record_execution(&self, command: &str) {
        self.commands_executed.inc(command);
    }

    pub fn record_retry(&self) {
        self.retries.inc();
    }

    /// Record a failure by kind.
    pub fn record_error(&self, kind: &str) {
        self.errors.inc(kind);
    }

    /// Record a newly installed topology.
    pub fn record_topology(&self, topology_id: u64) {
        self.topologies_installed.inc();
        self.topology_id.set(topology_id as i64);
    }

    /// Record an applied chunk.
    pub fn record_chunk_applied(&self, entries: u64) {
        self.chunks_received.inc();
        self.entries_transferred.inc_by(entries);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            commands_total: self.commands.total(),
            retries: self.retries.get(),
            errors_total: self.errors.total(),
            duplicate_invocations: self.duplicate_invocations.get(),
            topology_id: self.topology_id.get(),
            rebalances_completed: self.rebalances_completed.get(),
            entries_transferred: self.entries_transferred.get(),
            segments_in_transfer: self.segments_in_transfer.get(),
        }
    }

    /// Format metrics in Prometheus exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        let counters = [
            &self.retries,
            &self.duplicate_invocations,
            &self.topologies_installed,
            &self.rebalances_started,
            &self.rebalances_completed,
            &self.chunks_sent,
            &self.chunks_received,
            &self.entries_transferred,
            &self.segments_dropped,
        ];
        for counter in counters {
            output.push_str(&format!(
                "# TYPE {} counter\n{} {}\n",
                counter.name(),
                counter.name(),
                counter.get()
            ));
        }

        for gauge in [&self.topology_id, &self.segments_in_transfer] {
            output.push_str(&format!(
                "# TYPE {} gauge\n{} {}\n",
                gauge.name(),
                gauge.name(),
                gauge.get()
            ));
        }

        for (labeled, label) in [
            (&self.commands, "command"),
            (&self.commands_executed, "command"),
            (&self.errors, "kind"),
        ] {
            output.push_str(&format!("# TYPE {} counter\n", labeled.name()));
            let mut values: Vec<(String, u64)> = labeled
                .counters
                .read()
                .iter()
                .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
                .collect();
            values.sort();
            for (value, count) in values {
                output.push_str(&format!(
                    "{}{{{}=\"{}\"}} {}\n",
                    labeled.name(),
                    label,
                    value,
                    count
                ));
            }
        }

        output
    }
}

impl Default for GridMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A point-in-time copy of the headline metrics.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub commands_total: u64,
    pub retries: u64,
    pub errors_total: u64,
    pub duplicate_invocations: u64,
    pub topology_id: i64,
    pub rebalances_completed: u64,
    pub entries_transferred: u64,
    pub segments_in_transfer: i64,
}
