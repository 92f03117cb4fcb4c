// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the failover engine.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding service is responsible for choosing the exporter
//! (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `failover_engine_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `store`: primary, fallback
//! - `operation`: insert, get, query, count
//! - `outcome`: success, failed, partial, deferred

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

use crate::coordinator::Mode;

/// Set the current mode (0 = Primary, 1 = Fallback, 2 = Recovering)
pub fn set_mode(mode: Mode) {
    let value = match mode {
        Mode::Primary => 0.0,
        Mode::Fallback => 1.0,
        Mode::Recovering => 2.0,
    };
    gauge!("failover_engine_mode").set(value);
}

/// Record a mode transition
pub fn record_transition(from: Mode, to: Mode) {
    counter!(
        "failover_engine_mode_transitions_total",
        "from" => from.as_str(),
        "to" => to.as_str()
    )
    .increment(1);
}

/// Record a health probe outcome
pub fn record_probe(healthy: bool) {
    counter!(
        "failover_engine_probes_total",
        "outcome" => if healthy { "healthy" } else { "unhealthy" }
    )
    .increment(1);
}

/// Record which store served a routed operation
pub fn record_routed(store: &str, operation: &'static str) {
    counter!(
        "failover_engine_routed_total",
        "store" => store.to_string(),
        "operation" => operation
    )
    .increment(1);
}

/// Record a primary write that was redirected into the fallback store
pub fn record_write_redirect() {
    counter!("failover_engine_write_redirects_total").increment(1);
}

/// Record a durability failure surfaced to a producer
pub fn record_durability_error() {
    counter!("failover_engine_durability_errors_total").increment(1);
}

/// Record a timeout against a store
pub fn record_timeout(store: &str, operation: &str) {
    counter!(
        "failover_engine_timeouts_total",
        "store" => store.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record the outcome of one record replay
pub fn record_sync(kind: &str, outcome: &'static str) {
    counter!(
        "failover_engine_sync_records_total",
        "kind" => kind.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Record how a conflict was resolved
pub fn record_conflict(outcome: &'static str) {
    counter!("failover_engine_conflicts_total", "outcome" => outcome).increment(1);
}

/// Set the number of records waiting in the fallback store
pub fn set_pending(count: u64) {
    gauge!("failover_engine_pending_records").set(count as f64);
}

/// Set the number of records that exhausted their retry budget
pub fn set_failed(count: u64) {
    gauge!("failover_engine_failed_records").set(count as f64);
}

/// Record drain pass duration
pub fn record_drain_pass(duration: Duration) {
    histogram!("failover_engine_drain_pass_seconds").record(duration.as_secs_f64());
}

/// Record a corrupted row detected on read
pub fn record_corruption(store: &str) {
    counter!(
        "failover_engine_corruption_detected_total",
        "store" => store.to_string()
    )
    .increment(1);
}

/// Set engine lifecycle state
pub fn set_engine_state(state: &str) {
    counter!(
        "failover_engine_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(store: &str, operation: &str, duration: Duration) {
    histogram!(
        "failover_engine_operation_seconds",
        "store" => store.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    store: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(store: &'static str, operation: &'static str) -> Self {
        Self {
            store,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.store, self.operation, self.start.elapsed());
    }
}
