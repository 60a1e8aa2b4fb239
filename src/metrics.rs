// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the ad sync engine.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding service is responsible for choosing the exporter.
//!
//! # Metric Naming Convention
//! - `ad_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `component`: index, lock, stamp, refresh, source, write
//! - `operation`: add, range, remove_expired, acquire, release, ...
//! - `outcome`: refreshed, contended, failed
//! - `source`: cache, store

use metrics::{counter, histogram};
use std::time::{Duration, Instant};

/// Record a refresh attempt outcome
pub fn record_refresh(outcome: &'static str) {
    counter!("ad_sync_refresh_total", "outcome" => outcome).increment(1);
}

/// Record how many ads a refresh inserted into the index
pub fn record_refresh_inserted(count: usize) {
    counter!("ad_sync_refresh_inserted_total").increment(count as u64);
}

/// Record how many ended ads a refresh removed from the index
pub fn record_expired_removed(count: usize) {
    counter!("ad_sync_expired_removed_total").increment(count as u64);
}

/// Record which path served a page read (`cache` or `store`)
pub fn record_page_read(source: &'static str) {
    counter!("ad_sync_page_reads_total", "source" => source).increment(1);
}

/// Record an error with component and operation for alerting
pub fn record_error(component: &'static str, operation: &'static str) {
    counter!(
        "ad_sync_errors_total",
        "component" => component,
        "operation" => operation
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(component: &'static str, operation: &'static str, duration: Duration) {
    histogram!(
        "ad_sync_operation_seconds",
        "component" => component,
        "operation" => operation
    )
    .record(duration.as_secs_f64());
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    component: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(component: &'static str, operation: &'static str) -> Self {
        Self {
            component,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.component, self.operation, self.start.elapsed());
    }
}
