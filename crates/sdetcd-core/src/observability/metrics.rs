//! Discovery Metrics
//!
//! Metrics tracked:
//! - `sdetcd_list_total` - counter of list calls by version and outcome
//! - `sdetcd_watch_signals_total` - counter of signals delivered by watches
//! - `sdetcd_watch_ended_total` - counter of watches that stopped, by reason
//! - `sdetcd_endpoints` - gauge of endpoints currently known per prefix

use metrics::{counter, describe_counter, describe_gauge, gauge};

/// Register descriptions for all metrics.
///
/// Call once after installing a recorder; recording works without it.
pub fn describe_metrics() {
    describe_counter!(
        "sdetcd_list_total",
        "Total number of list calls against the store"
    );
    describe_counter!(
        "sdetcd_watch_signals_total",
        "Total number of change signals delivered by watches"
    );
    describe_counter!(
        "sdetcd_watch_ended_total",
        "Total number of watches that stopped delivering signals"
    );
    describe_gauge!(
        "sdetcd_endpoints",
        "Number of endpoints currently known under a prefix"
    );
}

/// Record the outcome of a list call
pub fn record_list(version: &str, ok: bool) {
    counter!(
        "sdetcd_list_total",
        "version" => version.to_string(),
        "outcome" => if ok { "ok" } else { "error" }
    )
    .increment(1);
}

/// Record a signal handed to a watcher
pub fn record_watch_signal(version: &str) {
    counter!("sdetcd_watch_signals_total", "version" => version.to_string()).increment(1);
}

/// Record a watch that stopped
pub fn record_watch_ended(version: &str, reason: &str) {
    counter!(
        "sdetcd_watch_ended_total",
        "version" => version.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Update the endpoints gauge for a prefix
pub fn set_endpoint_count(prefix: &str, count: usize) {
    gauge!("sdetcd_endpoints", "prefix" => prefix.to_string()).set(count as f64);
}
