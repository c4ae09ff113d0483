//! Structured Events
//!
//! One function per discovery event so field names stay consistent across
//! both protocol generations and the subscriber.
//!
//! Event types:
//! - `client_created` - a registry client is ready for use
//! - `watch_established` - a prefix watch is live and the sentinel is due
//! - `watch_ended` - a prefix watch stopped delivering signals
//! - `entries_refreshed` - a subscriber replaced its endpoint snapshot
//! - `refresh_failed` - a subscriber re-list failed, previous snapshot kept

use tracing::{debug, info, warn};

/// Emit a client created event
pub fn client_created(version: &str, machines: &[String], mutual_tls: bool) {
    info!(
        event_type = "client_created",
        version = %version,
        machines = ?machines,
        mutual_tls = mutual_tls,
        "etcd client created"
    );
}

/// Emit a watch established event
pub fn watch_established(version: &str, prefix: &str) {
    debug!(
        event_type = "watch_established",
        version = %version,
        prefix = %prefix,
        "Watch established"
    );
}

/// Emit a watch ended event
///
/// Cancellation is the normal way out and is logged quietly.
pub fn watch_ended(version: &str, prefix: &str, reason: &str) {
    if reason == "cancelled" {
        debug!(
            event_type = "watch_ended",
            version = %version,
            prefix = %prefix,
            reason = %reason,
            "Watch ended"
        );
        return;
    }
    warn!(
        event_type = "watch_ended",
        version = %version,
        prefix = %prefix,
        reason = %reason,
        "Watch ended"
    );
}

/// Emit an entries refreshed event
pub fn entries_refreshed(prefix: &str, previous_count: usize, new_count: usize) {
    if previous_count == new_count {
        debug!(
            event_type = "entries_refreshed",
            prefix = %prefix,
            previous_count = previous_count,
            new_count = new_count,
            "Entries refreshed"
        );
    } else {
        info!(
            event_type = "entries_refreshed",
            prefix = %prefix,
            previous_count = previous_count,
            new_count = new_count,
            "Entries refreshed"
        );
    }
}

/// Emit a refresh failed event
pub fn refresh_failed(prefix: &str, error: &str) {
    warn!(
        event_type = "refresh_failed",
        prefix = %prefix,
        error = %error,
        "Refresh failed, keeping previous entries"
    );
}
