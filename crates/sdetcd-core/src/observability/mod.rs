//! Observability
//!
//! - `events`: structured discovery events with consistent fields
//! - `metrics`: counters and gauges recorded through the `metrics` facade
//!
//! Installing a subscriber or a recorder is left to the embedding binary.

pub mod events;
pub mod metrics;

pub use self::metrics::describe_metrics;
