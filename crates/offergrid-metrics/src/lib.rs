//! offergrid-metrics — observability for the offergrid scheduler.
//!
//! Counts scheduler operations, taskgroup status transitions and
//! reschedules, reads per-application instance gauges from the state
//! store, and provides Prometheus-compatible text exposition.
//!
//! # Architecture
//!
//! ```text
//! MetricsCollector (implements MetricsSink)
//!   ├── operation() / taskgroup_status() / reschedule() ← called by the scheduler
//!   └── refresh_app_gauges() → reads applications from StateStore
//!
//! Prometheus exposition
//!   └── render_prometheus() → text/plain for a /metrics endpoint
//! ```

pub mod collector;
pub mod prometheus;

pub use collector::{MetricsCollector, MetricsSink, MetricsSnapshot, NoopMetrics, Outcome};
pub use prometheus::render_prometheus;
