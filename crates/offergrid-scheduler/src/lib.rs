//! offergrid-scheduler — the scheduling core of offergrid.
//!
//! Turns application operations into persisted transactions, places
//! taskgroups on held resource offers, reconciles task status reports
//! into taskgroup and application state, and checks the store for
//! inconsistencies.
//!
//! # Components
//!
//! - **`engine`** — Transaction engine: operation API, queue workers, timeout sweeps
//! - **`reconciler`** — Task status and health report handling, follow-up reschedules
//! - **`checker`** — Periodic consistency checks with optional repair
//! - **`events`** — Cluster event subscription and routing
//! - **`agent_sync`** — Agent list synchronization
//! - **`scheduler`** — Master/slave role control tying the above together

pub mod agent_sync;
pub mod checker;
pub mod collab;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod events;
pub mod queue;
pub mod reconciler;
pub mod scheduler;

#[cfg(test)]
mod testutil;

pub use checker::{CheckReport, CheckerControl, DataChecker};
pub use collab::{
    ClusterClient, ClusterEvent, HealthReport, NoPlugins, NoopExporter, PluginManager,
    ServiceExporter, TaskStatusUpdate,
};
pub use config::SchedulerConfig;
pub use context::SchedulerContext;
pub use engine::{Engine, Step, SweepReport};
pub use error::{SchedulerError, SchedulerResult};
pub use reconciler::{FollowUp, Reconciler, StatusEvent};
pub use scheduler::Scheduler;
