//! offergrid resource offers — pool, agent delta accounting, constraints.
//!
//! This crate buffers the cluster manager's resource offers between
//! arrival and consumption, tracks resource the scheduler has reserved on
//! each agent ahead of the cluster manager's own view, and decides whether
//! a host satisfies a version's placement constraints.
//!
//! # Components
//!
//! - **`pool`** — Offer pool (snapshot scans, compare-and-claim, decline paths)
//! - **`accounting`** — Per-agent delta tracking and cluster resource summary
//! - **`constraints`** — Constraint evaluation against a host view

pub mod accounting;
pub mod constraints;
pub mod error;
pub mod pool;

pub use accounting::{AgentDeltaTracker, AgentResource, ClusterResource};
pub use constraints::{HostView, PlacedSet, host_satisfies};
pub use error::{OfferError, OfferResult};
pub use pool::{Decliner, Offer, OfferPool, PooledOffer};
