//! offergrid-state — data model and embedded state store for offergrid.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for applications, versions, taskgroups (with their tasks),
//! agents, per-agent scheduling deltas, deployments and transactions.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{run_as}/{app_id}`, `{run_as}/{app_id}/{taskgroup_id}`)
//! enable prefix scans per namespace and per application.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks. Clones share the application and
//! deployment lock pools and the taskgroup cache.

pub mod cache;
pub mod error;
pub mod ids;
pub mod locks;
pub mod resource;
pub mod store;
pub mod tables;
pub mod transaction;
pub mod types;
pub mod version;

pub use error::{StateError, StateResult};
pub use ids::{TaskGroupId, TaskId, run_as_and_app_id, taskgroup_id_of_task};
pub use resource::Resource;
pub use store::StateStore;
pub use transaction::{ObjectKind, OpType, Operation, Transaction, TransactionStatus};
pub use types::*;
pub use version::*;
