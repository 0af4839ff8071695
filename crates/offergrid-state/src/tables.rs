//! redb table definitions for the offergrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).
//! Composite keys follow `{namespace}/{name}` so a namespace or an
//! application can be listed with a prefix scan.

use redb::TableDefinition;

/// Applications keyed by `{run_as}/{app_id}`.
pub const APPLICATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("applications");

/// Taskgroups (with embedded tasks) keyed by `{run_as}/{app_id}/{taskgroup_id}`.
pub const TASKGROUPS: TableDefinition<&str, &[u8]> = TableDefinition::new("taskgroups");

/// Versions keyed by `{run_as}/{app_id}/{version_name}`.
pub const VERSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("versions");

/// Transactions keyed by `{namespace}/{transaction_id}`.
pub const TRANSACTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("transactions");

/// Agents keyed by hostname.
pub const AGENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("agents");

/// Agent scheduling deltas keyed by hostname.
pub const AGENT_SCHED_INFO: TableDefinition<&str, &[u8]> =
    TableDefinition::new("agent_sched_info");

/// Deployments keyed by `{run_as}/{name}`.
pub const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");

/// Singleton values (framework id) keyed by name.
pub const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");
