//! Domain types for the offergrid state store.
//!
//! These types represent the persisted state of applications, taskgroups,
//! agents, per-agent scheduling deltas and deployments. All types are
//! serializable to/from JSON for storage in redb tables.

use std::collections::{BTreeMap, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::ids::{TaskGroupId, TaskId};
use crate::resource::Resource;
use crate::transaction::OpType;
use crate::version::{Version, WorkloadKind};

/// Current unix time in seconds.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Current unix time in nanoseconds; used for taskgroup creation stamps.
pub fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

// ── Application ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppStatus {
    Staging,
    Deploying,
    Running,
    Finish,
    Error,
    /// A transaction currently owns the application.
    Operating,
    RollingUpdate,
    Abnormal,
    Unknown,
}

/// An application: a named, namespaced group of identical taskgroups.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Application {
    pub id: String,
    pub name: String,
    pub run_as: String,
    pub cluster_id: String,
    pub kind: WorkloadKind,
    pub status: AppStatus,
    pub last_status: AppStatus,
    /// The operation holding the application while `Operating`.
    #[serde(default)]
    pub sub_status: Option<OpType>,
    #[serde(default)]
    pub message: String,
    /// Number of taskgroups currently persisted.
    pub instances: u32,
    pub running_instances: u32,
    /// Number of taskgroups the user asked for.
    pub define_instances: u32,
    /// Name of the version new taskgroups are launched from.
    pub current_version: String,
    pub created: u64,
    pub updated: u64,
}

impl Application {
    pub fn new(run_as: &str, id: &str, cluster_id: &str, kind: WorkloadKind, instances: u32) -> Self {
        let now = now_secs();
        Self {
            id: id.to_string(),
            name: id.to_string(),
            run_as: run_as.to_string(),
            cluster_id: cluster_id.to_string(),
            kind,
            status: AppStatus::Staging,
            last_status: AppStatus::Staging,
            sub_status: None,
            message: String::new(),
            instances: 0,
            running_instances: 0,
            define_instances: instances,
            current_version: String::new(),
            created: now,
            updated: now,
        }
    }

    /// Storage key: `{run_as}/{id}`.
    pub fn table_key(&self) -> String {
        app_key(&self.run_as, &self.id)
    }

    pub fn set_status(&mut self, status: AppStatus) {
        if self.status != status {
            self.last_status = self.status;
            self.status = status;
        }
        self.updated = now_secs();
    }

    /// Whether a transaction currently owns the app.
    pub fn is_operating(&self) -> bool {
        self.status == AppStatus::Operating
    }
}

pub fn app_key(run_as: &str, app_id: &str) -> String {
    format!("{run_as}/{app_id}")
}

// ── TaskGroup / Task ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskGroupStatus {
    Staging,
    Starting,
    Running,
    Finish,
    Error,
    Killing,
    Killed,
    Failed,
    Lost,
    Restarting,
    Unknown,
}

impl TaskGroupStatus {
    /// No further status changes are expected from the cluster.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Finish | Self::Error | Self::Killed | Self::Failed | Self::Lost
        )
    }

    /// Terminal states that did not come from a clean exit or a kill.
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Error | Self::Failed | Self::Lost)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Staging,
    Starting,
    Running,
    Finish,
    Failed,
    Killing,
    Killed,
    Lost,
    Error,
    Unknown,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Finish | Self::Failed | Self::Killed | Self::Lost | Self::Error
        )
    }
}

/// One container or process inside a taskgroup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub status: TaskStatus,
    pub last_status: TaskStatus,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub agent_ip: Option<String>,
    /// Runtime address resolved from the executor status blob.
    #[serde(default)]
    pub runtime_ip: Option<String>,
    /// Raw executor status blob.
    #[serde(default)]
    pub status_data: Option<String>,
    pub resource: Resource,
    #[serde(default = "default_true")]
    pub healthy: bool,
    #[serde(default)]
    pub is_checked: bool,
    #[serde(default)]
    pub consecutive_failure_times: u32,
    pub update_time: u64,
}

fn default_true() -> bool {
    true
}

impl Task {
    pub fn new(id: TaskId, name: &str, resource: Resource) -> Self {
        Self {
            id,
            name: name.to_string(),
            status: TaskStatus::Staging,
            last_status: TaskStatus::Staging,
            message: String::new(),
            agent_ip: None,
            runtime_ip: None,
            status_data: None,
            resource,
            healthy: true,
            is_checked: false,
            consecutive_failure_times: 0,
            update_time: now_secs(),
        }
    }

    pub fn set_status(&mut self, status: TaskStatus) {
        if self.status != status {
            self.last_status = self.status;
            self.status = status;
        }
        self.update_time = now_secs();
    }
}

/// One schedulable unit of an application, placed on a single agent.
///
/// Tasks are embedded, so removing the taskgroup record removes its tasks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskGroup {
    pub id: TaskGroupId,
    pub app_id: String,
    pub run_as: String,
    /// Name of the version this taskgroup was launched from.
    pub version: String,
    pub status: TaskGroupStatus,
    pub last_status: TaskGroupStatus,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub agent_ip: Option<String>,
    pub tasks: Vec<Task>,
    /// Resource reserved at launch; drives the agent delta until the
    /// cluster reports the taskgroup running or gone.
    pub launch_resource: Resource,
    pub curr_resource: Resource,
    #[serde(default)]
    pub resched_times: u32,
    #[serde(default)]
    pub last_resched_time: u64,
    /// Set when the scheduler itself asked for the kill.
    #[serde(default)]
    pub kill_requested: bool,
    pub start_time: u64,
    pub update_time: u64,
}

impl TaskGroup {
    /// A fresh staging taskgroup with one task per unit of `version`.
    pub fn from_version(id: TaskGroupId, version: &Version) -> Self {
        let now = now_secs();
        let tasks = version
            .workload
            .unit_names()
            .iter()
            .zip(version.workload.unit_resources())
            .enumerate()
            .map(|(i, (name, res))| Task::new(id.task_id(i as u32), name, res))
            .collect();
        let usage = version.all_resource();
        Self {
            app_id: id.app_id.clone(),
            run_as: id.run_as.clone(),
            version: version.name.clone(),
            status: TaskGroupStatus::Staging,
            last_status: TaskGroupStatus::Staging,
            message: String::new(),
            agent_id: None,
            hostname: None,
            agent_ip: None,
            tasks,
            launch_resource: usage,
            curr_resource: usage,
            resched_times: 0,
            last_resched_time: 0,
            kill_requested: false,
            start_time: now,
            update_time: now,
            id,
        }
    }

    pub fn index(&self) -> u32 {
        self.id.index
    }

    /// Storage key: `{run_as}/{app}/{taskgroup_id}`.
    pub fn table_key(&self) -> String {
        taskgroup_key(&self.run_as, &self.app_id, &self.id.to_string())
    }

    pub fn set_status(&mut self, status: TaskGroupStatus) {
        if self.status != status {
            self.last_status = self.status;
            self.status = status;
        }
        self.update_time = now_secs();
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn task_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| &t.id == id)
    }
}

pub fn taskgroup_key(run_as: &str, app_id: &str, taskgroup_id: &str) -> String {
    format!("{run_as}/{app_id}/{taskgroup_id}")
}

// ── Agents ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueRange {
    pub begin: u64,
    pub end: u64,
}

/// A host attribute advertised by an agent or injected by a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Attribute {
    Scalar(f64),
    Text(String),
    Set(Vec<String>),
    Ranges(Vec<ValueRange>),
}

impl Attribute {
    /// Text form used by text-matching constraint operators.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Attribute::Scalar(v) => Some(v.to_string()),
            Attribute::Text(s) => Some(s.clone()),
            Attribute::Set(_) | Attribute::Ranges(_) => None,
        }
    }
}

/// Agent capacity and attributes as last reported by the cluster manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentInfo {
    pub agent_id: String,
    pub hostname: String,
    pub ip: String,
    pub total: Resource,
    pub used: Resource,
    #[serde(default)]
    pub attributes: HashMap<String, Attribute>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Agent {
    /// Inner IP of the agent. Reservations stay keyed by hostname.
    pub key: String,
    pub agent_info: AgentInfo,
    pub last_sync_time: u64,
    #[serde(default)]
    pub disabled: bool,
}

/// Resource reserved on one agent by launches the cluster has not yet
/// reflected in its offers.
///
/// The delta fields always equal the sum over `taskgroups`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentSchedInfo {
    pub hostname: String,
    pub delta_cpu: f64,
    pub delta_mem: f64,
    pub delta_disk: f64,
    pub taskgroups: BTreeMap<String, Resource>,
}

impl AgentSchedInfo {
    pub fn new(hostname: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            ..Default::default()
        }
    }

    pub fn delta(&self) -> Resource {
        Resource::new(self.delta_cpu, self.delta_mem, self.delta_disk)
    }

    /// Recompute the delta fields from the per-taskgroup entries.
    pub fn recompute(&mut self) {
        let sum: Resource = self.taskgroups.values().sum();
        self.delta_cpu = sum.cpus;
        self.delta_mem = sum.mem;
        self.delta_disk = sum.disk;
    }
}

// ── Deployment ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpgradeOrder {
    /// Start the replacement before killing the old taskgroup.
    #[default]
    CreateFirst,
    /// Kill the old taskgroup before starting the replacement.
    DeleteFirst,
}

/// Rolling-update pacing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpgradeStrategy {
    /// Extra taskgroups allowed above the defined instance count.
    pub max_surge: u32,
    /// Taskgroups allowed to be not running during the update.
    pub max_unavailable: u32,
    #[serde(default)]
    pub order: UpgradeOrder,
}

impl Default for UpgradeStrategy {
    fn default() -> Self {
        Self {
            max_surge: 1,
            max_unavailable: 0,
            order: UpgradeOrder::CreateFirst,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RollingOp {
    pub op: OpType,
    pub from_version: String,
    pub to_version: String,
    pub started: u64,
}

/// A deployment drives version rollouts of one application.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deployment {
    pub name: String,
    pub run_as: String,
    pub app_id: String,
    pub strategy: UpgradeStrategy,
    #[serde(default)]
    pub curr_rolling_op: Option<RollingOp>,
    #[serde(default)]
    pub is_in_rolling: bool,
    #[serde(default)]
    pub message: String,
    pub updated: u64,
}

impl Deployment {
    /// Storage key: `{run_as}/{name}`.
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.run_as, self.name)
    }
}
