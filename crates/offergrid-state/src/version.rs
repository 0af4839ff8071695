//! Application version definitions.
//!
//! A [`Version`] is the definition snapshot an application's taskgroups
//! are launched from. The workload is a tagged union over the two kinds
//! of executor: containers (`APP`) and bare processes (`PROCESS`); every
//! per-kind computation lives on [`Workload`].

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{StateError, StateResult};
use crate::ids::check_component;
use crate::resource::Resource;
use crate::types::{TaskGroupStatus, ValueRange};

/// Memory (MB) reserved for the container executor of every taskgroup.
pub const CONTAINER_EXECUTOR_MEM: f64 = 64.0;
/// Disk (MB) reserved for the container executor of every taskgroup.
pub const CONTAINER_EXECUTOR_DISK: f64 = 64.0;

/// Definition snapshot of an application.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Version {
    /// Application id this version belongs to.
    pub id: String,
    /// Version name; also the storage key suffix.
    pub name: String,
    pub run_as: String,
    pub instances: u32,
    pub workload: Workload,
    #[serde(default)]
    pub constraints: Option<Constraints>,
    #[serde(default)]
    pub kill_policy: Option<KillPolicy>,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    #[serde(default)]
    pub health_check: Option<HealthCheckPolicy>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// The two executor kinds a version can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkloadKind {
    App,
    Process,
}

/// The runnable units of a version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Workload {
    App { containers: Vec<ContainerSpec> },
    Process { processes: Vec<ProcessSpec> },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub resources: Resource,
    #[serde(default)]
    pub limit_resources: Option<Resource>,
    /// `bridge`, `host`, or a user-defined network.
    #[serde(default)]
    pub network_mode: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessSpec {
    pub name: String,
    pub start_cmd: String,
    #[serde(default)]
    pub uris: Vec<String>,
    pub resources: Resource,
    #[serde(default)]
    pub limit_resources: Option<Resource>,
}

/// Runtime status blob the container executor attaches to task updates.
#[derive(Debug, Deserialize)]
struct ContainerStatusData {
    #[serde(rename = "IPAddress", default)]
    ip_address: String,
    #[serde(rename = "NetworkMode", default)]
    network_mode: String,
}

impl Workload {
    pub fn kind(&self) -> WorkloadKind {
        match self {
            Workload::App { .. } => WorkloadKind::App,
            Workload::Process { .. } => WorkloadKind::Process,
        }
    }

    /// Number of tasks one taskgroup of this workload holds.
    pub fn unit_count(&self) -> usize {
        match self {
            Workload::App { containers } => containers.len(),
            Workload::Process { processes } => processes.len(),
        }
    }

    /// Names of the runnable units, in task-index order.
    pub fn unit_names(&self) -> Vec<String> {
        match self {
            Workload::App { containers } => containers.iter().map(|c| c.name.clone()).collect(),
            Workload::Process { processes } => processes.iter().map(|p| p.name.clone()).collect(),
        }
    }

    /// Per-unit requested resources, in task-index order.
    pub fn unit_resources(&self) -> Vec<Resource> {
        match self {
            Workload::App { containers } => containers.iter().map(|c| c.resources).collect(),
            Workload::Process { processes } => processes.iter().map(|p| p.resources).collect(),
        }
    }

    /// Total resource one taskgroup of this workload consumes on an agent.
    ///
    /// Containers pay a fixed executor overhead in memory and disk;
    /// processes run under the agent's own executor and do not.
    pub fn resource_usage(&self) -> Resource {
        match self {
            Workload::App { containers } => {
                let units: Resource = containers.iter().map(|c| c.resources).sum();
                units + Resource::new(0.0, CONTAINER_EXECUTOR_MEM, CONTAINER_EXECUTOR_DISK)
            }
            Workload::Process { processes } => processes.iter().map(|p| p.resources).sum(),
        }
    }

    /// Fill in missing requests/limits from each other.
    pub fn default_resources(&mut self) -> StateResult<()> {
        match self {
            Workload::App { containers } => {
                for c in containers.iter_mut() {
                    default_unit(&c.name, &mut c.resources, &mut c.limit_resources)?;
                }
            }
            Workload::Process { processes } => {
                for p in processes.iter_mut() {
                    default_unit(&p.name, &mut p.resources, &mut p.limit_resources)?;
                }
            }
        }
        Ok(())
    }

    /// Address a running task is reachable at.
    ///
    /// Containers on a bridge/overlay network report their own address in
    /// the executor status blob; host-network containers and processes are
    /// reachable on the agent address.
    pub fn runtime_ip(&self, status_data: Option<&str>, agent_ip: Option<&str>) -> Option<String> {
        match self {
            Workload::App { .. } => {
                let parsed = status_data
                    .and_then(|raw| serde_json::from_str::<ContainerStatusData>(raw).ok());
                match parsed {
                    Some(data) if data.network_mode != "host" && !data.ip_address.is_empty() => {
                        Some(data.ip_address)
                    }
                    _ => agent_ip.map(str::to_string),
                }
            }
            Workload::Process { .. } => agent_ip.map(str::to_string),
        }
    }
}

fn default_unit(name: &str, request: &mut Resource, limit: &mut Option<Resource>) -> StateResult<()> {
    if request.is_zero()
        && let Some(l) = limit
    {
        *request = *l;
    }
    if limit.is_none() {
        *limit = Some(*request);
    }
    let positive = |x: f64| x.is_finite() && x > 0.0;
    if !positive(request.cpus) || !positive(request.mem) {
        return Err(StateError::InvalidVersion(format!(
            "unit {name} requests no usable cpu or memory"
        )));
    }
    Ok(())
}

// ── Constraints ────────────────────────────────────────────────────

/// All groups must pass (intersection); inside a group any item may pass (union).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Constraints {
    pub intersection: Vec<ConstraintGroup>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConstraintGroup {
    pub union: Vec<ConstraintData>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConstraintData {
    /// Attribute name; `hostname` and `InnerIP` address the agent itself.
    pub name: String,
    pub operator: ConstraintOperator,
    #[serde(rename = "type")]
    pub value_type: ConstValueType,
    #[serde(default)]
    pub scalar: Option<f64>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub set: Option<Vec<String>>,
    #[serde(default)]
    pub ranges: Option<Vec<ValueRange>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConstraintOperator {
    /// At most one taskgroup of the application per attribute value.
    Unique,
    /// At most N taskgroups of the application per attribute value.
    MaxPer,
    /// The attribute must equal the text value or be one of the set.
    Cluster,
    /// The attribute must match the regular expression.
    Like,
    /// The attribute must not match the regular expression.
    Unlike,
    /// The scalar attribute must be strictly greater than the value.
    Greater,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConstValueType {
    Scalar,
    Text,
    Set,
    Range,
}

impl ConstraintData {
    /// Every clause must carry the data its declared type promises.
    pub fn check(&self) -> StateResult<()> {
        let missing = match self.value_type {
            ConstValueType::Scalar => self.scalar.is_none(),
            ConstValueType::Text => self.text.is_none(),
            ConstValueType::Set => self.set.is_none(),
            ConstValueType::Range => {
                // An absent or empty range list is accepted as-is.
                for r in self.ranges.iter().flatten() {
                    if r.begin > r.end {
                        return Err(StateError::InvalidConstraint {
                            name: self.name.clone(),
                            reason: format!("range {}..{} is inverted", r.begin, r.end),
                        });
                    }
                }
                false
            }
        };
        if missing {
            return Err(StateError::InvalidConstraint {
                name: self.name.clone(),
                reason: format!("{:?} value missing", self.value_type),
            });
        }
        Ok(())
    }
}

// ── Policies ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KillPolicy {
    pub grace_period_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RestartPolicyKind {
    Never,
    OnFailure,
    Always,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RestartPolicy {
    pub policy: RestartPolicyKind,
    /// Base delay before a replacement is scheduled.
    pub interval_secs: u64,
    /// Multiplier applied per previous reschedule.
    pub backoff: f64,
    /// Zero means unlimited.
    pub max_times: u32,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            policy: RestartPolicyKind::OnFailure,
            interval_secs: 0,
            backoff: 1.0,
            max_times: 0,
        }
    }
}

impl RestartPolicy {
    /// Whether a taskgroup that ended in `status` after `resched_times`
    /// replacements should be replaced again.
    pub fn should_restart(&self, status: TaskGroupStatus, resched_times: u32) -> bool {
        if self.max_times > 0 && resched_times >= self.max_times {
            return false;
        }
        match self.policy {
            RestartPolicyKind::Never => false,
            RestartPolicyKind::OnFailure => status.is_failure(),
            RestartPolicyKind::Always => status.is_failure() || status == TaskGroupStatus::Finish,
        }
    }

    /// Delay before the next replacement, capped at one hour.
    pub fn delay(&self, resched_times: u32) -> Duration {
        let factor = self.backoff.max(1.0).powi(resched_times.min(32) as i32);
        let secs = (self.interval_secs as f64 * factor).min(3600.0);
        Duration::from_secs_f64(secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthCheckPolicy {
    /// Consecutive failed checks after which the taskgroup is replaced.
    pub max_consecutive_failures: u32,
}

// ── Version ────────────────────────────────────────────────────────

impl Version {
    pub fn kind(&self) -> WorkloadKind {
        self.workload.kind()
    }

    pub fn all_cpus(&self) -> f64 {
        self.workload.resource_usage().cpus
    }

    pub fn all_mems(&self) -> f64 {
        self.workload.resource_usage().mem
    }

    pub fn all_disk(&self) -> f64 {
        self.workload.resource_usage().disk
    }

    pub fn all_resource(&self) -> Resource {
        self.workload.resource_usage()
    }

    /// Validate every constraint clause up front.
    pub fn check_constraints(&self) -> StateResult<()> {
        let Some(constraints) = &self.constraints else {
            return Ok(());
        };
        for group in &constraints.intersection {
            for item in &group.union {
                item.check()?;
            }
        }
        Ok(())
    }

    /// Structural validation plus resource defaulting, run before a
    /// version is persisted.
    pub fn validate(&mut self) -> StateResult<()> {
        check_component("app id", &self.id)?;
        check_component("namespace", &self.run_as)?;
        if self.name.is_empty() {
            return Err(StateError::InvalidVersion("version name is empty".into()));
        }
        if self.workload.unit_count() == 0 {
            return Err(StateError::InvalidVersion(format!(
                "{}/{} defines no containers or processes",
                self.run_as, self.id
            )));
        }
        self.check_constraints()?;
        self.workload.default_resources()
    }

    /// Deep equality ignoring the version name.
    pub fn same_content(&self, other: &Version) -> bool {
        let mut a = self.clone();
        a.name.clear();
        let mut b = other.clone();
        b.name.clear();
        a == b
    }

    /// Storage key: `{run_as}/{app}/{name}`.
    pub fn table_key(&self) -> String {
        format!("{}/{}/{}", self.run_as, self.id, self.name)
    }
}
