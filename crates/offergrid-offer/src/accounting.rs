//! Agent delta tracking.
//!
//! Between the moment a taskgroup is placed on an agent and the moment the
//! cluster manager's own offers reflect that placement, the scheduler must
//! treat the resource as consumed. Each reservation is recorded per host
//! and per taskgroup; the host aggregate is recomputed from the entries on
//! every change and persisted before the lock is released.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use serde::Serialize;
use tracing::debug;

use offergrid_state::{AgentInfo, AgentSchedInfo, Resource, StateStore};

use crate::error::OfferResult;

/// Per-agent reservations of in-flight scheduling decisions.
pub struct AgentDeltaTracker {
    store: StateStore,
    infos: RwLock<HashMap<String, AgentSchedInfo>>,
}

/// Resource view of one agent with outstanding deltas folded into `used`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AgentResource {
    pub hostname: String,
    pub total: Resource,
    pub used: Resource,
    pub delta: Resource,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ClusterResource {
    pub total: Resource,
    pub used: Resource,
    pub agents: Vec<AgentResource>,
}

impl AgentDeltaTracker {
    /// Load persisted reservations from the store.
    pub fn load(store: StateStore) -> OfferResult<Self> {
        let infos = store
            .list_agent_sched_info()?
            .into_iter()
            .map(|i| (i.hostname.clone(), i))
            .collect::<HashMap<_, _>>();
        debug!(agents = infos.len(), "agent sched info loaded");
        Ok(Self {
            store,
            infos: RwLock::new(infos),
        })
    }

    /// Reserve `delta` for `taskgroup_id` on `hostname`, or clear the
    /// reservation when `delta` is `None`.
    pub fn update_agent_sched_info(
        &self,
        hostname: &str,
        taskgroup_id: &str,
        delta: Option<Resource>,
    ) -> OfferResult<()> {
        let mut infos = self.infos.write().unwrap_or_else(PoisonError::into_inner);
        if delta.is_none() && !infos.contains_key(hostname) {
            return Ok(());
        }
        let info = infos
            .entry(hostname.to_string())
            .or_insert_with(|| AgentSchedInfo::new(hostname));
        let changed = match delta {
            Some(d) => info.taskgroups.insert(taskgroup_id.to_string(), d) != Some(d),
            None => info.taskgroups.remove(taskgroup_id).is_some(),
        };
        if !changed {
            return Ok(());
        }
        info.recompute();
        self.store.save_agent_sched_info(info)?;
        debug!(
            hostname,
            taskgroup = taskgroup_id,
            delta_cpu = info.delta_cpu,
            delta_mem = info.delta_mem,
            delta_disk = info.delta_disk,
            "agent delta updated"
        );
        Ok(())
    }

    pub fn fetch_agent_sched_info(&self, hostname: &str) -> Option<AgentSchedInfo> {
        self.infos
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(hostname)
            .cloned()
    }

    /// Outstanding delta on `hostname` (zero if none).
    pub fn delta(&self, hostname: &str) -> Resource {
        self.infos
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(hostname)
            .map(AgentSchedInfo::delta)
            .unwrap_or_default()
    }

    /// Forget an agent that left the cluster.
    pub fn remove_agent(&self, hostname: &str) -> OfferResult<()> {
        let mut infos = self.infos.write().unwrap_or_else(PoisonError::into_inner);
        if infos.remove(hostname).is_some() {
            self.store.delete_agent_sched_info(hostname)?;
        }
        Ok(())
    }

    /// Summarize agents with outstanding deltas added to their used resource.
    pub fn cluster_resource(&self, agents: &[AgentInfo]) -> ClusterResource {
        let infos = self.infos.read().unwrap_or_else(PoisonError::into_inner);
        let mut summary = ClusterResource::default();
        for agent in agents {
            let delta = infos
                .get(&agent.hostname)
                .map(AgentSchedInfo::delta)
                .unwrap_or_default();
            let used = agent.used + delta;
            summary.total += agent.total;
            summary.used += used;
            summary.agents.push(AgentResource {
                hostname: agent.hostname.clone(),
                total: agent.total,
                used,
                delta,
            });
        }
        summary
    }
}
