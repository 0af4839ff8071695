//! Collaborators the scheduler talks to but does not own.
//!
//! The cluster manager connection, the service export manager and the
//! plugin manager are trait objects so the core can run against fakes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use offergrid_offer::{Decliner, Offer, OfferError, OfferResult};
use offergrid_state::{AgentInfo, Attribute, TaskGroup, TaskStatus, Version};

use crate::error::SchedulerResult;

/// A task status report from the cluster manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskStatusUpdate {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub agent_id: Option<String>,
    /// Executor-specific status blob (JSON for container workloads).
    #[serde(default)]
    pub data: Option<String>,
}

/// Outcome of one health probe of a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthReport {
    pub task_id: String,
    pub healthy: bool,
    #[serde(default)]
    pub message: String,
}

/// Events delivered on the cluster manager subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterEvent {
    Subscribed { framework_id: String },
    Offers(Vec<Offer>),
    Rescind { offer_id: String },
    Update(TaskStatusUpdate),
    Health(HealthReport),
    Message { agent_id: String, data: Vec<u8> },
    AgentLost { agent_id: String },
    Heartbeat,
    Error(String),
}

/// Connection to the cluster manager.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Open the event stream. The stream ends when the connection drops.
    async fn subscribe(&self) -> SchedulerResult<mpsc::Receiver<ClusterEvent>>;

    /// Launch `taskgroups` on the agent of `offer`, consuming the offer.
    async fn launch(
        &self,
        offer: &Offer,
        version: &Version,
        taskgroups: &[TaskGroup],
    ) -> SchedulerResult<()>;

    async fn kill(&self, agent_id: Option<&str>, task_id: &str) -> SchedulerResult<()>;

    async fn decline(&self, offer_ids: Vec<String>) -> SchedulerResult<()>;

    /// Agents currently registered with the cluster manager.
    async fn list_agents(&self) -> SchedulerResult<Vec<AgentInfo>>;
}

/// Receives taskgroup lifecycle notifications for service discovery.
#[async_trait]
pub trait ServiceExporter: Send + Sync {
    async fn taskgroup_add(&self, taskgroup: &TaskGroup);
    async fn taskgroup_update(&self, taskgroup: &TaskGroup);
    async fn taskgroup_delete(&self, taskgroup: &TaskGroup);
}

/// Supplies extra host attributes for constraint matching.
#[async_trait]
pub trait PluginManager: Send + Sync {
    /// Attributes keyed by host ip. Hosts without extra attributes may be
    /// absent from the result.
    async fn host_attributes(
        &self,
        ips: &[String],
    ) -> SchedulerResult<HashMap<String, HashMap<String, Attribute>>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopExporter;

#[async_trait]
impl ServiceExporter for NoopExporter {
    async fn taskgroup_add(&self, _: &TaskGroup) {}
    async fn taskgroup_update(&self, _: &TaskGroup) {}
    async fn taskgroup_delete(&self, _: &TaskGroup) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoPlugins;

#[async_trait]
impl PluginManager for NoPlugins {
    async fn host_attributes(
        &self,
        _: &[String],
    ) -> SchedulerResult<HashMap<String, HashMap<String, Attribute>>> {
        Ok(HashMap::new())
    }
}

/// Lets the offer pool decline through the cluster client.
pub struct ClientDecliner(pub Arc<dyn ClusterClient>);

#[async_trait]
impl Decliner for ClientDecliner {
    async fn decline(&self, offer_ids: Vec<String>) -> OfferResult<()> {
        self.0
            .decline(offer_ids)
            .await
            .map_err(|e| OfferError::Decline(e.to_string()))
    }
}
