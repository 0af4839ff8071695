//! Shared fixtures for scheduler integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use offergrid_metrics::NoopMetrics;
use offergrid_offer::Offer;
use offergrid_scheduler::{
    ClusterClient, ClusterEvent, Engine, NoPlugins, NoopExporter, SchedulerConfig,
    SchedulerContext, SchedulerError, SchedulerResult,
};
use offergrid_state::{
    AgentInfo, ContainerSpec, Resource, RestartPolicy, StateStore, TaskGroup, Transaction,
    TransactionStatus, Version, Workload,
};

/// Cluster client that records every call.
#[derive(Default)]
pub struct FakeCluster {
    pub launches: Mutex<Vec<(String, Vec<String>)>>,
    pub kills: Mutex<Vec<String>>,
    pub declines: Mutex<Vec<String>>,
    pub agents: Mutex<Vec<AgentInfo>>,
    pub fail_launch: Mutex<bool>,
}

impl FakeCluster {
    pub fn launched(&self) -> usize {
        self.launches.lock().unwrap().iter().map(|(_, tgs)| tgs.len()).sum()
    }

    pub fn killed(&self) -> Vec<String> {
        self.kills.lock().unwrap().clone()
    }

    pub fn declined(&self) -> Vec<String> {
        self.declines.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn subscribe(&self) -> SchedulerResult<mpsc::Receiver<ClusterEvent>> {
        let (_tx, rx) = mpsc::channel(1);
        Ok(rx)
    }

    async fn launch(
        &self,
        offer: &Offer,
        _version: &Version,
        taskgroups: &[TaskGroup],
    ) -> SchedulerResult<()> {
        if *self.fail_launch.lock().unwrap() {
            return Err(SchedulerError::Cluster("launch rejected".into()));
        }
        self.launches.lock().unwrap().push((
            offer.id.clone(),
            taskgroups.iter().map(|tg| tg.id.to_string()).collect(),
        ));
        Ok(())
    }

    async fn kill(&self, _agent_id: Option<&str>, task_id: &str) -> SchedulerResult<()> {
        self.kills.lock().unwrap().push(task_id.to_string());
        Ok(())
    }

    async fn decline(&self, offer_ids: Vec<String>) -> SchedulerResult<()> {
        self.declines.lock().unwrap().extend(offer_ids);
        Ok(())
    }

    async fn list_agents(&self) -> SchedulerResult<Vec<AgentInfo>> {
        Ok(self.agents.lock().unwrap().clone())
    }
}

pub struct Harness {
    pub engine: Engine,
    pub cluster: Arc<FakeCluster>,
    pub store: StateStore,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    pub fn with_config(config: SchedulerConfig) -> Self {
        let store = StateStore::open_in_memory().unwrap();
        let cluster = Arc::new(FakeCluster::default());
        let ctx = SchedulerContext::new(
            config,
            store.clone(),
            cluster.clone(),
            Arc::new(NoopExporter),
            Arc::new(NoPlugins),
            Arc::new(NoopMetrics),
        )
        .unwrap();
        Self {
            engine: Engine::new(Arc::new(ctx)),
            cluster,
            store,
        }
    }

    pub fn context(&self) -> &Arc<SchedulerContext> {
        self.engine.context()
    }

    /// Hand the pool one offer per host.
    pub async fn offer(&self, hosts: &[&str], resources: Resource) {
        let offers = hosts
            .iter()
            .enumerate()
            .map(|(i, host)| Offer {
                id: format!("offer-{host}-{i}-{}", offergrid_state::now_nanos()),
                agent_id: format!("agent-{host}"),
                hostname: host.to_string(),
                ip: format!("10.0.0.{}", i + 1),
                resources,
                attributes: HashMap::new(),
            })
            .collect();
        self.context().offers.add_offers(offers).await.unwrap();
    }

    /// Step a transaction until it leaves `INIT` or `max_steps` runs out.
    pub async fn drive(&self, txn: &Transaction, max_steps: usize) -> Transaction {
        let mut current = txn.clone();
        for _ in 0..max_steps {
            current = self
                .engine
                .run_transaction_once(&txn.namespace, &txn.transaction_id)
                .await
                .unwrap()
                .expect("transaction exists");
            if current.status != TransactionStatus::Init {
                break;
            }
        }
        current
    }
}

pub fn version(ns: &str, app: &str, instances: u32) -> Version {
    Version {
        id: app.into(),
        name: String::new(),
        run_as: ns.into(),
        instances,
        workload: Workload::App {
            containers: vec![ContainerSpec {
                name: "main".into(),
                image: format!("registry/{app}:1"),
                resources: Resource::new(1.0, 64.0, 64.0),
                limit_resources: None,
                network_mode: "bridge".into(),
                env: Default::default(),
            }],
        },
        constraints: None,
        kill_policy: None,
        restart_policy: RestartPolicy::default(),
        health_check: None,
        labels: Default::default(),
    }
}

pub fn big() -> Resource {
    Resource::new(4.0, 1024.0, 1024.0)
}
