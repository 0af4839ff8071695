//! Shared handles every scheduler component works through.

use std::sync::Arc;

use offergrid_metrics::MetricsSink;
use offergrid_offer::{AgentDeltaTracker, OfferPool};
use offergrid_state::StateStore;

use crate::collab::{ClientDecliner, ClusterClient, PluginManager, ServiceExporter};
use crate::config::SchedulerConfig;
use crate::error::SchedulerResult;

pub struct SchedulerContext {
    pub config: SchedulerConfig,
    pub store: StateStore,
    pub offers: Arc<OfferPool>,
    pub deltas: Arc<AgentDeltaTracker>,
    pub client: Arc<dyn ClusterClient>,
    pub exporter: Arc<dyn ServiceExporter>,
    pub plugins: Arc<dyn PluginManager>,
    pub metrics: Arc<dyn MetricsSink>,
}

impl SchedulerContext {
    /// Wire the offer pool and delta tracker to `store` and `client`.
    pub fn new(
        config: SchedulerConfig,
        store: StateStore,
        client: Arc<dyn ClusterClient>,
        exporter: Arc<dyn ServiceExporter>,
        plugins: Arc<dyn PluginManager>,
        metrics: Arc<dyn MetricsSink>,
    ) -> SchedulerResult<Self> {
        let deltas = Arc::new(AgentDeltaTracker::load(store.clone())?);
        let offers = Arc::new(OfferPool::new(
            deltas.clone(),
            Arc::new(ClientDecliner(client.clone())),
            config.offer_lifetime(),
        ));
        Ok(Self {
            config,
            store,
            offers,
            deltas,
            client,
            exporter,
            plugins,
            metrics,
        })
    }
}
