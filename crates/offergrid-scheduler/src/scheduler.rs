//! Role control.
//!
//! Only the elected master schedules. [`Scheduler::become_master`] loads
//! the locks and caches, re-queues unfinished transactions and starts the
//! background tasks; [`Scheduler::become_slave`] stops them and returns
//! every held offer.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use offergrid_metrics::MetricsSink;
use offergrid_state::StateStore;

use crate::agent_sync;
use crate::checker::{CheckerControl, DataChecker};
use crate::collab::{ClusterClient, PluginManager, ServiceExporter};
use crate::config::SchedulerConfig;
use crate::context::SchedulerContext;
use crate::engine::Engine;
use crate::error::{SchedulerError, SchedulerResult};
use crate::events;
use crate::reconciler::Reconciler;

struct MasterHandles {
    shutdown: watch::Sender<bool>,
    checker: mpsc::Sender<CheckerControl>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct Scheduler {
    engine: Engine,
    reconciler: Arc<Reconciler>,
    checker: Arc<DataChecker>,
    master: Mutex<Option<MasterHandles>>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        store: StateStore,
        client: Arc<dyn ClusterClient>,
        exporter: Arc<dyn ServiceExporter>,
        plugins: Arc<dyn PluginManager>,
        metrics: Arc<dyn MetricsSink>,
    ) -> SchedulerResult<Self> {
        let ctx = Arc::new(SchedulerContext::new(
            config, store, client, exporter, plugins, metrics,
        )?);
        let engine = Engine::new(ctx);
        Ok(Self {
            reconciler: Arc::new(Reconciler::new(engine.clone())),
            checker: Arc::new(DataChecker::new(engine.clone())),
            engine,
            master: Mutex::new(None),
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn context(&self) -> &Arc<SchedulerContext> {
        self.engine.context()
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn checker(&self) -> &Arc<DataChecker> {
        &self.checker
    }

    pub async fn is_master(&self) -> bool {
        self.master.lock().await.is_some()
    }

    /// Fail with `NotMaster` unless this instance is scheduling.
    pub async fn ensure_master(&self) -> SchedulerResult<()> {
        if self.is_master().await {
            Ok(())
        } else {
            Err(SchedulerError::NotMaster)
        }
    }

    /// Take over scheduling. A no-op when already master.
    pub async fn become_master(&self) -> SchedulerResult<()> {
        let mut master = self.master.lock().await;
        if master.is_some() {
            return Ok(());
        }
        let ctx = self.engine.context().clone();

        ctx.store.init_lock_pool()?;
        ctx.store.init_cache_mgr()?;
        self.engine.queue().restart();
        let recovered = self.engine.recover()?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (status_tx, status_rx) = mpsc::channel(ctx.config.events.status_buffer.max(1));
        let (checker_tx, checker_rx) = mpsc::channel(8);
        let mut tasks = Vec::new();

        for worker in 0..ctx.config.workers.max(1) {
            let engine = self.engine.clone();
            let rx = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move { engine.run_worker(worker, rx).await }));
        }
        {
            let engine = self.engine.clone();
            let rx = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move { engine.run_sweeper(rx).await }));
        }
        tasks.push(tokio::spawn(events::run_offer_sweeper(
            ctx.clone(),
            shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(agent_sync::run(ctx.clone(), shutdown_rx.clone())));
        tasks.push(tokio::spawn(events::run(
            ctx.clone(),
            status_tx,
            shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(
            self.reconciler.clone().run(status_rx, shutdown_rx),
        ));
        {
            let checker = self.checker.clone();
            tasks.push(tokio::spawn(async move { checker.run(checker_rx).await }));
        }
        if checker_tx.send(CheckerControl::Open).await.is_err() {
            warn!("consistency checker did not start");
        }

        info!(
            recovered,
            workers = ctx.config.workers.max(1),
            "became master"
        );
        *master = Some(MasterHandles {
            shutdown,
            checker: checker_tx,
            tasks,
        });
        Ok(())
    }

    /// Stop scheduling and return held offers. A no-op when not master.
    pub async fn become_slave(&self) -> SchedulerResult<()> {
        let Some(handles) = self.master.lock().await.take() else {
            return Ok(());
        };
        let ctx = self.engine.context();

        let _ = handles.shutdown.send(true);
        let _ = handles.checker.send(CheckerControl::Stop).await;
        self.engine.queue().shut_down();
        for task in handles.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }

        let declined = ctx.offers.decline_all().await?;
        ctx.metrics.offers_held(ctx.offers.len());
        ctx.store.uninit_cache_mgr();
        info!(declined, "became slave");
        Ok(())
    }
}
