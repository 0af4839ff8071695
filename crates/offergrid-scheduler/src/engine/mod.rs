//! Transaction engine.
//!
//! Every application mutation is recorded as a [`Transaction`] and driven
//! by queue workers. A worker loads the transaction, takes the
//! application lock and runs one step of the operation's handler:
//!
//! - the step completes the change: `FINISH`
//! - the step is waiting on offers or on the cluster: stay `INIT`, re-queue
//!   with backoff no shorter than the check interval
//! - the step hits a permanent error: `FAIL`
//!
//! Transactions past their lifetime are moved to `TIMEOUT` by
//! [`Engine::sweep_timeouts`], independent of the workers.

mod api;
mod handlers;
mod placement;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use offergrid_metrics::Outcome;
use offergrid_state::{
    Application, ObjectKind, OpType, Operation, StateStore, TaskGroup, TaskGroupStatus,
    Transaction, TransactionStatus, now_secs,
};

use crate::context::SchedulerContext;
use crate::error::SchedulerResult;
use crate::queue::WorkQueue;
use crate::reconciler::derive_app_status;

pub use handlers::Step;

/// Result of one timeout sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Keys of transactions moved to `TIMEOUT`.
    pub timed_out: Vec<String>,
    /// Number of terminal transactions removed after retention.
    pub collected: usize,
}

#[derive(Clone)]
pub struct Engine {
    ctx: Arc<SchedulerContext>,
    queue: Arc<WorkQueue>,
}

impl Engine {
    pub fn new(ctx: Arc<SchedulerContext>) -> Self {
        let queue = Arc::new(WorkQueue::new(
            Duration::from_millis(ctx.config.queue.backoff_base_ms),
            Duration::from_secs(ctx.config.queue.backoff_max_secs),
        ));
        Self { ctx, queue }
    }

    pub fn context(&self) -> &Arc<SchedulerContext> {
        &self.ctx
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// Persist a new transaction and queue it for the workers.
    fn submit(&self, txn: &Transaction, delay: Duration) -> SchedulerResult<()> {
        self.ctx.store.save_transaction(txn)?;
        self.ctx.metrics.operation(
            &txn.namespace,
            &txn.object_name,
            txn.op_type(),
            Outcome::Started,
        );
        info!(
            namespace = %txn.namespace,
            app = %txn.object_name,
            transaction = %txn.transaction_id,
            op = ?txn.op_type(),
            "transaction submitted"
        );
        self.queue.add_after(&txn.table_key(), delay);
        Ok(())
    }

    fn new_transaction(&self, namespace: &str, app_id: &str, op: Operation) -> Transaction {
        Transaction::new(
            namespace,
            app_id,
            ObjectKind::Application,
            op,
            self.ctx.config.transaction.check_interval_secs,
            self.ctx.config.transaction.lifetime_secs,
        )
    }

    /// Queue every unfinished transaction; run when taking over as master.
    pub fn recover(&self) -> SchedulerResult<usize> {
        let mut n = 0;
        for txn in self.ctx.store.list_all_transactions()? {
            if !txn.is_terminal() {
                self.queue.add(&txn.table_key());
                n += 1;
            }
        }
        info!(transactions = n, "unfinished transactions requeued");
        Ok(n)
    }

    /// Run one step of transaction `{namespace}/{id}`.
    ///
    /// Returns the transaction as stored afterwards, or `None` if it no
    /// longer exists.
    pub async fn run_transaction_once(
        &self,
        namespace: &str,
        id: &str,
    ) -> SchedulerResult<Option<Transaction>> {
        let store = &self.ctx.store;
        let Some(peek) = store.fetch_transaction(namespace, id)? else {
            return Ok(None);
        };
        let _guard = store
            .lock_application(&peek.namespace, &peek.object_name)
            .await;
        let Some(mut txn) = store.fetch_transaction(namespace, id)? else {
            return Ok(None);
        };
        if txn.is_terminal() {
            return Ok(Some(txn));
        }
        if txn.is_expired(now_secs()) {
            self.expire(&mut txn)?;
            return Ok(Some(txn));
        }

        txn.attempts += 1;
        let op = txn.op_type();
        let result = self.dispatch(&mut txn).await;
        match result {
            Ok(Step::Done(msg)) => {
                info!(transaction = %txn.transaction_id, ?op, %msg, "transaction finished");
                txn.finish(msg);
                store.save_transaction(&txn)?;
                self.settle_app(&txn, Outcome::Finished)?;
            }
            Ok(Step::Pending(msg)) => {
                debug!(transaction = %txn.transaction_id, ?op, attempts = txn.attempts, %msg, "transaction pending");
                txn.message = msg;
                store.save_transaction(&txn)?;
            }
            Err(e) if e.is_transient() => {
                warn!(transaction = %txn.transaction_id, ?op, error = %e, "transaction step failed, will retry");
                txn.message = e.to_string();
                store.save_transaction(&txn)?;
            }
            Err(e) => {
                warn!(transaction = %txn.transaction_id, ?op, error = %e, "transaction failed");
                txn.fail(e.to_string());
                store.save_transaction(&txn)?;
                self.settle_app(&txn, Outcome::Failed)?;
            }
        }
        Ok(Some(txn))
    }

    async fn dispatch(&self, txn: &mut Transaction) -> SchedulerResult<Step> {
        if !matches!(txn.op_type(), OpType::Delete | OpType::Reschedule) {
            self.ensure_not_deleting(txn)?;
        }
        match txn.cur_op.clone() {
            Operation::Launch { version, .. } => self.handle_launch(txn, &version).await,
            Operation::Delete { .. } => self.handle_delete(txn).await,
            Operation::Scale { version, instances } => {
                self.handle_scale(txn, &version, instances, &[]).await
            }
            Operation::InnerScale {
                version,
                instances,
                remove_indices,
            } => {
                self.handle_scale(txn, &version, instances, &remove_indices)
                    .await
            }
            Operation::Update { version, strategy } | Operation::Rollback { version, strategy } => {
                self.handle_rolling(txn, &version, &strategy).await
            }
            Operation::Reschedule {
                taskgroup_id,
                replacement,
                ..
            } => {
                self.handle_reschedule(txn, &taskgroup_id, replacement)
                    .await
            }
        }
    }

    /// Move an expired transaction to `TIMEOUT`. Caller holds the app lock.
    fn expire(&self, txn: &mut Transaction) -> SchedulerResult<()> {
        if !txn.timeout() {
            return Ok(());
        }
        warn!(
            namespace = %txn.namespace,
            app = %txn.object_name,
            transaction = %txn.transaction_id,
            op = ?txn.op_type(),
            "transaction timed out"
        );
        self.ctx.store.save_transaction(txn)?;
        self.queue.forget(&txn.table_key());
        self.settle_app(txn, Outcome::Timeout)
    }

    fn settle_app(&self, txn: &Transaction, outcome: Outcome) -> SchedulerResult<()> {
        self.ctx
            .metrics
            .operation(&txn.namespace, &txn.object_name, txn.op_type(), outcome);
        release_app(&self.ctx.store, txn, outcome)
    }

    /// Time out expired transactions and collect terminal ones past
    /// retention.
    pub async fn sweep_timeouts(&self) -> SchedulerResult<SweepReport> {
        let now = now_secs();
        let retention = self.ctx.config.transaction.retention_secs;
        let store = &self.ctx.store;
        let mut report = SweepReport::default();

        for txn in store.list_all_transactions()? {
            if txn.is_terminal() {
                if txn
                    .finish_time
                    .is_some_and(|t| t.saturating_add(retention) <= now)
                {
                    store.delete_transaction(&txn.namespace, &txn.transaction_id)?;
                    report.collected += 1;
                }
                continue;
            }
            if !txn.is_expired(now) {
                continue;
            }
            let _guard = store
                .lock_application(&txn.namespace, &txn.object_name)
                .await;
            let Some(mut fresh) = store.fetch_transaction(&txn.namespace, &txn.transaction_id)?
            else {
                continue;
            };
            if fresh.is_terminal() {
                continue;
            }
            self.expire(&mut fresh)?;
            report.timed_out.push(fresh.table_key());
        }

        if !report.timed_out.is_empty() || report.collected > 0 {
            info!(
                timed_out = report.timed_out.len(),
                collected = report.collected,
                "transaction sweep"
            );
        }
        Ok(report)
    }

    async fn process(&self, key: &str) {
        let Some((namespace, id)) = key.split_once('/') else {
            warn!(key, "malformed transaction key");
            self.queue.done(key);
            return;
        };
        match self.run_transaction_once(namespace, id).await {
            Ok(Some(txn)) if txn.status == TransactionStatus::Init => {
                self.queue
                    .add_rate_limited(key, Duration::from_secs(txn.check_interval));
            }
            Ok(_) => self.queue.forget(key),
            Err(e) => {
                error!(key, error = %e, "transaction step could not be persisted");
                self.queue
                    .add_rate_limited(key, self.ctx.config.check_interval());
            }
        }
        self.queue.done(key);
    }

    /// Process queued transactions until shutdown.
    pub async fn run_worker(&self, worker: usize, mut shutdown: watch::Receiver<bool>) {
        debug!(worker, "transaction worker started");
        loop {
            tokio::select! {
                key = self.queue.get() => match key {
                    Some(key) => self.process(&key).await,
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        debug!(worker, "transaction worker stopped");
    }

    /// Periodic timeout sweep until shutdown.
    pub async fn run_sweeper(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.ctx.config.transaction.sweep_interval_secs.max(1));
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.sweep_timeouts().await {
                        warn!(error = %e, "transaction sweep failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}

/// Release the application from a transaction that just ended and
/// recompute its status from the taskgroups. An unfinished rolling
/// operation also clears the deployment's rolling flag.
pub(crate) fn release_app(
    store: &StateStore,
    txn: &Transaction,
    outcome: Outcome,
) -> SchedulerResult<()> {
    let op = txn.op_type();
    if matches!(op, OpType::Update | OpType::Rollback) && outcome != Outcome::Finished {
        if let Some(mut dep) = store.fetch_deployment(&txn.namespace, &txn.object_name)? {
            dep.is_in_rolling = false;
            dep.curr_rolling_op = None;
            dep.message = txn.message.clone();
            dep.updated = now_secs();
            store.save_deployment(&dep)?;
        }
    }

    let Some(mut app) = store.fetch_application(&txn.namespace, &txn.object_name)? else {
        return Ok(());
    };
    if app.sub_status == Some(op) {
        app.sub_status = None;
    }
    if outcome != Outcome::Finished {
        app.message = format!("{op:?} {outcome}: {}", txn.message);
    } else if op != OpType::Reschedule {
        app.message = txn.message.clone();
    }
    let groups = store.list_taskgroups(&app.run_as, &app.id)?;
    refresh_app(&mut app, &groups);
    store.save_application(&app)?;
    Ok(())
}

/// Recompute instance counts, and the status when no operation holds the
/// application.
pub(crate) fn refresh_app(app: &mut Application, groups: &[TaskGroup]) {
    app.instances = groups.len() as u32;
    app.running_instances = groups
        .iter()
        .filter(|tg| tg.status == TaskGroupStatus::Running)
        .count() as u32;
    if app.sub_status.is_none() {
        app.set_status(derive_app_status(groups, app.define_instances));
    } else {
        app.updated = now_secs();
    }
}
