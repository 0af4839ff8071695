//! Entry points that validate a request, mark the application and submit
//! the transaction.

use std::time::Duration;

use tracing::{info, warn};

use offergrid_metrics::Outcome;
use offergrid_state::{
    AppStatus, Application, Deployment, OpType, Operation, RollingOp, TaskGroupId,
    Transaction, UpgradeStrategy, Version, WorkloadKind, now_secs,
};

use super::Engine;
use super::placement::new_version_name;
use crate::error::{SchedulerError, SchedulerResult};

fn not_found(namespace: &str, app: &str) -> SchedulerError {
    SchedulerError::AppNotFound {
        namespace: namespace.to_string(),
        app: app.to_string(),
    }
}

/// Refuse a new operation while another one owns the application.
fn ensure_idle(app: &Application) -> SchedulerResult<()> {
    if app.status == AppStatus::RollingUpdate {
        return Err(SchedulerError::InRollingUpdate {
            namespace: app.run_as.clone(),
            app: app.id.clone(),
        });
    }
    if let Some(op) = app.sub_status {
        return Err(SchedulerError::UnderOperation {
            namespace: app.run_as.clone(),
            app: app.id.clone(),
            reason: format!("{op:?} in progress"),
        });
    }
    Ok(())
}

impl Engine {
    fn fetch_app(&self, namespace: &str, app_id: &str) -> SchedulerResult<Application> {
        self.ctx
            .store
            .fetch_application(namespace, app_id)?
            .ok_or_else(|| not_found(namespace, app_id))
    }

    /// Create an application from `version` and launch its taskgroups.
    pub async fn launch_application(&self, mut version: Version) -> SchedulerResult<Transaction> {
        version.name = new_version_name();
        version.validate()?;
        let store = &self.ctx.store;
        let _guard = store.lock_application(&version.run_as, &version.id).await;
        if store.fetch_application(&version.run_as, &version.id)?.is_some() {
            return Err(SchedulerError::AppExists {
                namespace: version.run_as.clone(),
                app: version.id.clone(),
            });
        }

        let mut app = Application::new(
            &version.run_as,
            &version.id,
            &self.ctx.config.cluster_id,
            version.kind(),
            version.instances,
        );
        app.current_version = version.name.clone();
        app.sub_status = Some(OpType::Launch);
        app.set_status(AppStatus::Operating);
        store.save_version(&version)?;
        store.save_application(&app)?;

        let txn = self.new_transaction(
            &app.run_as,
            &app.id,
            Operation::Launch {
                version: version.name.clone(),
                reason: "launch".into(),
            },
        );
        self.submit(&txn, Duration::ZERO)?;
        Ok(txn)
    }

    /// Kill every taskgroup of the application and remove it.
    ///
    /// When nothing is left running the application is removed before
    /// returning; otherwise removal finishes asynchronously.
    pub async fn delete_application(
        &self,
        namespace: &str,
        app_id: &str,
        kind: WorkloadKind,
        enforce: bool,
    ) -> SchedulerResult<Transaction> {
        let store = &self.ctx.store;
        let _guard = store.lock_application(namespace, app_id).await;
        let mut app = self.fetch_app(namespace, app_id)?;
        if app.kind != kind {
            return Err(SchedulerError::KindMismatch {
                namespace: namespace.to_string(),
                app: app_id.to_string(),
                expected: kind,
                actual: app.kind,
            });
        }
        if app.status == AppStatus::RollingUpdate && !enforce {
            return Err(SchedulerError::InRollingUpdate {
                namespace: namespace.to_string(),
                app: app_id.to_string(),
            });
        }
        if app.sub_status == Some(OpType::Delete) {
            return Err(SchedulerError::UnderOperation {
                namespace: namespace.to_string(),
                app: app_id.to_string(),
                reason: "already being deleted".into(),
            });
        }

        let mut groups = store.list_taskgroups(namespace, app_id)?;
        let mut live = 0;
        for tg in &mut groups {
            if tg.is_terminal() {
                continue;
            }
            if !self.kill_taskgroup(tg).await? {
                warn!(namespace, app = app_id, taskgroup = %tg.id, "kill not delivered, delete continues");
            }
            if !tg.is_terminal() {
                live += 1;
            }
        }

        let mut txn = self.new_transaction(namespace, app_id, Operation::Delete { enforce });
        if live == 0 {
            self.purge_application(&app, &groups).await?;
            txn.finish("application deleted");
            store.save_transaction(&txn)?;
            self.ctx
                .metrics
                .operation(namespace, app_id, OpType::Delete, Outcome::Finished);
            return Ok(txn);
        }

        app.sub_status = Some(OpType::Delete);
        app.set_status(AppStatus::Operating);
        app.message = format!("deleting, {live} taskgroups stopping");
        store.save_application(&app)?;
        self.submit(&txn, Duration::ZERO)?;
        Ok(txn)
    }

    /// Change the user-defined instance count.
    pub async fn scale_application(
        &self,
        namespace: &str,
        app_id: &str,
        instances: u32,
    ) -> SchedulerResult<Transaction> {
        let _guard = self.ctx.store.lock_application(namespace, app_id).await;
        let mut app = self.fetch_app(namespace, app_id)?;
        ensure_idle(&app)?;
        app.define_instances = instances;
        let op = Operation::Scale {
            version: app.current_version.clone(),
            instances,
        };
        self.start_owned(&mut app, OpType::Scale, op)
    }

    /// Scale driven by the scheduler; shrinking drops `remove_indices`
    /// before anything else.
    pub async fn inner_scale_application(
        &self,
        namespace: &str,
        app_id: &str,
        instances: u32,
        remove_indices: Vec<u32>,
    ) -> SchedulerResult<Transaction> {
        let _guard = self.ctx.store.lock_application(namespace, app_id).await;
        let mut app = self.fetch_app(namespace, app_id)?;
        ensure_idle(&app)?;
        app.define_instances = instances;
        let op = Operation::InnerScale {
            version: app.current_version.clone(),
            instances,
            remove_indices,
        };
        self.start_owned(&mut app, OpType::InnerScale, op)
    }

    /// Mark `app` as owned by `op_type`, persist it and submit `op`.
    fn start_owned(
        &self,
        app: &mut Application,
        op_type: OpType,
        op: Operation,
    ) -> SchedulerResult<Transaction> {
        app.sub_status = Some(op_type);
        app.set_status(AppStatus::Operating);
        self.ctx.store.save_application(app)?;
        let txn = self.new_transaction(&app.run_as, &app.id, op);
        self.submit(&txn, Duration::ZERO)?;
        Ok(txn)
    }

    /// Roll the application to a new version.
    pub async fn update_application(
        &self,
        mut version: Version,
        strategy: UpgradeStrategy,
    ) -> SchedulerResult<Transaction> {
        version.name = new_version_name();
        version.validate()?;
        let store = &self.ctx.store;
        let _guard = store.lock_application(&version.run_as, &version.id).await;
        let app = self.fetch_app(&version.run_as, &version.id)?;
        ensure_idle(&app)?;
        if app.kind != version.kind() {
            return Err(SchedulerError::KindMismatch {
                namespace: app.run_as.clone(),
                app: app.id.clone(),
                expected: app.kind,
                actual: version.kind(),
            });
        }
        let target = if store.save_version(&version)? {
            version
        } else {
            // Same content as the latest stored version; roll to that one.
            store
                .fetch_latest_version(&app.run_as, &app.id)?
                .ok_or_else(|| SchedulerError::VersionNotFound(format!("{}/{}", app.run_as, app.id)))?
        };
        self.start_rolling(app, target, strategy, OpType::Update).await
    }

    /// Roll the application back to the version before its current one.
    pub async fn rollback_application(
        &self,
        namespace: &str,
        app_id: &str,
        strategy: UpgradeStrategy,
    ) -> SchedulerResult<Transaction> {
        let store = &self.ctx.store;
        let _guard = store.lock_application(namespace, app_id).await;
        let app = self.fetch_app(namespace, app_id)?;
        ensure_idle(&app)?;
        let versions = store.list_versions(namespace, app_id)?;
        let previous = versions
            .iter()
            .position(|v| v.name == app.current_version)
            .and_then(|i| i.checked_sub(1))
            .and_then(|i| versions.get(i).cloned())
            .ok_or_else(|| {
                SchedulerError::VersionNotFound(format!(
                    "{namespace}/{app_id}: nothing before {}",
                    app.current_version
                ))
            })?;
        self.start_rolling(app, previous, strategy, OpType::Rollback).await
    }

    async fn start_rolling(
        &self,
        mut app: Application,
        target: Version,
        strategy: UpgradeStrategy,
        op_type: OpType,
    ) -> SchedulerResult<Transaction> {
        let store = &self.ctx.store;
        {
            let _dep_guard = store.lock_deployment(&app.run_as, &app.id).await;
            let now = now_secs();
            let mut dep = store
                .fetch_deployment(&app.run_as, &app.id)?
                .unwrap_or_else(|| Deployment {
                    name: app.id.clone(),
                    run_as: app.run_as.clone(),
                    app_id: app.id.clone(),
                    strategy: strategy.clone(),
                    curr_rolling_op: None,
                    is_in_rolling: false,
                    message: String::new(),
                    updated: now,
                });
            dep.strategy = strategy.clone();
            dep.curr_rolling_op = Some(RollingOp {
                op: op_type,
                from_version: app.current_version.clone(),
                to_version: target.name.clone(),
                started: now,
            });
            dep.is_in_rolling = true;
            dep.updated = now;
            store.save_deployment(&dep)?;
        }

        info!(
            namespace = %app.run_as,
            app = %app.id,
            from = %app.current_version,
            to = %target.name,
            op = ?op_type,
            "rolling update started"
        );
        app.current_version = target.name.clone();
        app.define_instances = target.instances;
        app.sub_status = Some(op_type);
        app.set_status(AppStatus::RollingUpdate);
        store.save_application(&app)?;

        let op = match op_type {
            OpType::Rollback => Operation::Rollback {
                version: target.name,
                strategy,
            },
            _ => Operation::Update {
                version: target.name,
                strategy,
            },
        };
        let txn = self.new_transaction(&app.run_as, &app.id, op);
        self.submit(&txn, Duration::ZERO)?;
        Ok(txn)
    }

    /// Replace one taskgroup with a fresh one in the same slot.
    pub async fn reschedule_taskgroup(
        &self,
        id: &TaskGroupId,
        reason: &str,
    ) -> SchedulerResult<Transaction> {
        self.reschedule_after(id, reason, Duration::ZERO).await
    }

    /// Like [`Engine::reschedule_taskgroup`], but the first step runs after
    /// `delay`.
    ///
    /// Refused while the application is being deleted or rolled, or while
    /// another reschedule of the same taskgroup is unfinished.
    pub async fn reschedule_after(
        &self,
        id: &TaskGroupId,
        reason: &str,
        delay: Duration,
    ) -> SchedulerResult<Transaction> {
        let store = &self.ctx.store;
        let _guard = store.lock_application(&id.run_as, &id.app_id).await;
        let app = self.fetch_app(&id.run_as, &id.app_id)?;
        if store.fetch_taskgroup(id)?.is_none() {
            return Err(SchedulerError::TaskGroupNotFound(id.to_string()));
        }
        if app.status == AppStatus::RollingUpdate {
            return Err(SchedulerError::InRollingUpdate {
                namespace: app.run_as.clone(),
                app: app.id.clone(),
            });
        }
        if app.sub_status == Some(OpType::Delete) {
            return Err(SchedulerError::UnderOperation {
                namespace: app.run_as.clone(),
                app: app.id.clone(),
                reason: "being deleted".into(),
            });
        }
        if let Some(existing) = self.pending_reschedule(id)? {
            return Err(SchedulerError::UnderOperation {
                namespace: app.run_as.clone(),
                app: app.id.clone(),
                reason: format!("reschedule {} already pending", existing.transaction_id),
            });
        }

        let txn = self.new_transaction(
            &id.run_as,
            &id.app_id,
            Operation::Reschedule {
                taskgroup_id: id.clone(),
                reason: reason.to_string(),
                replacement: None,
            },
        );
        self.submit(&txn, delay)?;
        Ok(txn)
    }

    /// The unfinished reschedule transaction of taskgroup `id`, if any.
    pub fn pending_reschedule(&self, id: &TaskGroupId) -> SchedulerResult<Option<Transaction>> {
        Ok(self
            .ctx
            .store
            .list_transactions(&id.run_as)?
            .into_iter()
            .find(|t| {
                !t.is_terminal()
                    && matches!(&t.cur_op, Operation::Reschedule { taskgroup_id, .. } if taskgroup_id == id)
            }))
    }
}
