//! One step of each operation, run by a queue worker under the
//! application lock.

use tracing::{debug, info};

use offergrid_rollout::{RollAction, UpgradeStrategy, plan_step};
use offergrid_state::{
    Application, OpType, Operation, TaskGroup, TaskGroupId, Transaction, Version, now_secs,
};

use super::Engine;
use crate::error::{SchedulerError, SchedulerResult};

/// What a handler step achieved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// The operation is complete.
    Done(String),
    /// Waiting on offers or on the cluster; check again later.
    Pending(String),
}

impl Engine {
    fn load_app(&self, txn: &Transaction) -> SchedulerResult<Application> {
        self.ctx
            .store
            .fetch_application(&txn.namespace, &txn.object_name)?
            .ok_or_else(|| SchedulerError::AppNotFound {
                namespace: txn.namespace.clone(),
                app: txn.object_name.clone(),
            })
    }

    /// An enforced delete takes over an application mid-operation; the
    /// displaced transaction must stop.
    pub(super) fn ensure_not_deleting(&self, txn: &Transaction) -> SchedulerResult<()> {
        let app = self
            .ctx
            .store
            .fetch_application(&txn.namespace, &txn.object_name)?;
        if app.is_some_and(|a| a.sub_status == Some(OpType::Delete)) {
            return Err(SchedulerError::UnderOperation {
                namespace: txn.namespace.clone(),
                app: txn.object_name.clone(),
                reason: "being deleted".into(),
            });
        }
        Ok(())
    }

    fn load_version(&self, app: &Application, name: &str) -> SchedulerResult<Version> {
        self.ctx
            .store
            .fetch_version(&app.run_as, &app.id, name)?
            .ok_or_else(|| SchedulerError::VersionNotFound(format!("{}/{}/{name}", app.run_as, app.id)))
    }

    pub(super) async fn handle_launch(&self, txn: &Transaction, version: &str) -> SchedulerResult<Step> {
        let app = self.load_app(txn)?;
        let version = self.load_version(&app, version)?;
        self.converge(&app, &version, app.define_instances, &[]).await
    }

    pub(super) async fn handle_scale(
        &self,
        txn: &Transaction,
        version: &str,
        instances: u32,
        remove_indices: &[u32],
    ) -> SchedulerResult<Step> {
        let app = self.load_app(txn)?;
        let version = self.load_version(&app, version)?;
        self.converge(&app, &version, instances, remove_indices).await
    }

    /// Bring the application to `target` taskgroups of `version`.
    ///
    /// Taskgroups in `remove_indices` go first; beyond that the newest are
    /// removed. New taskgroups take the lowest free slots.
    async fn converge(
        &self,
        app: &Application,
        version: &Version,
        target: u32,
        remove_indices: &[u32],
    ) -> SchedulerResult<Step> {
        let groups = self.ctx.store.list_taskgroups(&app.run_as, &app.id)?;
        let (mut doomed, mut keep): (Vec<TaskGroup>, Vec<TaskGroup>) = groups
            .into_iter()
            .partition(|tg| remove_indices.contains(&tg.index()));
        while keep.len() as u32 > target {
            if let Some(newest) = keep.pop() {
                doomed.push(newest);
            }
        }

        let mut stopping = 0;
        for tg in &mut doomed {
            if tg.is_terminal() {
                self.remove_taskgroup(tg).await?;
                continue;
            }
            if !tg.kill_requested {
                self.kill_taskgroup(tg).await?;
            }
            if !tg.is_terminal() {
                stopping += 1;
            }
        }

        let missing = target.saturating_sub(keep.len() as u32);
        let mut occupied: Vec<u32> = keep.iter().map(TaskGroup::index).collect();
        occupied.extend(doomed.iter().filter(|tg| !tg.is_terminal()).map(TaskGroup::index));
        let free: Vec<u32> = (0..)
            .filter(|i| !occupied.contains(i))
            .take(missing as usize)
            .collect();

        let mut placed = self.placed_set(&keep)?;
        let mut launched = 0;
        for index in free {
            match self.place_taskgroup(app, version, index, &mut placed, 0).await? {
                Some(_) => launched += 1,
                None => break,
            }
        }

        let waiting = missing - launched;
        if waiting == 0 && stopping == 0 {
            return Ok(Step::Done(format!("{target} taskgroups of version {}", version.name)));
        }
        debug!(
            namespace = %app.run_as,
            app = %app.id,
            target,
            launched,
            waiting,
            stopping,
            "scale step"
        );
        Ok(Step::Pending(format!(
            "{waiting} taskgroups waiting for offers, {stopping} stopping"
        )))
    }

    pub(super) async fn handle_delete(&self, txn: &Transaction) -> SchedulerResult<Step> {
        let Some(app) = self
            .ctx
            .store
            .fetch_application(&txn.namespace, &txn.object_name)?
        else {
            return Ok(Step::Done("application already removed".into()));
        };
        let mut groups = self.ctx.store.list_taskgroups(&app.run_as, &app.id)?;
        let mut live = 0;
        for tg in &mut groups {
            if tg.is_terminal() {
                continue;
            }
            if !tg.kill_requested {
                self.kill_taskgroup(tg).await?;
            }
            if !tg.is_terminal() {
                live += 1;
            }
        }
        if live > 0 {
            return Ok(Step::Pending(format!("waiting for {live} taskgroups to stop")));
        }
        self.purge_application(&app, &groups).await?;
        Ok(Step::Done("application deleted".into()))
    }

    /// Remove an application whose taskgroups have all ended.
    pub(super) async fn purge_application(
        &self,
        app: &Application,
        groups: &[TaskGroup],
    ) -> SchedulerResult<()> {
        for tg in groups {
            if let Some(hostname) = &tg.hostname {
                self.ctx
                    .deltas
                    .update_agent_sched_info(hostname, &tg.id.to_string(), None)?;
            }
            self.ctx.exporter.taskgroup_delete(tg).await;
        }
        self.ctx.store.delete_application(&app.run_as, &app.id)?;
        self.ctx.store.delete_deployment(&app.run_as, &app.id)?;
        info!(namespace = %app.run_as, app = %app.id, taskgroups = groups.len(), "application deleted");
        Ok(())
    }

    pub(super) async fn handle_rolling(
        &self,
        txn: &Transaction,
        version: &str,
        strategy: &UpgradeStrategy,
    ) -> SchedulerResult<Step> {
        let app = self.load_app(txn)?;
        let version = self.load_version(&app, version)?;
        let mut groups = self.ctx.store.list_taskgroups(&app.run_as, &app.id)?;
        let plan = plan_step(strategy, &version.name, app.define_instances, &groups);

        let mut placed = self.placed_set(&groups)?;
        let mut waiting = 0;
        for action in &plan.actions {
            match action {
                RollAction::Launch { index } => {
                    if waiting > 0 {
                        waiting += 1;
                        continue;
                    }
                    if self
                        .place_taskgroup(&app, &version, *index, &mut placed, 0)
                        .await?
                        .is_none()
                    {
                        waiting += 1;
                    }
                }
                RollAction::Kill { id } => {
                    if let Some(tg) = groups.iter_mut().find(|tg| &tg.id == id) {
                        self.kill_taskgroup(tg).await?;
                    }
                }
                RollAction::Remove { id } => {
                    if let Some(tg) = groups.iter().find(|tg| &tg.id == id) {
                        self.remove_taskgroup(tg).await?;
                    }
                }
            }
        }

        if !plan.done {
            return Ok(Step::Pending(format!(
                "rolling to {}: {} actions, {waiting} launches waiting for offers",
                version.name,
                plan.actions.len()
            )));
        }

        let _dep_guard = self
            .ctx
            .store
            .lock_deployment(&app.run_as, &app.id)
            .await;
        if let Some(mut dep) = self.ctx.store.fetch_deployment(&app.run_as, &app.id)? {
            dep.is_in_rolling = false;
            dep.curr_rolling_op = None;
            dep.message = format!("running version {}", version.name);
            dep.updated = now_secs();
            self.ctx.store.save_deployment(&dep)?;
        }
        Ok(Step::Done(format!("rolled to version {}", version.name)))
    }

    pub(super) async fn handle_reschedule(
        &self,
        txn: &mut Transaction,
        taskgroup_id: &TaskGroupId,
        replacement: Option<TaskGroupId>,
    ) -> SchedulerResult<Step> {
        let app = self.load_app(txn)?;
        let store = &self.ctx.store;

        if let Some(new_id) = replacement {
            if let Some(old) = store.fetch_taskgroup(taskgroup_id)? {
                self.remove_taskgroup(&old).await?;
            }
            return Ok(Step::Done(format!("replaced by {new_id}")));
        }
        let Some(mut old) = store.fetch_taskgroup(taskgroup_id)? else {
            return Ok(Step::Done("taskgroup no longer exists".into()));
        };
        if app.sub_status == Some(OpType::Delete) {
            return Ok(Step::Done("application is being deleted".into()));
        }
        if !old.is_terminal() {
            if !old.kill_requested {
                self.kill_taskgroup(&mut old).await?;
            }
            return Ok(Step::Pending(format!("waiting for {} to stop", old.id)));
        }

        let version = match store.fetch_version(&app.run_as, &app.id, &old.version)? {
            Some(v) => v,
            None => self.load_version(&app, &app.current_version)?,
        };
        let groups = store.list_taskgroups(&app.run_as, &app.id)?;
        let mut placed = self.placed_set(&groups)?;
        let Some(new) = self
            .place_taskgroup(&app, &version, old.index(), &mut placed, old.resched_times + 1)
            .await?
        else {
            return Ok(Step::Pending("waiting for an offer".into()));
        };

        // The replacement is recorded before the old record goes, so a
        // retried step only finishes the removal.
        if let Operation::Reschedule { replacement, .. } = &mut txn.cur_op {
            *replacement = Some(new.id.clone());
        }
        store.save_transaction(txn)?;
        self.remove_taskgroup(&old).await?;
        self.ctx.metrics.reschedule(&app.run_as, &app.id);
        info!(
            namespace = %app.run_as,
            app = %app.id,
            old = %old.id,
            new = %new.id,
            resched_times = new.resched_times,
            "taskgroup rescheduled"
        );
        Ok(Step::Done(format!("{} replaced by {}", old.id, new.id)))
    }
}
