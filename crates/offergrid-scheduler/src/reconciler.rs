//! Status reconciler: turns task status and health reports into taskgroup
//! and application state, and asks the engine for replacements.
//!
//! Reports are sharded by taskgroup id, so reports for one taskgroup are
//! handled in arrival order while different taskgroups proceed in
//! parallel. Mutations run under the application lock.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use offergrid_state::{
    AppStatus, OpType, Task, TaskGroup, TaskGroupId, TaskGroupStatus, TaskId, TaskStatus,
    now_secs,
};

use crate::collab::{HealthReport, TaskStatusUpdate};
use crate::context::SchedulerContext;
use crate::engine::{Engine, refresh_app};
use crate::error::{SchedulerError, SchedulerResult};

/// A report routed to the reconciler.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    Update(TaskStatusUpdate),
    Health(HealthReport),
}

impl StatusEvent {
    fn task_id(&self) -> &str {
        match self {
            StatusEvent::Update(u) => &u.task_id,
            StatusEvent::Health(h) => &h.task_id,
        }
    }
}

/// Taskgroup status implied by its tasks.
///
/// Any failed, lost or errored task fails the group. `Running`, `Killed`
/// and `Finish` need every task to agree.
pub fn aggregate_status(tasks: &[Task], current: TaskGroupStatus) -> TaskGroupStatus {
    if tasks.is_empty() {
        return current;
    }
    let all = |s: TaskStatus| tasks.iter().all(|t| t.status == s);
    let any = |s: TaskStatus| tasks.iter().any(|t| t.status == s);

    if all(TaskStatus::Killed) {
        return TaskGroupStatus::Killed;
    }
    if all(TaskStatus::Finish) {
        return TaskGroupStatus::Finish;
    }
    if any(TaskStatus::Failed) {
        return TaskGroupStatus::Failed;
    }
    if any(TaskStatus::Lost) {
        return TaskGroupStatus::Lost;
    }
    if any(TaskStatus::Error) {
        return TaskGroupStatus::Error;
    }
    if all(TaskStatus::Running) {
        return TaskGroupStatus::Running;
    }
    if tasks.iter().all(|t| t.status.is_terminal()) {
        // Mix of killed and finished tasks.
        return TaskGroupStatus::Killed;
    }
    if any(TaskStatus::Killing) || current == TaskGroupStatus::Killing {
        return TaskGroupStatus::Killing;
    }
    if any(TaskStatus::Starting) || any(TaskStatus::Running) {
        return TaskGroupStatus::Starting;
    }
    if any(TaskStatus::Staging) {
        return TaskGroupStatus::Staging;
    }
    TaskGroupStatus::Unknown
}

/// Application status implied by its taskgroups.
pub fn derive_app_status(groups: &[TaskGroup], define_instances: u32) -> AppStatus {
    if groups.is_empty() {
        return if define_instances == 0 {
            AppStatus::Finish
        } else {
            AppStatus::Staging
        };
    }
    if groups.iter().any(|tg| tg.status.is_failure()) {
        return AppStatus::Abnormal;
    }
    if groups.iter().all(|tg| tg.status == TaskGroupStatus::Finish) {
        return AppStatus::Finish;
    }
    let running = groups
        .iter()
        .filter(|tg| tg.status == TaskGroupStatus::Running)
        .count() as u32;
    if running == groups.len() as u32 && running >= define_instances {
        return AppStatus::Running;
    }
    if groups.iter().all(|tg| tg.is_terminal()) {
        return AppStatus::Finish;
    }
    AppStatus::Deploying
}

/// What a handled report asks for once the application lock is released.
#[derive(Debug, Clone, PartialEq)]
pub enum FollowUp {
    None,
    Reschedule {
        id: TaskGroupId,
        reason: String,
        delay: Duration,
    },
}

pub struct Reconciler {
    ctx: Arc<SchedulerContext>,
    engine: Engine,
}

impl Reconciler {
    pub fn new(engine: Engine) -> Self {
        Self {
            ctx: engine.context().clone(),
            engine,
        }
    }

    /// Apply one task status report.
    pub async fn handle_status_update(&self, update: &TaskStatusUpdate) -> SchedulerResult<FollowUp> {
        let task_id: TaskId = update.task_id.parse()?;
        let follow_up = self.apply_status(&task_id, update).await?;
        self.follow(&follow_up).await;
        Ok(follow_up)
    }

    async fn apply_status(
        &self,
        task_id: &TaskId,
        update: &TaskStatusUpdate,
    ) -> SchedulerResult<FollowUp> {
        let group_id = &task_id.group;
        let store = &self.ctx.store;
        let _guard = store
            .lock_application(&group_id.run_as, &group_id.app_id)
            .await;

        let Some(mut tg) = store.fetch_taskgroup(group_id)? else {
            if !update.status.is_terminal() {
                warn!(task = %task_id, "status for unknown taskgroup, killing orphan task");
                if let Err(e) = self
                    .ctx
                    .client
                    .kill(update.agent_id.as_deref(), &update.task_id)
                    .await
                {
                    warn!(task = %task_id, error = %e, "orphan kill failed");
                }
            }
            return Ok(FollowUp::None);
        };

        let version = store.fetch_version(&tg.run_as, &tg.app_id, &tg.version)?;
        let agent_ip = tg.agent_ip.clone();
        let Some(task) = tg.task_mut(task_id) else {
            warn!(task = %task_id, "taskgroup has no such task");
            return Ok(FollowUp::None);
        };
        task.set_status(update.status);
        task.message = update.message.clone();
        if let Some(data) = &update.data {
            task.status_data = Some(data.clone());
            if let Some(v) = &version {
                task.runtime_ip = v.workload.runtime_ip(Some(data), agent_ip.as_deref());
            }
        }

        let previous = tg.status;
        let status = aggregate_status(&tg.tasks, previous);
        tg.set_status(status);
        tg.message = update.message.clone();
        if status == TaskGroupStatus::Running || status.is_terminal() {
            if let Some(hostname) = &tg.hostname {
                self.ctx
                    .deltas
                    .update_agent_sched_info(hostname, &tg.id.to_string(), None)?;
            }
        }
        store.save_taskgroup(&tg)?;

        let mut app = store.fetch_application(&tg.run_as, &tg.app_id)?;
        if let Some(app) = &mut app {
            let groups = store.list_taskgroups(&app.run_as, &app.id)?;
            refresh_app(app, &groups);
            store.save_application(app)?;
        }

        if previous != status {
            debug!(taskgroup = %tg.id, from = ?previous, to = ?status, "taskgroup status changed");
            self.ctx
                .metrics
                .taskgroup_status(&tg.run_as, &tg.app_id, status);
            self.ctx.exporter.taskgroup_update(&tg).await;
        }

        if previous == status || !status.is_terminal() {
            return Ok(FollowUp::None);
        }
        let Some(app) = app else {
            return Ok(FollowUp::None);
        };
        if tg.kill_requested || app.sub_status == Some(OpType::Delete) {
            return Ok(FollowUp::None);
        }
        let policy = version.map(|v| v.restart_policy).unwrap_or_default();
        if !policy.should_restart(status, tg.resched_times) {
            debug!(taskgroup = %tg.id, ?status, "restart policy declines replacement");
            return Ok(FollowUp::None);
        }
        self.replacement(&tg, format!("taskgroup {status:?}"), policy.delay(tg.resched_times))
    }

    /// Gate a replacement on the namespace quota.
    fn replacement(&self, tg: &TaskGroup, reason: String, delay: Duration) -> SchedulerResult<FollowUp> {
        if !self.engine.within_quota(&tg.run_as, &tg.launch_resource)? {
            warn!(namespace = %tg.run_as, taskgroup = %tg.id, "over quota, not rescheduling");
            if let Some(mut app) = self.ctx.store.fetch_application(&tg.run_as, &tg.app_id)? {
                app.message = format!("{} not rescheduled: namespace over quota", tg.id);
                self.ctx.store.save_application(&app)?;
            }
            return Ok(FollowUp::None);
        }
        Ok(FollowUp::Reschedule {
            id: tg.id.clone(),
            reason,
            delay,
        })
    }

    async fn follow(&self, follow_up: &FollowUp) {
        let FollowUp::Reschedule { id, reason, delay } = follow_up else {
            return;
        };
        match self.engine.reschedule_after(id, reason, *delay).await {
            Ok(txn) => {
                info!(taskgroup = %id, transaction = %txn.transaction_id, %reason, "reschedule requested");
            }
            Err(e @ (SchedulerError::UnderOperation { .. } | SchedulerError::InRollingUpdate { .. })) => {
                debug!(taskgroup = %id, reason = %e, "reschedule skipped");
            }
            Err(e) => warn!(taskgroup = %id, error = %e, "reschedule request failed"),
        }
    }

    /// Apply one health probe result.
    pub async fn handle_health_report(&self, report: &HealthReport) -> SchedulerResult<FollowUp> {
        let task_id: TaskId = report.task_id.parse()?;
        let follow_up = self.apply_health(&task_id, report).await?;
        self.follow(&follow_up).await;
        Ok(follow_up)
    }

    async fn apply_health(&self, task_id: &TaskId, report: &HealthReport) -> SchedulerResult<FollowUp> {
        let group_id = &task_id.group;
        let store = &self.ctx.store;
        let _guard = store
            .lock_application(&group_id.run_as, &group_id.app_id)
            .await;
        let Some(mut tg) = store.fetch_taskgroup(group_id)? else {
            debug!(task = %task_id, "health report for unknown taskgroup");
            return Ok(FollowUp::None);
        };
        let version = store.fetch_version(&tg.run_as, &tg.app_id, &tg.version)?;
        let threshold = version
            .as_ref()
            .and_then(|v| v.health_check.as_ref())
            .map(|h| h.max_consecutive_failures)
            .unwrap_or(self.ctx.config.health.max_consecutive_failures)
            .max(1);

        let Some(task) = tg.task_mut(task_id) else {
            return Ok(FollowUp::None);
        };
        task.is_checked = true;
        let before = task.consecutive_failure_times;
        if report.healthy {
            task.healthy = true;
            task.consecutive_failure_times = 0;
        } else {
            task.healthy = false;
            task.consecutive_failure_times = before.saturating_add(1);
        }
        task.update_time = now_secs();
        let after = task.consecutive_failure_times;
        if !report.message.is_empty() {
            task.message = report.message.clone();
        }
        store.save_taskgroup(&tg)?;
        self.ctx.exporter.taskgroup_update(&tg).await;

        let crossed = before < threshold && after >= threshold;
        if !crossed || tg.status != TaskGroupStatus::Running || tg.kill_requested {
            return Ok(FollowUp::None);
        }
        let deleting = store
            .fetch_application(&tg.run_as, &tg.app_id)?
            .is_none_or(|a| a.sub_status == Some(OpType::Delete));
        if deleting {
            return Ok(FollowUp::None);
        }
        let policy = version.map(|v| v.restart_policy).unwrap_or_default();
        if !policy.should_restart(TaskGroupStatus::Failed, tg.resched_times) {
            return Ok(FollowUp::None);
        }
        warn!(taskgroup = %tg.id, failures = after, threshold, "health check threshold crossed");
        self.replacement(
            &tg,
            format!("{after} consecutive failed health checks"),
            policy.delay(tg.resched_times),
        )
    }

    async fn handle(&self, event: &StatusEvent) {
        let result = match event {
            StatusEvent::Update(u) => self.handle_status_update(u).await,
            StatusEvent::Health(h) => self.handle_health_report(h).await,
        };
        if let Err(e) = result {
            warn!(task = event.task_id(), error = %e, "status report not applied");
        }
    }

    /// Consume `events` until shutdown, fanning reports out to
    /// `ctx.config.reconcile_shards` sequential shards.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<StatusEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let shards = self.ctx.config.reconcile_shards.max(1);
        let mut senders = Vec::with_capacity(shards);
        let mut workers = Vec::with_capacity(shards);
        for shard in 0..shards {
            let (tx, mut rx) = mpsc::channel::<StatusEvent>(256);
            senders.push(tx);
            let this = self.clone();
            workers.push(tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    this.handle(&event).await;
                }
                debug!(shard, "reconciler shard stopped");
            }));
        }
        info!(shards, "status reconciler started");

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    let shard = shard_of(event.task_id(), shards);
                    if senders[shard].send(event).await.is_err() {
                        warn!(shard, "reconciler shard gone");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        drop(senders);
        for (shard, worker) in workers.into_iter().enumerate() {
            if let Err(e) = worker.await {
                warn!(shard, error = %e, "reconciler shard task failed");
            }
        }
        info!("status reconciler stopped");
    }
}

/// Shard of a task's taskgroup; tasks of one taskgroup share a shard.
fn shard_of(task_id: &str, shards: usize) -> usize {
    let group = task_id.split_once('.').map_or(task_id, |(_, rest)| rest);
    let mut hasher = DefaultHasher::new();
    group.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}
