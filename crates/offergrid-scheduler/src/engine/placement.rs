//! Taskgroup placement and teardown shared by the operation handlers.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use offergrid_offer::{HostView, PlacedSet, host_satisfies};
use offergrid_state::{
    Application, Resource, TaskGroup, TaskGroupId, TaskGroupStatus, Version, now_nanos,
    now_secs,
};

use super::Engine;
use crate::error::{SchedulerError, SchedulerResult};

/// Version names sort chronologically.
pub(crate) fn new_version_name() -> String {
    format!("{:020}", now_nanos())
}

impl Engine {
    /// Whether `namespace` has room for `need` on top of its live
    /// taskgroups.
    pub fn within_quota(&self, namespace: &str, need: &Resource) -> SchedulerResult<bool> {
        let Some(limit) = self.ctx.config.quota(namespace) else {
            return Ok(true);
        };
        let used: Resource = self
            .ctx
            .store
            .list_all_taskgroups()?
            .iter()
            .filter(|tg| tg.run_as == namespace && !tg.is_terminal())
            .map(|tg| tg.curr_resource)
            .sum();
        Ok(limit.fits(&(used + *need)))
    }

    /// Where the application's live taskgroups run, for counting
    /// constraints.
    pub(crate) fn placed_set(&self, groups: &[TaskGroup]) -> SchedulerResult<PlacedSet> {
        let mut placed = PlacedSet::new();
        for tg in groups.iter().filter(|tg| !tg.is_terminal()) {
            let Some(hostname) = &tg.hostname else {
                continue;
            };
            let agent = match tg.agent_ip.as_deref() {
                Some(ip) => self.ctx.store.fetch_agent(ip)?,
                None => None,
            };
            let attributes = agent.map(|a| a.agent_info.attributes).unwrap_or_default();
            placed.record(&HostView {
                hostname: hostname.clone(),
                ip: tg.agent_ip.clone().unwrap_or_default(),
                attributes,
            });
        }
        Ok(placed)
    }

    /// Place one taskgroup of `version` in slot `index` on the first
    /// pooled offer that fits and satisfies the constraints.
    ///
    /// Returns `Ok(None)` when no held offer qualifies.
    pub(crate) async fn place_taskgroup(
        &self,
        app: &Application,
        version: &Version,
        index: u32,
        placed: &mut PlacedSet,
        resched_times: u32,
    ) -> SchedulerResult<Option<TaskGroup>> {
        let need = version.all_resource();
        if !self.within_quota(&app.run_as, &need)? {
            return Err(SchedulerError::QuotaExceeded(app.run_as.clone()));
        }

        let pool = &self.ctx.offers;
        if pool.is_empty() {
            return Ok(None);
        }
        let ips: Vec<String> = pool.all_offers().into_iter().map(|o| o.ip).collect();
        let extra = match self.ctx.plugins.host_attributes(&ips).await {
            Ok(extra) => extra,
            Err(e) => {
                warn!(error = %e, "host attribute lookup failed, using offer attributes only");
                HashMap::new()
            }
        };

        let mut cursor = pool.first_offer();
        while let Some(held) = cursor {
            cursor = pool.next_offer(&held);
            if !held.fits(&need) {
                debug!(offer = %held.offer.id, index, "offer too small");
                continue;
            }
            let mut host = HostView::from_offer(&held.offer);
            if let Some(attrs) = extra.get(&held.offer.ip) {
                host.merge(attrs.clone());
            }
            if !host_satisfies(version.constraints.as_ref(), &host, placed)? {
                debug!(offer = %held.offer.id, index, "offer fails constraints");
                continue;
            }
            if !pool.use_offer(&held) {
                continue;
            }

            let offer = &held.offer;
            let id = TaskGroupId::new(
                index,
                &app.id,
                &app.run_as,
                &self.ctx.config.cluster_id,
                now_nanos(),
            )?;
            let mut tg = TaskGroup::from_version(id, version);
            tg.agent_id = Some(offer.agent_id.clone());
            tg.hostname = Some(offer.hostname.clone());
            tg.agent_ip = Some(offer.ip.clone());
            for task in &mut tg.tasks {
                task.agent_ip = Some(offer.ip.clone());
            }
            tg.resched_times = resched_times;
            if resched_times > 0 {
                tg.last_resched_time = now_secs();
            }
            let key = tg.id.to_string();

            self.ctx.store.save_taskgroup(&tg)?;
            self.ctx
                .deltas
                .update_agent_sched_info(&offer.hostname, &key, Some(tg.launch_resource))?;

            if let Err(e) = self
                .ctx
                .client
                .launch(offer, version, std::slice::from_ref(&tg))
                .await
            {
                warn!(taskgroup = %key, hostname = %offer.hostname, error = %e, "launch failed, rolling back");
                self.ctx.store.delete_taskgroup(&tg.id)?;
                self.ctx
                    .deltas
                    .update_agent_sched_info(&offer.hostname, &key, None)?;
                if let Err(de) = pool.decline_claimed(&held).await {
                    warn!(offer = %offer.id, error = %de, "decline after failed launch failed");
                }
                return Err(e);
            }

            info!(
                namespace = %app.run_as,
                app = %app.id,
                taskgroup = %key,
                hostname = %offer.hostname,
                cpus = need.cpus,
                mem = need.mem,
                "taskgroup launched"
            );
            placed.record(&host);
            self.ctx.exporter.taskgroup_add(&tg).await;
            return Ok(Some(tg));
        }
        Ok(None)
    }

    /// Ask the cluster to kill every live task of `tg` and mark it
    /// `Killing`. Per-task failures are logged; returns false if any
    /// request was not delivered.
    pub(crate) async fn kill_taskgroup(&self, tg: &mut TaskGroup) -> SchedulerResult<bool> {
        let mut delivered = true;
        for task in tg.tasks.iter().filter(|t| !t.status.is_terminal()) {
            if let Err(e) = self
                .ctx
                .client
                .kill(tg.agent_id.as_deref(), &task.id.to_string())
                .await
            {
                warn!(taskgroup = %tg.id, task = %task.id, error = %e, "kill request failed");
                delivered = false;
            }
        }
        tg.kill_requested = true;
        if !tg.is_terminal() {
            if tg.tasks.iter().all(|t| t.status.is_terminal()) {
                tg.set_status(TaskGroupStatus::Killed);
            } else {
                tg.set_status(TaskGroupStatus::Killing);
            }
        }
        self.ctx.store.save_taskgroup(tg)?;
        self.ctx.exporter.taskgroup_update(tg).await;
        debug!(taskgroup = %tg.id, delivered, "taskgroup kill requested");
        Ok(delivered)
    }

    /// Drop a taskgroup record and its agent reservation.
    pub(crate) async fn remove_taskgroup(&self, tg: &TaskGroup) -> SchedulerResult<()> {
        self.ctx.store.delete_taskgroup(&tg.id)?;
        if let Some(hostname) = &tg.hostname {
            self.ctx
                .deltas
                .update_agent_sched_info(hostname, &tg.id.to_string(), None)?;
        }
        self.ctx.exporter.taskgroup_delete(tg).await;
        debug!(taskgroup = %tg.id, "taskgroup removed");
        Ok(())
    }
}
