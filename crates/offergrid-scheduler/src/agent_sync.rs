//! Periodic copy of the cluster manager's agent list into the store.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use offergrid_state::{Agent, now_secs};

use crate::context::SchedulerContext;
use crate::error::SchedulerResult;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub added: usize,
    pub updated: usize,
    pub unchanged: usize,
}

/// Upsert every agent the cluster manager reports, keyed by inner IP.
///
/// Agents whose info did not change are not rewritten. Agents missing
/// from the list are left for the consistency checker.
pub async fn sync_agents(ctx: &SchedulerContext) -> SchedulerResult<SyncReport> {
    let agents = ctx.client.list_agents().await?;
    let mut report = SyncReport::default();
    for info in agents {
        match ctx.store.fetch_agent(&info.ip)? {
            Some(existing) if existing.agent_info == info => {
                report.unchanged += 1;
            }
            Some(mut existing) => {
                existing.agent_info = info;
                existing.last_sync_time = now_secs();
                ctx.store.save_agent(&existing)?;
                report.updated += 1;
            }
            None => {
                ctx.store.save_agent(&Agent {
                    key: info.ip.clone(),
                    agent_info: info,
                    last_sync_time: now_secs(),
                    disabled: false,
                })?;
                report.added += 1;
            }
        }
    }
    Ok(report)
}

/// Sync every `agent.sync_interval_secs` until shutdown.
pub async fn run(ctx: Arc<SchedulerContext>, mut shutdown: watch::Receiver<bool>) {
    let period = Duration::from_secs(ctx.config.agent.sync_interval_secs.max(1));
    let mut ticker = tokio::time::interval(period);
    info!(interval_secs = period.as_secs(), "agent sync started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match sync_agents(&ctx).await {
                    Ok(r) if r.added + r.updated > 0 => {
                        info!(added = r.added, updated = r.updated, "agents synced");
                    }
                    Ok(r) => debug!(unchanged = r.unchanged, "agents unchanged"),
                    Err(e) => warn!(error = %e, "agent sync failed"),
                }
            }
            _ = shutdown.changed() => {
                info!("agent sync shutting down");
                break;
            }
        }
    }
}
