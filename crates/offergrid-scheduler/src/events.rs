//! Cluster event stream supervision.
//!
//! Keeps a subscription to the cluster manager open, re-subscribing with
//! exponential backoff when the stream ends, and routes each event: offers
//! to the pool, task reports to the reconciler.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::collab::ClusterEvent;
use crate::context::SchedulerContext;
use crate::error::SchedulerResult;
use crate::reconciler::StatusEvent;

/// Delay before the `attempt`-th consecutive re-subscribe.
pub fn resubscribe_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(31));
    base.saturating_mul(factor).min(cap)
}

/// Apply one event. Returns false when the reconciler channel is closed.
pub async fn dispatch_event(
    ctx: &SchedulerContext,
    event: ClusterEvent,
    status_tx: &mpsc::Sender<StatusEvent>,
) -> SchedulerResult<bool> {
    match event {
        ClusterEvent::Subscribed { framework_id } => {
            info!(framework_id = %framework_id, "subscribed to cluster manager");
            ctx.store.save_framework_id(&framework_id)?;
        }
        ClusterEvent::Offers(offers) => {
            debug!(count = offers.len(), "offers received");
            ctx.offers.add_offers(offers).await?;
            ctx.metrics.offers_held(ctx.offers.len());
        }
        ClusterEvent::Rescind { offer_id } => {
            if ctx.offers.rescind(&offer_id) {
                debug!(offer = %offer_id, "offer rescinded");
                ctx.metrics.offers_held(ctx.offers.len());
            }
        }
        ClusterEvent::Update(update) => {
            if status_tx.send(StatusEvent::Update(update)).await.is_err() {
                return Ok(false);
            }
        }
        ClusterEvent::Health(report) => {
            if status_tx.send(StatusEvent::Health(report)).await.is_err() {
                return Ok(false);
            }
        }
        ClusterEvent::Message { agent_id, data } => {
            debug!(agent_id = %agent_id, bytes = data.len(), "executor message");
        }
        ClusterEvent::AgentLost { agent_id } => {
            // Tasks on the agent arrive as LOST updates.
            warn!(agent_id = %agent_id, "agent lost");
        }
        ClusterEvent::Heartbeat => {}
        ClusterEvent::Error(message) => {
            warn!(error = %message, "cluster manager reported an error");
        }
    }
    Ok(true)
}

/// Subscribe and dispatch until shutdown.
pub async fn run(
    ctx: Arc<SchedulerContext>,
    status_tx: mpsc::Sender<StatusEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let base = Duration::from_millis(ctx.config.events.resubscribe_base_ms.max(1));
    let cap = Duration::from_secs(ctx.config.events.resubscribe_max_secs.max(1));
    let mut attempt = 0u32;

    loop {
        let stream = tokio::select! {
            res = ctx.client.subscribe() => res,
            _ = shutdown.changed() => break,
        };
        match stream {
            Ok(mut events) => {
                attempt = 0;
                loop {
                    tokio::select! {
                        event = events.recv() => {
                            let Some(event) = event else {
                                warn!("cluster event stream ended");
                                break;
                            };
                            match dispatch_event(&ctx, event, &status_tx).await {
                                Ok(true) => {}
                                Ok(false) => {
                                    info!("status reconciler gone, leaving event loop");
                                    return;
                                }
                                Err(e) => warn!(error = %e, "event handling failed"),
                            }
                        }
                        _ = shutdown.changed() => {
                            info!("event loop shutting down");
                            return;
                        }
                    }
                }
            }
            Err(e) => warn!(error = %e, attempt, "subscribe failed"),
        }

        let delay = resubscribe_delay(base, cap, attempt);
        attempt = attempt.saturating_add(1);
        info!(delay_ms = delay.as_millis() as u64, "re-subscribing");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }
    info!("event loop shutting down");
}

/// Decline offers held past their lifetime until shutdown.
pub async fn run_offer_sweeper(ctx: Arc<SchedulerContext>, mut shutdown: watch::Receiver<bool>) {
    let period = Duration::from_secs(ctx.config.offer.sweep_interval_secs.max(1));
    loop {
        tokio::select! {
            _ = tokio::time::sleep(period) => {
                match ctx.offers.decline_expired(Instant::now()).await {
                    Ok(0) => {}
                    Ok(n) => {
                        info!(declined = n, "expired offers declined");
                        ctx.metrics.offers_held(ctx.offers.len());
                    }
                    Err(e) => warn!(error = %e, "offer sweep failed"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
