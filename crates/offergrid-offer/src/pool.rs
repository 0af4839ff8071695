//! The resource offer pool.
//!
//! Offers are held in arrival order behind a short-lived mutex. Readers get
//! `Arc` snapshots, so scanning never blocks and never sees a torn list.
//! [`OfferPool::use_offer`] is the single compare-and-claim point: the
//! first caller to remove an offer wins, every other caller gets `false`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use offergrid_state::{Attribute, Resource};

use crate::accounting::AgentDeltaTracker;
use crate::error::OfferResult;

/// A grant of resources on one agent, as issued by the cluster manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Offer {
    pub id: String,
    pub agent_id: String,
    pub hostname: String,
    pub ip: String,
    pub resources: Resource,
    #[serde(default)]
    pub attributes: HashMap<String, Attribute>,
}

/// An offer held by the pool, with the delta already earmarked on its agent.
#[derive(Debug)]
pub struct PooledOffer {
    pub offer: Offer,
    pub delta: Resource,
    received: Instant,
    seq: u64,
}

impl PooledOffer {
    /// Offered resource minus outstanding reservations on the agent.
    pub fn available(&self) -> Resource {
        self.offer.resources.saturating_sub(&self.delta)
    }

    pub fn fits(&self, need: &Resource) -> bool {
        self.available().fits(need)
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.received)
    }
}

/// Returns offers the scheduler will not use to the cluster manager.
#[async_trait]
pub trait Decliner: Send + Sync {
    async fn decline(&self, offer_ids: Vec<String>) -> OfferResult<()>;
}

pub struct OfferPool {
    offers: Mutex<Vec<Arc<PooledOffer>>>,
    next_seq: AtomicU64,
    tracker: Arc<AgentDeltaTracker>,
    decliner: Arc<dyn Decliner>,
    lifetime: Duration,
}

impl OfferPool {
    pub fn new(
        tracker: Arc<AgentDeltaTracker>,
        decliner: Arc<dyn Decliner>,
        lifetime: Duration,
    ) -> Self {
        Self {
            offers: Mutex::new(Vec::new()),
            next_seq: AtomicU64::new(0),
            tracker,
            decliner,
            lifetime,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<PooledOffer>>> {
        self.offers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add newly arrived offers.
    ///
    /// A fresh offer for an agent that already has one in the pool
    /// supersedes it; the older offer is declined.
    pub async fn add_offers(&self, offers: Vec<Offer>) -> OfferResult<()> {
        let now = Instant::now();
        let mut superseded = Vec::new();
        {
            let mut pool = self.lock();
            for offer in offers {
                pool.retain(|held| {
                    let stale = held.offer.agent_id == offer.agent_id;
                    if stale {
                        superseded.push(held.offer.id.clone());
                    }
                    !stale
                });
                let delta = self.tracker.delta(&offer.hostname);
                debug!(
                    offer = %offer.id,
                    hostname = %offer.hostname,
                    cpus = offer.resources.cpus,
                    mem = offer.resources.mem,
                    delta_cpu = delta.cpus,
                    "offer added"
                );
                pool.push(Arc::new(PooledOffer {
                    offer,
                    delta,
                    received: now,
                    seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                }));
            }
        }
        if !superseded.is_empty() {
            debug!(count = superseded.len(), "declining superseded offers");
            self.decliner.decline(superseded).await?;
        }
        Ok(())
    }

    /// Snapshot of the held offers in arrival order.
    pub fn snapshot(&self) -> Vec<Arc<PooledOffer>> {
        self.lock().clone()
    }

    pub fn first_offer(&self) -> Option<Arc<PooledOffer>> {
        self.lock().first().cloned()
    }

    /// The offer after `prev` in arrival order, whether or not `prev` is
    /// still held.
    pub fn next_offer(&self, prev: &PooledOffer) -> Option<Arc<PooledOffer>> {
        self.lock().iter().find(|o| o.seq > prev.seq).cloned()
    }

    /// Claim `offer`. Returns false if it is no longer in the pool.
    pub fn use_offer(&self, offer: &PooledOffer) -> bool {
        let mut pool = self.lock();
        match pool.iter().position(|o| o.seq == offer.seq) {
            Some(idx) => {
                pool.remove(idx);
                debug!(offer = %offer.offer.id, "offer claimed");
                true
            }
            None => false,
        }
    }

    /// Copies of every held offer, for reporting.
    pub fn all_offers(&self) -> Vec<Offer> {
        self.lock().iter().map(|o| o.offer.clone()).collect()
    }

    /// Drop an offer the cluster manager withdrew. No decline is sent.
    pub fn rescind(&self, offer_id: &str) -> bool {
        let mut pool = self.lock();
        let before = pool.len();
        pool.retain(|o| o.offer.id != offer_id);
        let removed = pool.len() != before;
        if removed {
            debug!(offer = offer_id, "offer rescinded");
        }
        removed
    }

    /// Remove and decline one offer. Returns false if it was not held.
    pub async fn decline_offer(&self, offer_id: &str) -> OfferResult<bool> {
        if !self.rescind(offer_id) {
            return Ok(false);
        }
        self.decliner.decline(vec![offer_id.to_string()]).await?;
        Ok(true)
    }

    /// Return a claimed offer's grant to the cluster manager.
    pub async fn decline_claimed(&self, offer: &PooledOffer) -> OfferResult<()> {
        self.decliner.decline(vec![offer.offer.id.clone()]).await
    }

    /// Decline every offer held longer than the configured lifetime.
    pub async fn decline_expired(&self, now: Instant) -> OfferResult<usize> {
        let expired: Vec<String> = {
            let mut pool = self.lock();
            let mut expired = Vec::new();
            pool.retain(|o| {
                let keep = o.age(now) < self.lifetime;
                if !keep {
                    expired.push(o.offer.id.clone());
                }
                keep
            });
            expired
        };
        let n = expired.len();
        if n > 0 {
            info!(count = n, "declining expired offers");
            self.decliner.decline(expired).await?;
        }
        Ok(n)
    }

    /// Decline everything; used when this instance stops being master.
    pub async fn decline_all(&self) -> OfferResult<usize> {
        let ids: Vec<String> = self.lock().drain(..).map(|o| o.offer.id.clone()).collect();
        let n = ids.len();
        if n > 0 {
            if let Err(e) = self.decliner.decline(ids).await {
                warn!(error = %e, count = n, "failed to decline offers");
                return Err(e);
            }
            info!(count = n, "declined all offers");
        }
        Ok(n)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use offergrid_state::StateStore;

    #[derive(Default)]
    pub struct RecordingDecliner {
        pub declined: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Decliner for RecordingDecliner {
        async fn decline(&self, offer_ids: Vec<String>) -> OfferResult<()> {
            self.declined.lock().unwrap().extend(offer_ids);
            Ok(())
        }
    }

    pub fn offer(id: &str, agent: &str) -> Offer {
        Offer {
            id: id.to_string(),
            agent_id: agent.to_string(),
            hostname: format!("host-{agent}"),
            ip: "10.0.0.1".to_string(),
            resources: Resource::new(4.0, 4096.0, 4096.0),
            attributes: HashMap::new(),
        }
    }

    fn pool_with(lifetime: Duration) -> (Arc<OfferPool>, Arc<RecordingDecliner>, Arc<AgentDeltaTracker>) {
        let tracker = Arc::new(AgentDeltaTracker::load(StateStore::open_in_memory().unwrap()).unwrap());
        let decliner = Arc::new(RecordingDecliner::default());
        let pool = Arc::new(OfferPool::new(tracker.clone(), decliner.clone(), lifetime));
        (pool, decliner, tracker)
    }

    #[tokio::test]
    async fn concurrent_claims_have_one_winner() {
        let (pool, _, _) = pool_with(Duration::from_secs(60));
        pool.add_offers(vec![offer("o1", "a1")]).await.unwrap();
        let target = pool.first_offer().unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let pool = pool.clone();
            let target = target.clone();
            handles.push(tokio::spawn(async move { pool.use_offer(&target) }));
        }
        let mut wins = 0;
        for h in handles {
            if h.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn iteration_survives_concurrent_removal() {
        let (pool, _, _) = pool_with(Duration::from_secs(60));
        pool.add_offers(vec![offer("o1", "a1"), offer("o2", "a2"), offer("o3", "a3")])
            .await
            .unwrap();

        let first = pool.first_offer().unwrap();
        assert!(pool.use_offer(&first));
        // The claimed offer still works as a cursor.
        let second = pool.next_offer(&first).unwrap();
        assert_eq!(second.offer.id, "o2");
        assert!(pool.rescind("o2"));
        let third = pool.next_offer(&second).unwrap();
        assert_eq!(third.offer.id, "o3");
        assert!(pool.next_offer(&third).is_none());
    }

    #[tokio::test]
    async fn offer_carries_agent_delta() {
        let (pool, _, tracker) = pool_with(Duration::from_secs(60));
        tracker
            .update_agent_sched_info("host-a1", "tg", Some(Resource::new(1.0, 1024.0, 0.0)))
            .unwrap();
        pool.add_offers(vec![offer("o1", "a1")]).await.unwrap();
        let held = pool.first_offer().unwrap();
        assert_eq!(held.available(), Resource::new(3.0, 3072.0, 4096.0));
        assert!(!held.fits(&Resource::new(3.5, 1.0, 1.0)));
    }

    #[tokio::test]
    async fn newer_offer_for_same_agent_supersedes() {
        let (pool, decliner, _) = pool_with(Duration::from_secs(60));
        pool.add_offers(vec![offer("o1", "a1"), offer("o2", "a2")]).await.unwrap();
        pool.add_offers(vec![offer("o3", "a1")]).await.unwrap();

        let ids: Vec<String> = pool.all_offers().into_iter().map(|o| o.id).collect();
        assert_eq!(ids, vec!["o2", "o3"]);
        assert_eq!(*decliner.declined.lock().unwrap(), vec!["o1".to_string()]);
    }

    #[tokio::test]
    async fn expired_and_demoted_offers_are_declined() {
        let (pool, decliner, _) = pool_with(Duration::from_secs(5));
        pool.add_offers(vec![offer("o1", "a1"), offer("o2", "a2")]).await.unwrap();

        assert_eq!(pool.decline_expired(Instant::now()).await.unwrap(), 0);
        let later = Instant::now() + Duration::from_secs(10);
        assert_eq!(pool.decline_expired(later).await.unwrap(), 2);
        assert!(pool.is_empty());

        pool.add_offers(vec![offer("o3", "a3")]).await.unwrap();
        assert!(pool.decline_offer("o3").await.unwrap());
        assert!(!pool.decline_offer("o3").await.unwrap());

        pool.add_offers(vec![offer("o4", "a4")]).await.unwrap();
        assert_eq!(pool.decline_all().await.unwrap(), 1);
        assert_eq!(decliner.declined.lock().unwrap().len(), 4);
    }
}
