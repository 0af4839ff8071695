//! Metrics collector — scheduler counters and per-application gauges.
//!
//! Counters are atomics behind a read-mostly map so the hot path only
//! takes a read lock once the key exists. Gauges are re-read from the
//! state store on [`MetricsCollector::refresh_app_gauges`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use offergrid_state::{OpType, StateStore, TaskGroupStatus};

/// How an operation ended (or that it started).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Outcome {
    Started,
    Finished,
    Failed,
    Timeout,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Outcome::Started => "started",
            Outcome::Finished => "finished",
            Outcome::Failed => "failed",
            Outcome::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// Fire-and-forget metrics hooks called by the scheduler.
pub trait MetricsSink: Send + Sync {
    fn operation(&self, namespace: &str, app: &str, op: OpType, outcome: Outcome);
    fn taskgroup_status(&self, namespace: &str, app: &str, status: TaskGroupStatus);
    fn reschedule(&self, namespace: &str, app: &str);
    fn offers_held(&self, count: usize);
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn operation(&self, _: &str, _: &str, _: OpType, _: Outcome) {}
    fn taskgroup_status(&self, _: &str, _: &str, _: TaskGroupStatus) {}
    fn reschedule(&self, _: &str, _: &str) {}
    fn offers_held(&self, _: usize) {}
}

/// `{namespace, app, label}` key of one counter series.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SeriesKey {
    pub namespace: String,
    pub app: String,
    pub label: String,
}

#[derive(Default)]
struct Counters {
    series: RwLock<BTreeMap<SeriesKey, Arc<AtomicU64>>>,
}

impl Counters {
    fn inc(&self, key: SeriesKey) {
        if let Some(c) = self
            .series
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            c.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let mut series = self.series.write().unwrap_or_else(PoisonError::into_inner);
        series.entry(key).or_default().fetch_add(1, Ordering::Relaxed);
    }

    fn values(&self) -> Vec<(SeriesKey, u64)> {
        self.series
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect()
    }
}

/// Gauge values of one application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppGauge {
    pub namespace: String,
    pub app: String,
    pub instances: u32,
    pub running_instances: u32,
}

/// Point-in-time copy of every metric, as rendered for exposition.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub operations: Vec<(SeriesKey, u64)>,
    pub taskgroup_status: Vec<(SeriesKey, u64)>,
    pub reschedules: Vec<(SeriesKey, u64)>,
    pub offers_held: u64,
    pub apps: Vec<AppGauge>,
}

/// In-process metrics implementation.
pub struct MetricsCollector {
    operations: Counters,
    statuses: Counters,
    reschedules: Counters,
    offers_held: AtomicU64,
    apps: RwLock<Vec<AppGauge>>,
    state: StateStore,
}

impl MetricsCollector {
    pub fn new(state: StateStore) -> Self {
        Self {
            operations: Counters::default(),
            statuses: Counters::default(),
            reschedules: Counters::default(),
            offers_held: AtomicU64::new(0),
            apps: RwLock::new(Vec::new()),
            state,
        }
    }

    /// Re-read per-application instance gauges from the store.
    pub fn refresh_app_gauges(&self) -> anyhow::Result<()> {
        let gauges: Vec<AppGauge> = self
            .state
            .list_all_applications()?
            .into_iter()
            .map(|a| AppGauge {
                namespace: a.run_as,
                app: a.id,
                instances: a.instances,
                running_instances: a.running_instances,
            })
            .collect();
        debug!(apps = gauges.len(), "application gauges refreshed");
        *self.apps.write().unwrap_or_else(PoisonError::into_inner) = gauges;
        Ok(())
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            operations: self.operations.values(),
            taskgroup_status: self.statuses.values(),
            reschedules: self.reschedules.values(),
            offers_held: self.offers_held.load(Ordering::Relaxed),
            apps: self
                .apps
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }
}

fn key(namespace: &str, app: &str, label: impl ToString) -> SeriesKey {
    SeriesKey {
        namespace: namespace.to_string(),
        app: app.to_string(),
        label: label.to_string(),
    }
}

impl MetricsSink for MetricsCollector {
    fn operation(&self, namespace: &str, app: &str, op: OpType, outcome: Outcome) {
        self.operations
            .inc(key(namespace, app, format!("{op:?}/{outcome}").to_lowercase()));
    }

    fn taskgroup_status(&self, namespace: &str, app: &str, status: TaskGroupStatus) {
        self.statuses
            .inc(key(namespace, app, format!("{status:?}").to_lowercase()));
    }

    fn reschedule(&self, namespace: &str, app: &str) {
        self.reschedules.inc(key(namespace, app, "reschedule"));
    }

    fn offers_held(&self, count: usize) {
        self.offers_held.store(count as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use offergrid_state::{Application, WorkloadKind};

    fn collector() -> MetricsCollector {
        MetricsCollector::new(StateStore::open_in_memory().unwrap())
    }

    #[test]
    fn counters_accumulate_per_series() {
        let m = collector();
        m.operation("ns", "web", OpType::Launch, Outcome::Started);
        m.operation("ns", "web", OpType::Launch, Outcome::Started);
        m.operation("ns", "web", OpType::Launch, Outcome::Finished);
        m.operation("ns", "api", OpType::Delete, Outcome::Failed);

        let snap = m.snapshot();
        let get = |app: &str, label: &str| {
            snap.operations
                .iter()
                .find(|(k, _)| k.app == app && k.label == label)
                .map(|(_, v)| *v)
        };
        assert_eq!(get("web", "launch/started"), Some(2));
        assert_eq!(get("web", "launch/finished"), Some(1));
        assert_eq!(get("api", "delete/failed"), Some(1));
    }

    #[test]
    fn status_and_offer_gauges() {
        let m = collector();
        m.taskgroup_status("ns", "web", TaskGroupStatus::Running);
        m.reschedule("ns", "web");
        m.offers_held(7);
        let snap = m.snapshot();
        assert_eq!(snap.taskgroup_status[0].0.label, "running");
        assert_eq!(snap.reschedules[0].1, 1);
        assert_eq!(snap.offers_held, 7);
    }

    #[test]
    fn app_gauges_come_from_store() {
        let state = StateStore::open_in_memory().unwrap();
        let mut app = Application::new("ns", "web", "c1", WorkloadKind::App, 3);
        app.instances = 3;
        app.running_instances = 2;
        state.save_application(&app).unwrap();

        let m = MetricsCollector::new(state);
        m.refresh_app_gauges().unwrap();
        let snap = m.snapshot();
        assert_eq!(snap.apps.len(), 1);
        assert_eq!(snap.apps[0].running_instances, 2);
    }
}
