//! Scheduler configuration, read from TOML.
//!
//! Every section has defaults, so an empty file (or no file) yields a
//! usable configuration.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use offergrid_state::Resource;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Cluster id embedded in every taskgroup id.
    pub cluster_id: String,
    /// Transaction queue workers.
    pub workers: usize,
    /// Status reconciler shards.
    pub reconcile_shards: usize,
    pub transaction: TransactionConfig,
    pub queue: QueueConfig,
    pub offer: OfferConfig,
    pub agent: AgentConfig,
    pub checker: CheckerConfig,
    pub health: HealthConfig,
    pub events: EventConfig,
    /// Per-namespace resource ceilings. Namespaces not listed are unlimited.
    pub quotas: HashMap<String, Resource>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cluster_id: "offergrid".to_string(),
            workers: 4,
            reconcile_shards: 8,
            transaction: TransactionConfig::default(),
            queue: QueueConfig::default(),
            offer: OfferConfig::default(),
            agent: AgentConfig::default(),
            checker: CheckerConfig::default(),
            health: HealthConfig::default(),
            events: EventConfig::default(),
            quotas: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransactionConfig {
    /// Seconds between re-evaluations of a pending step.
    pub check_interval_secs: u64,
    /// Seconds before an unfinished transaction times out.
    pub lifetime_secs: u64,
    /// Seconds a terminal transaction stays visible before collection.
    pub retention_secs: u64,
    /// Seconds between timeout sweeps.
    pub sweep_interval_secs: u64,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 3,
            lifetime_secs: 600,
            retention_secs: 3600,
            sweep_interval_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    pub backoff_base_ms: u64,
    pub backoff_max_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: 500,
            backoff_max_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OfferConfig {
    /// Seconds an offer may be held before it is declined.
    pub lifetime_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for OfferConfig {
    fn default() -> Self {
        Self {
            lifetime_secs: 300,
            sweep_interval_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub sync_interval_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CheckerConfig {
    pub interval_secs: u64,
    /// Repair what a check pass finds instead of only reporting it.
    pub do_recover: bool,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 120,
            do_recover: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthConfig {
    /// Consecutive failed checks before a taskgroup is replaced, unless
    /// the version sets its own threshold.
    pub max_consecutive_failures: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EventConfig {
    /// First delay before re-subscribing to the cluster event stream.
    pub resubscribe_base_ms: u64,
    pub resubscribe_max_secs: u64,
    /// Capacity of the channel between the event stream and the reconciler.
    pub status_buffer: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            resubscribe_base_ms: 500,
            resubscribe_max_secs: 30,
            status_buffer: 1024,
        }
    }
}

impl SchedulerConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: SchedulerConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.transaction.check_interval_secs)
    }

    pub fn offer_lifetime(&self) -> Duration {
        Duration::from_secs(self.offer.lifetime_secs)
    }

    pub fn quota(&self, namespace: &str) -> Option<Resource> {
        self.quotas.get(namespace).copied()
    }
}
