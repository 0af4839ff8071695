//! Write-through taskgroup cache.
//!
//! Status reports read and rewrite a taskgroup on every event; while the
//! scheduler is master the store keeps every taskgroup in memory as well.
//! When enabled the cache holds the complete set, so a miss is
//! authoritative.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use crate::types::TaskGroup;

/// Outcome of a cache lookup.
#[derive(Debug)]
pub enum Lookup {
    /// The cache is not enabled; ask the database.
    Disabled,
    Hit(TaskGroup),
    Absent,
}

#[derive(Debug, Default)]
pub struct CacheManager {
    taskgroups: RwLock<Option<BTreeMap<String, TaskGroup>>>,
}

impl CacheManager {
    /// Enable the cache with the full current taskgroup set.
    pub fn enable(&self, all: Vec<TaskGroup>) {
        let map = all.into_iter().map(|tg| (tg.table_key(), tg)).collect();
        *self.taskgroups.write().unwrap_or_else(PoisonError::into_inner) = Some(map);
    }

    pub fn disable(&self) {
        *self.taskgroups.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn is_enabled(&self) -> bool {
        self.taskgroups
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn lookup(&self, key: &str) -> Lookup {
        let guard = self.taskgroups.read().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            None => Lookup::Disabled,
            Some(map) => match map.get(key) {
                Some(tg) => Lookup::Hit(tg.clone()),
                None => Lookup::Absent,
            },
        }
    }

    /// Taskgroups whose key starts with `prefix`; `None` when disabled.
    pub fn list(&self, prefix: &str) -> Option<Vec<TaskGroup>> {
        let guard = self.taskgroups.read().unwrap_or_else(PoisonError::into_inner);
        guard.as_ref().map(|map| {
            map.range(prefix.to_string()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(_, tg)| tg.clone())
                .collect()
        })
    }

    pub fn put(&self, tg: &TaskGroup) {
        let mut guard = self.taskgroups.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(map) = guard.as_mut() {
            map.insert(tg.table_key(), tg.clone());
        }
    }

    pub fn remove(&self, key: &str) {
        let mut guard = self.taskgroups.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(map) = guard.as_mut() {
            map.remove(key);
        }
    }

    /// Drop every cached taskgroup under `prefix`.
    pub fn remove_prefix(&self, prefix: &str) {
        let mut guard = self.taskgroups.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(map) = guard.as_mut() {
            map.retain(|k, _| !k.starts_with(prefix));
        }
    }
}
