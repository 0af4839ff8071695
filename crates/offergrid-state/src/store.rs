//! StateStore — redb-backed state persistence for offergrid.
//!
//! Provides typed CRUD operations over applications, versions, taskgroups,
//! agents, agent scheduling deltas, deployments and transactions. All
//! values are JSON-serialized into redb's `&[u8]` value columns. The store
//! supports both on-disk and in-memory backends (the latter for testing).
//!
//! The store also owns the per-application and per-deployment lock pools
//! and the taskgroup cache; both are shared by every clone.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use crate::cache::{CacheManager, Lookup};
use crate::error::{StateError, StateResult};
use crate::ids::{TaskGroupId, TaskId};
use crate::locks::LockPool;
use crate::tables::*;
use crate::transaction::Transaction;
use crate::types::*;
use crate::version::Version;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

const FRAMEWORK_ID_KEY: &str = "framework_id";

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    app_locks: Arc<LockPool>,
    deployment_locks: Arc<LockPool>,
    cache: Arc<CacheManager>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::with_db(db);
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::with_db(db);
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn with_db(db: Database) -> Self {
        Self {
            db: Arc::new(db),
            app_locks: Arc::new(LockPool::new()),
            deployment_locks: Arc::new(LockPool::new()),
            cache: Arc::new(CacheManager::default()),
        }
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for table in [
            APPLICATIONS,
            TASKGROUPS,
            VERSIONS,
            TRANSACTIONS,
            AGENTS,
            AGENT_SCHED_INFO,
            DEPLOYMENTS,
            META,
        ] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic JSON access ────────────────────────────────────────

    fn put<T: Serialize>(&self, table: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let value = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            t.insert(key, value.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Every value whose key starts with `prefix`, in key order.
    fn list<T: DeserializeOwned>(&self, table: JsonTable, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.range(prefix..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(prefix) {
                break;
            }
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(results)
    }

    fn remove(&self, table: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            existed = t.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Applications ───────────────────────────────────────────────

    /// Insert or update an application.
    pub fn save_application(&self, app: &Application) -> StateResult<()> {
        let key = app.table_key();
        self.put(APPLICATIONS, &key, app)?;
        debug!(%key, status = ?app.status, "application stored");
        Ok(())
    }

    pub fn fetch_application(&self, run_as: &str, app_id: &str) -> StateResult<Option<Application>> {
        self.get(APPLICATIONS, &app_key(run_as, app_id))
    }

    /// List the applications of one namespace.
    pub fn list_applications(&self, run_as: &str) -> StateResult<Vec<Application>> {
        self.list(APPLICATIONS, &format!("{run_as}/"))
    }

    pub fn list_all_applications(&self) -> StateResult<Vec<Application>> {
        self.list(APPLICATIONS, "")
    }

    /// Delete an application together with its taskgroups (and their
    /// tasks) and versions. Returns true if the application existed.
    pub fn delete_application(&self, run_as: &str, app_id: &str) -> StateResult<bool> {
        let key = app_key(run_as, app_id);
        let children = format!("{key}/");
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut apps = txn.open_table(APPLICATIONS).map_err(map_err!(Table))?;
            existed = apps.remove(key.as_str()).map_err(map_err!(Write))?.is_some();
            for table in [TASKGROUPS, VERSIONS] {
                let mut t = txn.open_table(table).map_err(map_err!(Table))?;
                let keys: Vec<String> = t
                    .range(children.as_str()..)
                    .map_err(map_err!(Read))?
                    .filter_map(|entry| {
                        let (k, _) = entry.ok()?;
                        Some(k.value().to_string())
                    })
                    .take_while(|k| k.starts_with(&children))
                    .collect();
                for k in &keys {
                    t.remove(k.as_str()).map_err(map_err!(Write))?;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        self.cache.remove_prefix(&children);
        debug!(%key, existed, "application deleted");
        Ok(existed)
    }

    // ── Versions ───────────────────────────────────────────────────

    /// Persist a version unless it is content-equal to the latest stored
    /// version of the same application. Returns true if a record was written.
    ///
    /// Version names order chronologically, so the latest is the last key.
    pub fn save_version(&self, version: &Version) -> StateResult<bool> {
        let prefix = format!("{}/{}/", version.run_as, version.id);
        let key = version.table_key();
        let value = serde_json::to_vec(version).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let written;
        {
            let mut t = txn.open_table(VERSIONS).map_err(map_err!(Table))?;
            let latest: Option<Version> = match t
                .range(prefix.as_str()..)
                .map_err(map_err!(Read))?
                .filter_map(Result::ok)
                .take_while(|(k, _)| k.value().starts_with(&prefix))
                .last()
            {
                Some((_, v)) => {
                    Some(serde_json::from_slice(v.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };
            written = !latest.is_some_and(|l| l.same_content(version));
            if written {
                t.insert(key.as_str(), value.as_slice()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, written, "version save");
        Ok(written)
    }

    pub fn fetch_version(&self, run_as: &str, app_id: &str, name: &str) -> StateResult<Option<Version>> {
        self.get(VERSIONS, &format!("{run_as}/{app_id}/{name}"))
    }

    /// All versions of an application, oldest first.
    pub fn list_versions(&self, run_as: &str, app_id: &str) -> StateResult<Vec<Version>> {
        self.list(VERSIONS, &format!("{run_as}/{app_id}/"))
    }

    pub fn fetch_latest_version(&self, run_as: &str, app_id: &str) -> StateResult<Option<Version>> {
        Ok(self.list_versions(run_as, app_id)?.pop())
    }

    // ── TaskGroups / Tasks ─────────────────────────────────────────

    /// Insert or update a taskgroup and its embedded tasks.
    pub fn save_taskgroup(&self, tg: &TaskGroup) -> StateResult<()> {
        let key = tg.table_key();
        self.put(TASKGROUPS, &key, tg)?;
        self.cache.put(tg);
        debug!(%key, status = ?tg.status, "taskgroup stored");
        Ok(())
    }

    pub fn fetch_taskgroup(&self, id: &TaskGroupId) -> StateResult<Option<TaskGroup>> {
        let key = taskgroup_key(&id.run_as, &id.app_id, &id.to_string());
        match self.cache.lookup(&key) {
            Lookup::Hit(tg) => Ok(Some(tg)),
            Lookup::Absent => Ok(None),
            Lookup::Disabled => self.get(TASKGROUPS, &key),
        }
    }

    /// Taskgroups of one application, ordered by creation then index.
    pub fn list_taskgroups(&self, run_as: &str, app_id: &str) -> StateResult<Vec<TaskGroup>> {
        let prefix = format!("{}/", app_key(run_as, app_id));
        let mut groups = match self.cache.list(&prefix) {
            Some(groups) => groups,
            None => self.list(TASKGROUPS, &prefix)?,
        };
        groups.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(groups)
    }

    pub fn list_all_taskgroups(&self) -> StateResult<Vec<TaskGroup>> {
        match self.cache.list("") {
            Some(groups) => Ok(groups),
            None => self.list(TASKGROUPS, ""),
        }
    }

    /// Delete a taskgroup and its tasks. Returns true if it existed.
    pub fn delete_taskgroup(&self, id: &TaskGroupId) -> StateResult<bool> {
        let key = taskgroup_key(&id.run_as, &id.app_id, &id.to_string());
        let existed = self.remove(TASKGROUPS, &key)?;
        self.cache.remove(&key);
        debug!(%key, existed, "taskgroup deleted");
        Ok(existed)
    }

    pub fn fetch_task(&self, id: &TaskId) -> StateResult<Option<Task>> {
        Ok(self
            .fetch_taskgroup(&id.group)?
            .and_then(|tg| tg.tasks.into_iter().find(|t| &t.id == id)))
    }

    /// Replace one task inside its owning taskgroup.
    pub fn save_task(&self, task: &Task) -> StateResult<()> {
        let mut tg = self
            .fetch_taskgroup(&task.id.group)?
            .ok_or_else(|| StateError::NotFound(format!("taskgroup {}", task.id.group)))?;
        let slot = tg
            .task_mut(&task.id)
            .ok_or_else(|| StateError::NotFound(format!("task {}", task.id)))?;
        *slot = task.clone();
        self.save_taskgroup(&tg)
    }

    // ── Agents ─────────────────────────────────────────────────────

    pub fn save_agent(&self, agent: &Agent) -> StateResult<()> {
        self.put(AGENTS, &agent.key, agent)
    }

    pub fn fetch_agent(&self, key: &str) -> StateResult<Option<Agent>> {
        self.get(AGENTS, key)
    }

    pub fn list_agents(&self) -> StateResult<Vec<Agent>> {
        self.list(AGENTS, "")
    }

    pub fn delete_agent(&self, key: &str) -> StateResult<bool> {
        self.remove(AGENTS, key)
    }

    // ── Agent scheduling deltas ────────────────────────────────────

    pub fn save_agent_sched_info(&self, info: &AgentSchedInfo) -> StateResult<()> {
        self.put(AGENT_SCHED_INFO, &info.hostname, info)
    }

    pub fn fetch_agent_sched_info(&self, hostname: &str) -> StateResult<Option<AgentSchedInfo>> {
        self.get(AGENT_SCHED_INFO, hostname)
    }

    pub fn list_agent_sched_info(&self) -> StateResult<Vec<AgentSchedInfo>> {
        self.list(AGENT_SCHED_INFO, "")
    }

    pub fn delete_agent_sched_info(&self, hostname: &str) -> StateResult<bool> {
        self.remove(AGENT_SCHED_INFO, hostname)
    }

    // ── Deployments ────────────────────────────────────────────────

    pub fn save_deployment(&self, deployment: &Deployment) -> StateResult<()> {
        self.put(DEPLOYMENTS, &deployment.table_key(), deployment)
    }

    pub fn fetch_deployment(&self, run_as: &str, name: &str) -> StateResult<Option<Deployment>> {
        self.get(DEPLOYMENTS, &format!("{run_as}/{name}"))
    }

    pub fn list_deployments(&self, run_as: &str) -> StateResult<Vec<Deployment>> {
        self.list(DEPLOYMENTS, &format!("{run_as}/"))
    }

    pub fn list_all_deployments(&self) -> StateResult<Vec<Deployment>> {
        self.list(DEPLOYMENTS, "")
    }

    pub fn delete_deployment(&self, run_as: &str, name: &str) -> StateResult<bool> {
        self.remove(DEPLOYMENTS, &format!("{run_as}/{name}"))
    }

    // ── Transactions ───────────────────────────────────────────────

    pub fn save_transaction(&self, txn: &Transaction) -> StateResult<()> {
        let key = txn.table_key();
        self.put(TRANSACTIONS, &key, txn)?;
        debug!(%key, status = ?txn.status, "transaction stored");
        Ok(())
    }

    pub fn fetch_transaction(&self, namespace: &str, id: &str) -> StateResult<Option<Transaction>> {
        self.get(TRANSACTIONS, &format!("{namespace}/{id}"))
    }

    pub fn list_transactions(&self, namespace: &str) -> StateResult<Vec<Transaction>> {
        self.list(TRANSACTIONS, &format!("{namespace}/"))
    }

    pub fn list_all_transactions(&self) -> StateResult<Vec<Transaction>> {
        self.list(TRANSACTIONS, "")
    }

    pub fn delete_transaction(&self, namespace: &str, id: &str) -> StateResult<bool> {
        self.remove(TRANSACTIONS, &format!("{namespace}/{id}"))
    }

    // ── Framework id ───────────────────────────────────────────────

    pub fn save_framework_id(&self, id: &str) -> StateResult<()> {
        self.put(META, FRAMEWORK_ID_KEY, &id)
    }

    pub fn fetch_framework_id(&self) -> StateResult<Option<String>> {
        self.get(META, FRAMEWORK_ID_KEY)
    }

    // ── Locks ──────────────────────────────────────────────────────

    /// Pre-create locks for every stored application and deployment.
    pub fn init_lock_pool(&self) -> StateResult<()> {
        let apps = self.list_all_applications()?;
        self.app_locks.init(apps.iter().map(Application::table_key));
        let deployments = self.list_all_deployments()?;
        self.deployment_locks
            .init(deployments.iter().map(Deployment::table_key));
        debug!(apps = apps.len(), deployments = deployments.len(), "lock pool initialized");
        Ok(())
    }

    /// Serialize mutations of one application. Held until the guard drops.
    pub async fn lock_application(&self, run_as: &str, app_id: &str) -> OwnedMutexGuard<()> {
        self.app_locks.lock(&app_key(run_as, app_id)).await
    }

    pub fn try_lock_application(&self, run_as: &str, app_id: &str) -> Option<OwnedMutexGuard<()>> {
        self.app_locks.try_lock(&app_key(run_as, app_id))
    }

    pub async fn lock_deployment(&self, run_as: &str, name: &str) -> OwnedMutexGuard<()> {
        self.deployment_locks.lock(&format!("{run_as}/{name}")).await
    }

    // ── Cache ──────────────────────────────────────────────────────

    /// Load every taskgroup into memory and serve reads from there.
    pub fn init_cache_mgr(&self) -> StateResult<()> {
        let all = self.list(TASKGROUPS, "")?;
        let n = all.len();
        self.cache.enable(all);
        debug!(taskgroups = n, "taskgroup cache enabled");
        Ok(())
    }

    pub fn uninit_cache_mgr(&self) {
        self.cache.disable();
        debug!("taskgroup cache disabled");
    }

    pub fn cache_enabled(&self) -> bool {
        self.cache.is_enabled()
    }
}
