//! End-to-end operation scenarios against an in-memory store and a fake
//! cluster manager.

mod common;

use common::{Harness, big, version};

use offergrid_scheduler::agent_sync::sync_agents;
use offergrid_scheduler::checker::{inspect, repair_store};
use offergrid_scheduler::{
    CheckReport, DataChecker, FollowUp, HealthReport, Reconciler, SchedulerConfig, SchedulerError, TaskStatusUpdate,
};
use offergrid_state::{
    AgentInfo, AppStatus, OpType, Resource, TaskGroup, TaskStatus, TaskGroupStatus, TransactionStatus,
    UpgradeStrategy, WorkloadKind, now_secs,
};

async fn report(h: &Harness, tg: &TaskGroup, status: TaskStatus) {
    let reconciler = Reconciler::new(h.engine.clone());
    for task in &tg.tasks {
        reconciler
            .handle_status_update(&TaskStatusUpdate {
                task_id: task.id.to_string(),
                status,
                message: format!("{status:?}"),
                agent_id: tg.agent_id.clone(),
                data: None,
            })
            .await
            .unwrap();
    }
}

async fn health(h: &Harness, tg: &TaskGroup, healthy: bool) -> FollowUp {
    Reconciler::new(h.engine.clone())
        .handle_health_report(&HealthReport {
            task_id: tg.tasks[0].id.to_string(),
            healthy,
            message: String::new(),
        })
        .await
        .unwrap()
}

async fn launch_running(h: &Harness, app: &str, instances: u32) -> Vec<TaskGroup> {
    let hosts: Vec<String> = (0..instances).map(|i| format!("{app}-h{i}")).collect();
    let hosts: Vec<&str> = hosts.iter().map(String::as_str).collect();
    h.offer(&hosts, big()).await;
    let txn = h.engine.launch_application(version("ns", app, instances)).await.unwrap();
    let txn = h.drive(&txn, 3).await;
    assert_eq!(txn.status, TransactionStatus::Finish);
    for tg in h.store.list_taskgroups("ns", app).unwrap() {
        report(h, &tg, TaskStatus::Running).await;
    }
    h.store.list_taskgroups("ns", app).unwrap()
}

// ── Launch ─────────────────────────────────────────────────────────

#[tokio::test]
async fn launch_places_one_taskgroup_per_offer() {
    let h = Harness::new();
    h.offer(&["a", "b", "c"], big()).await;

    let txn = h.engine.launch_application(version("ns", "web", 3)).await.unwrap();
    let app = h.store.fetch_application("ns", "web").unwrap().unwrap();
    assert_eq!(app.status, AppStatus::Operating);
    assert_eq!(app.sub_status, Some(OpType::Launch));

    let txn = h.drive(&txn, 3).await;
    assert_eq!(txn.status, TransactionStatus::Finish);

    let groups = h.store.list_taskgroups("ns", "web").unwrap();
    assert_eq!(groups.len(), 3);
    let mut indices: Vec<u32> = groups.iter().map(TaskGroup::index).collect();
    indices.sort();
    assert_eq!(indices, vec![0, 1, 2]);
    for tg in &groups {
        assert_eq!(tg.curr_resource, Resource::new(1.0, 128.0, 128.0));
        assert_eq!(tg.status, TaskGroupStatus::Staging);
    }
    assert!(h.context().offers.is_empty());
    assert_eq!(h.cluster.launched(), 3);

    let app = h.store.fetch_application("ns", "web").unwrap().unwrap();
    assert_eq!(app.sub_status, None);
    assert_eq!(app.instances, 3);
    assert_eq!(app.status, AppStatus::Deploying);
}

#[tokio::test]
async fn launch_waits_for_offers() {
    let h = Harness::new();
    h.offer(&["a"], big()).await;
    let txn = h.engine.launch_application(version("ns", "web", 2)).await.unwrap();

    let txn = h.drive(&txn, 1).await;
    assert_eq!(txn.status, TransactionStatus::Init);
    assert_eq!(h.store.list_taskgroups("ns", "web").unwrap().len(), 1);

    h.offer(&["b"], big()).await;
    let txn = h.drive(&txn, 1).await;
    assert_eq!(txn.status, TransactionStatus::Finish);
    assert_eq!(h.store.list_taskgroups("ns", "web").unwrap().len(), 2);
}

#[tokio::test]
async fn second_launch_of_same_app_is_refused() {
    let h = Harness::new();
    h.engine.launch_application(version("ns", "web", 1)).await.unwrap();
    let err = h.engine.launch_application(version("ns", "web", 1)).await.unwrap_err();
    assert!(matches!(err, SchedulerError::AppExists { .. }));
}

#[tokio::test]
async fn running_reports_bring_app_to_running() {
    let h = Harness::new();
    let groups = launch_running(&h, "web", 2).await;
    assert!(groups.iter().all(|tg| tg.status == TaskGroupStatus::Running));
    let app = h.store.fetch_application("ns", "web").unwrap().unwrap();
    assert_eq!(app.status, AppStatus::Running);
    assert_eq!(app.running_instances, 2);
    // Running clears the launch reservation on the agent.
    assert!(h.context().deltas.delta("web-h0").is_zero());
}

// ── Delete ─────────────────────────────────────────────────────────

#[tokio::test]
async fn delete_during_rolling_update_is_refused_without_enforce() {
    let h = Harness::new();
    launch_running(&h, "web", 1).await;
    let mut v2 = version("ns", "web", 1);
    if let offergrid_state::Workload::App { containers } = &mut v2.workload {
        containers[0].image = "registry/web:2".into();
    }
    h.engine
        .update_application(v2, UpgradeStrategy::default())
        .await
        .unwrap();
    let before = h.store.fetch_application("ns", "web").unwrap().unwrap();
    assert_eq!(before.status, AppStatus::RollingUpdate);

    let err = h
        .engine
        .delete_application("ns", "web", WorkloadKind::App, false)
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::InRollingUpdate { .. }));
    let after = h.store.fetch_application("ns", "web").unwrap().unwrap();
    assert_eq!(after.status, AppStatus::RollingUpdate);
    assert_eq!(after.sub_status, Some(OpType::Update));
}

#[tokio::test]
async fn concurrent_deletes_serialize() {
    let h = Harness::new();
    let txn = h.engine.launch_application(version("ns", "web", 0)).await.unwrap();
    assert_eq!(h.drive(&txn, 1).await.status, TransactionStatus::Finish);

    let (a, b) = tokio::join!(
        h.engine.delete_application("ns", "web", WorkloadKind::App, false),
        h.engine.delete_application("ns", "web", WorkloadKind::App, false),
    );
    let (ok, err) = match (a, b) {
        (Ok(t), Err(e)) | (Err(e), Ok(t)) => (t, e),
        other => panic!("expected exactly one delete to succeed: {other:?}"),
    };
    assert_eq!(ok.status, TransactionStatus::Finish);
    assert!(matches!(err, SchedulerError::AppNotFound { .. }));
    assert!(h.store.fetch_application("ns", "web").unwrap().is_none());
}

#[tokio::test]
async fn concurrent_deletes_of_running_app_start_one_transaction() {
    let h = Harness::new();
    launch_running(&h, "web", 2).await;

    let (a, b) = tokio::join!(
        h.engine.delete_application("ns", "web", WorkloadKind::App, false),
        h.engine.delete_application("ns", "web", WorkloadKind::App, false),
    );
    let (ok, err) = match (a, b) {
        (Ok(t), Err(e)) | (Err(e), Ok(t)) => (t, e),
        other => panic!("expected exactly one delete to succeed: {other:?}"),
    };
    assert_eq!(ok.status, TransactionStatus::Init);
    assert!(matches!(err, SchedulerError::UnderOperation { .. }));
    // Only the winner asked the cluster to stop the taskgroups.
    assert_eq!(h.cluster.killed().len(), 2);
    let deletes = h
        .store
        .list_transactions("ns")
        .unwrap()
        .into_iter()
        .filter(|t| t.op_type() == OpType::Delete)
        .count();
    assert_eq!(deletes, 1);
}

#[tokio::test]
async fn delete_waits_for_taskgroups_to_stop() {
    let h = Harness::new();
    let groups = launch_running(&h, "web", 2).await;

    let txn = h
        .engine
        .delete_application("ns", "web", WorkloadKind::App, false)
        .await
        .unwrap();
    assert_eq!(txn.status, TransactionStatus::Init);
    assert_eq!(h.cluster.killed().len(), 2);
    let app = h.store.fetch_application("ns", "web").unwrap().unwrap();
    assert_eq!(app.sub_status, Some(OpType::Delete));

    let again = h
        .engine
        .delete_application("ns", "web", WorkloadKind::App, false)
        .await
        .unwrap_err();
    assert!(matches!(again, SchedulerError::UnderOperation { .. }));

    assert_eq!(h.drive(&txn, 1).await.status, TransactionStatus::Init);
    for tg in &groups {
        report(&h, tg, TaskStatus::Killed).await;
    }
    // Killed under a delete never asks for a replacement.
    assert!(h.engine.pending_reschedule(&groups[0].id).unwrap().is_none());

    assert_eq!(h.drive(&txn, 1).await.status, TransactionStatus::Finish);
    assert!(h.store.fetch_application("ns", "web").unwrap().is_none());
    assert!(h.store.list_taskgroups("ns", "web").unwrap().is_empty());

    let gone = h
        .engine
        .delete_application("ns", "web", WorkloadKind::App, false)
        .await
        .unwrap_err();
    assert!(matches!(gone, SchedulerError::AppNotFound { .. }));
}

#[tokio::test]
async fn delete_with_wrong_kind_is_refused() {
    let h = Harness::new();
    h.engine.launch_application(version("ns", "web", 0)).await.unwrap();
    let err = h
        .engine
        .delete_application("ns", "web", WorkloadKind::Process, false)
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::KindMismatch { .. }));
}

// ── Status reports and reschedule ──────────────────────────────────

#[tokio::test]
async fn failed_task_triggers_reschedule_of_its_slot() {
    let h = Harness::new();
    let groups = launch_running(&h, "web", 1).await;
    let old = &groups[0];

    report(&h, old, TaskStatus::Failed).await;
    let failed = h.store.fetch_taskgroup(&old.id).unwrap().unwrap();
    assert_eq!(failed.status, TaskGroupStatus::Failed);
    let app = h.store.fetch_application("ns", "web").unwrap().unwrap();
    assert_eq!(app.status, AppStatus::Abnormal);

    let txn = h
        .engine
        .pending_reschedule(&old.id)
        .unwrap()
        .expect("reschedule enqueued");
    assert_eq!(txn.op_type(), OpType::Reschedule);

    // A duplicate report does not enqueue a second reschedule.
    report(&h, old, TaskStatus::Failed).await;
    let pending = h
        .store
        .list_transactions("ns")
        .unwrap()
        .into_iter()
        .filter(|t| t.op_type() == OpType::Reschedule && !t.is_terminal())
        .count();
    assert_eq!(pending, 1);

    h.offer(&["spare"], big()).await;
    assert_eq!(h.drive(&txn, 2).await.status, TransactionStatus::Finish);
    let groups = h.store.list_taskgroups("ns", "web").unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].index(), 0);
    assert_eq!(groups[0].resched_times, 1);
    assert_ne!(groups[0].id, old.id);
}

#[tokio::test]
async fn failed_health_checks_reschedule_at_the_threshold() {
    let h = Harness::new();
    let groups = launch_running(&h, "web", 1).await;
    let tg = &groups[0];

    assert_eq!(health(&h, tg, false).await, FollowUp::None);
    assert_eq!(health(&h, tg, false).await, FollowUp::None);
    // A passing check resets the count.
    assert_eq!(health(&h, tg, true).await, FollowUp::None);
    assert_eq!(health(&h, tg, false).await, FollowUp::None);
    assert_eq!(health(&h, tg, false).await, FollowUp::None);
    assert!(h.engine.pending_reschedule(&tg.id).unwrap().is_none());

    let third = health(&h, tg, false).await;
    assert!(matches!(&third, FollowUp::Reschedule { id, .. } if *id == tg.id), "{third:?}");
    let stored = h.store.fetch_taskgroup(&tg.id).unwrap().unwrap();
    assert_eq!(stored.tasks[0].consecutive_failure_times, 3);
    assert!(!stored.tasks[0].healthy);
    assert!(h.engine.pending_reschedule(&tg.id).unwrap().is_some());

    // Staying unhealthy past the threshold does not ask again.
    assert_eq!(health(&h, tg, false).await, FollowUp::None);
}

#[tokio::test]
async fn report_for_unknown_taskgroup_kills_the_task() {
    let h = Harness::new();
    let reconciler = Reconciler::new(h.engine.clone());
    reconciler
        .handle_status_update(&TaskStatusUpdate {
            task_id: "0.0.ghost.ns.offergrid.42".into(),
            status: TaskStatus::Running,
            message: String::new(),
            agent_id: Some("agent-x".into()),
            data: None,
        })
        .await
        .unwrap();
    assert_eq!(h.cluster.killed(), vec!["0.0.ghost.ns.offergrid.42".to_string()]);
}

// ── Scale ──────────────────────────────────────────────────────────

#[tokio::test]
async fn scale_up_then_down() {
    let h = Harness::new();
    launch_running(&h, "web", 1).await;

    h.offer(&["x", "y"], big()).await;
    let up = h.engine.scale_application("ns", "web", 3).await.unwrap();
    assert_eq!(h.drive(&up, 2).await.status, TransactionStatus::Finish);
    let groups = h.store.list_taskgroups("ns", "web").unwrap();
    assert_eq!(groups.len(), 3);

    let down = h.engine.scale_application("ns", "web", 1).await.unwrap();
    assert_eq!(h.drive(&down, 1).await.status, TransactionStatus::Init);
    let stopping: Vec<TaskGroup> = h
        .store
        .list_taskgroups("ns", "web")
        .unwrap()
        .into_iter()
        .filter(|tg| tg.kill_requested)
        .collect();
    let mut indices: Vec<u32> = stopping.iter().map(TaskGroup::index).collect();
    indices.sort();
    assert_eq!(indices, vec![1, 2]);

    for tg in &stopping {
        report(&h, tg, TaskStatus::Killed).await;
    }
    assert_eq!(h.drive(&down, 1).await.status, TransactionStatus::Finish);
    let groups = h.store.list_taskgroups("ns", "web").unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].index(), 0);

    let app = h.store.fetch_application("ns", "web").unwrap().unwrap();
    assert_eq!(app.define_instances, 1);
    assert_eq!(app.status, AppStatus::Running);
}

#[tokio::test]
async fn inner_scale_removes_named_indices_first() {
    let h = Harness::new();
    launch_running(&h, "web", 3).await;

    let txn = h
        .engine
        .inner_scale_application("ns", "web", 2, vec![0])
        .await
        .unwrap();
    assert_eq!(txn.op_type(), OpType::InnerScale);
    assert_eq!(h.drive(&txn, 1).await.status, TransactionStatus::Init);
    let stopping: Vec<TaskGroup> = h
        .store
        .list_taskgroups("ns", "web")
        .unwrap()
        .into_iter()
        .filter(|tg| tg.kill_requested)
        .collect();
    assert_eq!(stopping.len(), 1);
    assert_eq!(stopping[0].index(), 0);

    report(&h, &stopping[0], TaskStatus::Killed).await;
    assert_eq!(h.drive(&txn, 1).await.status, TransactionStatus::Finish);
    let mut indices: Vec<u32> = h
        .store
        .list_taskgroups("ns", "web")
        .unwrap()
        .iter()
        .map(TaskGroup::index)
        .collect();
    indices.sort();
    assert_eq!(indices, vec![1, 2]);
    let app = h.store.fetch_application("ns", "web").unwrap().unwrap();
    assert_eq!(app.define_instances, 2);
    assert_eq!(app.sub_status, None);
}

#[tokio::test]
async fn scale_is_refused_while_another_operation_runs() {
    let h = Harness::new();
    h.engine.launch_application(version("ns", "web", 2)).await.unwrap();
    let err = h.engine.scale_application("ns", "web", 4).await.unwrap_err();
    assert!(matches!(err, SchedulerError::UnderOperation { .. }));
}

// ── Rolling update ─────────────────────────────────────────────────

#[tokio::test]
async fn update_replaces_taskgroups_then_rollback_is_possible() {
    let h = Harness::new();
    let groups = launch_running(&h, "web", 1).await;
    let first_version = groups[0].version.clone();

    let mut v2 = version("ns", "web", 1);
    if let offergrid_state::Workload::App { containers } = &mut v2.workload {
        containers[0].image = "registry/web:2".into();
    }
    h.offer(&["new"], big()).await;
    let txn = h
        .engine
        .update_application(v2, UpgradeStrategy::default())
        .await
        .unwrap();
    let target = h
        .store
        .fetch_application("ns", "web")
        .unwrap()
        .unwrap()
        .current_version;
    assert_ne!(target, first_version);
    let dep = h.store.fetch_deployment("ns", "web").unwrap().unwrap();
    assert!(dep.is_in_rolling);

    // Surge: the replacement starts before the old one is touched.
    assert_eq!(h.drive(&txn, 1).await.status, TransactionStatus::Init);
    let fresh = h
        .store
        .list_taskgroups("ns", "web")
        .unwrap()
        .into_iter()
        .find(|tg| tg.version == target)
        .expect("replacement launched");
    assert!(h.cluster.killed().is_empty());

    report(&h, &fresh, TaskStatus::Running).await;
    assert_eq!(h.drive(&txn, 1).await.status, TransactionStatus::Init);
    assert_eq!(h.cluster.killed().len(), 1);

    report(&h, &groups[0], TaskStatus::Killed).await;
    let done = h.drive(&txn, 3).await;
    assert_eq!(done.status, TransactionStatus::Finish);

    let app = h.store.fetch_application("ns", "web").unwrap().unwrap();
    assert_eq!(app.status, AppStatus::Running);
    assert_eq!(app.sub_status, None);
    let remaining = h.store.list_taskgroups("ns", "web").unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].version, target);
    assert!(!h.store.fetch_deployment("ns", "web").unwrap().unwrap().is_in_rolling);

    h.engine
        .rollback_application("ns", "web", UpgradeStrategy::default())
        .await
        .unwrap();
    let app = h.store.fetch_application("ns", "web").unwrap().unwrap();
    assert_eq!(app.current_version, first_version);
    assert_eq!(app.sub_status, Some(OpType::Rollback));
}

#[tokio::test]
async fn rollback_without_history_fails() {
    let h = Harness::new();
    launch_running(&h, "web", 1).await;
    let err = h
        .engine
        .rollback_application("ns", "web", UpgradeStrategy::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::VersionNotFound(_)));
}

// ── Timeouts, quotas and repair ────────────────────────────────────

#[tokio::test]
async fn expired_transaction_is_timed_out_by_the_sweep() {
    let mut config = SchedulerConfig::default();
    config.transaction.lifetime_secs = 0;
    let h = Harness::with_config(config);
    let txn = h.engine.launch_application(version("ns", "web", 1)).await.unwrap();

    let report = h.engine.sweep_timeouts().await.unwrap();
    assert_eq!(report.timed_out, vec![txn.table_key()]);
    let stored = h
        .store
        .fetch_transaction("ns", &txn.transaction_id)
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, TransactionStatus::Timeout);
    let app = h.store.fetch_application("ns", "web").unwrap().unwrap();
    assert_eq!(app.sub_status, None);

    // A timed-out transaction is not stepped again.
    let again = h.drive(&txn, 1).await;
    assert_eq!(again.status, TransactionStatus::Timeout);
}

#[tokio::test]
async fn consistency_repair_releases_app_of_expired_transaction() {
    let mut config = SchedulerConfig::default();
    config.transaction.lifetime_secs = 0;
    let h = Harness::with_config(config);
    let txn = h.engine.launch_application(version("ns", "web", 1)).await.unwrap();

    let report = inspect(&h.store, None, now_secs()).unwrap();
    assert_eq!(report.expired_transactions, vec![txn.table_key()]);
    repair_store(&h.store, &h.context().deltas, &report).unwrap();

    let stored = h
        .store
        .fetch_transaction("ns", &txn.transaction_id)
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, TransactionStatus::Timeout);
    let app = h.store.fetch_application("ns", "web").unwrap().unwrap();
    assert_eq!(app.sub_status, None);
    assert_ne!(app.status, AppStatus::Operating);
    assert!(h.engine.scale_application("ns", "web", 2).await.is_ok());
}

#[tokio::test]
async fn repair_keeps_taskgroup_whose_application_appeared_meanwhile() {
    let h = Harness::new();
    let groups = launch_running(&h, "web", 1).await;
    // Taken as if the application had not been saved yet.
    let stale = CheckReport {
        orphan_taskgroups: vec![groups[0].id.clone()],
        ..Default::default()
    };

    DataChecker::new(h.engine.clone()).repair(&stale).await.unwrap();
    assert!(h.cluster.killed().is_empty());
    assert!(h.store.fetch_taskgroup(&groups[0].id).unwrap().is_some());

    // Once the application is really gone the same taskgroup is removed.
    h.store.delete_application("ns", "web").unwrap();
    h.store.save_taskgroup(&groups[0]).unwrap();
    DataChecker::new(h.engine.clone()).repair(&stale).await.unwrap();
    assert_eq!(h.cluster.killed().len(), groups[0].tasks.len());
    assert!(h.store.fetch_taskgroup(&groups[0].id).unwrap().is_none());
}

#[tokio::test]
async fn launch_over_quota_waits_for_offers() {
    let mut config = SchedulerConfig::default();
    config
        .quotas
        .insert("ns".into(), Resource::new(1.0, 1024.0, 1024.0));
    let h = Harness::with_config(config);
    h.offer(&["a", "b"], big()).await;

    let txn = h.engine.launch_application(version("ns", "web", 2)).await.unwrap();
    // The first taskgroup fits the quota; the second does not.
    let txn = h.drive(&txn, 1).await;
    assert_eq!(txn.status, TransactionStatus::Init);
    assert!(txn.message.contains("quota"), "{}", txn.message);
    assert_eq!(h.store.list_taskgroups("ns", "web").unwrap().len(), 1);
}

#[tokio::test]
async fn failed_launch_rolls_back_the_reservation() {
    let h = Harness::new();
    h.offer(&["a"], big()).await;
    *h.cluster.fail_launch.lock().unwrap() = true;

    let txn = h.engine.launch_application(version("ns", "web", 1)).await.unwrap();
    let txn = h.drive(&txn, 1).await;
    assert_eq!(txn.status, TransactionStatus::Init);
    assert!(h.store.list_taskgroups("ns", "web").unwrap().is_empty());
    assert!(h.context().deltas.delta("a").is_zero());
    assert_eq!(h.cluster.declined().len(), 1);
}

// ── Agents ─────────────────────────────────────────────────────────

fn agent_info(host: &str, ip: &str) -> AgentInfo {
    AgentInfo {
        agent_id: format!("agent-{host}"),
        hostname: host.to_string(),
        ip: ip.to_string(),
        total: big(),
        used: Resource::ZERO,
        attributes: Default::default(),
    }
}

#[tokio::test]
async fn agents_are_keyed_by_ip_and_departed_ones_are_dropped() {
    let h = Harness::new();
    *h.cluster.agents.lock().unwrap() =
        vec![agent_info("a", "10.0.0.1"), agent_info("b", "10.0.0.2")];

    let synced = sync_agents(h.context()).await.unwrap();
    assert_eq!(synced.added, 2);
    let stored = h.store.fetch_agent("10.0.0.2").unwrap().unwrap();
    assert_eq!(stored.agent_info.hostname, "b");
    assert_eq!(sync_agents(h.context()).await.unwrap().unchanged, 2);

    h.context()
        .deltas
        .update_agent_sched_info("b", "0.web.ns.c1.1", Some(Resource::new(1.0, 64.0, 64.0)))
        .unwrap();
    h.cluster.agents.lock().unwrap().truncate(1);

    let report = DataChecker::new(h.engine.clone())
        .check_once(true)
        .await
        .unwrap();
    assert_eq!(report.stale_agents, vec!["10.0.0.2".to_string()]);
    assert!(report.repaired);
    assert!(h.store.fetch_agent("10.0.0.2").unwrap().is_none());
    assert!(h.store.fetch_agent("10.0.0.1").unwrap().is_some());
    assert!(h.context().deltas.delta("b").is_zero());
}
