use std::path::Path;

use serde::Serialize;

use offergrid_offer::{AgentDeltaTracker, AgentResource};
use offergrid_state::{Agent, AgentInfo, Resource};

use super::open_store;

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn apps(data: &Path, namespace: Option<&str>, json: bool) -> anyhow::Result<()> {
    let store = open_store(data)?;
    let apps = match namespace {
        Some(ns) => store.list_applications(ns)?,
        None => store.list_all_applications()?,
    };
    if json {
        return print_json(&apps);
    }
    println!(
        "{:<16} {:<24} {:<8} {:<14} {:>9} {:<20}",
        "NAMESPACE", "APP", "KIND", "STATUS", "RUNNING", "VERSION"
    );
    for app in &apps {
        let status = match app.sub_status {
            Some(op) => format!("{:?}/{op:?}", app.status),
            None => format!("{:?}", app.status),
        };
        println!(
            "{:<16} {:<24} {:<8} {:<14} {:>4}/{:<4} {:<20}",
            app.run_as,
            app.id,
            format!("{:?}", app.kind),
            status,
            app.running_instances,
            app.define_instances,
            app.current_version
        );
    }
    Ok(())
}

pub fn taskgroups(data: &Path, namespace: &str, app: &str, json: bool) -> anyhow::Result<()> {
    let store = open_store(data)?;
    let groups = store.list_taskgroups(namespace, app)?;
    if json {
        return print_json(&groups);
    }
    for tg in &groups {
        println!(
            "{}  {:?}  host={}  version={}  resched={}",
            tg.id,
            tg.status,
            tg.hostname.as_deref().unwrap_or("-"),
            tg.version,
            tg.resched_times
        );
        for task in &tg.tasks {
            println!(
                "    {}  {:?}  ip={}  healthy={}",
                task.name,
                task.status,
                task.runtime_ip.as_deref().unwrap_or("-"),
                task.healthy
            );
        }
    }
    if groups.is_empty() {
        println!("no taskgroups for {namespace}/{app}");
    }
    Ok(())
}

pub fn transactions(
    data: &Path,
    namespace: Option<&str>,
    all: bool,
    json: bool,
) -> anyhow::Result<()> {
    let store = open_store(data)?;
    let mut txns = match namespace {
        Some(ns) => store.list_transactions(ns)?,
        None => store.list_all_transactions()?,
    };
    if !all {
        txns.retain(|t| !t.is_terminal());
    }
    txns.sort_by_key(|t| t.create_time);
    if json {
        return print_json(&txns);
    }
    for t in &txns {
        println!(
            "{}  {}/{}  {:?}  {:?}  attempts={}  {}",
            t.transaction_id,
            t.namespace,
            t.object_name,
            t.op_type(),
            t.status,
            t.attempts,
            t.message
        );
    }
    Ok(())
}

#[derive(Serialize)]
struct AgentRow {
    agent: Agent,
    resource: AgentResource,
}

#[derive(Serialize)]
struct AgentsView {
    total: Resource,
    used: Resource,
    agents: Vec<AgentRow>,
}

/// Stored agents with outstanding reservations folded into `used`.
pub fn agents(data: &Path, json: bool) -> anyhow::Result<()> {
    let store = open_store(data)?;
    let deltas = AgentDeltaTracker::load(store.clone())?;
    let agents = store.list_agents()?;
    let infos: Vec<AgentInfo> = agents.iter().map(|a| a.agent_info.clone()).collect();
    let summary = deltas.cluster_resource(&infos);
    let view = AgentsView {
        total: summary.total,
        used: summary.used,
        agents: agents
            .into_iter()
            .zip(summary.agents)
            .map(|(agent, resource)| AgentRow { agent, resource })
            .collect(),
    };
    if json {
        return print_json(&view);
    }
    for row in &view.agents {
        let r = &row.resource;
        println!(
            "{:<15} {:<24} cpus={:.1}/{:.1} mem={:.0}/{:.0} reserved(cpus={:.1} mem={:.0}){}",
            row.agent.key,
            r.hostname,
            r.used.cpus,
            r.total.cpus,
            r.used.mem,
            r.total.mem,
            r.delta.cpus,
            r.delta.mem,
            if row.agent.disabled { " disabled" } else { "" }
        );
    }
    println!(
        "cluster: {} agents, cpus={:.1}/{:.1} mem={:.0}/{:.0}",
        view.agents.len(),
        view.used.cpus,
        view.total.cpus,
        view.used.mem,
        view.total.mem
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use offergrid_state::{AgentSchedInfo, StateStore};

    #[test]
    fn agents_fold_reservations_into_used() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.redb");
        {
            let store = StateStore::open(&path).unwrap();
            store
                .save_agent(&Agent {
                    key: "10.0.0.1".into(),
                    agent_info: AgentInfo {
                        agent_id: "agent-a".into(),
                        hostname: "a".into(),
                        ip: "10.0.0.1".into(),
                        total: Resource::new(4.0, 1024.0, 1024.0),
                        used: Resource::new(1.0, 128.0, 0.0),
                        attributes: Default::default(),
                    },
                    last_sync_time: 0,
                    disabled: false,
                })
                .unwrap();
            let mut info = AgentSchedInfo::new("a");
            info.taskgroups
                .insert("0.web.ns.c1.1".into(), Resource::new(1.0, 64.0, 64.0));
            info.recompute();
            store.save_agent_sched_info(&info).unwrap();
        }

        agents(&path, true).unwrap();
        let store = StateStore::open(&path).unwrap();
        let deltas = AgentDeltaTracker::load(store.clone()).unwrap();
        let infos: Vec<AgentInfo> = store
            .list_agents()
            .unwrap()
            .into_iter()
            .map(|a| a.agent_info)
            .collect();
        let summary = deltas.cluster_resource(&infos);
        assert_eq!(summary.used, Resource::new(2.0, 192.0, 64.0));
        assert_eq!(summary.agents[0].delta, Resource::new(1.0, 64.0, 64.0));
    }
}
