use std::path::Path;

use tracing::info;

use offergrid_metrics::{MetricsCollector, render_prometheus};
use offergrid_offer::AgentDeltaTracker;
use offergrid_scheduler::SchedulerConfig;
use offergrid_scheduler::checker::{inspect, repair_store};
use offergrid_state::now_secs;

use super::open_store;

pub fn check(data: &Path, recover: bool, json: bool) -> anyhow::Result<()> {
    let store = open_store(data)?;
    let mut report = inspect(&store, None, now_secs())?;
    if recover && !report.is_clean() {
        let deltas = AgentDeltaTracker::load(store.clone())?;
        repair_store(&store, &deltas, &report)?;
        report.repaired = true;
        info!("store repaired");
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    if report.is_clean() {
        println!("✓ no inconsistencies found");
        return Ok(());
    }
    for id in &report.orphan_taskgroups {
        println!("orphan taskgroup      {id}");
    }
    for key in &report.expired_transactions {
        println!("expired transaction   {key}");
    }
    for key in &report.stuck_deployments {
        println!("stuck rolling update  {key}");
    }
    if report.repaired {
        println!("✓ repaired");
    } else {
        println!("run with --recover to repair");
    }
    Ok(())
}

pub fn metrics(data: &Path) -> anyhow::Result<()> {
    let store = open_store(data)?;
    let collector = MetricsCollector::new(store);
    collector.refresh_app_gauges()?;
    print!("{}", render_prometheus(&collector.snapshot()));
    Ok(())
}

pub fn config(file: &Path, json: bool) -> anyhow::Result<()> {
    let config = SchedulerConfig::from_file(file)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&config)?);
    } else {
        println!("{}", toml::to_string_pretty(&config)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use offergrid_state::{ObjectKind, Operation, StateStore, Transaction};

    #[test]
    fn recover_times_out_expired_transactions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.redb");
        let key = {
            let store = StateStore::open(&path).unwrap();
            let mut txn = Transaction::new(
                "ns",
                "web",
                ObjectKind::Application,
                Operation::Delete { enforce: true },
                3,
                60,
            );
            txn.create_time = 0;
            store.save_transaction(&txn).unwrap();
            txn.transaction_id
        };

        check(&path, false, true).unwrap();
        {
            let store = StateStore::open(&path).unwrap();
            assert!(!store.fetch_transaction("ns", &key).unwrap().unwrap().is_terminal());
        }

        check(&path, true, true).unwrap();
        let store = StateStore::open(&path).unwrap();
        let report = inspect(&store, None, now_secs()).unwrap();
        assert!(report.is_clean());
        assert!(store.fetch_transaction("ns", &key).unwrap().unwrap().is_terminal());
    }

    #[test]
    fn config_file_is_validated() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.toml");
        std::fs::write(&good, "workers = 2\n[checker]\ndo_recover = true\n").unwrap();
        config(&good, false).unwrap();

        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "workers = \"many\"\n").unwrap();
        assert!(config(&bad, false).is_err());
    }
}
