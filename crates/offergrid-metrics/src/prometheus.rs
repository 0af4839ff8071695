//! Prometheus text exposition format.
//!
//! Renders a metrics snapshot into the Prometheus text exposition format
//! for scraping by a Prometheus server or compatible agent.

use crate::collector::{MetricsSnapshot, SeriesKey};

fn counter_family(out: &mut String, name: &str, help: &str, label: &str, series: &[(SeriesKey, u64)]) {
    out.push_str(&format!("# HELP {name} {help}\n"));
    out.push_str(&format!("# TYPE {name} counter\n"));
    for (k, v) in series {
        out.push_str(&format!(
            "{name}{{namespace=\"{}\",application=\"{}\",{label}=\"{}\"}} {v}\n",
            k.namespace, k.app, k.label
        ));
    }
}

/// Render a snapshot into Prometheus text format.
///
/// Counters carry `namespace` and `application` labels; the offer gauge
/// is unlabeled.
pub fn render_prometheus(snapshot: &MetricsSnapshot) -> String {
    let mut out = String::new();

    counter_family(
        &mut out,
        "offergrid_operations_total",
        "Scheduler operations by type and outcome.",
        "operation",
        &snapshot.operations,
    );
    counter_family(
        &mut out,
        "offergrid_taskgroup_status_total",
        "Taskgroup status transitions.",
        "status",
        &snapshot.taskgroup_status,
    );
    counter_family(
        &mut out,
        "offergrid_reschedules_total",
        "Failure-driven taskgroup reschedules.",
        "reason",
        &snapshot.reschedules,
    );

    out.push_str("# HELP offergrid_offers_held Offers currently held in the pool.\n");
    out.push_str("# TYPE offergrid_offers_held gauge\n");
    out.push_str(&format!("offergrid_offers_held {}\n", snapshot.offers_held));

    out.push_str("# HELP offergrid_app_instances Taskgroups persisted per application.\n");
    out.push_str("# TYPE offergrid_app_instances gauge\n");
    for a in &snapshot.apps {
        out.push_str(&format!(
            "offergrid_app_instances{{namespace=\"{}\",application=\"{}\"}} {}\n",
            a.namespace, a.app, a.instances
        ));
    }

    out.push_str("# HELP offergrid_app_running_instances Running taskgroups per application.\n");
    out.push_str("# TYPE offergrid_app_running_instances gauge\n");
    for a in &snapshot.apps {
        out.push_str(&format!(
            "offergrid_app_running_instances{{namespace=\"{}\",application=\"{}\"}} {}\n",
            a.namespace, a.app, a.running_instances
        ));
    }

    out
}
