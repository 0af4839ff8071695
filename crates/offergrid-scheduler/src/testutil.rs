use offergrid_state::{ContainerSpec, Resource, RestartPolicy, Version, Workload};

pub(crate) fn version(ns: &str, app: &str, instances: u32) -> Version {
    Version {
        id: app.into(),
        name: "00000000000000000001".into(),
        run_as: ns.into(),
        instances,
        workload: Workload::App {
            containers: vec![ContainerSpec {
                name: "main".into(),
                image: format!("registry/{app}:1"),
                resources: Resource::new(1.0, 64.0, 64.0),
                limit_resources: None,
                network_mode: "bridge".into(),
                env: Default::default(),
            }],
        },
        constraints: None,
        kill_policy: None,
        restart_policy: RestartPolicy::default(),
        health_check: None,
        labels: Default::default(),
    }
}
