mod support;

use std::sync::Arc;
use std::time::Duration;

use oms_core::fleet::{
    FleetError, FleetProvisioner, FleetSettings, FleetTopology, NodeRole, ProvisionedVm, VmSpec,
    assemble_fleet, default_fleet, validate_specs,
};
use oms_core::node::Node;
use oms_core::remote::{RemoteExecutor, SshError};
use tempfile::TempDir;

use support::{FakeCloud, RecordingExecutor, TEST_PUBLIC_KEY};

fn settings() -> FleetSettings {
    FleetSettings {
        project_id: "demo-abc123".to_string(),
        region: "europe-west4".to_string(),
        zone: "europe-west4-a".to_string(),
        network: "codesphere-vpc".to_string(),
        subnetwork: "codesphere-subnet".to_string(),
        preemptible: true,
        ssh_public_key: format!("{TEST_PUBLIC_KEY}\n"),
    }
}

fn vm(role: NodeRole, name: &str, external_ip: Option<&str>, internal_ip: &str) -> ProvisionedVm {
    ProvisionedVm {
        role,
        name: name.to_string(),
        external_ip: external_ip.map(str::to_string),
        internal_ip: internal_ip.to_string(),
    }
}

#[tokio::test]
async fn fleet_is_sorted_regardless_of_completion_order() {
    let cloud = Arc::new(FakeCloud::new());
    cloud.state().instance_latency_ms = 30;
    let executor = Arc::new(RecordingExecutor::new());
    let provisioner = FleetProvisioner::new(cloud.clone(), executor, settings());

    let fleet = provisioner.provision_fleet(&default_fleet()).await.unwrap();

    assert_eq!(fleet.jumpbox.name(), "jumpbox");
    assert!(fleet.jumpbox.external_ip().is_some());
    assert_eq!(fleet.postgres.name(), "postgres");
    let storage: Vec<&str> = fleet.storage.iter().map(|n| n.name()).collect();
    assert_eq!(storage, vec!["ceph-1", "ceph-2", "ceph-3", "ceph-4"]);
    let control_plane: Vec<&str> = fleet.control_plane.iter().map(|n| n.name()).collect();
    assert_eq!(control_plane, vec!["k0s-1", "k0s-2", "k0s-3"]);

    for node in fleet.nodes().iter().skip(1) {
        let jumpbox = node.jumpbox().unwrap();
        assert_eq!(jumpbox.name(), "jumpbox");
    }
    assert_eq!(cloud.state().instances.len(), 9);
}

#[tokio::test]
async fn instance_requests_carry_keys_disks_and_tags() {
    let cloud = Arc::new(FakeCloud::new());
    let executor = Arc::new(RecordingExecutor::new());
    let provisioner = FleetProvisioner::new(cloud.clone(), executor, settings());
    provisioner.provision_fleet(&default_fleet()).await.unwrap();

    let state = cloud.state();
    let ceph = state
        .instance_requests
        .iter()
        .find(|r| r.name == "ceph-2")
        .unwrap();
    assert_eq!(ceph.tags, vec!["ceph".to_string()]);
    assert_eq!(ceph.additional_disk_sizes_gb, vec![20, 200]);
    assert!(!ceph.external_ip);
    assert!(ceph.preemptible);
    assert_eq!(
        ceph.ssh_keys,
        vec![
            format!("root:{TEST_PUBLIC_KEY}"),
            format!("ubuntu:{TEST_PUBLIC_KEY}"),
        ]
    );

    let jumpbox = state
        .instance_requests
        .iter()
        .find(|r| r.name == "jumpbox")
        .unwrap();
    assert_eq!(jumpbox.tags, vec!["jumpbox".to_string(), "ssh".to_string()]);
    assert!(jumpbox.external_ip);
}

#[tokio::test]
async fn rerunning_provisioning_reuses_existing_instances() {
    let cloud = Arc::new(FakeCloud::new());
    let executor = Arc::new(RecordingExecutor::new());
    let provisioner = FleetProvisioner::new(cloud.clone(), executor, settings());

    let first = provisioner.provision_fleet(&default_fleet()).await.unwrap();
    let second = provisioner.provision_fleet(&default_fleet()).await.unwrap();

    assert_eq!(first.jumpbox.external_ip(), second.jumpbox.external_ip());
    assert_eq!(first.postgres.internal_ip(), second.postgres.internal_ip());
    let state = cloud.state();
    assert_eq!(state.instances.len(), 9);
    assert_eq!(state.duplicates_of("instance").len(), 9);
}

#[tokio::test]
async fn every_failed_vm_is_reported() {
    let cloud = Arc::new(FakeCloud::new());
    {
        let mut state = cloud.state();
        state.instance_latency_ms = 20;
        state.failing_instances.insert("k0s-2".to_string());
        state.failing_instances.insert("ceph-1".to_string());
    }
    let executor = Arc::new(RecordingExecutor::new());
    let provisioner = FleetProvisioner::new(cloud.clone(), executor, settings());

    let err = provisioner
        .provision_fleet(&default_fleet())
        .await
        .unwrap_err();
    let Some(FleetError::Aggregate(aggregate)) = err.downcast_ref::<FleetError>() else {
        panic!("expected an aggregate error, got {err:#}");
    };
    assert_eq!(aggregate.labels(), vec!["ceph-1", "k0s-2"]);
    assert!(aggregate.to_string().starts_with("2 of VM provisioning failed:"));

    // The barrier waits for everything, so the healthy VMs were still created.
    assert_eq!(cloud.state().instances.len(), 7);
}

#[test]
fn specs_without_required_roles_are_rejected() {
    let no_postgres = vec![VmSpec::new("jumpbox", "e2-medium", &["jumpbox"]).with_external_ip()];
    assert!(matches!(
        validate_specs(&no_postgres),
        Err(FleetError::MissingRole(NodeRole::Postgres))
    ));

    let two_jumpboxes = vec![
        VmSpec::new("jumpbox-a", "e2-medium", &["jumpbox"]).with_external_ip(),
        VmSpec::new("jumpbox-b", "e2-medium", &["jumpbox"]).with_external_ip(),
        VmSpec::new("postgres", "e2-standard-8", &["postgres"]),
    ];
    assert!(matches!(
        validate_specs(&two_jumpboxes),
        Err(FleetError::DuplicateRole(NodeRole::Jumpbox))
    ));

    let unknown = vec![VmSpec::new("worker", "e2-medium", &["ssh"])];
    assert!(matches!(
        validate_specs(&unknown),
        Err(FleetError::UnknownRole { .. })
    ));

    let private_jumpbox = vec![
        VmSpec::new("jumpbox", "e2-medium", &["jumpbox"]),
        VmSpec::new("postgres", "e2-standard-8", &["postgres"]),
    ];
    assert!(matches!(
        validate_specs(&private_jumpbox),
        Err(FleetError::JumpboxWithoutExternalIp(name)) if name == "jumpbox"
    ));

    assert!(validate_specs(&default_fleet()).is_ok());
}

#[test]
fn assembled_nodes_route_through_the_jumpbox() {
    let executor: Arc<dyn RemoteExecutor> = Arc::new(RecordingExecutor::new());
    let fleet = assemble_fleet(
        vec![
            vm(NodeRole::ControlPlane, "k0s-2", None, "10.10.0.8"),
            vm(NodeRole::Postgres, "postgres", Some("34.90.0.3"), "10.10.0.3"),
            vm(NodeRole::Jumpbox, "jumpbox", Some("34.90.0.2"), "10.10.0.2"),
            vm(NodeRole::ControlPlane, "k0s-1", None, "10.10.0.7"),
        ],
        executor,
    )
    .unwrap();

    assert_eq!(
        fleet.jumpbox.route().unwrap(),
        (None, "34.90.0.2".to_string())
    );
    // Even with an external address, postgres is reached over the jumpbox.
    assert_eq!(
        fleet.postgres.route().unwrap(),
        (Some("34.90.0.2".to_string()), "10.10.0.3".to_string())
    );
    assert_eq!(fleet.control_plane[0].name(), "k0s-1");
    assert_eq!(
        fleet.control_plane[0].route().unwrap(),
        (Some("34.90.0.2".to_string()), "10.10.0.7".to_string())
    );
    assert!(fleet.storage.is_empty());
}

#[test]
fn assembly_rejects_a_jumpbox_without_external_ip() {
    let executor: Arc<dyn RemoteExecutor> = Arc::new(RecordingExecutor::new());
    let err = assemble_fleet(
        vec![
            vm(NodeRole::Jumpbox, "jumpbox", None, "10.10.0.2"),
            vm(NodeRole::Postgres, "postgres", None, "10.10.0.3"),
        ],
        executor,
    )
    .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<FleetError>(),
        Some(FleetError::JumpboxWithoutExternalIp(_))
    ));
}

#[test]
fn jumpbox_chains_are_rejected() {
    let executor: Arc<dyn RemoteExecutor> = Arc::new(RecordingExecutor::new());
    let jumpbox = Arc::new(Node::new(
        "jumpbox",
        Some("34.90.0.2".to_string()),
        "10.10.0.2",
        executor.clone(),
    ));
    let hop = Arc::new(
        Node::behind_jumpbox(
            "hop",
            Some("34.90.0.9".to_string()),
            "10.10.0.9",
            &jumpbox,
            executor.clone(),
        )
        .unwrap(),
    );

    let err = Node::behind_jumpbox("inner", None, "10.10.0.10", &hop, executor.clone())
        .unwrap_err();
    assert!(err.to_string().contains("itself behind a jumpbox"));

    let private = Arc::new(Node::new("private", None, "10.10.0.11", executor.clone()));
    let err = Node::behind_jumpbox("inner", None, "10.10.0.10", &private, executor).unwrap_err();
    assert!(err.to_string().contains("no external IP"));
}

#[test]
fn dropped_jumpbox_makes_routing_fail() {
    let executor: Arc<dyn RemoteExecutor> = Arc::new(RecordingExecutor::new());
    let jumpbox = Arc::new(Node::new(
        "jumpbox",
        Some("34.90.0.2".to_string()),
        "10.10.0.2",
        executor.clone(),
    ));
    let node = Node::behind_jumpbox("postgres", None, "10.10.0.3", &jumpbox, executor).unwrap();
    drop(jumpbox);

    assert!(node.jumpbox().is_none());
    assert!(node.route().is_err());
}

#[tokio::test]
async fn node_commands_use_the_route() {
    let executor = Arc::new(RecordingExecutor::new());
    let jumpbox = Arc::new(Node::new(
        "jumpbox",
        Some("34.90.0.2".to_string()),
        "10.10.0.2",
        executor.clone(),
    ));
    let postgres =
        Node::behind_jumpbox("postgres", None, "10.10.0.3", &jumpbox, executor.clone()).unwrap();

    assert!(!postgres.has_docker().await.unwrap());
    postgres.install_docker().await.unwrap();
    assert!(postgres.has_docker().await.unwrap());

    let calls = executor.calls();
    assert_eq!(calls.len(), 3);
    for call in &calls {
        assert_eq!(call.jumpbox_ip.as_deref(), Some("34.90.0.2"));
        assert_eq!(call.target_ip, "10.10.0.3");
        assert_eq!(call.user, "root");
    }
    assert_eq!(
        executor.actions(),
        vec![("10.10.0.3".to_string(), "docker".to_string())]
    );
}

#[tokio::test]
async fn wait_ready_polls_through_refused_connections() {
    let executor = Arc::new(RecordingExecutor::new());
    executor.state().tunneled_boot_delay = true;
    let jumpbox = Arc::new(Node::new(
        "jumpbox",
        Some("34.90.0.2".to_string()),
        "10.10.0.2",
        executor.clone(),
    ));
    let ceph =
        Node::behind_jumpbox("ceph-1", None, "10.10.0.4", &jumpbox, executor.clone()).unwrap();

    ceph.wait_ready("ubuntu", Duration::from_secs(2), Duration::from_millis(1))
        .await
        .unwrap();

    assert_eq!(executor.calls().len(), 2);
}

#[tokio::test]
async fn wait_ready_stops_on_rejected_credentials() {
    let executor = Arc::new(RecordingExecutor::new());
    let jumpbox = Arc::new(Node::new(
        "jumpbox",
        Some("34.90.0.2".to_string()),
        "10.10.0.2",
        executor.clone(),
    ));

    let err = jumpbox
        .wait_ready("root", Duration::from_secs(60), Duration::from_millis(1))
        .await
        .unwrap_err();

    assert!(
        err.chain()
            .any(|cause| matches!(cause.downcast_ref::<SshError>(), Some(SshError::Authentication { .. })))
    );
    assert_eq!(executor.calls().len(), 1);
}

#[tokio::test]
async fn topology_round_trips_through_json() {
    let dir = TempDir::new().unwrap();
    let cloud = Arc::new(FakeCloud::new());
    let executor = Arc::new(RecordingExecutor::new());
    let provisioner = FleetProvisioner::new(cloud, executor, settings());
    let fleet = provisioner.provision_fleet(&default_fleet()).await.unwrap();

    let path = dir.path().join("state").join("topology.json");
    let topology = FleetTopology::from_fleet("demo-abc123", &fleet);
    topology.save(&path).unwrap();
    let loaded = FleetTopology::load(&path).unwrap();

    assert_eq!(loaded, topology);
    assert_eq!(loaded.nodes["jumpbox"].len(), 1);
    assert_eq!(loaded.nodes["ceph"].len(), 4);
    assert_eq!(loaded.nodes["k0s"][2].name, "k0s-3");
    assert_eq!(loaded.nodes["postgres"][0].internal_ip, fleet.postgres.internal_ip());
}
