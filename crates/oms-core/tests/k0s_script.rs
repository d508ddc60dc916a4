mod support;

use std::sync::Arc;

use oms_core::bootstrap::render_configure_k0s;
use oms_core::node::Node;
use oms_core::remote::RemoteExecutor;

use support::RecordingExecutor;

fn control_plane() -> Vec<Arc<Node>> {
    let executor: Arc<dyn RemoteExecutor> = Arc::new(RecordingExecutor::new());
    let jumpbox = Arc::new(Node::new(
        "jumpbox",
        Some("34.90.0.2".to_string()),
        "10.10.0.2",
        executor.clone(),
    ));
    ["k0s-1", "k0s-2"]
        .iter()
        .enumerate()
        .map(|(i, name)| {
            Arc::new(
                Node::behind_jumpbox(
                    *name,
                    None,
                    format!("10.10.0.{}", i + 7),
                    &jumpbox,
                    executor.clone(),
                )
                .unwrap(),
            )
        })
        .collect()
}

#[test]
fn script_wires_every_control_plane_node() {
    let script = render_configure_k0s(
        "demo-abc123",
        "europe-west4-a",
        "35.200.0.10",
        "35.200.0.11",
        &control_plane(),
    )
    .unwrap();

    assert!(script.starts_with("#!/usr/bin/env bash"));
    assert!(script.contains("project-id = demo-abc123"));
    assert!(script.contains("network-name = codesphere-vpc"));
    assert!(script.contains("node-tags = k0s"));
    assert!(script.contains("gce://demo-abc123/europe-west4-a/k0s-1"));
    assert!(script.contains("gce://demo-abc123/europe-west4-a/k0s-2"));
    assert!(script.contains("node.codesphere.com/internal-ip=10.10.0.8"));
    assert!(script.contains("patch_gateway codesphere gateway 35.200.0.10"));
    assert!(script.contains("patch_gateway codesphere public-gateway 35.200.0.11"));
    assert!(script.contains("cloud provider configured for 2 control plane nodes"));
}

#[test]
fn script_is_a_no_op_without_k0s() {
    let script =
        render_configure_k0s("demo-abc123", "europe-west4-a", "35.200.0.10", "35.200.0.11", &[])
            .unwrap();

    let guard = script.find("command -v k0s").unwrap();
    let first_kubectl = script.find("$KUBECTL").unwrap();
    assert!(guard < first_kubectl);
    assert!(script.contains("exit 0"));
    assert!(!script.contains("providerID"));
}
