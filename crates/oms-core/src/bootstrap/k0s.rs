//! Cloud provider wiring for the k0s control plane.

use std::sync::Arc;

use anyhow::Context as _;
use serde::Serialize;
use tera::{Context, Tera};
use tracing::debug;

use super::Bootstrapper;
use super::network::{NETWORK, SUBNETWORK};
use crate::fleet::NodeRole;
use crate::node::{Node, ROOT_USER};

const TEMPLATE_NAME: &str = "configure-k0s.sh";
const TEMPLATE: &str = include_str!("configure-k0s.sh.tmpl");
const REMOTE_SCRIPT_PATH: &str = "/root/configure-k0s.sh";

#[derive(Serialize)]
struct ScriptNode<'a> {
    name: &'a str,
    ip: &'a str,
}

/// Render `configure-k0s.sh` for the given control plane and gateways.
pub fn render_configure_k0s(
    project_id: &str,
    zone: &str,
    gateway_ip: &str,
    public_gateway_ip: &str,
    control_plane: &[Arc<Node>],
) -> anyhow::Result<String> {
    let mut tera = Tera::default();
    tera.add_raw_template(TEMPLATE_NAME, TEMPLATE)
        .context("Failed to parse configure-k0s template")?;

    let nodes: Vec<ScriptNode<'_>> = control_plane
        .iter()
        .map(|node| ScriptNode {
            name: node.name(),
            ip: node.internal_ip(),
        })
        .collect();

    let mut context = Context::new();
    context.insert("project_id", project_id);
    context.insert("zone", zone);
    context.insert("network", NETWORK);
    context.insert("subnetwork", SUBNETWORK);
    context.insert("node_tag", NodeRole::ControlPlane.tag());
    context.insert("gateway_ip", gateway_ip);
    context.insert("public_gateway_ip", public_gateway_ip);
    context.insert("control_plane", &nodes);

    tera.render(TEMPLATE_NAME, &context)
        .context("Failed to render configure-k0s.sh")
}

impl Bootstrapper {
    pub(super) async fn configure_cloud_provider(&mut self) -> anyhow::Result<()> {
        let project_id = self.env.require_project()?.to_string();
        let first = self
            .env
            .control_plane
            .first()
            .cloned()
            .context("no control plane nodes provisioned")?;
        let gateway_ip = self
            .env
            .gateway_ip
            .as_deref()
            .context("gateway IP has not been reserved")?;
        let public_gateway_ip = self
            .env
            .public_gateway_ip
            .as_deref()
            .context("public gateway IP has not been reserved")?;

        let script = render_configure_k0s(
            &project_id,
            self.env.config.zone(),
            gateway_ip,
            public_gateway_ip,
            &self.env.control_plane,
        )?;

        std::fs::create_dir_all(&self.options.work_dir).with_context(|| {
            format!("Failed to create directory: {}", self.options.work_dir.display())
        })?;
        let local_path = self.options.work_dir.join(TEMPLATE_NAME);
        std::fs::write(&local_path, script)
            .with_context(|| format!("Failed to write {}", local_path.display()))?;
        debug!(path = %local_path.display(), "rendered configure-k0s.sh");

        self.logger
            .substep(&format!("running {TEMPLATE_NAME} on {}", first.name()));
        first
            .copy_file(ROOT_USER, &local_path, REMOTE_SCRIPT_PATH)
            .await?;
        first
            .run(ROOT_USER, &format!("bash {REMOTE_SCRIPT_PATH}"))
            .await
    }
}
