//! The bootstrap pipeline
//!
//! [`Bootstrapper::bootstrap`] runs every [`Step`] in [`Step::ALL`] order
//! against a single [`Environment`]. Steps are idempotent: each one looks at
//! the current state of the cloud and the machines before changing anything,
//! so an interrupted run is resumed simply by running again. The first error
//! stops the pipeline; the environment built so far stays available through
//! [`Bootstrapper::environment`].

mod dns;
mod iam;
mod install_files;
mod k0s;
mod network;
mod nodes;
mod project;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use crate::cloud::ProvisioningClient;
use crate::config::{BootstrapConfig, RegistryType};
use crate::fleet::{VmSpec, default_fleet};
use crate::installconfig::{InstallConfig, Vault};
use crate::logger::{StepLogger, StepOutcome};
use crate::node::Node;
use crate::remote::RemoteExecutor;
use crate::retry::RetryPolicy;

pub use dns::{desired_records, ensure_dns_record_sets};
pub use iam::{
    CLOUD_CONTROLLER_ACCOUNT, REGISTRY_WRITER_ACCOUNT, TOKEN_CREATOR_ROLE, add_role_binding,
    grant_impersonation, remove_role_binding, revoke_impersonation,
};
pub use k0s::render_configure_k0s;
pub use project::{REQUIRED_APIS, generate_project_id, sanitize_project_name};

/// Where the install documents live on the jumpbox.
pub const REMOTE_CONFIG_DIR: &str = "/etc/codesphere";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryCredentials {
    pub server: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// State accumulated by one run.
#[derive(Debug, Clone)]
pub struct Environment {
    pub config: BootstrapConfig,

    pub project_id: String,
    pub project_name: String,
    pub folder_id: String,
    pub dns_project_id: String,

    pub jumpbox: Option<Arc<Node>>,
    pub postgres: Option<Arc<Node>>,
    pub storage: Vec<Arc<Node>>,
    pub control_plane: Vec<Arc<Node>>,

    pub gateway_ip: Option<String>,
    pub public_gateway_ip: Option<String>,

    pub install_config: InstallConfig,
    pub vault: Vault,
    pub registry: Option<RegistryCredentials>,

    pub cloud_controller_email: Option<String>,
    pub registry_writer_email: Option<String>,
}

impl Environment {
    pub fn new(config: BootstrapConfig) -> Self {
        Self {
            project_name: config.project_name.clone(),
            folder_id: config.folder_id.clone(),
            project_id: String::new(),
            dns_project_id: String::new(),
            jumpbox: None,
            postgres: None,
            storage: Vec::new(),
            control_plane: Vec::new(),
            gateway_ip: None,
            public_gateway_ip: None,
            install_config: InstallConfig::default(),
            vault: Vault::default(),
            registry: None,
            cloud_controller_email: None,
            registry_writer_email: None,
            config,
        }
    }

    /// Every provisioned node, jumpbox first.
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.jumpbox
            .iter()
            .chain(self.postgres.iter())
            .chain(self.storage.iter())
            .chain(self.control_plane.iter())
            .cloned()
            .collect()
    }

    pub(crate) fn require_project(&self) -> anyhow::Result<&str> {
        if self.project_id.is_empty() {
            anyhow::bail!("project has not been resolved yet");
        }
        Ok(&self.project_id)
    }

    pub(crate) fn require_jumpbox(&self) -> anyhow::Result<&Arc<Node>> {
        self.jumpbox
            .as_ref()
            .context("jumpbox has not been provisioned yet")
    }
}

/// Pipeline steps in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    LoadInstallConfig,
    LoadSecrets,
    EnsureProject,
    EnsureBilling,
    EnableApis,
    EnsureArtifactRegistry,
    EnsureServiceAccounts,
    EnsureIamRoles,
    EnsureVpc,
    EnsureFirewallRules,
    EnsureComputeInstances,
    EnsureGatewayIps,
    EnsureRootLogin,
    ConfigureJumpbox,
    TuneKernel,
    FinalizeRegistry,
    WriteConfig,
    EnsureDnsRecords,
    InstallPackage,
    ConfigureCloudProvider,
}

impl Step {
    pub const ALL: [Step; 20] = [
        Step::LoadInstallConfig,
        Step::LoadSecrets,
        Step::EnsureProject,
        Step::EnsureBilling,
        Step::EnableApis,
        Step::EnsureArtifactRegistry,
        Step::EnsureServiceAccounts,
        Step::EnsureIamRoles,
        Step::EnsureVpc,
        Step::EnsureFirewallRules,
        Step::EnsureComputeInstances,
        Step::EnsureGatewayIps,
        Step::EnsureRootLogin,
        Step::ConfigureJumpbox,
        Step::TuneKernel,
        Step::FinalizeRegistry,
        Step::WriteConfig,
        Step::EnsureDnsRecords,
        Step::InstallPackage,
        Step::ConfigureCloudProvider,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Step::LoadInstallConfig => "load install config",
            Step::LoadSecrets => "load secrets",
            Step::EnsureProject => "ensure project",
            Step::EnsureBilling => "ensure billing",
            Step::EnableApis => "enable APIs",
            Step::EnsureArtifactRegistry => "ensure artifact registry",
            Step::EnsureServiceAccounts => "ensure service accounts",
            Step::EnsureIamRoles => "ensure IAM roles",
            Step::EnsureVpc => "ensure VPC",
            Step::EnsureFirewallRules => "ensure firewall rules",
            Step::EnsureComputeInstances => "ensure compute instances",
            Step::EnsureGatewayIps => "ensure gateway IPs",
            Step::EnsureRootLogin => "ensure root login",
            Step::ConfigureJumpbox => "configure jumpbox",
            Step::TuneKernel => "tune kernel",
            Step::FinalizeRegistry => "finalize registry",
            Step::WriteConfig => "write config",
            Step::EnsureDnsRecords => "ensure DNS records",
            Step::InstallPackage => "install package",
            Step::ConfigureCloudProvider => "configure cloud provider",
        }
    }

    /// Whether this run needs the step at all.
    pub fn should_run(self, config: &BootstrapConfig) -> bool {
        match self {
            Step::EnsureArtifactRegistry => config.registry_type == RegistryType::ArtifactRegistry,
            Step::WriteConfig => config.write_config,
            Step::InstallPackage => config
                .install_version
                .as_deref()
                .is_some_and(|v| !v.is_empty()),
            _ => true,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Knobs that are not part of the persisted configuration.
#[derive(Debug, Clone)]
pub struct BootstrapOptions {
    pub fleet: Vec<VmSpec>,
    /// Per-node budget for SSH to come up after boot
    pub ssh_ready_timeout: Duration,
    pub ssh_ready_poll: Duration,
    pub cloud_retry: RetryPolicy,
    pub root_login_retry: RetryPolicy,
    /// Binary installed as `oms-cli` on the jumpbox; defaults to the running
    /// executable
    pub oms_cli_binary: Option<PathBuf>,
    pub portal_api_key: Option<String>,
    /// Local directory for generated scripts
    pub work_dir: PathBuf,
}

impl Default for BootstrapOptions {
    fn default() -> Self {
        Self {
            fleet: default_fleet(),
            ssh_ready_timeout: Duration::from_secs(600),
            ssh_ready_poll: Duration::from_secs(5),
            cloud_retry: RetryPolicy::CLOUD,
            root_login_retry: RetryPolicy::SSHD_RESTART,
            oms_cli_binary: None,
            portal_api_key: None,
            work_dir: std::env::temp_dir(),
        }
    }
}

pub struct Bootstrapper {
    env: Environment,
    client: Arc<dyn ProvisioningClient>,
    executor: Arc<dyn RemoteExecutor>,
    logger: Arc<dyn StepLogger>,
    options: BootstrapOptions,
}

impl Bootstrapper {
    pub fn new(
        config: BootstrapConfig,
        client: Arc<dyn ProvisioningClient>,
        executor: Arc<dyn RemoteExecutor>,
        logger: Arc<dyn StepLogger>,
    ) -> Self {
        Self {
            env: Environment::new(config),
            client,
            executor,
            logger,
            options: BootstrapOptions::default(),
        }
    }

    pub fn with_options(mut self, options: BootstrapOptions) -> Self {
        self.options = options;
        self
    }

    pub fn environment(&self) -> &Environment {
        &self.env
    }

    pub fn into_environment(self) -> Environment {
        self.env
    }

    /// Run every step in order, stopping at the first failure.
    pub async fn bootstrap(&mut self) -> anyhow::Result<()> {
        for step in Step::ALL {
            self.run_step(step).await?;
        }
        self.logger.log("bootstrap complete");
        Ok(())
    }

    async fn run_step(&mut self, step: Step) -> anyhow::Result<()> {
        let name = step.name();
        if !step.should_run(&self.env.config) {
            self.logger.step_finished(name, StepOutcome::Skipped);
            return Ok(());
        }

        self.logger.step_started(name);
        let result = match step {
            Step::LoadInstallConfig => self.load_install_config(),
            Step::LoadSecrets => self.load_secrets(),
            Step::EnsureProject => self.ensure_project().await,
            Step::EnsureBilling => self.ensure_billing().await,
            Step::EnableApis => self.enable_apis().await,
            Step::EnsureArtifactRegistry => self.ensure_artifact_registry().await,
            Step::EnsureServiceAccounts => self.ensure_service_accounts().await,
            Step::EnsureIamRoles => self.ensure_iam_roles().await,
            Step::EnsureVpc => self.ensure_vpc().await,
            Step::EnsureFirewallRules => self.ensure_firewall_rules().await,
            Step::EnsureComputeInstances => self.ensure_compute_instances().await,
            Step::EnsureGatewayIps => self.ensure_gateway_ips().await,
            Step::EnsureRootLogin => self.ensure_root_login().await,
            Step::ConfigureJumpbox => self.configure_jumpbox().await,
            Step::TuneKernel => self.tune_kernel().await,
            Step::FinalizeRegistry => self.finalize_registry().await,
            Step::WriteConfig => self.write_config().await,
            Step::EnsureDnsRecords => self.ensure_dns_records().await,
            Step::InstallPackage => self.install_package().await,
            Step::ConfigureCloudProvider => self.configure_cloud_provider().await,
        };

        match result {
            Ok(()) => {
                self.logger.step_finished(name, StepOutcome::Done);
                Ok(())
            }
            Err(err) => {
                self.logger.step_finished(name, StepOutcome::Failed);
                Err(err.context(format!("step '{name}' failed")))
            }
        }
    }
}
