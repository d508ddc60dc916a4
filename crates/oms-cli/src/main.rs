//! OMS - Codesphere cluster bootstrap
//!
//! Usage:
//!   oms bootstrap-gcp --project-name demo --folder-id 123 ...
//!   oms config show

mod console_logger;
mod prompt;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use console::style;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use oms_core::bootstrap::{BootstrapOptions, Bootstrapper, Environment};
use oms_core::cloud::gcp::GcpClient;
use oms_core::config::{BootstrapConfig, ConfigOverride, ConfigStore, RegistryType};
use oms_core::remote::{CredentialResolver, KnownHosts, PORTAL_API_KEY_ENV, SshExecutor};

use crate::console_logger::ConsoleStepLogger;
use crate::prompt::TerminalPassphrase;

#[derive(Parser)]
#[command(name = "oms")]
#[command(about = "Codesphere cluster bootstrap", long_about = None)]
struct Cli {
    /// Config file to use instead of ~/.config/oms/bootstrap-gcp.toml
    #[arg(long, global = true)]
    config_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision and configure a cluster on Google Cloud
    BootstrapGcp(Box<BootstrapGcpArgs>),

    /// Inspect the stored configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the stored configuration
    Show,
    /// Print the config file location
    Path,
}

#[derive(Args)]
struct BootstrapGcpArgs {
    /// Display name of the project to find or create
    #[arg(long)]
    project_name: Option<String>,

    /// Folder the project lives in
    #[arg(long)]
    folder_id: Option<String>,

    /// Billing account to link
    #[arg(long)]
    billing_account: Option<String>,

    #[arg(long)]
    region: Option<String>,

    #[arg(long)]
    zone: Option<String>,

    /// Domain the cluster is served under
    #[arg(long)]
    base_domain: Option<String>,

    /// Cloud DNS managed zone for the base domain
    #[arg(long)]
    dns_zone_name: Option<String>,

    /// Project owning the DNS zone (defaults to the cluster project)
    #[arg(long)]
    dns_project_id: Option<String>,

    #[arg(long)]
    ssh_public_key_path: Option<PathBuf>,

    #[arg(long)]
    ssh_private_key_path: Option<PathBuf>,

    #[arg(long)]
    known_hosts_path: Option<PathBuf>,

    /// Install config document
    #[arg(long)]
    install_config: Option<PathBuf>,

    /// Secrets vault document
    #[arg(long)]
    secrets_file: Option<PathBuf>,

    /// Where to record the provisioned fleet
    #[arg(long)]
    topology_path: Option<PathBuf>,

    /// Write the install documents and ship them to the jumpbox
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    write_config: Option<bool>,

    /// Use preemptible VMs
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    preemptible: Option<bool>,

    /// local-container, artifact-registry or github
    #[arg(long)]
    registry_type: Option<RegistryType>,

    #[arg(long)]
    artifact_repository: Option<String>,

    #[arg(long)]
    github_user: Option<String>,

    /// GitHub personal access token for ghcr.io
    #[arg(long, env = "GITHUB_PAT", hide_env_values = true)]
    github_pat: Option<String>,

    /// Codesphere package version to install after bootstrapping
    #[arg(long)]
    install_version: Option<String>,

    #[arg(long)]
    install_hash: Option<String>,

    /// Portal API key forwarded to oms-cli on the jumpbox
    #[arg(long, env = PORTAL_API_KEY_ENV, hide_env_values = true)]
    portal_api_key: Option<String>,

    /// Seconds to wait for SSH on each node after boot
    #[arg(long, default_value_t = 600)]
    ssh_timeout: u64,

    /// Persist the merged configuration before running
    #[arg(long)]
    save_config: bool,
}

impl BootstrapGcpArgs {
    fn overrides(&self) -> ConfigOverride {
        ConfigOverride {
            project_name: self.project_name.clone(),
            folder_id: self.folder_id.clone(),
            billing_account: self.billing_account.clone(),
            region: self.region.clone(),
            zone: self.zone.clone(),
            base_domain: self.base_domain.clone(),
            dns_zone_name: self.dns_zone_name.clone(),
            dns_project_id: self.dns_project_id.clone(),
            ssh_public_key_path: self.ssh_public_key_path.clone(),
            ssh_private_key_path: self.ssh_private_key_path.clone(),
            known_hosts_path: self.known_hosts_path.clone(),
            install_config_path: self.install_config.clone(),
            secrets_file_path: self.secrets_file.clone(),
            topology_path: self.topology_path.clone(),
            write_config: self.write_config,
            preemptible: self.preemptible,
            registry_type: self.registry_type,
            artifact_repository: self.artifact_repository.clone(),
            github_user: self.github_user.clone(),
            github_pat: self.github_pat.clone(),
            install_version: self.install_version.clone(),
            install_hash: self.install_hash.clone(),
        }
    }
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "oms=info,oms_core=info,warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let store = match &cli.config_file {
        Some(path) => ConfigStore::from_path(path.clone()),
        None => ConfigStore::from_default_location()?,
    };

    match cli.command {
        Commands::BootstrapGcp(args) => run_bootstrap(&store, *args),
        Commands::Config { action } => run_config(&store, action),
    }
}

fn run_config(store: &ConfigStore, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = store.load()?;
            let rendered = toml::to_string_pretty(&config).context("Failed to render config")?;
            println!("{rendered}");
        }
        ConfigAction::Path => println!("{}", store.config_path().display()),
    }
    Ok(())
}

fn run_bootstrap(store: &ConfigStore, args: BootstrapGcpArgs) -> Result<()> {
    let mut config = store.load()?;
    config.merge(args.overrides());
    config.validate()?;
    if args.save_config {
        store.save(&config)?;
        println!("Saved configuration to {}", store.config_path().display());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    runtime.block_on(bootstrap(config, args.portal_api_key, args.ssh_timeout))
}

async fn bootstrap(
    config: BootstrapConfig,
    portal_api_key: Option<String>,
    ssh_timeout: u64,
) -> Result<()> {
    let client = Arc::new(GcpClient::from_env()?);

    let credentials = Arc::new(CredentialResolver::from_env(
        Some(config.ssh_private_key_path()?),
        Arc::new(TerminalPassphrase),
    ));
    let known_hosts = Arc::new(KnownHosts::open(config.known_hosts_path()?)?);
    let executor = Arc::new(SshExecutor::new(credentials, known_hosts));
    let logger = Arc::new(ConsoleStepLogger::stderr());

    let options = BootstrapOptions {
        ssh_ready_timeout: Duration::from_secs(ssh_timeout),
        portal_api_key,
        ..BootstrapOptions::default()
    };
    let mut bootstrapper =
        Bootstrapper::new(config, client, executor, logger).with_options(options);

    let result = tokio::select! {
        result = bootstrapper.bootstrap() => result,
        _ = tokio::signal::ctrl_c() => Err(anyhow::anyhow!("interrupted")),
    };

    print_summary(bootstrapper.environment());
    result
}

fn print_summary(env: &Environment) {
    if env.project_id.is_empty() {
        return;
    }
    eprintln!();
    eprintln!("{}", style("Cluster").bold());
    eprintln!("  Project:  {}", style(&env.project_id).green());
    if let Some(jumpbox) = &env.jumpbox {
        eprintln!(
            "  Jumpbox:  {}",
            style(jumpbox.external_ip().unwrap_or("-")).green()
        );
    }
    if let Some(postgres) = &env.postgres {
        eprintln!("  Postgres: {}", style(postgres.internal_ip()).green());
    }
    if let Some(ip) = &env.gateway_ip {
        eprintln!("  Gateway:  {}", style(ip).green());
    }
    if let Some(ip) = &env.public_gateway_ip {
        eprintln!("  Public:   {}", style(ip).green());
    }
    if let Some(registry) = &env.registry {
        eprintln!("  Registry: {}", style(&registry.server).green());
    }
}
