//! OMS Core Library
//!
//! Bootstraps a Codesphere cluster on Google Cloud: provisions the project,
//! network and VM fleet, then configures every machine over SSH until the
//! cluster is ready for installation.

pub mod bootstrap;
pub mod cloud;
pub mod config;
pub mod fanout;
pub mod fleet;
pub mod installconfig;
pub mod logger;
pub mod node;
pub mod remote;
pub mod retry;

/// Re-exports of commonly used types
pub mod prelude {
    // Pipeline
    pub use crate::bootstrap::{
        BootstrapOptions, Bootstrapper, Environment, RegistryCredentials, Step,
    };

    // Configuration
    pub use crate::config::{BootstrapConfig, ConfigOverride, ConfigStore, RegistryType};

    // Cloud
    pub use crate::cloud::gcp::GcpClient;
    pub use crate::cloud::{ProvisionError, ProvisionResult, ProvisioningClient};

    // Fleet
    pub use crate::fleet::{Fleet, FleetProvisioner, FleetTopology, NodeRole, VmSpec};
    pub use crate::node::Node;

    // Remote execution
    pub use crate::remote::{
        CommandOutput, CredentialResolver, KnownHosts, PassphraseProvider, RemoteExecutor,
        SshError, SshExecutor,
    };

    // Documents
    pub use crate::installconfig::{InstallConfig, Vault};

    // Logging and retries
    pub use crate::logger::{StepLogger, StepOutcome, TracingStepLogger};
    pub use crate::retry::RetryPolicy;
}
