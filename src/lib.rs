//! ZFS Provisioner
//!
//! Turns a bare machine into a bootable system on a redundant ZFS pool:
//! discovers disks, plans a mirrored topology, builds the pool and its
//! datasets, populates an OS, installs the bootloader on every boot disk and
//! exports the pool for first boot.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                     Provisioning Orchestrator                          │
//! │   prepare ──► storage ──► populate ──► bootloader ──► finalize         │
//! ├───────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐  ┌────────────┐  │
//! │  │   Hardware   │  │   Storage    │  │  Lifecycle   │  │    Boot    │  │
//! │  │  scan + plan │  │ build, wipe, │  │ mounts and   │  │ installer, │  │
//! │  │              │  │ tool resolve │  │ holders      │  │ fallbacks  │  │
//! │  └──────────────┘  └──────────────┘  └──────────────┘  └────────────┘  │
//! ├───────────────────────────────────────────────────────────────────────┤
//! │            Execution: command runner, retry, fallback ladders          │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`hardware`]: device discovery and topology planning
//! - [`storage`]: pool construction, device wiping and tool resolution
//! - [`lifecycle`]: mount ownership and guaranteed release
//! - [`boot`]: firmware detection and bootloader installation
//! - [`provisioning`]: phase state machine and orchestrator
//! - [`exec`]: external commands, retries and fallback ladders
//! - [`domain`]: core domain types and ports
//! - [`error`]: error types and handling

pub mod boot;
pub mod config;
pub mod domain;
pub mod error;
pub mod exec;
pub mod hardware;
pub mod lifecycle;
pub mod provisioning;
pub mod storage;

// Re-export commonly used types
pub use boot::{BootReport, BootRequest, BootloaderInstaller};

pub use config::{ExistingPoolPolicy, FirmwareSetting, ProvisionConfig};

pub use domain::ports::{
    BootTarget, CommandOutput, CommandRunner, CommandSpec, Confirmer, Device, FirmwareKind,
    PoolPlan, VdevKind, VdevPlan,
};

pub use error::{Error, Result, Severity};

pub use hardware::{DeviceScanner, PlannerPolicy, ScannerConfig, TopologyPlanner};

pub use lifecycle::{MountHandle, MountKind, MountManager, ReleaseOutcome};

pub use provisioning::{
    plan_pool, InstallationState, Mode, PhaseName, PhaseStatus, ProvisionContext, Provisioner,
    EXIT_DEGRADED, EXIT_FATAL, EXIT_SUCCESS,
};

pub use storage::{BuiltPool, PoolBuilder, ResolvedTools, ToolResolver};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Install a fresh system on the host's disks
pub async fn run_provisioning(config: ProvisionConfig) -> InstallationState {
    Provisioner::new(ProvisionContext::system(config)).run().await
}

/// Re-install the bootloader of an existing installation
pub async fn repair_bootloader(config: ProvisionConfig) -> InstallationState {
    Provisioner::repair(ProvisionContext::system(config)).run().await
}
