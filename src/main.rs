//! zfs-provision
//!
//! Command-line entry point: reads configuration, installs logging, runs
//! the requested operation and maps the final state to an exit code.
//!
//! ```text
//! zfs-provision [OPTIONS] install       build pool, populate OS, install bootloader
//! zfs-provision [OPTIONS] plan          print the pool plan as JSON, touch nothing
//! zfs-provision [OPTIONS] repair-boot   re-install the bootloader of an existing system
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use zfs_provision::{
    plan_pool, repair_bootloader, run_provisioning, ExistingPoolPolicy, FirmwareSetting,
    InstallationState, PhaseStatus, ProvisionConfig, EXIT_FATAL,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Redundant ZFS pool planner and phased bare-metal OS provisioner
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// YAML configuration file
    #[arg(long, short, env = "ZFS_PROVISION_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Pool name
    #[arg(long, global = true)]
    pool: Option<String>,

    /// What to do with an existing pool (fail, prompt, force)
    #[arg(long, global = true)]
    existing_pool: Option<String>,

    /// Firmware type (auto, uefi, legacy)
    #[arg(long, global = true)]
    firmware: Option<String>,

    /// Device path or kernel name to leave untouched (repeatable)
    #[arg(long, global = true)]
    exclude: Vec<String>,

    /// Where the new system is assembled
    #[arg(long, global = true)]
    target_root: Option<PathBuf>,

    /// Write the final run state as JSON
    #[arg(long, global = true)]
    report: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Build the pool, populate the OS and install the bootloader
    Install,
    /// Scan devices and print the planned pool as JSON
    Plan,
    /// Import an existing installation and re-install its bootloader
    RepairBoot,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(&args);

    let code = match run(&args).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("error: {:#}", e);
            EXIT_FATAL
        }
    };
    std::process::exit(code);
}

async fn run(args: &Args) -> anyhow::Result<i32> {
    let config = load_config(args)?;

    info!("Starting {} {}", zfs_provision::NAME, zfs_provision::VERSION);
    info!("  Pool: {}", config.pool_name);
    info!("  Target root: {}", config.target_root.display());
    info!("  Existing pool: {:?}", config.existing_pool);

    let state = match args.command {
        Command::Plan => {
            let plan = plan_pool(&config).context("planning failed")?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
            return Ok(0);
        }
        Command::Install => run_provisioning(config).await,
        Command::RepairBoot => repair_bootloader(config).await,
    };

    print_summary(&state);
    if let Some(path) = &args.report {
        write_report(path, &state)?;
    }
    Ok(state.exit_code())
}

// =============================================================================
// Configuration
// =============================================================================

fn load_config(args: &Args) -> anyhow::Result<ProvisionConfig> {
    let mut config = match &args.config {
        Some(path) => ProvisionConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ProvisionConfig::default(),
    };

    if let Some(pool) = &args.pool {
        config.pool_name = pool.clone();
    }
    if let Some(policy) = &args.existing_pool {
        config.existing_pool = policy.parse::<ExistingPoolPolicy>()?;
    }
    if let Some(firmware) = &args.firmware {
        config.firmware = firmware.parse::<FirmwareSetting>()?;
    }
    if let Some(root) = &args.target_root {
        config.target_root = root.clone();
    }
    config.exclude.extend(args.exclude.iter().cloned());

    config.validate()?;
    Ok(config)
}

// =============================================================================
// Reporting
// =============================================================================

fn print_summary(state: &InstallationState) {
    eprintln!();
    for phase in &state.phases {
        let marker = match phase.status {
            PhaseStatus::Succeeded => "ok",
            PhaseStatus::Degraded => "!!",
            PhaseStatus::Failed => "XX",
            PhaseStatus::Pending | PhaseStatus::Running => "--",
        };
        match &phase.detail {
            Some(detail) => eprintln!("[{}] {:<10} {:<9} {}", marker, phase.name, phase.status, detail),
            None => eprintln!("[{}] {:<10} {}", marker, phase.name, phase.status),
        }
        if phase.status == PhaseStatus::Degraded {
            if let Some(remediation) = &phase.remediation {
                eprintln!("     {:<10} next step: {}", "", remediation);
            }
        }
    }

    if let Some(fatal) = &state.fatal {
        eprintln!();
        eprintln!("error: {} failed: {}", fatal.phase, fatal.error);
        eprintln!("next step: {}", fatal.remediation);
    } else if state.needs_manual_verification() {
        eprintln!();
        eprintln!("warning: the installed system may not boot; verify every boot disk manually before rebooting");
    } else if state.overall_degraded() {
        eprintln!();
        eprintln!("warning: completed with degradations; review the phases marked !! before rebooting");
    }
}

fn write_report(path: &Path, state: &InstallationState) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(state)?;
    std::fs::write(path, json).with_context(|| format!("writing report {}", path.display()))?;
    info!("Report written to {}", path.display());
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // stdout carries the plan; logs go to stderr
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
