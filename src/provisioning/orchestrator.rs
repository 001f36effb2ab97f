//! Provisioning Orchestrator
//!
//! Drives the five phases in order and owns the run's [`InstallationState`]:
//!
//! ```text
//! prepare ──► storage ──► populate ──► bootloader ──► finalize
//!  (fatal)     (fatal)    (degrades)    (degrades)    (degrades)
//! ```
//!
//! A fatal failure stops the run; whatever was acquired is still released
//! out of band. A degradable failure is recorded and the run moves on.
//!
//! The same machine runs in repair mode: prepare skips device discovery,
//! storage imports the existing pool instead of building one, and populate
//! attaches the installed system instead of bootstrapping a new one.

use super::context::ProvisionContext;
use super::phases::{Criticality, InstallationState, PhaseName, PhaseOutcome, PhaseStatus};
use crate::boot::{boot_targets, detect_firmware, BootRequest, BootloaderInstaller, ESP_MOUNT};
use crate::config::ProvisionConfig;
use crate::domain::ports::{CommandSpec, FirmwareKind, PoolPlan, PoolProperties};
use crate::error::{Error, Result};
use crate::hardware::{DeviceScanner, PlannerPolicy, ScannerConfig, TopologyPlanner};
use crate::lifecycle::MountKind;
use crate::storage::{
    parse_disk_vdevs, BuildOptions, DatasetLayout, DatasetSpec, PoolBuilder,
    ResolvedTools, ToolResolver,
};
use std::fs;
use std::path::Path;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Host id the target must share so the pool imports on first boot
const HOSTID: &str = "/etc/hostid";

/// Run record written into the installed system
const INSTALL_LOG: &str = "var/log/zfs-provision.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Build a pool and install a fresh system onto it
    Install,
    /// Re-install the bootloader of an existing installation
    RepairBoot,
}

/// Scan and plan without touching any device
pub fn plan_pool(config: &ProvisionConfig) -> Result<PoolPlan> {
    config.validate()?;
    let devices = scanner_for(config).eligible()?;
    TopologyPlanner::plan(&devices, &PlannerPolicy::from_config(config))
}

fn scanner_for(config: &ProvisionConfig) -> DeviceScanner {
    DeviceScanner::new(ScannerConfig {
        exclude: config.exclude.clone(),
        sysfs_path: config.sysfs_path.clone(),
        ..Default::default()
    })
}

// =============================================================================
// Provisioner
// =============================================================================

pub struct Provisioner {
    ctx: ProvisionContext,
    mode: Mode,
    state: InstallationState,
}

impl Provisioner {
    pub fn new(ctx: ProvisionContext) -> Self {
        Self::with_mode(ctx, Mode::Install)
    }

    pub fn repair(ctx: ProvisionContext) -> Self {
        Self::with_mode(ctx, Mode::RepairBoot)
    }

    fn with_mode(ctx: ProvisionContext, mode: Mode) -> Self {
        Self {
            ctx,
            mode,
            state: InstallationState::new(),
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Run every phase and return the final state
    pub async fn run(mut self) -> InstallationState {
        let span = self.ctx.span.clone();
        async move {
            info!(mode = ?self.mode, "Provisioning started");

            for name in PhaseName::ALL {
                self.state.start(name);
                let result = self
                    .run_phase(name)
                    .instrument(info_span!("phase", name = %name))
                    .await;

                match result {
                    Ok(PhaseOutcome::Succeeded) => {
                        info!(phase = %name, "Phase succeeded");
                        self.state.finish(name, PhaseStatus::Succeeded, None);
                    }
                    Ok(PhaseOutcome::Degraded(detail)) => {
                        warn!(phase = %name, detail = %detail, "Phase degraded");
                        self.state.finish(name, PhaseStatus::Degraded, Some(detail));
                    }
                    Err(e) => match name.criticality() {
                        Criticality::Fatal => {
                            error!(
                                phase = %name,
                                error = %e,
                                remediation = e.remediation(),
                                "Fatal phase failure"
                            );
                            self.state.abort(name, &e);
                            self.emergency_teardown().await;
                            break;
                        }
                        Criticality::Degradable => {
                            warn!(
                                phase = %name,
                                error = %e,
                                remediation = e.remediation(),
                                "Phase failed; continuing degraded"
                            );
                            self.state.degrade(name, &e);
                        }
                    },
                }
            }

            info!(
                exit_code = self.state.exit_code(),
                degraded = self.state.overall_degraded(),
                "Provisioning finished"
            );
            self.state
        }
        .instrument(span)
        .await
    }

    async fn run_phase(&mut self, name: PhaseName) -> Result<PhaseOutcome> {
        match name {
            PhaseName::Prepare => self.prepare().await,
            PhaseName::Storage => self.storage().await,
            PhaseName::Populate => self.populate().await,
            PhaseName::Bootloader => self.bootloader().await,
            PhaseName::Finalize => self.finalize().await,
        }
    }

    // -------------------------------------------------------------------------
    // Prepare
    // -------------------------------------------------------------------------

    async fn prepare(&mut self) -> Result<PhaseOutcome> {
        let config = self.ctx.config.clone();
        config.validate()?;
        fs::create_dir_all(&config.target_root)?;

        let resolver = self.resolver();
        self.state.artifacts.tools = Some(resolver.resolve().await?);
        self.state.artifacts.firmware = Some(detect_firmware(
            &config.sysfs_path,
            config.firmware.as_override(),
        ));

        if self.mode == Mode::Install {
            let devices = scanner_for(&config).eligible()?;
            info!("{} eligible devices", devices.len());
            self.state.artifacts.devices = devices;
        }
        Ok(PhaseOutcome::Succeeded)
    }

    // -------------------------------------------------------------------------
    // Storage
    // -------------------------------------------------------------------------

    async fn storage(&mut self) -> Result<PhaseOutcome> {
        let tools = self.tools()?;
        match self.mode {
            Mode::Install => self.build_storage(tools).await,
            Mode::RepairBoot => self.attach_storage(tools).await,
        }
    }

    async fn build_storage(&mut self, tools: ResolvedTools) -> Result<PhaseOutcome> {
        let config = self.ctx.config.clone();
        let plan = TopologyPlanner::plan(
            &self.state.artifacts.devices,
            &PlannerPolicy::from_config(&config),
        )?;
        self.state.artifacts.plan = Some(plan.clone());

        let built = self
            .pool_builder(&tools)
            .with_confirmer(self.ctx.confirmer.clone())
            .build(&plan)
            .await?;
        self.state.artifacts.pool = Some(built);

        let runner = self.ctx.runner.clone();
        let layout = DatasetLayout::from_config(&config);
        let timeout = config.timeouts.command();

        let boot_environment = layout.boot_environment();
        layout
            .create(runner.as_ref(), &tools.zfs, &boot_environment, timeout)
            .await?;
        self.mount_datasets(&boot_environment).await?;

        let children = layout.children();
        layout
            .create(runner.as_ref(), &tools.zfs, &children, timeout)
            .await?;
        self.mount_datasets(&children).await?;

        layout
            .set_bootfs(runner.as_ref(), &tools.zpool, timeout)
            .await?;
        Ok(PhaseOutcome::Succeeded)
    }

    async fn mount_datasets(&self, specs: &[DatasetSpec]) -> Result<()> {
        let root = &self.ctx.config.target_root;
        for spec in specs {
            if let Some(target) = spec.target(root) {
                self.ctx
                    .mounts
                    .acquire(&spec.name, &target, MountKind::Dataset)
                    .await?;
            }
        }
        Ok(())
    }

    /// Import the installed pool under the target root and mount its OS root
    async fn attach_storage(&mut self, tools: ResolvedTools) -> Result<PhaseOutcome> {
        let config = self.ctx.config.clone();
        let pool = config.pool_name.as_str();
        let timeout = config.timeouts.command();
        let failed = |reason: String| Error::PoolBuildFailed {
            pool: pool.to_string(),
            reason,
        };

        if self.pool_builder(&tools).pool_exists(pool).await? {
            debug!("Pool {} is already imported", pool);
        } else {
            let import = CommandSpec::new(&tools.zpool)
                .args(["import", "-N", "-R"])
                .arg(config.target_root.display().to_string())
                .arg(pool)
                .timeout(timeout);
            self.ctx
                .runner
                .run_checked(&import)
                .await
                .map_err(|e| failed(format!("cannot import: {}", e)))?;
            self.state.artifacts.imported = true;
            info!("Imported pool {} under {}", pool, config.target_root.display());
        }

        let status = CommandSpec::new(&tools.zpool)
            .args(["status", "-P", pool])
            .timeout(timeout);
        let out = self.ctx.runner.run_checked(&status).await?;
        let vdevs = parse_disk_vdevs(&out.stdout, pool);
        if vdevs.is_empty() {
            return Err(failed("status reports no vdevs".into()));
        }

        let plan = PoolPlan {
            name: pool.to_string(),
            vdevs,
            properties: PoolProperties::default(),
        };
        info!("Existing pool {}", plan);
        self.state.artifacts.plan = Some(plan);

        self.ctx
            .mounts
            .acquire(
                &config.root_dataset_path(),
                &config.target_root,
                MountKind::Dataset,
            )
            .await?;
        Ok(PhaseOutcome::Succeeded)
    }

    // -------------------------------------------------------------------------
    // Populate
    // -------------------------------------------------------------------------

    async fn populate(&mut self) -> Result<PhaseOutcome> {
        let config = self.ctx.config.clone();
        let root = config.target_root.as_path();
        let firmware = self.firmware()?;

        match self.mode {
            Mode::Install => self.bootstrap_os().await?,
            Mode::RepairBoot => {
                if !root.join("etc").is_dir() {
                    return Err(Error::PopulateFailed(format!(
                        "{} holds no installed system",
                        root.display()
                    )));
                }
            }
        }

        self.ctx
            .mounts
            .bind_chroot(root, firmware == FirmwareKind::Uefi)
            .await
            .map_err(|e| Error::PopulateFailed(format!("cannot prepare chroot: {}", e)))?;

        let mut notes = Vec::new();
        if self.mode == Mode::Install {
            let tools = self.tools()?;
            if let Err(e) = self.resolver().provision_target(&tools, root).await {
                warn!("zfs tools not installed into target: {}", e);
                notes.push(format!("zfs tools missing in target: {}", e));
            }

            match copy_hostid(root) {
                Ok(true) => debug!("Copied {} into target", HOSTID),
                Ok(false) => debug!("Host has no {}", HOSTID),
                Err(e) => {
                    warn!("Cannot copy {}: {}", HOSTID, e);
                    notes.push(format!("hostid not copied: {}", e));
                }
            }

            self.install_packages(firmware).await?;
        }

        self.state.artifacts.root_ready = true;
        Ok(outcome(notes))
    }

    async fn bootstrap_os(&self) -> Result<()> {
        let config = &self.ctx.config;
        let populate = &config.populate;
        let root = config.target_root.display().to_string();

        let spec = CommandSpec::new(&populate.command)
            .args(populate.args.iter().map(|a| a.replace("{root}", &root)))
            .timeout(config.timeouts.populate());
        info!("Populating {} with {}", root, spec.program_name());

        let out = self
            .ctx
            .runner
            .run(&spec)
            .await
            .map_err(|e| Error::PopulateFailed(e.to_string()))?;

        if !out.success() {
            return Err(Error::PopulateFailed(format!(
                "{} exited with {:?}: {}",
                spec.program_name(),
                out.code,
                out.stderr.trim()
            )));
        }
        if out.contains_marker(&populate.failure_markers) {
            return Err(Error::PopulateFailed(format!(
                "{} reported a failure",
                spec.program_name()
            )));
        }
        if !populate.success_markers.is_empty() && !out.contains_marker(&populate.success_markers)
        {
            return Err(Error::PopulateFailed(format!(
                "{} never reported success",
                spec.program_name()
            )));
        }
        Ok(())
    }

    async fn install_packages(&self, firmware: FirmwareKind) -> Result<()> {
        let config = &self.ctx.config;
        let packages = &config.packages;
        let boot_packages = match firmware {
            FirmwareKind::Uefi => &packages.uefi_packages,
            FirmwareKind::Legacy => &packages.legacy_packages,
        };
        if packages.packages.is_empty() && boot_packages.is_empty() {
            return Ok(());
        }

        let spec = CommandSpec::new(&packages.command)
            .args(packages.args.iter())
            .args(packages.packages.iter())
            .args(boot_packages.iter())
            .in_root(&config.target_root)
            .timeout(config.timeouts.packages());
        self.ctx
            .runner
            .run_checked(&spec)
            .await
            .map_err(|e| Error::PopulateFailed(format!("package install failed: {}", e)))?;
        info!("Installed packages into {}", config.target_root.display());
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Bootloader
    // -------------------------------------------------------------------------

    async fn bootloader(&mut self) -> Result<PhaseOutcome> {
        if !self.state.artifacts.root_ready {
            warn!("Skipping bootloader: target root is not ready");
            return Ok(PhaseOutcome::Degraded(
                "skipped: target root was not populated".into(),
            ));
        }

        let config = self.ctx.config.clone();
        let firmware = self.firmware()?;
        let plan = self
            .state
            .artifacts
            .plan
            .clone()
            .ok_or_else(|| Error::Internal("no pool plan for boot targets".into()))?;

        if firmware == FirmwareKind::Uefi {
            self.attach_esp(&config).await?;
        }

        let request = BootRequest {
            root: config.target_root.clone(),
            pool: config.pool_name.clone(),
            root_dataset: config.root_dataset_path(),
            bootloader_id: config.bootloader_id.clone(),
            firmware,
            targets: boot_targets(&plan, firmware, config.esp_device.as_deref()),
        };

        let report = BootloaderInstaller::new(self.ctx.runner.clone(), config.timeouts.clone())
            .install(&request)
            .await;
        info!(
            installed = report.succeeded(),
            total = report.total(),
            "Bootloader installer {}",
            report.overall()
        );
        let degradations = report.degradations();
        // A partial install succeeded for the installer but degrades the phase
        let checked = report.check();
        self.state.artifacts.boot = Some(report);
        checked?;

        Ok(outcome(degradations))
    }

    async fn attach_esp(&self, config: &ProvisionConfig) -> Result<()> {
        let esp_mount = config.target_root.join(ESP_MOUNT.trim_start_matches('/'));
        match &config.esp_device {
            Some(esp) => {
                self.ctx
                    .mounts
                    .acquire(
                        esp,
                        &esp_mount,
                        MountKind::Filesystem {
                            fstype: Some("vfat".into()),
                        },
                    )
                    .await
                    .map_err(|e| Error::BootloaderFailed(format!("cannot mount ESP: {}", e)))?;
            }
            None if esp_mount.is_dir() => {
                debug!("Using ESP already present at {}", esp_mount.display());
            }
            None => {
                return Err(Error::BootloaderFailed(format!(
                    "no ESP configured and {} does not exist",
                    esp_mount.display()
                )));
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Finalize
    // -------------------------------------------------------------------------

    async fn finalize(&mut self) -> Result<PhaseOutcome> {
        let config = self.ctx.config.clone();
        let mut notes = Vec::new();

        if self.state.artifacts.root_ready {
            if let Err(e) = self.write_install_log(&config.target_root) {
                warn!("Cannot write install log: {}", e);
            }
        }

        let busy = self.ctx.mounts.release_all().await;
        self.state.artifacts.busy_mounts = busy;
        if busy > 0 {
            notes.push(format!(
                "{} mount(s) still busy under {}",
                busy,
                config.target_root.display()
            ));
        }

        if self.owns_pool() {
            match self.export_pool().await {
                Ok(()) => info!("Exported pool {}", config.pool_name),
                Err(e) => notes.push(format!("pool {} not exported: {}", config.pool_name, e)),
            }
        }

        Ok(outcome(notes))
    }

    fn write_install_log(&self, root: &Path) -> Result<()> {
        let path = root.join(INSTALL_LOG);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, serde_json::to_string_pretty(&self.state)?)?;
        debug!("Wrote {}", path.display());
        Ok(())
    }

    /// Release everything after a fatal failure
    async fn emergency_teardown(&mut self) {
        warn!("Releasing acquired resources after fatal failure");
        self.state.artifacts.busy_mounts = self.ctx.mounts.release_all().await;

        if self.owns_pool() {
            if let Err(e) = self.export_pool().await {
                warn!("Pool {} left imported: {}", self.ctx.config.pool_name, e);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    /// Pool this run built or imported, and must therefore export
    fn owns_pool(&self) -> bool {
        let artifacts = &self.state.artifacts;
        (self.mode == Mode::Install && artifacts.pool.is_some()) || artifacts.imported
    }

    async fn export_pool(&self) -> Result<()> {
        let tools = self.tools()?;
        self.pool_builder(&tools)
            .export(&self.ctx.config.pool_name)
            .await
    }

    fn pool_builder(&self, tools: &ResolvedTools) -> PoolBuilder {
        PoolBuilder::new(
            self.ctx.runner.clone(),
            tools.clone(),
            BuildOptions::from_config(&self.ctx.config),
        )
    }

    fn resolver(&self) -> ToolResolver {
        let config = &self.ctx.config;
        ToolResolver::new(
            self.ctx.runner.clone(),
            config.resolver.clone(),
            config.sysfs_path.clone(),
            config.timeouts.command(),
        )
    }

    fn tools(&self) -> Result<ResolvedTools> {
        self.state
            .artifacts
            .tools
            .clone()
            .ok_or_else(|| Error::Internal("storage-engine tools were not resolved".into()))
    }

    fn firmware(&self) -> Result<FirmwareKind> {
        self.state
            .artifacts
            .firmware
            .ok_or_else(|| Error::Internal("firmware was not detected".into()))
    }
}

fn outcome(notes: Vec<String>) -> PhaseOutcome {
    if notes.is_empty() {
        PhaseOutcome::Succeeded
    } else {
        PhaseOutcome::Degraded(notes.join("; "))
    }
}

/// Returns false when the host has no hostid to share
fn copy_hostid(root: &Path) -> Result<bool> {
    let source = Path::new(HOSTID);
    if !source.is_file() {
        return Ok(false);
    }
    let dest = root.join(HOSTID.trim_start_matches('/'));
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(source, dest)?;
    Ok(true)
}
