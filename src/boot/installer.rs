//! Bootloader Installer
//!
//! Runs inside the populated target root (chroot):
//!
//! 1. regenerate the initramfs, all kernels first, then the newest alone
//! 2. generate the boot menu, or write a minimal one by hand
//! 3. install boot code: once to the ESP plus a removable fallback on UEFI;
//!    to every pool device on legacy firmware, each with its own chain of
//!    progressively more permissive invocations
//! 4. check what was installed
//!
//! Targets are independent. The run succeeds when at least one target
//! received a bootloader.

use super::menu::{detect_kernel, render_menu};
use super::verify::{verify_boot_sector, verify_efi_image};
use crate::config::TimeoutConfig;
use crate::domain::ports::{BootTarget, CommandRunner, CommandSpec, FirmwareKind};
use crate::error::{Error, Result};
use crate::exec::{Ladder, RungFailure};
use crate::provisioning::PhaseStatus;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// ESP mount point inside the target root
pub const ESP_MOUNT: &str = "/boot/efi";

const GRUB_CFG: &str = "/boot/grub/grub.cfg";

const LEGACY_MODULES: &str = "--modules=zfs part_gpt part_msdos";

// =============================================================================
// Request & Report
// =============================================================================

/// What to install and where
#[derive(Debug, Clone)]
pub struct BootRequest {
    pub root: PathBuf,
    pub pool: String,
    pub root_dataset: String,
    pub bootloader_id: String,
    pub firmware: FirmwareKind,
    pub targets: Vec<BootTarget>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    /// Written by the distribution's generator
    Generated,
    /// Hand-written minimal menu
    Fallback,
}

/// Outcome for one boot target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetResult {
    pub device: String,
    pub installed: bool,
    /// Strategy that installed it
    pub strategy: Option<String>,
    /// Post-install check passed
    pub verified: bool,
    pub failures: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootReport {
    pub firmware: FirmwareKind,
    pub initramfs: bool,
    pub config: Option<ConfigSource>,
    pub targets: Vec<TargetResult>,
}

impl BootReport {
    pub fn succeeded(&self) -> usize {
        self.targets.iter().filter(|t| t.installed).count()
    }

    pub fn total(&self) -> usize {
        self.targets.len()
    }

    /// Some but not all targets received a bootloader
    pub fn is_partial(&self) -> bool {
        let succeeded = self.succeeded();
        succeeded > 0 && succeeded < self.total()
    }

    /// Installer result: succeeded when at least one target was installed
    pub fn overall(&self) -> PhaseStatus {
        if self.succeeded() > 0 {
            PhaseStatus::Succeeded
        } else {
            PhaseStatus::Failed
        }
    }

    /// Ok when every target was installed
    pub fn check(&self) -> Result<()> {
        let succeeded = self.succeeded();
        if succeeded == 0 {
            let failures: Vec<String> = self
                .targets
                .iter()
                .map(|t| format!("{}: {}", t.device, t.failures.join("; ")))
                .collect();
            return Err(Error::BootloaderFailed(if failures.is_empty() {
                "no boot targets".to_string()
            } else {
                failures.join(" | ")
            }));
        }
        if succeeded < self.total() {
            return Err(Error::BootloaderPartial {
                succeeded,
                total: self.total(),
            });
        }
        Ok(())
    }

    /// Problems that leave the system bootable only by luck
    pub fn degradations(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if !self.initramfs {
            problems.push("initramfs was not regenerated".to_string());
        }
        if self.config.is_none() {
            problems.push("no boot menu was written".to_string());
        }
        problems
    }
}

// =============================================================================
// Installer
// =============================================================================

pub struct BootloaderInstaller {
    runner: Arc<dyn CommandRunner>,
    timeouts: TimeoutConfig,
}

impl BootloaderInstaller {
    pub fn new(runner: Arc<dyn CommandRunner>, timeouts: TimeoutConfig) -> Self {
        Self { runner, timeouts }
    }

    pub async fn install(&self, request: &BootRequest) -> BootReport {
        let initramfs = self.regenerate_initramfs(&request.root).await;
        let config = self.write_menu(request).await;

        let mut targets = Vec::with_capacity(request.targets.len());
        for target in &request.targets {
            let result = match target.firmware {
                FirmwareKind::Uefi => self.install_uefi(request).await,
                FirmwareKind::Legacy => self.install_legacy(request, target).await,
            };
            if result.installed && !result.verified {
                warn!("Bootloader on {} could not be verified", result.device);
            }
            targets.push(result);
        }

        let report = BootReport {
            firmware: request.firmware,
            initramfs,
            config,
            targets,
        };
        info!(
            "Bootloader installed on {}/{} targets",
            report.succeeded(),
            report.total()
        );
        report
    }

    fn in_root(&self, root: &Path, program: &str, args: &[&str], timeout: Duration) -> CommandSpec {
        CommandSpec::new(program)
            .args(args.iter().copied())
            .in_root(root)
            .timeout(timeout)
    }

    async fn run(&self, spec: CommandSpec) -> Result<()> {
        self.runner.run_checked(&spec).await.map(|_| ())
    }

    // -------------------------------------------------------------------------
    // Initramfs & Menu
    // -------------------------------------------------------------------------

    async fn regenerate_initramfs(&self, root: &Path) -> bool {
        let timeout = self.timeouts.initramfs();
        let mut ladder = Ladder::new("initramfs").rung(
            "all kernels",
            self.run(self.in_root(root, "update-initramfs", &["-u", "-k", "all"], timeout)),
        );
        if let Some(kernel) = detect_kernel(root) {
            let spec = self.in_root(root, "update-initramfs", &["-u", "-k", &kernel.version], timeout);
            ladder = ladder.rung("newest kernel", self.run(spec));
        }

        match ladder.climb().await {
            Ok(_) => true,
            Err(exhausted) => {
                warn!("Initramfs not regenerated: {}", exhausted.summary());
                false
            }
        }
    }

    async fn write_menu(&self, request: &BootRequest) -> Option<ConfigSource> {
        let generate = self.in_root(
            &request.root,
            "grub-mkconfig",
            &["-o", GRUB_CFG],
            self.timeouts.bootloader(),
        );

        let climbed = Ladder::new("boot menu")
            .rung("grub-mkconfig", async move {
                self.run(generate).await.map(|_| ConfigSource::Generated)
            })
            .rung("fallback menu", self.write_fallback_menu(request))
            .climb()
            .await;

        match climbed {
            Ok(climbed) => Some(climbed.value),
            Err(exhausted) => {
                warn!("No boot menu written: {}", exhausted.summary());
                None
            }
        }
    }

    async fn write_fallback_menu(&self, request: &BootRequest) -> Result<ConfigSource> {
        let kernel = detect_kernel(&request.root).ok_or_else(|| {
            Error::BootloaderFailed("no kernel with a matching initrd in /boot".into())
        })?;

        let menu = render_menu(&kernel, &request.pool, &request.root_dataset);
        let path = request.root.join(GRUB_CFG.trim_start_matches('/'));
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, menu).await?;

        info!("Wrote fallback boot menu for kernel {}", kernel.version);
        Ok(ConfigSource::Fallback)
    }

    // -------------------------------------------------------------------------
    // Boot Code
    // -------------------------------------------------------------------------

    async fn install_uefi(&self, request: &BootRequest) -> TargetResult {
        let timeout = self.timeouts.bootloader();
        let efi_dir = format!("--efi-directory={}", ESP_MOUNT);
        let id = format!("--bootloader-id={}", request.bootloader_id);

        let primary = self
            .run(self.in_root(
                &request.root,
                "grub-install",
                &["--target=x86_64-efi", &efi_dir, &id, "--recheck"],
                timeout,
            ))
            .await;
        let removable = self
            .run(self.in_root(
                &request.root,
                "grub-install",
                &["--target=x86_64-efi", &efi_dir, "--removable", "--no-nvram"],
                timeout,
            ))
            .await;

        let mut failures = Vec::new();
        if let Err(e) = &primary {
            failures.push(format!("firmware entry: {}", e));
        }
        if let Err(e) = &removable {
            failures.push(format!("removable: {}", e));
        }

        let strategy = match (&primary, &removable) {
            (Ok(()), _) => Some("firmware entry".to_string()),
            (Err(_), Ok(())) => Some("removable".to_string()),
            _ => None,
        };
        let installed = strategy.is_some();
        let esp = request.root.join(ESP_MOUNT.trim_start_matches('/'));

        TargetResult {
            device: request
                .targets
                .first()
                .map(|t| t.device.clone())
                .unwrap_or_else(|| ESP_MOUNT.to_string()),
            installed,
            strategy,
            verified: installed && verify_efi_image(&esp, &request.bootloader_id),
            failures,
        }
    }

    async fn install_legacy(&self, request: &BootRequest, target: &BootTarget) -> TargetResult {
        let timeout = self.timeouts.bootloader();
        let device = target.device.as_str();
        // Only the first rung embeds modules
        let attempt = |extra: &[&str]| {
            let mut args = vec!["--target=i386-pc"];
            args.extend_from_slice(extra);
            args.push(device);
            self.run(self.in_root(&request.root, "grub-install", &args, timeout))
        };

        let climbed = Ladder::new(format!("boot code on {}", device))
            .rung("zfs modules", attempt(&[LEGACY_MODULES]))
            .rung("skip filesystem probe", attempt(&["--skip-fs-probe"]))
            .rung(
                "floppy compatible",
                attempt(&["--skip-fs-probe", "--allow-floppy"]),
            )
            .rung("forced", attempt(&["--force"]))
            .climb()
            .await;

        match climbed {
            Ok(climbed) => TargetResult {
                device: device.to_string(),
                installed: true,
                verified: verify_boot_sector(Path::new(device)),
                strategy: Some(climbed.rung),
                failures: describe(&climbed.failures),
            },
            Err(exhausted) => {
                warn!("No boot code on {}: {}", device, exhausted.summary());
                TargetResult {
                    device: device.to_string(),
                    installed: false,
                    strategy: None,
                    verified: false,
                    failures: describe(&exhausted.failures),
                }
            }
        }
    }
}

fn describe(failures: &[RungFailure]) -> Vec<String> {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.rung, f.reason))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing::ScriptedRunner;
    use assert_matches::assert_matches;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        runner: Arc<ScriptedRunner>,
        tmp: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                runner: Arc::new(ScriptedRunner::new()),
                tmp: TempDir::new().unwrap(),
            }
        }

        fn installer(&self) -> BootloaderInstaller {
            BootloaderInstaller::new(self.runner.clone(), TimeoutConfig::default())
        }

        fn request(&self, firmware: FirmwareKind, devices: &[&str]) -> BootRequest {
            BootRequest {
                root: self.tmp.path().to_path_buf(),
                pool: "rpool".into(),
                root_dataset: "rpool/ROOT/debian".into(),
                bootloader_id: "debian".into(),
                firmware,
                targets: devices
                    .iter()
                    .map(|d| BootTarget {
                        device: d.to_string(),
                        firmware,
                    })
                    .collect(),
            }
        }

        fn add_kernel(&self, version: &str) {
            let boot = self.tmp.path().join("boot");
            fs::create_dir_all(&boot).unwrap();
            fs::write(boot.join(format!("vmlinuz-{}", version)), b"").unwrap();
            fs::write(boot.join(format!("initrd.img-{}", version)), b"").unwrap();
        }
    }

    #[tokio::test]
    async fn test_uefi_install() {
        let fx = Fixture::new();

        let report = fx
            .installer()
            .install(&fx.request(FirmwareKind::Uefi, &["/dev/sda1"]))
            .await;

        assert!(report.check().is_ok());
        assert!(report.initramfs);
        assert_eq!(report.config, Some(ConfigSource::Generated));
        assert_eq!(report.targets[0].strategy.as_deref(), Some("firmware entry"));
        // Nothing on the fake ESP
        assert!(!report.targets[0].verified);

        let calls = fx.runner.calls();
        assert!(calls.contains(
            &"grub-install --target=x86_64-efi --efi-directory=/boot/efi --bootloader-id=debian --recheck"
                .to_string()
        ));
        assert_eq!(fx.runner.count("--removable"), 1);
        assert!(fx
            .runner
            .specs()
            .iter()
            .all(|s| s.root.as_deref() == Some(fx.tmp.path())));
    }

    #[tokio::test]
    async fn test_uefi_removable_only() {
        let fx = Fixture::new();
        fx.runner.fail("--bootloader-id");

        let report = fx
            .installer()
            .install(&fx.request(FirmwareKind::Uefi, &["/dev/sda1"]))
            .await;

        assert!(report.check().is_ok());
        assert_eq!(report.targets[0].strategy.as_deref(), Some("removable"));
    }

    #[tokio::test]
    async fn test_legacy_fallback_chain() {
        let fx = Fixture::new();
        fx.runner.fail("part_msdos /dev/sda");

        let report = fx
            .installer()
            .install(&fx.request(FirmwareKind::Legacy, &["/dev/sda"]))
            .await;

        let target = &report.targets[0];
        assert!(target.installed);
        assert_eq!(target.strategy.as_deref(), Some("skip filesystem probe"));
        assert_eq!(target.failures.len(), 1);
    }

    #[tokio::test]
    async fn test_legacy_forced_install_without_modules() {
        let fx = Fixture::new();
        fx.runner.fail("--modules=zfs");
        fx.runner.fail("--skip-fs-probe");

        let report = fx
            .installer()
            .install(&fx.request(FirmwareKind::Legacy, &["/dev/sda"]))
            .await;

        let target = &report.targets[0];
        assert!(target.installed);
        assert_eq!(target.strategy.as_deref(), Some("forced"));
        assert_eq!(target.failures.len(), 3);
        assert_eq!(fx.runner.count("--modules=zfs"), 1);
        assert_eq!(
            fx.runner.count("grub-install --target=i386-pc --force /dev/sda"),
            1
        );
    }

    #[tokio::test]
    async fn test_legacy_one_of_two_is_partial() {
        let fx = Fixture::new();
        fx.runner.fail("/dev/sda");

        let report = fx
            .installer()
            .install(&fx.request(FirmwareKind::Legacy, &["/dev/sda", "/dev/sdb"]))
            .await;

        assert!(report.is_partial());
        assert_eq!(report.succeeded(), 1);
        assert_eq!(report.overall(), PhaseStatus::Succeeded);
        assert_matches!(
            report.check(),
            Err(Error::BootloaderPartial {
                succeeded: 1,
                total: 2
            })
        );
        // Every rung tried on the failing device, the other still attempted
        assert_eq!(fx.runner.count("/dev/sda"), 4);
        assert_eq!(fx.runner.count("/dev/sdb"), 1);
    }

    #[tokio::test]
    async fn test_all_targets_failed() {
        let fx = Fixture::new();
        fx.runner.fail("grub-install");

        let report = fx
            .installer()
            .install(&fx.request(FirmwareKind::Legacy, &["/dev/sda", "/dev/sdb"]))
            .await;

        assert_eq!(report.succeeded(), 0);
        assert_eq!(report.overall(), PhaseStatus::Failed);
        assert_matches!(report.check(), Err(Error::BootloaderFailed(_)));
    }

    #[tokio::test]
    async fn test_fallback_menu() {
        let fx = Fixture::new();
        fx.add_kernel("6.1.0-18-amd64");
        fx.runner.fail("grub-mkconfig");

        let report = fx
            .installer()
            .install(&fx.request(FirmwareKind::Legacy, &["/dev/sda"]))
            .await;

        assert_eq!(report.config, Some(ConfigSource::Fallback));
        let menu = fs::read_to_string(fx.tmp.path().join("boot/grub/grub.cfg")).unwrap();
        assert!(menu.contains("root=ZFS=rpool/ROOT/debian"));
        assert!(report.degradations().is_empty());
    }

    #[tokio::test]
    async fn test_no_menu_and_no_initramfs_degrade() {
        let fx = Fixture::new();
        fx.runner.fail("grub-mkconfig");
        fx.runner.fail("update-initramfs");

        let report = fx
            .installer()
            .install(&fx.request(FirmwareKind::Legacy, &["/dev/sda"]))
            .await;

        assert_eq!(report.config, None);
        assert!(!report.initramfs);
        assert_eq!(report.degradations().len(), 2);
        // Boot code still installed
        assert!(report.check().is_ok());
    }

    #[tokio::test]
    async fn test_initramfs_narrows_to_newest_kernel() {
        let fx = Fixture::new();
        fx.add_kernel("6.1.0-18-amd64");
        fx.runner.fail("-k all");

        let report = fx
            .installer()
            .install(&fx.request(FirmwareKind::Legacy, &["/dev/sda"]))
            .await;

        assert!(report.initramfs);
        assert_eq!(fx.runner.count("update-initramfs -u -k 6.1.0-18-amd64"), 1);
    }
}
