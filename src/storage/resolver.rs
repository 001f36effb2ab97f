//! Storage-Engine Tool Resolver
//!
//! Makes the zfs driver and its userland tools usable through a cascade of
//! strategies, each tried at most once per call:
//!
//! 1. driver already loaded and commands working
//! 2. fresh driver load
//! 3. extraction from a known-good donor environment into a staging area
//! 4. copy of host binaries found outside PATH into the staging area

use crate::config::ResolverConfig;
use crate::domain::ports::{CommandRunner, CommandSpec};
use crate::error::{Error, Result};
use crate::exec::Ladder;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Files pulled from a donor root, relative to it
const DONOR_PATTERNS: &[&str] = &[
    "sbin/zpool",
    "sbin/zfs",
    "sbin/mount.zfs",
    "usr/sbin/zpool",
    "usr/sbin/zfs",
    "usr/sbin/mount.zfs",
    "lib/*/libzfs*",
    "lib/*/libzpool*",
    "lib/*/libnvpair*",
    "lib/*/libuutil*",
    "usr/lib/*/libzfs*",
    "usr/lib/*/libzpool*",
    "usr/lib/*/libnvpair*",
    "usr/lib/*/libuutil*",
    "lib/modules/*/**/zfs.ko*",
    "lib/modules/*/**/spl.ko*",
    "usr/lib/modules/*/**/zfs.ko*",
    "usr/lib/modules/*/**/spl.ko*",
];

const TOOL_NAMES: &[&str] = &["zpool", "zfs"];

// =============================================================================
// Resolution Result
// =============================================================================

/// Which strategy made the tools available
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Resolution {
    AlreadyLoaded,
    FreshLoad,
    DonorExtracted,
    HostCopied,
}

/// Tool locations carried forward to later phases
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedTools {
    pub resolution: Resolution,
    pub zpool: String,
    pub zfs: String,
    /// Staging tree, when tools were staged
    pub staging: Option<PathBuf>,
}

impl ResolvedTools {
    /// Tools reachable through PATH
    pub fn on_path(resolution: Resolution) -> Self {
        Self {
            resolution,
            zpool: "zpool".to_string(),
            zfs: "zfs".to_string(),
            staging: None,
        }
    }
}

// =============================================================================
// Tool Resolver
// =============================================================================

pub struct ToolResolver {
    runner: Arc<dyn CommandRunner>,
    config: ResolverConfig,
    sysfs_path: PathBuf,
    timeout: Duration,
}

impl ToolResolver {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        config: ResolverConfig,
        sysfs_path: PathBuf,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            config,
            sysfs_path,
            timeout,
        }
    }

    /// Resolve tools on the host, falling back step by step
    pub async fn resolve(&self) -> Result<ResolvedTools> {
        let climbed = Ladder::new("storage-engine tools")
            .rung("loaded driver", self.check_loaded())
            .rung("fresh driver load", self.fresh_load())
            .rung("donor extraction", self.extract_from_donor())
            .rung("host binary copy", self.copy_host_binaries())
            .climb()
            .await
            .map_err(|exhausted| Error::ToolUnavailable {
                tool: self.config.module.clone(),
                reason: exhausted.summary(),
            })?;

        info!(
            "Storage-engine tools available via {} (zpool: {}, zfs: {})",
            climbed.rung, climbed.value.zpool, climbed.value.zfs
        );
        Ok(climbed.value)
    }

    /// Make the tools available inside a bootstrapped target root
    ///
    /// Re-runs the staged install into the target when tools were staged;
    /// otherwise copies the host binaries the target is missing.
    pub async fn provision_target(&self, tools: &ResolvedTools, root: &Path) -> Result<()> {
        if TOOL_NAMES
            .iter()
            .all(|t| root.join("usr/sbin").join(t).exists() || root.join("sbin").join(t).exists())
        {
            debug!("Target {} already carries zfs tools", root.display());
            return Ok(());
        }

        match (&tools.resolution, &tools.staging) {
            (Resolution::DonorExtracted, Some(staging)) => {
                let copied = copy_tree(staging, root)?;
                info!("Installed {} staged files into {}", copied, root.display());
                let spec = CommandSpec::new("depmod")
                    .arg("-a")
                    .in_root(root)
                    .timeout(self.timeout);
                self.runner.run_checked(&spec).await?;
            }
            _ => {
                let dest = root.join("usr/sbin");
                fs::create_dir_all(&dest)?;
                for tool in TOOL_NAMES {
                    let source = self.locate_host_binary(tool).ok_or_else(|| {
                        Error::ToolUnavailable {
                            tool: tool.to_string(),
                            reason: "not found on host for target install".into(),
                        }
                    })?;
                    fs::copy(&source, dest.join(tool))?;
                }
                info!("Copied host zfs tools into {}", dest.display());
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Strategies
    // -------------------------------------------------------------------------

    async fn check_loaded(&self) -> Result<ResolvedTools> {
        if !self.module_loaded() {
            return Err(self.unavailable("driver not loaded"));
        }
        self.probe("zfs").await?;
        Ok(ResolvedTools::on_path(Resolution::AlreadyLoaded))
    }

    async fn fresh_load(&self) -> Result<ResolvedTools> {
        let spec = CommandSpec::new("modprobe")
            .arg(&self.config.module)
            .timeout(self.timeout);
        self.runner.run_checked(&spec).await?;
        self.probe("zfs").await?;
        Ok(ResolvedTools::on_path(Resolution::FreshLoad))
    }

    async fn extract_from_donor(&self) -> Result<ResolvedTools> {
        let donor = self
            .config
            .donor_root
            .as_ref()
            .ok_or_else(|| self.unavailable("no donor root configured"))?;
        let staging = &self.config.staging_dir;

        let copied = stage_from_donor(donor, staging)?;
        if copied == 0 {
            return Err(self.unavailable("donor root holds no zfs files"));
        }
        debug!("Staged {} files from {}", copied, donor.display());

        let kernel = self
            .runner
            .run_checked(&CommandSpec::new("uname").arg("-r").timeout(self.timeout))
            .await?
            .stdout
            .trim()
            .to_string();

        let depmod = CommandSpec::new("depmod")
            .arg("-b")
            .arg(staging.display().to_string())
            .arg(&kernel)
            .timeout(self.timeout);
        self.runner.run_checked(&depmod).await?;

        let modprobe = CommandSpec::new("modprobe")
            .arg("-d")
            .arg(staging.display().to_string())
            .arg(&self.config.module)
            .timeout(self.timeout);
        self.runner.run_checked(&modprobe).await?;

        let zpool = staged_binary(staging, "zpool")
            .ok_or_else(|| self.unavailable("donor root has no zpool binary"))?;
        let zfs = staged_binary(staging, "zfs")
            .ok_or_else(|| self.unavailable("donor root has no zfs binary"))?;
        self.probe(&zfs).await?;

        Ok(ResolvedTools {
            resolution: Resolution::DonorExtracted,
            zpool,
            zfs,
            staging: Some(staging.clone()),
        })
    }

    async fn copy_host_binaries(&self) -> Result<ResolvedTools> {
        let bin = self.config.staging_dir.join("bin");
        fs::create_dir_all(&bin)?;

        for tool in TOOL_NAMES {
            let source = self
                .locate_host_binary(tool)
                .ok_or_else(|| self.unavailable(&format!("{} not found on host", tool)))?;
            fs::copy(&source, bin.join(tool))?;
            debug!("Copied {} -> {}", source.display(), bin.display());
        }

        let zfs = bin.join("zfs").display().to_string();
        self.probe(&zfs).await?;

        Ok(ResolvedTools {
            resolution: Resolution::HostCopied,
            zpool: bin.join("zpool").display().to_string(),
            zfs,
            staging: None,
        })
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    fn module_loaded(&self) -> bool {
        self.sysfs_path
            .join("module")
            .join(&self.config.module)
            .is_dir()
    }

    async fn probe(&self, zfs: &str) -> Result<()> {
        let spec = CommandSpec::new(zfs).arg("version").timeout(self.timeout);
        self.runner.run_checked(&spec).await.map(|_| ())
    }

    fn locate_host_binary(&self, tool: &str) -> Option<PathBuf> {
        self.config
            .host_bin_dirs
            .iter()
            .map(|dir| dir.join(tool))
            .find(|p| p.is_file())
            .or_else(|| which::which(tool).ok())
    }

    fn unavailable(&self, reason: &str) -> Error {
        Error::ToolUnavailable {
            tool: self.config.module.clone(),
            reason: reason.to_string(),
        }
    }
}

/// Copy donor files into the staging tree, keeping relative paths
fn stage_from_donor(donor: &Path, staging: &Path) -> Result<usize> {
    let mut copied = 0;
    for pattern in DONOR_PATTERNS {
        let full = format!("{}/{}", donor.display(), pattern);
        let paths = match glob::glob(&full) {
            Ok(paths) => paths,
            Err(e) => {
                warn!("Bad donor pattern {}: {}", pattern, e);
                continue;
            }
        };

        for path in paths.flatten() {
            if !path.is_file() {
                continue;
            }
            let Ok(relative) = path.strip_prefix(donor) else {
                continue;
            };
            let dest = staging.join(relative);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&path, &dest)?;
            copied += 1;
        }
    }
    Ok(copied)
}

fn staged_binary(staging: &Path, tool: &str) -> Option<String> {
    ["usr/sbin", "sbin"]
        .iter()
        .map(|dir| staging.join(dir).join(tool))
        .find(|p| p.is_file())
        .map(|p| p.display().to_string())
}

/// Recursively copy `src` into `dst`; returns the number of files copied
fn copy_tree(src: &Path, dst: &Path) -> Result<usize> {
    let mut copied = 0;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        if from.is_dir() {
            fs::create_dir_all(&to)?;
            copied += copy_tree(&from, &to)?;
        } else {
            fs::copy(&from, &to)?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::CommandOutput;
    use crate::exec::testing::ScriptedRunner;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    struct Fixture {
        runner: Arc<ScriptedRunner>,
        tmp: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            fs::create_dir_all(tmp.path().join("sys")).unwrap();
            Self {
                runner: Arc::new(ScriptedRunner::new()),
                tmp,
            }
        }

        fn config(&self) -> ResolverConfig {
            ResolverConfig {
                module: "zfs".into(),
                donor_root: None,
                staging_dir: self.tmp.path().join("staging"),
                host_bin_dirs: vec![self.tmp.path().join("hostbin")],
            }
        }

        fn resolver(&self, config: ResolverConfig) -> ToolResolver {
            ToolResolver::new(
                self.runner.clone(),
                config,
                self.tmp.path().join("sys"),
                Duration::from_secs(5),
            )
        }

        fn write(&self, relative: &str) {
            let path = self.tmp.path().join(relative);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, b"\x7fELF").unwrap();
        }
    }

    #[tokio::test]
    async fn test_already_loaded() {
        let fx = Fixture::new();
        fs::create_dir_all(fx.tmp.path().join("sys/module/zfs")).unwrap();

        let tools = fx.resolver(fx.config()).resolve().await.unwrap();

        assert_eq!(tools.resolution, Resolution::AlreadyLoaded);
        assert_eq!(fx.runner.count("modprobe"), 0);
    }

    #[tokio::test]
    async fn test_fresh_load() {
        let fx = Fixture::new();

        let tools = fx.resolver(fx.config()).resolve().await.unwrap();

        assert_eq!(tools.resolution, Resolution::FreshLoad);
        assert_eq!(tools.zpool, "zpool");
        assert_eq!(fx.runner.count("modprobe zfs"), 1);
    }

    #[tokio::test]
    async fn test_donor_extraction() {
        let fx = Fixture::new();
        fx.runner.fail("modprobe zfs");
        fx.runner
            .on("uname -r", CommandOutput::ok("6.1.0-18-amd64\n"));
        fx.write("donor/usr/sbin/zpool");
        fx.write("donor/usr/sbin/zfs");
        fx.write("donor/usr/lib/x86_64-linux-gnu/libzfs.so.4");
        fx.write("donor/lib/modules/6.1.0-18-amd64/updates/dkms/zfs.ko");

        let mut config = fx.config();
        config.donor_root = Some(fx.tmp.path().join("donor"));
        let tools = fx.resolver(config).resolve().await.unwrap();

        let staging = fx.tmp.path().join("staging");
        assert_eq!(tools.resolution, Resolution::DonorExtracted);
        assert_eq!(tools.staging.as_deref(), Some(staging.as_path()));
        assert!(staging.join("usr/lib/x86_64-linux-gnu/libzfs.so.4").exists());
        assert!(staging
            .join("lib/modules/6.1.0-18-amd64/updates/dkms/zfs.ko")
            .exists());
        assert!(tools.zfs.ends_with("staging/usr/sbin/zfs"));
        assert_eq!(fx.runner.count("depmod -b"), 1);
        assert_eq!(fx.runner.count("modprobe -d"), 1);
        // Each strategy at most once
        assert_eq!(fx.runner.count("modprobe zfs"), 1);
    }

    #[tokio::test]
    async fn test_host_copy_last_resort() {
        let fx = Fixture::new();
        fx.runner.fail("modprobe");
        fx.write("hostbin/zpool");
        fx.write("hostbin/zfs");

        let tools = fx.resolver(fx.config()).resolve().await.unwrap();

        assert_eq!(tools.resolution, Resolution::HostCopied);
        assert!(fx.tmp.path().join("staging/bin/zfs").exists());
        assert!(tools.zpool.ends_with("staging/bin/zpool"));
    }

    #[tokio::test]
    async fn test_all_strategies_exhausted() {
        let fx = Fixture::new();
        fx.runner.fail("modprobe");
        fx.runner.fail("version");

        let err = fx.resolver(fx.config()).resolve().await.unwrap_err();

        assert_matches!(err, Error::ToolUnavailable { ref reason, .. } if reason.contains("no donor root"));
        assert_eq!(fx.runner.count("modprobe"), 1);
    }

    #[tokio::test]
    async fn test_provision_target_from_staging() {
        let fx = Fixture::new();
        fx.write("staging/usr/sbin/zfs");
        fx.write("staging/usr/sbin/zpool");
        let root = fx.tmp.path().join("target");
        fs::create_dir_all(&root).unwrap();

        let tools = ResolvedTools {
            resolution: Resolution::DonorExtracted,
            zpool: "zpool".into(),
            zfs: "zfs".into(),
            staging: Some(fx.tmp.path().join("staging")),
        };
        fx.resolver(fx.config())
            .provision_target(&tools, &root)
            .await
            .unwrap();

        assert!(root.join("usr/sbin/zfs").exists());
        let depmod = fx.runner.specs().into_iter().find(|s| s.program == "depmod").unwrap();
        assert_eq!(depmod.root.as_deref(), Some(root.as_path()));
    }

    #[tokio::test]
    async fn test_provision_target_skips_when_present() {
        let fx = Fixture::new();
        fx.write("target/usr/sbin/zfs");
        fx.write("target/sbin/zpool");

        fx.resolver(fx.config())
            .provision_target(
                &ResolvedTools::on_path(Resolution::AlreadyLoaded),
                &fx.tmp.path().join("target"),
            )
            .await
            .unwrap();

        assert!(fx.runner.calls().is_empty());
    }
}
