//! Provisioning Configuration
//!
//! Read once at startup (YAML file + CLI overrides), validated, then shared
//! immutably for the rest of the run.

use crate::domain::ports::FirmwareKind;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// =============================================================================
// Policies
// =============================================================================

/// What to do when the named pool already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExistingPoolPolicy {
    /// Abort the run
    #[default]
    Fail,
    /// Ask the operator before replacing it
    Prompt,
    /// Tear it down, wipe member devices and rebuild
    Force,
}

impl std::str::FromStr for ExistingPoolPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fail" => Ok(Self::Fail),
            "prompt" => Ok(Self::Prompt),
            "force" => Ok(Self::Force),
            other => Err(Error::Configuration(format!(
                "unknown existing-pool policy: {}",
                other
            ))),
        }
    }
}

/// Access-time policy for the pool's datasets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AtimePolicy {
    #[default]
    Off,
    On,
    Relatime,
}

impl AtimePolicy {
    /// `zfs set` properties implementing this policy
    pub fn properties(&self) -> Vec<(&'static str, &'static str)> {
        match self {
            AtimePolicy::Off => vec![("atime", "off")],
            AtimePolicy::On => vec![("atime", "on"), ("relatime", "off")],
            AtimePolicy::Relatime => vec![("atime", "on"), ("relatime", "on")],
        }
    }
}

/// Firmware selection: probe, or force one kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FirmwareSetting {
    #[default]
    Auto,
    Uefi,
    Legacy,
}

impl FirmwareSetting {
    pub fn as_override(&self) -> Option<FirmwareKind> {
        match self {
            FirmwareSetting::Auto => None,
            FirmwareSetting::Uefi => Some(FirmwareKind::Uefi),
            FirmwareSetting::Legacy => Some(FirmwareKind::Legacy),
        }
    }
}

impl std::str::FromStr for FirmwareSetting {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "uefi" | "efi" => Ok(Self::Uefi),
            "legacy" | "bios" => Ok(Self::Legacy),
            other => Err(Error::Configuration(format!(
                "unknown firmware type: {}",
                other
            ))),
        }
    }
}

// =============================================================================
// Sub-sections
// =============================================================================

/// External OS populator (base-system bootstrapper)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PopulateConfig {
    pub command: String,
    /// Arguments; `{root}` is replaced by the target root
    pub args: Vec<String>,
    /// At least one must appear in the output, when non-empty
    pub success_markers: Vec<String>,
    /// None may appear in the output
    pub failure_markers: Vec<String>,
}

impl Default for PopulateConfig {
    fn default() -> Self {
        Self {
            command: "debootstrap".to_string(),
            args: vec!["stable".to_string(), "{root}".to_string()],
            success_markers: vec!["Base system installed successfully".to_string()],
            failure_markers: vec![
                "Couldn't download".to_string(),
                "Failure trying to run".to_string(),
            ],
        }
    }
}

/// Package manager run inside the target root
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PackageConfig {
    pub command: String,
    pub args: Vec<String>,
    pub packages: Vec<String>,
    pub uefi_packages: Vec<String>,
    pub legacy_packages: Vec<String>,
}

impl Default for PackageConfig {
    fn default() -> Self {
        Self {
            command: "apt-get".to_string(),
            args: vec!["install".to_string(), "-y".to_string()],
            packages: vec![
                "linux-image-amd64".to_string(),
                "zfs-initramfs".to_string(),
            ],
            uefi_packages: vec!["grub-efi-amd64".to_string()],
            legacy_packages: vec!["grub-pc".to_string()],
        }
    }
}

/// Storage-engine tool and driver resolution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Kernel module providing the storage engine
    pub module: String,
    /// Known-good environment to extract tools from (e.g. mounted live image)
    pub donor_root: Option<PathBuf>,
    /// Where extracted tools are staged
    pub staging_dir: PathBuf,
    /// Directories searched for host binaries
    pub host_bin_dirs: Vec<PathBuf>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            module: "zfs".to_string(),
            donor_root: None,
            staging_dir: PathBuf::from("/run/zfs-provision/staging"),
            host_bin_dirs: vec![
                PathBuf::from("/usr/sbin"),
                PathBuf::from("/sbin"),
                PathBuf::from("/usr/local/sbin"),
            ],
        }
    }
}

/// Timeouts for long-running external calls (seconds)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub command_secs: u64,
    pub wipe_secs: u64,
    pub populate_secs: u64,
    pub packages_secs: u64,
    pub initramfs_secs: u64,
    pub bootloader_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            command_secs: 60,
            wipe_secs: 120,
            populate_secs: 3600,
            packages_secs: 1800,
            initramfs_secs: 600,
            bootloader_secs: 300,
        }
    }
}

impl TimeoutConfig {
    pub fn command(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }

    pub fn wipe(&self) -> Duration {
        Duration::from_secs(self.wipe_secs)
    }

    pub fn populate(&self) -> Duration {
        Duration::from_secs(self.populate_secs)
    }

    pub fn packages(&self) -> Duration {
        Duration::from_secs(self.packages_secs)
    }

    pub fn initramfs(&self) -> Duration {
        Duration::from_secs(self.initramfs_secs)
    }

    pub fn bootloader(&self) -> Duration {
        Duration::from_secs(self.bootloader_secs)
    }
}

/// Fixed settle delays (milliseconds); tools expose no readiness signal
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettleConfig {
    /// After wiping devices
    pub wipe_ms: u64,
    /// Between export attempts
    pub export_retry_ms: u64,
    /// First wait after signalling mount holders (doubles each round)
    pub release_initial_ms: u64,
}

impl Default for SettleConfig {
    fn default() -> Self {
        Self {
            wipe_ms: 2000,
            export_retry_ms: 1000,
            release_initial_ms: 500,
        }
    }
}

impl SettleConfig {
    /// No delays at all
    pub fn immediate() -> Self {
        Self {
            wipe_ms: 0,
            export_retry_ms: 0,
            release_initial_ms: 0,
        }
    }
}

// =============================================================================
// Provision Configuration
// =============================================================================

/// Complete provisioning configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionConfig {
    /// Name of the pool to build
    pub pool_name: String,
    /// Groups at or above this capacity are mirrored
    pub mirror_threshold_bytes: u64,
    /// Pair equal-capacity devices into mirrors
    pub auto_mirror: bool,
    /// Device paths or kernel names never touched
    pub exclude: Vec<String>,
    /// Dataset compression algorithm
    pub compression: String,
    pub atime: AtimePolicy,
    pub firmware: FirmwareSetting,
    pub existing_pool: ExistingPoolPolicy,
    /// Where the new system is assembled
    pub target_root: PathBuf,
    /// Name of the OS root dataset under `<pool>/ROOT`
    pub root_dataset: String,
    /// EFI system partition mounted at `<root>/boot/efi` on UEFI
    pub esp_device: Option<String>,
    pub bootloader_id: String,
    /// Path to sysfs (for testing)
    pub sysfs_path: PathBuf,
    pub populate: PopulateConfig,
    pub packages: PackageConfig,
    pub resolver: ResolverConfig,
    pub timeouts: TimeoutConfig,
    pub settle: SettleConfig,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            pool_name: "rpool".to_string(),
            mirror_threshold_bytes: 100_000_000_000, // 100GB
            auto_mirror: true,
            exclude: Vec::new(),
            compression: "lz4".to_string(),
            atime: AtimePolicy::Off,
            firmware: FirmwareSetting::Auto,
            existing_pool: ExistingPoolPolicy::Fail,
            target_root: PathBuf::from("/mnt"),
            root_dataset: "debian".to_string(),
            esp_device: None,
            bootloader_id: "debian".to_string(),
            sysfs_path: PathBuf::from("/sys"),
            populate: PopulateConfig::default(),
            packages: PackageConfig::default(),
            resolver: ResolverConfig::default(),
            timeouts: TimeoutConfig::default(),
            settle: SettleConfig::default(),
        }
    }
}

impl ProvisionConfig {
    /// Load from a YAML file; missing keys take defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: ProvisionConfig = serde_yaml::from_str(raw)?;
        Ok(config)
    }

    /// Check the configuration before anything is touched
    pub fn validate(&self) -> Result<()> {
        let name = &self.pool_name;
        let valid_name = !name.is_empty()
            && name.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'));
        if !valid_name {
            return Err(Error::Configuration(format!("invalid pool name: {:?}", name)));
        }

        // Reserved by the engine
        if ["mirror", "raidz", "spare", "log"]
            .iter()
            .any(|r| name.starts_with(r))
        {
            return Err(Error::Configuration(format!("reserved pool name: {}", name)));
        }

        if self.auto_mirror && self.mirror_threshold_bytes == 0 {
            return Err(Error::Configuration(
                "mirror_threshold_bytes must be > 0 when auto_mirror is enabled".into(),
            ));
        }

        if !self.target_root.is_absolute() {
            return Err(Error::Configuration(format!(
                "target_root must be absolute: {}",
                self.target_root.display()
            )));
        }

        if self.root_dataset.is_empty() || self.root_dataset.contains('/') {
            return Err(Error::Configuration(format!(
                "invalid root dataset name: {:?}",
                self.root_dataset
            )));
        }

        if self.populate.command.trim().is_empty() {
            return Err(Error::Configuration("populate command is empty".into()));
        }

        Ok(())
    }

    /// `<pool>/ROOT/<root_dataset>`
    pub fn root_dataset_path(&self) -> String {
        format!("{}/ROOT/{}", self.pool_name, self.root_dataset)
    }

    /// Whether a device path or kernel name is on the exclusion list
    pub fn is_excluded(&self, path: &str) -> bool {
        let name = path.rsplit('/').next().unwrap_or(path);
        self.exclude.iter().any(|e| {
            let e = e.trim();
            e == path || e == name || e.rsplit('/').next() == Some(name)
        })
    }
}
