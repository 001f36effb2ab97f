//! Block Device Scanner
//!
//! Enumerates whole-disk block devices from sysfs, applies the operator's
//! exclusion list, and measures capacity.

use crate::domain::ports::Device;
use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

// =============================================================================
// Constants
// =============================================================================

/// sysfs reports sizes in 512-byte sectors regardless of logical block size
const SECTOR_BYTES: u64 = 512;

/// Kernel name prefixes that never back a pool
const VIRTUAL_PREFIXES: &[&str] = &["loop", "ram", "zram", "dm-", "md", "sr", "fd", "zd", "nbd"];

// =============================================================================
// Scanner Configuration
// =============================================================================

/// Configuration for the device scanner
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Device paths or kernel names to exclude
    pub exclude: Vec<String>,
    /// Minimum device size to include (bytes)
    pub min_size_bytes: u64,
    /// Path to sysfs (for testing)
    pub sysfs_path: PathBuf,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            exclude: Vec::new(),
            min_size_bytes: 1_000_000_000, // 1GB minimum
            sysfs_path: PathBuf::from("/sys"),
        }
    }
}

// =============================================================================
// Device Scanner
// =============================================================================

/// Scans for candidate pool devices on Linux systems
pub struct DeviceScanner {
    config: ScannerConfig,
}

impl DeviceScanner {
    /// Create a new device scanner
    pub fn new(config: ScannerConfig) -> Self {
        Self { config }
    }

    /// Discover every candidate device, excluded ones flagged
    ///
    /// Devices come back in kernel-name order, which is the discovery order
    /// the planner pairs by.
    pub fn scan(&self) -> Result<Vec<Device>> {
        let block_path = self.config.sysfs_path.join("class/block");
        if !block_path.exists() {
            return Err(Error::DeviceDiscovery(format!(
                "block device sysfs not found at {}",
                block_path.display()
            )));
        }

        let mut names = Vec::new();
        for entry in fs::read_dir(&block_path)? {
            let entry = entry?;
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        names.sort();

        let mut devices = Vec::new();
        for name in names {
            let sysfs_path = block_path.join(&name);

            if !self.should_include_device(&name) || self.is_partition(&sysfs_path) {
                continue;
            }

            let capacity_bytes = match self.read_capacity(&sysfs_path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Skipping {}: {}", name, e);
                    continue;
                }
            };

            if capacity_bytes < self.config.min_size_bytes {
                debug!("Skipping {}: {} bytes below minimum", name, capacity_bytes);
                continue;
            }

            if self.is_read_only(&sysfs_path) {
                debug!("Skipping {}: read-only", name);
                continue;
            }

            let path = format!("/dev/{}", name);
            let excluded = self.is_excluded(&path);
            if excluded {
                info!("Excluding {} per configuration", path);
            }

            devices.push(Device {
                path,
                capacity_bytes,
                excluded,
            });
        }

        info!(
            "Discovered {} devices ({} excluded)",
            devices.len(),
            devices.iter().filter(|d| d.excluded).count()
        );

        Ok(devices)
    }

    /// Discover devices and keep only the eligible ones
    pub fn eligible(&self) -> Result<Vec<Device>> {
        let devices = self.scan()?;
        let scanned = devices.len();
        let eligible: Vec<Device> = devices.into_iter().filter(|d| !d.excluded).collect();

        if eligible.is_empty() {
            return Err(Error::NoEligibleDevices {
                scanned,
                excluded: scanned - eligible.len(),
            });
        }

        Ok(eligible)
    }

    /// Read capacity in bytes
    fn read_capacity(&self, sysfs_path: &Path) -> Result<u64> {
        let size_str = self.read_sysfs_attr(sysfs_path, "size")?;
        let sectors: u64 = size_str
            .trim()
            .parse()
            .map_err(|_| Error::DeviceDiscovery(format!("Invalid size: {}", size_str.trim())))?;
        Ok(sectors * SECTOR_BYTES)
    }

    /// Check if a path is a partition
    fn is_partition(&self, sysfs_path: &Path) -> bool {
        // Partitions have a "partition" file
        sysfs_path.join("partition").exists()
    }

    fn is_read_only(&self, sysfs_path: &Path) -> bool {
        self.read_sysfs_attr(sysfs_path, "ro")
            .map(|ro| ro.trim() == "1")
            .unwrap_or(false)
    }

    /// Check if a device should be included
    fn should_include_device(&self, name: &str) -> bool {
        !VIRTUAL_PREFIXES.iter().any(|p| name.starts_with(p))
    }

    fn is_excluded(&self, path: &str) -> bool {
        let name = path.rsplit('/').next().unwrap_or(path);
        self.config.exclude.iter().any(|e| {
            let e = e.trim();
            e == path || e == name || e.rsplit('/').next() == Some(name)
        })
    }

    /// Read a sysfs attribute
    fn read_sysfs_attr(&self, base_path: &Path, attr: &str) -> Result<String> {
        let path = base_path.join(attr);
        fs::read_to_string(&path).map_err(|e| {
            Error::DeviceDiscovery(format!("Failed to read {}: {}", path.display(), e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    fn add_device(sysfs: &Path, name: &str, sectors: u64) -> PathBuf {
        let dir = sysfs.join("class/block").join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("size"), format!("{}\n", sectors)).unwrap();
        fs::write(dir.join("ro"), "0\n").unwrap();
        dir
    }

    fn scanner(sysfs: &Path, exclude: &[&str]) -> DeviceScanner {
        DeviceScanner::new(ScannerConfig {
            exclude: exclude.iter().map(|s| s.to_string()).collect(),
            min_size_bytes: 1_000_000_000,
            sysfs_path: sysfs.to_path_buf(),
        })
    }

    const TB_SECTORS: u64 = 1_953_525_168; // 1TB disk

    #[test]
    fn test_scan_filters_and_orders() {
        let tmp = TempDir::new().unwrap();
        add_device(tmp.path(), "sdb", TB_SECTORS);
        add_device(tmp.path(), "sda", TB_SECTORS);
        add_device(tmp.path(), "loop0", TB_SECTORS);
        add_device(tmp.path(), "sdc", 1024); // too small
        let part = add_device(tmp.path(), "sda1", TB_SECTORS / 2);
        fs::write(part.join("partition"), "1\n").unwrap();
        let ro = add_device(tmp.path(), "sdd", TB_SECTORS);
        fs::write(ro.join("ro"), "1\n").unwrap();

        let devices = scanner(tmp.path(), &[]).scan().unwrap();

        let paths: Vec<&str> = devices.iter().map(|d| d.path.as_str()).collect();
        assert_eq!(paths, vec!["/dev/sda", "/dev/sdb"]);
        assert_eq!(devices[0].capacity_bytes, TB_SECTORS * 512);
    }

    #[test]
    fn test_exclusions_are_flagged_not_dropped() {
        let tmp = TempDir::new().unwrap();
        add_device(tmp.path(), "sda", TB_SECTORS);
        add_device(tmp.path(), "sdb", TB_SECTORS);

        let scanner = scanner(tmp.path(), &["/dev/sda"]);
        let devices = scanner.scan().unwrap();
        assert_eq!(devices.len(), 2);
        assert!(devices[0].excluded);

        let eligible = scanner.eligible().unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].path, "/dev/sdb");
    }

    #[test]
    fn test_all_excluded_is_no_eligible_devices() {
        let tmp = TempDir::new().unwrap();
        add_device(tmp.path(), "sda", TB_SECTORS);

        let err = scanner(tmp.path(), &["sda"]).eligible().unwrap_err();
        assert_matches!(err, Error::NoEligibleDevices { scanned: 1, excluded: 1 });
    }

    #[test]
    fn test_missing_sysfs() {
        let tmp = TempDir::new().unwrap();
        let err = scanner(tmp.path(), &[]).scan().unwrap_err();
        assert_matches!(err, Error::DeviceDiscovery(_));
    }

    #[test]
    fn test_should_include_device() {
        let scanner = DeviceScanner::new(ScannerConfig::default());

        assert!(scanner.should_include_device("sda"));
        assert!(scanner.should_include_device("nvme0n1"));
        assert!(!scanner.should_include_device("loop0"));
        assert!(!scanner.should_include_device("ram0"));
        assert!(!scanner.should_include_device("dm-0"));
        assert!(!scanner.should_include_device("md0"));
        assert!(!scanner.should_include_device("zd0"));
    }
}
