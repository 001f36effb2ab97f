//! Firmware detection and boot target selection

use crate::domain::ports::{BootTarget, FirmwareKind, PoolPlan};
use std::path::Path;
use tracing::info;

/// Detect the firmware mode, honouring an operator override
pub fn detect_firmware(sysfs_path: &Path, forced: Option<FirmwareKind>) -> FirmwareKind {
    if let Some(kind) = forced {
        info!("Firmware forced to {}", kind);
        return kind;
    }

    let kind = if sysfs_path.join("firmware/efi").is_dir() {
        FirmwareKind::Uefi
    } else {
        FirmwareKind::Legacy
    };
    info!("Detected {} firmware", kind);
    kind
}

/// Devices that receive a bootloader
///
/// Legacy firmware reads boot code from each disk, so every pool device is
/// a target. UEFI installs once, to the ESP.
pub fn boot_targets(plan: &PoolPlan, firmware: FirmwareKind, esp: Option<&str>) -> Vec<BootTarget> {
    match firmware {
        FirmwareKind::Legacy => plan
            .devices()
            .into_iter()
            .map(|device| BootTarget {
                device,
                firmware,
            })
            .collect(),
        FirmwareKind::Uefi => vec![BootTarget {
            device: esp.unwrap_or("/boot/efi").to_string(),
            firmware,
        }],
    }
}
