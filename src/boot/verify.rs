//! Post-install boot checks
//!
//! A failed check lowers confidence in a target but never turns a reported
//! success into a failure.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::{debug, warn};

/// Size of the boot sector read for the signature check
const BOOT_SECTOR_BYTES: usize = 512;

/// Marker GRUB's boot code leaves in the first sector
const GRUB_SIGNATURE: &[u8] = b"GRUB";

/// EFI images accepted as an installed loader, relative to the ESP
fn efi_candidates(bootloader_id: &str) -> Vec<String> {
    vec![
        format!("EFI/{}/grubx64.efi", bootloader_id),
        format!("EFI/{}/shimx64.efi", bootloader_id),
        "EFI/BOOT/BOOTX64.EFI".to_string(),
        "EFI/boot/bootx64.efi".to_string(),
    ]
}

/// Whether the boot sector of `device` carries GRUB boot code
pub fn verify_boot_sector(device: &Path) -> bool {
    let mut sector = [0u8; BOOT_SECTOR_BYTES];
    let read = File::open(device).and_then(|mut f| f.read_exact(&mut sector));
    if let Err(e) = read {
        warn!("Cannot read boot sector of {}: {}", device.display(), e);
        return false;
    }

    let found = sector
        .windows(GRUB_SIGNATURE.len())
        .any(|w| w == GRUB_SIGNATURE);
    debug!("Boot sector of {}: signature present = {}", device.display(), found);
    found
}

/// Whether an EFI loader image exists on the mounted ESP
pub fn verify_efi_image(esp: &Path, bootloader_id: &str) -> bool {
    let found = efi_candidates(bootloader_id)
        .iter()
        .find(|c| esp.join(c).is_file())
        .cloned();
    match found {
        Some(image) => {
            debug!("Found EFI image {}", image);
            true
        }
        None => {
            warn!("No EFI loader image under {}", esp.display());
            false
        }
    }
}
