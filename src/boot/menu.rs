//! Fallback Boot Menu
//!
//! When the distribution's config generator fails, a minimal GRUB menu is
//! written by hand. It boots the newest kernel that has a matching initrd
//! from the OS root dataset.

use std::cmp::Ordering;
use std::path::Path;

/// Kernel image and initrd from `<root>/boot`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelPair {
    pub version: String,
    pub kernel: String,
    pub initrd: String,
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Segment {
    Num(u64),
    Text(String),
}

fn version_key(version: &str) -> Vec<Segment> {
    version
        .split(['.', '-', '+', '~'])
        .filter(|s| !s.is_empty())
        .map(|s| match s.parse::<u64>() {
            Ok(n) => Segment::Num(n),
            Err(_) => Segment::Text(s.to_string()),
        })
        .collect()
}

fn compare_versions(a: &str, b: &str) -> Ordering {
    version_key(a).cmp(&version_key(b))
}

/// Newest kernel in `<root>/boot` with an initrd beside it
pub fn detect_kernel(root: &Path) -> Option<KernelPair> {
    let boot = root.join("boot");
    let pattern = format!("{}/vmlinuz-*", boot.display());

    let mut versions: Vec<String> = glob::glob(&pattern)
        .ok()?
        .flatten()
        .filter_map(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix("vmlinuz-"))
                .map(String::from)
        })
        .filter(|v| boot.join(format!("initrd.img-{}", v)).is_file())
        .collect();

    versions.sort_by(|a, b| compare_versions(a, b));
    versions.pop().map(|version| KernelPair {
        kernel: format!("vmlinuz-{}", version),
        initrd: format!("initrd.img-{}", version),
        version,
    })
}

/// GRUB path of a file in the root dataset's /boot
fn dataset_path(root_dataset: &str, pool: &str, file: &str) -> String {
    let relative = root_dataset
        .strip_prefix(pool)
        .unwrap_or(root_dataset)
        .trim_start_matches('/');
    format!("/{}@/boot/{}", relative, file)
}

/// Render a minimal grub.cfg booting `kernel` from `root_dataset`
pub fn render_menu(kernel: &KernelPair, pool: &str, root_dataset: &str) -> String {
    let linux = dataset_path(root_dataset, pool, &kernel.kernel);
    let initrd = dataset_path(root_dataset, pool, &kernel.initrd);

    format!(
        "# Written by zfs-provision; grub-mkconfig was unavailable\n\
         set default=0\n\
         set timeout=5\n\
         \n\
         insmod part_gpt\n\
         insmod part_msdos\n\
         insmod zfs\n\
         search --no-floppy --label --set=root {pool}\n\
         \n\
         menuentry 'Linux {version} ({root_dataset})' {{\n\
         \tlinux {linux} root=ZFS={root_dataset} boot=zfs ro\n\
         \tinitrd {initrd}\n\
         }}\n",
        pool = pool,
        version = kernel.version,
        root_dataset = root_dataset,
        linux = linux,
        initrd = initrd,
    )
}
