//! Pool status parsing
//!
//! Reads the `config:` tree printed by `zpool status -P` and recovers the
//! top-level vdev layout plus the leaf devices.

use crate::domain::ports::{VdevKind, VdevPlan};

/// Sections listed at pool depth that are not data vdevs
const AUXILIARY_SECTIONS: &[&str] = &["logs", "cache", "spares", "special", "dedup"];

/// A top-level vdev as reported by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportedVdev {
    pub kind: VdevKind,
    pub members: Vec<String>,
}

fn indent_of(line: &str) -> usize {
    line.chars()
        .take_while(|c| c.is_whitespace())
        .map(|c| if c == '\t' { 8 } else { 1 })
        .sum()
}

/// Top-level data vdevs of `pool`, in status order
pub fn parse_vdevs(output: &str, pool: &str) -> Vec<ReportedVdev> {
    let mut lines = output
        .lines()
        .skip_while(|l| l.trim() != "config:")
        .skip(1);

    let pool_indent = match lines.find(|l| l.split_whitespace().next() == Some(pool)) {
        Some(line) => indent_of(line),
        None => return Vec::new(),
    };

    let mut vdevs: Vec<ReportedVdev> = Vec::new();
    let mut vdev_indent = None;

    for line in lines {
        let Some(name) = line.split_whitespace().next() else {
            break;
        };
        let indent = indent_of(line);
        if indent <= pool_indent || AUXILIARY_SECTIONS.contains(&name) {
            break;
        }

        let top = *vdev_indent.get_or_insert(indent);
        if indent == top {
            let vdev = if name.starts_with("mirror") {
                ReportedVdev {
                    kind: VdevKind::Mirror,
                    members: Vec::new(),
                }
            } else {
                ReportedVdev {
                    kind: VdevKind::Single,
                    members: vec![name.to_string()],
                }
            };
            vdevs.push(vdev);
        } else if let Some(current) = vdevs.last_mut() {
            current.members.push(name.to_string());
        }
    }

    vdevs
}

/// Vdev kinds of `pool`, in status order
pub fn parse_layout(output: &str, pool: &str) -> Vec<VdevKind> {
    parse_vdevs(output, pool).iter().map(|v| v.kind).collect()
}

/// Whole-disk path behind a partition path (`/dev/sda1` -> `/dev/sda`)
pub fn disk_of_partition(path: &str) -> String {
    let trimmed = path.trim_end_matches(|c: char| c.is_ascii_digit());
    if trimmed.len() == path.len() {
        return path.to_string();
    }
    // by-id links: ata-XYZ-part1
    if let Some(base) = trimmed.strip_suffix("-part") {
        return base.to_string();
    }
    // nvme0n1p1, mmcblk0p1
    if let Some(base) = trimmed.strip_suffix('p') {
        if base.ends_with(|c: char| c.is_ascii_digit()) {
            return base.to_string();
        }
    }
    if trimmed.ends_with(|c: char| c.is_ascii_alphabetic()) && !path.contains("nvme") {
        return trimmed.to_string();
    }
    path.to_string()
}

/// Vdevs of `pool` with partition members mapped to their whole disks
pub fn parse_disk_vdevs(output: &str, pool: &str) -> Vec<VdevPlan> {
    parse_vdevs(output, pool)
        .into_iter()
        .map(|v| VdevPlan {
            kind: v.kind,
            members: v.members.iter().map(|m| disk_of_partition(m)).collect(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS: &str = "  pool: rpool
 state: ONLINE
config:

\tNAME           STATE     READ WRITE CKSUM
\trpool          ONLINE       0     0     0
\t  mirror-0     ONLINE       0     0     0
\t    /dev/sda1  ONLINE       0     0     0
\t    /dev/sdb1  ONLINE       0     0     0
\t  mirror-1     ONLINE       0     0     0
\t    /dev/sdc1  ONLINE       0     0     0
\t    /dev/sdd1  ONLINE       0     0     0
\t  /dev/sde1    ONLINE       0     0     0
\tlogs
\t  /dev/nvme0n1p1  ONLINE    0     0     0

errors: No known data errors
";

    #[test]
    fn test_parse_layout() {
        assert_eq!(
            parse_layout(STATUS, "rpool"),
            vec![VdevKind::Mirror, VdevKind::Mirror, VdevKind::Single]
        );
    }

    #[test]
    fn test_parse_vdev_members() {
        let vdevs = parse_vdevs(STATUS, "rpool");
        assert_eq!(vdevs[0].members, vec!["/dev/sda1", "/dev/sdb1"]);
        assert_eq!(vdevs[2].members, vec!["/dev/sde1"]);
    }

    #[test]
    fn test_disk_vdevs_stop_at_logs() {
        let vdevs = parse_disk_vdevs(STATUS, "rpool");
        assert_eq!(
            vdevs,
            vec![
                VdevPlan::mirror("/dev/sda", "/dev/sdb"),
                VdevPlan::mirror("/dev/sdc", "/dev/sdd"),
                VdevPlan::single("/dev/sde"),
            ]
        );
    }

    #[test]
    fn test_unknown_pool() {
        assert!(parse_layout(STATUS, "tank").is_empty());
        assert!(parse_layout("", "rpool").is_empty());
    }

    #[test]
    fn test_disk_of_partition() {
        assert_eq!(disk_of_partition("/dev/sda1"), "/dev/sda");
        assert_eq!(disk_of_partition("/dev/sda"), "/dev/sda");
        assert_eq!(disk_of_partition("/dev/nvme0n1p1"), "/dev/nvme0n1");
        assert_eq!(disk_of_partition("/dev/nvme0n1"), "/dev/nvme0n1");
        assert_eq!(disk_of_partition("/dev/vdb9"), "/dev/vdb");
        assert_eq!(
            disk_of_partition("/dev/disk/by-id/ata-QEMU_HARDDISK_QM1-part1"),
            "/dev/disk/by-id/ata-QEMU_HARDDISK_QM1"
        );
    }
}
