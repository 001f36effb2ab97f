//! Domain Ports - Core types and trait definitions for the provisioner
//!
//! These traits define the boundaries between the provisioning logic and the
//! host system. Adapters implement them to reach real tools; tests implement
//! them with scripted fakes.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

// =============================================================================
// Device Inventory Types
// =============================================================================

/// A raw block device discovered on the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Device path (e.g., /dev/sda)
    pub path: String,
    /// Total capacity in bytes
    pub capacity_bytes: u64,
    /// Whether the operator excluded this device
    pub excluded: bool,
}

impl Device {
    pub fn new(path: impl Into<String>, capacity_bytes: u64) -> Self {
        Self {
            path: path.into(),
            capacity_bytes,
            excluded: false,
        }
    }

    /// Kernel name (sda, nvme0n1)
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

/// Devices that share the exact same capacity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityGroup {
    pub capacity_bytes: u64,
    pub devices: Vec<Device>,
}

// =============================================================================
// Topology Types
// =============================================================================

/// Redundancy kind of a top-level vdev
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VdevKind {
    Mirror,
    Single,
}

impl std::fmt::Display for VdevKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VdevKind::Mirror => write!(f, "mirror"),
            VdevKind::Single => write!(f, "single"),
        }
    }
}

/// A planned top-level vdev
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VdevPlan {
    pub kind: VdevKind,
    /// Device paths; exactly 2 for a mirror, 1 for a single
    pub members: Vec<String>,
}

impl VdevPlan {
    pub fn mirror(a: impl Into<String>, b: impl Into<String>) -> Self {
        Self {
            kind: VdevKind::Mirror,
            members: vec![a.into(), b.into()],
        }
    }

    pub fn single(device: impl Into<String>) -> Self {
        Self {
            kind: VdevKind::Single,
            members: vec![device.into()],
        }
    }

    /// Arguments naming this vdev on a zpool command line
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(self.members.len() + 1);
        if self.kind == VdevKind::Mirror {
            args.push("mirror".to_string());
        }
        args.extend(self.members.iter().cloned());
        args
    }
}

impl std::fmt::Display for VdevPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.kind, self.members.join(","))
    }
}

/// Pool-level and dataset-level properties
///
/// Pool options are accepted by `zpool create -o`; dataset options are
/// rejected there and applied by a second pass with `zfs set`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolProperties {
    pub pool: BTreeMap<String, String>,
    pub dataset: BTreeMap<String, String>,
}

/// Plan for exactly one pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolPlan {
    pub name: String,
    pub vdevs: Vec<VdevPlan>,
    pub properties: PoolProperties,
}

impl PoolPlan {
    /// All member devices in plan order
    pub fn devices(&self) -> Vec<String> {
        self.vdevs
            .iter()
            .flat_map(|v| v.members.iter().cloned())
            .collect()
    }

    /// Count of vdevs of the given kind
    pub fn count(&self, kind: VdevKind) -> usize {
        self.vdevs.iter().filter(|v| v.kind == kind).count()
    }

    /// True when mirrors and singles share the pool
    pub fn is_mixed_redundancy(&self) -> bool {
        self.count(VdevKind::Mirror) > 0 && self.count(VdevKind::Single) > 0
    }

    /// Layout as a list of kinds, in vdev order
    pub fn layout(&self) -> Vec<VdevKind> {
        self.vdevs.iter().map(|v| v.kind).collect()
    }
}

impl std::fmt::Display for PoolPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let vdevs: Vec<String> = self.vdevs.iter().map(|v| v.to_string()).collect();
        write!(f, "{}: {}", self.name, vdevs.join(" "))
    }
}

// =============================================================================
// Boot Types
// =============================================================================

/// Firmware boot environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FirmwareKind {
    Uefi,
    Legacy,
}

impl std::fmt::Display for FirmwareKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FirmwareKind::Uefi => write!(f, "uefi"),
            FirmwareKind::Legacy => write!(f, "legacy"),
        }
    }
}

/// A device that should receive a bootloader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootTarget {
    pub device: String,
    pub firmware: FirmwareKind,
}

// =============================================================================
// Command Execution Port
// =============================================================================

/// An external command invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
    /// Run inside this root (chroot) when set
    pub root: Option<PathBuf>,
}

impl CommandSpec {
    /// Default timeout for short administrative commands
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: Self::DEFAULT_TIMEOUT,
            root: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn in_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Program name without directories, for logs
    pub fn program_name(&self) -> &str {
        self.program.rsplit('/').next().unwrap_or(&self.program)
    }

    /// Single-line rendering (program + args)
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.root {
            Some(root) => write!(f, "[{}] {}", root.display(), self.command_line()),
            None => write!(f, "{}", self.command_line()),
        }
    }
}

/// Captured result of an external command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code (None when killed by a signal)
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Check stdout and stderr for any of the given markers
    pub fn contains_marker<S: AsRef<str>>(&self, markers: &[S]) -> bool {
        markers.iter().any(|m| {
            let m = m.as_ref();
            !m.is_empty() && (self.stdout.contains(m) || self.stderr.contains(m))
        })
    }

    /// Convert a non-zero exit into an error
    pub fn into_result(self, spec: &CommandSpec) -> Result<CommandOutput> {
        if self.success() {
            Ok(self)
        } else {
            Err(crate::error::Error::CommandFailed {
                program: spec.program_name().to_string(),
                code: self.code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Port for running external tools
///
/// A non-zero exit is returned as data; `Err` is reserved for spawn failures
/// and timeouts.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;

    /// Run and require a zero exit
    async fn run_checked(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.run(spec).await?.into_result(spec)
    }
}

/// Port for operator confirmation
pub trait Confirmer: Send + Sync {
    fn confirm(&self, question: &str) -> bool;
}

/// Confirmer that always answers the same way
#[derive(Debug, Clone, Copy)]
pub struct FixedAnswer(pub bool);

impl Confirmer for FixedAnswer {
    fn confirm(&self, _question: &str) -> bool {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vdev_args() {
        assert_eq!(
            VdevPlan::mirror("/dev/sda", "/dev/sdb").to_args(),
            vec!["mirror", "/dev/sda", "/dev/sdb"]
        );
        assert_eq!(VdevPlan::single("/dev/sdc").to_args(), vec!["/dev/sdc"]);
    }

    #[test]
    fn test_pool_plan_helpers() {
        let plan = PoolPlan {
            name: "rpool".into(),
            vdevs: vec![
                VdevPlan::mirror("/dev/sda", "/dev/sdb"),
                VdevPlan::single("/dev/sdc"),
            ],
            properties: PoolProperties::default(),
        };

        assert_eq!(plan.devices(), vec!["/dev/sda", "/dev/sdb", "/dev/sdc"]);
        assert_eq!(plan.count(VdevKind::Mirror), 1);
        assert!(plan.is_mixed_redundancy());
        assert_eq!(plan.to_string(), "rpool: mirror(/dev/sda,/dev/sdb) single(/dev/sdc)");
    }

    #[test]
    fn test_device_name() {
        assert_eq!(Device::new("/dev/nvme0n1", 1).name(), "nvme0n1");
        assert_eq!(Device::new("sdb", 1).name(), "sdb");
    }

    #[test]
    fn test_output_markers() {
        let out = CommandOutput::ok("I: Base system installed successfully.");
        assert!(out.contains_marker(&["installed successfully"]));
        assert!(!out.contains_marker(&["E: "]));
        assert!(!out.contains_marker(&[""]));
    }

    #[test]
    fn test_into_result() {
        let spec = CommandSpec::new("/usr/sbin/zpool").arg("list");
        let err = CommandOutput::failed(1, "no pools\n")
            .into_result(&spec)
            .unwrap_err();
        assert_eq!(err.to_string(), "Command failed: zpool (exit Some(1)): no pools");
    }
}
