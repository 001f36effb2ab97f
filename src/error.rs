//! Error types for the provisioner
//!
//! Provides structured error types for device discovery, topology planning,
//! pool construction, mount lifecycle, tool resolution and bootloader
//! installation. Components return these as typed results; only the
//! orchestrator decides whether one aborts the run.

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Unified error type for the provisioner
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),

    // =========================================================================
    // Device Discovery Errors
    // =========================================================================
    #[error("Device discovery failed: {0}")]
    DeviceDiscovery(String),

    #[error("No eligible devices found ({scanned} scanned, {excluded} excluded)")]
    NoEligibleDevices { scanned: usize, excluded: usize },

    // =========================================================================
    // Pool Errors
    // =========================================================================
    #[error("Pool already exists: {pool}")]
    PoolExists { pool: String },

    #[error("Operator declined to replace existing pool: {pool}")]
    OperatorDeclined { pool: String },

    #[error("Pool build failed for {pool}: {reason}")]
    PoolBuildFailed { pool: String, reason: String },

    // =========================================================================
    // Resource Lifecycle Errors
    // =========================================================================
    #[error("Mount failed: {source_path} -> {target}: {reason}")]
    MountFailed {
        source_path: String,
        target: String,
        reason: String,
    },

    #[error("Resource busy: {target}")]
    ResourceBusy { target: String },

    // =========================================================================
    // Tooling Errors
    // =========================================================================
    #[error("Tool unavailable: {tool} - {reason}")]
    ToolUnavailable { tool: String, reason: String },

    #[error("Command failed: {program} (exit {code:?}): {stderr}")]
    CommandFailed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Command timed out: {program} after {timeout:?}")]
    CommandTimeout { program: String, timeout: Duration },

    // =========================================================================
    // Populate / Bootloader Errors
    // =========================================================================
    #[error("OS population failed: {0}")]
    PopulateFailed(String),

    #[error("Bootloader installed on {succeeded} of {total} targets")]
    BootloaderPartial { succeeded: usize, total: usize },

    #[error("Bootloader installation failed: {0}")]
    BootloaderFailed(String),

    // =========================================================================
    // Parse / IO Errors
    // =========================================================================
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How the orchestrator should treat an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Abort the run; nothing downstream is trustworthy
    Fatal,
    /// Keep going, but the run is permanently degraded
    Degraded,
    /// Log and continue
    Recoverable,
}

impl Error {
    /// Classify this error
    pub fn severity(&self) -> Severity {
        match self {
            Error::Configuration(_)
            | Error::Internal(_)
            | Error::DeviceDiscovery(_)
            | Error::NoEligibleDevices { .. }
            | Error::PoolExists { .. }
            | Error::OperatorDeclined { .. }
            | Error::PoolBuildFailed { .. }
            | Error::ToolUnavailable { .. }
            | Error::YamlParse(_) => Severity::Fatal,

            Error::PopulateFailed(_)
            | Error::BootloaderPartial { .. }
            | Error::BootloaderFailed(_) => Severity::Degraded,

            Error::ResourceBusy { .. } => Severity::Recoverable,

            // Depends on which step issued the command
            Error::MountFailed { .. }
            | Error::CommandFailed { .. }
            | Error::CommandTimeout { .. }
            | Error::Json(_)
            | Error::Io(_) => Severity::Fatal,
        }
    }

    /// Hint naming the step the operator should re-run
    pub fn remediation(&self) -> &'static str {
        match self {
            Error::Configuration(_) | Error::YamlParse(_) => {
                "fix the configuration file and re-run `zfs-provision install`"
            }
            Error::DeviceDiscovery(_) | Error::NoEligibleDevices { .. } => {
                "attach target disks or shrink the exclusion list, then re-run `zfs-provision plan`"
            }
            Error::PoolExists { .. } | Error::OperatorDeclined { .. } => {
                "export/destroy the existing pool or re-run with `--existing-pool force`"
            }
            Error::PoolBuildFailed { .. } => {
                "inspect `zpool status`, wipe the member disks and re-run `zfs-provision install`"
            }
            Error::ToolUnavailable { .. } => {
                "load the zfs kernel module (or provide a donor root) and re-run `zfs-provision install`"
            }
            Error::PopulateFailed(_) => {
                "re-run the OS populator inside the target root, then `zfs-provision repair-boot`"
            }
            Error::BootloaderPartial { .. } | Error::BootloaderFailed(_) => {
                "run `zfs-provision repair-boot` and verify every boot disk before rebooting"
            }
            Error::ResourceBusy { .. } | Error::MountFailed { .. } => {
                "stop processes using the target root and unmount it manually"
            }
            _ => "re-run `zfs-provision install` with `--log-level debug` for details",
        }
    }
}

/// Result type alias for the provisioner
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_severity() {
        let err = Error::PoolBuildFailed {
            pool: "rpool".into(),
            reason: "add-vdev failed".into(),
        };
        assert_eq!(err.severity(), Severity::Fatal);

        let err = Error::BootloaderPartial {
            succeeded: 1,
            total: 2,
        };
        assert_eq!(err.severity(), Severity::Degraded);

        let err = Error::ResourceBusy {
            target: "/mnt/proc".into(),
        };
        assert_eq!(err.severity(), Severity::Recoverable);
    }

    #[test]
    fn test_remediation_names_a_step() {
        let err = Error::NoEligibleDevices {
            scanned: 3,
            excluded: 3,
        };
        assert!(err.remediation().contains("plan"));

        let err = Error::BootloaderFailed("all targets failed".into());
        assert!(err.remediation().contains("repair-boot"));
    }

    #[test]
    fn test_error_display() {
        let err = Error::NoEligibleDevices {
            scanned: 4,
            excluded: 1,
        };
        assert_eq!(
            err.to_string(),
            "No eligible devices found (4 scanned, 1 excluded)"
        );
    }
}
