//! Device Wiping
//!
//! Clears engine labels, partition tables and filesystem signatures from a
//! device before it joins a new pool. Every step is attempted even when an
//! earlier one fails; failures are collected, not raised.

use crate::domain::ports::{CommandRunner, CommandSpec};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Zeroed at each end of the device (MiB)
const ZERO_MIB: u64 = 8;

const ZERO_BYTES: u64 = ZERO_MIB * 1024 * 1024;

/// Outcome of wiping one device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WipeReport {
    pub device: String,
    /// Steps that did not complete
    pub failed_steps: Vec<String>,
}

impl WipeReport {
    pub fn is_clean(&self) -> bool {
        self.failed_steps.is_empty()
    }
}

pub struct DeviceWiper<'a> {
    runner: &'a dyn CommandRunner,
    zpool: &'a str,
    timeout: Duration,
}

impl<'a> DeviceWiper<'a> {
    pub fn new(runner: &'a dyn CommandRunner, zpool: &'a str, timeout: Duration) -> Self {
        Self {
            runner,
            zpool,
            timeout,
        }
    }

    /// Wipe one device
    pub async fn wipe(&self, device: &str) -> WipeReport {
        let mut report = WipeReport {
            device: device.to_string(),
            ..Default::default()
        };

        let steps = [
            (
                "labelclear",
                CommandSpec::new(self.zpool).args(["labelclear", "-f", device]),
            ),
            (
                "zap-partitions",
                CommandSpec::new("sgdisk").args(["--zap-all", device]),
            ),
            (
                "wipe-signatures",
                CommandSpec::new("wipefs").args(["-a", device]),
            ),
            ("zero-head", zero(device, 0)),
        ];

        for (step, spec) in steps {
            self.step(&mut report, step, spec).await;
        }

        // Backup GPT header lives in the final sectors
        match self.size_bytes(device).await {
            Some(size) if size > ZERO_BYTES => {
                self.step(&mut report, "zero-tail", zero(device, size - ZERO_BYTES))
                    .await;
            }
            _ => report.failed_steps.push("zero-tail".to_string()),
        }

        if report.is_clean() {
            info!("Wiped {}", device);
        } else {
            warn!("Wiped {} with failed steps: {:?}", device, report.failed_steps);
        }
        report
    }

    async fn step(&self, report: &mut WipeReport, step: &str, spec: CommandSpec) {
        let spec = spec.timeout(self.timeout);
        match self.runner.run(&spec).await {
            Ok(out) if out.success() => debug!("{} {}: ok", report.device, step),
            Ok(out) => {
                // labelclear on an unlabelled device is expected to fail
                debug!("{} {}: {}", report.device, step, out.stderr.trim());
                if step != "labelclear" {
                    report.failed_steps.push(step.to_string());
                }
            }
            Err(e) => {
                warn!("{} {}: {}", report.device, step, e);
                report.failed_steps.push(step.to_string());
            }
        }
    }

    async fn size_bytes(&self, device: &str) -> Option<u64> {
        let spec = CommandSpec::new("blockdev")
            .args(["--getsize64", device])
            .timeout(self.timeout);
        let out = self.runner.run(&spec).await.ok()?;
        if !out.success() {
            return None;
        }
        out.stdout.trim().parse::<u64>().ok()
    }
}

fn zero(device: &str, offset: u64) -> CommandSpec {
    CommandSpec::new("dd").args([
        "if=/dev/zero".to_string(),
        format!("of={}", device),
        "bs=1M".to_string(),
        format!("count={}", ZERO_MIB),
        format!("seek={}", offset),
        "oflag=seek_bytes".to_string(),
        "conv=fsync".to_string(),
    ])
}

/// Wait for the device manager to process queued events
pub async fn settle_devices(runner: &dyn CommandRunner, timeout: Duration, delay: Duration) {
    let spec = CommandSpec::new("udevadm").arg("settle").timeout(timeout);
    if let Err(e) = runner.run(&spec).await {
        warn!("udevadm settle: {}", e);
    }
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::CommandOutput;
    use crate::exec::testing::ScriptedRunner;

    #[tokio::test]
    async fn test_wipe_runs_every_step() {
        let runner = ScriptedRunner::new();
        runner.on("blockdev", CommandOutput::ok("1000204886016\n"));

        let report = DeviceWiper::new(&runner, "zpool", Duration::from_secs(5))
            .wipe("/dev/sda")
            .await;

        assert!(report.is_clean());
        let calls = runner.calls();
        assert_eq!(calls[0], "zpool labelclear -f /dev/sda");
        assert_eq!(calls[1], "sgdisk --zap-all /dev/sda");
        assert_eq!(calls[2], "wipefs -a /dev/sda");
        assert!(calls[3].contains("seek=0 oflag=seek_bytes"));
        // Not MiB-aligned; the tail write must still end on the last byte
        assert!(calls
            .last()
            .unwrap()
            .contains("count=8 seek=1000196497408 oflag=seek_bytes"));
    }

    #[tokio::test]
    async fn test_failed_step_does_not_stop_wipe() {
        let runner = ScriptedRunner::new();
        runner.fail("sgdisk");
        runner.time_out("wipefs");
        runner.fail("labelclear");
        runner.on("blockdev", CommandOutput::ok("1073741824"));

        let report = DeviceWiper::new(&runner, "zpool", Duration::from_secs(5))
            .wipe("/dev/sdb")
            .await;

        assert_eq!(report.failed_steps, vec!["zap-partitions", "wipe-signatures"]);
        assert_eq!(runner.count("dd if=/dev/zero"), 2);
    }

    #[tokio::test]
    async fn test_unknown_size_skips_tail() {
        let runner = ScriptedRunner::new();
        runner.fail("blockdev");

        let report = DeviceWiper::new(&runner, "zpool", Duration::from_secs(5))
            .wipe("/dev/sdc")
            .await;

        assert_eq!(report.failed_steps, vec!["zero-tail"]);
        assert_eq!(runner.count("dd if=/dev/zero"), 1);
    }
}
